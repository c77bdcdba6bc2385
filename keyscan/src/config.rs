use std::env::var_os;
use std::ffi::OsStr;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use keyscan_gpio::NoiseFilter;
use keyscan_gpio::keypad::{InitError, KeypadLayout, ScanMode};
use crate::utils::{parse_key_rows, parse_micros_pair, parse_pin_list};

const DEFAULT_CONFIG_FILE: &str = "keyscan.json";
const DEFAULT_GPIO_CHIP: &str = "/dev/gpiochip0";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {name}")]
    InvalidValue { name: &'static str, value: String },
    #[error("unknown GPIO backend {0:?}, expected gpiomem, mem, gpiod[:<chip>] or mock")]
    UnknownBackend(String),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Which GPIO driver the keypad runs on.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Backend {
    /// Register access through `/dev/gpiomem`.
    GpioMem,
    /// Register access through `/dev/mem`.
    Mem,
    /// The GPIO character device at the given path.
    Gpiod(PathBuf),
    /// A simulated board with no keys pressed.
    Mock,
}

impl FromStr for Backend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "gpiomem" => Ok(Backend::GpioMem),
            "mem" => Ok(Backend::Mem),
            "gpiod" => Ok(Backend::Gpiod(PathBuf::from(DEFAULT_GPIO_CHIP))),
            "mock" => Ok(Backend::Mock),
            other => match other.strip_prefix("gpiod:") {
                Some(path) if !path.is_empty() => Ok(Backend::Gpiod(PathBuf::from(path))),
                _ => Err(ConfigError::UnknownBackend(other.to_string())),
            },
        }
    }
}

impl TryFrom<String> for Backend {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl Display for Backend {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::GpioMem => write!(f, "gpiomem"),
            Backend::Mem => write!(f, "mem"),
            Backend::Gpiod(path) => write!(f, "gpiod:{}", path.display()),
            Backend::Mock => write!(f, "mock"),
        }
    }
}

impl From<Backend> for String {
    fn from(backend: Backend) -> Self {
        backend.to_string()
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default] Polling,
    Blocking,
}

impl From<Mode> for ScanMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Polling => ScanMode::Polling,
            Mode::Blocking => ScanMode::Blocking,
        }
    }
}

/// Steady/active windows of the row noise filter, in microseconds.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct NoiseFilterConfig {
    pub steady_us: u64,
    pub active_us: u64,
}

impl Default for NoiseFilterConfig {
    fn default() -> Self {
        NoiseFilterConfig {
            steady_us: 50_000,
            active_us: 500_000,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend: Backend,
    pub row_pins: Vec<usize>,
    pub col_pins: Vec<usize>,
    /// One string per row, one character per key.
    pub keys: Vec<String>,
    pub debounce_window_ms: u32,
    pub poll_interval_ms: u32,
    pub noise_filter: Option<NoiseFilterConfig>,
    pub mode: Mode,
}

impl Default for Config {
    fn default() -> Self {
        let layout = KeypadLayout::default();
        let keys = (0..layout.rows())
            .map(|row| (0..layout.cols()).filter_map(|col| layout.key_at(row, col)).collect())
            .collect();

        Config {
            backend: Backend::GpioMem,
            row_pins: layout.row_pins().to_vec(),
            col_pins: layout.col_pins().to_vec(),
            keys,
            debounce_window_ms: 30,
            poll_interval_ms: 10,
            noise_filter: Some(NoiseFilterConfig::default()),
            mode: Mode::default(),
        }
    }
}

impl Config {
    /// Loads the config file named by `CONFIG_FILE` (`keyscan.json` by default) if it exists,
    /// then applies the `KEYSCAN_*` environment variables on top.
    pub fn load() -> Result<Self, ConfigError> {
        let config_str = var_os("CONFIG_FILE");
        let config_str: &OsStr = config_str.as_deref().unwrap_or(OsStr::new(DEFAULT_CONFIG_FILE));
        let config_path = Path::new(config_str);

        let mut config = if config_path.exists() {
            debug!("Loading config from {}.", config_path.display());
            Self::from_file(config_path)?
        } else {
            debug!("{} not found, using defaults.", config_path.display());
            Config::default()
        };

        config.apply_overrides(|name| dotenv::var(name).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let file = std::fs::File::open(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let reader = std::io::BufReader::new(file);
        serde_json::from_reader(reader).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Overrides fields with whatever `lookup` returns for the `KEYSCAN_*` variables.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        fn invalid(name: &'static str, value: &str) -> ConfigError {
            ConfigError::InvalidValue {
                name,
                value: value.to_string(),
            }
        }

        if let Some(value) = lookup("KEYSCAN_BACKEND") {
            self.backend = value.parse()?;
        }
        if let Some(value) = lookup("KEYSCAN_ROW_PINS") {
            self.row_pins = parse_pin_list(&value).map_err(|_| invalid("KEYSCAN_ROW_PINS", &value))?;
        }
        if let Some(value) = lookup("KEYSCAN_COL_PINS") {
            self.col_pins = parse_pin_list(&value).map_err(|_| invalid("KEYSCAN_COL_PINS", &value))?;
        }
        if let Some(value) = lookup("KEYSCAN_KEYS") {
            self.keys = parse_key_rows(&value);
        }
        if let Some(value) = lookup("KEYSCAN_DEBOUNCE_MS") {
            self.debounce_window_ms = value.trim().parse().map_err(|_| invalid("KEYSCAN_DEBOUNCE_MS", &value))?;
        }
        if let Some(value) = lookup("KEYSCAN_POLL_MS") {
            self.poll_interval_ms = value.trim().parse().map_err(|_| invalid("KEYSCAN_POLL_MS", &value))?;
        }
        if let Some(value) = lookup("KEYSCAN_NOISE_FILTER") {
            self.noise_filter = match value.trim() {
                "off" | "none" => None,
                pair => {
                    let (steady_us, active_us) =
                        parse_micros_pair(pair).ok_or_else(|| invalid("KEYSCAN_NOISE_FILTER", &value))?;
                    Some(NoiseFilterConfig { steady_us, active_us })
                }
            };
        }
        if let Some(value) = lookup("KEYSCAN_MODE") {
            self.mode = match value.trim() {
                "polling" => Mode::Polling,
                "blocking" => Mode::Blocking,
                _ => return Err(invalid("KEYSCAN_MODE", &value)),
            };
        }

        Ok(())
    }

    /// Builds the keypad layout, checking pins and keys against each other.
    pub fn layout(&self) -> Result<KeypadLayout, InitError> {
        KeypadLayout::new(
            self.row_pins.clone(),
            self.col_pins.clone(),
            self.keys.iter().map(|row| row.chars().collect()).collect(),
        )
    }

    pub fn noise_filter(&self) -> Option<NoiseFilter> {
        self.noise_filter.map(|filter| {
            NoiseFilter::new(
                Duration::from_micros(filter.steady_us),
                Duration::from_micros(filter.active_us),
            )
        })
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_window_ms.into())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.into())
    }

    pub fn scan_mode(&self) -> ScanMode {
        self.mode.into()
    }
}
