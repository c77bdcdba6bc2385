pub mod gpiod;
pub mod raw;
pub mod mock;
pub mod debounce;
pub mod keypad;

use std::fmt::Debug;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Eq, PartialEq, Clone)]
pub enum GpioError {
    #[error("pin already in use")]
    AlreadyInUse,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("the feature is not supported on this backend")]
    NotSupported,
    #[error("operation does not match the pin direction")]
    WrongDirection,
    #[error("IO error: {0}")]
    Io(std::io::ErrorKind),
    #[error("error: {0}")]
    Other(String),
}

impl From<std::io::Error> for GpioError {
    fn from(err: std::io::Error) -> Self {
        GpioError::Io(err.kind())
    }
}

pub type GpioResult<T> = Result<T, GpioError>;

pub trait GpioDriver: Debug {
    /// Gets the amount of GPIO pins available.
    fn count(&self) -> GpioResult<usize>;

    /// Gets the GPIO pin at the given index.
    ///
    /// The pin stays claimed until the returned handle is dropped.
    ///
    /// # Errors
    /// - `GpioError::InvalidArgument` if the index is out of range.
    /// - `GpioError::AlreadyInUse` if the pin is already claimed.
    fn get_pin(&self, index: usize) -> GpioResult<Box<dyn GpioPin + '_>>;
}

/// Specifies whether the GPIO pin is sensed or driven.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum GpioDirection {
    #[default] Input,
    Output,
}

/// Specifies the bias of the GPIO pin.
///
/// You can use this to enable pull-up or pull-down resistors.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum GpioBias {
    #[default] None,
    PullUp,
    PullDown,
}

/// Glitch filter for input pins.
///
/// A level change is only reported once it has been stable for `steady`.
/// After that, changes are reported as they come for `active`, then the
/// steady requirement applies again.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct NoiseFilter {
    pub steady: Duration,
    pub active: Duration,
}

impl NoiseFilter {
    pub fn new(steady: Duration, active: Duration) -> Self {
        NoiseFilter { steady, active }
    }
}

impl Default for NoiseFilter {
    fn default() -> Self {
        NoiseFilter {
            steady: Duration::from_millis(50),
            active: Duration::from_millis(500),
        }
    }
}

pub trait GpioPin: Debug {
    /// Gets the index of the pin in its driver.
    fn index(&self) -> usize;

    /// Gets the current direction of the GPIO pin.
    fn direction(&self) -> GpioDirection;
    /// Sets the GPIO pin function to input or output.
    fn set_direction(&mut self, direction: GpioDirection) -> GpioResult<()>;

    /// Reads the state of the GPIO pin.
    fn read(&self) -> GpioResult<bool>;
    /// Writes the state of the GPIO pin.
    ///
    /// # Errors
    /// - `GpioError::WrongDirection` if the pin is not an output.
    fn write(&self, value: bool) -> GpioResult<()>;

    /// Gets whether the GPIO pin supports bias (pull-up/pull-down resistors).
    fn supports_bias(&self) -> bool {
        false
    }
    /// Gets the bias of the GPIO pin.
    fn bias(&self) -> GpioBias {
        GpioBias::None
    }
    /// Sets the bias of the GPIO pin.
    ///
    /// # Errors
    /// - `GpioError::NotSupported` if the pin does not support bias.
    fn set_bias(&mut self, _bias: GpioBias) -> GpioResult<()> {
        Err(GpioError::NotSupported)
    }
    fn with_bias(mut self, bias: GpioBias) -> GpioResult<Self>
    where
        Self: Sized,
    {
        self.set_bias(bias)?;
        Ok(self)
    }

    /// Gets whether the backend filters glitches on this pin in hardware.
    fn supports_noise_filter(&self) -> bool {
        false
    }
    /// Gets the active noise filter of the GPIO pin, if any.
    fn noise_filter(&self) -> Option<NoiseFilter> {
        None
    }
    /// Sets or clears the noise filter of the GPIO pin.
    ///
    /// # Errors
    /// - `GpioError::NotSupported` if the pin does not support noise filtering.
    fn set_noise_filter(&mut self, _filter: Option<NoiseFilter>) -> GpioResult<()> {
        Err(GpioError::NotSupported)
    }
    fn with_noise_filter(mut self, filter: Option<NoiseFilter>) -> GpioResult<Self>
    where
        Self: Sized,
    {
        self.set_noise_filter(filter)?;
        Ok(self)
    }

    /// Configures direction, bias and noise filter in one go.
    ///
    /// A `GpioBias::None` request on a pin without bias support is not an error.
    fn configure(
        &mut self,
        direction: GpioDirection,
        bias: GpioBias,
        filter: Option<NoiseFilter>,
    ) -> GpioResult<()> {
        if bias != GpioBias::None || self.supports_bias() {
            self.set_bias(bias)?;
        }
        self.set_direction(direction)?;
        if filter.is_some() || self.supports_noise_filter() {
            self.set_noise_filter(filter)?;
        }
        Ok(())
    }

    /// Returns the pin to its neutral state: input with pull-down.
    fn release(&mut self) -> GpioResult<()> {
        if self.supports_noise_filter() {
            self.set_noise_filter(None)?;
        }
        self.set_direction(GpioDirection::Input)?;
        if self.supports_bias() {
            self.set_bias(GpioBias::PullDown)?;
        }
        Ok(())
    }
}
