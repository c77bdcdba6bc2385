use std::cell::Cell;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use log::{debug, trace, warn};
use crate::debounce::LevelFilter;
use crate::keypad::{InitError, Keypad, KeypadLayout};
use crate::{GpioBias, GpioDirection, GpioDriver, GpioPin, GpioResult, NoiseFilter};

/// The `MatrixKeypad` struct represents a GPIO-based keypad with its keys on a row/column grid.
///
/// Columns are driven high one at a time while the rows, pulled down, are read back. A row
/// reading high means the key on the crossing of that row and the active column is held.
pub struct MatrixKeypad<'a> {
    layout: KeypadLayout,
    rows: Vec<Box<dyn GpioPin + 'a>>,
    cols: Vec<Box<dyn GpioPin + 'a>>,
    /// Software noise filters, one per row/column crossing, when the backend can't filter rows.
    filters: Option<Vec<LevelFilter>>,
    /// Set when a column may have been left driven, until every column is low again.
    stale_columns: Cell<bool>,
    released: bool,
}

impl Debug for MatrixKeypad<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "MatrixKeypad(cols: {:?}, rows: {:?})", self.layout.col_pins(), self.layout.row_pins())
    }
}

impl<'a> MatrixKeypad<'a> {
    /// How often a held key is re-read while waiting for its release.
    const RELEASE_POLL: Duration = Duration::from_millis(1);

    /// Claims and configures every pin of the layout.
    ///
    /// Rows become pulled-down inputs, columns become outputs driven low. When `noise_filter` is
    /// given, rows get it in hardware if the backend can. Otherwise every key crossing is filtered
    /// in software, since a row changes level with every column that gets driven.
    ///
    /// If any pin fails, the pins claimed so far are released again and nothing is scanned.
    pub fn new(
        driver: &'a dyn GpioDriver,
        layout: KeypadLayout,
        noise_filter: Option<NoiseFilter>,
    ) -> Result<Self, InitError> {
        let mut keypad = MatrixKeypad {
            rows: Vec::with_capacity(layout.rows()),
            cols: Vec::with_capacity(layout.cols()),
            filters: None,
            stale_columns: Cell::new(false),
            layout,
            released: false,
        };

        if let Err(err) = keypad.init(driver, noise_filter) {
            if let Err(release_err) = keypad.release() {
                warn!("Failed to release keypad pins after failed init: {}", release_err);
            }
            return Err(err);
        }

        debug!("{:?} initialized.", keypad);
        Ok(keypad)
    }

    fn init(
        &mut self,
        driver: &'a dyn GpioDriver,
        noise_filter: Option<NoiseFilter>,
    ) -> Result<(), InitError> {
        // Rows first, so they are already pulled down by the time any column can be driven.
        let mut software_filter = None;
        for &pin in self.layout.row_pins() {
            let row = Self::init_row(driver, pin, noise_filter)
                .map_err(|source| InitError::Pin { pin, source })?;
            if !row.supports_noise_filter() {
                software_filter = noise_filter;
            }
            self.rows.push(row);
        }

        if let Some(filter) = software_filter {
            debug!("No hardware noise filter on {:?}, filtering in software.", self.layout.row_pins());
            let crossings = self.layout.rows() * self.layout.cols();
            self.filters = Some((0..crossings).map(|_| LevelFilter::new(filter)).collect());
        }

        for &pin in self.layout.col_pins() {
            let col = Self::init_col(driver, pin)
                .map_err(|source| InitError::Pin { pin, source })?;
            self.cols.push(col);
        }

        Ok(())
    }

    fn init_row(
        driver: &'a dyn GpioDriver,
        pin: usize,
        noise_filter: Option<NoiseFilter>,
    ) -> GpioResult<Box<dyn GpioPin + 'a>> {
        let mut row = driver.get_pin(pin)?;
        let hardware_filter = noise_filter.filter(|_| row.supports_noise_filter());
        row.configure(GpioDirection::Input, GpioBias::PullDown, hardware_filter)?;
        Ok(row)
    }

    fn init_col(driver: &'a dyn GpioDriver, pin: usize) -> GpioResult<Box<dyn GpioPin + 'a>> {
        let mut col = driver.get_pin(pin)?;
        col.configure(GpioDirection::Output, GpioBias::None, None)?;
        col.write(false)?;
        Ok(col)
    }

    pub fn layout(&self) -> &KeypadLayout {
        &self.layout
    }

    /// Finds the first held key as a (row, column) position.
    ///
    /// With `release_stop`, the active column stays driven until that row goes low again, or until
    /// the flag gets set, in which case no key is returned.
    fn scan_position(&self, release_stop: Option<&AtomicBool>) -> GpioResult<Option<(usize, usize)>> {
        self.settle_columns()?;

        for (col_index, col) in self.cols.iter().enumerate() {
            if let Err(err) = col.write(true) {
                self.stale_columns.set(true);
                return Err(err);
            }

            let mut found = self.first_high_row(col_index);
            let mut cancelled = false;
            if let (Some(row_index), Some(stop)) = (found.as_ref().ok().copied().flatten(), release_stop) {
                match self.wait_until_low(row_index, col_index, stop) {
                    Ok(released) => cancelled = !released,
                    Err(err) => found = Err(err),
                }
            }

            // Only one column may ever be high, whatever the rows said.
            self.lower(&**col)?;

            if cancelled {
                return Ok(None);
            }
            if let Some(row_index) = found? {
                trace!("Key at row {}, column {}", row_index, col_index);
                return Ok(Some((row_index, col_index)));
            }
        }

        Ok(None)
    }

    /// Drives a column low, trying once more before giving up.
    fn lower(&self, col: &dyn GpioPin) -> GpioResult<()> {
        let result = col.write(false).or_else(|err| {
            warn!("Failed to drive {:?} low ({}), retrying.", col, err);
            col.write(false)
        });
        if result.is_err() {
            self.stale_columns.set(true);
        }
        result
    }

    /// Drives every column low if an earlier cycle couldn't, before anything else gets driven.
    fn settle_columns(&self) -> GpioResult<()> {
        if !self.stale_columns.get() {
            return Ok(());
        }
        for col in &self.cols {
            col.write(false)?;
        }
        debug!("{:?} columns settled low again.", self);
        self.stale_columns.set(false);
        Ok(())
    }

    /// Reads a row while `col_index` is driven, through its crossing's filter if there is one.
    fn read_crossing(&self, row_index: usize, col_index: usize) -> GpioResult<bool> {
        let raw = self.rows[row_index].read()?;
        Ok(match &self.filters {
            Some(filters) => filters[row_index * self.layout.cols() + col_index].apply(raw, Instant::now()),
            None => raw,
        })
    }

    fn first_high_row(&self, col_index: usize) -> GpioResult<Option<usize>> {
        for row_index in 0..self.rows.len() {
            if self.read_crossing(row_index, col_index)? {
                return Ok(Some(row_index));
            }
        }
        Ok(None)
    }

    /// Returns `false` if `stop` got set while the key was still held.
    fn wait_until_low(&self, row_index: usize, col_index: usize, stop: &AtomicBool) -> GpioResult<bool> {
        while self.read_crossing(row_index, col_index)? {
            if stop.load(Ordering::Acquire) {
                debug!("Stopped waiting for the key at row {}, column {} to be released.", row_index, col_index);
                return Ok(false);
            }
            thread::sleep(Self::RELEASE_POLL);
        }
        Ok(true)
    }

    fn key(&self, position: Option<(usize, usize)>) -> Option<char> {
        position.and_then(|(row, col)| self.layout.key_at(row, col))
    }
}

impl Keypad for MatrixKeypad<'_> {
    type Key = char;

    fn scan(&self) -> GpioResult<Option<char>> {
        Ok(self.key(self.scan_position(None)?))
    }

    fn scan_until_release(&self, stop: &AtomicBool) -> GpioResult<Option<char>> {
        Ok(self.key(self.scan_position(Some(stop))?))
    }

    fn release(&mut self) -> GpioResult<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        // Keep going on errors, every pin deserves its chance to be released.
        let mut result = Ok(());
        for pin in self.cols.iter_mut().chain(self.rows.iter_mut()) {
            if let Err(err) = pin.release() {
                warn!("Failed to release {:?}: {}", pin, err);
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }

        for filter in self.filters.iter().flatten() {
            filter.reset();
        }

        debug!("{:?} released.", self);
        result
    }
}

impl Drop for MatrixKeypad<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            warn!("Failed to release {:?} on drop: {}", self, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GpioError;
    use crate::mock::MockGpioDriver;

    const ROWS: [usize; 4] = [18, 23, 24, 25];
    const COLS: [usize; 4] = [4, 17, 27, 22];

    fn keypad(driver: &MockGpioDriver) -> MatrixKeypad<'_> {
        MatrixKeypad::new(driver, KeypadLayout::default(), None).unwrap()
    }

    #[test]
    fn init_configures_rows_and_cols() {
        let driver = MockGpioDriver::new(28);
        let _keypad = keypad(&driver);

        for pin in ROWS {
            assert_eq!(driver.direction(pin), GpioDirection::Input);
            assert_eq!(driver.bias(pin), GpioBias::PullDown);
        }
        for pin in COLS {
            assert_eq!(driver.direction(pin), GpioDirection::Output);
            assert!(!driver.driven(pin));
        }
    }

    #[test]
    fn no_key_when_idle() {
        let driver = MockGpioDriver::new(28);
        let keypad = keypad(&driver);
        assert_eq!(keypad.scan(), Ok(None));
    }

    #[test]
    fn every_key_maps_to_its_symbol() {
        let driver = MockGpioDriver::new(28);
        let keypad = keypad(&driver);
        let layout = KeypadLayout::default();

        for (r, &row) in ROWS.iter().enumerate() {
            for (c, &col) in COLS.iter().enumerate() {
                driver.press(row, col);
                assert_eq!(keypad.scan(), Ok(layout.key_at(r, c)));
                driver.release(row, col);
            }
        }
    }

    #[test]
    fn lower_row_wins_within_a_column() {
        let driver = MockGpioDriver::new(28);
        let keypad = keypad(&driver);

        driver.press(ROWS[3], COLS[1]);
        driver.press(ROWS[1], COLS[1]);
        assert_eq!(keypad.scan(), Ok(Some('5')));
    }

    #[test]
    fn lower_column_wins_across_columns() {
        let driver = MockGpioDriver::new(28);
        let keypad = keypad(&driver);

        driver.press(ROWS[0], COLS[2]);
        driver.press(ROWS[3], COLS[0]);
        assert_eq!(keypad.scan(), Ok(Some('*')));
    }

    #[test]
    fn only_one_column_is_ever_driven() {
        let driver = MockGpioDriver::new(28);
        let keypad = keypad(&driver);

        driver.press(ROWS[2], COLS[3]);
        keypad.scan().unwrap();
        driver.release_all();
        keypad.scan().unwrap();

        assert_eq!(driver.peak_driven_high(), 1);
        assert!(COLS.iter().all(|&pin| !driver.driven(pin)));
    }

    #[test]
    fn column_is_lowered_after_failed_read() {
        let driver = MockGpioDriver::new(28);
        let keypad = keypad(&driver);

        driver.fail_reads(1);
        assert!(matches!(keypad.scan(), Err(GpioError::Io(_))));
        assert!(!driver.driven(COLS[0]));
    }

    #[test]
    fn column_is_retried_when_lowering_fails_once() {
        let driver = MockGpioDriver::new(28);
        let keypad = keypad(&driver);

        driver.fail_lowering(COLS[1], 1);
        assert_eq!(keypad.scan(), Ok(None));
        assert!(COLS.iter().all(|&pin| !driver.driven(pin)));
        assert_eq!(driver.peak_driven_high(), 1);
    }

    #[test]
    fn stuck_column_is_lowered_before_the_next_scan() {
        let driver = MockGpioDriver::new(28);
        let keypad = keypad(&driver);

        driver.fail_lowering(COLS[1], 2);
        assert!(matches!(keypad.scan(), Err(GpioError::Io(_))));
        assert!(driver.driven(COLS[1]));

        // With column 1 still high, this key would show up on column 0 as '1'.
        driver.press(ROWS[0], COLS[1]);
        assert_eq!(keypad.scan(), Ok(Some('2')));
        assert_eq!(driver.peak_driven_high(), 1);
        assert!(COLS.iter().all(|&pin| !driver.driven(pin)));
    }

    #[test]
    fn nothing_is_driven_while_a_column_stays_stuck() {
        let driver = MockGpioDriver::new(28);
        let keypad = keypad(&driver);

        driver.fail_lowering(COLS[0], 3);
        assert!(keypad.scan().is_err());
        assert!(keypad.scan().is_err());
        assert_eq!(keypad.scan(), Ok(None));
        assert_eq!(driver.peak_driven_high(), 1);
    }

    #[test]
    fn scan_until_release_returns_after_release() {
        let driver = MockGpioDriver::new(28);
        let keypad = keypad(&driver);
        let stop = AtomicBool::new(false);

        // Nothing held: returns straight away.
        assert_eq!(keypad.scan_until_release(&stop), Ok(None));

        driver.press(ROWS[0], COLS[0]);
        thread::scope(|scope| {
            scope.spawn(|| {
                thread::sleep(Duration::from_millis(20));
                driver.release_all();
            });
            assert_eq!(keypad.scan_until_release(&stop), Ok(Some('1')));
        });
        assert!(!driver.driven(COLS[0]));
    }

    #[test]
    fn scan_until_release_gives_up_when_stopped() {
        let driver = MockGpioDriver::new(28);
        let keypad = keypad(&driver);
        let stop = AtomicBool::new(false);

        driver.press(ROWS[1], COLS[2]);
        thread::scope(|scope| {
            scope.spawn(|| {
                thread::sleep(Duration::from_millis(20));
                stop.store(true, Ordering::Release);
            });
            assert_eq!(keypad.scan_until_release(&stop), Ok(None));
        });
        assert!(COLS.iter().all(|&pin| !driver.driven(pin)));

        // Still held, but the flag stays set.
        assert_eq!(keypad.scan_until_release(&stop), Ok(None));
        assert_eq!(keypad.scan(), Ok(Some('6')));
    }

    #[test]
    fn duplicate_pin_across_rows_and_cols() {
        let driver = MockGpioDriver::new(28);
        let layout = KeypadLayout::new(vec![1, 2], vec![2, 3], vec![vec!['a', 'b'], vec!['c', 'd']]);
        assert_eq!(layout, Err(InitError::DuplicatePin(2)));
        assert!(!driver.is_claimed(2));
    }

    #[test]
    fn pin_in_use_aborts_init_and_frees_claimed_pins() {
        let driver = MockGpioDriver::new(28);
        let _busy = driver.get_pin(COLS[2]).unwrap();

        let err = MatrixKeypad::new(&driver, KeypadLayout::default(), None).unwrap_err();
        assert_eq!(err, InitError::Pin { pin: COLS[2], source: GpioError::AlreadyInUse });

        for pin in ROWS.iter().chain(&COLS[..2]) {
            assert!(!driver.is_claimed(*pin));
            assert_eq!(driver.releases(*pin), 1);
        }
    }

    #[test]
    fn pin_out_of_range_aborts_init() {
        let driver = MockGpioDriver::new(20);
        let err = MatrixKeypad::new(&driver, KeypadLayout::default(), None).unwrap_err();
        assert_eq!(err, InitError::Pin { pin: 23, source: GpioError::InvalidArgument });
    }

    #[test]
    fn missing_bias_support_aborts_init() {
        let driver = MockGpioDriver::new(28).with_bias_support(false);
        let err = MatrixKeypad::new(&driver, KeypadLayout::default(), None).unwrap_err();
        assert_eq!(err, InitError::Pin { pin: ROWS[0], source: GpioError::NotSupported });
    }

    #[test]
    fn hardware_noise_filter_is_used_when_available() {
        let driver = MockGpioDriver::new(28).with_noise_filter_support(true);
        let filter = NoiseFilter::default();
        let _keypad = MatrixKeypad::new(&driver, KeypadLayout::default(), Some(filter)).unwrap();

        for pin in ROWS {
            assert_eq!(driver.noise_filter(pin), Some(filter));
        }
    }

    #[test]
    fn software_noise_filter_still_scans() {
        let driver = MockGpioDriver::new(28);
        let filter = NoiseFilter::new(Duration::ZERO, Duration::ZERO);
        let keypad = MatrixKeypad::new(&driver, KeypadLayout::default(), Some(filter)).unwrap();

        driver.press(ROWS[2], COLS[1]);
        assert_eq!(keypad.scan(), Ok(Some('8')));
    }

    #[test]
    fn software_noise_filter_holds_back_short_presses() {
        let driver = MockGpioDriver::new(28);
        let filter = NoiseFilter::new(Duration::from_secs(3600), Duration::ZERO);
        let keypad = MatrixKeypad::new(&driver, KeypadLayout::default(), Some(filter)).unwrap();

        driver.press(ROWS[0], COLS[3]);
        assert_eq!(keypad.scan(), Ok(None));
        assert_eq!(keypad.scan(), Ok(None));
    }

    #[test]
    fn release_resets_software_noise_filters() {
        let driver = MockGpioDriver::new(28);
        let filter = NoiseFilter::new(Duration::from_millis(10), Duration::ZERO);
        let mut keypad = MatrixKeypad::new(&driver, KeypadLayout::default(), Some(filter)).unwrap();

        driver.press(ROWS[0], COLS[0]);
        assert_eq!(keypad.scan(), Ok(None));
        thread::sleep(Duration::from_millis(15));
        assert_eq!(keypad.scan(), Ok(Some('1')));
        keypad.release().unwrap();

        // Back to low, so a high level has to be steady again before it counts.
        let filters = keypad.filters.as_ref().unwrap();
        assert!(!filters[0].apply(true, Instant::now()));
    }

    #[test]
    fn release_happens_once() {
        let driver = MockGpioDriver::new(28);
        let mut keypad = keypad(&driver);

        keypad.release().unwrap();
        keypad.release().unwrap();
        drop(keypad);

        for pin in ROWS.iter().chain(&COLS) {
            assert_eq!(driver.releases(*pin), 1);
            assert_eq!(driver.direction(*pin), GpioDirection::Input);
            assert_eq!(driver.bias(*pin), GpioBias::PullDown);
            assert!(!driver.is_claimed(*pin));
        }
    }

    #[test]
    fn drop_releases_pins() {
        let driver = MockGpioDriver::new(28);
        drop(keypad(&driver));
        assert!(ROWS.iter().chain(&COLS).all(|&pin| driver.releases(pin) == 1));
    }
}
