//! In-memory GPIO driver simulating a board with switches wired between pins.
//!
//! A closed switch connects two pins. An input pin reads high when a closed switch connects it
//! to an output currently driven high, and falls back to its bias level otherwise.
use crate::{GpioBias, GpioDirection, GpioDriver, GpioError, GpioPin, GpioResult, NoiseFilter};
use log::trace;
use std::collections::HashSet;
use std::fmt::{Debug, Formatter};
use std::sync::{Mutex, MutexGuard};

#[derive(Clone, Debug, Default)]
struct MockPinState {
    claimed: bool,
    direction: GpioDirection,
    bias: GpioBias,
    filter: Option<NoiseFilter>,
    driven: bool,
    releases: usize,
    failing_lowers: usize,
}

#[derive(Debug, Default)]
struct MockBoard {
    pins: Vec<MockPinState>,
    switches: HashSet<(usize, usize)>,
    failing_reads: usize,
    failing_writes: usize,
    peak_driven_high: usize,
}

impl MockBoard {
    fn driven_high(&self) -> usize {
        self.pins
            .iter()
            .filter(|pin| pin.direction == GpioDirection::Output && pin.driven)
            .count()
    }

    fn level(&self, index: usize) -> bool {
        let pin = &self.pins[index];
        if pin.direction == GpioDirection::Output {
            return pin.driven;
        }

        let connected_high = self.switches.iter().any(|&(a, b)| {
            let other = if a == index {
                b
            } else if b == index {
                a
            } else {
                return false;
            };
            let other = &self.pins[other];
            other.direction == GpioDirection::Output && other.driven
        });

        connected_high || pin.bias == GpioBias::PullUp
    }
}

/// A simulated GPIO chip.
pub struct MockGpioDriver {
    board: Mutex<MockBoard>,
    bias_support: bool,
    noise_filter_support: bool,
}

impl MockGpioDriver {
    pub fn new(count: usize) -> Self {
        MockGpioDriver {
            board: Mutex::new(MockBoard {
                pins: vec![MockPinState::default(); count],
                ..MockBoard::default()
            }),
            bias_support: true,
            noise_filter_support: false,
        }
    }

    pub fn with_bias_support(mut self, supported: bool) -> Self {
        self.bias_support = supported;
        self
    }

    pub fn with_noise_filter_support(mut self, supported: bool) -> Self {
        self.noise_filter_support = supported;
        self
    }

    fn board(&self) -> MutexGuard<'_, MockBoard> {
        // A panic while holding the lock leaves plain data behind, nothing to repair.
        self.board.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Closes the switch between two pins.
    pub fn press(&self, a: usize, b: usize) {
        self.board().switches.insert((a, b));
    }

    /// Opens the switch between two pins.
    pub fn release(&self, a: usize, b: usize) {
        let mut board = self.board();
        board.switches.remove(&(a, b));
        board.switches.remove(&(b, a));
    }

    /// Opens every switch.
    pub fn release_all(&self) {
        self.board().switches.clear();
    }

    /// Makes the next `count` reads fail with an IO error.
    pub fn fail_reads(&self, count: usize) {
        self.board().failing_reads = count;
    }

    /// Makes the next `count` writes fail with an IO error.
    pub fn fail_writes(&self, count: usize) {
        self.board().failing_writes = count;
    }

    /// Makes the next `count` attempts to drive this pin low fail with an IO error.
    pub fn fail_lowering(&self, index: usize, count: usize) {
        self.board().pins[index].failing_lowers = count;
    }

    /// The most outputs ever driven high at the same time.
    pub fn peak_driven_high(&self) -> usize {
        self.board().peak_driven_high
    }

    pub fn is_claimed(&self, index: usize) -> bool {
        self.board().pins[index].claimed
    }

    pub fn direction(&self, index: usize) -> GpioDirection {
        self.board().pins[index].direction
    }

    pub fn bias(&self, index: usize) -> GpioBias {
        self.board().pins[index].bias
    }

    pub fn driven(&self, index: usize) -> bool {
        self.board().pins[index].driven
    }

    pub fn noise_filter(&self, index: usize) -> Option<NoiseFilter> {
        self.board().pins[index].filter
    }

    /// How many times the pin has been returned to its neutral state.
    pub fn releases(&self, index: usize) -> usize {
        self.board().pins[index].releases
    }
}

impl Debug for MockGpioDriver {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "MockGpioDriver({})", self.board().pins.len())
    }
}

impl GpioDriver for MockGpioDriver {
    fn count(&self) -> GpioResult<usize> {
        Ok(self.board().pins.len())
    }

    fn get_pin(&self, index: usize) -> GpioResult<Box<dyn GpioPin + '_>> {
        let mut board = self.board();
        let pin = board.pins.get_mut(index).ok_or(GpioError::InvalidArgument)?;

        if pin.claimed {
            return Err(GpioError::AlreadyInUse);
        }
        pin.claimed = true;

        Ok(Box::new(MockGpioPin {
            driver: self,
            pin_index: index,
        }))
    }
}

struct MockGpioPin<'a> {
    driver: &'a MockGpioDriver,
    pin_index: usize,
}

impl Debug for MockGpioPin<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "MockGpioDriver[{}]", self.pin_index)
    }
}

impl GpioPin for MockGpioPin<'_> {
    fn index(&self) -> usize {
        self.pin_index
    }

    fn direction(&self) -> GpioDirection {
        self.driver.board().pins[self.pin_index].direction
    }

    fn set_direction(&mut self, direction: GpioDirection) -> GpioResult<()> {
        let mut board = self.driver.board();
        let pin = &mut board.pins[self.pin_index];
        pin.direction = direction;
        pin.driven = false;
        Ok(())
    }

    fn read(&self) -> GpioResult<bool> {
        let mut board = self.driver.board();
        if board.failing_reads > 0 {
            board.failing_reads -= 1;
            return Err(GpioError::Io(std::io::ErrorKind::TimedOut));
        }
        Ok(board.level(self.pin_index))
    }

    fn write(&self, value: bool) -> GpioResult<()> {
        let mut board = self.driver.board();
        if board.failing_writes > 0 {
            board.failing_writes -= 1;
            return Err(GpioError::Io(std::io::ErrorKind::TimedOut));
        }
        let pin = &mut board.pins[self.pin_index];
        if pin.direction != GpioDirection::Output {
            return Err(GpioError::WrongDirection);
        }
        if !value && pin.failing_lowers > 0 {
            pin.failing_lowers -= 1;
            return Err(GpioError::Io(std::io::ErrorKind::TimedOut));
        }

        board.pins[self.pin_index].driven = value;
        let driven_high = board.driven_high();
        board.peak_driven_high = board.peak_driven_high.max(driven_high);
        trace!("{:?} <- {}", self, value);
        Ok(())
    }

    fn supports_bias(&self) -> bool {
        self.driver.bias_support
    }

    fn bias(&self) -> GpioBias {
        self.driver.board().pins[self.pin_index].bias
    }

    fn set_bias(&mut self, bias: GpioBias) -> GpioResult<()> {
        if !self.driver.bias_support {
            return Err(GpioError::NotSupported);
        }
        self.driver.board().pins[self.pin_index].bias = bias;
        Ok(())
    }

    fn supports_noise_filter(&self) -> bool {
        self.driver.noise_filter_support
    }

    fn noise_filter(&self) -> Option<NoiseFilter> {
        self.driver.board().pins[self.pin_index].filter
    }

    fn set_noise_filter(&mut self, filter: Option<NoiseFilter>) -> GpioResult<()> {
        if !self.driver.noise_filter_support {
            return Err(GpioError::NotSupported);
        }
        self.driver.board().pins[self.pin_index].filter = filter;
        Ok(())
    }

    fn release(&mut self) -> GpioResult<()> {
        let mut board = self.driver.board();
        let pin = &mut board.pins[self.pin_index];
        pin.direction = GpioDirection::Input;
        pin.driven = false;
        pin.filter = None;
        if self.driver.bias_support {
            pin.bias = GpioBias::PullDown;
        }
        pin.releases += 1;
        Ok(())
    }
}

impl Drop for MockGpioPin<'_> {
    fn drop(&mut self) {
        self.driver.board().pins[self.pin_index].claimed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_follows_connected_output() {
        let driver = MockGpioDriver::new(4);
        let mut col = driver.get_pin(0).unwrap();
        let mut row = driver.get_pin(1).unwrap();
        col.configure(GpioDirection::Output, GpioBias::None, None).unwrap();
        row.configure(GpioDirection::Input, GpioBias::PullDown, None).unwrap();

        col.write(true).unwrap();
        assert!(!row.read().unwrap());

        driver.press(1, 0);
        assert!(row.read().unwrap());

        col.write(false).unwrap();
        assert!(!row.read().unwrap());
    }

    #[test]
    fn pull_up_reads_high_when_floating() {
        let driver = MockGpioDriver::new(1);
        let mut pin = driver.get_pin(0).unwrap();
        pin.configure(GpioDirection::Input, GpioBias::PullUp, None).unwrap();
        assert!(pin.read().unwrap());
    }

    #[test]
    fn pins_are_claimed_until_dropped() {
        let driver = MockGpioDriver::new(2);
        let pin = driver.get_pin(1).unwrap();
        assert_eq!(driver.get_pin(1).unwrap_err(), GpioError::AlreadyInUse);
        assert_eq!(driver.get_pin(2).unwrap_err(), GpioError::InvalidArgument);

        drop(pin);
        assert!(!driver.is_claimed(1));
        assert!(driver.get_pin(1).is_ok());
    }

    #[test]
    fn write_to_input_is_rejected() {
        let driver = MockGpioDriver::new(1);
        let pin = driver.get_pin(0).unwrap();
        assert_eq!(pin.write(true).unwrap_err(), GpioError::WrongDirection);
    }

    #[test]
    fn injected_failures_are_consumed() {
        let driver = MockGpioDriver::new(1);
        let pin = driver.get_pin(0).unwrap();
        driver.fail_reads(1);
        assert!(matches!(pin.read(), Err(GpioError::Io(_))));
        assert!(pin.read().is_ok());
    }

    #[test]
    fn lowering_failures_only_hit_that_pin_going_low() {
        let driver = MockGpioDriver::new(2);
        let mut pin = driver.get_pin(0).unwrap();
        pin.configure(GpioDirection::Output, GpioBias::None, None).unwrap();
        driver.fail_lowering(0, 1);

        pin.write(true).unwrap();
        assert!(matches!(pin.write(false), Err(GpioError::Io(_))));
        assert!(driver.driven(0));
        pin.write(false).unwrap();
        assert!(!driver.driven(0));
    }

    #[test]
    fn configure_without_bias_support() {
        let driver = MockGpioDriver::new(1).with_bias_support(false);
        let mut pin = driver.get_pin(0).unwrap();
        assert!(pin.configure(GpioDirection::Output, GpioBias::None, None).is_ok());
        assert_eq!(
            pin.configure(GpioDirection::Input, GpioBias::PullDown, None).unwrap_err(),
            GpioError::NotSupported,
        );
    }
}
