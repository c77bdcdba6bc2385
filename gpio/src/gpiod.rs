//! GPIO driver on top of the Linux GPIO character device, using the gpiod library.
use crate::{GpioBias, GpioDirection, GpioDriver, GpioError, GpioPin, GpioResult};
use bitvec::vec::BitVec;
use log::trace;
use std::fmt::{Debug, Formatter};
use std::path::Path;
use std::sync::atomic::AtomicU8;

/// GpiodDriver is a GPIO driver that uses the gpiod library to manage GPIO pins.
///
/// Every pin is requested as its own line, so pins can change direction independently.
pub struct GpiodDriver {
    chip: gpiod::Chip,
    used_pins: BitVec<AtomicU8>,
}

impl GpiodDriver {
    pub fn new(chip: gpiod::Chip) -> Self {
        let n = chip.num_lines() as usize;
        let bits = BitVec::repeat(false, n);
        Self {
            chip,
            used_pins: bits,
        }
    }

    /// Opens the GPIO chip at the given path, e.g. `/dev/gpiochip0`.
    pub fn open(path: impl AsRef<Path>) -> GpioResult<Self> {
        let chip = gpiod::Chip::new(path.as_ref())?;
        Ok(Self::new(chip))
    }
}

impl Debug for GpiodDriver {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "GpiodDriver({})", self.chip.name())
    }
}

impl GpioDriver for GpiodDriver {
    fn count(&self) -> GpioResult<usize> {
        Ok(self.chip.num_lines() as usize)
    }

    fn get_pin(&self, index: usize) -> GpioResult<Box<dyn GpioPin + '_>> {
        if index >= self.count()? {
            return Err(GpioError::InvalidArgument);
        }

        if self.used_pins[index] {
            return Err(GpioError::AlreadyInUse);
        }

        self.used_pins.set_aliased(index, true);

        Ok(Box::new(GpiodPin {
            driver: self,
            pin_index: index,
            bias: GpioBias::None,
            lines: GpiodLines::Unrequested,
        }))
    }
}

impl From<GpioBias> for gpiod::Bias {
    fn from(bias: GpioBias) -> Self {
        match bias {
            GpioBias::None => gpiod::Bias::Disable,
            GpioBias::PullUp => gpiod::Bias::PullUp,
            GpioBias::PullDown => gpiod::Bias::PullDown,
        }
    }
}

enum GpiodLines {
    Unrequested,
    Input(gpiod::Lines<gpiod::Input>),
    Output(gpiod::Lines<gpiod::Output>),
}

struct GpiodPin<'a> {
    driver: &'a GpiodDriver,
    pin_index: usize,
    bias: GpioBias,
    lines: GpiodLines,
}

impl GpiodPin<'_> {
    fn request(&mut self, direction: GpioDirection) -> GpioResult<()> {
        // The kernel refuses a second request for the same line, so let go of the old one first.
        self.lines = GpiodLines::Unrequested;

        let offset = [self.pin_index as u32];
        self.lines = match direction {
            GpioDirection::Input => GpiodLines::Input(self.driver.chip.request_lines(
                gpiod::Options::input(offset)
                    .consumer(env!("CARGO_PKG_NAME"))
                    .bias(self.bias.into()),
            )?),
            GpioDirection::Output => GpiodLines::Output(self.driver.chip.request_lines(
                gpiod::Options::output(offset)
                    .consumer(env!("CARGO_PKG_NAME"))
                    .bias(self.bias.into()),
            )?),
        };
        trace!("{:?} requested as {:?}", self, direction);
        Ok(())
    }
}

impl Debug for GpiodPin<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}[{}]", self.driver, self.pin_index)
    }
}

impl GpioPin for GpiodPin<'_> {
    fn index(&self) -> usize {
        self.pin_index
    }

    fn direction(&self) -> GpioDirection {
        match self.lines {
            GpiodLines::Output(_) => GpioDirection::Output,
            _ => GpioDirection::Input,
        }
    }

    fn set_direction(&mut self, direction: GpioDirection) -> GpioResult<()> {
        self.request(direction)
    }

    fn read(&self) -> GpioResult<bool> {
        match &self.lines {
            GpiodLines::Input(line) => {
                let values = line.get_values([false])?;
                Ok(values[0])
            }
            _ => Err(GpioError::WrongDirection),
        }
    }

    fn write(&self, value: bool) -> GpioResult<()> {
        match &self.lines {
            GpiodLines::Output(line) => {
                line.set_values([value])?;
                Ok(())
            }
            _ => Err(GpioError::WrongDirection),
        }
    }

    fn supports_bias(&self) -> bool {
        true
    }

    fn bias(&self) -> GpioBias {
        self.bias
    }

    fn set_bias(&mut self, bias: GpioBias) -> GpioResult<()> {
        self.bias = bias;
        // Bias is part of the line request, so an already requested line has to be requested again.
        match self.lines {
            GpiodLines::Unrequested => Ok(()),
            GpiodLines::Input(_) => self.request(GpioDirection::Input),
            GpiodLines::Output(_) => self.request(GpioDirection::Output),
        }
    }
}

impl Drop for GpiodPin<'_> {
    fn drop(&mut self) {
        self.lines = GpiodLines::Unrequested;
        self.driver.used_pins.set_aliased(self.pin_index, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn missing_chip_fails_to_open() {
        assert!(GpiodDriver::open("/dev/keyscan-no-such-gpiochip").is_err());
        assert!(GpiodDriver::open(PathBuf::from("/dev/keyscan-no-such-gpiochip")).is_err());
    }
}
