//! GPIO driver poking the BCM283x/BCM2711 GPIO registers directly through a memory map.
use crate::{GpioBias, GpioDirection, GpioDriver, GpioError, GpioPin, GpioResult};
use bitvec::vec::BitVec;
use log::{debug, trace, warn};
use memmap2::{MmapOptions, MmapRaw};
use std::fmt::{Debug, Formatter};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::AtomicU8;
use std::thread;
use std::time::Duration;

/// The Broadcom SoC family, which decides the peripheral base and how pulls are set.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Soc {
    /// Pi 1 and Zero.
    Bcm2835,
    /// Pi 2, 3 and Zero 2.
    Bcm2837,
    /// Pi 4 and 400.
    Bcm2711,
}

impl Soc {
    const COMPATIBLE_PATH: &'static str = "/proc/device-tree/compatible";

    /// Picks the SoC out of a device tree `compatible` property (NUL separated strings).
    pub fn from_compatible(compatible: &[u8]) -> Option<Self> {
        compatible
            .split(|&byte| byte == 0)
            .find_map(|entry| match entry {
                b"brcm,bcm2835" => Some(Soc::Bcm2835),
                b"brcm,bcm2836" | b"brcm,bcm2837" => Some(Soc::Bcm2837),
                b"brcm,bcm2711" => Some(Soc::Bcm2711),
                _ => None,
            })
    }

    /// Reads the SoC of the running board from the device tree.
    pub fn detect() -> GpioResult<Self> {
        let compatible = std::fs::read(Self::COMPATIBLE_PATH)?;
        Self::from_compatible(&compatible).ok_or_else(|| {
            warn!("Unknown SoC in {}: {:?}", Self::COMPATIBLE_PATH, String::from_utf8_lossy(&compatible));
            GpioError::NotSupported
        })
    }

    fn gpio_base(self) -> u64 {
        let peripherals: u64 = match self {
            Soc::Bcm2835 => 0x2000_0000,
            Soc::Bcm2837 => 0x3F00_0000,
            Soc::Bcm2711 => 0xFE00_0000,
        };
        peripherals + 0x20_0000
    }
}

pub struct RawGpioDriver {
    mmap: MmapRaw,
    soc: Soc,
    used_pins: BitVec<AtomicU8>,
}

impl RawGpioDriver {
    const PIN_COUNT: usize = 58;

    // Register offsets, in bytes from the GPIO base.
    const GPFSEL0: usize = 0x00;
    const GPSET0: usize = 0x1C;
    const GPCLR0: usize = 0x28;
    const GPLEV0: usize = 0x34;
    // BCM2835/2837 pull control.
    const GPPUD: usize = 0x94;
    const GPPUDCLK0: usize = 0x98;
    // BCM2711 pull control.
    const GPIO_PUP_PDN_CNTRL_REG0: usize = 0xE4;

    const FUNCTION_INPUT: u32 = 0b000;
    const FUNCTION_OUTPUT: u32 = 0b001;

    /// Setup and hold time of the GPPUD clocking sequence, 150 core cycles at the very least.
    const PULL_CLOCK_DELAY: Duration = Duration::from_micros(5);

    fn create(path: impl AsRef<Path>, offset: u64, soc: Soc) -> GpioResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)?;

        let mmap = MmapOptions::new()
                .offset(offset)
                .len(4096)
                .map_raw(&file)?;

        debug!("Mapped GPIO registers of {:?}", soc);
        Ok(RawGpioDriver {
            mmap,
            soc,
            used_pins: BitVec::repeat(false, Self::PIN_COUNT),
        })
    }

    /// Maps `/dev/gpiomem`, which exposes only the GPIO block and needs no root.
    pub fn new_gpiomem() -> GpioResult<Self> {
        Self::create("/dev/gpiomem", 0, Soc::detect()?)
    }

    /// Maps the GPIO block out of `/dev/mem`. Needs root.
    pub fn new_mem() -> GpioResult<Self> {
        let soc = Soc::detect()?;
        Self::create("/dev/mem", soc.gpio_base(), soc)
    }

    pub fn soc(&self) -> Soc {
        self.soc
    }

    fn register(&self, byte_offset: usize) -> *mut u32 {
        let base = self.mmap.as_mut_ptr() as *mut u32;
        // Offsets are fixed register addresses well within the 4 KiB mapping.
        unsafe { base.add(byte_offset / 4) }
    }

    fn check_index(pin_index: usize) -> GpioResult<()> {
        if pin_index >= Self::PIN_COUNT {
            Err(GpioError::InvalidArgument)
        } else {
            Ok(())
        }
    }

    fn raw_set_pin_function(&self, pin_index: usize, function: u32) -> GpioResult<()> {
        Self::check_index(pin_index)?;

        // GPFSELn packs ten pins per register, three bits each.
        let register = self.register(Self::GPFSEL0 + (pin_index / 10) * 4);
        let shift = (pin_index % 10) * 3;

        unsafe {
            let value = register.read_volatile() & !(0b111 << shift);
            register.write_volatile(value | (function << shift));
        }
        trace!("GPFSEL pin {} = {:03b}", pin_index, function);
        Ok(())
    }

    fn raw_get_pin_function(&self, pin_index: usize) -> GpioResult<u32> {
        Self::check_index(pin_index)?;

        let register = self.register(Self::GPFSEL0 + (pin_index / 10) * 4);
        let shift = (pin_index % 10) * 3;

        let value = unsafe { register.read_volatile() };
        Ok((value >> shift) & 0b111)
    }

    fn raw_set_pin_output(&self, pin_index: usize, high: bool) -> GpioResult<()> {
        Self::check_index(pin_index)?;

        // GPSETn/GPCLRn only act on the bits written as 1.
        let base = if high { Self::GPSET0 } else { Self::GPCLR0 };
        let register = self.register(base + (pin_index / 32) * 4);
        unsafe { register.write_volatile(1 << (pin_index % 32)) };
        Ok(())
    }

    fn raw_get_pin_level(&self, pin_index: usize) -> GpioResult<bool> {
        Self::check_index(pin_index)?;

        let register = self.register(Self::GPLEV0 + (pin_index / 32) * 4);
        let value = unsafe { register.read_volatile() };
        Ok((value >> (pin_index % 32)) & 1 != 0)
    }

    fn raw_set_bias(&self, pin_index: usize, bias: GpioBias) -> GpioResult<()> {
        Self::check_index(pin_index)?;

        match self.soc {
            Soc::Bcm2711 => self.raw_set_bias_direct(pin_index, bias),
            Soc::Bcm2835 | Soc::Bcm2837 => self.raw_set_bias_clocked(pin_index, bias),
        }
        trace!("Pull pin {} = {:?}", pin_index, bias);
        Ok(())
    }

    fn raw_set_bias_direct(&self, pin_index: usize, bias: GpioBias) {
        let bias_value: u32 = match bias {
            GpioBias::None => 0b00,
            GpioBias::PullUp => 0b01,
            GpioBias::PullDown => 0b10,
        };

        // Sixteen pins per register, two bits each.
        let register = self.register(Self::GPIO_PUP_PDN_CNTRL_REG0 + (pin_index / 16) * 4);
        let shift = (pin_index % 16) * 2;

        unsafe {
            let value = register.read_volatile() & !(0b11 << shift);
            register.write_volatile(value | (bias_value << shift));
        }
    }

    /// The GPPUD sequence: set the control signal, clock it into the pin, then remove both.
    fn raw_set_bias_clocked(&self, pin_index: usize, bias: GpioBias) {
        let control: u32 = match bias {
            GpioBias::None => 0b00,
            GpioBias::PullDown => 0b01,
            GpioBias::PullUp => 0b10,
        };
        let pud = self.register(Self::GPPUD);
        let clock = self.register(Self::GPPUDCLK0 + (pin_index / 32) * 4);

        unsafe { pud.write_volatile(control) };
        thread::sleep(Self::PULL_CLOCK_DELAY);
        unsafe { clock.write_volatile(1 << (pin_index % 32)) };
        thread::sleep(Self::PULL_CLOCK_DELAY);
        unsafe {
            pud.write_volatile(0);
            clock.write_volatile(0);
        }
    }

    /// Reads the pull setting back. Only the BCM2711 can.
    fn raw_get_bias(&self, pin_index: usize) -> GpioResult<GpioBias> {
        Self::check_index(pin_index)?;
        if self.soc != Soc::Bcm2711 {
            return Err(GpioError::NotSupported);
        }

        let register = self.register(Self::GPIO_PUP_PDN_CNTRL_REG0 + (pin_index / 16) * 4);
        let shift = (pin_index % 16) * 2;
        let value = unsafe { register.read_volatile() };

        match (value >> shift) & 0b11 {
            0b00 => Ok(GpioBias::None),
            0b01 => Ok(GpioBias::PullUp),
            0b10 => Ok(GpioBias::PullDown),
            _ => Err(GpioError::NotSupported),
        }
    }
}

impl Debug for RawGpioDriver {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "RawGpioDriver({:?}, {:?})", self.soc, self.mmap.as_ptr().addr())
    }
}

impl GpioDriver for RawGpioDriver {
    fn count(&self) -> GpioResult<usize> {
        Ok(Self::PIN_COUNT)
    }

    fn get_pin(&self, index: usize) -> GpioResult<Box<dyn GpioPin + '_>> {
        if index >= self.count()? {
            return Err(GpioError::InvalidArgument);
        }

        if self.used_pins[index] {
            return Err(GpioError::AlreadyInUse);
        }

        self.used_pins.set_aliased(index, true);

        Ok(Box::new(RawGpioPin {
            driver: self,
            pin_index: index,
            bias: GpioBias::None,
        }))
    }
}

struct RawGpioPin<'a> {
    driver: &'a RawGpioDriver,
    pin_index: usize,
    /// Last pull written, for SoCs that can't read it back.
    bias: GpioBias,
}

impl Debug for RawGpioPin<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}[{}]", self.driver, self.pin_index)
    }
}

impl GpioPin for RawGpioPin<'_> {
    fn index(&self) -> usize {
        self.pin_index
    }

    fn direction(&self) -> GpioDirection {
        match self.driver.raw_get_pin_function(self.pin_index) {
            Ok(RawGpioDriver::FUNCTION_OUTPUT) => GpioDirection::Output,
            _ => GpioDirection::Input,
        }
    }

    fn set_direction(&mut self, direction: GpioDirection) -> GpioResult<()> {
        let function = match direction {
            GpioDirection::Input => RawGpioDriver::FUNCTION_INPUT,
            GpioDirection::Output => RawGpioDriver::FUNCTION_OUTPUT,
        };
        self.driver.raw_set_pin_function(self.pin_index, function)
    }

    fn read(&self) -> GpioResult<bool> {
        self.driver.raw_get_pin_level(self.pin_index)
    }

    fn write(&self, value: bool) -> GpioResult<()> {
        if self.direction() != GpioDirection::Output {
            return Err(GpioError::WrongDirection);
        }
        self.driver.raw_set_pin_output(self.pin_index, value)
    }

    fn supports_bias(&self) -> bool {
        true
    }

    fn bias(&self) -> GpioBias {
        self.driver.raw_get_bias(self.pin_index).unwrap_or(self.bias)
    }

    fn set_bias(&mut self, bias: GpioBias) -> GpioResult<()> {
        self.driver.raw_set_bias(self.pin_index, bias)?;
        self.bias = bias;
        Ok(())
    }
}

impl Drop for RawGpioPin<'_> {
    fn drop(&mut self) {
        _ = self.driver.raw_set_pin_function(self.pin_index, RawGpioDriver::FUNCTION_INPUT);
        self.driver.used_pins.set_aliased(self.pin_index, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::path::PathBuf;

    /// A zeroed register page backed by a plain file, standing in for `/dev/gpiomem`.
    struct RegisterFile(PathBuf);

    impl RegisterFile {
        fn new(name: &str) -> Self {
            let path = std::env::temp_dir().join(format!("keyscan-{}-{}", name, std::process::id()));
            File::create(&path).unwrap().set_len(4096).unwrap();
            RegisterFile(path)
        }

        fn driver(&self, soc: Soc) -> RawGpioDriver {
            RawGpioDriver::create(&self.0, 0, soc).unwrap()
        }
    }

    impl Drop for RegisterFile {
        fn drop(&mut self) {
            _ = std::fs::remove_file(&self.0);
        }
    }

    fn peek(driver: &RawGpioDriver, byte_offset: usize) -> u32 {
        unsafe { driver.register(byte_offset).read_volatile() }
    }

    #[test]
    fn soc_from_device_tree() {
        assert_eq!(Soc::from_compatible(b"raspberrypi,4-model-b\0brcm,bcm2711\0"), Some(Soc::Bcm2711));
        assert_eq!(Soc::from_compatible(b"raspberrypi,3-model-b\0brcm,bcm2837\0"), Some(Soc::Bcm2837));
        assert_eq!(Soc::from_compatible(b"raspberrypi,2-model-b\0brcm,bcm2836\0"), Some(Soc::Bcm2837));
        assert_eq!(Soc::from_compatible(b"raspberrypi,model-zero\0brcm,bcm2835\0"), Some(Soc::Bcm2835));
        assert_eq!(Soc::from_compatible(b"raspberrypi,5-model-b\0brcm,bcm2712\0"), None);
    }

    #[test]
    fn gpio_base_per_soc() {
        assert_eq!(Soc::Bcm2835.gpio_base(), 0x2020_0000);
        assert_eq!(Soc::Bcm2837.gpio_base(), 0x3F20_0000);
        assert_eq!(Soc::Bcm2711.gpio_base(), 0xFE20_0000);
    }

    #[test]
    fn output_pin_registers() {
        let registers = RegisterFile::new("output");
        let driver = registers.driver(Soc::Bcm2711);
        let mut pin = driver.get_pin(17).unwrap();

        assert_eq!(pin.write(true), Err(GpioError::WrongDirection));
        pin.set_direction(GpioDirection::Output).unwrap();
        assert_eq!(peek(&driver, RawGpioDriver::GPFSEL0 + 4), 0b001 << 21);
        assert_eq!(pin.direction(), GpioDirection::Output);

        pin.write(true).unwrap();
        assert_eq!(peek(&driver, RawGpioDriver::GPSET0), 1 << 17);
        pin.write(false).unwrap();
        assert_eq!(peek(&driver, RawGpioDriver::GPCLR0), 1 << 17);
    }

    #[test]
    fn bcm2711_pulls_use_the_control_register() {
        let registers = RegisterFile::new("pull-2711");
        let driver = registers.driver(Soc::Bcm2711);
        let mut pin = driver.get_pin(18).unwrap();

        pin.set_bias(GpioBias::PullDown).unwrap();
        assert_eq!(peek(&driver, RawGpioDriver::GPIO_PUP_PDN_CNTRL_REG0 + 4), 0b10 << 4);
        assert_eq!(pin.bias(), GpioBias::PullDown);
    }

    #[test]
    fn bcm2837_pulls_use_the_clocked_sequence() {
        let registers = RegisterFile::new("pull-2837");
        let driver = registers.driver(Soc::Bcm2837);
        let mut pin = driver.get_pin(18).unwrap();

        pin.set_bias(GpioBias::PullDown).unwrap();
        // The BCM2711 register doesn't exist here and must stay untouched.
        assert_eq!(peek(&driver, RawGpioDriver::GPIO_PUP_PDN_CNTRL_REG0 + 4), 0);
        // Control signal and clock are both removed once the pull is latched.
        assert_eq!(peek(&driver, RawGpioDriver::GPPUD), 0);
        assert_eq!(peek(&driver, RawGpioDriver::GPPUDCLK0), 0);
        assert_eq!(pin.bias(), GpioBias::PullDown);
        assert_eq!(driver.raw_get_bias(18), Err(GpioError::NotSupported));
    }

    #[test]
    fn pins_are_claimed_until_dropped() {
        let registers = RegisterFile::new("claim");
        let driver = registers.driver(Soc::Bcm2837);

        let pin = driver.get_pin(4).unwrap();
        assert_eq!(driver.get_pin(4).err(), Some(GpioError::AlreadyInUse));
        drop(pin);
        assert!(driver.get_pin(4).is_ok());
        assert_eq!(driver.get_pin(58).err(), Some(GpioError::InvalidArgument));
    }
}
