mod config;
mod sink;
mod utils;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use dotenv::dotenv;
use eyre::WrapErr;
use log::{debug, error, info, warn};
use sysinfo::System;
use keyscan_gpio::GpioDriver;
use keyscan_gpio::gpiod::GpiodDriver;
use keyscan_gpio::keypad::{KeypadLayout, KeypadScanner};
use keyscan_gpio::mock::MockGpioDriver;
use keyscan_gpio::raw::RawGpioDriver;
use crate::config::{Backend, Config};
use crate::sink::ConsoleSink;

fn log_system_info() {
    const UNKNOWN_STR: &str = "???";

    info!(
        "Running on {} {} (kernel {}), host {}, {}",
        System::name().as_deref().unwrap_or(UNKNOWN_STR),
        System::long_os_version().as_deref().unwrap_or(UNKNOWN_STR),
        System::kernel_version().as_deref().unwrap_or(UNKNOWN_STR),
        System::host_name().as_deref().unwrap_or(UNKNOWN_STR),
        System::cpu_arch(),
    );
}

fn open_driver(backend: &Backend, layout: &KeypadLayout) -> eyre::Result<Box<dyn GpioDriver>> {
    let driver: Box<dyn GpioDriver> = match backend {
        Backend::GpioMem => Box::new(RawGpioDriver::new_gpiomem()?),
        Backend::Mem => Box::new(RawGpioDriver::new_mem()?),
        Backend::Gpiod(path) => Box::new(GpiodDriver::open(path)?),
        Backend::Mock => {
            let count = layout.row_pins().iter().chain(layout.col_pins()).max().map_or(0, |&pin| pin + 1);
            Box::new(MockGpioDriver::new(count))
        }
    };
    Ok(driver)
}

fn main() -> eyre::Result<()> {
    // Initialize environment and logger
    dotenv().ok();
    pretty_env_logger::init();

    info!("Keyscan v{} starting...", env!("CARGO_PKG_VERSION"));
    log_system_info();

    let config = Config::load().wrap_err("Invalid configuration")?;
    debug!("{:?}", config);

    let layout = config.layout().wrap_err("Invalid keypad layout")?;
    info!("Keypad @ Rows: {:?}, Cols: {:?}", layout.row_pins(), layout.col_pins());

    // Needs to happen while the process is still single-threaded.
    let mut sink = ConsoleSink::new();

    debug!("Initializing GPIO driver ({})...", config.backend);
    let gpio = open_driver(&config.backend, &layout)
        .wrap_err_with(|| format!("Failed to open GPIO backend {}", config.backend))?;
    debug!("{:?} initialized.", gpio);

    debug!("Initializing keypad...");
    let mut scanner = match KeypadScanner::open(
        &*gpio,
        layout,
        config.noise_filter(),
        config.debounce_window(),
    ) {
        Ok(scanner) => scanner,
        Err(err) => {
            error!("{}", err);
            return Err(err.into());
        }
    };
    debug!("{:?} initialized.", scanner);

    let stop = Arc::new(AtomicBool::new(false));
    let handler_stop = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        // Repeated interrupts only find the flag already set.
        if !handler_stop.swap(true, Ordering::AcqRel) {
            info!("Interrupt received. Cleaning up and exiting...");
        }
    })
    .wrap_err("Failed to register interrupt handler")?;

    println!("Press keys on the keypad...");

    scanner.run_until(&stop, config.poll_interval(), config.scan_mode(), &mut sink);

    if let Err(err) = scanner.release() {
        warn!("{}", err);
    }

    info!("Application stopped!");
    Ok(())
}
