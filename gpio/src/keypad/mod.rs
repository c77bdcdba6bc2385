mod debounce;
mod gpio;
mod layout;
mod scanner;

use std::fmt::Debug;
use std::sync::atomic::AtomicBool;
use std::sync::mpsc::Sender;
use std::time::{Duration, Instant};
use thiserror::Error;
use crate::{GpioError, GpioResult};
pub use debounce::*;
pub use gpio::*;
pub use layout::*;
pub use scanner::*;

/// Default time after which a held key's confirmation timestamp is refreshed.
pub const DEFAULT_DEBOUNCE_WINDOW: Duration = Duration::from_millis(30);

/// Default delay between two scan cycles.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// The `Keypad` trait defines the interface for keypad input devices.
pub trait Keypad: Debug {
    type Key;

    /// Runs a single scan cycle and returns the first pressed key found, if any.
    ///
    /// Never waits for the key to be released.
    fn scan(&self) -> GpioResult<Option<Self::Key>>;

    /// Like [Keypad::scan], but once a key is found, waits until it is released before returning.
    ///
    /// Gives up waiting as soon as `stop` is set, returning no key.
    fn scan_until_release(&self, stop: &AtomicBool) -> GpioResult<Option<Self::Key>>;

    /// Returns the keypad pins to their neutral state.
    ///
    /// Only the first call touches the hardware.
    fn release(&mut self) -> GpioResult<()>;
}

/// A key that went down.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct KeyEvent<K> {
    pub key: K,
    /// When the press was confirmed.
    pub at: Instant,
}

/// Receives the key events produced by a [KeypadScanner].
pub trait KeySink<K> {
    fn key_pressed(&mut self, event: KeyEvent<K>);
}

impl<K, F: FnMut(KeyEvent<K>)> KeySink<K> for F {
    fn key_pressed(&mut self, event: KeyEvent<K>) {
        self(event)
    }
}

impl<K> KeySink<K> for Vec<KeyEvent<K>> {
    fn key_pressed(&mut self, event: KeyEvent<K>) {
        self.push(event);
    }
}

impl<K> KeySink<K> for Sender<KeyEvent<K>> {
    fn key_pressed(&mut self, event: KeyEvent<K>) {
        // A gone receiver just means nobody is listening anymore.
        _ = self.send(event);
    }
}

/// How a [KeypadScanner] reads the keypad in its run loop.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum ScanMode {
    /// Scan once per cycle and never wait on the hardware.
    #[default] Polling,
    /// Hold the cycle until the pressed key is let go.
    ///
    /// Stalls the caller for as long as a key is held.
    Blocking,
}

/// Reasons a keypad can't be brought up.
#[derive(Debug, Error, Eq, PartialEq, Clone)]
pub enum InitError {
    #[error("keypad needs at least one row and one column")]
    Empty,
    #[error("key matrix is {rows}x{cols}, but {expected_rows} row pins and {expected_cols} column pins are assigned")]
    DimensionMismatch {
        rows: usize,
        cols: usize,
        expected_rows: usize,
        expected_cols: usize,
    },
    #[error("pin {0} is assigned more than once")]
    DuplicatePin(usize),
    #[error("pin {pin}: {source}")]
    Pin {
        pin: usize,
        #[source]
        source: GpioError,
    },
}

#[derive(Debug, Error, Eq, PartialEq, Clone)]
pub enum KeypadError {
    /// The keypad couldn't be set up. Nothing has been scanned.
    #[error("keypad initialization failed: {0}")]
    HardwareInit(#[from] InitError),
    /// A read or write failed during a scan cycle.
    #[error("I/O error during scan: {0}")]
    TransientIo(#[source] GpioError),
    /// The pins couldn't be returned to their neutral state.
    #[error("failed to release keypad pins: {0}")]
    Shutdown(#[source] GpioError),
}

impl KeypadError {
    /// Whether the error means the keypad can't be used at all.
    pub fn is_fatal(&self) -> bool {
        matches!(self, KeypadError::HardwareInit(_))
    }
}
