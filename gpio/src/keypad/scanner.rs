use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use log::{debug, info, warn};
use crate::keypad::{KeyDebounce, KeyEvent, KeySink, Keypad, KeypadError, KeypadLayout, MatrixKeypad, ScanMode};
use crate::{GpioDriver, NoiseFilter};

/// Scans a [Keypad] and reports each physical key press once.
///
/// Each call to [KeypadScanner::poll] is one complete scan cycle plus a debounce step, so calls
/// must not overlap. The scanner owns the keypad, which keeps any other writer off the column pins.
pub struct KeypadScanner<K: Keypad> {
    keypad: K,
    debounce: KeyDebounce<K::Key>,
}

impl<K: Keypad> Debug for KeypadScanner<K> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeypadScanner({:?}, {:?})", self.keypad, self.debounce.window)
    }
}

impl<'a> KeypadScanner<MatrixKeypad<'a>> {
    /// Brings up a [MatrixKeypad] on `driver` and wraps it in a scanner.
    pub fn open(
        driver: &'a dyn GpioDriver,
        layout: KeypadLayout,
        noise_filter: Option<NoiseFilter>,
        debounce_window: Duration,
    ) -> Result<Self, KeypadError> {
        let keypad = MatrixKeypad::new(driver, layout, noise_filter)?;
        Ok(Self::new(keypad, debounce_window))
    }
}

impl<K> KeypadScanner<K>
where
    K: Keypad,
    K::Key: Copy + Eq + Debug,
{
    pub fn new(keypad: K, debounce_window: Duration) -> Self {
        Self {
            keypad,
            debounce: KeyDebounce::new(debounce_window),
        }
    }

    pub fn keypad(&self) -> &K {
        &self.keypad
    }

    pub fn debounce(&self) -> &KeyDebounce<K::Key> {
        &self.debounce
    }

    /// Runs one scan cycle and returns an event if a key just went down.
    ///
    /// Never waits for a key to be released.
    pub fn poll(&mut self) -> Option<KeyEvent<K::Key>> {
        self.poll_at(Instant::now())
    }

    /// [KeypadScanner::poll] with an explicit time for the debounce step.
    pub fn poll_at(&mut self, now: Instant) -> Option<KeyEvent<K::Key>> {
        let raw = self.scan_or_skip(K::scan)?;
        self.report(raw, now)
    }

    /// Like [KeypadScanner::poll], but a found key is only reported once it has been released.
    ///
    /// Every press is reported, including the same key twice in a row. Blocks the caller for as
    /// long as the key is held, or until `stop` is set, which drops the press unreported.
    pub fn poll_blocking(&mut self, stop: &AtomicBool) -> Option<KeyEvent<K::Key>> {
        let raw = self.scan_or_skip(|keypad| keypad.scan_until_release(stop))?;
        let now = Instant::now();
        let event = self.report(raw, now);
        // The key is already up again by the time the scan returns.
        self.debounce.update(None, now);
        event
    }

    /// A failed cycle counts as no key, but must not look like a release to the debounce state.
    fn scan_or_skip(
        &self,
        scan: impl FnOnce(&K) -> crate::GpioResult<Option<K::Key>>,
    ) -> Option<Option<K::Key>> {
        match scan(&self.keypad) {
            Ok(raw) => Some(raw),
            Err(err) => {
                warn!("{}", KeypadError::TransientIo(err));
                None
            }
        }
    }

    fn report(&mut self, raw: Option<K::Key>, now: Instant) -> Option<KeyEvent<K::Key>> {
        let event = self.debounce.update(raw, now);
        if let Some(event) = &event {
            debug!("Key down: {:?}", event.key);
        }
        event
    }

    /// Polls every `interval` and hands each event to `sink`, until `stop` is set.
    ///
    /// In [ScanMode::Blocking], `stop` also ends the wait for a held key.
    pub fn run_until(
        &mut self,
        stop: &AtomicBool,
        interval: Duration,
        mode: ScanMode,
        sink: &mut impl KeySink<K::Key>,
    ) {
        info!("Scanning {:?} every {:?} ({:?}).", self.keypad, interval, mode);

        while !stop.load(Ordering::Acquire) {
            let event = match mode {
                ScanMode::Polling => self.poll(),
                ScanMode::Blocking => self.poll_blocking(stop),
            };
            if let Some(event) = event {
                sink.key_pressed(event);
            }
            thread::sleep(interval);
        }

        debug!("Scan loop stopped.");
    }

    /// Returns the keypad pins to their neutral state. Calling it again does nothing.
    pub fn release(&mut self) -> Result<(), KeypadError> {
        self.keypad.release().map_err(KeypadError::Shutdown)
    }
}
