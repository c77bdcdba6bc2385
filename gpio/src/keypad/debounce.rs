use std::time::{Duration, Instant};
use crate::keypad::{DEFAULT_DEBOUNCE_WINDOW, KeyEvent};

/// Turns the raw key seen on every scan cycle into one event per physical press.
///
/// A key going down is reported right away. Holding it produces nothing more, and letting go is
/// silent. A different key is reported as soon as it shows up.
#[derive(Clone, Debug)]
pub struct KeyDebounce<K> {
    last: Option<K>,
    confirmed_at: Option<Instant>,
    pub window: Duration,
}

impl<K: Copy + Eq> KeyDebounce<K> {
    pub fn new(window: Duration) -> Self {
        Self {
            last: None,
            confirmed_at: None,
            window,
        }
    }

    /// The last confirmed key, `None` when nothing is held.
    pub fn last(&self) -> Option<K> {
        self.last
    }

    /// When the last confirmed state was recorded.
    ///
    /// For a held key this is refreshed every time `window` elapses.
    pub fn confirmed_at(&self) -> Option<Instant> {
        self.confirmed_at
    }

    /// Feeds one scan result. Returns an event when it is a new key going down.
    pub fn update(&mut self, raw: Option<K>, now: Instant) -> Option<KeyEvent<K>> {
        if raw != self.last {
            self.last = raw;
            self.confirmed_at = Some(now);
            return raw.map(|key| KeyEvent { key, at: now });
        }

        if raw.is_some() {
            let elapsed = self
                .confirmed_at
                .map_or(self.window, |at| now.saturating_duration_since(at));
            if elapsed >= self.window {
                self.confirmed_at = Some(now);
            }
        }

        None
    }

    /// Forgets the held key, as if everything had been let go.
    pub fn clear(&mut self) {
        self.last = None;
        self.confirmed_at = None;
    }
}

impl<K: Copy + Eq> Default for KeyDebounce<K> {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE_WINDOW)
    }
}
