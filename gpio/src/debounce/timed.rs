use std::cell::Cell;
use std::fmt::{Debug, Formatter};
use std::time::Instant;
use crate::NoiseFilter;

/// A software [NoiseFilter] over a stream of raw levels, for backends that can't filter in hardware.
///
/// A new level is only reported once the raw level has held it for `steady`. Right after that,
/// the raw level passes through untouched for `active`.
pub struct LevelFilter {
    filter: NoiseFilter,
    state: Cell<bool>,
    changed_since: Cell<Option<Instant>>,
    active_until: Cell<Option<Instant>>,
}

impl LevelFilter {
    pub fn new(filter: NoiseFilter) -> Self {
        Self {
            filter,
            state: Cell::new(false),
            changed_since: Cell::new(None),
            active_until: Cell::new(None),
        }
    }

    /// Goes back to reporting low, with no change pending.
    pub fn reset(&self) {
        self.state.set(false);
        self.changed_since.set(None);
        self.active_until.set(None);
    }

    /// Feeds a raw level read at `now` and returns the filtered level.
    pub fn apply(&self, raw: bool, now: Instant) -> bool {
        if let Some(until) = self.active_until.get() {
            if now < until {
                self.state.set(raw);
                self.changed_since.set(None);
                return raw;
            }
            self.active_until.set(None);
        }

        let reported = self.state.get();
        if raw == reported {
            self.changed_since.set(None);
            return reported;
        }

        let since = self.changed_since.get().unwrap_or(now);
        if now.saturating_duration_since(since) >= self.filter.steady {
            self.changed_since.set(None);
            self.state.set(raw);
            self.active_until.set(now.checked_add(self.filter.active));
            raw
        } else {
            self.changed_since.set(Some(since));
            reported
        }
    }
}

impl Debug for LevelFilter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "LevelFilter({:?}, {})", self.filter, self.state.get())
    }
}
