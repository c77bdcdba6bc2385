use std::io::Write;
use log::{info, warn};
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};
use keyscan_gpio::keypad::{KeyEvent, KeySink};

/// Prints every key press to stdout with a wall-clock timestamp.
#[derive(Debug)]
pub struct ConsoleSink {
    offset: UtcOffset,
}

impl ConsoleSink {
    /// Creates the sink, capturing the local UTC offset.
    ///
    /// Call this before spawning threads: the local offset can't be read safely afterward on
    /// every platform, in which case UTC is used.
    pub fn new() -> Self {
        let offset = UtcOffset::current_local_offset().unwrap_or_else(|err| {
            warn!("Can't determine local time offset ({}), using UTC.", err);
            UtcOffset::UTC
        });
        ConsoleSink { offset }
    }

    fn timestamp(&self, event: &KeyEvent<char>) -> OffsetDateTime {
        let age = time::Duration::try_from(event.at.elapsed()).unwrap_or(time::Duration::ZERO);
        (OffsetDateTime::now_utc() - age).to_offset(self.offset)
    }

    fn format(&self, event: &KeyEvent<char>) -> String {
        let format = format_description!("[hour]:[minute]:[second].[subsecond digits:3]");
        let stamp = self
            .timestamp(event)
            .format(format)
            .unwrap_or_else(|_| String::from("??:??:??.???"));
        format!("[{}] Key pressed: {}", stamp, event.key)
    }
}

impl KeySink<char> for ConsoleSink {
    fn key_pressed(&mut self, event: KeyEvent<char>) {
        let line = self.format(&event);
        info!("{}", line);

        let mut stdout = std::io::stdout().lock();
        if let Err(err) = writeln!(stdout, "{}", line).and_then(|()| stdout.flush()) {
            warn!("Failed to print key press: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn line_names_the_key() {
        let sink = ConsoleSink { offset: UtcOffset::UTC };
        let line = sink.format(&KeyEvent { key: '#', at: Instant::now() });

        assert!(line.ends_with("] Key pressed: #"), "{line}");
        // "[HH:MM:SS.mmm]"
        assert_eq!(line.find(']'), Some(13));
    }
}
