//! Cached wall-clock formatter for log line timestamps.
//!
//! Rendering a full `YYYY-MM-DD HH:MM:SS` through the formatter on every
//! line is needless work when thousands of lines share a second. The cache
//! re-renders only the two seconds digits until the minute rolls over, and
//! recomputes the whole stamp from the calendar only then.

use std::io::{Cursor, Write};
use std::str;

use chrono::{Datelike, Local, Timelike};

const STAMP_LEN: usize = 19; // "YYYY-MM-DD HH:MM:SS"

#[derive(Debug)]
pub(crate) struct Clock {
    acc_sec: i64,
    acc_min: i64,
    year: i32,
    mon: u32,
    day: u32,
    buf: [u8; STAMP_LEN],
}

impl Clock {
    pub(crate) fn new() -> Self {
        let mut clock = Self {
            acc_sec: 0,
            acc_min: 0,
            year: 0,
            mon: 0,
            day: 0,
            buf: [b'0'; STAMP_LEN],
        };
        clock.render_full();
        clock
    }

    /// Returns epoch seconds, sub-second milliseconds, and the cached
    /// formatted stamp for the current instant.
    pub(crate) fn stamp(&mut self) -> (i64, u32, &str) {
        let now = Local::now();
        let secs = now.timestamp();
        let millis = now.timestamp_subsec_millis();

        if secs != self.acc_sec {
            if secs / 60 != self.acc_min {
                self.acc_sec = secs;
                self.acc_min = secs / 60;
                self.render_full();
            } else {
                self.acc_sec = secs;
                self.patch_seconds(now.second());
            }
        }

        (secs, millis, self.stamp_str())
    }

    /// Calendar date of the last rendered stamp, for file naming.
    pub(crate) fn date(&self) -> (i32, u32, u32) {
        (self.year, self.mon, self.day)
    }

    fn render_full(&mut self) {
        let now = Local::now();
        self.acc_sec = now.timestamp();
        self.acc_min = self.acc_sec / 60;
        self.year = now.year();
        self.mon = now.month();
        self.day = now.day();

        let mut cursor = Cursor::new(&mut self.buf[..]);
        // 19 bytes exactly; the write cannot fail on a correct format
        let _ = write!(
            cursor,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            self.year,
            self.mon,
            self.day,
            now.hour(),
            now.minute(),
            now.second()
        );
    }

    fn patch_seconds(&mut self, sec: u32) {
        self.buf[17] = b'0' + (sec / 10) as u8;
        self.buf[18] = b'0' + (sec % 10) as u8;
    }

    fn stamp_str(&self) -> &str {
        // SAFETY: buf only ever holds ASCII digits, dashes, colons and a space.
        unsafe { str::from_utf8_unchecked(&self.buf) }
    }
}

#[cfg(test)]
mod test {
    use super::Clock;

    #[test]
    fn stamp_has_expected_shape() {
        let mut clock = Clock::new();
        let (_, millis, stamp) = clock.stamp();
        assert_eq!(19, stamp.len());
        assert_eq!(b'-', stamp.as_bytes()[4]);
        assert_eq!(b'-', stamp.as_bytes()[7]);
        assert_eq!(b' ', stamp.as_bytes()[10]);
        assert_eq!(b':', stamp.as_bytes()[13]);
        assert_eq!(b':', stamp.as_bytes()[16]);
        assert!(millis < 1000);
    }

    #[test]
    fn repeated_stamps_are_monotonic_in_seconds() {
        let mut clock = Clock::new();
        let (first, _, _) = clock.stamp();
        let (second, _, _) = clock.stamp();
        assert!(second >= first);
    }

    #[test]
    fn seconds_patch_writes_two_digits() {
        let mut clock = Clock::new();
        clock.patch_seconds(7);
        assert_eq!("07", &clock.stamp_str()[17..19]);
        clock.patch_seconds(42);
        assert_eq!("42", &clock.stamp_str()[17..19]);
    }

    #[test]
    fn date_matches_rendered_stamp() {
        let mut clock = Clock::new();
        let stamp = clock.stamp().2.to_owned();
        let (year, mon, day) = clock.date();
        assert_eq!(format!("{year:04}-{mon:02}-{day:02}"), &stamp[..10]);
    }
}
