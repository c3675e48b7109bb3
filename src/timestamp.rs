//! Timestamp conversions for the encodings containers store.
//!
//! Items carry modification times as Unix seconds. Containers store them as
//! Unix seconds (tar, ar, SquashFS, PE headers), Windows FILETIME (RAR 5)
//! or packed MS-DOS date/time (cabinet). [`Timestamp`] normalizes all of
//! them.
//!
//! # Example
//!
//! ```rust
//! use arkiv::Timestamp;
//!
//! // 2024-03-01 12:30:10 as MS-DOS date and time words.
//! let ts = Timestamp::from_dos(0x5861, 0x63C5).unwrap();
//! assert_eq!(ts.as_unix_secs(), 1_709_296_210);
//! ```

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Windows FILETIME epoch: January 1, 1601 (UTC)
/// Difference from Unix epoch (January 1, 1970) in 100-nanosecond intervals.
const FILETIME_UNIX_DIFF: u64 = 116444736000000000;

/// Number of 100-nanosecond intervals per second.
const INTERVALS_PER_SECOND: u64 = 10_000_000;

/// A point in time with 100-nanosecond precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    /// Raw FILETIME value (100-nanosecond intervals since 1601-01-01)
    filetime: u64,
}

impl Timestamp {
    /// Creates a timestamp from a raw Windows FILETIME value.
    #[inline]
    pub const fn from_filetime(filetime: u64) -> Self {
        Self { filetime }
    }

    /// Creates a timestamp from Unix seconds.
    ///
    /// Returns `None` if the timestamp would overflow.
    pub fn from_unix_secs(secs: i64) -> Option<Self> {
        if secs < 0 {
            let intervals = secs.unsigned_abs().checked_mul(INTERVALS_PER_SECOND)?;
            FILETIME_UNIX_DIFF
                .checked_sub(intervals)
                .map(Self::from_filetime)
        } else {
            let intervals = (secs as u64).checked_mul(INTERVALS_PER_SECOND)?;
            FILETIME_UNIX_DIFF
                .checked_add(intervals)
                .map(Self::from_filetime)
        }
    }

    /// Creates a timestamp from MS-DOS date and time words (local time,
    /// taken as UTC, two-second resolution).
    ///
    /// Returns `None` for impossible dates such as month 0.
    pub fn from_dos(date: u16, time: u16) -> Option<Self> {
        let year = 1980 + i64::from(date >> 9);
        let month = u32::from((date >> 5) & 0x0F);
        let day = u32::from(date & 0x1F);
        let hour = i64::from(time >> 11);
        let minute = i64::from((time >> 5) & 0x3F);
        let second = i64::from(time & 0x1F) * 2;
        if !(1..=12).contains(&month) || day == 0 || hour > 23 || minute > 59 || second > 59 {
            return None;
        }
        let days = days_from_civil(year, month, day);
        Self::from_unix_secs(days * 86_400 + hour * 3_600 + minute * 60 + second)
    }

    /// Returns the raw FILETIME value.
    pub const fn as_filetime(&self) -> u64 {
        self.filetime
    }

    /// Returns the timestamp as Unix seconds, rounding towards negative
    /// infinity before the epoch.
    pub fn as_unix_secs(&self) -> i64 {
        if self.filetime >= FILETIME_UNIX_DIFF {
            ((self.filetime - FILETIME_UNIX_DIFF) / INTERVALS_PER_SECOND) as i64
        } else {
            let intervals = FILETIME_UNIX_DIFF - self.filetime;
            -(intervals.div_ceil(INTERVALS_PER_SECOND) as i64)
        }
    }

    /// Converts to a [`SystemTime`].
    pub fn as_system_time(&self) -> SystemTime {
        if self.filetime >= FILETIME_UNIX_DIFF {
            let intervals = self.filetime - FILETIME_UNIX_DIFF;
            UNIX_EPOCH
                + Duration::new(
                    intervals / INTERVALS_PER_SECOND,
                    ((intervals % INTERVALS_PER_SECOND) * 100) as u32,
                )
        } else {
            let intervals = FILETIME_UNIX_DIFF - self.filetime;
            UNIX_EPOCH
                - Duration::new(
                    intervals / INTERVALS_PER_SECOND,
                    ((intervals % INTERVALS_PER_SECOND) * 100) as u32,
                )
        }
    }
}

/// Days since 1970-01-01 for a proleptic Gregorian date.
fn days_from_civil(year: i64, month: u32, day: u32) -> i64 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = y.div_euclid(400);
    let yoe = y - era * 400;
    let m = i64::from(month);
    let doy = (153 * (if m > 2 { m - 3 } else { m + 9 }) + 2) / 5 + i64::from(day) - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_epoch() {
        let ts = Timestamp::from_filetime(FILETIME_UNIX_DIFF);
        assert_eq!(ts.as_unix_secs(), 0);
        assert_eq!(ts.as_system_time(), UNIX_EPOCH);
    }

    #[test]
    fn test_from_unix_secs() {
        let ts = Timestamp::from_unix_secs(1_700_000_000).unwrap();
        assert_eq!(ts.as_unix_secs(), 1_700_000_000);
        let ts = Timestamp::from_unix_secs(-3600).unwrap();
        assert_eq!(ts.as_unix_secs(), -3600);
    }

    #[test]
    fn test_before_epoch_rounds_down() {
        let ts = Timestamp::from_filetime(FILETIME_UNIX_DIFF - 1);
        assert_eq!(ts.as_unix_secs(), -1);
    }

    #[test]
    fn test_dos_dates() {
        // 1980-01-01 00:00:00
        let ts = Timestamp::from_dos(0x0021, 0).unwrap();
        assert_eq!(ts.as_unix_secs(), 315_532_800);
        assert!(Timestamp::from_dos(0, 0).is_none());
        assert!(Timestamp::from_dos(0x0021, 24 << 11).is_none());
    }

    #[test]
    fn test_days_from_civil() {
        assert_eq!(days_from_civil(1970, 1, 1), 0);
        assert_eq!(days_from_civil(2000, 3, 1), 11_017);
    }
}
