//! CD-1.1 Julian timestamps.
//!
//! Timestamps travel as 20 ASCII characters, `yyyyddd hh:mm:ss.mmm`, where `ddd`
//! is the one-based day of the year. Internally they are milliseconds since the
//! Unix epoch.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::DecodeError;

/// Width of the textual timestamp on the wire.
pub const TIMESTAMP_LEN: usize = 20;

const MS_PER_DAY: i64 = 86_400_000;

/// A millisecond-resolution UTC instant representable as a CD-1.1 timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JulianTimestamp {
    unix_millis: i64,
}

impl JulianTimestamp {
    /// 0000001 00:00:00.000
    pub const MIN: Self = Self { unix_millis: -62_167_219_200_000 };
    /// 9999365 23:59:59.999
    pub const MAX: Self = Self { unix_millis: 253_402_300_799_999 };
    pub const UNIX_EPOCH: Self = Self { unix_millis: 0 };

    /// Build from milliseconds since the Unix epoch.
    ///
    /// Returns `None` outside the four-digit-year range the wire format can carry.
    pub fn from_unix_millis(unix_millis: i64) -> Option<Self> {
        (Self::MIN.unix_millis..=Self::MAX.unix_millis)
            .contains(&unix_millis)
            .then_some(Self { unix_millis })
    }

    pub fn unix_millis(&self) -> i64 {
        self.unix_millis
    }

    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();
        Self { unix_millis: millis.min(Self::MAX.unix_millis) }
    }

    /// Add a duration, saturating at [`JulianTimestamp::MAX`].
    pub fn saturating_add(&self, duration: Duration) -> Self {
        let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        Self { unix_millis: self.unix_millis.saturating_add(millis).min(Self::MAX.unix_millis) }
    }

    /// Parse the 20-character wire representation.
    pub fn parse(text: &str) -> Result<Self, DecodeError> {
        let malformed = |details: &str| DecodeError::malformed("timestamp", format!("{details}: {text:?}"));

        let bytes = text.as_bytes();
        if bytes.len() != TIMESTAMP_LEN || !text.is_ascii() {
            return Err(malformed("expected 20 ASCII characters"));
        }
        if bytes[7] != b' ' || bytes[10] != b':' || bytes[13] != b':' || bytes[16] != b'.' {
            return Err(malformed("bad separators"));
        }

        let field = |range: std::ops::Range<usize>| -> Result<i64, DecodeError> {
            let digits = &text[range];
            if !digits.bytes().all(|b| b.is_ascii_digit()) {
                return Err(malformed("non-digit field"));
            }
            digits.parse::<i64>().map_err(|_| malformed("non-digit field"))
        };

        let year = field(0..4)?;
        let day_of_year = field(4..7)?;
        let hour = field(8..10)?;
        let minute = field(11..13)?;
        let second = field(14..16)?;
        let millis = field(17..20)?;

        if day_of_year < 1 || day_of_year > days_in_year(year) {
            return Err(malformed("day of year out of range"));
        }
        if hour > 23 || minute > 59 || second > 59 {
            return Err(malformed("time of day out of range"));
        }

        let days = days_from_civil(year, 1, 1) + day_of_year - 1;
        let unix_millis =
            days * MS_PER_DAY + ((hour * 60 + minute) * 60 + second) * 1000 + millis;
        Ok(Self { unix_millis })
    }
}

impl fmt::Display for JulianTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let days = self.unix_millis.div_euclid(MS_PER_DAY);
        let in_day = self.unix_millis.rem_euclid(MS_PER_DAY);
        let (year, _, _) = civil_from_days(days);
        let day_of_year = days - days_from_civil(year, 1, 1) + 1;

        let millis = in_day % 1000;
        let seconds = in_day / 1000;
        write!(
            f,
            "{:04}{:03} {:02}:{:02}:{:02}.{:03}",
            year,
            day_of_year,
            seconds / 3600,
            (seconds / 60) % 60,
            seconds % 60,
            millis
        )
    }
}

impl Default for JulianTimestamp {
    fn default() -> Self {
        Self::UNIX_EPOCH
    }
}

fn is_leap(year: i64) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

fn days_in_year(year: i64) -> i64 {
    if is_leap(year) { 366 } else { 365 }
}

// Proleptic Gregorian day counting relative to 1970-01-01.
fn days_from_civil(year: i64, month: i64, day: i64) -> i64 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = y.div_euclid(400);
    let yoe = y - era * 400;
    let mp = (month + 9) % 12;
    let doy = (153 * mp + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

fn civil_from_days(days: i64) -> (i64, i64, i64) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}
