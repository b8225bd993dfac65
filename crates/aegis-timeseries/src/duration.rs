//! Aegis Time Series Durations
//!
//! Durations for policies and bucketing. A `TimeValue` is either a fixed
//! number of milliseconds or a number of calendar months; month-based values
//! are applied on the calendar since month lengths vary. `RangeGroup` turns a
//! `TimeValue` into bucket boundaries.
//!
//! Key Features:
//! - Textual form such as `1s`, `30 min`, `2 hours`, `3 months`, `1y`
//! - Calendar-aware add and subtract for month, quarter and year values
//! - Bucket start and next-bucket computation for aggregation
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use aegis_common::utils::{from_millis, max_millis, min_millis};
use aegis_common::{AegisError, Result};
use chrono::{DateTime, Datelike, Months, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

// =============================================================================
// Constants
// =============================================================================

const MS_PER_SECOND: i64 = 1_000;
const MS_PER_MINUTE: i64 = 60 * MS_PER_SECOND;
const MS_PER_HOUR: i64 = 60 * MS_PER_MINUTE;
const MS_PER_DAY: i64 = 24 * MS_PER_HOUR;

/// Average Gregorian month, used only to order month values against fixed ones.
const APPROX_MS_PER_MONTH: i64 = 2_629_746_000;

/// Largest month count accepted (ten thousand years).
pub const MAX_MONTHS: i64 = 120_000;

// =============================================================================
// Time Value
// =============================================================================

/// Unit of a `TimeValue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeUnit {
    Milliseconds,
    Months,
}

/// A fixed or calendar duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeValue {
    pub value: i64,
    pub unit: TimeUnit,
}

impl TimeValue {
    pub const ZERO: TimeValue = TimeValue {
        value: 0,
        unit: TimeUnit::Milliseconds,
    };

    /// Effectively unlimited.
    pub const INFINITE: TimeValue = TimeValue {
        value: i64::MAX,
        unit: TimeUnit::Milliseconds,
    };

    pub fn from_millis(ms: i64) -> Self {
        Self {
            value: ms,
            unit: TimeUnit::Milliseconds,
        }
    }

    pub fn from_seconds(seconds: i64) -> Self {
        Self::from_millis(seconds.saturating_mul(MS_PER_SECOND))
    }

    pub fn from_minutes(minutes: i64) -> Self {
        Self::from_millis(minutes.saturating_mul(MS_PER_MINUTE))
    }

    pub fn from_hours(hours: i64) -> Self {
        Self::from_millis(hours.saturating_mul(MS_PER_HOUR))
    }

    pub fn from_days(days: i64) -> Self {
        Self::from_millis(days.saturating_mul(MS_PER_DAY))
    }

    pub fn from_months(months: i64) -> Self {
        Self {
            value: months,
            unit: TimeUnit::Months,
        }
    }

    pub fn from_years(years: i64) -> Self {
        Self::from_months(years.saturating_mul(12))
    }

    pub fn is_infinite(&self) -> bool {
        *self == Self::INFINITE
    }

    pub fn is_positive(&self) -> bool {
        self.value > 0
    }

    pub fn is_months(&self) -> bool {
        self.unit == TimeUnit::Months
    }

    /// Milliseconds for fixed values, an average for month values.
    pub fn approximate_millis(&self) -> i64 {
        match self.unit {
            TimeUnit::Milliseconds => self.value,
            TimeUnit::Months => self.value.saturating_mul(APPROX_MS_PER_MONTH),
        }
    }

    /// `time + self`, saturating at the representable bounds.
    pub fn add_to(&self, time: DateTime<Utc>) -> DateTime<Utc> {
        if self.is_infinite() {
            return DateTime::<Utc>::MAX_UTC;
        }
        match self.unit {
            TimeUnit::Milliseconds => from_millis(time.timestamp_millis().saturating_add(self.value)),
            TimeUnit::Months => shift_months(time, self.value),
        }
    }

    /// `time - self`, saturating at the representable bounds.
    pub fn subtract_from(&self, time: DateTime<Utc>) -> DateTime<Utc> {
        if self.is_infinite() {
            return DateTime::<Utc>::MIN_UTC;
        }
        match self.unit {
            TimeUnit::Milliseconds => from_millis(time.timestamp_millis().saturating_sub(self.value)),
            TimeUnit::Months => shift_months(time, -self.value),
        }
    }

    pub fn add_to_millis(&self, ms: i64) -> i64 {
        match self.unit {
            TimeUnit::Milliseconds if !self.is_infinite() => ms.saturating_add(self.value),
            _ => self.add_to(from_millis(ms)).timestamp_millis(),
        }
    }

    pub fn subtract_from_millis(&self, ms: i64) -> i64 {
        match self.unit {
            TimeUnit::Milliseconds if !self.is_infinite() => ms.saturating_sub(self.value),
            _ => self.subtract_from(from_millis(ms)).timestamp_millis(),
        }
    }
}

fn shift_months(time: DateTime<Utc>, months: i64) -> DateTime<Utc> {
    let shifted = match u32::try_from(months.unsigned_abs()) {
        Ok(n) if months >= 0 => time.checked_add_months(Months::new(n)),
        Ok(n) => time.checked_sub_months(Months::new(n)),
        Err(_) => None,
    };
    shifted.unwrap_or(if months >= 0 {
        DateTime::<Utc>::MAX_UTC
    } else {
        DateTime::<Utc>::MIN_UTC
    })
}

impl PartialOrd for TimeValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.is_infinite(), other.is_infinite()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            _ if self.unit == other.unit => self.value.cmp(&other.value),
            _ => self
                .approximate_millis()
                .cmp(&other.approximate_millis())
                .then((self.unit == TimeUnit::Months).cmp(&(other.unit == TimeUnit::Months))),
        }
    }
}

// -----------------------------------------------------------------------------
// Text Form
// -----------------------------------------------------------------------------

impl fmt::Display for TimeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_infinite() {
            return write!(f, "infinite");
        }
        match self.unit {
            TimeUnit::Months if self.value % 12 == 0 && self.value != 0 => {
                write!(f, "{}y", self.value / 12)
            }
            TimeUnit::Months => write!(f, "{}mon", self.value),
            TimeUnit::Milliseconds => {
                let v = self.value;
                if v != 0 && v % MS_PER_DAY == 0 {
                    write!(f, "{}d", v / MS_PER_DAY)
                } else if v != 0 && v % MS_PER_HOUR == 0 {
                    write!(f, "{}h", v / MS_PER_HOUR)
                } else if v != 0 && v % MS_PER_MINUTE == 0 {
                    write!(f, "{}min", v / MS_PER_MINUTE)
                } else if v != 0 && v % MS_PER_SECOND == 0 {
                    write!(f, "{}s", v / MS_PER_SECOND)
                } else {
                    write!(f, "{}ms", v)
                }
            }
        }
    }
}

impl FromStr for TimeValue {
    type Err = AegisError;

    fn from_str(s: &str) -> Result<Self> {
        let text = s.trim().to_lowercase();
        if matches!(text.as_str(), "infinite" | "infinity" | "forever") {
            return Ok(Self::INFINITE);
        }

        let split = text
            .find(|c: char| !c.is_ascii_digit() && c != '-')
            .unwrap_or(text.len());
        let (amount, unit) = text.split_at(split);
        let amount: i64 = amount
            .trim()
            .parse()
            .map_err(|_| AegisError::InvalidArgument(format!("invalid duration '{}'", s)))?;
        let unit = unit.trim();

        let (factor, months) = match unit {
            "ms" | "milli" | "millis" | "millisecond" | "milliseconds" => (1, false),
            "" | "s" | "sec" | "secs" | "second" | "seconds" => (MS_PER_SECOND, false),
            "m" | "min" | "mins" | "minute" | "minutes" => (MS_PER_MINUTE, false),
            "h" | "hour" | "hours" => (MS_PER_HOUR, false),
            "d" | "day" | "days" => (MS_PER_DAY, false),
            "w" | "week" | "weeks" => (7 * MS_PER_DAY, false),
            "mon" | "month" | "months" => (1, true),
            "q" | "quarter" | "quarters" => (3, true),
            "y" | "year" | "years" => (12, true),
            _ => {
                return Err(AegisError::InvalidArgument(format!(
                    "unknown duration unit '{}' in '{}'",
                    unit, s
                )))
            }
        };
        let scaled = amount
            .checked_mul(factor)
            .filter(|v| *v != i64::MAX && *v != i64::MIN)
            .ok_or_else(|| AegisError::InvalidArgument(format!("duration '{}' is out of range", s)))?;
        let value = if months {
            Self::from_months(scaled)
        } else {
            Self::from_millis(scaled)
        };
        if value.unit == TimeUnit::Months && value.value.abs() > MAX_MONTHS {
            return Err(AegisError::InvalidArgument(format!(
                "duration '{}' exceeds {} months",
                s, MAX_MONTHS
            )));
        }
        Ok(value)
    }
}

impl Serialize for TimeValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TimeValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Range Group
// =============================================================================

/// Bucketing of the time line into consecutive ranges of one `TimeValue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeGroup {
    step: TimeValue,
}

impl RangeGroup {
    pub fn new(step: TimeValue) -> Result<Self> {
        if !step.is_positive() || step.is_infinite() {
            return Err(AegisError::InvalidArgument(format!(
                "range step must be positive and finite, got {}",
                step
            )));
        }
        Ok(Self { step })
    }

    pub fn step(&self) -> TimeValue {
        self.step
    }

    /// Start (ms) of the range holding `timestamp_ms`.
    pub fn range_start(&self, timestamp_ms: i64) -> i64 {
        match self.step.unit {
            TimeUnit::Milliseconds => timestamp_ms.div_euclid(self.step.value) * self.step.value,
            TimeUnit::Months => {
                let time = from_millis(timestamp_ms);
                let total = time.year() as i64 * 12 + time.month0() as i64;
                let start = total.div_euclid(self.step.value) * self.step.value;
                month_start(start)
                    .map(|t| t.timestamp_millis())
                    .unwrap_or_else(min_millis)
            }
        }
    }

    /// Start (ms) of the range following the one starting at `range_start_ms`.
    pub fn next_range_start(&self, range_start_ms: i64) -> i64 {
        match self.step.unit {
            TimeUnit::Milliseconds => range_start_ms.saturating_add(self.step.value),
            TimeUnit::Months => {
                let next = self.step.add_to(from_millis(range_start_ms));
                if next == DateTime::<Utc>::MAX_UTC {
                    max_millis()
                } else {
                    next.timestamp_millis()
                }
            }
        }
    }

    /// Start (ms) of the range after the one holding `timestamp_ms`.
    pub fn next_after(&self, timestamp_ms: i64) -> i64 {
        self.next_range_start(self.range_start(timestamp_ms))
    }
}

fn month_start(total_months: i64) -> Option<DateTime<Utc>> {
    let year = i32::try_from(total_months.div_euclid(12)).ok()?;
    let month = total_months.rem_euclid(12) as u32 + 1;
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()
}

// =============================================================================
// Tests
// =============================================================================
