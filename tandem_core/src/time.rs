//! Simulation virtual time.
//!
//! [`Time`] is a signed 64-bit count in a compile-time power-of-ten base:
//! nanoseconds by default, picoseconds with the `fine-time` feature. The
//! sentinels [`Time::MIN`] and [`Time::MAX`] behave as infinities; addition
//! and subtraction saturate at the representable range so the sentinels
//! survive arithmetic in coordinator computations.

use std::{fmt::Display, time::Duration};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[cfg(not(feature = "fine-time"))]
const BASE_DIGITS: u32 = 9;
#[cfg(feature = "fine-time")]
const BASE_DIGITS: u32 = 12;

/// Base counts per second.
const COUNTS_PER_SECOND: i64 = 10_i64.pow(BASE_DIGITS);

/// Fixed-point simulation time.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Time(i64);

impl Time {
    pub const ZERO: Self = Self(0);
    /// The smallest positive increment of time (1 count in the base).
    pub const EPSILON: Self = Self(1);
    pub const MAX: Self = Self(i64::MAX);
    pub const MIN: Self = Self(i64::MIN);

    /// Construct from a raw count in the compile-time base.
    pub const fn from_count(count: i64) -> Self {
        Self(count)
    }

    /// The raw count in the compile-time base.
    pub const fn count(self) -> i64 {
        self.0
    }

    /// Construct from floating seconds, rounding half away from zero at the
    /// base resolution.
    pub fn from_seconds(seconds: f64) -> Self {
        Self((seconds * COUNTS_PER_SECOND as f64).round() as i64)
    }

    /// The time as floating seconds.
    pub fn seconds(self) -> f64 {
        self.0 as f64 / COUNTS_PER_SECOND as f64
    }

    /// Construct from an integer count of the given unit, rounding half away
    /// from zero when the unit is finer than the base.
    pub fn from_unit_count(count: i64, unit: TimeUnit) -> Self {
        let (num, den) = unit.seconds_ratio();
        let scaled = count as i128 * COUNTS_PER_SECOND as i128 * num as i128;
        Self(div_round(scaled, den as i128) as i64)
    }

    /// The count of whole units contained in this time (truncating).
    pub fn to_count(self, unit: TimeUnit) -> i64 {
        let (num, den) = unit.seconds_ratio();
        let scaled = self.0 as i128 * den as i128;
        (scaled / (COUNTS_PER_SECOND as i128 * num as i128)) as i64
    }

    pub const fn saturating_add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }

    pub const fn saturating_sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

/// Division rounding half away from zero.
fn div_round(value: i128, divisor: i128) -> i128 {
    let half = divisor / 2;
    if value >= 0 {
        (value + half) / divisor
    } else {
        (value - half) / divisor
    }
}

impl From<Duration> for Time {
    fn from(d: Duration) -> Self {
        #[cfg(not(feature = "fine-time"))]
        return Self(d.as_nanos() as i64);
        #[cfg(feature = "fine-time")]
        return Self((d.as_nanos() as i64).saturating_mul(1000));
    }
}

impl std::ops::Add for Time {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        self.saturating_add(rhs)
    }
}

impl std::ops::Sub for Time {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        self.saturating_sub(rhs)
    }
}

impl std::ops::Neg for Time {
    type Output = Self;

    fn neg(self) -> Self::Output {
        Self(self.0.saturating_neg())
    }
}

impl std::ops::AddAssign for Time {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl std::ops::SubAssign for Time {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl std::ops::Mul<i64> for Time {
    type Output = Self;

    fn mul(self, rhs: i64) -> Self::Output {
        Self(self.0.saturating_mul(rhs))
    }
}

impl std::ops::Mul<f64> for Time {
    type Output = Self;

    fn mul(self, rhs: f64) -> Self::Output {
        Self((self.0 as f64 * rhs).round() as i64)
    }
}

impl std::ops::Mul<Time> for i64 {
    type Output = Time;

    fn mul(self, rhs: Time) -> Self::Output {
        rhs * self
    }
}

impl std::ops::Mul<Time> for f64 {
    type Output = Time;

    fn mul(self, rhs: Time) -> Self::Output {
        rhs * self
    }
}

impl std::ops::Div<i64> for Time {
    type Output = Self;

    fn div(self, rhs: i64) -> Self::Output {
        Self(self.0 / rhs)
    }
}

impl std::ops::Div<f64> for Time {
    type Output = Self;

    fn div(self, rhs: f64) -> Self::Output {
        Self((self.0 as f64 / rhs).round() as i64)
    }
}

impl std::fmt::Debug for Time {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Time::MAX => write!(f, "Time(max)"),
            Time::MIN => write!(f, "Time(min)"),
            t => write!(f, "Time({})", t.seconds()),
        }
    }
}

impl Display for Time {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Time::MAX => write!(f, "max"),
            Time::MIN => write!(f, "min"),
            t => write!(f, "{}s", t.seconds()),
        }
    }
}

/// Units recognized in time strings and count conversions.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Picoseconds,
    Nanoseconds,
    Microseconds,
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
    Days,
    Weeks,
}

impl TimeUnit {
    /// The unit expressed as a rational number of seconds `(num, den)`.
    const fn seconds_ratio(self) -> (i64, i64) {
        match self {
            TimeUnit::Picoseconds => (1, 1_000_000_000_000),
            TimeUnit::Nanoseconds => (1, 1_000_000_000),
            TimeUnit::Microseconds => (1, 1_000_000),
            TimeUnit::Milliseconds => (1, 1_000),
            TimeUnit::Seconds => (1, 1),
            TimeUnit::Minutes => (60, 1),
            TimeUnit::Hours => (3_600, 1),
            TimeUnit::Days => (86_400, 1),
            TimeUnit::Weeks => (604_800, 1),
        }
    }

    /// Multiplier converting a count of this unit to seconds.
    pub fn second_multiplier(self) -> f64 {
        let (num, den) = self.seconds_ratio();
        num as f64 / den as f64
    }

    fn from_token(token: &str) -> Option<Self> {
        // The empty unit defaults to seconds.
        match token {
            "ps" => Some(TimeUnit::Picoseconds),
            "ns" => Some(TimeUnit::Nanoseconds),
            "us" => Some(TimeUnit::Microseconds),
            "ms" => Some(TimeUnit::Milliseconds),
            "" | "s" | "sec" | "second" | "seconds" => Some(TimeUnit::Seconds),
            "min" | "minute" | "minutes" => Some(TimeUnit::Minutes),
            "hr" | "hour" | "hours" => Some(TimeUnit::Hours),
            "day" | "days" => Some(TimeUnit::Days),
            "wk" | "week" | "weeks" => Some(TimeUnit::Weeks),
            _ => None,
        }
    }
}

impl std::str::FromStr for TimeUnit {
    type Err = TimeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_token(s)
            .or_else(|| Self::from_token(s.trim().to_ascii_lowercase().as_str()))
            .ok_or_else(|| TimeParseError::UnknownUnit(s.to_owned()))
    }
}

/// The error type for time string parsing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimeParseError {
    #[error("string does not start with a number: {0:?}")]
    InvalidNumber(String),

    #[error("unit {0:?} not recognized")]
    UnknownUnit(String),
}

/// Parse a time from a string such as `"1.234"`, `"1032ms"` or
/// `"10423425 ns"`. A bare number is interpreted as seconds.
pub fn parse_time(time_string: &str) -> Result<Time, TimeParseError> {
    parse_time_with_unit(time_string, TimeUnit::Seconds)
}

/// Parse a time from a string, applying `default_unit` when no unit suffix
/// is present.
pub fn parse_time_with_unit(
    time_string: &str,
    default_unit: TimeUnit,
) -> Result<Time, TimeParseError> {
    let trimmed = time_string.trim();
    let split = numeric_prefix_len(trimmed);
    if split == 0 {
        return Err(TimeParseError::InvalidNumber(time_string.to_owned()));
    }
    let value: f64 = trimmed[..split]
        .parse()
        .map_err(|_| TimeParseError::InvalidNumber(time_string.to_owned()))?;
    let unit_str = trimmed[split..].trim();
    let unit = if unit_str.is_empty() {
        default_unit
    } else {
        unit_str.parse()?
    };
    Ok(Time::from_seconds(value * unit.second_multiplier()))
}

/// Length of the leading floating-point literal in `s`, 0 if there is none.
fn numeric_prefix_len(s: &str) -> usize {
    let bytes = s.as_bytes();
    let mut i = 0;
    if matches!(bytes.first(), Some(b'+' | b'-')) {
        i += 1;
    }
    let mut seen_digit = false;
    let mut seen_dot = false;
    while i < bytes.len() {
        match bytes[i] {
            b'0'..=b'9' => {
                seen_digit = true;
                i += 1;
            }
            b'.' if !seen_dot => {
                seen_dot = true;
                i += 1;
            }
            b'e' | b'E' if seen_digit => {
                let mut j = i + 1;
                if matches!(bytes.get(j), Some(b'+' | b'-')) {
                    j += 1;
                }
                if bytes.get(j).is_some_and(|b| b.is_ascii_digit()) {
                    i = j + 1;
                    while bytes.get(i).is_some_and(|b| b.is_ascii_digit()) {
                        i += 1;
                    }
                }
                break;
            }
            _ => break,
        }
    }
    if seen_digit {
        i
    } else {
        0
    }
}
