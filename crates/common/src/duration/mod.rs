//! Query lifetime durations
//!
//! Lifetimes travel over the wire as human-readable strings such as `1h1m0s`,
//! `15s` or `250ms`, and are stored as a signed nanosecond count. Decoding also
//! accepts a bare JSON number of nanoseconds.

use crate::errors::{AppError, Result};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

const NANOSECOND: u64 = 1;
const MICROSECOND: u64 = 1_000 * NANOSECOND;
const MILLISECOND: u64 = 1_000 * MICROSECOND;
const SECOND: u64 = 1_000 * MILLISECOND;
const MINUTE: u64 = 60 * SECOND;
const HOUR: u64 = 60 * MINUTE;

/// Largest magnitude a negative lifetime can carry (`|i64::MIN|`)
const MAX_MAGNITUDE: u64 = 1 << 63;

/// Maximum age of a cached artifact, in nanoseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lifetime(i64);

impl Lifetime {
    pub const ZERO: Lifetime = Lifetime(0);

    pub const fn from_nanos(nanos: i64) -> Self {
        Lifetime(nanos)
    }

    pub const fn from_secs(secs: i64) -> Self {
        Lifetime(secs.saturating_mul(SECOND as i64))
    }

    pub const fn as_nanos(&self) -> i64 {
        self.0
    }

    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Whole milliseconds, rounded up so a non-zero lifetime never truncates to zero
    pub fn as_millis_ceil(&self) -> u64 {
        let nanos = self.0.max(0) as u64;
        nanos.div_ceil(MILLISECOND)
    }

    /// Convert to a chrono delta for timestamp arithmetic
    pub fn as_time_delta(&self) -> chrono::TimeDelta {
        chrono::TimeDelta::nanoseconds(self.0)
    }

    /// Parse the human-readable form, e.g. `1h15m30.5s`, `-2ms`, `0`
    pub fn parse(input: &str) -> Result<Self> {
        parse_duration(input).ok_or_else(|| AppError::InvalidDuration {
            input: input.to_string(),
        })
    }
}

impl From<std::time::Duration> for Lifetime {
    fn from(d: std::time::Duration) -> Self {
        Lifetime(i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
    }
}

impl FromStr for Lifetime {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        Lifetime::parse(s)
    }
}

impl fmt::Display for Lifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut u = self.0.unsigned_abs();
        if self.0 < 0 {
            f.write_str("-")?;
        }

        if u < SECOND {
            // Sub-second values use the largest unit that keeps the integer part non-zero
            let (unit, precision) = match u {
                0 => return f.write_str("0s"),
                n if n < MICROSECOND => ("ns", 0),
                n if n < MILLISECOND => ("µs", 3),
                _ => ("ms", 6),
            };
            let (whole, frac) = split_fraction(u, precision);
            return write!(f, "{}{}{}", whole, frac, unit);
        }

        let (secs, frac) = split_fraction(u, 9);
        u = secs / 60;
        if u > 0 {
            let hours = u / 60;
            if hours > 0 {
                write!(f, "{}h", hours)?;
            }
            write!(f, "{}m", u % 60)?;
        }
        write!(f, "{}{}s", secs % 60, frac)
    }
}

/// Split `v` into `v / 10^precision` and a trimmed `.ddd` fraction (empty when zero)
fn split_fraction(v: u64, precision: u32) -> (u64, String) {
    let scale = 10u64.pow(precision);
    let frac = v % scale;
    if frac == 0 {
        return (v / scale, String::new());
    }
    let digits = format!("{:0width$}", frac, width = precision as usize);
    (v / scale, format!(".{}", digits.trim_end_matches('0')))
}

fn unit_nanos(unit: &str) -> Option<u64> {
    match unit {
        "ns" => Some(NANOSECOND),
        "us" | "µs" | "μs" => Some(MICROSECOND),
        "ms" => Some(MILLISECOND),
        "s" => Some(SECOND),
        "m" => Some(MINUTE),
        "h" => Some(HOUR),
        _ => None,
    }
}

/// Consume leading ASCII digits as an integer; `None` on overflow
fn leading_int(s: &str) -> Option<(u64, &str)> {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let mut value: u64 = 0;
    for b in s[..end].bytes() {
        value = value.checked_mul(10)?.checked_add(u64::from(b - b'0'))?;
        if value > MAX_MAGNITUDE {
            return None;
        }
    }
    Some((value, &s[end..]))
}

/// Consume leading fraction digits, returning (digits, scale, rest). Digits past
/// u64 precision are consumed but ignored.
fn leading_fraction(s: &str) -> (u64, u64, &str) {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let mut value: u64 = 0;
    let mut scale: u64 = 1;
    let mut overflow = false;
    for b in s[..end].bytes() {
        if overflow {
            continue;
        }
        match value
            .checked_mul(10)
            .and_then(|v| v.checked_add(u64::from(b - b'0')))
            .zip(scale.checked_mul(10))
        {
            Some((v, sc)) => {
                value = v;
                scale = sc;
            }
            None => overflow = true,
        }
    }
    (value, scale, &s[end..])
}

fn parse_duration(input: &str) -> Option<Lifetime> {
    let mut s = input;
    let mut negative = false;
    if let Some(rest) = s.strip_prefix('-') {
        negative = true;
        s = rest;
    } else if let Some(rest) = s.strip_prefix('+') {
        s = rest;
    }

    if s == "0" {
        return Some(Lifetime::ZERO);
    }
    if s.is_empty() {
        return None;
    }

    let mut total: u64 = 0;
    while !s.is_empty() {
        if !s.starts_with(|c: char| c == '.' || c.is_ascii_digit()) {
            return None;
        }

        let before = s.len();
        let (whole, rest) = leading_int(s)?;
        s = rest;
        let had_int = before != s.len();

        let mut frac = 0;
        let mut scale = 1;
        let mut had_frac = false;
        if let Some(rest) = s.strip_prefix('.') {
            let before = rest.len();
            let (f, sc, rest) = leading_fraction(rest);
            frac = f;
            scale = sc;
            s = rest;
            had_frac = before != s.len();
        }
        if !had_int && !had_frac {
            return None;
        }

        let unit_end = s
            .find(|c: char| c == '.' || c.is_ascii_digit())
            .unwrap_or(s.len());
        if unit_end == 0 {
            return None;
        }
        let unit = unit_nanos(&s[..unit_end])?;
        s = &s[unit_end..];

        let mut value = whole.checked_mul(unit)?;
        if frac > 0 {
            let extra = u128::from(frac) * u128::from(unit) / u128::from(scale);
            value = value.checked_add(u64::try_from(extra).ok()?)?;
        }
        total = total.checked_add(value)?;
        if total > MAX_MAGNITUDE {
            return None;
        }
    }

    if negative {
        return i64::try_from(-(total as i128)).ok().map(Lifetime);
    }
    i64::try_from(total).ok().map(Lifetime)
}

impl Serialize for Lifetime {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Accepted JSON shapes for a lifetime
#[derive(Deserialize)]
#[serde(untagged)]
enum RawLifetime {
    Nanos(i64),
    Float(f64),
    Text(String),
}

impl<'de> Deserialize<'de> for Lifetime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match RawLifetime::deserialize(deserializer)? {
            RawLifetime::Nanos(n) => Ok(Lifetime(n)),
            RawLifetime::Float(n) if n.is_finite() => Ok(Lifetime(n as i64)),
            RawLifetime::Float(n) => Err(de::Error::custom(format!("invalid duration {}", n))),
            RawLifetime::Text(text) => Lifetime::parse(&text).map_err(de::Error::custom),
        }
    }
}
