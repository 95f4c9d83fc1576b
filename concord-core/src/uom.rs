//! Units of measure and measured quantities.
//!
//! A [`Measured`] value is a number paired with a [`Unit`]. Units of the same
//! [`Dimension`] convert into each other through their scale relative to the
//! dimension's base unit.

use std::fmt;
use std::str::FromStr;

/// Physical or logical dimension a unit measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dimension {
    Storage,
    Time,
    Frequency,
}

/// A unit of measure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Unit {
    symbol: &'static str,
    dimension: Dimension,
    /// Number of base units in one of this unit.
    scale: f64,
}

impl Unit {
    pub const BYTE: Unit = Unit::new("B", Dimension::Storage, 1.0);
    pub const KILOBYTE: Unit = Unit::new("KB", Dimension::Storage, 1024.0);
    pub const MEGABYTE: Unit = Unit::new("MB", Dimension::Storage, 1024.0 * 1024.0);
    pub const GIGABYTE: Unit = Unit::new("GB", Dimension::Storage, 1024.0 * 1024.0 * 1024.0);
    pub const TERABYTE: Unit =
        Unit::new("TB", Dimension::Storage, 1024.0 * 1024.0 * 1024.0 * 1024.0);

    pub const MILLISECOND: Unit = Unit::new("ms", Dimension::Time, 1.0);
    pub const SECOND: Unit = Unit::new("s", Dimension::Time, 1_000.0);
    pub const MINUTE: Unit = Unit::new("min", Dimension::Time, 60_000.0);
    pub const HOUR: Unit = Unit::new("h", Dimension::Time, 3_600_000.0);
    pub const DAY: Unit = Unit::new("d", Dimension::Time, 86_400_000.0);

    pub const HERTZ: Unit = Unit::new("Hz", Dimension::Frequency, 1.0);
    pub const MEGAHERTZ: Unit = Unit::new("MHz", Dimension::Frequency, 1_000_000.0);
    pub const GIGAHERTZ: Unit = Unit::new("GHz", Dimension::Frequency, 1_000_000_000.0);

    const ALL: [Unit; 13] = [
        Unit::BYTE,
        Unit::KILOBYTE,
        Unit::MEGABYTE,
        Unit::GIGABYTE,
        Unit::TERABYTE,
        Unit::MILLISECOND,
        Unit::SECOND,
        Unit::MINUTE,
        Unit::HOUR,
        Unit::DAY,
        Unit::HERTZ,
        Unit::MEGAHERTZ,
        Unit::GIGAHERTZ,
    ];

    pub const fn new(symbol: &'static str, dimension: Dimension, scale: f64) -> Self {
        Self {
            symbol,
            dimension,
            scale,
        }
    }

    pub fn symbol(&self) -> &'static str {
        self.symbol
    }

    pub fn dimension(&self) -> Dimension {
        self.dimension
    }

    /// Look up a built-in unit by symbol (case-sensitive first, then case-insensitive).
    pub fn from_symbol(symbol: &str) -> Option<Unit> {
        Self::ALL
            .iter()
            .find(|u| u.symbol == symbol)
            .or_else(|| Self::ALL.iter().find(|u| u.symbol.eq_ignore_ascii_case(symbol)))
            .copied()
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol)
    }
}

/// A quantity expressed in a unit of measure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measured {
    value: f64,
    unit: Unit,
}

impl Measured {
    pub fn new(value: f64, unit: Unit) -> Self {
        Self { value, unit }
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn unit(&self) -> Unit {
        self.unit
    }

    /// Convert into another unit of the same dimension.
    ///
    /// Returns `None` when the dimensions differ.
    pub fn convert_to(&self, target: Unit) -> Option<Measured> {
        if self.unit.dimension != target.dimension {
            return None;
        }
        if self.unit == target {
            return Some(*self);
        }
        Some(Measured::new(
            self.value * self.unit.scale / target.scale,
            target,
        ))
    }
}

impl fmt::Display for Measured {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.value, self.unit.symbol)
    }
}

/// Error parsing a measured quantity from text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseMeasuredError(pub String);

impl fmt::Display for ParseMeasuredError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ParseMeasuredError {}

impl FromStr for Measured {
    type Err = ParseMeasuredError;

    /// Parses `"<number><unit>"` or `"<number> <unit>"`, e.g. `"2.5GB"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let split = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+' || c == 'e' || c == 'E'))
            .ok_or_else(|| ParseMeasuredError(format!("missing unit in {s:?}")))?;
        let (number, unit) = s.split_at(split);
        let value: f64 = number
            .trim()
            .parse()
            .map_err(|_| ParseMeasuredError(format!("invalid quantity {number:?}")))?;
        let unit = Unit::from_symbol(unit.trim())
            .ok_or_else(|| ParseMeasuredError(format!("unknown unit {:?}", unit.trim())))?;
        Ok(Measured::new(value, unit))
    }
}
