use std::fmt::{Display, Formatter};

use time::Duration;

use crate::ReaperError;

const GIB_PER_BYTE: f64 = 1.0 / 1_073_741_824.0;
const GIB_PER_KIB: f64 = 1.0 / 1_048_576.0;
const GIB_PER_MIB: f64 = 1.0 / 1_024.0;
const GIB_PER_TIB: f64 = 1_024.0;
const GIB_PER_PIB: f64 = 1_024.0 * 1_024.0;

/// Memory suffixes and their scale in gibibytes.
///
/// Checked in order, so every multi-character suffix sits ahead of the
/// single-character suffix it ends with.
const MEMORY_UNITS: &[(&str, f64)] = &[
    ("KB", GIB_PER_KIB),
    ("kB", GIB_PER_KIB),
    ("MB", GIB_PER_MIB),
    ("GB", 1.0),
    ("TB", GIB_PER_TIB),
    ("PB", GIB_PER_PIB),
    ("B", GIB_PER_BYTE),
    ("G", 1.0),
    ("T", GIB_PER_TIB),
    ("P", GIB_PER_PIB),
];

#[derive(Debug, Clone, Copy)]
enum DurationScale {
    /// Always below one second; the literal is validated but not scaled.
    SubMicrosecond,
    Microseconds(f64),
}

const DURATION_UNITS: &[(&str, DurationScale)] = &[
    ("ns", DurationScale::SubMicrosecond),
    ("us", DurationScale::Microseconds(1.0)),
    ("ms", DurationScale::Microseconds(1_000.0)),
    ("s", DurationScale::Microseconds(1_000_000.0)),
    ("m", DurationScale::Microseconds(60.0 * 1_000_000.0)),
    ("h", DurationScale::Microseconds(3_600.0 * 1_000_000.0)),
    ("d", DurationScale::Microseconds(86_400.0 * 1_000_000.0)),
];

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum UnitKind {
    Memory,
    Duration,
}

impl UnitKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Duration => "duration",
        }
    }
}

impl Display for UnitKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Converts a memory size such as `"512MB"` or `"1.5G"` into gibibytes.
///
/// Any value starting with `0` is reported as zero without looking at the
/// suffix.
///
/// # Errors
/// Returns [`ReaperError::UnrecognizedUnit`] when the suffix is not in the
/// unit table and [`ReaperError::InvalidNumber`] when the numeric part does
/// not parse.
pub fn convert_memory(value: &str) -> Result<f64, ReaperError> {
    let trimmed = value.trim();
    if trimmed.starts_with('0') {
        return Ok(0.0);
    }

    for (suffix, scale) in MEMORY_UNITS {
        if let Some(literal) = trimmed.strip_suffix(suffix) {
            return Ok(parse_literal(literal, value)? * scale);
        }
    }

    Err(ReaperError::UnrecognizedUnit {
        kind: UnitKind::Memory,
        value: value.to_string(),
    })
}

/// Converts a duration such as `"1.50s"` or `"3.2m"` into whole seconds.
///
/// The value is first rounded to microsecond resolution and then truncated
/// to whole seconds, so anything under one second yields `0`. Nanosecond
/// values are always `0`.
///
/// # Errors
/// Returns [`ReaperError::UnrecognizedUnit`] when the suffix is not in the
/// unit table and [`ReaperError::InvalidNumber`] when the numeric part does
/// not parse.
pub fn convert_duration(value: &str) -> Result<i64, ReaperError> {
    let trimmed = value.trim();

    for (suffix, scale) in DURATION_UNITS {
        let Some(literal) = trimmed.strip_suffix(suffix) else {
            continue;
        };
        let number = parse_literal(literal, value)?;
        return match scale {
            DurationScale::SubMicrosecond => Ok(0),
            DurationScale::Microseconds(per_unit) => whole_seconds(number * per_unit, value),
        };
    }

    Err(ReaperError::UnrecognizedUnit {
        kind: UnitKind::Duration,
        value: value.to_string(),
    })
}

#[allow(clippy::cast_possible_truncation)]
fn whole_seconds(micros: f64, original: &str) -> Result<i64, ReaperError> {
    let rounded = micros.round_ties_even();
    // i64::MAX is not representable as f64; stay strictly below 2^63.
    if !rounded.is_finite() || rounded.abs() >= 9.223_372_036_854_775e18 {
        return Err(ReaperError::InvalidNumber {
            value: original.to_string(),
        });
    }
    Ok(Duration::microseconds(rounded as i64).whole_seconds())
}

fn parse_literal(literal: &str, original: &str) -> Result<f64, ReaperError> {
    let invalid = || ReaperError::InvalidNumber {
        value: original.to_string(),
    };
    let number: f64 = literal.trim().parse().map_err(|_| invalid())?;
    if number.is_finite() {
        Ok(number)
    } else {
        Err(invalid())
    }
}
