//! Byte-size and time-span parsing shared by configuration and the CLI.

use std::time::Duration;

use crate::error::{PodyError, Result};

const KIB: u64 = 1024;
const MIB: u64 = KIB * 1024;
const GIB: u64 = MIB * 1024;
const TIB: u64 = GIB * 1024;

/// Parses sizes like `"512"`, `"64k"`, `"8g"`, `"1GiB"`, `"256MB"` into bytes.
///
/// Single-letter suffixes and `*iB` suffixes are binary; `KB`/`MB`/`GB`/`TB`
/// are decimal.
///
/// # Errors
///
/// Returns `InvalidInput` for unknown suffixes or non-numeric values.
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (num_str, unit) = s.split_at(split);
    let multiplier = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kib" => KIB,
        "m" | "mib" => MIB,
        "g" | "gib" => GIB,
        "t" | "tib" => TIB,
        "kb" => 1_000,
        "mb" => 1_000_000,
        "gb" => 1_000_000_000,
        "tb" => 1_000_000_000_000,
        other => {
            return Err(PodyError::invalid(format!(
                "invalid size {s:?}: unknown unit {other:?}"
            )));
        }
    };
    let n: u64 = num_str
        .parse()
        .map_err(|_| PodyError::invalid(format!("invalid size {s:?}")))?;
    n.checked_mul(multiplier)
        .ok_or_else(|| PodyError::invalid(format!("size {s:?} is too large")))
}

/// Formats a byte count into a human-readable string (e.g., "128.0 MiB").
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    if bytes >= TIB {
        format!("{:.1} TiB", bytes as f64 / TIB as f64)
    } else if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// Parses a relative span such as `"1y"`, `"2w"`, `"3d"`, `"4h"`, `"5m"`,
/// or `"6s"`. A year counts as 365 days.
///
/// # Errors
///
/// Returns `InvalidInput` if the unit is unknown or the number is missing.
pub fn parse_span(s: &str) -> Result<Duration> {
    let s = s.trim();
    let Some(unit) = s.chars().last() else {
        return Err(PodyError::invalid("empty time span"));
    };
    let secs_per_unit: u64 = match unit {
        'y' => 365 * 86_400,
        'w' => 7 * 86_400,
        'd' => 86_400,
        'h' => 3_600,
        'm' => 60,
        's' => 1,
        _ => {
            return Err(PodyError::invalid(format!(
                "invalid time span {s:?}: expected a y/w/d/h/m/s suffix"
            )));
        }
    };
    let n: u64 = s[..s.len() - 1]
        .parse()
        .map_err(|_| PodyError::invalid(format!("invalid time span {s:?}")))?;
    n.checked_mul(secs_per_unit)
        .map(Duration::from_secs)
        .ok_or_else(|| PodyError::invalid(format!("time span {s:?} is too large")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_size_binary_suffixes() {
        assert_eq!(parse_size("8g").unwrap(), 8 * GIB);
        assert_eq!(parse_size("128MiB").unwrap(), 128 * MIB);
        assert_eq!(parse_size("64K").unwrap(), 64 * KIB);
    }

    #[test]
    fn parse_size_decimal_suffixes() {
        assert_eq!(parse_size("256MB").unwrap(), 256_000_000);
    }

    #[test]
    fn parse_size_plain_bytes() {
        assert_eq!(parse_size("1048576").unwrap(), 1_048_576);
        assert_eq!(parse_size("12b").unwrap(), 12);
    }

    #[test]
    fn parse_size_invalid() {
        assert!(parse_size("abc").is_err());
        assert!(parse_size("12x").is_err());
        assert!(parse_size("").is_err());
    }

    #[test]
    fn format_bytes_units() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KiB");
        assert_eq!(format_bytes(134_217_728), "128.0 MiB");
        assert_eq!(format_bytes(2_147_483_648), "2.0 GiB");
    }

    #[test]
    fn parse_span_units() {
        assert_eq!(parse_span("1w").unwrap(), Duration::from_secs(604_800));
        assert_eq!(parse_span("2h").unwrap(), Duration::from_secs(7_200));
        assert_eq!(parse_span("1y").unwrap(), Duration::from_secs(31_536_000));
        assert_eq!(parse_span("30s").unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn parse_span_invalid() {
        assert!(parse_span("").is_err());
        assert!(parse_span("w").is_err());
        assert!(parse_span("10x").is_err());
    }
}
