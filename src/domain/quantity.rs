//! Capacity Quantities
//!
//! Parses and renders storage capacities in the object store's quantity
//! notation: decimal suffixes (`k`, `M`, `G`, `T`, `P`, `E`), binary
//! suffixes (`Ki` .. `Ei`) and plain byte counts.

use crate::error::{Error, Result};

const KI: u64 = 1024;

/// Binary suffixes, largest first
const BINARY_SUFFIXES: [(&str, u64); 6] = [
    ("Ei", KI * KI * KI * KI * KI * KI),
    ("Pi", KI * KI * KI * KI * KI),
    ("Ti", KI * KI * KI * KI),
    ("Gi", KI * KI * KI),
    ("Mi", KI * KI),
    ("Ki", KI),
];

/// Decimal suffixes
const DECIMAL_SUFFIXES: [(&str, u64); 6] = [
    ("E", 1_000_000_000_000_000_000),
    ("P", 1_000_000_000_000_000),
    ("T", 1_000_000_000_000),
    ("G", 1_000_000_000),
    ("M", 1_000_000),
    ("k", 1_000),
];

/// Parse a quantity string (e.g. `"10G"`, `"5Gi"`, `"1500"`) into bytes
///
/// Fractional values are rounded up to the next whole byte, matching how
/// a capacity request is a lower bound.
pub fn parse_quantity(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::CapacityParse("empty quantity".into()));
    }

    // Find where the number ends and the suffix begins
    let num_end = s
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit() && *c != '.')
        .map(|(i, _)| i)
        .unwrap_or(s.len());

    let num_str = &s[..num_end];
    let suffix = &s[num_end..];

    if num_str.is_empty() {
        return Err(Error::CapacityParse(format!("missing number in {:?}", s)));
    }

    let multiplier = if suffix.is_empty() {
        1
    } else if let Some((_, m)) = BINARY_SUFFIXES.iter().find(|(sfx, _)| *sfx == suffix) {
        *m
    } else if let Some((_, m)) = DECIMAL_SUFFIXES.iter().find(|(sfx, _)| *sfx == suffix) {
        *m
    } else {
        return Err(Error::CapacityParse(format!("unknown suffix {:?}", suffix)));
    };

    match num_str.split_once('.') {
        None => {
            let whole: u64 = num_str
                .parse()
                .map_err(|_| Error::CapacityParse(format!("invalid number: {}", num_str)))?;
            whole
                .checked_mul(multiplier)
                .ok_or_else(|| Error::CapacityParse(format!("quantity overflows: {}", s)))
        }
        Some((whole, frac)) => {
            let value: f64 = format!("{}.{}", if whole.is_empty() { "0" } else { whole }, frac)
                .parse()
                .map_err(|_| Error::CapacityParse(format!("invalid number: {}", num_str)))?;
            let bytes = (value * multiplier as f64).ceil();
            if bytes > u64::MAX as f64 {
                return Err(Error::CapacityParse(format!("quantity overflows: {}", s)));
            }
            Ok(bytes as u64)
        }
    }
}

/// Render a byte count using the largest exact suffix
///
/// Binary suffixes win over decimal ones when both divide evenly, so the
/// output always parses back to the same value.
pub fn format_quantity(bytes: u64) -> String {
    if bytes == 0 {
        return "0".to_string();
    }
    for (suffix, m) in BINARY_SUFFIXES.iter() {
        if bytes % m == 0 {
            return format!("{}{}", bytes / m, suffix);
        }
    }
    for (suffix, m) in DECIMAL_SUFFIXES.iter() {
        if bytes % m == 0 {
            return format!("{}{}", bytes / m, suffix);
        }
    }
    bytes.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_decimal_and_binary() {
        assert_eq!(parse_quantity("10G").unwrap(), 10_000_000_000);
        assert_eq!(parse_quantity("5Gi").unwrap(), 5 * 1024 * 1024 * 1024);
        assert_eq!(parse_quantity("1500").unwrap(), 1500);
        assert_eq!(parse_quantity("2k").unwrap(), 2000);
        assert_eq!(parse_quantity(" 3Mi ").unwrap(), 3 * 1024 * 1024);
    }

    #[test]
    fn test_parse_fraction_rounds_up() {
        assert_eq!(parse_quantity("1.5G").unwrap(), 1_500_000_000);
        assert_eq!(parse_quantity("0.5Ki").unwrap(), 512);
        assert_eq!(parse_quantity("1.0001k").unwrap(), 1001);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_quantity("").is_err());
        assert!(parse_quantity("Gi").is_err());
        assert!(parse_quantity("10XB").is_err());
        assert!(parse_quantity("99999999999E").is_err());
    }

    #[test]
    fn test_format_prefers_exact_suffix() {
        assert_eq!(format_quantity(10 * 1024 * 1024 * 1024), "10Gi");
        assert_eq!(format_quantity(10_000_000_000), "10G");
        assert_eq!(format_quantity(1001), "1001");
        assert_eq!(format_quantity(0), "0");
    }
}
