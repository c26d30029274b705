//! Resource quantities.
//!
//! CPU is tracked in millicores and memory/storage in bytes. Manifests use
//! Kubernetes-style quantity strings, e.g. `250m`, `0.5`, `128Mi`, `1Gi`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from parsing quantity strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QuantityError {
    #[error("quantity cannot be empty")]
    Empty,

    #[error("invalid quantity '{0}'")]
    Invalid(String),

    #[error("quantity '{0}' overflows")]
    Overflow(String),
}

/// A CPU/memory pair used for requests, limits and capacity budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Resources {
    pub cpu_millis: u64,
    pub memory_bytes: u64,
}

impl Resources {
    pub const ZERO: Self = Self {
        cpu_millis: 0,
        memory_bytes: 0,
    };

    pub const fn new(cpu_millis: u64, memory_bytes: u64) -> Self {
        Self {
            cpu_millis,
            memory_bytes,
        }
    }

    /// Parse a CPU and a memory quantity.
    pub fn parse(cpu: &str, memory: &str) -> Result<Self, QuantityError> {
        Ok(Self {
            cpu_millis: parse_cpu(cpu)?,
            memory_bytes: parse_bytes(memory)?,
        })
    }

    /// Component-wise `self <= other`.
    pub fn fits_within(&self, other: &Resources) -> bool {
        self.cpu_millis <= other.cpu_millis && self.memory_bytes <= other.memory_bytes
    }

    pub fn checked_add(&self, other: &Resources) -> Option<Resources> {
        Some(Resources {
            cpu_millis: self.cpu_millis.checked_add(other.cpu_millis)?,
            memory_bytes: self.memory_bytes.checked_add(other.memory_bytes)?,
        })
    }

    pub fn saturating_sub(&self, other: &Resources) -> Resources {
        Resources {
            cpu_millis: self.cpu_millis.saturating_sub(other.cpu_millis),
            memory_bytes: self.memory_bytes.saturating_sub(other.memory_bytes),
        }
    }
}

impl std::fmt::Display for Resources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "cpu={}m memory={}",
            self.cpu_millis,
            format_bytes(self.memory_bytes)
        )
    }
}

/// Parse a CPU quantity into millicores.
///
/// `"250m"` is 250 millicores, `"0.5"` and `"1"` are whole-core counts.
pub fn parse_cpu(s: &str) -> Result<u64, QuantityError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(QuantityError::Empty);
    }

    if let Some(millis) = s.strip_suffix('m') {
        return millis
            .parse::<u64>()
            .map_err(|_| QuantityError::Invalid(s.to_string()));
    }

    let cores: f64 = s.parse().map_err(|_| QuantityError::Invalid(s.to_string()))?;
    if !cores.is_finite() || cores < 0.0 {
        return Err(QuantityError::Invalid(s.to_string()));
    }
    let millis = (cores * 1000.0).round();
    if millis > u64::MAX as f64 {
        return Err(QuantityError::Overflow(s.to_string()));
    }
    Ok(millis as u64)
}

/// Parse a memory or storage quantity into bytes.
///
/// Binary suffixes (`Ki`, `Mi`, `Gi`, `Ti`) are powers of 1024, decimal
/// suffixes (`k`, `M`, `G`, `T`) powers of 1000. Bare numbers are bytes.
pub fn parse_bytes(s: &str) -> Result<u64, QuantityError> {
    const SUFFIXES: &[(&str, u64)] = &[
        ("Ki", 1 << 10),
        ("Mi", 1 << 20),
        ("Gi", 1 << 30),
        ("Ti", 1 << 40),
        ("k", 1_000),
        ("K", 1_000),
        ("M", 1_000_000),
        ("G", 1_000_000_000),
        ("T", 1_000_000_000_000),
    ];

    let s = s.trim();
    if s.is_empty() {
        return Err(QuantityError::Empty);
    }

    let (number, multiplier) = SUFFIXES
        .iter()
        .find_map(|(suffix, mult)| s.strip_suffix(suffix).map(|n| (n, *mult)))
        .unwrap_or((s, 1));

    if let Ok(whole) = number.parse::<u64>() {
        return whole
            .checked_mul(multiplier)
            .ok_or_else(|| QuantityError::Overflow(s.to_string()));
    }

    let value: f64 = number
        .parse()
        .map_err(|_| QuantityError::Invalid(s.to_string()))?;
    if !value.is_finite() || value < 0.0 {
        return Err(QuantityError::Invalid(s.to_string()));
    }
    let bytes = (value * multiplier as f64).ceil();
    if bytes > u64::MAX as f64 {
        return Err(QuantityError::Overflow(s.to_string()));
    }
    Ok(bytes as u64)
}

/// Human-readable binary size, e.g. `128Mi`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[(&str, u64)] = &[("Ti", 1 << 40), ("Gi", 1 << 30), ("Mi", 1 << 20), ("Ki", 1 << 10)];

    for (unit, size) in UNITS {
        if bytes >= *size && bytes % size == 0 {
            return format!("{}{}", bytes / size, unit);
        }
    }
    bytes.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("250m", 250)]
    #[case("1", 1000)]
    #[case("0.5", 500)]
    #[case(" 2 ", 2000)]
    fn test_parse_cpu(#[case] input: &str, #[case] expected: u64) {
        assert_eq!(parse_cpu(input).unwrap(), expected);
    }

    #[rstest]
    #[case("128Mi", 128 * 1024 * 1024)]
    #[case("1Gi", 1024 * 1024 * 1024)]
    #[case("512M", 512_000_000)]
    #[case("1.5Gi", 1536 * 1024 * 1024)]
    #[case("4096", 4096)]
    fn test_parse_bytes(#[case] input: &str, #[case] expected: u64) {
        assert_eq!(parse_bytes(input).unwrap(), expected);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(parse_cpu(""), Err(QuantityError::Empty));
        assert!(matches!(parse_cpu("-1"), Err(QuantityError::Invalid(_))));
        assert!(matches!(parse_bytes("lots"), Err(QuantityError::Invalid(_))));
        assert!(matches!(
            parse_bytes("99999999999Ti"),
            Err(QuantityError::Overflow(_))
        ));
    }

    #[test]
    fn test_fits_within_is_component_wise() {
        let small = Resources::new(250, 128);
        let big = Resources::new(500, 256);
        let mixed = Resources::new(1000, 64);

        assert!(small.fits_within(&big));
        assert!(!big.fits_within(&small));
        assert!(!mixed.fits_within(&big));
    }

    #[test]
    fn test_display() {
        let r = Resources::parse("250m", "128Mi").unwrap();
        assert_eq!(r.to_string(), "cpu=250m memory=128Mi");
    }
}
