//! Byte sizes as exchanged through policy parameters.
//!
//! Grammar: a non-negative decimal number, optional whitespace, and an optional
//! case-insensitive unit. A plain number is bytes.
//!
//! | Unit                         | Multiplier  |
//! |------------------------------|-------------|
//! | `B`                          | 1           |
//! | `K`/`KB`, `M`/`MB`, ... `PB` | powers of 1000 |
//! | `KiB`, `MiB`, ... `PiB`      | powers of 1024 |

use std::fmt;
use std::str::FromStr;

use crate::types::BufferError;

const IEC_UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];

/// A size in bytes with a human-readable text form
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ByteSize(pub u64);

impl ByteSize {
    /// Number of bytes
    pub fn bytes(self) -> u64 {
        self.0
    }

    /// Parse a size, tagging errors with the parameter `name`
    pub fn parse_param(name: &str, value: &str) -> Result<Self, BufferError> {
        parse(value).ok_or_else(|| BufferError::InvalidParam {
            name: name.to_string(),
            value: value.to_string(),
        })
    }
}

fn unit_multiplier(unit: &str) -> Option<u64> {
    let multiplier = match unit.to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" => 1000,
        "m" | "mb" => 1000u64.pow(2),
        "g" | "gb" => 1000u64.pow(3),
        "t" | "tb" => 1000u64.pow(4),
        "p" | "pb" => 1000u64.pow(5),
        "kib" => 1 << 10,
        "mib" => 1 << 20,
        "gib" => 1 << 30,
        "tib" => 1 << 40,
        "pib" => 1 << 50,
        _ => return None,
    };
    Some(multiplier)
}

fn parse(text: &str) -> Option<ByteSize> {
    let text = text.trim();
    let text = text.strip_prefix('+').unwrap_or(text);

    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let multiplier = unit_multiplier(unit.trim_start())?;

    let (whole, fraction) = match number.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (number, ""),
    };
    if whole.is_empty() && fraction.is_empty() {
        return None;
    }

    let whole: u64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let mut bytes = whole.checked_mul(multiplier)?;

    if !fraction.is_empty() {
        if !fraction.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        // Fractions are kept to the precision of f64, then floored to whole bytes
        let fraction: f64 = format!("0.{fraction}").parse().ok()?;
        bytes = bytes.checked_add((fraction * multiplier as f64) as u64)?;
    }

    Some(ByteSize(bytes))
}

impl FromStr for ByteSize {
    type Err = BufferError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_param("size", s)
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut value = self.0;
        let mut unit = 0;
        while value != 0 && value % 1024 == 0 && unit + 1 < IEC_UNITS.len() {
            value /= 1024;
            unit += 1;
        }
        write!(f, "{} {}", value, IEC_UNITS[unit])
    }
}

impl From<u64> for ByteSize {
    fn from(bytes: u64) -> Self {
        ByteSize(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn size(text: &str) -> Option<u64> {
        text.parse::<ByteSize>().ok().map(ByteSize::bytes)
    }

    #[test]
    fn test_plain_numbers_are_bytes() {
        assert_eq!(size("0"), Some(0));
        assert_eq!(size("42"), Some(42));
        assert_eq!(size("  7 "), Some(7));
    }

    #[test]
    fn test_units() {
        assert_eq!(size("1B"), Some(1));
        assert_eq!(size("2 b"), Some(2));
        assert_eq!(size("3KB"), Some(3000));
        assert_eq!(size("3k"), Some(3000));
        assert_eq!(size("1KiB"), Some(1024));
        assert_eq!(size("2 MiB"), Some(2 * 1024 * 1024));
        assert_eq!(size("1gb"), Some(1_000_000_000));
        assert_eq!(size("1.5KiB"), Some(1536));
        assert_eq!(size(".5 kb"), Some(500));
    }

    #[test]
    fn test_rejects_negative_and_garbage() {
        assert_eq!(size("-1B"), None);
        assert_eq!(size("-0"), None);
        assert_eq!(size("nope"), None);
        assert_eq!(size(""), None);
        assert_eq!(size("B"), None);
        assert_eq!(size("12 parsecs"), None);
        assert_eq!(size("1.2.3"), None);
        assert_eq!(size("99999999999 PiB"), None);
    }

    #[test]
    fn test_parse_param_reports_name() {
        match ByteSize::parse_param("barrier", "-1B") {
            Err(BufferError::InvalidParam { name, value }) => {
                assert_eq!(name, "barrier");
                assert_eq!(value, "-1B");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_display_uses_exact_units() {
        assert_eq!(ByteSize(0).to_string(), "0 B");
        assert_eq!(ByteSize(1).to_string(), "1 B");
        assert_eq!(ByteSize(1536).to_string(), "1536 B");
        assert_eq!(ByteSize(2048).to_string(), "2 KiB");
        assert_eq!(ByteSize(3 << 30).to_string(), "3 GiB");

        // Display output parses back to the same size
        for bytes in [0, 1, 1000, 4096, 5 << 20] {
            let text = ByteSize(bytes).to_string();
            assert_eq!(size(&text), Some(bytes));
        }
    }
}
