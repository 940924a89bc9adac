//! Quantity Parsing
//!
//! Parses Kubernetes resource quantities ("1Mi", "500M", "1.5Gi", "2e3")
//! into a byte count. Fractional results are rounded up to the next byte.

use thiserror::Error;

/// Why a quantity string was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuantityError {
    #[error("empty quantity")]
    Empty,

    #[error("quantities must match the regular expression '^([+-]?[0-9.]+)([eEinumkKMGTP]*[-+]?[0-9]*)$'")]
    Format,

    #[error("unknown suffix {0:?}")]
    Suffix(String),

    #[error("quantity out of range")]
    Range,
}

/// Multiplier expressed by a quantity suffix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scale {
    /// Power of ten, may be negative (milli, micro, nano)
    Decimal(i32),
    /// Power of two
    Binary(u32),
}

fn parse_suffix(suffix: &str) -> Result<Scale, QuantityError> {
    let scale = match suffix {
        "" => Scale::Decimal(0),
        "n" => Scale::Decimal(-9),
        "u" => Scale::Decimal(-6),
        "m" => Scale::Decimal(-3),
        "k" => Scale::Decimal(3),
        "M" => Scale::Decimal(6),
        "G" => Scale::Decimal(9),
        "T" => Scale::Decimal(12),
        "P" => Scale::Decimal(15),
        "E" => Scale::Decimal(18),
        "Ki" => Scale::Binary(10),
        "Mi" => Scale::Binary(20),
        "Gi" => Scale::Binary(30),
        "Ti" => Scale::Binary(40),
        "Pi" => Scale::Binary(50),
        "Ei" => Scale::Binary(60),
        _ => {
            // Decimal exponent: e3, E-2, e+6
            let rest = suffix
                .strip_prefix('e')
                .or_else(|| suffix.strip_prefix('E'))
                .ok_or_else(|| QuantityError::Suffix(suffix.to_string()))?;
            let digits = rest.trim_start_matches(['+', '-']);
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return Err(QuantityError::Suffix(suffix.to_string()));
            }
            let exp: i32 = rest.parse().map_err(|_| QuantityError::Range)?;
            Scale::Decimal(exp)
        }
    };
    Ok(scale)
}

/// Parse a quantity string into a (rounded up) integer value
pub fn parse_quantity(s: &str) -> Result<i64, QuantityError> {
    if s.is_empty() {
        return Err(QuantityError::Empty);
    }

    let (negative, unsigned) = match s.as_bytes()[0] {
        b'-' => (true, &s[1..]),
        b'+' => (false, &s[1..]),
        _ => (false, s),
    };

    // Find where the number ends and the suffix begins
    let num_end = unsigned
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(unsigned.len());
    let (number, suffix) = unsigned.split_at(num_end);

    let (int_part, frac_part) = match number.split_once('.') {
        Some((i, f)) => (i, f),
        None => (number, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return Err(QuantityError::Format);
    }
    if frac_part.contains('.') {
        return Err(QuantityError::Format);
    }

    let scale = parse_suffix(suffix)?;

    // value = mantissa / 10^frac_len * scale, computed as a fraction
    let mut numerator: u128 = 0;
    for b in int_part.bytes().chain(frac_part.bytes()) {
        numerator = numerator
            .checked_mul(10)
            .and_then(|n| n.checked_add(u128::from(b - b'0')))
            .ok_or(QuantityError::Range)?;
    }
    let frac_len = u32::try_from(frac_part.len()).map_err(|_| QuantityError::Range)?;
    let mut denominator: u128 = 10u128.checked_pow(frac_len).ok_or(QuantityError::Range)?;

    match scale {
        Scale::Binary(shift) => {
            numerator = numerator
                .checked_mul(1u128 << shift)
                .ok_or(QuantityError::Range)?;
        }
        Scale::Decimal(exp) if exp >= 0 => {
            let factor = 10u128
                .checked_pow(exp.unsigned_abs())
                .ok_or(QuantityError::Range)?;
            numerator = numerator.checked_mul(factor).ok_or(QuantityError::Range)?;
        }
        Scale::Decimal(exp) => {
            let factor = 10u128
                .checked_pow(exp.unsigned_abs())
                .ok_or(QuantityError::Range)?;
            denominator = denominator
                .checked_mul(factor)
                .ok_or(QuantityError::Range)?;
        }
    }

    let magnitude = numerator.div_ceil(denominator);
    let magnitude = i64::try_from(magnitude).map_err(|_| QuantityError::Range)?;
    Ok(if negative { -magnitude } else { magnitude })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_quantity_binary() {
        assert_eq!(parse_quantity("1Ki").unwrap(), 1024);
        assert_eq!(parse_quantity("1Mi").unwrap(), 1048576);
        assert_eq!(parse_quantity("4Gi").unwrap(), 4 * 1024 * 1024 * 1024);
        assert_eq!(parse_quantity("1.5Gi").unwrap(), 1536 * 1024 * 1024);
    }

    #[test]
    fn test_parse_quantity_decimal() {
        assert_eq!(parse_quantity("100").unwrap(), 100);
        assert_eq!(parse_quantity("1k").unwrap(), 1000);
        assert_eq!(parse_quantity("500M").unwrap(), 500_000_000);
        assert_eq!(parse_quantity("2e3").unwrap(), 2000);
        assert_eq!(parse_quantity("1E6").unwrap(), 1_000_000);
        assert_eq!(parse_quantity("+7").unwrap(), 7);
        assert_eq!(parse_quantity("-1k").unwrap(), -1000);
    }

    #[test]
    fn test_parse_quantity_rounds_up() {
        assert_eq!(parse_quantity("1500m").unwrap(), 2);
        assert_eq!(parse_quantity("0.1").unwrap(), 1);
        assert_eq!(parse_quantity("1n").unwrap(), 1);
    }

    #[test]
    fn test_parse_quantity_errors() {
        assert_eq!(parse_quantity(""), Err(QuantityError::Empty));
        assert_eq!(parse_quantity("Mi"), Err(QuantityError::Format));
        assert_eq!(parse_quantity("1.2.3"), Err(QuantityError::Format));
        assert!(matches!(parse_quantity("10X"), Err(QuantityError::Suffix(_))));
        assert!(matches!(parse_quantity("1e"), Err(QuantityError::Suffix(_))));
        assert_eq!(parse_quantity("16Ei"), Err(QuantityError::Range));
    }
}
