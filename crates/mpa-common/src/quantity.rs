//! Arithmetic over Kubernetes resource quantities
//!
//! Recommendations are computed in milli-units (millicores for CPU,
//! milli-bytes for memory) so that proportional scaling stays exact in
//! integer arithmetic.

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::error::Error;

const BINARY_SUFFIXES: [(&str, i128); 5] = [
    ("Ki", 1 << 10),
    ("Mi", 1 << 20),
    ("Gi", 1 << 30),
    ("Ti", 1 << 40),
    ("Pi", 1 << 50),
];

const DECIMAL_SUFFIXES: [(&str, i128); 5] = [
    ("k", 1_000),
    ("M", 1_000_000),
    ("G", 1_000_000_000),
    ("T", 1_000_000_000_000),
    ("P", 1_000_000_000_000_000),
];

/// Parse a quantity into milli-units ("250m" -> 250, "2" -> 2000,
/// "1.5" -> 1500, "128Mi" -> 128 * 2^20 * 1000). Saturates at `i64::MAX`.
pub fn parse_milli(quantity: &Quantity) -> Result<i64, Error> {
    let s = quantity.0.trim();
    if s.is_empty() {
        return Ok(0);
    }

    let invalid = || Error::serialization(format!("invalid quantity {:?}", quantity.0));

    if let Some(num) = s.strip_suffix('m') {
        let value: i128 = num.parse().map_err(|_| invalid())?;
        return Ok(clamp_i64(value));
    }

    for (suffix, factor) in BINARY_SUFFIXES.iter().chain(DECIMAL_SUFFIXES.iter()) {
        if let Some(num) = s.strip_suffix(suffix) {
            let milli = parse_decimal_milli(num).ok_or_else(invalid)?;
            return Ok(clamp_i64(milli.saturating_mul(*factor)));
        }
    }

    let milli = parse_decimal_milli(s).ok_or_else(invalid)?;
    Ok(clamp_i64(milli))
}

/// Render milli-units back into a quantity: whole units when the value is
/// divisible by 1000 ("2"), milli notation otherwise ("1500m")
pub fn format_milli(milli: i64) -> Quantity {
    if milli % 1000 == 0 {
        Quantity(format!("{}", milli / 1000))
    } else {
        Quantity(format!("{milli}m"))
    }
}

/// True when the quantity is absent or parses to zero
pub fn is_zero(quantity: Option<&Quantity>) -> bool {
    match quantity {
        None => true,
        Some(q) => parse_milli(q).map(|v| v == 0).unwrap_or(false),
    }
}

/// Compare two quantities by their milli value
pub fn cmp(a: &Quantity, b: &Quantity) -> Result<std::cmp::Ordering, Error> {
    Ok(parse_milli(a)?.cmp(&parse_milli(b)?))
}

/// Parse a plain or decimal number into milli-units (base 1000)
fn parse_decimal_milli(s: &str) -> Option<i128> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let (sign, digits) = match s.strip_prefix('-') {
        Some(rest) => (-1i128, rest),
        None => (1i128, s),
    };
    match digits.split_once('.') {
        None => {
            let whole: i128 = digits.parse().ok()?;
            Some(sign * whole.checked_mul(1000)?)
        }
        Some((whole, frac)) => {
            if frac.is_empty() || !frac.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            let whole: i128 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
            // Fraction truncated past milli precision, matching the
            // canonical milli-scale representation
            let mut frac_milli = 0i128;
            for (i, c) in frac.chars().take(3).enumerate() {
                frac_milli += (c.to_digit(10)? as i128) * 10i128.pow(2 - i as u32);
            }
            Some(sign * (whole.checked_mul(1000)? + frac_milli))
        }
    }
}

fn clamp_i64(value: i128) -> i64 {
    value.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}
