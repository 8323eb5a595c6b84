//! Kubernetes resource quantity parsing.
//!
//! Only used to validate and compare requests against limits, so values are
//! reduced to an `f64` in base units.

/// Parse a quantity such as `500m`, `1.5Gi`, `2e3` or `128M`.
///
/// Returns `None` for anything Kubernetes would reject, and for negative values.
pub fn parse_quantity(input: &str) -> Option<f64> {
    let trimmed = input.trim();
    if trimmed.is_empty() || trimmed != input {
        return None;
    }

    let split = trimmed
        .char_indices()
        .find(|(i, c)| !(c.is_ascii_digit() || *c == '.' || (*i == 0 && (*c == '+' || *c == '-'))))
        .map(|(i, _)| i)
        .unwrap_or(trimmed.len());
    let (number, suffix) = trimmed.split_at(split);

    if number.is_empty() || number == "+" || number == "-" || number.matches('.').count() > 1 {
        return None;
    }
    let mantissa: f64 = number.parse().ok()?;
    if mantissa < 0.0 {
        return None;
    }

    let multiplier = match suffix {
        "" => 1.0,
        "n" => 1e-9,
        "u" => 1e-6,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => 1024f64,
        "Mi" => 1024f64.powi(2),
        "Gi" => 1024f64.powi(3),
        "Ti" => 1024f64.powi(4),
        "Pi" => 1024f64.powi(5),
        "Ei" => 1024f64.powi(6),
        other => decimal_exponent(other)?,
    };

    Some(mantissa * multiplier)
}

/// `e3`, `E-2`, `e+6` style exponents.
fn decimal_exponent(suffix: &str) -> Option<f64> {
    let rest = suffix.strip_prefix(['e', 'E'])?;
    let digits = rest.strip_prefix(['+', '-']).unwrap_or(rest);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let exponent: i32 = rest.parse().ok()?;
    Some(10f64.powi(exponent))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_binary_and_decimal_suffixes() {
        assert_eq!(parse_quantity("128Mi"), Some(128.0 * 1024.0 * 1024.0));
        assert_eq!(parse_quantity("1G"), Some(1e9));
        assert_eq!(parse_quantity("500m"), Some(0.5));
        assert_eq!(parse_quantity("2"), Some(2.0));
        assert_eq!(parse_quantity("1.5Gi"), Some(1.5 * 1024f64.powi(3)));
    }

    #[test]
    fn parses_exponent_notation() {
        assert_eq!(parse_quantity("2e3"), Some(2000.0));
        assert_eq!(parse_quantity("1E2"), Some(100.0));
        // bare E is the exa suffix, not an exponent
        assert_eq!(parse_quantity("1E"), Some(1e18));
    }

    #[test]
    fn rejects_garbage() {
        for bad in ["500z", "", "Mi", "1.2.3", "-1", "1 Gi", " 1", "1ee3", "12KB"] {
            assert_eq!(parse_quantity(bad), None, "{bad} should be rejected");
        }
    }

    #[test]
    fn compares_across_units() {
        let request = parse_quantity("1024Mi").unwrap();
        let limit = parse_quantity("1Gi").unwrap();
        assert_eq!(request, limit);
        assert!(parse_quantity("250m").unwrap() < parse_quantity("1").unwrap());
    }
}
