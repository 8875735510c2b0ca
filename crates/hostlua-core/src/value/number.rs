//! Numeric helpers shared by keys, comparisons and text conversion

/// Exact integer value of `n`, if it has one that fits `i64`
pub(crate) fn float_to_integer(n: f64) -> Option<i64> {
    // 2^63 is exactly representable; anything at or beyond it overflows i64.
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    if n.fract() == 0.0 && (-LIMIT..LIMIT).contains(&n) {
        Some(n as i64)
    } else {
        None
    }
}

/// Render a number the way `tostring` does: shortest round-trip digits, exponent form outside
/// `[1e-5, 1e21)`
pub(crate) fn format_number(n: f64) -> String {
    if n.is_nan() {
        return String::from("nan");
    }
    if n.is_infinite() {
        return String::from(if n > 0.0 { "inf" } else { "-inf" });
    }
    let magnitude = n.abs();
    if magnitude == 0.0 || (1e-5..1e21).contains(&magnitude) {
        return format!("{}", n);
    }
    let s = format!("{:e}", n);
    match s.find('e') {
        Some(pos) if !s[pos + 1..].starts_with('-') => format!("{}e+{}", &s[..pos], &s[pos + 1..]),
        _ => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_to_integer_bounds() {
        assert_eq!(float_to_integer(3.0), Some(3));
        assert_eq!(float_to_integer(-0.0), Some(0));
        assert_eq!(float_to_integer(2.5), None);
        assert_eq!(float_to_integer(9_223_372_036_854_775_808.0), None);
        assert_eq!(float_to_integer(f64::NAN), None);
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(2.0), "2");
        assert_eq!(format_number(0.1), "0.1");
        assert_eq!(format_number(-2.5), "-2.5");
        assert_eq!(format_number(1e21), "1e+21");
        assert_eq!(format_number(1.5e-7), "1.5e-7");
        assert_eq!(format_number(f64::NEG_INFINITY), "-inf");
        assert_eq!(format_number(f64::NAN), "nan");
    }
}
