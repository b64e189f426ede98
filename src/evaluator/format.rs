//! Number formatting and parsing
//!
//! `@%` packs the print format into a word: byte 2 selects general (0),
//! exponent (1) or fixed (2) format, byte 1 the number of digits and byte 0
//! the field width used by `PRINT`. Bit 24 makes `STR$` honour `@%` too.

use crate::variables::Value;

/// General format with ten digits and no field width, used by `STR$`
const STR_FORMAT: i32 = 0x0000_0A00;
/// Most significant digits a double can usefully show
const MAX_DIGITS: usize = 17;
/// `@%` bit that makes `STR$` use `@%`
pub const STR_USES_AT: i32 = 0x0100_0000;

/// Field width from `@%`
pub fn field_width(at_percent: i32) -> usize {
    (at_percent & 0xFF) as usize
}

/// Format a number as `PRINT` would, without the field padding
pub fn format_number(value: &Value, at_percent: i32) -> String {
    let format = (at_percent >> 16) & 0xFF;
    let digits = ((at_percent >> 8) & 0xFF) as usize;
    match (value, format) {
        (Value::Int(i), f) if f != 1 && f != 2 => i.to_string(),
        (Value::Int64(i), f) if f != 1 && f != 2 => i.to_string(),
        (Value::Str(s), _) => String::from_utf8_lossy(s).into_owned(),
        (Value::Array(_), _) => String::new(),
        (other, 1) => format_exponent(other.to_f64().unwrap_or(0.0), digits.clamp(1, MAX_DIGITS)),
        (other, 2) => format_fixed(other.to_f64().unwrap_or(0.0), digits.min(MAX_DIGITS)),
        (other, _) => {
            let digits = if digits == 0 { 10 } else { digits.min(MAX_DIGITS) };
            format_general(other.to_f64().unwrap_or(0.0), digits)
        }
    }
}

/// `STR$` of a number
pub fn str_value(value: &Value, at_percent: i32) -> String {
    if at_percent & STR_USES_AT != 0 {
        format_number(value, at_percent)
    } else {
        format_number(value, STR_FORMAT)
    }
}

/// Hexadecimal form used by `PRINT ~` and `STR$~`
pub fn format_hex(value: &Value, hex64: bool) -> String {
    match value {
        Value::Int(i) => format!("{:X}", *i as u32),
        Value::Int64(i) if hex64 || i32::try_from(*i).is_err() => format!("{:X}", *i as u64),
        Value::Int64(i) => format!("{:X}", *i as u32),
        Value::Float(f) => {
            let t = f.trunc();
            if hex64 || t < i32::MIN as f64 || t > u32::MAX as f64 {
                format!("{:X}", t as i64 as u64)
            } else if t < 0.0 {
                format!("{:X}", t as i32 as u32)
            } else {
                format!("{:X}", t as u32)
            }
        }
        _ => String::new(),
    }
}

/// Equivalent of C's `%.*G` with the BBC style exponent
fn format_general(x: f64, digits: usize) -> String {
    if x == 0.0 {
        return "0".to_string();
    }
    if !x.is_finite() {
        return if x.is_nan() { "NaN".into() } else if x > 0.0 { "Inf".into() } else { "-Inf".into() };
    }
    let (mantissa, exponent) = split_exponent(&format!("{:.*e}", digits - 1, x));
    if exponent < -4 || exponent >= digits as i32 {
        format!("{}E{}", trim_fraction(&mantissa), exponent)
    } else {
        let decimals = (digits as i32 - 1 - exponent).max(0) as usize;
        trim_fraction(&format!("{:.*}", decimals, x))
    }
}

fn format_exponent(x: f64, digits: usize) -> String {
    let (mantissa, exponent) = split_exponent(&format!("{:.*e}", digits - 1, x));
    format!("{}E{}", mantissa, exponent)
}

fn format_fixed(x: f64, decimals: usize) -> String {
    let text = format!("{:.*}", decimals, x);
    // Rust prints -0.00 for small negative numbers
    if text.starts_with('-') && text[1..].bytes().all(|b| b == b'0' || b == b'.') {
        text[1..].to_string()
    } else {
        text
    }
}

fn split_exponent(text: &str) -> (String, i32) {
    match text.split_once('e') {
        Some((m, e)) => (m.to_string(), e.parse().unwrap_or(0)),
        None => (text.to_string(), 0),
    }
}

/// Drop trailing zeros after a decimal point, and the point itself
fn trim_fraction(text: &str) -> String {
    if !text.contains('.') {
        return text.to_string();
    }
    text.trim_end_matches('0').trim_end_matches('.').to_string()
}

/// Parse the number at the start of `text` the way `VAL` does. Returns the
/// value and the number of bytes used; text that is not a number gives 0.
pub fn parse_number(text: &[u8]) -> (Value, usize) {
    let mut pos = 0;
    while pos < text.len() && text[pos] == b' ' {
        pos += 1;
    }
    let start = pos;
    if pos < text.len() && matches!(text[pos], b'+' | b'-') {
        pos += 1;
    }
    let digits_start = pos;
    while pos < text.len() && text[pos].is_ascii_digit() {
        pos += 1;
    }
    let mut is_float = false;
    if pos < text.len() && text[pos] == b'.' {
        is_float = true;
        pos += 1;
        while pos < text.len() && text[pos].is_ascii_digit() {
            pos += 1;
        }
    }
    let mantissa_digits = text[digits_start..pos].iter().filter(|b| b.is_ascii_digit()).count();
    if mantissa_digits == 0 {
        return (Value::Int(0), 0);
    }
    if pos < text.len() && matches!(text[pos], b'E' | b'e') {
        let mut exp = pos + 1;
        if exp < text.len() && matches!(text[exp], b'+' | b'-') {
            exp += 1;
        }
        if exp < text.len() && text[exp].is_ascii_digit() {
            while exp < text.len() && text[exp].is_ascii_digit() {
                exp += 1;
            }
            is_float = true;
            pos = exp;
        }
    }
    let literal = String::from_utf8_lossy(&text[start..pos]);
    let value = if is_float {
        Value::Float(literal.parse().unwrap_or(0.0))
    } else if let Ok(i) = literal.parse::<i32>() {
        Value::Int(i)
    } else if let Ok(i) = literal.parse::<i64>() {
        Value::Int64(i)
    } else {
        Value::Float(literal.parse().unwrap_or(0.0))
    };
    (value, pos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variables::DEFAULT_AT_PERCENT;

    #[test]
    fn test_general_format() {
        assert_eq!(format_number(&Value::Int(42), DEFAULT_AT_PERCENT), "42");
        assert_eq!(format_number(&Value::Float(3.0), DEFAULT_AT_PERCENT), "3");
        assert_eq!(format_number(&Value::Float(0.5), DEFAULT_AT_PERCENT), "0.5");
        assert_eq!(format_number(&Value::Float(1.0 / 3.0), DEFAULT_AT_PERCENT), "0.333333333");
        assert_eq!(format_number(&Value::Float(1e10), DEFAULT_AT_PERCENT), "1E10");
        assert_eq!(format_number(&Value::Float(-1.5e-7), DEFAULT_AT_PERCENT), "-1.5E-7");
        assert_eq!(format_number(&Value::Float(0.0001), DEFAULT_AT_PERCENT), "0.0001");
        assert_eq!(format_number(&Value::Float(123456789.0), DEFAULT_AT_PERCENT), "123456789");
    }

    #[test]
    fn test_fixed_and_exponent_formats() {
        assert_eq!(format_number(&Value::Float(3.14159), 0x0002_020A), "3.14");
        assert_eq!(format_number(&Value::Int(7), 0x0002_0300), "7.000");
        assert_eq!(format_number(&Value::Float(-0.001), 0x0002_0200), "0.00");
        assert_eq!(format_number(&Value::Float(1234.5), 0x0001_0300), "1.23E3");
    }

    #[test]
    fn test_str_value_ignores_at_percent_by_default() {
        assert_eq!(str_value(&Value::Float(2.5), 0x0002_0205), "2.5");
        assert_eq!(str_value(&Value::Float(2.5), 0x0102_0205), "2.50");
    }

    #[test]
    fn test_hex() {
        assert_eq!(format_hex(&Value::Int(255), false), "FF");
        assert_eq!(format_hex(&Value::Int(-1), false), "FFFFFFFF");
        assert_eq!(format_hex(&Value::Int64(0x1_0000_0000), false), "100000000");
        assert_eq!(format_hex(&Value::Float(16.7), false), "10");
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number(b"  12abc"), (Value::Int(12), 4));
        assert_eq!(parse_number(b"-3.5"), (Value::Float(-3.5), 4));
        assert_eq!(parse_number(b"1E3"), (Value::Float(1000.0), 3));
        assert_eq!(parse_number(b"2E"), (Value::Int(2), 1));
        assert_eq!(parse_number(b"hello"), (Value::Int(0), 0));
        assert_eq!(parse_number(b"9999999999"), (Value::Int64(9_999_999_999), 10));
    }
}
