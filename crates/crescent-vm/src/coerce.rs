//! Numeric coercions shared by the interpreter and the base library.
//!
//! String operands convert through the same numeral grammar as the
//! lexer (decimal integer, decimal float, hex integer with 2^64 wrap,
//! hex float with `p` exponent), preserving the integer/float
//! distinction.

use crescent_core::string::StringPool;
use crescent_core::value::Value;

/// A parsed numeral.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Numeral {
    Int(i64),
    Flt(f64),
}

impl Numeral {
    pub fn to_value(self) -> Value {
        match self {
            Numeral::Int(i) => Value::Integer(i),
            Numeral::Flt(f) => Value::Float(f),
        }
    }
}

/// Coerce a value to a number, keeping integers integral. Strings go
/// through the numeral grammar.
pub fn to_numeral(v: Value, strings: &StringPool) -> Option<Numeral> {
    match v {
        Value::Integer(i) => Some(Numeral::Int(i)),
        Value::Float(f) => Some(Numeral::Flt(f)),
        Value::Str(id) => str_to_numeral(strings.bytes(id)),
        _ => None,
    }
}

/// Coerce to f64; integers widen, strings parse.
pub fn to_number(v: Value, strings: &StringPool) -> Option<f64> {
    match to_numeral(v, strings)? {
        Numeral::Int(i) => Some(i as f64),
        Numeral::Flt(f) => Some(f),
    }
}

/// Coerce to i64. Floats must be integral and in range; strings parse
/// first, then follow the float rule.
pub fn to_integer(v: Value, strings: &StringPool) -> Option<i64> {
    match to_numeral(v, strings)? {
        Numeral::Int(i) => Some(i),
        Numeral::Flt(f) => float_to_integer(f),
    }
}

/// Exact float→integer conversion: integral values inside the i64
/// range only. 2^63 is the first double past `i64::MAX`.
pub fn float_to_integer(f: f64) -> Option<i64> {
    if f.floor() != f {
        return None;
    }
    const TWO_POW_63: f64 = 9_223_372_036_854_775_808.0;
    if f >= TWO_POW_63 || f < -TWO_POW_63 {
        return None;
    }
    Some(f as i64)
}

/// Parse a numeral from bytes: optional surrounding whitespace and
/// sign, then the lexer's grammar. Embedded NUL or trailing garbage
/// fails.
pub fn str_to_numeral(bytes: &[u8]) -> Option<Numeral> {
    let s = std::str::from_utf8(bytes).ok()?;
    let s = s.trim_matches(|c: char| c.is_ascii_whitespace());
    if s.is_empty() || s.contains('\0') {
        return None;
    }
    let (negative, rest) = match s.as_bytes()[0] {
        b'-' => (true, &s[1..]),
        b'+' => (false, &s[1..]),
        _ => (false, s),
    };
    if rest.is_empty() {
        return None;
    }
    let n = if rest.len() > 2 && (rest.starts_with("0x") || rest.starts_with("0X")) {
        parse_hex_numeral(&rest[2..])?
    } else {
        parse_dec_numeral(rest)?
    };
    Some(if negative { negate(n) } else { n })
}

fn negate(n: Numeral) -> Numeral {
    match n {
        Numeral::Int(i) => Numeral::Int(i.wrapping_neg()),
        Numeral::Flt(f) => Numeral::Flt(-f),
    }
}

fn parse_dec_numeral(s: &str) -> Option<Numeral> {
    let bytes = s.as_bytes();
    let mut has_digits = false;
    let mut is_float = false;
    let mut i = 0;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        has_digits = true;
        i += 1;
    }
    if i < bytes.len() && bytes[i] == b'.' {
        is_float = true;
        i += 1;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            has_digits = true;
            i += 1;
        }
    }
    if !has_digits {
        return None;
    }
    if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
        is_float = true;
        i += 1;
        if i < bytes.len() && (bytes[i] == b'+' || bytes[i] == b'-') {
            i += 1;
        }
        if i >= bytes.len() || !bytes[i].is_ascii_digit() {
            return None;
        }
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
    }
    if i != bytes.len() {
        return None;
    }
    if !is_float {
        if let Ok(v) = s.parse::<i64>() {
            return Some(Numeral::Int(v));
        }
        // Out-of-range decimal integers become floats.
    }
    s.parse::<f64>().ok().map(Numeral::Flt)
}

fn parse_hex_numeral(s: &str) -> Option<Numeral> {
    let bytes = s.as_bytes();
    let mut int_value: u64 = 0;
    let mut mantissa: f64 = 0.0;
    let mut digits = 0usize;
    let mut exponent: i32 = 0;
    let mut is_float = false;
    let mut i = 0;
    while i < bytes.len() {
        match hex_digit(bytes[i]) {
            Some(d) => {
                int_value = int_value.wrapping_mul(16).wrapping_add(d as u64);
                mantissa = mantissa * 16.0 + d as f64;
                digits += 1;
                i += 1;
            }
            None => break,
        }
    }
    if i < bytes.len() && bytes[i] == b'.' {
        is_float = true;
        i += 1;
        while i < bytes.len() {
            match hex_digit(bytes[i]) {
                Some(d) => {
                    mantissa = mantissa * 16.0 + d as f64;
                    digits += 1;
                    exponent -= 4;
                    i += 1;
                }
                None => break,
            }
        }
    }
    if digits == 0 {
        return None;
    }
    if i < bytes.len() && (bytes[i] == b'p' || bytes[i] == b'P') {
        is_float = true;
        i += 1;
        let negative = if i < bytes.len() && (bytes[i] == b'+' || bytes[i] == b'-') {
            let neg = bytes[i] == b'-';
            i += 1;
            neg
        } else {
            false
        };
        if i >= bytes.len() || !bytes[i].is_ascii_digit() {
            return None;
        }
        let mut e: i64 = 0;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            e = (e * 10 + (bytes[i] - b'0') as i64).min(1 << 20);
            i += 1;
        }
        exponent += if negative { -e as i32 } else { e as i32 };
    }
    if i != bytes.len() {
        return None;
    }
    if !is_float {
        return Some(Numeral::Int(int_value as i64));
    }
    Some(Numeral::Flt(ldexp(mantissa, exponent)))
}

fn hex_digit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

fn ldexp(mut m: f64, mut e: i32) -> f64 {
    while e > 1023 {
        m *= (2.0f64).powi(1023);
        e -= 1023;
    }
    while e < -1023 {
        m *= (2.0f64).powi(-1023);
        e += 1023;
    }
    m * (2.0f64).powi(e)
}

/// Format a float the way `tostring` does: `%.14g`, then a trailing
/// ".0" when the result would read as an integer, so floats stay
/// visually distinct.
pub fn format_float(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    let mut s = format_g(f, 14);
    if s.bytes().all(|b| b.is_ascii_digit() || b == b'-') {
        s.push_str(".0");
    }
    s
}

/// C `%.*g` for finite values.
fn format_g(f: f64, precision: usize) -> String {
    if f == 0.0 {
        return if f.is_sign_negative() { "-0" } else { "0" }.to_string();
    }
    let exp = f.abs().log10().floor() as i32;
    if exp >= -4 && (exp as i64) < precision as i64 {
        let decimals = (precision as i32 - 1 - exp).max(0) as usize;
        let s = format!("{:.*}", decimals, f);
        if s.contains('.') {
            s.trim_end_matches('0').trim_end_matches('.').to_string()
        } else {
            s
        }
    } else {
        let s = format!("{:.*e}", precision - 1, f);
        // Rust writes `1.5e3`; C writes `1.5e+03`.
        match s.find('e') {
            Some(pos) => {
                let (mantissa, exp_part) = s.split_at(pos);
                let exp_part = &exp_part[1..];
                let (sign, digits) = match exp_part.strip_prefix('-') {
                    Some(d) => ("-", d),
                    None => ("+", exp_part),
                };
                let mantissa = mantissa.trim_end_matches('0').trim_end_matches('.');
                let e: i32 = digits.parse().unwrap_or(0);
                format!("{mantissa}e{sign}{e:02}")
            }
            None => s,
        }
    }
}

/// Convert a number to its display string: `%d` for integers, `%.14g`
/// for floats.
pub fn number_to_display(v: Value) -> Option<String> {
    match v {
        Value::Integer(i) => Some(i.to_string()),
        Value::Float(f) => Some(format_float(f)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_string_stays_integer() {
        assert_eq!(str_to_numeral(b"10"), Some(Numeral::Int(10)));
        assert_eq!(str_to_numeral(b"  -42  "), Some(Numeral::Int(-42)));
    }

    #[test]
    fn test_float_strings() {
        assert_eq!(str_to_numeral(b"1.5"), Some(Numeral::Flt(1.5)));
        assert_eq!(str_to_numeral(b"1e2"), Some(Numeral::Flt(100.0)));
        assert_eq!(str_to_numeral(b".5"), Some(Numeral::Flt(0.5)));
        assert_eq!(str_to_numeral(b"3."), Some(Numeral::Flt(3.0)));
    }

    #[test]
    fn test_hex_wraps() {
        assert_eq!(
            str_to_numeral(b"0xFFFFFFFFFFFFFFFF"),
            Some(Numeral::Int(-1))
        );
        assert_eq!(str_to_numeral(b"0x10"), Some(Numeral::Int(16)));
        assert_eq!(str_to_numeral(b"-0x2"), Some(Numeral::Int(-2)));
    }

    #[test]
    fn test_hex_float() {
        assert_eq!(str_to_numeral(b"0x1p4"), Some(Numeral::Flt(16.0)));
        assert_eq!(str_to_numeral(b"0x1.8p1"), Some(Numeral::Flt(3.0)));
    }

    #[test]
    fn test_rejects_garbage() {
        assert_eq!(str_to_numeral(b""), None);
        assert_eq!(str_to_numeral(b"abc"), None);
        assert_eq!(str_to_numeral(b"1x"), None);
        assert_eq!(str_to_numeral(b"1 2"), None);
        assert_eq!(str_to_numeral(b"0x"), None);
        // Rust would accept these, Lua does not.
        assert_eq!(str_to_numeral(b"inf"), None);
        assert_eq!(str_to_numeral(b"nan"), None);
    }

    #[test]
    fn test_float_to_integer_bounds() {
        assert_eq!(float_to_integer(3.0), Some(3));
        assert_eq!(float_to_integer(3.5), None);
        assert_eq!(float_to_integer(i64::MIN as f64), Some(i64::MIN));
        // 2^63 rounds out of range.
        assert_eq!(float_to_integer(9.223372036854776e18), None);
        assert_eq!(float_to_integer(f64::INFINITY), None);
        assert_eq!(float_to_integer(f64::NAN), None);
    }

    #[test]
    fn test_format_float() {
        assert_eq!(format_float(1.0), "1.0");
        assert_eq!(format_float(0.5), "0.5");
        assert_eq!(format_float(-2.25), "-2.25");
        assert_eq!(format_float(f64::INFINITY), "inf");
        assert_eq!(format_float(1e100), "1e+100");
        assert_eq!(format_float(1.5e-7), "1.5e-07");
        assert_eq!(format_float(-0.0), "-0.0");
        assert_eq!(format_float(100.0), "100.0");
    }

    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_int_strings_round_trip(i in proptest::num::i64::ANY) {
            let s = i.to_string();
            prop_assert_eq!(str_to_numeral(s.as_bytes()), Some(Numeral::Int(i)));
        }

        #[test]
        fn prop_float_to_integer_agrees_with_value_eq(f in -1e19f64..1e19) {
            if let Some(i) = float_to_integer(f) {
                prop_assert_eq!(i as f64, f);
            }
        }
    }
}
