//! Primitive equality and ordering.
//!
//! Mixed integer/float comparisons are exact: the integer is never
//! rounded through a lossy cast. Strings order byte-wise. `None`
//! results mean the operands need metamethod dispatch.

use crescent_core::string::StringPool;
use crescent_core::value::Value;

/// Raw equality, before any `__eq` dispatch.
pub fn raw_eq(a: Value, b: Value) -> bool {
    a == b
}

/// `a < b` for numbers and strings; `None` asks for `__lt`.
pub fn less_than(a: Value, b: Value, strings: &StringPool) -> Option<bool> {
    match (a, b) {
        (Value::Integer(x), Value::Integer(y)) => Some(x < y),
        (Value::Float(x), Value::Float(y)) => Some(x < y),
        (Value::Integer(x), Value::Float(y)) => Some(int_lt_float(x, y)),
        (Value::Float(x), Value::Integer(y)) => Some(float_lt_int(x, y)),
        (Value::Str(x), Value::Str(y)) => Some(strings.bytes(x) < strings.bytes(y)),
        _ => None,
    }
}

/// `a <= b` for numbers and strings; `None` asks for `__le`.
pub fn less_equal(a: Value, b: Value, strings: &StringPool) -> Option<bool> {
    match (a, b) {
        (Value::Integer(x), Value::Integer(y)) => Some(x <= y),
        (Value::Float(x), Value::Float(y)) => Some(x <= y),
        (Value::Integer(x), Value::Float(y)) => Some(int_le_float(x, y)),
        (Value::Float(x), Value::Integer(y)) => Some(float_le_int(x, y)),
        (Value::Str(x), Value::Str(y)) => Some(strings.bytes(x) <= strings.bytes(y)),
        _ => None,
    }
}

// Exact mixed comparisons. 2^63 is the first double past i64::MAX and
// -2^63 is exactly representable, so floor/ceil against those bounds
// decide without precision loss.

const TWO_POW_63: f64 = 9_223_372_036_854_775_808.0;

fn int_lt_float(i: i64, f: f64) -> bool {
    if f.is_nan() {
        return false;
    }
    if f >= TWO_POW_63 {
        return true;
    }
    if f < -TWO_POW_63 {
        return false;
    }
    // f is in integer range: i < f ⇔ i < ceil(f).
    i < f.ceil() as i64
}

fn int_le_float(i: i64, f: f64) -> bool {
    if f.is_nan() {
        return false;
    }
    if f >= TWO_POW_63 {
        return true;
    }
    if f < -TWO_POW_63 {
        return false;
    }
    // i <= f ⇔ i <= floor(f).
    i <= f.floor() as i64
}

fn float_lt_int(f: f64, i: i64) -> bool {
    if f.is_nan() {
        return false;
    }
    if f >= TWO_POW_63 {
        return false;
    }
    if f < -TWO_POW_63 {
        return true;
    }
    // f < i ⇔ floor(f) < i.
    (f.floor() as i64) < i
}

fn float_le_int(f: f64, i: i64) -> bool {
    if f.is_nan() {
        return false;
    }
    if f >= TWO_POW_63 {
        return false;
    }
    if f < -TWO_POW_63 {
        return true;
    }
    // f <= i ⇔ ceil(f) <= i.
    (f.ceil() as i64) <= i
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_ordering() {
        let s = StringPool::new();
        assert_eq!(less_than(Value::Integer(1), Value::Integer(2), &s), Some(true));
        assert_eq!(less_equal(Value::Integer(2), Value::Integer(2), &s), Some(true));
        assert_eq!(less_than(Value::Integer(2), Value::Integer(2), &s), Some(false));
    }

    #[test]
    fn test_mixed_exact_comparison() {
        let s = StringPool::new();
        // i64::MAX < 2^63 even though the cast of i64::MAX rounds up.
        assert_eq!(
            less_than(Value::Integer(i64::MAX), Value::Float(TWO_POW_63), &s),
            Some(true)
        );
        assert_eq!(
            less_than(Value::Float(TWO_POW_63), Value::Integer(i64::MAX), &s),
            Some(false)
        );
        assert_eq!(
            less_than(Value::Integer(3), Value::Float(3.5), &s),
            Some(true)
        );
        assert_eq!(
            less_than(Value::Float(3.5), Value::Integer(4), &s),
            Some(true)
        );
        assert_eq!(
            less_equal(Value::Float(3.0), Value::Integer(3), &s),
            Some(true)
        );
    }

    #[test]
    fn test_nan_comparisons_false() {
        let s = StringPool::new();
        let nan = Value::Float(f64::NAN);
        assert_eq!(less_than(nan, Value::Integer(0), &s), Some(false));
        assert_eq!(less_than(Value::Integer(0), nan, &s), Some(false));
        assert_eq!(less_equal(nan, nan, &s), Some(false));
    }

    #[test]
    fn test_string_ordering_bytewise() {
        let mut s = StringPool::new();
        let a = Value::Str(s.intern(b"abc"));
        let b = Value::Str(s.intern(b"abd"));
        let prefix = Value::Str(s.intern(b"ab"));
        assert_eq!(less_than(a, b, &s), Some(true));
        assert_eq!(less_than(prefix, a, &s), Some(true));
        assert_eq!(less_equal(a, a, &s), Some(true));
    }

    #[test]
    fn test_cross_type_needs_meta() {
        let mut s = StringPool::new();
        let str_one = Value::Str(s.intern(b"1"));
        assert_eq!(less_than(str_one, Value::Integer(2), &s), None);
        assert_eq!(less_than(Value::Nil, Value::Nil, &s), None);
    }

    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_mixed_agrees_with_exact_math(i in -(1i64<<53)..(1i64<<53), f in -1e16f64..1e16) {
            let s = StringPool::new();
            // Inside the 53-bit window both orders are exactly
            // representable, so f64 comparison is the ground truth.
            prop_assert_eq!(
                less_than(Value::Integer(i), Value::Float(f), &s),
                Some((i as f64) < f)
            );
            prop_assert_eq!(
                less_equal(Value::Float(f), Value::Integer(i), &s),
                Some(f <= i as f64)
            );
        }
    }
}
