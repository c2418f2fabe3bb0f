use super::helpers::*;

#[test]
fn test_constant_expression() {
    run_check_ints("return 1 + 2 * 3", &[7]);
}

#[test]
fn test_runtime_arithmetic() {
    // Through registers, not constant folding.
    run_check_ints("local a = 1 local b = 2 local c = 3 return a + b * c", &[7]);
}

#[test]
fn test_hex_literal_wraps() {
    run_check_ints("return 0xFFFFFFFFFFFFFFFF", &[-1]);
}

#[test]
fn test_integer_arithmetic_stays_integer() {
    run_check_ints("local a = 7 local b = 2 return a // b, a % b, a * b", &[3, 1, 14]);
}

#[test]
fn test_division_always_float() {
    let (results, _) = run_lua("local a = 8 return a / 2");
    assert_float(&results, 0, 4.0);
}

#[test]
fn test_pow_always_float() {
    let (results, _) = run_lua("local a = 2 return a ^ 10");
    assert_float(&results, 0, 1024.0);
}

#[test]
fn test_mixed_promotes_to_float() {
    let (results, _) = run_lua("local a = 1 return a + 0.5");
    assert_float(&results, 0, 1.5);
}

#[test]
fn test_integer_overflow_wraps() {
    run_check_ints(
        "local max = 0x7FFFFFFFFFFFFFFF return max + 1",
        &[i64::MIN],
    );
}

#[test]
fn test_unary_minus() {
    run_check_ints("local a = 5 return -a", &[-5]);
    let (results, _) = run_lua("local a = 2.5 return -a");
    assert_float(&results, 0, -2.5);
}

#[test]
fn test_bitwise_ops() {
    run_check_ints(
        "local a = 0xF0 local b = 0x0F return a & b, a | b, a ~ b, ~a",
        &[0, 0xFF, 0xFF, !0xF0],
    );
}

#[test]
fn test_shifts() {
    run_check_ints(
        "local one = 1 return one << 4, 16 >> 4, one << 64, one >> 64",
        &[16, 1, 0, 0],
    );
}

#[test]
fn test_negative_shift_reverses() {
    run_check_ints("local a = 16 local n = -4 return a << n", &[1]);
}

#[test]
fn test_shr_is_logical() {
    run_check_ints("local a = -1 return a >> 1", &[i64::MAX]);
}

#[test]
fn test_float_modulo_sign() {
    let (results, _) = run_lua("local a = 5.5 return a % -2.0");
    assert_float(&results, 0, -0.5);
}

#[test]
fn test_integer_mod_sign_of_divisor() {
    run_check_ints("local a = -5 local b = 3 return a % b, 5 % -3", &[1, -1]);
}

#[test]
fn test_string_coercion_keeps_integer() {
    run_check_ints("local s = '10' return s + 5", &[15]);
}

#[test]
fn test_string_float_coercion() {
    let (results, _) = run_lua("local s = '1.5' return s * 2");
    assert_float(&results, 0, 3.0);
}

#[test]
fn test_divide_by_zero_integer_errors() {
    let msg = run_lua_err("local a = 1 local b = 0 return a // b");
    assert!(msg.contains("n//0"), "{msg}");
    let msg = run_lua_err("local a = 1 local b = 0 return a % b");
    assert!(msg.contains("n%"), "{msg}");
}

#[test]
fn test_float_divide_by_zero_is_inf() {
    let (results, _) = run_lua("local a = 1.0 return a / 0");
    assert_float(&results, 0, f64::INFINITY);
}

#[test]
fn test_bitwise_on_fractional_float_errors() {
    let msg = run_lua_err("local f = 1.5 return f & 1");
    assert!(msg.contains("no integer representation"), "{msg}");
}

#[test]
fn test_bitwise_on_integral_float_ok() {
    run_check_ints("local f = 6.0 return f & 3", &[2]);
}

#[test]
fn test_arith_on_nil_errors() {
    let msg = run_lua_err("local x return x + 1");
    assert!(msg.contains("attempt to perform arithmetic"), "{msg}");
    assert!(msg.contains("nil"), "{msg}");
}

#[test]
fn test_comparisons() {
    let (results, _) = run_lua(
        "local a, b = 1, 2 return a < b, a <= 1, b > 10, 'abc' < 'abd', 'ab' < 'abc'",
    );
    assert_bool(&results, 0, true);
    assert_bool(&results, 1, true);
    assert_bool(&results, 2, false);
    assert_bool(&results, 3, true);
    assert_bool(&results, 4, true);
}

#[test]
fn test_mixed_number_comparison_exact() {
    // 2^63 as float is strictly above i64::MAX.
    let (results, _) = run_lua(
        "local max = 0x7FFFFFFFFFFFFFFF local f = 9223372036854775808.0 return max < f, f <= max",
    );
    assert_bool(&results, 0, true);
    assert_bool(&results, 1, false);
}

#[test]
fn test_int_float_equality() {
    let (results, _) = run_lua("local a = 3 return a == 3.0, a == 3.5, 0.0 == 0");
    assert_bool(&results, 0, true);
    assert_bool(&results, 1, false);
    assert_bool(&results, 2, true);
}

#[test]
fn test_compare_string_number_errors() {
    let msg = run_lua_err("local a = 1 local b = 'x' return a < b");
    assert!(msg.contains("attempt to compare"), "{msg}");
}

#[test]
fn test_concat() {
    let (results, st) = run_lua("local a = 'x' return a .. 'y' .. 'z'");
    assert_str(&results, 0, "xyz", &st);
}

#[test]
fn test_concat_numbers() {
    let (results, st) = run_lua("local n = 1 local f = 0.5 return n .. '/' .. f");
    assert_str(&results, 0, "1/0.5", &st);
}

#[test]
fn test_concat_nil_errors() {
    let msg = run_lua_err("local x return 'a' .. x");
    assert!(msg.contains("attempt to concatenate"), "{msg}");
}

#[test]
fn test_not_and_length() {
    let (results, _) = run_lua("local s = 'hello' return not s, not nil, #s");
    assert_bool(&results, 0, false);
    assert_bool(&results, 1, true);
    assert_int(&results, 2, 5);
}

#[test]
fn test_tonumber_builtin() {
    let (results, _) = run_lua(
        "return tonumber('42'), tonumber('0x10'), tonumber('zz'), tonumber('ff', 16)",
    );
    assert_int(&results, 0, 42);
    assert_int(&results, 1, 16);
    assert_nil(&results, 2);
    assert_int(&results, 3, 255);
}

#[test]
fn test_tostring_builtin() {
    let (results, st) = run_lua("return tostring(12), tostring(0.5), tostring(nil), tostring(true)");
    assert_str(&results, 0, "12", &st);
    assert_str(&results, 1, "0.5", &st);
    assert_str(&results, 2, "nil", &st);
    assert_str(&results, 3, "true", &st);
}
