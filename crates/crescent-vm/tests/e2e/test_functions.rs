use super::helpers::*;
use crescent_core::value::Value;

#[test]
fn test_call_and_return() {
    run_check_ints(
        "local function add(a, b) return a + b end return add(2, 3)",
        &[5],
    );
}

#[test]
fn test_multiple_returns() {
    run_check_ints(
        "local function three() return 1, 2, 3 end return three()",
        &[1, 2, 3],
    );
}

#[test]
fn test_call_truncates_in_middle_of_list() {
    run_check_ints(
        "local function three() return 1, 2, 3 end return three(), 9",
        &[1, 9],
    );
}

#[test]
fn test_parens_truncate_to_one() {
    run_check_ints(
        "local function three() return 1, 2, 3 end return (three())",
        &[1],
    );
}

#[test]
fn test_missing_args_are_nil() {
    let (results, _) = run_lua("local function f(a, b) return a, b end return f(1)");
    assert_int(&results, 0, 1);
    assert_nil(&results, 1);
}

#[test]
fn test_extra_args_dropped() {
    run_check_ints("local function f(a) return a end return f(1, 2, 3)", &[1]);
}

#[test]
fn test_tail_call_deep_recursion() {
    // 100k self tail calls must not grow the frame chain.
    let (results, st) = run_lua(
        "local function s(n)\n\
           if n == 0 then return 'done' end\n\
           return s(n - 1)\n\
         end\n\
         return s(100000)",
    );
    assert_str(&results, 0, "done", &st);
}

#[test]
fn test_mutual_tail_recursion() {
    let (results, st) = run_lua(
        "local even, odd\n\
         function even(n) if n == 0 then return 'even' end return odd(n - 1) end\n\
         function odd(n) if n == 0 then return 'odd' end return even(n - 1) end\n\
         return even(50001)",
    );
    assert_str(&results, 0, "odd", &st);
}

#[test]
fn test_non_tail_recursion_overflows() {
    let (results, st) = run_lua(
        "local function f(n) return 1 + f(n + 1) end\n\
         local ok, err = pcall(f, 1)\n\
         return ok, err",
    );
    assert_bool(&results, 0, false);
    assert_str(&results, 1, "stack overflow", &st);
}

#[test]
fn test_varargs() {
    run_check_ints(
        "local function count(...) return select('#', ...) end\n\
         return count(), count(1), count(1, nil, 3)",
        &[0, 1, 3],
    );
}

#[test]
fn test_vararg_forwarding() {
    run_check_ints(
        "local function sum(...)\n\
           local a, b, c = ...\n\
           return (a or 0) + (b or 0) + (c or 0)\n\
         end\n\
         local function fwd(...) return sum(...) end\n\
         return fwd(1, 2, 3)",
        &[6],
    );
}

#[test]
fn test_vararg_in_table_constructor() {
    run_check_ints(
        "local function pack(...) return {...} end\n\
         local t = pack(7, 8, 9)\n\
         return #t, t[3]",
        &[3, 9],
    );
}

#[test]
fn test_vararg_mixed_with_params() {
    run_check_ints(
        "local function f(first, ...)\n\
           local second = ...\n\
           return first, second\n\
         end\n\
         return f(1, 2, 3)",
        &[1, 2],
    );
}

#[test]
fn test_method_call_sugar() {
    run_check_ints(
        "local obj = {value = 41}\n\
         function obj:bump() self.value = self.value + 1 return self.value end\n\
         return obj:bump()",
        &[42],
    );
}

#[test]
fn test_multiple_assignment_from_call() {
    run_check_ints(
        "local function two() return 10, 20 end\n\
         local a, b, c = two()\n\
         return a, b, c == nil and 1 or 0",
        &[10, 20, 1],
    );
}

#[test]
fn test_swap_assignment() {
    run_check_ints("local a, b = 1, 2 a, b = b, a return a, b", &[2, 1]);
}

#[test]
fn test_assignment_conflict_resolution() {
    // `t[1]` refers to the original table even though `t` is also
    // assigned in the same statement.
    run_check_ints(
        "local t = {1}\n\
         local old = t\n\
         local u = {}\n\
         t, t[1] = u, 5\n\
         return t == u and 1 or 0, old[1], u[1] == nil and 1 or 0",
        &[1, 5, 1],
    );
}

#[test]
fn test_functions_are_values() {
    let (results, _) = run_lua(
        "local function f() end\n\
         local g = f\n\
         return f == g, type(f)",
    );
    assert_bool(&results, 0, true);
    match results.get(1) {
        Some(Value::Str(_)) => {}
        other => panic!("expected type string, got {other:?}"),
    }
}

#[test]
fn test_call_non_function_errors() {
    let msg = run_lua_err("local x = 5 x()");
    assert!(msg.contains("attempt to call a number value"), "{msg}");
}
