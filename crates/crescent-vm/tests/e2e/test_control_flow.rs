use super::helpers::*;

#[test]
fn test_if_elseif_else() {
    run_check_ints(
        "local function pick(n)\n\
           if n == 1 then return 10\n\
           elseif n == 2 then return 20\n\
           else return 30 end\n\
         end\n\
         return pick(1), pick(2), pick(9)",
        &[10, 20, 30],
    );
}

#[test]
fn test_while_loop() {
    run_check_ints(
        "local n, sum = 0, 0\n\
         while n < 10 do n = n + 1 sum = sum + n end\n\
         return sum",
        &[55],
    );
}

#[test]
fn test_repeat_until() {
    run_check_ints(
        "local n = 0\n\
         repeat n = n + 1 until n >= 5\n\
         return n",
        &[5],
    );
}

#[test]
fn test_repeat_sees_block_locals_in_condition() {
    run_check_ints(
        "local n = 0\n\
         repeat\n\
           local done = n >= 3\n\
           n = n + 1\n\
         until done\n\
         return n",
        &[4],
    );
}

#[test]
fn test_numeric_for_basic() {
    run_check_ints(
        "local sum = 0 for i = 1, 10 do sum = sum + i end return sum",
        &[55],
    );
}

#[test]
fn test_numeric_for_step() {
    run_check_ints(
        "local sum = 0 for i = 10, 1, -2 do sum = sum + i end return sum",
        &[30],
    );
}

#[test]
fn test_numeric_for_zero_iterations() {
    run_check_ints(
        "local n = 0 for i = 10, 1 do n = n + 1 end return n",
        &[0],
    );
}

#[test]
fn test_numeric_for_iteration_count() {
    // floor((l - i)/s) + 1 iterations exactly.
    run_check_ints(
        "local n = 0 for i = 1, 10, 3 do n = n + 1 end return n",
        &[4],
    );
}

#[test]
fn test_numeric_for_at_integer_max_terminates() {
    // The control variable must not wrap past the limit.
    run_check_ints(
        "local n = 0\n\
         for i = 0x7FFFFFFFFFFFFFFD, 0x7FFFFFFFFFFFFFFF do n = n + 1 end\n\
         return n",
        &[3],
    );
}

#[test]
fn test_numeric_for_at_integer_min_descending() {
    run_check_ints(
        "local n = 0\n\
         for i = -0x7FFFFFFFFFFFFFFE, -0x8000000000000000, -1 do n = n + 1 end\n\
         return n",
        &[3],
    );
}

#[test]
fn test_numeric_for_float_mode() {
    run_check_ints(
        "local n = 0 for i = 1.0, 2.0, 0.5 do n = n + 1 end return n",
        &[3],
    );
}

#[test]
fn test_numeric_for_float_limit_clamps() {
    // A fractional limit in an integer loop rounds toward the
    // interior.
    run_check_ints(
        "local n = 0 for i = 1, 3.5 do n = n + 1 end return n",
        &[3],
    );
}

#[test]
fn test_for_step_zero_errors() {
    let msg = run_lua_err("for i = 1, 10, 0 do end");
    assert!(msg.contains("'for' step is zero"), "{msg}");
}

#[test]
fn test_for_non_number_errors() {
    let msg = run_lua_err("for i = {}, 10 do end");
    assert!(msg.contains("'for' initial value must be a number"), "{msg}");
}

#[test]
fn test_loop_variable_is_local_copy() {
    run_check_ints(
        "local last = 0\n\
         for i = 1, 3 do last = i i = 99 end\n\
         return last",
        &[3],
    );
}

#[test]
fn test_generic_for_with_next() {
    run_check_ints(
        "local t = {5, 6, 7}\n\
         local sum = 0\n\
         for k, v in next, t do sum = sum + v end\n\
         return sum",
        &[18],
    );
}

#[test]
fn test_break_from_loops() {
    run_check_ints(
        "local n = 0\n\
         for i = 1, 100 do\n\
           if i > 5 then break end\n\
           n = i\n\
         end\n\
         return n",
        &[5],
    );
}

#[test]
fn test_nested_break() {
    run_check_ints(
        "local hits = 0\n\
         for i = 1, 3 do\n\
           while true do hits = hits + 1 break end\n\
         end\n\
         return hits",
        &[3],
    );
}

#[test]
fn test_goto_continue_pattern() {
    run_check_ints(
        "local sum = 0\n\
         for i = 1, 10 do\n\
           if i % 2 == 0 then goto continue end\n\
           sum = sum + i\n\
           ::continue::\n\
         end\n\
         return sum",
        &[25],
    );
}

#[test]
fn test_goto_backward() {
    run_check_ints(
        "local n = 0\n\
         ::top::\n\
         n = n + 1\n\
         if n < 3 then goto top end\n\
         return n",
        &[3],
    );
}

#[test]
fn test_and_or_short_circuit() {
    run_check_ints(
        "local hits = 0\n\
         local function bump() hits = hits + 1 return true end\n\
         local _ = false and bump()\n\
         local _ = true or bump()\n\
         local _ = true and bump()\n\
         return hits",
        &[1],
    );
}

#[test]
fn test_and_or_values() {
    let (results, st) = run_lua(
        "local a = nil\n\
         return a or 'default', 1 and 'second', nil and 1, false or nil",
    );
    assert_str(&results, 0, "default", &st);
    assert_str(&results, 1, "second", &st);
    assert_nil(&results, 2);
    assert_nil(&results, 3);
}
