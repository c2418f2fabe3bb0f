use super::helpers::*;

#[test]
fn test_upvalue_counter() {
    // Open-upvalue write-through and close-on-return.
    run_check_ints(
        "local function mk()\n\
           local x = 0\n\
           return function() x = x + 1 return x end\n\
         end\n\
         local f = mk()\n\
         f() f()\n\
         return f()",
        &[3],
    );
}

#[test]
fn test_closures_from_same_scope_share_upvalue() {
    run_check_ints(
        "local function mk()\n\
           local x = 0\n\
           local function inc() x = x + 1 end\n\
           local function get() return x end\n\
           return inc, get\n\
         end\n\
         local inc, get = mk()\n\
         inc() inc() inc()\n\
         return get()",
        &[3],
    );
}

#[test]
fn test_separate_activations_get_separate_upvalues() {
    run_check_ints(
        "local function mk()\n\
           local x = 0\n\
           return function() x = x + 1 return x end\n\
         end\n\
         local a, b = mk(), mk()\n\
         a() a()\n\
         return a(), b()",
        &[3, 1],
    );
}

#[test]
fn test_capture_through_two_levels() {
    run_check_ints(
        "local x = 10\n\
         local function outer()\n\
           return function() return x end\n\
         end\n\
         x = 20\n\
         return outer()()",
        &[20],
    );
}

#[test]
fn test_loop_variable_capture() {
    // Each iteration of a for loop gets a fresh variable.
    run_check_ints(
        "local fs = {}\n\
         for i = 1, 3 do fs[i] = function() return i end end\n\
         return fs[1](), fs[2](), fs[3]()",
        &[1, 2, 3],
    );
}

#[test]
fn test_block_scope_capture() {
    run_check_ints(
        "local f\n\
         do\n\
           local hidden = 42\n\
           f = function() return hidden end\n\
         end\n\
         return f()",
        &[42],
    );
}

#[test]
fn test_break_closes_upvalues() {
    run_check_ints(
        "local f\n\
         while true do\n\
           local v = 7\n\
           f = function() return v end\n\
           break\n\
         end\n\
         return f()",
        &[7],
    );
}

#[test]
fn test_upvalue_assignment_from_outside() {
    run_check_ints(
        "local x = 1\n\
         local function set(v) x = v end\n\
         local function get() return x end\n\
         set(99)\n\
         return get(), x",
        &[99, 99],
    );
}

#[test]
fn test_recursive_local_function() {
    run_check_ints(
        "local function fact(n)\n\
           if n <= 1 then return 1 end\n\
           return n * fact(n - 1)\n\
         end\n\
         return fact(6)",
        &[720],
    );
}

#[test]
fn test_global_environment_is_upvalue() {
    run_check_ints("g = 5 local function read() return g end return read()", &[5]);
}
