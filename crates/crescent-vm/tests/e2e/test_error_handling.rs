use super::helpers::*;
use crescent_core::value::Value;

#[test]
fn test_pcall_success() {
    run_check_ints(
        "local ok, a, b = pcall(function() return 1, 2 end)\n\
         return ok and 1 or 0, a, b",
        &[1, 1, 2],
    );
}

#[test]
fn test_pcall_catches_error() {
    let (results, st) = run_lua(
        "local ok, err = pcall(function() error('boom') end)\n\
         return ok, err",
    );
    assert_bool(&results, 0, false);
    match results.get(1) {
        Some(Value::Str(id)) => {
            let msg = String::from_utf8_lossy(st.strings.bytes(*id)).into_owned();
            assert!(msg.contains("boom"), "{msg}");
            // error() prefixes string messages with a location.
            assert!(msg.contains(':'), "{msg}");
        }
        other => panic!("expected string error, got {other:?}"),
    }
}

#[test]
fn test_error_with_non_string_value() {
    run_check_ints(
        "local ok, err = pcall(function() error({code = 42}) end)\n\
         return ok and 1 or 0, err.code",
        &[0, 42],
    );
}

#[test]
fn test_error_level_zero_no_prefix() {
    let (results, st) = run_lua(
        "local ok, err = pcall(function() error('raw', 0) end)\n\
         return err",
    );
    assert_str(&results, 0, "raw", &st);
}

#[test]
fn test_runtime_error_has_location() {
    let (results, st) = run_lua(
        "local ok, err = pcall(function()\n\
           local x\n\
           return x.field\n\
         end)\n\
         return ok, err",
    );
    assert_bool(&results, 0, false);
    match results.get(1) {
        Some(Value::Str(id)) => {
            let msg = String::from_utf8_lossy(st.strings.bytes(*id)).into_owned();
            assert!(msg.contains("test:3:"), "{msg}");
            assert!(msg.contains("attempt to index"), "{msg}");
        }
        other => panic!("expected string error, got {other:?}"),
    }
}

#[test]
fn test_assert_passes_values_through() {
    run_check_ints("return assert(1, 'unused', 3)", &[1]);
}

#[test]
fn test_assert_failure() {
    let (results, st) = run_lua("local ok, err = pcall(assert, false, 'custom') return err");
    assert_str(&results, 0, "custom", &st);
    let (results, st) = run_lua("local ok, err = pcall(assert, nil) return err");
    match results.first() {
        Some(Value::Str(id)) => {
            let msg = String::from_utf8_lossy(st.strings.bytes(*id)).into_owned();
            assert!(msg.contains("assertion failed!"), "{msg}");
        }
        other => panic!("expected string, got {other:?}"),
    }
}

#[test]
fn test_nested_pcall() {
    run_check_ints(
        "local ok1, ok2 = pcall(function()\n\
           local inner_ok = pcall(error, 'inner')\n\
           return inner_ok\n\
         end)\n\
         return ok1 and 1 or 0, ok2 and 1 or 0",
        &[1, 0],
    );
}

#[test]
fn test_error_propagates_through_unprotected_frames() {
    let (results, _) = run_lua(
        "local function deep3() error('deep') end\n\
         local function deep2() deep3() end\n\
         local function deep1() deep2() end\n\
         local ok = pcall(deep1)\n\
         return ok",
    );
    assert_bool(&results, 0, false);
}

#[test]
fn test_state_usable_after_error() {
    run_check_ints(
        "pcall(function() error('x') end)\n\
         local t = {1, 2, 3}\n\
         return #t + 39",
        &[42],
    );
}

#[test]
fn test_xpcall_handler_transforms_error() {
    let (results, st) = run_lua(
        "local ok, msg = xpcall(function() error('orig') end,\n\
                                function(e) return 'handled: ' .. e end)\n\
         return ok, msg",
    );
    assert_bool(&results, 0, false);
    match results.get(1) {
        Some(Value::Str(id)) => {
            let msg = String::from_utf8_lossy(st.strings.bytes(*id)).into_owned();
            assert!(msg.starts_with("handled: "), "{msg}");
            assert!(msg.contains("orig"), "{msg}");
        }
        other => panic!("expected string, got {other:?}"),
    }
}

#[test]
fn test_xpcall_success_path() {
    run_check_ints(
        "local ok, v = xpcall(function() return 7 end, function() return 'unused' end)\n\
         return ok and 1 or 0, v",
        &[1, 7],
    );
}

#[test]
fn test_xpcall_with_arguments() {
    run_check_ints(
        "local ok, v = xpcall(function(a, b) return a * b end, tostring, 6, 7)\n\
         return ok and 1 or 0, v",
        &[1, 42],
    );
}

#[test]
fn test_pcall_of_non_function() {
    let (results, _) = run_lua("return pcall(5)");
    assert_bool(&results, 0, false);
}

#[test]
fn test_upvalues_closed_on_unwind() {
    // The upvalue captured before the error still holds its value
    // after the protected call unwinds the stack.
    run_check_ints(
        "local get\n\
         pcall(function()\n\
           local v = 42\n\
           get = function() return v end\n\
           error('unwind')\n\
         end)\n\
         return get()",
        &[42],
    );
}

#[test]
fn test_error_value_is_first_class() {
    let (results, _) = run_lua(
        "local sentinel = {}\n\
         local ok, err = pcall(function() error(sentinel) end)\n\
         return err == sentinel",
    );
    assert_bool(&results, 0, true);
}

#[test]
fn test_uncaught_error_reaches_host() {
    let msg = run_lua_err("error('top level')");
    assert!(msg.contains("top level"), "{msg}");
}

#[test]
fn test_syntax_error_reported_by_load() {
    let (results, st) = run_lua(
        "local f, err = load('return +++')\n\
         return f == nil, type(err)",
    );
    assert_bool(&results, 0, true);
    assert_str(&results, 1, "string", &st);
}

#[test]
fn test_load_runs_chunk() {
    run_check_ints("local f = load('return 1 + 1') return f()", &[2]);
}

#[test]
fn test_load_with_env() {
    run_check_ints(
        "local env = {x = 42}\n\
         local f = load('return x', 'chunk', 't', env)\n\
         return f()",
        &[42],
    );
}

#[test]
fn test_load_with_varargs() {
    run_check_ints(
        "local f = load('local a, b = ... return a + b')\n\
         return f(30, 12)",
        &[42],
    );
}
