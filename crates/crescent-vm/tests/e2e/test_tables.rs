use super::helpers::*;
use crescent_core::value::Value;

#[test]
fn test_constructor_and_border() {
    run_check_ints("local t = {10, 20, 30} t[4] = 40 return #t", &[4]);
}

#[test]
fn test_constructor_mixed_fields() {
    run_check_ints(
        "local t = {1, 2, x = 10, [100] = 20, 3} return t[1], t[2], t[3], t.x, t[100], #t",
        &[1, 2, 3, 10, 20, 3],
    );
}

#[test]
fn test_index_read_write() {
    run_check_ints(
        "local t = {} t.a = 1 t['b'] = 2 t[1] = 3 return t.a, t.b, t[1]",
        &[1, 2, 3],
    );
}

#[test]
fn test_missing_keys_are_nil() {
    let (results, _) = run_lua("local t = {} return t.missing, t[99]");
    assert_nil(&results, 0);
    assert_nil(&results, 1);
}

#[test]
fn test_float_key_normalization() {
    run_check_ints(
        "local t = {} t[2.0] = 7 return t[2]",
        &[7],
    );
}

#[test]
fn test_nil_key_errors() {
    let msg = run_lua_err("local t = {} local k t[k] = 1");
    assert!(msg.contains("table index is nil"), "{msg}");
}

#[test]
fn test_nan_key_errors() {
    let msg = run_lua_err("local t = {} local nan = 0/0 t[nan] = 1");
    assert!(msg.contains("table index is NaN"), "{msg}");
}

#[test]
fn test_clearing_shrinks_border() {
    run_check_ints(
        "local t = {1, 2, 3, 4} t[4] = nil t[3] = nil return #t",
        &[2],
    );
}

#[test]
fn test_length_of_empty() {
    run_check_ints("return #{}", &[0]);
}

#[test]
fn test_multret_constructor() {
    run_check_ints(
        "local function three() return 7, 8, 9 end local t = {0, three()} return #t, t[2], t[4]",
        &[4, 7, 9],
    );
}

#[test]
fn test_large_constructor_uses_setlist_pages() {
    // More than one SETLIST flush (50 per page).
    let items: Vec<String> = (1..=120).map(|i| i.to_string()).collect();
    let src = format!("local t = {{{}}} return #t, t[1], t[60], t[120]", items.join(","));
    run_check_ints(&src, &[120, 1, 60, 120]);
}

#[test]
fn test_next_traverses_everything() {
    run_check_ints(
        "local t = {10, 20, x = 30}\n\
         local count, sum = 0, 0\n\
         local k, v = next(t)\n\
         while k ~= nil do\n\
           count = count + 1\n\
           sum = sum + v\n\
           k, v = next(t, k)\n\
         end\n\
         return count, sum",
        &[3, 60],
    );
}

#[test]
fn test_next_invalid_key_errors() {
    let msg = run_lua_err("local t = {} return next(t, 42)");
    assert!(msg.contains("invalid key to 'next'"), "{msg}");
}

#[test]
fn test_pairs_iteration() {
    run_check_ints(
        "local t = {1, 2, 3, extra = 4}\n\
         local sum = 0\n\
         for _, v in pairs(t) do sum = sum + v end\n\
         return sum",
        &[10],
    );
}

#[test]
fn test_ipairs_stops_at_hole() {
    run_check_ints(
        "local t = {1, 2, nil, 4}\n\
         local last = 0\n\
         for i in ipairs(t) do last = i end\n\
         return last",
        &[2],
    );
}

#[test]
fn test_rawget_rawset_rawlen() {
    run_check_ints(
        "local t = setmetatable({}, {__index = function() return 99 end,\n\
                                     __newindex = function() error('no') end})\n\
         rawset(t, 'x', 5)\n\
         return rawget(t, 'x'), rawget(t, 'y') == nil and 1 or 0, rawlen({1,2})",
        &[5, 1, 2],
    );
}

#[test]
fn test_rawequal() {
    let (results, _) = run_lua(
        "local a, b = {}, {}\n\
         local mt = {__eq = function() return true end}\n\
         setmetatable(a, mt) setmetatable(b, mt)\n\
         return rawequal(a, b), rawequal(a, a), a == b",
    );
    assert_bool(&results, 0, false);
    assert_bool(&results, 1, true);
    assert_bool(&results, 2, true);
}

#[test]
fn test_table_identity() {
    let (results, _) = run_lua("local a = {} local b = a local c = {} return a == b, a == c");
    assert_bool(&results, 0, true);
    assert_bool(&results, 1, false);
}

#[test]
fn test_tables_share_mutations() {
    run_check_ints("local a = {} local b = a b.x = 42 return a.x", &[42]);
}

#[test]
fn test_select_builtin() {
    let (results, _) = run_lua("return select('#', 1, 2, 3), select(2, 'a', 'b', 'c')");
    assert_int(&results, 0, 3);
    match results.get(1) {
        Some(Value::Str(_)) => {}
        other => panic!("expected string, got {other:?}"),
    }
    assert_eq!(results.len(), 3); // select(2, ...) yields two values
}
