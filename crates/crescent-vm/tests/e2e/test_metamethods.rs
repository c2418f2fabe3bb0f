use super::helpers::*;

#[test]
fn test_index_function() {
    let (results, st) = run_lua(
        "local t = setmetatable({}, {__index = function(_, k) return k .. '!' end})\n\
         return t.hi",
    );
    assert_str(&results, 0, "hi!", &st);
}

#[test]
fn test_index_table_chain() {
    run_check_ints(
        "local root = {x = 1}\n\
         local mid = setmetatable({y = 2}, {__index = root})\n\
         local leaf = setmetatable({}, {__index = mid})\n\
         return leaf.x, leaf.y",
        &[1, 2],
    );
}

#[test]
fn test_index_only_fires_on_miss() {
    run_check_ints(
        "local t = setmetatable({present = 1}, {__index = function() return 99 end})\n\
         return t.present, t.absent",
        &[1, 99],
    );
}

#[test]
fn test_index_chain_loop_errors() {
    let msg = run_lua_err(
        "local a, b = {}, {}\n\
         setmetatable(a, {__index = b})\n\
         setmetatable(b, {__index = a})\n\
         return a.missing",
    );
    assert!(msg.contains("'__index' chain too long"), "{msg}");
}

#[test]
fn test_newindex_function() {
    run_check_ints(
        "local log = {}\n\
         local t = setmetatable({}, {__newindex = function(_, k, v) log[k] = v * 2 end})\n\
         t.x = 21\n\
         return log.x, rawget(t, 'x') == nil and 1 or 0",
        &[42, 1],
    );
}

#[test]
fn test_newindex_table_redirect() {
    run_check_ints(
        "local store = {}\n\
         local t = setmetatable({}, {__newindex = store})\n\
         t.x = 7\n\
         return store.x",
        &[7],
    );
}

#[test]
fn test_newindex_skipped_for_existing_key() {
    run_check_ints(
        "local t = setmetatable({x = 1}, {__newindex = function() error('nope') end})\n\
         t.x = 2\n\
         return t.x",
        &[2],
    );
}

#[test]
fn test_arith_metamethods() {
    run_check_ints(
        "local mt = {__add = function(a, b) return a.v + b.v end,\n\
                     __mul = function(a, b) return a.v * b.v end}\n\
         local a = setmetatable({v = 6}, mt)\n\
         local b = setmetatable({v = 7}, mt)\n\
         return a + b, a * b",
        &[13, 42],
    );
}

#[test]
fn test_arith_metamethod_second_operand() {
    run_check_ints(
        "local mt = {__add = function(a, b)\n\
           if type(a) == 'number' then return a + b.v end\n\
           return a.v + b\n\
         end}\n\
         local w = setmetatable({v = 40}, mt)\n\
         return 2 + w, w + 2",
        &[42, 42],
    );
}

#[test]
fn test_unm_metamethod() {
    run_check_ints(
        "local w = setmetatable({v = 5}, {__unm = function(x) return -x.v end})\n\
         return -w",
        &[-5],
    );
}

#[test]
fn test_eq_metamethod() {
    let (results, _) = run_lua(
        "local mt = {__eq = function(a, b) return a.id == b.id end}\n\
         local a = setmetatable({id = 1}, mt)\n\
         local b = setmetatable({id = 1}, mt)\n\
         local c = setmetatable({id = 2}, mt)\n\
         return a == b, a == c, a ~= c",
    );
    assert_bool(&results, 0, true);
    assert_bool(&results, 1, false);
    assert_bool(&results, 2, true);
}

#[test]
fn test_eq_not_called_for_different_types() {
    let (results, _) = run_lua(
        "local a = setmetatable({}, {__eq = function() return true end})\n\
         return a == 5, a == 'x'",
    );
    assert_bool(&results, 0, false);
    assert_bool(&results, 1, false);
}

#[test]
fn test_lt_le_metamethods() {
    let (results, _) = run_lua(
        "local mt = {__lt = function(a, b) return a.v < b.v end,\n\
                     __le = function(a, b) return a.v <= b.v end}\n\
         local a = setmetatable({v = 1}, mt)\n\
         local b = setmetatable({v = 2}, mt)\n\
         return a < b, b < a, a <= b, b >= a",
    );
    assert_bool(&results, 0, true);
    assert_bool(&results, 1, false);
    assert_bool(&results, 2, true);
    assert_bool(&results, 3, true);
}

#[test]
fn test_le_falls_back_to_lt() {
    let (results, _) = run_lua(
        "local mt = {__lt = function(a, b) return a.v < b.v end}\n\
         local a = setmetatable({v = 1}, mt)\n\
         local b = setmetatable({v = 2}, mt)\n\
         return a <= b, b <= a",
    );
    assert_bool(&results, 0, true);
    assert_bool(&results, 1, false);
}

#[test]
fn test_len_metamethod() {
    run_check_ints(
        "local t = setmetatable({1, 2, 3}, {__len = function() return 99 end})\n\
         return #t",
        &[99],
    );
}

#[test]
fn test_concat_metamethod() {
    let (results, st) = run_lua(
        "local w = setmetatable({}, {__concat = function(a, b)\n\
           if type(a) == 'string' then return a .. '<w>' end\n\
           return '<w>' .. b\n\
         end})\n\
         return 'x' .. w, w .. 'y'",
    );
    assert_str(&results, 0, "x<w>", &st);
    assert_str(&results, 1, "<w>y", &st);
}

#[test]
fn test_call_metamethod() {
    run_check_ints(
        "local t = setmetatable({}, {__call = function(self, a, b) return a + b end})\n\
         return t(4, 5)",
        &[9],
    );
}

#[test]
fn test_tostring_metamethod() {
    let (results, st) = run_lua(
        "local t = setmetatable({}, {__tostring = function() return 'custom' end})\n\
         return tostring(t)",
    );
    assert_str(&results, 0, "custom", &st);
}

#[test]
fn test_metatable_protection() {
    let (results, st) = run_lua(
        "local t = setmetatable({}, {__metatable = 'locked'})\n\
         local ok, err = pcall(setmetatable, t, {})\n\
         return ok, getmetatable(t)",
    );
    assert_bool(&results, 0, false);
    assert_str(&results, 1, "locked", &st);
}

#[test]
fn test_getmetatable_plain() {
    let (results, _) = run_lua(
        "local mt = {}\n\
         local t = setmetatable({}, mt)\n\
         return getmetatable(t) == mt, getmetatable(5) == nil",
    );
    assert_bool(&results, 0, true);
    assert_bool(&results, 1, true);
}

#[test]
fn test_metatable_changes_visible_immediately() {
    run_check_ints(
        "local t = setmetatable({}, {__index = function() return 1 end})\n\
         local first = t.x\n\
         getmetatable(t).__index = function() return 2 end\n\
         return first, t.x",
        &[1, 2],
    );
}

#[test]
fn test_self_access_through_index() {
    // SELF (method call sugar) honors __index.
    run_check_ints(
        "local base = {}\n\
         function base:get() return self.v end\n\
         local obj = setmetatable({v = 42}, {__index = base})\n\
         return obj:get()",
        &[42],
    );
}
