//! The base library: the handful of global functions the runtime
//! itself promises (`error`, `assert`, `pcall`, `setmetatable`, …),
//! registered through the embedding API exactly as host code would.
//!
//! The io/os/math/string/table/utf8 libraries are external
//! collaborators and are not defined here.

use crate::api::MULTRET;
use crate::dispatch::{self, call_metamethod};
use crate::error::{LuaError, Status};
use crate::metamethod::{self, Event};
use crate::vm::State;
use crescent_core::string::StrId;
use crescent_core::value::Value;

/// Register the base functions into the globals table, plus `_G` and
/// `_VERSION`.
pub fn open_base(st: &mut State) -> Result<(), LuaError> {
    st.register("print", base_print)?;
    st.register("type", base_type)?;
    st.register("tostring", base_tostring)?;
    st.register("tonumber", base_tonumber)?;
    st.register("error", base_error)?;
    st.register("assert", base_assert)?;
    st.register("pcall", base_pcall)?;
    st.register("xpcall", base_xpcall)?;
    st.register("select", base_select)?;
    st.register("rawget", base_rawget)?;
    st.register("rawset", base_rawset)?;
    st.register("rawequal", base_rawequal)?;
    st.register("rawlen", base_rawlen)?;
    st.register("next", base_next)?;
    st.register("pairs", base_pairs)?;
    st.register("ipairs", base_ipairs)?;
    st.register("setmetatable", base_setmetatable)?;
    st.register("getmetatable", base_getmetatable)?;
    st.register("load", base_load)?;

    let globals = st.globals();
    st.push(Value::Table(globals))?;
    st.set_global("_G")?;
    st.push_string("Lua 5.3")?;
    st.set_global("_VERSION")?;
    Ok(())
}

// ---- Argument helpers ----

fn arg_error(st: &State, n: usize, fname: &str, msg: &str) -> LuaError {
    st.runtime_error(format!("bad argument #{n} to '{fname}' ({msg})"))
}

fn check_any(st: &State, n: usize, fname: &str) -> Result<Value, LuaError> {
    if st.get_top() < n {
        return Err(arg_error(st, n, fname, "value expected"));
    }
    Ok(st.value_at(n as isize))
}

fn check_table(st: &State, n: usize, fname: &str) -> Result<Value, LuaError> {
    match check_any(st, n, fname)? {
        v @ Value::Table(_) => Ok(v),
        v => Err(arg_error(
            st,
            n,
            fname,
            &format!("table expected, got {}", v.type_name()),
        )),
    }
}

// ---- tostring support ----

/// `tostring` semantics: `__tostring` first, then the built-in
/// renderings (tables and functions print their identity).
pub fn tostring_value(st: &mut State, v: Value) -> Result<StrId, LuaError> {
    if let Some(handler) = metamethod::get_metamethod(&st.heap, &st.meta, v, Event::ToString) {
        let r = call_metamethod(st, handler, &[v])?;
        return match r {
            Value::Str(id) => Ok(id),
            _ => Err(st.runtime_error("'__tostring' must return a string")),
        };
    }
    let text = match v {
        Value::Nil => "nil".to_string(),
        Value::Boolean(true) => "true".to_string(),
        Value::Boolean(false) => "false".to_string(),
        Value::Integer(_) | Value::Float(_) => {
            crate::coerce::number_to_display(v).expect("numbers display")
        }
        Value::Str(id) => return Ok(id),
        Value::Table(r) => format!("table: 0x{:08x}", r.0),
        Value::LuaFn(id) => format!("function: 0x{:08x}", id.0),
        Value::NativeFn(id) => format!("function: builtin: 0x{:08x}", id.0),
        Value::UserData(r) => format!("userdata: 0x{:08x}", r.0),
    };
    Ok(st.strings.intern(text.as_bytes()))
}

// ---- Functions ----

fn base_print(st: &mut State) -> Result<i32, LuaError> {
    let n = st.get_top();
    let mut line = String::new();
    for i in 1..=n {
        let v = st.value_at(i as isize);
        let id = tostring_value(st, v)?;
        if i > 1 {
            line.push('\t');
        }
        line.push_str(&st.strings.display(id));
    }
    println!("{line}");
    Ok(0)
}

fn base_type(st: &mut State) -> Result<i32, LuaError> {
    let v = check_any(st, 1, "type")?;
    st.push_string(v.type_name())?;
    Ok(1)
}

fn base_tostring(st: &mut State) -> Result<i32, LuaError> {
    let v = check_any(st, 1, "tostring")?;
    let id = tostring_value(st, v)?;
    st.push(Value::Str(id))?;
    Ok(1)
}

fn base_tonumber(st: &mut State) -> Result<i32, LuaError> {
    if st.get_top() >= 2 && !st.is_none_or_nil(2) {
        // With a base the argument must be a string of digits.
        let base = st
            .to_integer(2)
            .ok_or_else(|| arg_error(st, 2, "tonumber", "number expected"))?;
        if !(2..=36).contains(&base) {
            return Err(arg_error(st, 2, "tonumber", "base out of range"));
        }
        let bytes = st
            .to_str_bytes(1)
            .ok_or_else(|| arg_error(st, 1, "tonumber", "string expected"))?
            .to_vec();
        match parse_in_base(&bytes, base as u32) {
            Some(i) => st.push_integer(i)?,
            None => st.push_nil()?,
        }
        return Ok(1);
    }
    let v = check_any(st, 1, "tonumber")?;
    match v {
        Value::Integer(_) | Value::Float(_) => st.push(v)?,
        Value::Str(id) => {
            let bytes = st.strings.bytes(id).to_vec();
            match crate::coerce::str_to_numeral(&bytes) {
                Some(n) => st.push(n.to_value())?,
                None => st.push_nil()?,
            }
        }
        _ => st.push_nil()?,
    }
    Ok(1)
}

fn parse_in_base(bytes: &[u8], base: u32) -> Option<i64> {
    let text = std::str::from_utf8(bytes).ok()?;
    let text = text.trim_matches(|c: char| c.is_ascii_whitespace());
    let (negative, digits) = match text.as_bytes().first()? {
        b'-' => (true, &text[1..]),
        b'+' => (false, &text[1..]),
        _ => (false, text),
    };
    if digits.is_empty() {
        return None;
    }
    let mut value: i64 = 0;
    for c in digits.chars() {
        let d = c.to_digit(36)?;
        if d >= base {
            return None;
        }
        value = value.wrapping_mul(base as i64).wrapping_add(d as i64);
    }
    Some(if negative { value.wrapping_neg() } else { value })
}

fn base_error(st: &mut State) -> Result<i32, LuaError> {
    let msg = st.value_at(1);
    let level = st.to_integer(2).unwrap_or(1);
    if level > 0 {
        if let Value::Str(id) = msg {
            // String errors gain a position prefix at the given level.
            let prefix = st.location_prefix((level - 1) as usize);
            let text = format!("{prefix}{}", st.strings.display(id));
            let id = st.strings.intern(text.as_bytes());
            return Err(LuaError::Value(Value::Str(id)));
        }
    }
    Err(LuaError::Value(msg))
}

fn base_assert(st: &mut State) -> Result<i32, LuaError> {
    let v = check_any(st, 1, "assert")?;
    if v.is_truthy() {
        // Pass every argument through.
        return Ok(st.get_top() as i32);
    }
    if st.get_top() >= 2 {
        let msg = st.value_at(2);
        if let Value::Str(id) = msg {
            let prefix = st.location_prefix(0);
            let text = format!("{prefix}{}", st.strings.display(id));
            let id = st.strings.intern(text.as_bytes());
            return Err(LuaError::Value(Value::Str(id)));
        }
        return Err(LuaError::Value(msg));
    }
    Err(LuaError::Value(Value::Str(st.strings.intern(
        format!("{}assertion failed!", st.location_prefix(0)).as_bytes(),
    ))))
}

fn base_pcall(st: &mut State) -> Result<i32, LuaError> {
    check_any(st, 1, "pcall")?;
    let n_args = st.get_top() - 1;
    let status = st.protected_call(n_args, MULTRET, None);
    let n_results = st.get_top();
    st.push_boolean(status == Status::Ok)?;
    st.insert(1);
    Ok((n_results + 1) as i32)
}

fn base_xpcall(st: &mut State) -> Result<i32, LuaError> {
    check_any(st, 1, "xpcall")?;
    check_any(st, 2, "xpcall")?;
    let n_args = st.get_top() - 2;
    // Re-push the function and arguments above the handler so the
    // protected call consumes copies.
    st.push_value(1)?;
    for i in 0..n_args {
        st.push_value(3 + i as isize)?;
    }
    let status = st.protected_call(n_args, MULTRET, Some(2));
    let first_result = 2 + n_args + 1;
    let n_results = st.get_top() + 1 - first_result;
    st.push_boolean(status == Status::Ok)?;
    st.insert(first_result as isize);
    Ok((n_results + 1) as i32)
}

fn base_select(st: &mut State) -> Result<i32, LuaError> {
    let n = st.get_top();
    if st.to_str_bytes(1) == Some(&b"#"[..]) {
        st.push_integer(n as i64 - 1)?;
        return Ok(1);
    }
    let i = st
        .to_integer(1)
        .ok_or_else(|| arg_error(st, 1, "select", "number expected"))?;
    let i = if i < 0 {
        let from_end = n as i64 + i;
        if from_end < 1 {
            return Err(arg_error(st, 1, "select", "index out of range"));
        }
        from_end
    } else if i == 0 {
        return Err(arg_error(st, 1, "select", "index out of range"));
    } else {
        i
    };
    if i as usize >= n {
        return Ok(0);
    }
    Ok((n as i64 - i) as i32)
}

fn base_rawget(st: &mut State) -> Result<i32, LuaError> {
    check_table(st, 1, "rawget")?;
    check_any(st, 2, "rawget")?;
    st.set_top(2)?;
    st.raw_get(1)?;
    Ok(1)
}

fn base_rawset(st: &mut State) -> Result<i32, LuaError> {
    check_table(st, 1, "rawset")?;
    check_any(st, 2, "rawset")?;
    check_any(st, 3, "rawset")?;
    st.set_top(3)?;
    st.raw_set(1)?;
    // Returns the table.
    Ok(1)
}

fn base_rawequal(st: &mut State) -> Result<i32, LuaError> {
    check_any(st, 1, "rawequal")?;
    check_any(st, 2, "rawequal")?;
    let eq = st.raw_equal(1, 2);
    st.push_boolean(eq)?;
    Ok(1)
}

fn base_rawlen(st: &mut State) -> Result<i32, LuaError> {
    match check_any(st, 1, "rawlen")? {
        Value::Table(_) | Value::Str(_) => {
            let len = st.raw_len(1);
            st.push_integer(len as i64)?;
            Ok(1)
        }
        _ => Err(arg_error(st, 1, "rawlen", "table or string expected")),
    }
}

fn base_next(st: &mut State) -> Result<i32, LuaError> {
    check_table(st, 1, "next")?;
    st.set_top(2)?;
    if st.next(1)? {
        Ok(2)
    } else {
        st.push_nil()?;
        Ok(1)
    }
}

fn base_pairs(st: &mut State) -> Result<i32, LuaError> {
    let v = check_any(st, 1, "pairs")?;
    // __pairs, when present, supplies the whole iteration triple.
    if let Some(handler) = {
        let pairs_id = st.strings.intern(b"__pairs");
        metamethod::metatable_of(&st.heap, v)
            .map(|mt| st.heap.table(mt).raw_get_str(pairs_id))
            .filter(|h| !h.is_nil())
    } {
        let func = st.top;
        st.push(handler)?;
        st.push(v)?;
        dispatch::call_value(st, func, 3)?;
        return Ok(3);
    }
    check_table(st, 1, "pairs")?;
    st.push_native(base_next, "next")?;
    st.push_value(1)?;
    st.push_nil()?;
    Ok(3)
}

fn ipairs_iterator(st: &mut State) -> Result<i32, LuaError> {
    let t = st.value_at(1);
    let i = st
        .to_integer(2)
        .ok_or_else(|| arg_error(st, 2, "ipairs", "number expected"))?
        + 1;
    let v = dispatch::table_get(st, t, Value::Integer(i))?;
    if v.is_nil() {
        st.push_nil()?;
        Ok(1)
    } else {
        st.push_integer(i)?;
        st.push(v)?;
        Ok(2)
    }
}

fn base_ipairs(st: &mut State) -> Result<i32, LuaError> {
    check_any(st, 1, "ipairs")?;
    st.push_native(ipairs_iterator, "ipairs_iterator")?;
    st.push_value(1)?;
    st.push_integer(0)?;
    Ok(3)
}

fn base_setmetatable(st: &mut State) -> Result<i32, LuaError> {
    let t = check_table(st, 1, "setmetatable")?;
    match check_any(st, 2, "setmetatable")? {
        Value::Nil | Value::Table(_) => {}
        _ => return Err(arg_error(st, 2, "setmetatable", "nil or table expected")),
    }
    // A __metatable field protects the current metatable.
    let protected_id = st.strings.intern(b"__metatable");
    if let Some(mt) = metamethod::metatable_of(&st.heap, t) {
        if !st.heap.table(mt).raw_get_str(protected_id).is_nil() {
            return Err(st.runtime_error("cannot change a protected metatable"));
        }
    }
    st.set_top(2)?;
    st.set_metatable(1)?;
    // Returns the table (now at the top).
    Ok(1)
}

fn base_getmetatable(st: &mut State) -> Result<i32, LuaError> {
    let v = check_any(st, 1, "getmetatable")?;
    match metamethod::metatable_of(&st.heap, v) {
        None => st.push_nil()?,
        Some(mt) => {
            // __metatable masks the real metatable.
            let protected_id = st.strings.intern(b"__metatable");
            let masked = st.heap.table(mt).raw_get_str(protected_id);
            if masked.is_nil() {
                st.push(Value::Table(mt))?;
            } else {
                st.push(masked)?;
            }
        }
    }
    Ok(1)
}

fn base_load(st: &mut State) -> Result<i32, LuaError> {
    let chunk = match check_any(st, 1, "load")? {
        Value::Str(id) => st.strings.bytes(id).to_vec(),
        v => {
            return Err(arg_error(
                st,
                1,
                "load",
                &format!("string expected, got {}", v.type_name()),
            ))
        }
    };
    let name = match st.to_str_bytes(2) {
        Some(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        None => String::from_utf8_lossy(&chunk).into_owned(),
    };
    // Argument 3 (mode) is accepted and ignored: chunks self-identify.
    let env = if st.get_top() >= 4 {
        Some(st.value_at(4))
    } else {
        None
    };
    match st.load_chunk(&chunk, &name) {
        Status::Ok => {
            if let Some(env) = env {
                if let Value::LuaFn(id) = st.stack[st.top - 1] {
                    let proto = st.lua_closures[id.0 as usize].proto.clone();
                    let new_id = st.closure_from_proto(proto, Some(env));
                    st.stack[st.top - 1] = Value::LuaFn(new_id);
                }
            }
            Ok(1)
        }
        _ => {
            // nil + message.
            st.push_nil()?;
            st.insert(-2);
            Ok(2)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_in_base() {
        assert_eq!(parse_in_base(b"ff", 16), Some(255));
        assert_eq!(parse_in_base(b"-10", 2), Some(-2));
        assert_eq!(parse_in_base(b"z", 36), Some(35));
        assert_eq!(parse_in_base(b"2", 2), None);
        assert_eq!(parse_in_base(b"", 10), None);
    }

    #[test]
    fn test_open_base_registers_globals() {
        let mut st = State::new();
        open_base(&mut st).unwrap();
        for name in ["print", "pcall", "setmetatable", "_G", "_VERSION"] {
            st.get_global(name).unwrap();
            assert!(!st.is_nil(-1), "{name} missing");
            st.pop(1);
        }
    }
}
