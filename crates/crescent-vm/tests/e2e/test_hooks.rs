use super::helpers::*;
use crescent_vm::api::MULTRET;
use crescent_vm::error::{LuaError, Status};
use crescent_vm::vm::{HookEvent, State, MASK_CALL, MASK_COUNT, MASK_LINE};

fn bump_global(st: &mut State, name: &str) {
    let current = {
        st.get_global(name).unwrap();
        let v = st.to_integer(-1).unwrap_or(0);
        st.pop(1);
        v
    };
    st.push_integer(current + 1).unwrap();
    st.set_global(name).unwrap();
}

fn counting_hook(st: &mut State, ev: HookEvent) -> Result<(), LuaError> {
    match ev {
        HookEvent::Count => bump_global(st, "count_events"),
        HookEvent::Call => bump_global(st, "call_events"),
        HookEvent::Line(_) => bump_global(st, "line_events"),
        HookEvent::Return => {}
    }
    Ok(())
}

fn cancelling_hook(st: &mut State, ev: HookEvent) -> Result<(), LuaError> {
    if let HookEvent::Count = ev {
        return Err(st.runtime_error("interrupted"));
    }
    Ok(())
}

#[test]
fn test_count_hook_fires() {
    let mut st = new_state();
    st.install_hook(counting_hook, MASK_COUNT, 10);
    assert_eq!(
        st.load_chunk(b"local n = 0 for i = 1, 100 do n = n + 1 end return n", "=h"),
        Status::Ok
    );
    assert_eq!(st.protected_call(0, 1, None), Status::Ok);
    assert_eq!(st.to_integer(-1), Some(100));
    st.pop(1);
    st.get_global("count_events").unwrap();
    let events = st.to_integer(-1).unwrap_or(0);
    // A few hundred instructions ran; the hook fired every 10.
    assert!(events > 5, "count hook fired only {events} times");
}

#[test]
fn test_line_hook_fires_per_line() {
    let mut st = new_state();
    st.install_hook(counting_hook, MASK_LINE, 0);
    let src = b"local a = 1\nlocal b = 2\nlocal c = 3\nreturn a + b + c";
    assert_eq!(st.load_chunk(src, "=lines"), Status::Ok);
    assert_eq!(st.protected_call(0, 1, None), Status::Ok);
    st.pop(1);
    st.get_global("line_events").unwrap();
    let events = st.to_integer(-1).unwrap_or(0);
    assert!(events >= 4, "line hook fired only {events} times");
}

#[test]
fn test_call_hook_fires() {
    let mut st = new_state();
    st.install_hook(counting_hook, MASK_CALL, 0);
    let src = b"local function f() return 1 end\nreturn f() + f() + f()";
    assert_eq!(st.load_chunk(src, "=calls"), Status::Ok);
    assert_eq!(st.protected_call(0, 1, None), Status::Ok);
    st.pop(1);
    st.get_global("call_events").unwrap();
    let events = st.to_integer(-1).unwrap_or(0);
    assert!(events >= 3, "call hook fired only {events} times");
}

#[test]
fn test_hook_can_cancel_execution() {
    let mut st = new_state();
    st.install_hook(cancelling_hook, MASK_COUNT, 50);
    assert_eq!(
        st.load_chunk(b"local n = 0 while true do n = n + 1 end", "=inf"),
        Status::Ok
    );
    // The hook unwinds the otherwise infinite loop.
    assert_eq!(st.protected_call(0, MULTRET, None), Status::RuntimeError);
    let msg = st.to_string_value(-1).unwrap_or_default();
    assert!(msg.contains("interrupted"), "{msg}");
}

#[test]
fn test_hook_removal() {
    let mut st = new_state();
    st.install_hook(counting_hook, MASK_COUNT, 5);
    st.install_hook(counting_hook, 0, 0); // zero mask removes
    assert_eq!(
        st.load_chunk(b"local n = 0 for i = 1, 50 do n = n + 1 end return n", "=h"),
        Status::Ok
    );
    assert_eq!(st.protected_call(0, 1, None), Status::Ok);
    st.pop(1);
    st.get_global("count_events").unwrap();
    assert!(st.is_nil(-1), "hook fired after removal");
}
