use crescent_core::value::Value;
use crescent_vm::api::MULTRET;
use crescent_vm::baselib;
use crescent_vm::error::Status;
use crescent_vm::vm::State;

/// A state with the base library opened.
pub fn new_state() -> State {
    let mut st = State::new();
    baselib::open_base(&mut st).expect("base library");
    st
}

/// Compile and run a chunk, returning its results and the state.
pub fn run_lua(source: &str) -> (Vec<Value>, State) {
    let mut st = new_state();
    if st.load_chunk(source.as_bytes(), "=test") != Status::Ok {
        panic!(
            "load error: {}",
            st.to_string_value(-1).unwrap_or_default()
        );
    }
    if st.protected_call(0, MULTRET, None) != Status::Ok {
        panic!(
            "runtime error: {}",
            st.to_string_value(-1).unwrap_or_default()
        );
    }
    let results = (1..=st.get_top())
        .map(|i| st.value_at(i as isize))
        .collect();
    (results, st)
}

/// Run a chunk expecting a runtime error; returns its message.
pub fn run_lua_err(source: &str) -> String {
    let mut st = new_state();
    if st.load_chunk(source.as_bytes(), "=test") != Status::Ok {
        panic!(
            "load error: {}",
            st.to_string_value(-1).unwrap_or_default()
        );
    }
    match st.protected_call(0, MULTRET, None) {
        Status::Ok => panic!("expected an error from {source:?}"),
        _ => st.to_string_value(-1).unwrap_or_default(),
    }
}

pub fn assert_int(results: &[Value], idx: usize, expected: i64) {
    match results.get(idx) {
        Some(Value::Integer(i)) => assert_eq!(*i, expected, "result[{idx}]"),
        other => panic!("result[{idx}] = {other:?}, expected integer {expected}"),
    }
}

pub fn assert_float(results: &[Value], idx: usize, expected: f64) {
    match results.get(idx) {
        Some(Value::Float(f)) => {
            assert!(
                (f - expected).abs() < 1e-12 || f == &expected,
                "result[{idx}] = {f}, expected {expected}"
            );
        }
        other => panic!("result[{idx}] = {other:?}, expected float {expected}"),
    }
}

pub fn assert_bool(results: &[Value], idx: usize, expected: bool) {
    match results.get(idx) {
        Some(Value::Boolean(b)) => assert_eq!(*b, expected, "result[{idx}]"),
        other => panic!("result[{idx}] = {other:?}, expected boolean {expected}"),
    }
}

pub fn assert_nil(results: &[Value], idx: usize) {
    match results.get(idx) {
        Some(Value::Nil) => {}
        other => panic!("result[{idx}] = {other:?}, expected nil"),
    }
}

pub fn assert_str(results: &[Value], idx: usize, expected: &str, st: &State) {
    match results.get(idx) {
        Some(Value::Str(id)) => {
            let got = st.strings.bytes(*id);
            assert_eq!(
                got,
                expected.as_bytes(),
                "result[{idx}] = {:?}, expected {expected:?}",
                String::from_utf8_lossy(got)
            );
        }
        other => panic!("result[{idx}] = {other:?}, expected string {expected:?}"),
    }
}

/// Run and compare against a list of expected integers.
pub fn run_check_ints(source: &str, expected: &[i64]) {
    let (results, _st) = run_lua(source);
    assert_eq!(
        results.len(),
        expected.len(),
        "expected {} results, got {results:?}",
        expected.len()
    );
    for (i, &e) in expected.iter().enumerate() {
        assert_int(&results, i, e);
    }
}
