use super::helpers::*;
use crescent_vm::api::MULTRET;
use crescent_vm::error::Status;

#[test]
fn test_dump_reload_cross_state() {
    // Compile in one state, dump, load into a fresh state, call.
    let mut producer = new_state();
    assert_eq!(
        producer.load_chunk(b"return function(a, b) return a + b end", "=producer"),
        Status::Ok
    );
    assert_eq!(producer.protected_call(0, 1, None), Status::Ok);
    let blob = producer.dump().expect("dump the returned function");

    let mut consumer = new_state();
    assert_eq!(blob[0], 0x1B, "precompiled chunks start with ESC");
    assert_eq!(consumer.load_chunk(&blob, "=consumer"), Status::Ok);
    consumer.push_integer(2).unwrap();
    consumer.push_integer(3).unwrap();
    assert_eq!(consumer.protected_call(2, 1, None), Status::Ok);
    assert_eq!(consumer.to_integer(-1), Some(5));
}

#[test]
fn test_dump_reload_whole_chunk() {
    let source = b"local acc = 0\n\
                   for i = 1, 10 do acc = acc + i end\n\
                   return acc, 'done'";
    let mut producer = new_state();
    assert_eq!(producer.load_chunk(source, "=chunk"), Status::Ok);
    let blob = producer.dump().expect("dump");

    let mut consumer = new_state();
    assert_eq!(consumer.load_chunk(&blob, "=reloaded"), Status::Ok);
    assert_eq!(consumer.protected_call(0, MULTRET, None), Status::Ok);
    assert_eq!(consumer.to_integer(-2), Some(55));
    assert_eq!(consumer.to_str_bytes(-1), Some(&b"done"[..]));
}

#[test]
fn test_reloaded_closures_work() {
    let source = b"local function mk()\n\
                     local n = 0\n\
                     return function() n = n + 1 return n end\n\
                   end\n\
                   local c = mk()\n\
                   c() c()\n\
                   return c()";
    let mut producer = new_state();
    assert_eq!(producer.load_chunk(source, "=closures"), Status::Ok);
    let blob = producer.dump().expect("dump");

    let mut consumer = new_state();
    assert_eq!(consumer.load_chunk(&blob, "=closures"), Status::Ok);
    assert_eq!(consumer.protected_call(0, 1, None), Status::Ok);
    assert_eq!(consumer.to_integer(-1), Some(3));
}

#[test]
fn test_corrupt_chunk_fails_loudly() {
    let mut producer = new_state();
    assert_eq!(producer.load_chunk(b"return 1", "=x"), Status::Ok);
    let mut blob = producer.dump().expect("dump");
    blob[4] = 0x52; // wrong version

    let mut consumer = new_state();
    assert_eq!(consumer.load_chunk(&blob, "=bad"), Status::SyntaxError);
    let msg = consumer.to_string_value(-1).unwrap_or_default();
    assert!(msg.contains("version mismatch"), "{msg}");
}

#[test]
fn test_binary_chunk_constants_preserved() {
    let source = b"return 0x7FFFFFFFFFFFFFFF, -0.0, 'text', true, nil";
    let mut producer = new_state();
    assert_eq!(producer.load_chunk(source, "=k"), Status::Ok);
    let blob = producer.dump().expect("dump");

    let mut consumer = new_state();
    assert_eq!(consumer.load_chunk(&blob, "=k"), Status::Ok);
    assert_eq!(consumer.protected_call(0, MULTRET, None), Status::Ok);
    assert_eq!(consumer.to_integer(1), Some(i64::MAX));
    let neg_zero = consumer.to_number(2).unwrap();
    assert_eq!(neg_zero, 0.0);
    assert!(neg_zero.is_sign_negative());
    assert_eq!(consumer.to_str_bytes(3), Some(&b"text"[..]));
    assert!(consumer.to_boolean(4));
    assert!(consumer.is_nil(5));
}
