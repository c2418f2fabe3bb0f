#![no_main]

use crescent_core::string::StringPool;
use crescent_vm::binary_chunk::undump;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes must never panic the loader; malformed chunks
    // are rejected with errors.
    let mut strings = StringPool::new();
    let _ = undump(data, "fuzz", &mut strings);
});
