#![no_main]

use crescent_compiler::compiler::compile;
use crescent_core::string::StringPool;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // The compiler must never panic on any input; errors are fine.
    let mut strings = StringPool::new();
    let _ = compile(data, "fuzz", &mut strings);
});
