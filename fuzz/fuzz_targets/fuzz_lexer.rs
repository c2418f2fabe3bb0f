#![no_main]

use crescent_compiler::lexer::Lexer;
use crescent_compiler::token::Token;
use crescent_core::string::StringPool;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // The lexer must never panic on any input; errors are fine.
    let mut strings = StringPool::new();
    let mut lexer = Lexer::new(data, &mut strings);
    loop {
        match lexer.advance(&mut strings) {
            Ok(tok) => {
                if tok.token == Token::Eof {
                    break;
                }
            }
            Err(_) => break,
        }
    }
});
