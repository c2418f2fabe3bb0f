//! Pull-based lexer for Lua 5.3 source.
//!
//! Operates on raw bytes (Lua strings are byte sequences). Numeric
//! literals keep the integer/float distinction: a literal with no
//! decimal point, no decimal exponent, and no hex `p` exponent that
//! fits in an i64 is an integer token; hex integers wrap modulo 2^64.

use crate::token::{LinedToken, Token};
use crescent_core::string::StringPool;
use std::fmt;

#[derive(Clone, Debug, PartialEq)]
pub struct LexError {
    pub message: String,
    pub line: u32,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.line, self.message)
    }
}

impl std::error::Error for LexError {}

pub struct Lexer<'a> {
    source: &'a [u8],
    pos: usize,
    line: u32,
    current: Option<Result<LinedToken, LexError>>,
    /// One-token lookahead, filled on demand.
    ahead: Option<Result<LinedToken, LexError>>,
    /// Line of the last consumed token.
    pub lastline: u32,
    /// Raw text of the current token, for "near '...'" messages.
    pub token_text: String,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a [u8], strings: &mut StringPool) -> Self {
        let mut lexer = Lexer {
            source,
            pos: 0,
            line: 1,
            current: None,
            ahead: None,
            lastline: 1,
            token_text: String::new(),
        };
        lexer.current = Some(lexer.scan(strings));
        lexer
    }

    /// Current token without consuming it.
    pub fn current(&self) -> Result<&LinedToken, LexError> {
        match &self.current {
            Some(Ok(tok)) => Ok(tok),
            Some(Err(e)) => Err(e.clone()),
            None => unreachable!("lexer always holds a current token"),
        }
    }

    /// Consume the current token and scan the next.
    pub fn advance(&mut self, strings: &mut StringPool) -> Result<LinedToken, LexError> {
        if let Some(Ok(ref tok)) = self.current {
            self.lastline = tok.line;
        }
        let prev = self.current.take().unwrap();
        self.current = Some(match self.ahead.take() {
            Some(tok) => tok,
            None => self.scan(strings),
        });
        prev
    }

    /// Peek one token past the current one.
    pub fn peek_ahead(&mut self, strings: &mut StringPool) -> Result<&LinedToken, LexError> {
        if self.ahead.is_none() {
            self.ahead = Some(self.scan(strings));
        }
        match self.ahead.as_ref().unwrap() {
            Ok(tok) => Ok(tok),
            Err(e) => Err(e.clone()),
        }
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    // ---- Character helpers ----

    fn peek(&self) -> Option<u8> {
        self.source.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.source.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let ch = self.peek()?;
        self.pos += 1;
        if ch == b'\n' || ch == b'\r' {
            // \n\r and \r\n each count as a single newline.
            let next = self.peek();
            if (ch == b'\n' && next == Some(b'\r')) || (ch == b'\r' && next == Some(b'\n')) {
                self.pos += 1;
            }
            self.line += 1;
        }
        Some(ch)
    }

    fn skip_whitespace_and_comments(&mut self) -> Result<(), LexError> {
        loop {
            while let Some(ch) = self.peek() {
                if matches!(ch, b' ' | b'\t' | b'\n' | b'\r' | 0x0B | 0x0C) {
                    self.bump();
                } else {
                    break;
                }
            }
            if self.peek() == Some(b'-') && self.peek_at(1) == Some(b'-') {
                self.bump();
                self.bump();
                if let Some(level) = self.check_long_bracket() {
                    self.read_long_content(level)?;
                    continue;
                }
                while let Some(ch) = self.peek() {
                    if ch == b'\n' || ch == b'\r' {
                        break;
                    }
                    self.bump();
                }
                continue;
            }
            return Ok(());
        }
    }

    /// Does the input start a long bracket `[=*[`? Returns the level.
    fn check_long_bracket(&self) -> Option<usize> {
        if self.peek() != Some(b'[') {
            return None;
        }
        let mut level = 0;
        while self.peek_at(1 + level) == Some(b'=') {
            level += 1;
        }
        if self.peek_at(1 + level) == Some(b'[') {
            Some(level)
        } else {
            None
        }
    }

    /// Consume `[=*[ ... ]=*]` and return the enclosed bytes. A newline
    /// immediately after the opening bracket is skipped.
    fn read_long_content(&mut self, level: usize) -> Result<Vec<u8>, LexError> {
        let start_line = self.line;
        // Opening bracket and equals.
        for _ in 0..level + 2 {
            self.bump();
        }
        if matches!(self.peek(), Some(b'\n' | b'\r')) {
            self.bump();
        }
        let mut out = Vec::new();
        loop {
            match self.peek() {
                None => {
                    return Err(LexError {
                        message: format!(
                            "unfinished long string (starting at line {start_line})"
                        ),
                        line: self.line,
                    });
                }
                Some(b']') => {
                    let mut eq = 0;
                    while self.peek_at(1 + eq) == Some(b'=') {
                        eq += 1;
                    }
                    if eq == level && self.peek_at(1 + eq) == Some(b']') {
                        for _ in 0..level + 2 {
                            self.bump();
                        }
                        return Ok(out);
                    }
                    out.push(b']');
                    self.bump();
                }
                Some(b'\n' | b'\r') => {
                    // Any newline sequence normalizes to '\n'.
                    self.bump();
                    out.push(b'\n');
                }
                Some(ch) => {
                    out.push(ch);
                    self.bump();
                }
            }
        }
    }

    fn error(&self, message: impl Into<String>) -> LexError {
        LexError {
            message: message.into(),
            line: self.line,
        }
    }

    // ---- Token scanning ----

    fn scan(&mut self, strings: &mut StringPool) -> Result<LinedToken, LexError> {
        self.skip_whitespace_and_comments()?;
        let start = self.pos;
        let result = self.scan_inner(strings);
        let end = self.pos;
        if start < end && start < self.source.len() {
            self.token_text =
                String::from_utf8_lossy(&self.source[start..end.min(self.source.len())])
                    .into_owned();
        }
        result
    }

    fn scan_inner(&mut self, strings: &mut StringPool) -> Result<LinedToken, LexError> {
        let line = self.line;
        let tok = |token| Ok(LinedToken { token, line });

        let ch = match self.peek() {
            Some(ch) => ch,
            None => {
                self.token_text = "<eof>".to_string();
                return tok(Token::Eof);
            }
        };

        match ch {
            b'+' => {
                self.bump();
                tok(Token::Plus)
            }
            b'-' => {
                self.bump();
                tok(Token::Minus)
            }
            b'*' => {
                self.bump();
                tok(Token::Star)
            }
            b'/' => {
                self.bump();
                if self.peek() == Some(b'/') {
                    self.bump();
                    tok(Token::FloorDiv)
                } else {
                    tok(Token::Slash)
                }
            }
            b'%' => {
                self.bump();
                tok(Token::Percent)
            }
            b'^' => {
                self.bump();
                tok(Token::Caret)
            }
            b'#' => {
                self.bump();
                tok(Token::Hash)
            }
            b'&' => {
                self.bump();
                tok(Token::Ampersand)
            }
            b'|' => {
                self.bump();
                tok(Token::Pipe)
            }
            b'~' => {
                self.bump();
                if self.peek() == Some(b'=') {
                    self.bump();
                    tok(Token::NotEqual)
                } else {
                    tok(Token::Tilde)
                }
            }
            b'<' => {
                self.bump();
                match self.peek() {
                    Some(b'=') => {
                        self.bump();
                        tok(Token::LessEq)
                    }
                    Some(b'<') => {
                        self.bump();
                        tok(Token::ShiftLeft)
                    }
                    _ => tok(Token::Less),
                }
            }
            b'>' => {
                self.bump();
                match self.peek() {
                    Some(b'=') => {
                        self.bump();
                        tok(Token::GreaterEq)
                    }
                    Some(b'>') => {
                        self.bump();
                        tok(Token::ShiftRight)
                    }
                    _ => tok(Token::Greater),
                }
            }
            b'=' => {
                self.bump();
                if self.peek() == Some(b'=') {
                    self.bump();
                    tok(Token::Equal)
                } else {
                    tok(Token::Assign)
                }
            }
            b'(' => {
                self.bump();
                tok(Token::LParen)
            }
            b')' => {
                self.bump();
                tok(Token::RParen)
            }
            b'{' => {
                self.bump();
                tok(Token::LBrace)
            }
            b'}' => {
                self.bump();
                tok(Token::RBrace)
            }
            b'[' => {
                if let Some(level) = self.check_long_bracket() {
                    let bytes = self.read_long_content(level)?;
                    let id = strings.intern(&bytes);
                    return tok(Token::Str(id));
                }
                self.bump();
                tok(Token::LBracket)
            }
            b']' => {
                self.bump();
                tok(Token::RBracket)
            }
            b';' => {
                self.bump();
                tok(Token::Semi)
            }
            b':' => {
                self.bump();
                if self.peek() == Some(b':') {
                    self.bump();
                    tok(Token::DoubleColon)
                } else {
                    tok(Token::Colon)
                }
            }
            b',' => {
                self.bump();
                tok(Token::Comma)
            }
            b'.' => {
                if self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) {
                    return Ok(LinedToken {
                        token: self.read_number()?,
                        line,
                    });
                }
                self.bump();
                if self.peek() == Some(b'.') {
                    self.bump();
                    if self.peek() == Some(b'.') {
                        self.bump();
                        tok(Token::Ellipsis)
                    } else {
                        tok(Token::DotDot)
                    }
                } else {
                    tok(Token::Dot)
                }
            }
            b'"' | b'\'' => {
                let bytes = self.read_string(ch)?;
                let id = strings.intern(&bytes);
                tok(Token::Str(id))
            }
            b'0'..=b'9' => Ok(LinedToken {
                token: self.read_number()?,
                line,
            }),
            b'_' | b'a'..=b'z' | b'A'..=b'Z' => {
                let start = self.pos;
                while self
                    .peek()
                    .is_some_and(|c| c == b'_' || c.is_ascii_alphanumeric())
                {
                    self.bump();
                }
                let word = &self.source[start..self.pos];
                // Identifiers are always valid ASCII here.
                let word_str = std::str::from_utf8(word).unwrap();
                if let Some(kw) = Token::keyword_from_str(word_str) {
                    tok(kw)
                } else {
                    tok(Token::Name(strings.intern(word)))
                }
            }
            _ => Err(self.error(format!("unexpected symbol near '{}'", ch as char))),
        }
    }

    // ---- Numbers ----

    fn read_number(&mut self) -> Result<Token, LexError> {
        if self.peek() == Some(b'0')
            && matches!(self.peek_at(1), Some(b'x') | Some(b'X'))
        {
            self.bump();
            self.bump();
            return self.read_hex_number();
        }

        let start = self.pos;
        let mut is_float = false;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.bump();
        }
        if self.peek() == Some(b'.') {
            is_float = true;
            self.bump();
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.bump();
            }
        }
        if matches!(self.peek(), Some(b'e') | Some(b'E')) {
            is_float = true;
            self.bump();
            if matches!(self.peek(), Some(b'+') | Some(b'-')) {
                self.bump();
            }
            if !self.peek().is_some_and(|c| c.is_ascii_digit()) {
                return Err(self.error("malformed number"));
            }
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.bump();
            }
        }
        // A number directly followed by a letter is malformed ("1a").
        if self.peek().is_some_and(|c| c.is_ascii_alphabetic() || c == b'_') {
            return Err(self.error("malformed number"));
        }

        let text = std::str::from_utf8(&self.source[start..self.pos]).unwrap();
        if !is_float {
            if let Ok(i) = text.parse::<i64>() {
                return Ok(Token::Integer(i));
            }
            // Decimal integers too large for i64 become floats.
        }
        match text.parse::<f64>() {
            Ok(f) => Ok(Token::Float(f)),
            Err(_) => Err(self.error("malformed number")),
        }
    }

    fn read_hex_number(&mut self) -> Result<Token, LexError> {
        let mut mantissa: f64 = 0.0;
        let mut int_value: u64 = 0;
        let mut digits = 0usize;
        let mut exponent: i32 = 0;
        let mut is_float = false;

        while let Some(d) = self.peek().and_then(hex_digit) {
            mantissa = mantissa * 16.0 + d as f64;
            int_value = int_value.wrapping_mul(16).wrapping_add(d as u64);
            digits += 1;
            self.bump();
        }
        if self.peek() == Some(b'.') {
            is_float = true;
            self.bump();
            while let Some(d) = self.peek().and_then(hex_digit) {
                mantissa = mantissa * 16.0 + d as f64;
                digits += 1;
                exponent -= 4;
                self.bump();
            }
        }
        if digits == 0 {
            return Err(self.error("malformed number"));
        }
        if matches!(self.peek(), Some(b'p') | Some(b'P')) {
            is_float = true;
            self.bump();
            let negative = match self.peek() {
                Some(b'-') => {
                    self.bump();
                    true
                }
                Some(b'+') => {
                    self.bump();
                    false
                }
                _ => false,
            };
            if !self.peek().is_some_and(|c| c.is_ascii_digit()) {
                return Err(self.error("malformed number"));
            }
            let mut e: i64 = 0;
            while let Some(c) = self.peek() {
                if !c.is_ascii_digit() {
                    break;
                }
                e = (e * 10 + (c - b'0') as i64).min(1 << 20);
                self.bump();
            }
            exponent += if negative { -e as i32 } else { e as i32 };
        }
        if self.peek().is_some_and(|c| c.is_ascii_alphanumeric() || c == b'_') {
            return Err(self.error("malformed number"));
        }

        if !is_float {
            // Hex integers wrap modulo 2^64: 0xFFFFFFFFFFFFFFFF is -1.
            return Ok(Token::Integer(int_value as i64));
        }
        Ok(Token::Float(ldexp(mantissa, exponent)))
    }

    // ---- Strings ----

    fn read_string(&mut self, delimiter: u8) -> Result<Vec<u8>, LexError> {
        self.bump(); // opening quote
        let mut out = Vec::new();
        loop {
            let ch = match self.peek() {
                None => return Err(self.error("unfinished string")),
                Some(b'\n' | b'\r') => return Err(self.error("unfinished string")),
                Some(ch) => ch,
            };
            if ch == delimiter {
                self.bump();
                return Ok(out);
            }
            if ch != b'\\' {
                out.push(ch);
                self.bump();
                continue;
            }
            self.bump(); // backslash
            match self.peek() {
                None => return Err(self.error("unfinished string")),
                Some(b'a') => {
                    out.push(0x07);
                    self.bump();
                }
                Some(b'b') => {
                    out.push(0x08);
                    self.bump();
                }
                Some(b'f') => {
                    out.push(0x0C);
                    self.bump();
                }
                Some(b'n') => {
                    out.push(b'\n');
                    self.bump();
                }
                Some(b'r') => {
                    out.push(b'\r');
                    self.bump();
                }
                Some(b't') => {
                    out.push(b'\t');
                    self.bump();
                }
                Some(b'v') => {
                    out.push(0x0B);
                    self.bump();
                }
                Some(b'\\') => {
                    out.push(b'\\');
                    self.bump();
                }
                Some(b'"') => {
                    out.push(b'"');
                    self.bump();
                }
                Some(b'\'') => {
                    out.push(b'\'');
                    self.bump();
                }
                Some(b'\n' | b'\r') => {
                    self.bump();
                    out.push(b'\n');
                }
                Some(b'x') => {
                    self.bump();
                    let mut value = 0u32;
                    for _ in 0..2 {
                        match self.peek().and_then(hex_digit) {
                            Some(d) => {
                                value = value * 16 + d as u32;
                                self.bump();
                            }
                            None => {
                                return Err(self.error("hexadecimal digit expected"));
                            }
                        }
                    }
                    out.push(value as u8);
                }
                Some(b'z') => {
                    self.bump();
                    while self
                        .peek()
                        .is_some_and(|c| matches!(c, b' ' | b'\t' | b'\n' | b'\r' | 0x0B | 0x0C))
                    {
                        self.bump();
                    }
                }
                Some(b'u') => {
                    self.bump();
                    if self.peek() != Some(b'{') {
                        return Err(self.error("missing '{' in \\u{xxxx}"));
                    }
                    self.bump();
                    let mut cp: u32 = 0;
                    let mut n = 0;
                    while let Some(d) = self.peek().and_then(hex_digit) {
                        cp = cp * 16 + d as u32;
                        if cp > 0x10FFFF {
                            return Err(self.error("UTF-8 value too large"));
                        }
                        n += 1;
                        self.bump();
                    }
                    if n == 0 {
                        return Err(self.error("hexadecimal digit expected"));
                    }
                    if self.peek() != Some(b'}') {
                        return Err(self.error("missing '}' in \\u{xxxx}"));
                    }
                    self.bump();
                    push_utf8(&mut out, cp);
                }
                Some(c) if c.is_ascii_digit() => {
                    let mut value = 0u32;
                    for _ in 0..3 {
                        match self.peek() {
                            Some(c) if c.is_ascii_digit() => {
                                value = value * 10 + (c - b'0') as u32;
                                self.bump();
                            }
                            _ => break,
                        }
                    }
                    if value > 255 {
                        return Err(self.error("decimal escape too large"));
                    }
                    out.push(value as u8);
                }
                Some(c) => {
                    return Err(self.error(format!(
                        "invalid escape sequence '\\{}'",
                        c as char
                    )));
                }
            }
        }
    }
}

fn hex_digit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// `m * 2^e` without relying on a libm ldexp.
fn ldexp(mut m: f64, mut e: i32) -> f64 {
    while e > 1023 {
        m *= (2.0f64).powi(1023);
        e -= 1023;
    }
    while e < -1023 {
        m *= (2.0f64).powi(-1023);
        e += 1023;
    }
    m * (2.0f64).powi(e)
}

/// Encode a code point as UTF-8 bytes (the scanner accepts up to
/// 0x10FFFF; surrogates pass through like the reference).
fn push_utf8(out: &mut Vec<u8>, cp: u32) {
    if cp < 0x80 {
        out.push(cp as u8);
    } else if cp < 0x800 {
        out.push(0xC0 | (cp >> 6) as u8);
        out.push(0x80 | (cp & 0x3F) as u8);
    } else if cp < 0x10000 {
        out.push(0xE0 | (cp >> 12) as u8);
        out.push(0x80 | ((cp >> 6) & 0x3F) as u8);
        out.push(0x80 | (cp & 0x3F) as u8);
    } else {
        out.push(0xF0 | (cp >> 18) as u8);
        out.push(0x80 | ((cp >> 12) & 0x3F) as u8);
        out.push(0x80 | ((cp >> 6) & 0x3F) as u8);
        out.push(0x80 | (cp & 0x3F) as u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crescent_core::string::StringPool;

    fn scan_all(source: &str) -> (Vec<Token>, StringPool) {
        let mut pool = StringPool::new();
        let mut lexer = Lexer::new(source.as_bytes(), &mut pool);
        let mut tokens = Vec::new();
        loop {
            let t = lexer.advance(&mut pool).expect("lex error");
            if t.token == Token::Eof {
                break;
            }
            tokens.push(t.token);
        }
        (tokens, pool)
    }

    fn scan_one(source: &str) -> Token {
        let (tokens, _) = scan_all(source);
        assert_eq!(tokens.len(), 1, "expected one token from {source:?}");
        tokens.into_iter().next().unwrap()
    }

    #[test]
    fn test_keywords_and_names() {
        let (tokens, pool) = scan_all("local x = nil");
        assert_eq!(tokens[0], Token::Local);
        match tokens[1] {
            Token::Name(id) => assert_eq!(pool.bytes(id), b"x"),
            ref t => panic!("expected name, got {t:?}"),
        }
        assert_eq!(tokens[2], Token::Assign);
        assert_eq!(tokens[3], Token::Nil);
    }

    #[test]
    fn test_integer_vs_float() {
        assert_eq!(scan_one("42"), Token::Integer(42));
        assert_eq!(scan_one("42.0"), Token::Float(42.0));
        assert_eq!(scan_one("1e2"), Token::Float(100.0));
        assert_eq!(scan_one("3."), Token::Float(3.0));
        assert_eq!(scan_one(".5"), Token::Float(0.5));
    }

    #[test]
    fn test_hex_integer_wraps() {
        assert_eq!(scan_one("0xFFFFFFFFFFFFFFFF"), Token::Integer(-1));
        assert_eq!(scan_one("0x7fffffffffffffff"), Token::Integer(i64::MAX));
        assert_eq!(scan_one("0x10"), Token::Integer(16));
    }

    #[test]
    fn test_hex_float() {
        assert_eq!(scan_one("0x1p4"), Token::Float(16.0));
        assert_eq!(scan_one("0x1.8p1"), Token::Float(3.0));
        assert_eq!(scan_one("0xA.8p0"), Token::Float(10.5));
        assert_eq!(scan_one("0x.4p2"), Token::Float(1.0));
    }

    #[test]
    fn test_large_decimal_integer_becomes_float() {
        // One above i64::MAX.
        assert_eq!(
            scan_one("9223372036854775808"),
            Token::Float(9223372036854775808.0)
        );
    }

    #[test]
    fn test_operators() {
        let (tokens, _) = scan_all("a << b >> c // d ~= e .. f ...");
        assert!(tokens.contains(&Token::ShiftLeft));
        assert!(tokens.contains(&Token::ShiftRight));
        assert!(tokens.contains(&Token::FloorDiv));
        assert!(tokens.contains(&Token::NotEqual));
        assert!(tokens.contains(&Token::DotDot));
        assert!(tokens.contains(&Token::Ellipsis));
    }

    #[test]
    fn test_string_escapes() {
        let (tokens, pool) = scan_all(r#"'\65\x42\n'"#);
        match tokens[0] {
            Token::Str(id) => assert_eq!(pool.bytes(id), b"AB\n"),
            ref t => panic!("expected string, got {t:?}"),
        }
    }

    #[test]
    fn test_unicode_escape() {
        let (tokens, pool) = scan_all(r#""\u{48}\u{69}\u{2764}""#);
        match tokens[0] {
            Token::Str(id) => {
                assert_eq!(pool.bytes(id), "Hi\u{2764}".as_bytes());
            }
            ref t => panic!("expected string, got {t:?}"),
        }
    }

    #[test]
    fn test_z_escape_skips_whitespace() {
        let (tokens, pool) = scan_all("\"a\\z  \n\t b\"");
        match tokens[0] {
            Token::Str(id) => assert_eq!(pool.bytes(id), b"ab"),
            ref t => panic!("expected string, got {t:?}"),
        }
    }

    #[test]
    fn test_long_string() {
        let (tokens, pool) = scan_all("[==[a]b]]==]");
        match tokens[0] {
            Token::Str(id) => assert_eq!(pool.bytes(id), b"a]b]"),
            ref t => panic!("expected string, got {t:?}"),
        }
    }

    #[test]
    fn test_long_string_skips_first_newline() {
        let (tokens, pool) = scan_all("[[\nline]]");
        match tokens[0] {
            Token::Str(id) => assert_eq!(pool.bytes(id), b"line"),
            ref t => panic!("expected string, got {t:?}"),
        }
    }

    #[test]
    fn test_comments() {
        let (tokens, _) = scan_all("1 -- short comment\n --[[long\ncomment]] 2");
        assert_eq!(tokens, vec![Token::Integer(1), Token::Integer(2)]);
    }

    #[test]
    fn test_line_numbers() {
        let mut pool = StringPool::new();
        let mut lexer = Lexer::new(b"a\nb\r\nc", &mut pool);
        assert_eq!(lexer.current().unwrap().line, 1);
        lexer.advance(&mut pool).unwrap();
        assert_eq!(lexer.current().unwrap().line, 2);
        lexer.advance(&mut pool).unwrap();
        assert_eq!(lexer.current().unwrap().line, 3);
    }

    #[test]
    fn test_unfinished_string_errors() {
        let mut pool = StringPool::new();
        let mut lexer = Lexer::new(b"\"abc", &mut pool);
        assert!(lexer.current().is_err());
    }

    #[test]
    fn test_decimal_escape_too_large() {
        let mut pool = StringPool::new();
        let lexer = Lexer::new(b"'\\256'", &mut pool);
        assert!(lexer.current().is_err());
    }

    #[test]
    fn test_malformed_number() {
        let mut pool = StringPool::new();
        let lexer = Lexer::new(b"0x", &mut pool);
        assert!(lexer.current().is_err());
    }
}
