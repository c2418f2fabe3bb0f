//! Runtime error values and protected-call status codes.

use crescent_core::string::StringPool;
use crescent_core::value::Value;
use std::fmt;

/// Status of a protected call. The numeric codes are stable and follow
/// the reference numbering; `Yield` is unused (there are no
/// coroutines) but keeps its slot for compatibility.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum Status {
    Ok = 0,
    Yield = 1,
    RuntimeError = 2,
    SyntaxError = 3,
    MemoryError = 4,
    ErrorHandlerError = 6,
}

/// A raised Lua error. The payload is a first-class Lua value; plain
/// message strings are interned lazily when they reach a boundary.
#[derive(Clone, Debug)]
pub enum LuaError {
    /// Runtime error with a not-yet-interned message.
    Runtime(String),
    /// Error carrying an arbitrary Lua value (from `error(v)`).
    Value(Value),
    /// Chunk failed to load.
    Syntax(String),
    /// Value or call stack limit exceeded.
    StackOverflow,
    /// Allocation failure surfaced by the host.
    Memory,
    /// The message handler of a protected call itself failed.
    HandlerFault,
}

impl LuaError {
    pub fn status(&self) -> Status {
        match self {
            LuaError::Runtime(_) | LuaError::Value(_) | LuaError::StackOverflow => {
                Status::RuntimeError
            }
            LuaError::Syntax(_) => Status::SyntaxError,
            LuaError::Memory => Status::MemoryError,
            LuaError::HandlerFault => Status::ErrorHandlerError,
        }
    }

    /// The error as a Lua value, interning message text.
    pub fn to_value(&self, strings: &mut StringPool) -> Value {
        match self {
            LuaError::Runtime(msg) | LuaError::Syntax(msg) => {
                Value::Str(strings.intern(msg.as_bytes()))
            }
            LuaError::Value(v) => *v,
            LuaError::StackOverflow => Value::Str(strings.intern(b"stack overflow")),
            LuaError::Memory => Value::Str(strings.intern(b"not enough memory")),
            LuaError::HandlerFault => Value::Str(strings.intern(b"error in error handling")),
        }
    }
}

impl fmt::Display for LuaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LuaError::Runtime(msg) | LuaError::Syntax(msg) => write!(f, "{msg}"),
            LuaError::Value(v) => write!(f, "{v:?}"),
            LuaError::StackOverflow => write!(f, "stack overflow"),
            LuaError::Memory => write!(f, "not enough memory"),
            LuaError::HandlerFault => write!(f, "error in error handling"),
        }
    }
}

impl std::error::Error for LuaError {}
