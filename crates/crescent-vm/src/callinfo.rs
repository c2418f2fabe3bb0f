//! Call frame records.

use crescent_core::value::{FnId, NativeId};

/// What a frame is running.
#[derive(Clone, Copy, Debug)]
pub enum Callee {
    Lua(FnId),
    Native(NativeId),
}

/// One active call.
#[derive(Clone, Debug)]
pub struct CallInfo {
    /// Stack slot holding the callable.
    pub func: usize,
    /// First register of the frame. For vararg functions this sits
    /// past the passed arguments, whose tail is the vararg section.
    pub base: usize,
    /// Saved program counter (Lua frames only).
    pub pc: usize,
    /// Results the caller expects; -1 means all.
    pub num_results: i32,
    pub callee: Callee,
    /// Frame top watermark (`base + max_stack_size` for Lua frames).
    pub top: usize,
    /// Tail calls folded into this frame, for error reports.
    pub tail_calls: u32,
    /// Line last reported to the line hook.
    pub last_line: u32,
}

impl CallInfo {
    pub fn new(func: usize, base: usize, callee: Callee, num_results: i32, top: usize) -> Self {
        CallInfo {
            func,
            base,
            pc: 0,
            num_results,
            callee,
            top,
            tail_calls: 0,
            last_line: 0,
        }
    }

    pub fn is_lua(&self) -> bool {
        matches!(self.callee, Callee::Lua(_))
    }
}
