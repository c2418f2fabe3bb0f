//! The Lua state: value stack, call frames, object arenas, registry,
//! and upvalue bookkeeping.

use crate::callinfo::CallInfo;
use crate::error::LuaError;
use crate::metamethod::MetaNames;
use crescent_compiler::compiler::chunk_id;
use crescent_compiler::proto::Proto;
use crescent_core::heap::{Heap, UpvalCell};
use crescent_core::string::{StringPool, StrId};
use crescent_core::table::Table;
use crescent_core::value::{FnId, NativeId, Ref, UpvalRef, Value};
use std::rc::Rc;

/// Hard ceiling on the value stack; the registry pseudo-index sits
/// just below the indices this allows.
pub const MAX_STACK_LIMIT: usize = 1_000_000;
/// Pseudo-index addressing the registry.
pub const REGISTRY_INDEX: isize = -(MAX_STACK_LIMIT as isize) - 1000;
/// Registry slot of the main-state marker.
pub const RIDX_MAINTHREAD: i64 = 1;
/// Registry slot of the globals table.
pub const RIDX_GLOBALS: i64 = 2;

/// Pseudo-index of a native closure's `i`-th upvalue (1-based).
pub fn upvalue_index(i: usize) -> isize {
    REGISTRY_INDEX - i as isize
}

/// Default cap on value-stack slots.
pub const DEFAULT_MAX_STACK: usize = 15_000;
/// Default cap on nested native-frame depth (metamethod recursion).
pub const DEFAULT_MAX_NATIVE_DEPTH: usize = 200;

/// Extra slots guaranteed above a frame's declared needs.
pub const EXTRA_STACK: usize = 5;

/// Signature of a host callback: arguments are on the stack (1-based
/// from the callback's frame), results are pushed and counted in the
/// return value.
pub type NativeFn = fn(&mut State) -> Result<i32, LuaError>;

/// A Lua closure: shared prototype plus captured upvalue cells.
pub struct LuaClosure {
    pub proto: Rc<Proto>,
    pub upvalues: Vec<UpvalRef>,
}

/// A host closure: callback plus plain upvalue slots reachable via
/// pseudo-indices.
pub struct NativeClosure {
    pub func: NativeFn,
    pub upvalues: Vec<Value>,
    pub name: &'static str,
}

/// Debug-hook event mask bits.
pub const MASK_CALL: u8 = 1 << 0;
pub const MASK_RETURN: u8 = 1 << 1;
pub const MASK_LINE: u8 = 1 << 2;
pub const MASK_COUNT: u8 = 1 << 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookEvent {
    Call,
    Return,
    Line(u32),
    Count,
}

pub type HookFn = fn(&mut State, HookEvent) -> Result<(), LuaError>;

#[derive(Clone, Copy)]
pub struct Hook {
    pub func: HookFn,
    pub mask: u8,
    /// Instruction period for count events.
    pub count: u32,
}

pub struct State {
    pub stack: Vec<Value>,
    /// First free stack slot.
    pub top: usize,
    pub frames: Vec<CallInfo>,
    pub heap: Heap,
    pub strings: StringPool,
    pub lua_closures: Vec<LuaClosure>,
    pub native_closures: Vec<NativeClosure>,
    /// Open upvalues, sorted by stack slot descending.
    pub open_upvals: Vec<(usize, UpvalRef)>,
    pub registry: Ref<Table>,
    pub meta: MetaNames,
    /// Configurable stack cap; exceeding it raises "stack overflow".
    pub max_stack: usize,
    /// Cap on native call depth through metamethods and callbacks.
    pub max_native_depth: usize,
    pub(crate) native_depth: usize,
    pub hook: Option<Hook>,
    pub(crate) hook_counter: u32,
}

impl State {
    /// Open a fresh state with its registry and an empty globals
    /// table. The base library is not loaded here; hosts call
    /// `baselib::open_base` for that.
    pub fn new() -> Self {
        let mut strings = StringPool::new();
        let meta = MetaNames::init(&mut strings);
        let mut heap = Heap::new();
        let registry = heap.alloc_table(2, 0);
        let globals = heap.alloc_table(0, 16);
        heap.table_mut(registry)
            .raw_seti(RIDX_MAINTHREAD, Value::Boolean(true));
        heap.table_mut(registry)
            .raw_seti(RIDX_GLOBALS, Value::Table(globals));
        State {
            stack: vec![Value::Nil; 64],
            top: 0,
            frames: Vec::new(),
            heap,
            strings,
            lua_closures: Vec::new(),
            native_closures: Vec::new(),
            open_upvals: Vec::new(),
            registry,
            meta,
            max_stack: DEFAULT_MAX_STACK,
            max_native_depth: DEFAULT_MAX_NATIVE_DEPTH,
            native_depth: 0,
            hook: None,
            hook_counter: 0,
        }
    }

    /// The globals table.
    pub fn globals(&self) -> Ref<Table> {
        match self.heap.table(self.registry).raw_geti(RIDX_GLOBALS) {
            Value::Table(t) => t,
            _ => unreachable!("registry lost its globals table"),
        }
    }

    // ---- Stack management ----

    /// Ensure capacity for slots `[0, needed)`, growing the backing
    /// buffer. Exceeding the configured cap is a stack overflow.
    pub fn ensure_stack(&mut self, needed: usize) -> Result<(), LuaError> {
        if needed > self.max_stack + EXTRA_STACK || needed > MAX_STACK_LIMIT {
            return Err(LuaError::StackOverflow);
        }
        if needed > self.stack.len() {
            let new_len = (self.stack.len() * 2).max(needed);
            let new_len = new_len.min(self.max_stack + EXTRA_STACK);
            self.stack.resize(new_len.max(needed), Value::Nil);
        }
        Ok(())
    }

    /// Push a value, growing as needed.
    pub fn push(&mut self, v: Value) -> Result<(), LuaError> {
        self.ensure_stack(self.top + 1)?;
        self.stack[self.top] = v;
        self.top += 1;
        Ok(())
    }

    // ---- Closures ----

    pub fn new_lua_closure(&mut self, proto: Rc<Proto>, upvalues: Vec<UpvalRef>) -> FnId {
        debug_assert_eq!(proto.upvalues.len(), upvalues.len());
        self.lua_closures.push(LuaClosure { proto, upvalues });
        FnId((self.lua_closures.len() - 1) as u32)
    }

    pub fn new_native_closure(
        &mut self,
        func: NativeFn,
        name: &'static str,
        upvalues: Vec<Value>,
    ) -> NativeId {
        self.native_closures.push(NativeClosure {
            func,
            upvalues,
            name,
        });
        NativeId((self.native_closures.len() - 1) as u32)
    }

    /// Wrap a chunk's root prototype in a closure whose upvalues are
    /// all closed over nil except `_ENV`-named entries, which close
    /// over the given environment (the globals table by default).
    pub fn closure_from_proto(&mut self, proto: Rc<Proto>, env: Option<Value>) -> FnId {
        let env = env.unwrap_or(Value::Table(self.globals()));
        let env_id = self.strings.intern(b"_ENV");
        let mut upvalues = Vec::with_capacity(proto.upvalues.len());
        for desc in &proto.upvalues {
            let init = if desc.name == Some(env_id) {
                env
            } else {
                Value::Nil
            };
            upvalues.push(self.heap.alloc_upval(UpvalCell::Closed(init)));
        }
        self.new_lua_closure(proto, upvalues)
    }

    // ---- Upvalues ----

    pub fn upval_value(&self, uv: UpvalRef) -> Value {
        match *self.heap.upval(uv) {
            UpvalCell::Open(slot) => self.stack[slot],
            UpvalCell::Closed(v) => v,
        }
    }

    pub fn set_upval_value(&mut self, uv: UpvalRef, v: Value) {
        match *self.heap.upval(uv) {
            UpvalCell::Open(slot) => self.stack[slot] = v,
            UpvalCell::Closed(_) => *self.heap.upval_mut(uv) = UpvalCell::Closed(v),
        }
    }

    /// Find the open upvalue for a stack slot, creating and inserting
    /// it (sorted by slot, descending) when absent. Two closures made
    /// by the same CLOSURE instruction therefore share one cell.
    pub fn find_or_create_upval(&mut self, slot: usize) -> UpvalRef {
        for &(s, uv) in &self.open_upvals {
            if s == slot {
                return uv;
            }
            if s < slot {
                break;
            }
        }
        let uv = self.heap.alloc_upval(UpvalCell::Open(slot));
        let pos = self
            .open_upvals
            .iter()
            .position(|&(s, _)| s < slot)
            .unwrap_or(self.open_upvals.len());
        self.open_upvals.insert(pos, (slot, uv));
        uv
    }

    /// Close every open upvalue at or above `level`, capturing the
    /// current slot values.
    pub fn close_upvalues(&mut self, level: usize) {
        while let Some(&(slot, uv)) = self.open_upvals.first() {
            if slot < level {
                break;
            }
            let v = self.stack[slot];
            *self.heap.upval_mut(uv) = UpvalCell::Closed(v);
            self.open_upvals.remove(0);
        }
    }

    // ---- Error helpers ----

    /// `"<chunk-id>:<line>: "` for the frame `level` calls up from the
    /// innermost Lua frame (0 = innermost).
    pub fn location_prefix(&self, level: usize) -> String {
        let mut seen = 0usize;
        for ci in self.frames.iter().rev() {
            if let crate::callinfo::Callee::Lua(id) = ci.callee {
                if seen == level {
                    let proto = &self.lua_closures[id.0 as usize].proto;
                    let line = proto.line_at(ci.pc.saturating_sub(1));
                    let name = self.chunk_name_of(proto);
                    return format!("{name}:{line}: ");
                }
                seen += 1;
            }
        }
        String::new()
    }

    pub(crate) fn chunk_name_of(&self, proto: &Proto) -> String {
        match proto.source {
            Some(id) => chunk_id(&self.strings.display(id)),
            None => "?".to_string(),
        }
    }

    /// Build a runtime error with the current source location.
    pub fn runtime_error(&self, msg: impl Into<String>) -> LuaError {
        LuaError::Runtime(format!("{}{}", self.location_prefix(0), msg.into()))
    }

    /// Install or clear the debug hook.
    pub fn set_hook(&mut self, hook: Option<Hook>) {
        self.hook_counter = hook.map(|h| h.count).unwrap_or(0);
        self.hook = hook;
    }

    /// Intern convenience used throughout the base library.
    pub fn intern(&mut self, bytes: &[u8]) -> StrId {
        self.strings.intern(bytes)
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_has_registry_and_globals() {
        let st = State::new();
        let reg = st.heap.table(st.registry);
        assert_eq!(reg.raw_geti(RIDX_MAINTHREAD), Value::Boolean(true));
        assert!(matches!(reg.raw_geti(RIDX_GLOBALS), Value::Table(_)));
    }

    #[test]
    fn test_pseudo_indices_disjoint_from_stack() {
        assert!(REGISTRY_INDEX < -(MAX_STACK_LIMIT as isize));
        assert!(upvalue_index(1) < REGISTRY_INDEX);
        assert_ne!(upvalue_index(1), upvalue_index(2));
    }

    #[test]
    fn test_stack_overflow_at_cap() {
        let mut st = State::new();
        st.max_stack = 100;
        assert!(st.ensure_stack(50).is_ok());
        assert!(matches!(
            st.ensure_stack(200),
            Err(LuaError::StackOverflow)
        ));
    }

    #[test]
    fn test_upval_open_close_cycle() {
        let mut st = State::new();
        st.push(Value::Integer(41)).unwrap();
        let uv = st.find_or_create_upval(0);
        assert_eq!(st.upval_value(uv), Value::Integer(41));
        // Writing through the open upvalue hits the stack slot.
        st.set_upval_value(uv, Value::Integer(42));
        assert_eq!(st.stack[0], Value::Integer(42));
        // Closing captures the current value.
        st.close_upvalues(0);
        st.stack[0] = Value::Nil;
        assert_eq!(st.upval_value(uv), Value::Integer(42));
        assert!(st.open_upvals.is_empty());
    }

    #[test]
    fn test_same_slot_shares_upval() {
        let mut st = State::new();
        st.push(Value::Integer(1)).unwrap();
        st.push(Value::Integer(2)).unwrap();
        let a = st.find_or_create_upval(0);
        let b = st.find_or_create_upval(1);
        let a2 = st.find_or_create_upval(0);
        assert_eq!(a, a2);
        assert_ne!(a, b);
        // List is sorted descending by slot.
        assert_eq!(st.open_upvals[0].0, 1);
        assert_eq!(st.open_upvals[1].0, 0);
    }

    #[test]
    fn test_close_is_partial() {
        let mut st = State::new();
        for i in 0..4 {
            st.push(Value::Integer(i)).unwrap();
        }
        let low = st.find_or_create_upval(1);
        let high = st.find_or_create_upval(3);
        st.close_upvalues(2);
        assert!(matches!(st.heap.upval(high), UpvalCell::Closed(_)));
        assert!(matches!(st.heap.upval(low), UpvalCell::Open(1)));
    }
}
