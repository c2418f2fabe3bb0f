//! C-style embedding interface: the stack-manipulation surface the
//! base library, the CLI, and host programs consume.
//!
//! Positive indices count from the current frame's base (1-based),
//! negative indices from the top (-1 is the top), and two pseudo-index
//! ranges address the registry and the running native closure's
//! upvalues.

use crate::binary_chunk;
use crate::callinfo::Callee;
use crate::dispatch::{self, call_value};
use crate::error::{LuaError, Status};
use crate::metamethod;
use crate::vm::{Hook, NativeFn, State, REGISTRY_INDEX};
use crescent_compiler::compiler::{self, chunk_id};
use crescent_core::heap::UserData;
use crescent_core::table::Table;
use crescent_core::value::{Ref, Value};
use std::any::Any;

/// Result-count marker requesting every result.
pub const MULTRET: i32 = -1;

/// The Lua type of a stack slot, as the API reports it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LuaType {
    None,
    Nil,
    Boolean,
    Number,
    String,
    Table,
    Function,
    UserData,
}

enum Slot {
    Stack(usize),
    Registry,
    Upvalue(usize),
    None,
}

impl State {
    // ---- Index resolution ----

    /// Base of the current frame as the API sees it: slot 1 is the
    /// first argument of the running native, or the bottom of the
    /// stack outside any call.
    fn api_base(&self) -> usize {
        self.frames.last().map(|ci| ci.base).unwrap_or(0)
    }

    fn resolve(&self, index: isize) -> Slot {
        if index == REGISTRY_INDEX {
            return Slot::Registry;
        }
        if index < REGISTRY_INDEX {
            return Slot::Upvalue((REGISTRY_INDEX - index) as usize);
        }
        if index > 0 {
            let slot = self.api_base() + index as usize - 1;
            if slot < self.top {
                Slot::Stack(slot)
            } else {
                Slot::None
            }
        } else if index < 0 {
            let offset = (-index) as usize;
            if offset <= self.top - self.api_base() {
                Slot::Stack(self.top - offset)
            } else {
                Slot::None
            }
        } else {
            Slot::None
        }
    }

    /// Convert an acceptable index into an absolute (positive) one.
    pub fn abs_index(&self, index: isize) -> isize {
        if index > 0 || index <= REGISTRY_INDEX {
            index
        } else {
            (self.top - self.api_base()) as isize + index + 1
        }
    }

    /// The value at an index; `Nil` for empty slots.
    pub fn value_at(&self, index: isize) -> Value {
        match self.resolve(index) {
            Slot::Stack(slot) => self.stack[slot],
            Slot::Registry => Value::Table(self.registry),
            Slot::Upvalue(i) => {
                let ci = self.frames.last().expect("no active frame");
                match ci.callee {
                    Callee::Native(id) => self.native_closures[id.0 as usize]
                        .upvalues
                        .get(i - 1)
                        .copied()
                        .unwrap_or(Value::Nil),
                    Callee::Lua(_) => Value::Nil,
                }
            }
            Slot::None => Value::Nil,
        }
    }

    fn set_value_at(&mut self, index: isize, v: Value) {
        match self.resolve(index) {
            Slot::Stack(slot) => self.stack[slot] = v,
            Slot::Upvalue(i) => {
                if let Some(ci) = self.frames.last() {
                    if let Callee::Native(id) = ci.callee {
                        if let Some(slot) = self.native_closures[id.0 as usize]
                            .upvalues
                            .get_mut(i - 1)
                        {
                            *slot = v;
                        }
                    }
                }
            }
            Slot::Registry | Slot::None => {}
        }
    }

    // ---- Stack shape ----

    /// Number of values on the current frame's stack.
    pub fn get_top(&self) -> usize {
        self.top - self.api_base()
    }

    /// Grow (with nils) or shrink the stack to `n` values.
    pub fn set_top(&mut self, n: isize) -> Result<(), LuaError> {
        let base = self.api_base();
        let new_top = if n >= 0 {
            base + n as usize
        } else {
            // -1 keeps everything, -2 drops one, and so on.
            (self.top as isize + n + 1) as usize
        };
        self.ensure_stack(new_top)?;
        for slot in self.top..new_top {
            self.stack[slot] = Value::Nil;
        }
        self.top = new_top;
        Ok(())
    }

    pub fn pop(&mut self, n: usize) {
        self.top -= n.min(self.top - self.api_base());
    }

    /// Move the top value into position `index`, shifting the values
    /// above it up by one.
    pub fn insert(&mut self, index: isize) {
        let slot = match self.resolve(index) {
            Slot::Stack(s) => s,
            _ => return,
        };
        let top_value = self.stack[self.top - 1];
        let mut i = self.top - 1;
        while i > slot {
            self.stack[i] = self.stack[i - 1];
            i -= 1;
        }
        self.stack[slot] = top_value;
    }

    /// Remove the value at `index`, shifting the values above it down.
    pub fn remove(&mut self, index: isize) {
        let slot = match self.resolve(index) {
            Slot::Stack(s) => s,
            _ => return,
        };
        for i in slot..self.top - 1 {
            self.stack[i] = self.stack[i + 1];
        }
        self.top -= 1;
    }

    // ---- Pushes ----

    pub fn push_nil(&mut self) -> Result<(), LuaError> {
        self.push(Value::Nil)
    }

    pub fn push_boolean(&mut self, b: bool) -> Result<(), LuaError> {
        self.push(Value::Boolean(b))
    }

    pub fn push_integer(&mut self, i: i64) -> Result<(), LuaError> {
        self.push(Value::Integer(i))
    }

    pub fn push_number(&mut self, f: f64) -> Result<(), LuaError> {
        self.push(Value::Float(f))
    }

    pub fn push_string(&mut self, s: &str) -> Result<(), LuaError> {
        let id = self.strings.intern(s.as_bytes());
        self.push(Value::Str(id))
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) -> Result<(), LuaError> {
        let id = self.strings.intern(bytes);
        self.push(Value::Str(id))
    }

    /// Push a host callback with no upvalues.
    pub fn push_native(&mut self, f: NativeFn, name: &'static str) -> Result<(), LuaError> {
        self.push_native_closure(f, name, 0)
    }

    /// Push a host closure capturing the top `n_upvalues` stack values
    /// (popped), addressable inside the callback via
    /// `upvalue_index(i)`.
    pub fn push_native_closure(
        &mut self,
        f: NativeFn,
        name: &'static str,
        n_upvalues: usize,
    ) -> Result<(), LuaError> {
        let first = self.top - n_upvalues;
        let upvalues = self.stack[first..self.top].to_vec();
        self.top = first;
        let id = self.new_native_closure(f, name, upvalues);
        self.push(Value::NativeFn(id))
    }

    /// Push a copy of the value at `index`.
    pub fn push_value(&mut self, index: isize) -> Result<(), LuaError> {
        let v = self.value_at(index);
        self.push(v)
    }

    pub fn push_userdata(&mut self, data: Box<dyn Any>) -> Result<(), LuaError> {
        let r = self.heap.alloc_userdata(data);
        self.push(Value::UserData(r))
    }

    // ---- Reads ----

    pub fn type_of(&self, index: isize) -> LuaType {
        if matches!(self.resolve(index), Slot::None) {
            return LuaType::None;
        }
        match self.value_at(index) {
            Value::Nil => LuaType::Nil,
            Value::Boolean(_) => LuaType::Boolean,
            Value::Integer(_) | Value::Float(_) => LuaType::Number,
            Value::Str(_) => LuaType::String,
            Value::Table(_) => LuaType::Table,
            Value::LuaFn(_) | Value::NativeFn(_) => LuaType::Function,
            Value::UserData(_) => LuaType::UserData,
        }
    }

    pub fn is_nil(&self, index: isize) -> bool {
        self.value_at(index).is_nil()
    }

    pub fn is_none_or_nil(&self, index: isize) -> bool {
        matches!(self.type_of(index), LuaType::None | LuaType::Nil)
    }

    /// Boolean coercion: everything but nil and false is true.
    pub fn to_boolean(&self, index: isize) -> bool {
        self.value_at(index).is_truthy()
    }

    /// Integer coercion, including numeric strings and integral
    /// floats.
    pub fn to_integer(&self, index: isize) -> Option<i64> {
        crate::coerce::to_integer(self.value_at(index), &self.strings)
    }

    /// Number coercion, including numeric strings.
    pub fn to_number(&self, index: isize) -> Option<f64> {
        crate::coerce::to_number(self.value_at(index), &self.strings)
    }

    /// String bytes, without coercion.
    pub fn to_str_bytes(&self, index: isize) -> Option<&[u8]> {
        match self.value_at(index) {
            Value::Str(id) => Some(self.strings.bytes(id)),
            _ => None,
        }
    }

    /// String coercion: strings stay, numbers format. Other types
    /// yield `None` (the base library's `tostring` adds metamethod
    /// handling on top).
    pub fn to_string_value(&mut self, index: isize) -> Option<String> {
        match self.value_at(index) {
            Value::Str(id) => Some(self.strings.display(id).into_owned()),
            v @ (Value::Integer(_) | Value::Float(_)) => crate::coerce::number_to_display(v),
            _ => None,
        }
    }

    pub fn to_userdata_ref(&self, index: isize) -> Option<&UserData> {
        match self.value_at(index) {
            Value::UserData(r) => Some(self.heap.userdata(r)),
            _ => None,
        }
    }

    // ---- Tables ----

    /// Push a fresh table created with the given size hints.
    pub fn create_table(&mut self, narr: usize, nrec: usize) -> Result<(), LuaError> {
        let t = self.heap.alloc_table(narr, nrec);
        self.push(Value::Table(t))
    }

    /// `t[k]` where `t` is at `index`, `k` is popped from the top, and
    /// the result is pushed; observes `__index`.
    pub fn get_table(&mut self, index: isize) -> Result<LuaType, LuaError> {
        let t = self.value_at(index);
        let k = self.stack[self.top - 1];
        self.top -= 1;
        let v = dispatch::table_get(self, t, k)?;
        self.push(v)?;
        Ok(self.type_of(-1))
    }

    /// `t[k] = v` where `v` then `k` are popped; observes
    /// `__newindex`.
    pub fn set_table(&mut self, index: isize) -> Result<(), LuaError> {
        let t = self.value_at(index);
        let v = self.stack[self.top - 1];
        let k = self.stack[self.top - 2];
        self.top -= 2;
        dispatch::table_set(self, t, k, v)
    }

    /// `t.name` pushed; observes `__index`.
    pub fn get_field(&mut self, index: isize, name: &str) -> Result<LuaType, LuaError> {
        let t = self.value_at(index);
        let k = Value::Str(self.strings.intern(name.as_bytes()));
        let v = dispatch::table_get(self, t, k)?;
        self.push(v)?;
        Ok(self.type_of(-1))
    }

    /// `t.name = top` (popped); observes `__newindex`.
    pub fn set_field(&mut self, index: isize, name: &str) -> Result<(), LuaError> {
        let t = self.value_at(index);
        let v = self.stack[self.top - 1];
        self.top -= 1;
        let k = Value::Str(self.strings.intern(name.as_bytes()));
        dispatch::table_set(self, t, k, v)
    }

    /// Raw read: key popped, value pushed, no metamethods.
    pub fn raw_get(&mut self, index: isize) -> Result<LuaType, LuaError> {
        let t = self.expect_table(index)?;
        let k = self.stack[self.top - 1];
        self.top -= 1;
        let v = self.heap.table(t).raw_get(k);
        self.push(v)?;
        Ok(self.type_of(-1))
    }

    /// Raw write: value then key popped, no metamethods.
    pub fn raw_set(&mut self, index: isize) -> Result<(), LuaError> {
        let t = self.expect_table(index)?;
        let v = self.stack[self.top - 1];
        let k = self.stack[self.top - 2];
        self.top -= 2;
        self.heap
            .table_mut(t)
            .raw_set(k, v)
            .map_err(|e| self.runtime_error(e.message()))
    }

    pub fn raw_get_i(&mut self, index: isize, i: i64) -> Result<LuaType, LuaError> {
        let t = self.expect_table(index)?;
        let v = self.heap.table(t).raw_geti(i);
        self.push(v)?;
        Ok(self.type_of(-1))
    }

    pub fn raw_set_i(&mut self, index: isize, i: i64) -> Result<(), LuaError> {
        let t = self.expect_table(index)?;
        let v = self.stack[self.top - 1];
        self.top -= 1;
        self.heap.table_mut(t).raw_seti(i, v);
        Ok(())
    }

    /// Raw length: string bytes or table border, no `__len`.
    pub fn raw_len(&self, index: isize) -> usize {
        match self.value_at(index) {
            Value::Str(id) => self.strings.bytes(id).len(),
            Value::Table(t) => self.heap.table(t).length() as usize,
            _ => 0,
        }
    }

    /// Primitive equality, no `__eq`.
    pub fn raw_equal(&self, a: isize, b: isize) -> bool {
        crate::compare::raw_eq(self.value_at(a), self.value_at(b))
    }

    /// Pop a key, push the next key/value pair of the table at
    /// `index`; false (nothing pushed) at the end of the traversal.
    pub fn next(&mut self, index: isize) -> Result<bool, LuaError> {
        let t = self.expect_table(index)?;
        let k = self.stack[self.top - 1];
        self.top -= 1;
        match self.heap.table(t).next(k) {
            Ok(Some((nk, nv))) => {
                self.push(nk)?;
                self.push(nv)?;
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(()) => Err(self.runtime_error("invalid key to 'next'")),
        }
    }

    fn expect_table(&self, index: isize) -> Result<Ref<Table>, LuaError> {
        match self.value_at(index) {
            Value::Table(t) => Ok(t),
            v => Err(self.runtime_error(format!(
                "table expected, got {}",
                v.type_name()
            ))),
        }
    }

    // ---- Metatables ----

    /// Push the metatable of the value at `index`; false if it has
    /// none.
    pub fn get_metatable(&mut self, index: isize) -> Result<bool, LuaError> {
        match metamethod::metatable_of(&self.heap, self.value_at(index)) {
            Some(mt) => {
                self.push(Value::Table(mt))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Pop a table (or nil) and set it as the metatable of the value
    /// at `index`.
    pub fn set_metatable(&mut self, index: isize) -> Result<(), LuaError> {
        let mt = self.stack[self.top - 1];
        self.top -= 1;
        let mt = match mt {
            Value::Nil => None,
            Value::Table(t) => Some(t),
            _ => return Err(self.runtime_error("nil or table expected")),
        };
        match self.value_at(index) {
            Value::Table(t) => {
                self.heap.table_mut(t).metatable = mt;
                Ok(())
            }
            Value::UserData(u) => {
                self.heap.userdata_mut(u).metatable = mt;
                Ok(())
            }
            v => Err(self.runtime_error(format!(
                "cannot set metatable on a {} value",
                v.type_name()
            ))),
        }
    }

    /// Fetch-or-create the named metatable in the registry and push
    /// it; true when it was newly created.
    pub fn new_metatable(&mut self, name: &str) -> Result<bool, LuaError> {
        let key = Value::Str(self.strings.intern(name.as_bytes()));
        let existing = self.heap.table(self.registry).raw_get(key);
        if let Value::Table(t) = existing {
            self.push(Value::Table(t))?;
            return Ok(false);
        }
        let t = self.heap.alloc_table(0, 2);
        self.heap
            .table_mut(self.registry)
            .raw_set(key, Value::Table(t))
            .expect("string keys are always valid");
        self.push(Value::Table(t))?;
        Ok(true)
    }

    /// Push the named registry metatable, or nil.
    pub fn get_named_metatable(&mut self, name: &str) -> Result<(), LuaError> {
        let key = Value::Str(self.strings.intern(name.as_bytes()));
        let v = self.heap.table(self.registry).raw_get(key);
        self.push(v)
    }

    // ---- Globals ----

    pub fn get_global(&mut self, name: &str) -> Result<LuaType, LuaError> {
        let g = Value::Table(self.globals());
        let k = Value::Str(self.strings.intern(name.as_bytes()));
        let v = dispatch::table_get(self, g, k)?;
        self.push(v)?;
        Ok(self.type_of(-1))
    }

    /// Pop the top value and store it as a global.
    pub fn set_global(&mut self, name: &str) -> Result<(), LuaError> {
        let g = Value::Table(self.globals());
        let v = self.stack[self.top - 1];
        self.top -= 1;
        let k = Value::Str(self.strings.intern(name.as_bytes()));
        dispatch::table_set(self, g, k, v)
    }

    /// Register a host callback as a global function.
    pub fn register(&mut self, name: &'static str, f: NativeFn) -> Result<(), LuaError> {
        self.push_native(f, name)?;
        self.set_global(name)
    }

    // ---- Calls ----

    /// Call with `n_args` arguments below the top; the callable sits
    /// under them. Errors propagate to the caller unprotected.
    pub fn call(&mut self, n_args: usize, n_results: i32) -> Result<(), LuaError> {
        let func = self.top - n_args - 1;
        call_value(self, func, n_results)
    }

    /// Protected call: on failure the stack unwinds to the callable's
    /// slot, open upvalues past it close, and the error value is
    /// pushed. With `msgh` the handler at that index runs on the error
    /// value before unwinding finishes.
    pub fn protected_call(
        &mut self,
        n_args: usize,
        n_results: i32,
        msgh: Option<isize>,
    ) -> Status {
        let func = self.top - n_args - 1;
        let handler = msgh.map(|i| self.value_at(i));
        let saved_frames = self.frames.len();
        let saved_depth = self.native_depth;
        match call_value(self, func, n_results) {
            Ok(()) => Status::Ok,
            Err(e) => {
                let status = e.status();
                self.frames.truncate(saved_frames);
                self.native_depth = saved_depth;
                self.close_upvalues(func);
                let mut err_value = e.to_value(&mut self.strings);
                let mut final_status = status;
                if let Some(h) = handler {
                    match self.run_message_handler(h, err_value) {
                        Ok(v) => err_value = v,
                        Err(_) => {
                            final_status = Status::ErrorHandlerError;
                            err_value = LuaError::HandlerFault.to_value(&mut self.strings);
                        }
                    }
                }
                self.top = func;
                self.stack[func] = err_value;
                self.top = func + 1;
                final_status
            }
        }
    }

    fn run_message_handler(&mut self, handler: Value, err: Value) -> Result<Value, LuaError> {
        dispatch::call_metamethod(self, handler, &[err])
    }

    // ---- Loading and dumping ----

    /// Load a chunk: precompiled when it starts with the binary
    /// signature byte, source otherwise. On success the resulting
    /// closure is pushed; on failure the error message is pushed and
    /// the status returned.
    pub fn load_chunk(&mut self, chunk: &[u8], chunk_name: &str) -> Status {
        if chunk.first() == Some(&0x1B) {
            match binary_chunk::undump(chunk, &chunk_id(chunk_name), &mut self.strings) {
                Ok(proto) => {
                    let id = self.closure_from_proto(proto, None);
                    self.push(Value::LuaFn(id)).expect("stack space for closure");
                    Status::Ok
                }
                Err(e) => {
                    let id = self.strings.intern(e.message.as_bytes());
                    self.push(Value::Str(id)).expect("stack space for error");
                    Status::SyntaxError
                }
            }
        } else {
            match compiler::compile(chunk, chunk_name, &mut self.strings) {
                Ok(proto) => {
                    let id = self.closure_from_proto(proto, None);
                    self.push(Value::LuaFn(id)).expect("stack space for closure");
                    Status::Ok
                }
                Err(e) => {
                    let id = self.strings.intern(e.message.as_bytes());
                    self.push(Value::Str(id)).expect("stack space for error");
                    Status::SyntaxError
                }
            }
        }
    }

    /// Serialize the Lua function at the top of the stack.
    pub fn dump(&self) -> Result<Vec<u8>, LuaError> {
        match self.stack[self.top - 1] {
            Value::LuaFn(id) => Ok(binary_chunk::dump(
                &self.lua_closures[id.0 as usize].proto,
                &self.strings,
            )),
            v => Err(self.runtime_error(format!(
                "unable to dump given function ({})",
                v.type_name()
            ))),
        }
    }

    // ---- Hooks ----

    /// Install a debug hook; see the `MASK_*` constants. A zero mask
    /// removes the hook.
    pub fn install_hook(&mut self, func: crate::vm::HookFn, mask: u8, count: u32) {
        if mask == 0 {
            self.set_hook(None);
        } else {
            self.set_hook(Some(Hook { func, mask, count }));
        }
    }
}

/// Re-exported pseudo-index helper, so hosts can write
/// `state.value_at(upvalue_index(1))`.
pub use crate::vm::upvalue_index as upvalue;
