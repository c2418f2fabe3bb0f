//! The bytecode interpreter loop and its call machinery.
//!
//! Nested Lua→Lua calls stay inside one `execute` loop by pushing
//! frames; host callbacks, metamethods, and the iterator call of
//! TFORCALL re-enter through `call_value`, guarded by the native
//! call-depth counter.

use crate::arith::{self, ArithOp, ArithResult};
use crate::callinfo::{CallInfo, Callee};
use crate::coerce;
use crate::compare;
use crate::error::LuaError;
use crate::metamethod::{self, Event};
use crate::vm::{HookEvent, State, EXTRA_STACK, MASK_CALL, MASK_COUNT, MASK_LINE, MASK_RETURN};
use crescent_compiler::opcode::{self, fb_to_int, OpCode, LFIELDS_PER_FLUSH};
use crescent_compiler::proto::{Constant, Proto};
use crescent_core::value::{FnId, Value};
use std::rc::Rc;

/// Depth limit for `__index`/`__newindex` chains.
const MAX_TAG_LOOP: usize = 2000;
/// Rounds of `__call` resolution before giving up.
const MAX_CALL_META: usize = 100;

const MULTRET: i32 = -1;

/// Convert a compile-time constant to a runtime value. String
/// constants are already interned in the state's pool.
#[inline]
pub fn constant_value(k: &Constant) -> Value {
    match k {
        Constant::Nil => Value::Nil,
        Constant::Boolean(b) => Value::Boolean(*b),
        Constant::Integer(i) => Value::Integer(*i),
        Constant::Float(f) => Value::Float(*f),
        Constant::Str(id) => Value::Str(*id),
    }
}

#[inline]
fn rk(st: &State, proto: &Proto, base: usize, x: u32) -> Value {
    if opcode::is_k(x) {
        constant_value(&proto.constants[opcode::rk_index(x) as usize])
    } else {
        st.stack[base + x as usize]
    }
}

/// Call the value at stack slot `func`, with arguments between
/// `func + 1` and the stack top. On return the results sit at `func`
/// and the top is adjusted per `nresults` (-1 keeps all results).
///
/// This is the re-entrant path; it counts against the native depth
/// limit to bound host-stack recursion through metamethods.
pub fn call_value(st: &mut State, func: usize, nresults: i32) -> Result<(), LuaError> {
    if st.native_depth >= st.max_native_depth {
        return Err(LuaError::StackOverflow);
    }
    st.native_depth += 1;
    let result = call_value_guarded(st, func, nresults);
    st.native_depth -= 1;
    result
}

fn call_value_guarded(st: &mut State, func: usize, nresults: i32) -> Result<(), LuaError> {
    if precall(st, func, nresults)? {
        let entry = st.frames.len();
        execute(st, entry)?;
    }
    Ok(())
}

/// Prepare a call. Returns true when a Lua frame was pushed and the
/// caller must run the interpreter; native callees complete here.
fn precall(st: &mut State, func: usize, nresults: i32) -> Result<bool, LuaError> {
    for _ in 0..MAX_CALL_META {
        match st.stack[func] {
            Value::LuaFn(id) => {
                precall_lua(st, func, id, nresults)?;
                return Ok(true);
            }
            Value::NativeFn(id) => {
                do_native_call(st, func, id, nresults)?;
                return Ok(false);
            }
            callee => {
                // Not directly callable: resolve through __call by
                // inserting the handler before the arguments.
                let handler =
                    metamethod::get_metamethod(&st.heap, &st.meta, callee, Event::Call)
                        .ok_or_else(|| {
                            st.runtime_error(format!(
                                "attempt to call a {} value",
                                callee.type_name()
                            ))
                        })?;
                st.ensure_stack(st.top + 1)?;
                let mut i = st.top;
                while i > func {
                    st.stack[i] = st.stack[i - 1];
                    i -= 1;
                }
                st.stack[func] = handler;
                st.top += 1;
            }
        }
    }
    Err(st.runtime_error("'__call' chain too long"))
}

/// Arrange stack and registers for a Lua callee at `func`; returns
/// `(base, top)`. Vararg functions move their fixed parameters past
/// the passed arguments; fresh registers are cleared to nil.
fn setup_lua_frame(st: &mut State, func: usize, id: FnId) -> Result<(usize, usize), LuaError> {
    let proto = st.lua_closures[id.0 as usize].proto.clone();
    let num_params = proto.num_params as usize;
    let max_stack = proto.max_stack_size as usize;
    let n_args = st.top - func - 1;
    let base;
    if proto.is_vararg {
        base = st.top;
        st.ensure_stack(base + max_stack + EXTRA_STACK)?;
        for i in 0..num_params {
            if i < n_args {
                st.stack[base + i] = st.stack[func + 1 + i];
                st.stack[func + 1 + i] = Value::Nil;
            } else {
                st.stack[base + i] = Value::Nil;
            }
        }
    } else {
        base = func + 1;
        st.ensure_stack(base + max_stack + EXTRA_STACK)?;
        for i in n_args..num_params {
            st.stack[base + i] = Value::Nil;
        }
    }
    // Fresh registers start nil.
    for i in num_params..max_stack {
        st.stack[base + i] = Value::Nil;
    }
    Ok((base, base + max_stack))
}

fn precall_lua(st: &mut State, func: usize, id: FnId, nresults: i32) -> Result<(), LuaError> {
    let (base, top) = setup_lua_frame(st, func, id)?;
    st.top = top;
    st.frames
        .push(CallInfo::new(func, base, Callee::Lua(id), nresults, top));
    if let Some(hook) = st.hook {
        if hook.mask & MASK_CALL != 0 {
            (hook.func)(st, HookEvent::Call)?;
        }
    }
    Ok(())
}

fn do_native_call(
    st: &mut State,
    func: usize,
    id: crescent_core::value::NativeId,
    nresults: i32,
) -> Result<(), LuaError> {
    if st.native_depth >= st.max_native_depth {
        return Err(LuaError::StackOverflow);
    }
    st.native_depth += 1;
    let base = func + 1;
    st.frames.push(CallInfo::new(
        func,
        base,
        Callee::Native(id),
        nresults,
        st.top,
    ));
    let result = run_native(st, id);
    st.native_depth -= 1;
    let n = result?;
    let first = st.top - n;
    let ci = st.frames.pop().expect("native frame");
    postcall(st, &ci, first, n);
    Ok(())
}

fn run_native(st: &mut State, id: crescent_core::value::NativeId) -> Result<usize, LuaError> {
    if let Some(hook) = st.hook {
        if hook.mask & MASK_CALL != 0 {
            (hook.func)(st, HookEvent::Call)?;
        }
    }
    let f = st.native_closures[id.0 as usize].func;
    let n = f(st)?;
    if let Some(hook) = st.hook {
        if hook.mask & MASK_RETURN != 0 {
            (hook.func)(st, HookEvent::Return)?;
        }
    }
    Ok(n.max(0) as usize)
}

/// Move `nres` results starting at `first` down to the function slot,
/// padding or truncating to the caller's expectation.
fn postcall(st: &mut State, ci: &CallInfo, first: usize, nres: usize) {
    let func = ci.func;
    if ci.num_results > 0 && st.stack.len() < func + ci.num_results as usize {
        st.stack.resize(func + ci.num_results as usize, Value::Nil);
    }
    if ci.num_results < 0 {
        for i in 0..nres {
            st.stack[func + i] = st.stack[first + i];
        }
        st.top = func + nres;
    } else {
        let wanted = ci.num_results as usize;
        for i in 0..wanted {
            st.stack[func + i] = if i < nres {
                st.stack[first + i]
            } else {
                Value::Nil
            };
        }
        st.top = func + wanted;
    }
}

/// Service count and line hooks before an instruction.
fn trace_hooks(st: &mut State, ci_idx: usize, proto: &Proto, pc: usize) -> Result<(), LuaError> {
    let hook = match st.hook {
        Some(h) => h,
        None => return Ok(()),
    };
    if hook.mask & MASK_COUNT != 0 && hook.count > 0 {
        st.hook_counter = st.hook_counter.saturating_sub(1);
        if st.hook_counter == 0 {
            st.hook_counter = hook.count;
            (hook.func)(st, HookEvent::Count)?;
        }
    }
    if hook.mask & MASK_LINE != 0 {
        let line = proto.line_at(pc);
        if line != st.frames[ci_idx].last_line {
            st.frames[ci_idx].last_line = line;
            (hook.func)(st, HookEvent::Line(line))?;
        }
    }
    Ok(())
}

/// Run Lua frames until the frame that was at `entry_depth - 1`
/// returns (i.e. the frame count drops below `entry_depth`).
pub fn execute(st: &mut State, entry_depth: usize) -> Result<(), LuaError> {
    debug_assert!(entry_depth >= 1);
    while st.frames.len() >= entry_depth {
        let ci_idx = st.frames.len() - 1;
        let (base, pc, fn_id) = {
            let ci = &st.frames[ci_idx];
            let id = match ci.callee {
                Callee::Lua(id) => id,
                Callee::Native(_) => unreachable!("interpreter entered a native frame"),
            };
            (ci.base, ci.pc, id)
        };
        let proto = Rc::clone(&st.lua_closures[fn_id.0 as usize].proto);
        if st.hook.is_some() {
            trace_hooks(st, ci_idx, &proto, pc)?;
        }
        let inst = proto.code[pc];
        st.frames[ci_idx].pc = pc + 1;
        let a = inst.a() as usize;

        match inst.opcode() {
            OpCode::Move => {
                st.stack[base + a] = st.stack[base + inst.b() as usize];
            }
            OpCode::LoadK => {
                st.stack[base + a] = constant_value(&proto.constants[inst.bx() as usize]);
            }
            OpCode::LoadKX => {
                let extra = proto.code[st.frames[ci_idx].pc];
                debug_assert_eq!(extra.opcode(), OpCode::ExtraArg);
                st.frames[ci_idx].pc += 1;
                st.stack[base + a] = constant_value(&proto.constants[extra.ax() as usize]);
            }
            OpCode::LoadBool => {
                st.stack[base + a] = Value::Boolean(inst.b() != 0);
                if inst.c() != 0 {
                    st.frames[ci_idx].pc += 1;
                }
            }
            OpCode::LoadNil => {
                for i in a..=a + inst.b() as usize {
                    st.stack[base + i] = Value::Nil;
                }
            }
            OpCode::GetUpval => {
                let uv = st.lua_closures[fn_id.0 as usize].upvalues[inst.b() as usize];
                st.stack[base + a] = st.upval_value(uv);
            }
            OpCode::SetUpval => {
                let uv = st.lua_closures[fn_id.0 as usize].upvalues[inst.b() as usize];
                let v = st.stack[base + a];
                st.set_upval_value(uv, v);
            }
            OpCode::GetTabUp => {
                let uv = st.lua_closures[fn_id.0 as usize].upvalues[inst.b() as usize];
                let t = st.upval_value(uv);
                let key = rk(st, &proto, base, inst.c());
                st.stack[base + a] = table_get(st, t, key)?;
            }
            OpCode::SetTabUp => {
                let uv = st.lua_closures[fn_id.0 as usize].upvalues[a];
                let t = st.upval_value(uv);
                let key = rk(st, &proto, base, inst.b());
                let val = rk(st, &proto, base, inst.c());
                table_set(st, t, key, val)?;
            }
            OpCode::GetTable => {
                let t = st.stack[base + inst.b() as usize];
                let key = rk(st, &proto, base, inst.c());
                st.stack[base + a] = table_get(st, t, key)?;
            }
            OpCode::SetTable => {
                let t = st.stack[base + a];
                let key = rk(st, &proto, base, inst.b());
                let val = rk(st, &proto, base, inst.c());
                table_set(st, t, key, val)?;
            }
            OpCode::NewTable => {
                let narr = fb_to_int(inst.b());
                let nrec = fb_to_int(inst.c());
                let t = st.heap.alloc_table(narr, nrec);
                st.stack[base + a] = Value::Table(t);
            }
            OpCode::Self_ => {
                let t = st.stack[base + inst.b() as usize];
                st.stack[base + a + 1] = t;
                let key = rk(st, &proto, base, inst.c());
                st.stack[base + a] = table_get(st, t, key)?;
            }
            OpCode::Add
            | OpCode::Sub
            | OpCode::Mul
            | OpCode::Mod
            | OpCode::Pow
            | OpCode::Div
            | OpCode::IDiv
            | OpCode::BAnd
            | OpCode::BOr
            | OpCode::BXor
            | OpCode::Shl
            | OpCode::Shr => {
                let op = match inst.opcode() {
                    OpCode::Add => ArithOp::Add,
                    OpCode::Sub => ArithOp::Sub,
                    OpCode::Mul => ArithOp::Mul,
                    OpCode::Mod => ArithOp::Mod,
                    OpCode::Pow => ArithOp::Pow,
                    OpCode::Div => ArithOp::Div,
                    OpCode::IDiv => ArithOp::IDiv,
                    OpCode::BAnd => ArithOp::BAnd,
                    OpCode::BOr => ArithOp::BOr,
                    OpCode::BXor => ArithOp::BXor,
                    OpCode::Shl => ArithOp::Shl,
                    _ => ArithOp::Shr,
                };
                let rb = rk(st, &proto, base, inst.b());
                let rc = rk(st, &proto, base, inst.c());
                let v = match arith::arith_binary(op, rb, rc, &st.strings) {
                    ArithResult::Ok(v) => v,
                    ArithResult::NeedMeta => arith_meta_binary(st, op, rb, rc)?,
                    ArithResult::Error(e) => return Err(attach_location(st, e)),
                };
                st.stack[base + a] = v;
            }
            OpCode::Unm => {
                let rb = st.stack[base + inst.b() as usize];
                let v = match arith::arith_unm(rb, &st.strings) {
                    ArithResult::Ok(v) => v,
                    ArithResult::NeedMeta => arith_meta_unary(st, ArithOp::Unm, rb)?,
                    ArithResult::Error(e) => return Err(attach_location(st, e)),
                };
                st.stack[base + a] = v;
            }
            OpCode::BNot => {
                let rb = st.stack[base + inst.b() as usize];
                let v = match arith::arith_bnot(rb, &st.strings) {
                    ArithResult::Ok(v) => v,
                    ArithResult::NeedMeta => arith_meta_unary(st, ArithOp::BNot, rb)?,
                    ArithResult::Error(e) => return Err(attach_location(st, e)),
                };
                st.stack[base + a] = v;
            }
            OpCode::Not => {
                let rb = st.stack[base + inst.b() as usize];
                st.stack[base + a] = Value::Boolean(rb.is_falsy());
            }
            OpCode::Len => {
                let rb = st.stack[base + inst.b() as usize];
                st.stack[base + a] = length_of(st, rb)?;
            }
            OpCode::Concat => {
                let b = inst.b() as usize;
                let c = inst.c() as usize;
                st.top = base + c + 1;
                concat_in_place(st, c - b + 1)?;
                let v = st.stack[base + b];
                st.stack[base + a] = v;
                st.top = st.frames[ci_idx].top;
            }
            OpCode::Jmp => {
                do_jump(st, ci_idx, base, inst.a(), inst.sbx());
            }
            OpCode::Eq => {
                let rb = rk(st, &proto, base, inst.b());
                let rc = rk(st, &proto, base, inst.c());
                let eq = values_equal(st, rb, rc)?;
                if eq != (inst.a() != 0) {
                    st.frames[ci_idx].pc += 1;
                }
            }
            OpCode::Lt => {
                let rb = rk(st, &proto, base, inst.b());
                let rc = rk(st, &proto, base, inst.c());
                let lt = values_less(st, rb, rc)?;
                if lt != (inst.a() != 0) {
                    st.frames[ci_idx].pc += 1;
                }
            }
            OpCode::Le => {
                let rb = rk(st, &proto, base, inst.b());
                let rc = rk(st, &proto, base, inst.c());
                let le = values_less_equal(st, rb, rc)?;
                if le != (inst.a() != 0) {
                    st.frames[ci_idx].pc += 1;
                }
            }
            OpCode::Test => {
                let truthy = st.stack[base + a].is_truthy();
                if truthy != (inst.c() != 0) {
                    st.frames[ci_idx].pc += 1;
                }
            }
            OpCode::TestSet => {
                let rb = st.stack[base + inst.b() as usize];
                if rb.is_truthy() == (inst.c() != 0) {
                    st.stack[base + a] = rb;
                } else {
                    st.frames[ci_idx].pc += 1;
                }
            }
            OpCode::Call => {
                let b = inst.b() as usize;
                let c = inst.c() as i32;
                if b != 0 {
                    st.top = base + a + b;
                }
                let func = base + a;
                let pushed = precall(st, func, c - 1)?;
                if !pushed && c != 0 {
                    st.top = st.frames[ci_idx].top;
                }
            }
            OpCode::TailCall => {
                let b = inst.b() as usize;
                if b != 0 {
                    st.top = base + a + b;
                }
                let func = base + a;
                match st.stack[func] {
                    Value::LuaFn(id) => {
                        tail_call_lua(st, ci_idx, func, id)?;
                    }
                    _ => {
                        // Native or __call: a plain call wanting all
                        // results; the following RETURN passes them on.
                        precall(st, func, MULTRET)?;
                    }
                }
            }
            OpCode::Return => {
                let b = inst.b() as usize;
                st.close_upvalues(base);
                let first = base + a;
                let nres = if b == 0 { st.top - first } else { b - 1 };
                if let Some(hook) = st.hook {
                    if hook.mask & MASK_RETURN != 0 {
                        (hook.func)(st, HookEvent::Return)?;
                    }
                }
                let ci = st.frames.pop().expect("lua frame");
                postcall(st, &ci, first, nres);
                if st.frames.len() < entry_depth {
                    return Ok(());
                }
                if ci.num_results >= 0 {
                    st.top = st.frames[st.frames.len() - 1].top;
                }
            }
            OpCode::ForPrep => {
                for_prep(st, ci_idx, base, a, inst.sbx())?;
            }
            OpCode::ForLoop => {
                for_loop(st, ci_idx, base, a, inst.sbx());
            }
            OpCode::TForCall => {
                let nwanted = inst.c() as i32;
                let cb = base + a + 3;
                st.ensure_stack(cb + 3 + EXTRA_STACK)?;
                st.stack[cb] = st.stack[base + a];
                st.stack[cb + 1] = st.stack[base + a + 1];
                st.stack[cb + 2] = st.stack[base + a + 2];
                st.top = cb + 3;
                call_value(st, cb, nwanted)?;
                st.top = st.frames[ci_idx].top;
            }
            OpCode::TForLoop => {
                let ctrl = st.stack[base + a + 1];
                if !ctrl.is_nil() {
                    st.stack[base + a] = ctrl;
                    let pc = st.frames[ci_idx].pc as i64 + inst.sbx() as i64;
                    st.frames[ci_idx].pc = pc as usize;
                }
            }
            OpCode::SetList => {
                let b = inst.b() as usize;
                let mut c = inst.c() as usize;
                if c == 0 {
                    let extra = proto.code[st.frames[ci_idx].pc];
                    debug_assert_eq!(extra.opcode(), OpCode::ExtraArg);
                    st.frames[ci_idx].pc += 1;
                    c = extra.ax() as usize;
                }
                let n = if b == 0 {
                    st.top - (base + a) - 1
                } else {
                    b
                };
                let t = match st.stack[base + a] {
                    Value::Table(t) => t,
                    v => {
                        return Err(st.runtime_error(format!(
                            "attempt to index a {} value",
                            v.type_name()
                        )))
                    }
                };
                let offset = (c - 1) as i64 * LFIELDS_PER_FLUSH as i64;
                for i in 1..=n {
                    let v = st.stack[base + a + i];
                    st.heap.table_mut(t).raw_seti(offset + i as i64, v);
                }
                if b == 0 {
                    st.top = st.frames[ci_idx].top;
                }
            }
            OpCode::Closure => {
                let child = Rc::clone(&proto.protos[inst.bx() as usize]);
                let parent_upvals = st.lua_closures[fn_id.0 as usize].upvalues.clone();
                let mut upvalues = Vec::with_capacity(child.upvalues.len());
                for desc in &child.upvalues {
                    if desc.in_stack {
                        upvalues.push(st.find_or_create_upval(base + desc.index as usize));
                    } else {
                        upvalues.push(parent_upvals[desc.index as usize]);
                    }
                }
                let id = st.new_lua_closure(child, upvalues);
                st.stack[base + a] = Value::LuaFn(id);
            }
            OpCode::Vararg => {
                let b = inst.b() as usize;
                let ci_func = st.frames[ci_idx].func;
                let num_params = proto.num_params as usize;
                let vararg_start = ci_func + 1 + num_params;
                let available = base.saturating_sub(vararg_start);
                let wanted = if b == 0 { available } else { b - 1 };
                st.ensure_stack(base + a + wanted + EXTRA_STACK)?;
                for i in 0..wanted {
                    st.stack[base + a + i] = if i < available {
                        st.stack[vararg_start + i]
                    } else {
                        Value::Nil
                    };
                }
                if b == 0 {
                    st.top = base + a + wanted;
                }
            }
            OpCode::ExtraArg => {
                // Always consumed by the preceding instruction.
            }
        }
    }
    Ok(())
}

fn do_jump(st: &mut State, ci_idx: usize, base: usize, a: u32, sbx: i32) {
    if a != 0 {
        st.close_upvalues(base + a as usize - 1);
    }
    let pc = st.frames[ci_idx].pc as i64 + sbx as i64;
    st.frames[ci_idx].pc = pc as usize;
}

/// Replace the running frame with a call to the Lua function at
/// `func`: arguments slide down over the caller's frame and execution
/// restarts at the callee without a new CallInfo.
fn tail_call_lua(st: &mut State, ci_idx: usize, func: usize, id: FnId) -> Result<(), LuaError> {
    let ci_func = st.frames[ci_idx].func;
    let old_base = st.frames[ci_idx].base;
    st.close_upvalues(old_base);
    let n_args = st.top - func - 1;
    st.stack[ci_func] = st.stack[func];
    for i in 0..n_args {
        st.stack[ci_func + 1 + i] = st.stack[func + 1 + i];
    }
    st.top = ci_func + 1 + n_args;
    let (base, top) = setup_lua_frame(st, ci_func, id)?;
    st.top = top;
    let ci = &mut st.frames[ci_idx];
    ci.base = base;
    ci.pc = 0;
    ci.callee = Callee::Lua(id);
    ci.top = top;
    ci.tail_calls = ci.tail_calls.saturating_add(1);
    ci.last_line = 0;
    Ok(())
}

// ---- Numeric for loops ----

/// Integer-mode limit clamping: floats round toward the loop interior
/// and clamp to the i64 range; unreachable limits flag a skip.
fn for_limit(
    limit: Value,
    step: i64,
    strings: &crescent_core::string::StringPool,
) -> Option<(i64, bool)> {
    match coerce::to_numeral(limit, strings)? {
        coerce::Numeral::Int(i) => Some((i, false)),
        coerce::Numeral::Flt(f) => {
            if f.is_nan() {
                return Some((i64::MIN, step >= 0));
            }
            // Fractional limits round toward the loop interior.
            let rounded = if step > 0 { f.floor() } else { f.ceil() };
            if let Some(i) = coerce::float_to_integer(rounded) {
                Some((i, false))
            } else if rounded > 0.0 {
                Some((i64::MAX, step < 0))
            } else {
                Some((i64::MIN, step >= 0))
            }
        }
    }
}

fn for_prep(
    st: &mut State,
    ci_idx: usize,
    base: usize,
    a: usize,
    sbx: i32,
) -> Result<(), LuaError> {
    let init = st.stack[base + a];
    let limit = st.stack[base + a + 1];
    let step = st.stack[base + a + 2];

    let int_mode = match (init, step) {
        (Value::Integer(i0), Value::Integer(s)) => {
            for_limit(limit, s, &st.strings).map(|(l, stop)| (i0, s, l, stop))
        }
        _ => None,
    };

    if let Some((i0, s, ilimit, stop)) = int_mode {
        if s == 0 {
            return Err(st.runtime_error("'for' step is zero"));
        }
        let skip = stop || if s > 0 { i0 > ilimit } else { i0 < ilimit };
        // Iteration count, computed in unsigned space so the control
        // variable can never wrap past the limit.
        let total: u64 = if skip {
            0
        } else if s > 0 {
            (ilimit.wrapping_sub(i0) as u64 / s as u64).saturating_add(1)
        } else {
            (i0.wrapping_sub(ilimit) as u64 / s.unsigned_abs()).saturating_add(1)
        };
        st.stack[base + a] = Value::Integer(i0.wrapping_sub(s));
        st.stack[base + a + 1] = Value::Integer(total as i64);
        st.stack[base + a + 2] = Value::Integer(s);
    } else {
        let fl = coerce::to_number(limit, &st.strings)
            .ok_or_else(|| st.runtime_error("'for' limit must be a number"))?;
        let fs = coerce::to_number(step, &st.strings)
            .ok_or_else(|| st.runtime_error("'for' step must be a number"))?;
        let fi = coerce::to_number(init, &st.strings)
            .ok_or_else(|| st.runtime_error("'for' initial value must be a number"))?;
        st.stack[base + a] = Value::Float(fi - fs);
        st.stack[base + a + 1] = Value::Float(fl);
        st.stack[base + a + 2] = Value::Float(fs);
    }
    let pc = st.frames[ci_idx].pc as i64 + sbx as i64;
    st.frames[ci_idx].pc = pc as usize;
    Ok(())
}

fn for_loop(st: &mut State, ci_idx: usize, base: usize, a: usize, sbx: i32) {
    match st.stack[base + a + 2] {
        Value::Integer(step) => {
            let remaining = match st.stack[base + a + 1] {
                Value::Integer(r) => r as u64,
                _ => unreachable!("FORPREP normalized the countdown"),
            };
            if remaining > 0 {
                st.stack[base + a + 1] = Value::Integer((remaining - 1) as i64);
                let idx = match st.stack[base + a] {
                    Value::Integer(i) => i.wrapping_add(step),
                    _ => unreachable!("FORPREP normalized the index"),
                };
                st.stack[base + a] = Value::Integer(idx);
                st.stack[base + a + 3] = Value::Integer(idx);
                let pc = st.frames[ci_idx].pc as i64 + sbx as i64;
                st.frames[ci_idx].pc = pc as usize;
            }
        }
        Value::Float(step) => {
            let idx = match st.stack[base + a] {
                Value::Float(f) => f + step,
                _ => unreachable!("FORPREP normalized the index"),
            };
            let limit = match st.stack[base + a + 1] {
                Value::Float(f) => f,
                _ => unreachable!("FORPREP normalized the limit"),
            };
            let keep_going = if step > 0.0 { idx <= limit } else { limit <= idx };
            if keep_going {
                st.stack[base + a] = Value::Float(idx);
                st.stack[base + a + 3] = Value::Float(idx);
                let pc = st.frames[ci_idx].pc as i64 + sbx as i64;
                st.frames[ci_idx].pc = pc as usize;
            }
        }
        _ => unreachable!("FORPREP normalized the step"),
    }
}

// ---- Metamethod-aware operations ----

/// Invoke a metamethod handler with `args`, returning its first
/// result. Uses scratch space above the stack top.
pub fn call_metamethod(st: &mut State, handler: Value, args: &[Value]) -> Result<Value, LuaError> {
    let func = st.top;
    st.ensure_stack(func + 1 + args.len() + EXTRA_STACK)?;
    st.stack[func] = handler;
    for (i, v) in args.iter().enumerate() {
        st.stack[func + 1 + i] = *v;
    }
    st.top = func + 1 + args.len();
    call_value(st, func, 1)?;
    let result = st.stack[func];
    st.top = func;
    Ok(result)
}

/// `t[key]` honoring `__index` chains, bounded by the tag-loop limit.
pub fn table_get(st: &mut State, t: Value, key: Value) -> Result<Value, LuaError> {
    let mut current = t;
    for _ in 0..MAX_TAG_LOOP {
        let handler = if let Value::Table(tr) = current {
            let v = st.heap.table(tr).raw_get(key);
            if !v.is_nil() {
                return Ok(v);
            }
            match metamethod::get_metamethod(&st.heap, &st.meta, current, Event::Index) {
                None => return Ok(Value::Nil),
                Some(h) => h,
            }
        } else {
            metamethod::get_metamethod(&st.heap, &st.meta, current, Event::Index).ok_or_else(
                || {
                    st.runtime_error(format!(
                        "attempt to index a {} value",
                        current.type_name()
                    ))
                },
            )?
        };
        if handler.is_function() {
            return call_metamethod(st, handler, &[current, key]);
        }
        current = handler;
    }
    Err(st.runtime_error("'__index' chain too long; possible loop"))
}

/// `t[key] = value` honoring `__newindex` chains.
pub fn table_set(st: &mut State, t: Value, key: Value, value: Value) -> Result<(), LuaError> {
    let mut current = t;
    for _ in 0..MAX_TAG_LOOP {
        let handler = if let Value::Table(tr) = current {
            let existing = st.heap.table(tr).raw_get(key);
            let handler = if existing.is_nil() {
                metamethod::get_metamethod(&st.heap, &st.meta, current, Event::NewIndex)
            } else {
                None
            };
            match handler {
                None => {
                    return st
                        .heap
                        .table_mut(tr)
                        .raw_set(key, value)
                        .map_err(|e| st.runtime_error(e.message()));
                }
                Some(h) => h,
            }
        } else {
            metamethod::get_metamethod(&st.heap, &st.meta, current, Event::NewIndex).ok_or_else(
                || {
                    st.runtime_error(format!(
                        "attempt to index a {} value",
                        current.type_name()
                    ))
                },
            )?
        };
        if handler.is_function() {
            call_metamethod(st, handler, &[current, key, value])?;
            return Ok(());
        }
        current = handler;
    }
    Err(st.runtime_error("'__newindex' chain too long; possible loop"))
}

/// Equality with `__eq` dispatch (same-type tables or userdata only).
pub fn values_equal(st: &mut State, a: Value, b: Value) -> Result<bool, LuaError> {
    if compare::raw_eq(a, b) {
        return Ok(true);
    }
    let comparable = matches!(
        (a, b),
        (Value::Table(_), Value::Table(_)) | (Value::UserData(_), Value::UserData(_))
    );
    if !comparable {
        return Ok(false);
    }
    let handler = metamethod::get_metamethod(&st.heap, &st.meta, a, Event::Eq)
        .or_else(|| metamethod::get_metamethod(&st.heap, &st.meta, b, Event::Eq));
    match handler {
        Some(h) => Ok(call_metamethod(st, h, &[a, b])?.is_truthy()),
        None => Ok(false),
    }
}

fn compare_type_error(st: &State, a: Value, b: Value) -> LuaError {
    let (ta, tb) = (a.type_name(), b.type_name());
    if ta == tb {
        st.runtime_error(format!("attempt to compare two {ta} values"))
    } else {
        st.runtime_error(format!("attempt to compare {ta} with {tb}"))
    }
}

/// `a < b` with `__lt` dispatch.
pub fn values_less(st: &mut State, a: Value, b: Value) -> Result<bool, LuaError> {
    if let Some(r) = compare::less_than(a, b, &st.strings) {
        return Ok(r);
    }
    let handler = metamethod::get_metamethod(&st.heap, &st.meta, a, Event::Lt)
        .or_else(|| metamethod::get_metamethod(&st.heap, &st.meta, b, Event::Lt))
        .ok_or_else(|| compare_type_error(st, a, b))?;
    Ok(call_metamethod(st, handler, &[a, b])?.is_truthy())
}

/// `a <= b` with `__le` dispatch, falling back to `not (b < a)`.
pub fn values_less_equal(st: &mut State, a: Value, b: Value) -> Result<bool, LuaError> {
    if let Some(r) = compare::less_equal(a, b, &st.strings) {
        return Ok(r);
    }
    if let Some(handler) = metamethod::get_metamethod(&st.heap, &st.meta, a, Event::Le)
        .or_else(|| metamethod::get_metamethod(&st.heap, &st.meta, b, Event::Le))
    {
        return Ok(call_metamethod(st, handler, &[a, b])?.is_truthy());
    }
    if let Some(handler) = metamethod::get_metamethod(&st.heap, &st.meta, b, Event::Lt)
        .or_else(|| metamethod::get_metamethod(&st.heap, &st.meta, a, Event::Lt))
    {
        return Ok(!call_metamethod(st, handler, &[b, a])?.is_truthy());
    }
    Err(compare_type_error(st, a, b))
}

/// `#v` with `__len` dispatch.
pub fn length_of(st: &mut State, v: Value) -> Result<Value, LuaError> {
    match v {
        Value::Str(id) => Ok(Value::Integer(st.strings.bytes(id).len() as i64)),
        Value::Table(t) => {
            if let Some(handler) =
                metamethod::get_metamethod(&st.heap, &st.meta, v, Event::Len)
            {
                call_metamethod(st, handler, &[v])
            } else {
                Ok(Value::Integer(st.heap.table(t).length()))
            }
        }
        _ => {
            let handler = metamethod::get_metamethod(&st.heap, &st.meta, v, Event::Len)
                .ok_or_else(|| {
                    st.runtime_error(format!(
                        "attempt to get length of a {} value",
                        v.type_name()
                    ))
                })?;
            call_metamethod(st, handler, &[v])
        }
    }
}

/// A value's string bytes for concatenation: strings directly,
/// numbers formatted.
fn concat_piece(st: &mut State, v: Value) -> Option<Vec<u8>> {
    match v {
        Value::Str(id) => Some(st.strings.bytes(id).to_vec()),
        Value::Integer(_) | Value::Float(_) => {
            Some(coerce::number_to_display(v).unwrap().into_bytes())
        }
        _ => None,
    }
}

/// Fold the `total` values below the stack top into one, right to
/// left, dispatching `__concat` when a pair is not string-like.
pub fn concat_in_place(st: &mut State, total: usize) -> Result<(), LuaError> {
    debug_assert!(total >= 1);
    let mut remaining = total;
    while remaining > 1 {
        let v1 = st.stack[st.top - 2];
        let v2 = st.stack[st.top - 1];
        let joined = match (concat_piece(st, v1), concat_piece(st, v2)) {
            (Some(mut b1), Some(b2)) => {
                b1.extend_from_slice(&b2);
                Value::Str(st.strings.intern(&b1))
            }
            _ => {
                let handler =
                    metamethod::get_metamethod(&st.heap, &st.meta, v1, Event::Concat)
                        .or_else(|| {
                            metamethod::get_metamethod(&st.heap, &st.meta, v2, Event::Concat)
                        })
                        .ok_or_else(|| {
                            let bad = if concat_piece_type_ok(v1) { v2 } else { v1 };
                            st.runtime_error(format!(
                                "attempt to concatenate a {} value",
                                bad.type_name()
                            ))
                        })?;
                call_metamethod(st, handler, &[v1, v2])?
            }
        };
        st.top -= 1;
        st.stack[st.top - 1] = joined;
        remaining -= 1;
    }
    Ok(())
}

fn concat_piece_type_ok(v: Value) -> bool {
    matches!(v, Value::Str(_) | Value::Integer(_) | Value::Float(_))
}

fn arith_event_name(op: ArithOp) -> &'static str {
    if op.is_bitwise() {
        "perform bitwise operation on"
    } else {
        "perform arithmetic on"
    }
}

fn arith_meta_binary(
    st: &mut State,
    op: ArithOp,
    a: Value,
    b: Value,
) -> Result<Value, LuaError> {
    let ev = Event::from_arith(op);
    let handler = metamethod::get_metamethod(&st.heap, &st.meta, a, ev)
        .or_else(|| metamethod::get_metamethod(&st.heap, &st.meta, b, ev));
    match handler {
        Some(h) => call_metamethod(st, h, &[a, b]),
        None => {
            let bad = if coerce::to_numeral(a, &st.strings).is_none() {
                a
            } else {
                b
            };
            Err(st.runtime_error(format!(
                "attempt to {} a {} value",
                arith_event_name(op),
                bad.type_name()
            )))
        }
    }
}

fn arith_meta_unary(st: &mut State, op: ArithOp, v: Value) -> Result<Value, LuaError> {
    let ev = Event::from_arith(op);
    match metamethod::get_metamethod(&st.heap, &st.meta, v, ev) {
        // Unary events pass the operand twice, like the reference.
        Some(h) => call_metamethod(st, h, &[v, v]),
        None => Err(st.runtime_error(format!(
            "attempt to {} a {} value",
            arith_event_name(op),
            v.type_name()
        ))),
    }
}

/// Attach the current source location to location-less runtime errors.
fn attach_location(st: &State, e: LuaError) -> LuaError {
    match e {
        LuaError::Runtime(msg) => st.runtime_error(msg),
        other => other,
    }
}
