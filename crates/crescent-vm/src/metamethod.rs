//! Tag method (metamethod) lookup.

use crate::arith::ArithOp;
use crescent_core::heap::Heap;
use crescent_core::string::{StrId, StringPool};
use crescent_core::table::Table;
use crescent_core::value::{Ref, Value};

/// Tag method events, in the reference order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    Index,
    NewIndex,
    Len,
    Eq,
    Add,
    Sub,
    Mul,
    Mod,
    Pow,
    Div,
    IDiv,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
    Unm,
    BNot,
    Lt,
    Le,
    Concat,
    Call,
    ToString,
}

impl Event {
    pub fn from_arith(op: ArithOp) -> Event {
        match op {
            ArithOp::Add => Event::Add,
            ArithOp::Sub => Event::Sub,
            ArithOp::Mul => Event::Mul,
            ArithOp::Mod => Event::Mod,
            ArithOp::Pow => Event::Pow,
            ArithOp::Div => Event::Div,
            ArithOp::IDiv => Event::IDiv,
            ArithOp::BAnd => Event::BAnd,
            ArithOp::BOr => Event::BOr,
            ArithOp::BXor => Event::BXor,
            ArithOp::Shl => Event::Shl,
            ArithOp::Shr => Event::Shr,
            ArithOp::Unm => Event::Unm,
            ArithOp::BNot => Event::BNot,
        }
    }

    /// The `__name` spelling of this event.
    pub fn name(self) -> &'static str {
        match self {
            Event::Index => "__index",
            Event::NewIndex => "__newindex",
            Event::Len => "__len",
            Event::Eq => "__eq",
            Event::Add => "__add",
            Event::Sub => "__sub",
            Event::Mul => "__mul",
            Event::Mod => "__mod",
            Event::Pow => "__pow",
            Event::Div => "__div",
            Event::IDiv => "__idiv",
            Event::BAnd => "__band",
            Event::BOr => "__bor",
            Event::BXor => "__bxor",
            Event::Shl => "__shl",
            Event::Shr => "__shr",
            Event::Unm => "__unm",
            Event::BNot => "__bnot",
            Event::Lt => "__lt",
            Event::Le => "__le",
            Event::Concat => "__concat",
            Event::Call => "__call",
            Event::ToString => "__tostring",
        }
    }
}

const EVENT_COUNT: usize = 23;

const ALL_EVENTS: [Event; EVENT_COUNT] = [
    Event::Index,
    Event::NewIndex,
    Event::Len,
    Event::Eq,
    Event::Add,
    Event::Sub,
    Event::Mul,
    Event::Mod,
    Event::Pow,
    Event::Div,
    Event::IDiv,
    Event::BAnd,
    Event::BOr,
    Event::BXor,
    Event::Shl,
    Event::Shr,
    Event::Unm,
    Event::BNot,
    Event::Lt,
    Event::Le,
    Event::Concat,
    Event::Call,
    Event::ToString,
];

/// Pre-interned event names, so lookup never allocates.
pub struct MetaNames {
    ids: [StrId; EVENT_COUNT],
}

impl MetaNames {
    pub fn init(strings: &mut StringPool) -> Self {
        let mut ids = [StrId(0); EVENT_COUNT];
        for (i, ev) in ALL_EVENTS.iter().enumerate() {
            ids[i] = strings.intern(ev.name().as_bytes());
        }
        MetaNames { ids }
    }

    pub fn id(&self, ev: Event) -> StrId {
        let idx = ALL_EVENTS.iter().position(|e| *e == ev).unwrap();
        self.ids[idx]
    }
}

/// The metatable of a value, if any. Only tables and userdata carry
/// metatables here; other types have none.
pub fn metatable_of(heap: &Heap, v: Value) -> Option<Ref<Table>> {
    match v {
        Value::Table(t) => heap.table(t).metatable,
        Value::UserData(u) => heap.userdata(u).metatable,
        _ => None,
    }
}

/// Look up an event handler on a value's metatable.
pub fn get_metamethod(heap: &Heap, names: &MetaNames, v: Value, ev: Event) -> Option<Value> {
    let mt = metatable_of(heap, v)?;
    let handler = heap.table(mt).raw_get_str(names.id(ev));
    if handler.is_nil() {
        None
    } else {
        Some(handler)
    }
}
