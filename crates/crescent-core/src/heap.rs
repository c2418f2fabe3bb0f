//! State-owned object arenas.
//!
//! Tables, userdata, and upvalue cells live in typed `Vec` arenas and
//! are addressed by `Ref<T>` handles. Allocation is append-only and
//! there is no tracing collector; object lifetime is delegated to the
//! host allocator, and the whole heap drops with its state.

use crate::table::Table;
use crate::value::{Ref, Value};
use std::any::Any;

/// An upvalue cell: open while its variable is live on the stack,
/// closed (owning the value inline) afterwards.
#[derive(Debug)]
pub enum UpvalCell {
    /// Absolute index of the referenced stack slot.
    Open(usize),
    /// Captured value.
    Closed(Value),
}

/// Host-owned payload with an optional metatable.
pub struct UserData {
    pub data: Box<dyn Any>,
    pub metatable: Option<Ref<Table>>,
}

pub struct Heap {
    tables: Vec<Table>,
    upvals: Vec<UpvalCell>,
    userdata: Vec<UserData>,
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            tables: Vec::new(),
            upvals: Vec::new(),
            userdata: Vec::new(),
        }
    }

    pub fn alloc_table(&mut self, array_hint: usize, hash_hint: usize) -> Ref<Table> {
        let idx = self.tables.len() as u32;
        self.tables.push(Table::new(array_hint, hash_hint));
        Ref::new(idx)
    }

    pub fn table(&self, r: Ref<Table>) -> &Table {
        &self.tables[r.index()]
    }

    pub fn table_mut(&mut self, r: Ref<Table>) -> &mut Table {
        &mut self.tables[r.index()]
    }

    pub fn alloc_upval(&mut self, cell: UpvalCell) -> Ref<UpvalCell> {
        let idx = self.upvals.len() as u32;
        self.upvals.push(cell);
        Ref::new(idx)
    }

    pub fn upval(&self, r: Ref<UpvalCell>) -> &UpvalCell {
        &self.upvals[r.index()]
    }

    pub fn upval_mut(&mut self, r: Ref<UpvalCell>) -> &mut UpvalCell {
        &mut self.upvals[r.index()]
    }

    pub fn alloc_userdata(&mut self, data: Box<dyn Any>) -> Ref<UserData> {
        let idx = self.userdata.len() as u32;
        self.userdata.push(UserData {
            data,
            metatable: None,
        });
        Ref::new(idx)
    }

    pub fn userdata(&self, r: Ref<UserData>) -> &UserData {
        &self.userdata[r.index()]
    }

    pub fn userdata_mut(&mut self, r: Ref<UserData>) -> &mut UserData {
        &mut self.userdata[r.index()]
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}
