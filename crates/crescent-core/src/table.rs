//! Hybrid array+hash Lua table.
//!
//! Positive integer keys `1..=n` live in a dense array part; every
//! other key lives in an insertion-ordered hash part, which gives
//! `next` a per-table-stable traversal order across reads of an
//! unmodified table. A float key whose value is an exact integer
//! normalizes to the integer key before either part is consulted.

use crate::heap::UserData;
use crate::string::StrId;
use crate::value::{FnId, NativeId, Ref, Value};
use indexmap::IndexMap;

/// Normalized key for the hash part. Identity keys (tables, functions,
/// userdata) hash by arena index; float keys by bit pattern.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TableKey {
    Integer(i64),
    Str(StrId),
    Float(u64),
    Boolean(bool),
    Table(u32),
    LuaFn(u32),
    NativeFn(u32),
    UserData(u32),
}

/// Reason a key cannot be used in `raw_set`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyError {
    Nil,
    NaN,
}

impl KeyError {
    pub fn message(self) -> &'static str {
        match self {
            KeyError::Nil => "table index is nil",
            KeyError::NaN => "table index is NaN",
        }
    }
}

pub struct Table {
    /// Array part: `array[i]` holds the value for key `i + 1`.
    array: Vec<Value>,
    /// Hash part for everything else.
    hash: IndexMap<TableKey, Value>,
    pub metatable: Option<Ref<Table>>,
}

impl Table {
    pub fn new(array_hint: usize, hash_hint: usize) -> Self {
        Table {
            array: Vec::with_capacity(array_hint),
            hash: IndexMap::with_capacity(hash_hint),
            metatable: None,
        }
    }

    /// Raw get: no metamethods. Missing keys yield nil.
    pub fn raw_get(&self, key: Value) -> Value {
        if let Some(i) = normalize_int_key(key) {
            return self.raw_geti(i);
        }
        match table_key(key) {
            Some(tk) => self.hash.get(&tk).copied().unwrap_or(Value::Nil),
            None => Value::Nil,
        }
    }

    /// Raw get with an integer key.
    pub fn raw_geti(&self, key: i64) -> Value {
        if key >= 1 && (key as u64) <= self.array.len() as u64 {
            self.array[(key - 1) as usize]
        } else {
            self.hash
                .get(&TableKey::Integer(key))
                .copied()
                .unwrap_or(Value::Nil)
        }
    }

    /// Raw get with an interned string key.
    pub fn raw_get_str(&self, key: StrId) -> Value {
        self.hash
            .get(&TableKey::Str(key))
            .copied()
            .unwrap_or(Value::Nil)
    }

    /// Raw set: no metamethods. Rejects nil and NaN keys.
    pub fn raw_set(&mut self, key: Value, value: Value) -> Result<(), KeyError> {
        if key.is_nil() {
            return Err(KeyError::Nil);
        }
        if let Value::Float(f) = key {
            if f.is_nan() {
                return Err(KeyError::NaN);
            }
        }
        if let Some(i) = normalize_int_key(key) {
            self.raw_seti(i, value);
            return Ok(());
        }
        let tk = table_key(key).expect("nil/NaN keys rejected above");
        self.hash_set(tk, value);
        Ok(())
    }

    /// Raw set with an integer key.
    pub fn raw_seti(&mut self, key: i64, value: Value) {
        if key >= 1 {
            let idx = (key - 1) as u64;
            if idx < self.array.len() as u64 {
                self.array[idx as usize] = value;
                return;
            }
            // Contiguous append extends the array part.
            if idx == self.array.len() as u64 && !value.is_nil() {
                self.array.push(value);
                self.migrate_hash_tail();
                return;
            }
        }
        self.hash_set(TableKey::Integer(key), value);
    }

    /// Raw set with an interned string key.
    pub fn raw_set_str(&mut self, key: StrId, value: Value) {
        self.hash_set(TableKey::Str(key), value);
    }

    fn hash_set(&mut self, key: TableKey, value: Value) {
        if value.is_nil() {
            // Keep a tombstone for keys that exist, so iteration started
            // before the delete can still find its position. Never insert
            // a tombstone for a key that was absent.
            if self.hash.contains_key(&key) {
                self.hash.insert(key, Value::Nil);
            }
        } else {
            self.hash.insert(key, value);
        }
    }

    /// A border: some `n` with `t[n] ~= nil` and `t[n+1] == nil`,
    /// found by binary search over the array tail in O(log n).
    pub fn length(&self) -> i64 {
        if self.array.is_empty() {
            // A hash-resident sequence still deserves a border.
            if self.raw_geti(1).is_nil() {
                return 0;
            }
            let mut n = 1i64;
            while !self.raw_geti(n + 1).is_nil() {
                n += 1;
            }
            return n;
        }
        if !self.array.last().unwrap().is_nil() {
            // Dense array; check whether the sequence continues in hash.
            let mut n = self.array.len() as i64;
            while !self
                .hash
                .get(&TableKey::Integer(n + 1))
                .copied()
                .unwrap_or(Value::Nil)
                .is_nil()
            {
                n += 1;
            }
            return n;
        }
        let mut lo = 0usize;
        let mut hi = self.array.len();
        // Invariant: array[hi] is nil (or hi == len with last nil).
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.array[mid].is_nil() {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        lo as i64
    }

    /// Advance iteration. `key == Nil` starts; `Ok(None)` ends.
    /// `Err(())` means the key was never in the table.
    #[allow(clippy::result_unit_err)]
    pub fn next(&self, key: Value) -> Result<Option<(Value, Value)>, ()> {
        if key.is_nil() {
            for (i, v) in self.array.iter().enumerate() {
                if !v.is_nil() {
                    return Ok(Some((Value::Integer((i + 1) as i64), *v)));
                }
            }
            return Ok(self.first_hash_entry(0));
        }
        // Keys inside the array range continue there.
        if let Some(i) = normalize_int_key(key) {
            if i >= 1 && (i as u64) <= self.array.len() as u64 {
                for j in (i as usize)..self.array.len() {
                    if !self.array[j].is_nil() {
                        return Ok(Some((Value::Integer((j + 1) as i64), self.array[j])));
                    }
                }
                return Ok(self.first_hash_entry(0));
            }
        }
        let tk = match table_key(key) {
            Some(tk) => tk,
            None => return Err(()),
        };
        match self.hash.get_index_of(&tk) {
            Some(pos) => Ok(self.first_hash_entry(pos + 1)),
            None => Err(()),
        }
    }

    /// First non-tombstone hash entry at or after `start`.
    fn first_hash_entry(&self, start: usize) -> Option<(Value, Value)> {
        for pos in start..self.hash.len() {
            let (k, v) = self.hash.get_index(pos).unwrap();
            if !v.is_nil() {
                return Some((key_to_value(*k), *v));
            }
        }
        None
    }

    /// Pull integer keys that became contiguous out of the hash part.
    fn migrate_hash_tail(&mut self) {
        loop {
            let next = self.array.len() as i64 + 1;
            match self.hash.shift_remove(&TableKey::Integer(next)) {
                Some(v) if !v.is_nil() => self.array.push(v),
                _ => break,
            }
        }
    }

    /// Number of array slots (for size hints and the disassembler).
    pub fn array_len(&self) -> usize {
        self.array.len()
    }

    /// Live (non-tombstone) hash entries.
    pub fn hash_len(&self) -> usize {
        self.hash.values().filter(|v| !v.is_nil()).count()
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "table(array={}, hash={})",
            self.array.len(),
            self.hash.len()
        )
    }
}

/// Normalize a value to an integer key: integers directly, floats only
/// when exactly integral and in range.
fn normalize_int_key(key: Value) -> Option<i64> {
    match key {
        Value::Integer(i) => Some(i),
        Value::Float(f) => {
            if f.floor() == f && f >= i64::MIN as f64 && f < -(i64::MIN as f64) {
                Some(f as i64)
            } else {
                None
            }
        }
        _ => None,
    }
}

fn table_key(key: Value) -> Option<TableKey> {
    match key {
        Value::Nil => None,
        Value::Boolean(b) => Some(TableKey::Boolean(b)),
        Value::Integer(i) => Some(TableKey::Integer(i)),
        Value::Float(f) => {
            if f.is_nan() {
                None
            } else if let Some(i) = normalize_int_key(key) {
                Some(TableKey::Integer(i))
            } else {
                Some(TableKey::Float(f.to_bits()))
            }
        }
        Value::Str(id) => Some(TableKey::Str(id)),
        Value::Table(r) => Some(TableKey::Table(r.0)),
        Value::LuaFn(FnId(i)) => Some(TableKey::LuaFn(i)),
        Value::NativeFn(NativeId(i)) => Some(TableKey::NativeFn(i)),
        Value::UserData(r) => Some(TableKey::UserData(r.0)),
    }
}

fn key_to_value(key: TableKey) -> Value {
    match key {
        TableKey::Integer(i) => Value::Integer(i),
        TableKey::Str(id) => Value::Str(id),
        TableKey::Float(bits) => Value::Float(f64::from_bits(bits)),
        TableKey::Boolean(b) => Value::Boolean(b),
        TableKey::Table(i) => Value::Table(Ref::new(i)),
        TableKey::LuaFn(i) => Value::LuaFn(FnId(i)),
        TableKey::NativeFn(i) => Value::NativeFn(NativeId(i)),
        TableKey::UserData(i) => Value::UserData(Ref::<UserData>::new(i)),
    }
}
