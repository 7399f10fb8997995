// File: src/table.rs
//
// Open-addressed hash table from interned string to `Value` (spec.md §4.C).
// Used, polymorphically, as: the globals table, every instance's field
// table, every class's method table, and (in `gc::Heap`) the string-intern
// set itself (value `Nil` there).
//
// Linear probing with tombstones. A tombstone is an entry with `key: None`
// and `value: Value::Bool(true)`; an empty (never used) slot is `key: None`
// and `value: Value::Nil`. This distinction, and the exact tombstone
// marker, follows `clox`'s `table.c` (`findEntry`/`tableDelete`).
//
// The entry caches the key string's hash alongside the handle so that
// resizing never needs to look the string back up on the heap -- the same
// reason `ObjString` carries its own `hash` field in the original.

use crate::gc::{Heap, ObjRef};
use crate::value::Value;

const MAX_LOAD: f64 = 0.75;

#[derive(Clone, Copy)]
struct Entry {
    key: Option<ObjRef>,
    hash: u32,
    value: Value,
}

const EMPTY: Entry = Entry { key: None, hash: 0, value: Value::Nil };

#[derive(Clone)]
pub struct Table {
    entries: Vec<Entry>,
    /// Active entries plus tombstones (tombstones count toward load factor,
    /// matching the original).
    count: usize,
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

impl Table {
    pub fn new() -> Self {
        Table { entries: Vec::new(), count: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn find_entry(entries: &[Entry], key: ObjRef, hash: u32) -> usize {
        let mask = entries.len() - 1;
        let mut index = (hash as usize) & mask;
        let mut tombstone: Option<usize> = None;
        loop {
            let entry = &entries[index];
            match entry.key {
                None => {
                    if matches!(entry.value, Value::Nil) {
                        return tombstone.unwrap_or(index);
                    } else if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Some(k) if k == key => return index,
                Some(_) => {}
            }
            index = (index + 1) & mask;
        }
    }

    fn grow(&mut self, new_capacity: usize) {
        debug_assert!(new_capacity.is_power_of_two());
        let mut new_entries = vec![EMPTY; new_capacity];

        let mut new_count = 0;
        for entry in &self.entries {
            let Some(key) = entry.key else { continue };
            let index = Self::find_entry(&new_entries, key, entry.hash);
            new_entries[index] = *entry;
            new_count += 1;
        }

        self.entries = new_entries;
        self.count = new_count;
    }

    fn ensure_capacity_for(&mut self, additional_count: usize) {
        let capacity = self.entries.len();
        if (additional_count as f64) > (capacity as f64) * MAX_LOAD {
            let new_capacity = if capacity < 8 { 8 } else { capacity * 2 };
            self.grow(new_capacity);
        }
    }

    /// `tableSet`: insert or overwrite. Returns `true` if `key` was not
    /// already present (a brand-new key, not a tombstone reuse).
    pub fn set(&mut self, key: ObjRef, hash: u32, value: Value) -> bool {
        self.ensure_capacity_for(self.count + 1);
        let index = Self::find_entry(&self.entries, key, hash);
        let entry = &mut self.entries[index];
        let is_new_key = entry.key.is_none();
        if is_new_key && matches!(entry.value, Value::Nil) {
            self.count += 1;
        }
        entry.key = Some(key);
        entry.hash = hash;
        entry.value = value;
        is_new_key
    }

    /// `tableSetIfNew`: used by `OP_DEFINE_GLOBAL` -- redefining an existing
    /// global is an error (spec.md §9(a)).
    pub fn set_if_new(&mut self, key: ObjRef, hash: u32, value: Value) -> bool {
        self.ensure_capacity_for(self.count + 1);
        let index = Self::find_entry(&self.entries, key, hash);
        let entry = &mut self.entries[index];
        if entry.key.is_some() {
            return false;
        }
        if matches!(entry.value, Value::Nil) {
            self.count += 1;
        }
        entry.key = Some(key);
        entry.hash = hash;
        entry.value = value;
        true
    }

    /// `tableSetIfExists`: used by `OP_SET_GLOBAL`.
    pub fn set_if_exists(&mut self, key: ObjRef, hash: u32, value: Value) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let index = Self::find_entry(&self.entries, key, hash);
        let entry = &mut self.entries[index];
        if entry.key.is_none() {
            return false;
        }
        entry.value = value;
        true
    }

    pub fn get(&self, key: ObjRef, hash: u32) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        let index = Self::find_entry(&self.entries, key, hash);
        self.entries[index].key.map(|_| self.entries[index].value)
    }

    pub fn contains(&self, key: ObjRef, hash: u32) -> bool {
        self.get(key, hash).is_some()
    }

    /// `tableDelete`: replaces the slot with a tombstone rather than
    /// clearing it, so later probes don't stop short.
    pub fn delete(&mut self, key: ObjRef, hash: u32) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let index = Self::find_entry(&self.entries, key, hash);
        if self.entries[index].key.is_none() {
            return false;
        }
        self.entries[index].key = None;
        self.entries[index].value = Value::Bool(true);
        true
    }

    /// `tableAddAll`: copies every live entry of `self` into `dst`.
    pub fn add_all(&self, dst: &mut Table) {
        for entry in &self.entries {
            if let Some(key) = entry.key {
                dst.set(key, entry.hash, entry.value);
            }
        }
    }

    /// `tableFindString`: the one place a table is probed without already
    /// holding a handle to the key -- used to intern a freshly scanned or
    /// concatenated byte sequence.
    pub fn find_string(&self, heap: &Heap, bytes: &[u8], hash: u32) -> Option<ObjRef> {
        if self.entries.is_empty() {
            return None;
        }
        let mask = self.entries.len() - 1;
        let mut index = (hash as usize) & mask;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None if matches!(entry.value, Value::Nil) => return None,
                Some(key) => {
                    let s = heap.get(key).as_string().expect("table key must be a string");
                    if s.hash == hash && s.as_bytes() == bytes {
                        return Some(key);
                    }
                }
                _ => {}
            }
            index = (index + 1) & mask;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, Value)> + '_ {
        self.entries.iter().filter_map(|e| e.key.map(|k| (k, e.value)))
    }

    /// Drops every entry whose key string did not survive a mark phase.
    /// Safe because string interning guarantees no other reference to an
    /// unmarked string exists once marking is complete (spec.md §4.G).
    pub fn remove_white(&mut self, heap: &Heap) {
        let doomed: Vec<(ObjRef, u32)> = self
            .entries
            .iter()
            .filter_map(|e| e.key.map(|k| (k, e.hash)))
            .filter(|(k, _)| !heap.is_marked(*k))
            .collect();
        for (key, hash) in doomed {
            self.delete(key, hash);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::Heap;

    #[test]
    fn set_get_delete_roundtrip() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let (a, ha) = heap.intern_str("alpha");
        let (b, hb) = heap.intern_str("beta");

        assert!(table.set(a, ha, Value::Number(1.0)));
        assert!(!table.set(a, ha, Value::Number(2.0)));
        assert_eq!(table.get(a, ha), Some(Value::Number(2.0)));
        assert_eq!(table.get(b, hb), None);

        assert!(table.delete(a, ha));
        assert!(!table.delete(a, ha));
        assert_eq!(table.get(a, ha), None);
    }

    #[test]
    fn grows_past_load_factor_without_losing_entries() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let mut handles = Vec::new();
        for i in 0..200 {
            let (h, hash) = heap.intern_str(&format!("key{i}"));
            table.set(h, hash, Value::Number(i as f64));
            handles.push((h, hash));
        }
        for (i, (h, hash)) in handles.iter().enumerate() {
            assert_eq!(table.get(*h, *hash), Some(Value::Number(i as f64)));
        }
    }

    #[test]
    fn define_global_twice_is_rejected_by_set_if_new() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let (k, h) = heap.intern_str("x");
        assert!(table.set_if_new(k, h, Value::Nil));
        assert!(!table.set_if_new(k, h, Value::Nil));
    }
}
