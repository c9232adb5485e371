//! Open-addressed hash table keyed by interned-string identity
//!
//! Because strings are interned, key equality is handle equality; the
//! probe sequence only needs each key's cached hash, never the string
//! contents. The one exception is [`Table::find_string`], the interning
//! primitive, which compares candidate contents through a caller-supplied
//! predicate.
//!
//! Deleted slots become tombstones. Tombstones count toward the load
//! factor and are reclaimed when the table rehashes into a larger array.

use crate::value::{ObjRef, Value};

const MAX_LOAD_NUM: usize = 3;
const MAX_LOAD_DEN: usize = 4;
const MIN_CAPACITY: usize = 8;

#[derive(Debug, Clone, Copy)]
struct Entry {
    key: ObjRef,
    hash: u32,
    value: Value,
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Empty,
    Tombstone,
    Full(Entry),
}

/// Linear-probed table from interned string to value. Used for globals,
/// class method tables, instance fields, and the intern table itself.
#[derive(Debug, Default, Clone)]
pub struct Table {
    /// Full entries plus tombstones; drives the load factor.
    count: usize,
    slots: Vec<Slot>,
}

impl Table {
    pub fn new() -> Self {
        Table::default()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Bytes charged against the GC allocation counter.
    pub fn byte_size(&self) -> usize {
        self.slots.capacity() * std::mem::size_of::<Slot>()
    }

    /// Number of live (non-tombstone) entries.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    pub fn get(&self, key: ObjRef, hash: u32) -> Option<Value> {
        if self.slots.is_empty() {
            return None;
        }
        match self.probe(key, hash) {
            ProbeResult::Found(i) => match self.slots[i] {
                Slot::Full(e) => Some(e.value),
                _ => unreachable!("probe returned a non-full slot"),
            },
            ProbeResult::Vacant(_) => None,
        }
    }

    /// Insert or update. Returns true when the key was newly inserted.
    pub fn set(&mut self, key: ObjRef, hash: u32, value: Value) -> bool {
        if (self.count + 1) * MAX_LOAD_DEN > self.slots.len() * MAX_LOAD_NUM {
            self.grow();
        }
        match self.probe(key, hash) {
            ProbeResult::Found(i) => {
                self.slots[i] = Slot::Full(Entry { key, hash, value });
                false
            }
            ProbeResult::Vacant(i) => {
                // Reusing a tombstone does not raise the load.
                if matches!(self.slots[i], Slot::Empty) {
                    self.count += 1;
                }
                self.slots[i] = Slot::Full(Entry { key, hash, value });
                true
            }
        }
    }

    /// Remove a key, installing a tombstone. Returns true if it was present.
    pub fn delete(&mut self, key: ObjRef, hash: u32) -> bool {
        if self.slots.is_empty() {
            return false;
        }
        match self.probe(key, hash) {
            ProbeResult::Found(i) => {
                self.slots[i] = Slot::Tombstone;
                true
            }
            ProbeResult::Vacant(_) => false,
        }
    }

    /// Bulk-copy every live entry into `to` (class inheritance).
    pub fn add_all(&self, to: &mut Table) {
        for slot in &self.slots {
            if let Slot::Full(e) = slot {
                to.set(e.key, e.hash, e.value);
            }
        }
    }

    /// The interning primitive: probe by hash, confirm candidates through
    /// `eq` (which compares the actual characters). Returns the existing
    /// key handle, if any.
    pub fn find_string(&self, hash: u32, mut eq: impl FnMut(ObjRef) -> bool) -> Option<ObjRef> {
        if self.slots.is_empty() {
            return None;
        }
        let mask = self.slots.len() - 1;
        let mut index = hash as usize & mask;
        loop {
            match self.slots[index] {
                Slot::Empty => return None,
                Slot::Tombstone => {}
                Slot::Full(e) => {
                    if e.hash == hash && eq(e.key) {
                        return Some(e.key);
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    /// Drop every entry whose key the collector left unmarked. Run after
    /// marking and before the sweep so interned strings can die.
    pub fn remove_white(&mut self, mut is_marked: impl FnMut(ObjRef) -> bool) {
        for i in 0..self.slots.len() {
            if let Slot::Full(e) = self.slots[i] {
                if !is_marked(e.key) {
                    self.slots[i] = Slot::Tombstone;
                }
            }
        }
    }

    /// Live entries, in probe order.
    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, Value)> + '_ {
        self.slots.iter().filter_map(|slot| match slot {
            Slot::Full(e) => Some((e.key, e.value)),
            _ => None,
        })
    }

    fn probe(&self, key: ObjRef, hash: u32) -> ProbeResult {
        let mask = self.slots.len() - 1;
        let mut index = hash as usize & mask;
        let mut tombstone: Option<usize> = None;
        loop {
            match self.slots[index] {
                Slot::Empty => return ProbeResult::Vacant(tombstone.unwrap_or(index)),
                Slot::Tombstone => {
                    tombstone.get_or_insert(index);
                }
                Slot::Full(e) => {
                    if e.key == key {
                        return ProbeResult::Found(index);
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    fn grow(&mut self) {
        let new_capacity = (self.slots.len() * 2).max(MIN_CAPACITY);
        let old = std::mem::replace(&mut self.slots, vec![Slot::Empty; new_capacity]);
        // Tombstones are discarded by the rehash.
        self.count = 0;
        for slot in old {
            if let Slot::Full(e) = slot {
                let mask = self.slots.len() - 1;
                let mut index = e.hash as usize & mask;
                while let Slot::Full(_) = self.slots[index] {
                    index = (index + 1) & mask;
                }
                self.slots[index] = Slot::Full(e);
                self.count += 1;
            }
        }
    }
}

enum ProbeResult {
    /// Index of the slot holding the key.
    Found(usize),
    /// Index where an insertion should land.
    Vacant(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u32) -> (ObjRef, u32) {
        // Spread test keys across buckets a little.
        (ObjRef(n), n.wrapping_mul(2654435761))
    }

    #[test]
    fn test_set_get_update() {
        let mut t = Table::new();
        let (k, h) = key(1);
        assert!(t.set(k, h, Value::Number(1.0)));
        assert!(!t.set(k, h, Value::Number(2.0)));
        assert_eq!(t.get(k, h), Some(Value::Number(2.0)));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_missing_key() {
        let t = Table::new();
        let (k, h) = key(9);
        assert_eq!(t.get(k, h), None);
    }

    #[test]
    fn test_delete_and_tombstone_reuse() {
        let mut t = Table::new();
        let (k1, h1) = key(1);
        let (k2, h2) = key(2);
        t.set(k1, h1, Value::Bool(true));
        t.set(k2, h2, Value::Bool(false));
        assert!(t.delete(k1, h1));
        assert!(!t.delete(k1, h1));
        assert_eq!(t.get(k1, h1), None);
        assert_eq!(t.get(k2, h2), Some(Value::Bool(false)));
        // Reinsertion lands on the tombstone without raising the load.
        let count_before = t.count;
        t.set(k1, h1, Value::Nil);
        assert_eq!(t.count, count_before);
    }

    #[test]
    fn test_growth_preserves_entries() {
        let mut t = Table::new();
        for n in 0..100 {
            let (k, h) = key(n);
            t.set(k, h, Value::Number(f64::from(n)));
        }
        assert!(t.capacity() >= 100);
        for n in 0..100 {
            let (k, h) = key(n);
            assert_eq!(t.get(k, h), Some(Value::Number(f64::from(n))));
        }
    }

    #[test]
    fn test_add_all() {
        let mut from = Table::new();
        let mut to = Table::new();
        for n in 0..10 {
            let (k, h) = key(n);
            from.set(k, h, Value::Number(f64::from(n)));
        }
        from.add_all(&mut to);
        assert_eq!(to.len(), 10);
        let (k, h) = key(3);
        assert_eq!(to.get(k, h), Some(Value::Number(3.0)));
    }

    #[test]
    fn test_find_string_matches_by_predicate() {
        let mut t = Table::new();
        let (k, h) = key(5);
        t.set(k, h, Value::Nil);
        assert_eq!(t.find_string(h, |r| r == k), Some(k));
        assert_eq!(t.find_string(h, |_| false), None);
        let (_, other_hash) = key(6);
        assert_eq!(t.find_string(other_hash, |_| true), None);
    }

    #[test]
    fn test_remove_white_drops_unmarked_keys() {
        let mut t = Table::new();
        let (k1, h1) = key(1);
        let (k2, h2) = key(2);
        t.set(k1, h1, Value::Nil);
        t.set(k2, h2, Value::Nil);
        t.remove_white(|r| r == k2);
        assert_eq!(t.get(k1, h1), None);
        assert_eq!(t.get(k2, h2), Some(Value::Nil));
    }
}
