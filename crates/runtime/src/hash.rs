//! Hash Operations
//!
//! Open-addressed, power-of-two sized tables with key/value pairs
//! interleaved in the int storage. Probing steps entry by entry from the
//! key's hash. Removal clears the entry's has-data bit but keeps the key as
//! a tombstone, preserving probe chains. The insertion-order list enables
//! stable iteration and O(1) nth-entry retrieval; removals mark it stale and
//! iteration re-materialises it lazily.

use crate::error::FixError;
use crate::heap::Heap;
use crate::object::{HashObj, Object, bit_get, bit_set};
use fixscript_core::Value;

enum Probe {
    /// Entry index holding the key (active or tombstoned).
    Found(usize),
    /// First free entry on the chain.
    Free(usize),
}

impl Heap {
    pub fn create_hash(&mut self) -> Result<Value, FixError> {
        let idx = self.alloc_object(Object::Hash(HashObj::new()))?;
        Ok(Value::object(idx))
    }

    fn hash_of(&self, v: Value) -> Result<&HashObj, FixError> {
        match self.obj(self.index_of(v)?)? {
            Object::Hash(h) => Ok(h),
            _ => Err(FixError::InvalidAccess),
        }
    }

    fn hash_of_mut(&mut self, v: Value) -> Result<&mut HashObj, FixError> {
        match self.obj_mut(self.index_of(v)?)? {
            Object::Hash(h) => Ok(h),
            _ => Err(FixError::InvalidAccess),
        }
    }

    fn probe(&self, v: Value, key: Value) -> Result<Probe, FixError> {
        let h = self.hash_of(v)?;
        let cap = h.entry_capacity();
        let mask = cap - 1;
        let mut entry = self.value_hash(key) as usize & mask;
        for _ in 0..cap {
            if !bit_get(&h.key_present, entry) {
                return Ok(Probe::Free(entry));
            }
            if self.values_equal(h.key_at(entry), key)? {
                return Ok(Probe::Found(entry));
            }
            entry = (entry + 1) & mask;
        }
        // Unreachable under the load factor bound
        Err(FixError::OutOfMemory)
    }

    /// Structural key lookup. `Ok(None)` when the key is absent.
    pub(crate) fn hash_lookup(&self, v: Value, key: Value) -> Result<Option<Value>, FixError> {
        match self.probe(v, key)? {
            Probe::Found(entry) => {
                let h = self.hash_of(v)?;
                if bit_get(&h.has_data, entry) {
                    Ok(Some(h.value_at(entry)))
                } else {
                    Ok(None)
                }
            }
            Probe::Free(_) => Ok(None),
        }
    }

    pub fn get_hash_elem(&self, v: Value, key: Value) -> Result<Value, FixError> {
        self.hash_lookup(v, key)?.ok_or(FixError::KeyNotFound)
    }

    pub fn hash_contains(&self, v: Value, key: Value) -> Result<bool, FixError> {
        Ok(self.hash_lookup(v, key)?.is_some())
    }

    pub fn set_hash_elem(&mut self, v: Value, key: Value, value: Value) -> Result<(), FixError> {
        {
            let h = self.hash_of(v)?;
            // Resize before the occupancy (keys including tombstones)
            // crosses a quarter of the capacity.
            if (h.occupied + 1) * 4 > h.entry_capacity() {
                self.hash_resize(v)?;
            }
        }
        match self.probe(v, key)? {
            Probe::Found(entry) => {
                let h = self.hash_of_mut(v)?;
                let was_active = bit_get(&h.has_data, entry);
                h.set_value_at(entry, value);
                if !was_active {
                    bit_set(&mut h.has_data, entry, true);
                    h.len += 1;
                    h.order.push(entry as u32);
                    h.order_stale = true;
                }
                Ok(())
            }
            Probe::Free(entry) => {
                let h = self.hash_of_mut(v)?;
                h.set_key_at(entry, key);
                h.set_value_at(entry, value);
                bit_set(&mut h.key_present, entry, true);
                bit_set(&mut h.has_data, entry, true);
                h.occupied += 1;
                h.len += 1;
                h.order.push(entry as u32);
                Ok(())
            }
        }
    }

    /// Remove a key, returning its value. The key slot stays behind as a
    /// tombstone so longer probe chains keep working.
    pub fn remove_hash_elem(&mut self, v: Value, key: Value) -> Result<Value, FixError> {
        match self.probe(v, key)? {
            Probe::Found(entry) => {
                let h = self.hash_of_mut(v)?;
                if !bit_get(&h.has_data, entry) {
                    return Err(FixError::KeyNotFound);
                }
                let old = h.value_at(entry);
                bit_set(&mut h.has_data, entry, false);
                h.set_value_at(entry, Value::ZERO);
                h.len -= 1;
                h.order_stale = true;
                Ok(old)
            }
            Probe::Free(_) => Err(FixError::KeyNotFound),
        }
    }

    pub fn clear_hash(&mut self, v: Value) -> Result<(), FixError> {
        let h = self.hash_of_mut(v)?;
        for x in &mut h.data {
            *x = 0;
        }
        for bits in [&mut h.ref_bits, &mut h.has_data, &mut h.key_present] {
            for w in bits.iter_mut() {
                *w = 0;
            }
        }
        h.order.clear();
        h.order_stale = false;
        h.len = 0;
        h.occupied = 0;
        Ok(())
    }

    pub fn hash_len(&self, v: Value) -> Result<usize, FixError> {
        Ok(self.hash_of(v)?.len)
    }

    /// Active entries in insertion order, without mutating the stored
    /// order list.
    pub fn hash_entries(&self, v: Value) -> Result<Vec<(Value, Value)>, FixError> {
        let h = self.hash_of(v)?;
        let order = materialised_order(h);
        Ok(order
            .iter()
            .map(|&e| (h.key_at(e as usize), h.value_at(e as usize)))
            .collect())
    }

    /// The nth entry by insertion order. Re-materialises the order list
    /// when removals left it stale.
    pub fn hash_entry(&mut self, v: Value, n: usize) -> Result<(Value, Value), FixError> {
        {
            let h = self.hash_of_mut(v)?;
            if h.order_stale {
                let order = materialised_order(h);
                h.order = order;
                h.order_stale = false;
            }
        }
        let h = self.hash_of(v)?;
        let &entry = h.order.get(n).ok_or(FixError::OutOfBounds)?;
        Ok((h.key_at(entry as usize), h.value_at(entry as usize)))
    }

    pub fn hash_keys(&self, v: Value) -> Result<Vec<Value>, FixError> {
        Ok(self.hash_entries(v)?.into_iter().map(|(k, _)| k).collect())
    }

    /// Double the capacity and rehash active entries in insertion order,
    /// dropping tombstones.
    fn hash_resize(&mut self, v: Value) -> Result<(), FixError> {
        let entries = self.hash_entries(v)?;
        let old_size;
        let new_cap;
        {
            let h = self.hash_of(v)?;
            old_size = h.byte_size();
            new_cap = (h.entry_capacity() * 2).max(4);
        }
        let key_hashes: Vec<u32> = entries.iter().map(|(k, _)| self.value_hash(*k)).collect();
        let h = self.hash_of_mut(v)?;
        let mut fresh = HashObj::with_capacity(new_cap);
        fresh.flags = h.flags;
        let mask = new_cap - 1;
        for ((key, value), kh) in entries.iter().zip(key_hashes) {
            let mut entry = kh as usize & mask;
            while bit_get(&fresh.key_present, entry) {
                entry = (entry + 1) & mask;
            }
            fresh.set_key_at(entry, *key);
            fresh.set_value_at(entry, *value);
            bit_set(&mut fresh.key_present, entry, true);
            bit_set(&mut fresh.has_data, entry, true);
            fresh.order.push(entry as u32);
        }
        fresh.len = entries.len();
        fresh.occupied = entries.len();
        let new_size = fresh.byte_size();
        *h = fresh;
        self.note_size_change(old_size, new_size);
        Ok(())
    }
}

/// Active entry indices in insertion order: stale and duplicate order
/// entries drop out, keeping the last occurrence (a re-inserted key moves
/// to the end).
fn materialised_order(h: &HashObj) -> Vec<u32> {
    let mut seen = vec![false; h.entry_capacity()];
    let mut out = Vec::with_capacity(h.len);
    for &entry in h.order.iter().rev() {
        let e = entry as usize;
        if e < h.entry_capacity() && bit_get(&h.has_data, e) && !seen[e] {
            seen[e] = true;
            out.push(entry);
        }
    }
    out.reverse();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_remove() {
        let mut heap = Heap::new();
        let h = heap.create_hash().unwrap();
        let k = heap.create_const_string("k").unwrap();
        heap.set_hash_elem(h, k, Value::int(5)).unwrap();
        assert_eq!(heap.get_hash_elem(h, k).unwrap(), Value::int(5));
        assert_eq!(heap.hash_len(h).unwrap(), 1);
        assert_eq!(heap.remove_hash_elem(h, k).unwrap(), Value::int(5));
        assert_eq!(heap.get_hash_elem(h, k), Err(FixError::KeyNotFound));
        assert_eq!(heap.hash_len(h).unwrap(), 0);
    }

    #[test]
    fn test_structural_key_lookup() {
        let mut heap = Heap::new();
        let h = heap.create_hash().unwrap();
        let k1 = heap.create_string("key").unwrap();
        let k2 = heap.create_string("key").unwrap();
        assert_ne!(k1, k2);
        heap.set_hash_elem(h, k1, Value::int(1)).unwrap();
        assert_eq!(heap.get_hash_elem(h, k2).unwrap(), Value::int(1));
    }

    #[test]
    fn test_update_in_place_keeps_len() {
        let mut heap = Heap::new();
        let h = heap.create_hash().unwrap();
        heap.set_hash_elem(h, Value::int(1), Value::int(10)).unwrap();
        heap.set_hash_elem(h, Value::int(1), Value::int(20)).unwrap();
        assert_eq!(heap.hash_len(h).unwrap(), 1);
        assert_eq!(heap.get_hash_elem(h, Value::int(1)).unwrap(), Value::int(20));
    }

    #[test]
    fn test_insertion_order_iteration() {
        let mut heap = Heap::new();
        let h = heap.create_hash().unwrap();
        let a = heap.create_const_string("a").unwrap();
        let b = heap.create_const_string("b").unwrap();
        let c = heap.create_const_string("c").unwrap();
        let d = heap.create_const_string("d").unwrap();
        heap.set_hash_elem(h, a, Value::int(1)).unwrap();
        heap.set_hash_elem(h, b, Value::int(2)).unwrap();
        heap.set_hash_elem(h, c, Value::int(3)).unwrap();
        heap.remove_hash_elem(h, b).unwrap();
        heap.set_hash_elem(h, d, Value::int(4)).unwrap();
        let keys = heap.hash_keys(h).unwrap();
        let names: Vec<String> = keys.iter().map(|&k| heap.get_string(k).unwrap()).collect();
        assert_eq!(names, vec!["a", "c", "d"]);
    }

    #[test]
    fn test_reinserted_key_moves_to_end() {
        let mut heap = Heap::new();
        let h = heap.create_hash().unwrap();
        let a = heap.create_const_string("a").unwrap();
        let b = heap.create_const_string("b").unwrap();
        heap.set_hash_elem(h, a, Value::int(1)).unwrap();
        heap.set_hash_elem(h, b, Value::int(2)).unwrap();
        heap.remove_hash_elem(h, a).unwrap();
        heap.set_hash_elem(h, a, Value::int(3)).unwrap();
        let keys = heap.hash_keys(h).unwrap();
        let names: Vec<String> = keys.iter().map(|&k| heap.get_string(k).unwrap()).collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[test]
    fn test_growth_and_many_keys() {
        let mut heap = Heap::new();
        let h = heap.create_hash().unwrap();
        for i in 0..200 {
            heap.set_hash_elem(h, Value::int(i), Value::int(i * 2)).unwrap();
        }
        assert_eq!(heap.hash_len(h).unwrap(), 200);
        for i in 0..200 {
            assert_eq!(
                heap.get_hash_elem(h, Value::int(i)).unwrap(),
                Value::int(i * 2)
            );
        }
    }

    #[test]
    fn test_empty_after_removals() {
        let mut heap = Heap::new();
        let h = heap.create_hash().unwrap();
        for i in 0..20 {
            heap.set_hash_elem(h, Value::int(i), Value::int(i)).unwrap();
        }
        for i in 0..20 {
            heap.remove_hash_elem(h, Value::int(i)).unwrap();
        }
        assert_eq!(heap.hash_len(h).unwrap(), 0);
        assert!(heap.hash_keys(h).unwrap().is_empty());
    }

    #[test]
    fn test_clear_hash() {
        let mut heap = Heap::new();
        let h = heap.create_hash().unwrap();
        heap.set_hash_elem(h, Value::int(1), Value::int(1)).unwrap();
        heap.set_hash_elem(h, Value::int(2), Value::int(2)).unwrap();
        heap.clear_hash(h).unwrap();
        assert_eq!(heap.hash_len(h).unwrap(), 0);
        assert_eq!(heap.get_hash_elem(h, Value::int(1)), Err(FixError::KeyNotFound));
        heap.set_hash_elem(h, Value::int(3), Value::int(3)).unwrap();
        assert_eq!(heap.hash_len(h).unwrap(), 1);
    }

    #[test]
    fn test_tombstone_preserves_probe_chain() {
        let mut heap = Heap::new();
        let h = heap.create_hash().unwrap();
        // Probing is deterministic: keys with the same hash collide into a
        // chain. Removing the first must not orphan the second.
        heap.set_hash_elem(h, Value::int(0), Value::int(100)).unwrap();
        heap.set_hash_elem(h, Value::int(4), Value::int(101)).unwrap();
        heap.set_hash_elem(h, Value::int(8), Value::int(102)).unwrap();
        heap.remove_hash_elem(h, Value::int(0)).unwrap();
        assert_eq!(heap.get_hash_elem(h, Value::int(8)).unwrap(), Value::int(102));
        assert_eq!(heap.get_hash_elem(h, Value::int(4)).unwrap(), Value::int(101));
    }
}
