//! Structural Equality and Value Hashing
//!
//! Equality is structural and depth-bounded. Integers compare only to
//! integers; floats only to floats with bit-exact semantics except that NaN
//! never equals NaN; arrays compare element-wise respecting the
//! slot-is-reference bit; hashes compare by entry subset both ways; handles
//! delegate to their `compare` operation.

use crate::error::FixError;
use crate::heap::Heap;
use crate::object::{Object, bit_get};
use fixscript_core::Value;

/// Structural comparison recursion bound.
const EQUALITY_RECURSION_CUTOFF: usize = 50;

/// Value hash recursion bound; deeper structure stops contributing.
const HASH_RECURSION_CUTOFF: usize = 50;

impl Heap {
    /// Structural equality. Exceeding the recursion bound (for example on
    /// cyclic graphs) fails with `recursion_limit`.
    pub fn values_equal(&self, a: Value, b: Value) -> Result<bool, FixError> {
        self.values_equal_depth(a, b, 0)
    }

    fn values_equal_depth(&self, a: Value, b: Value, depth: usize) -> Result<bool, FixError> {
        if depth > EQUALITY_RECURSION_CUTOFF {
            return Err(FixError::RecursionLimit);
        }
        if a.is_float() && b.is_float() {
            if a.as_float().is_nan() || b.as_float().is_nan() {
                return Ok(false);
            }
            return Ok(a.data == b.data);
        }
        if a == b {
            return Ok(true);
        }
        if !a.is_object() || !b.is_object() {
            return Ok(false);
        }
        let oa = self.obj(a.data as usize)?;
        let ob = self.obj(b.data as usize)?;
        match (oa, ob) {
            (Object::Array(x), Object::Array(y)) => {
                if x.len != y.len || x.is_string() != y.is_string() {
                    return Ok(false);
                }
                for i in 0..x.len {
                    if !self.values_equal_depth(x.get(i), y.get(i), depth + 1)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            (Object::Hash(x), Object::Hash(y)) => {
                if x.len != y.len {
                    return Ok(false);
                }
                for entry in 0..x.entry_capacity() {
                    if !bit_get(&x.key_present, entry) || !bit_get(&x.has_data, entry) {
                        continue;
                    }
                    let key = x.key_at(entry);
                    let val = x.value_at(entry);
                    match self.hash_lookup(b, key)? {
                        Some(other) => {
                            if !self.values_equal_depth(val, other, depth + 1)? {
                                return Ok(false);
                            }
                        }
                        None => return Ok(false),
                    }
                }
                Ok(true)
            }
            (Object::Handle(x), Object::Handle(y)) => {
                Ok(x.data.type_tag() == y.data.type_tag() && x.data.compare(y.data.as_ref()))
            }
            _ => Ok(false),
        }
    }

    /// Content hash folding element-wise with `h = h*31 + x`. References
    /// recurse with a depth cap; hash entries combine with XOR so entry
    /// order does not matter.
    pub fn value_hash(&self, v: Value) -> u32 {
        self.value_hash_depth(v, 0)
    }

    fn value_hash_depth(&self, v: Value, depth: usize) -> u32 {
        if depth > HASH_RECURSION_CUTOFF {
            return 0;
        }
        if !v.is_object() {
            return v.data as u32;
        }
        let Ok(obj) = self.obj(v.data as usize) else {
            return v.data as u32;
        };
        match obj {
            Object::Array(a) => {
                let mut h = 0u32;
                for i in 0..a.len {
                    let e = a.get(i);
                    let x = if e.is_object() {
                        self.value_hash_depth(e, depth + 1)
                    } else {
                        e.data as u32
                    };
                    h = h.wrapping_mul(31).wrapping_add(x);
                }
                h
            }
            Object::Hash(hs) => {
                let mut h = 0u32;
                for entry in 0..hs.entry_capacity() {
                    if !bit_get(&hs.key_present, entry) || !bit_get(&hs.has_data, entry) {
                        continue;
                    }
                    let kh = self.value_hash_depth(hs.key_at(entry), depth + 1);
                    let vh = self.value_hash_depth(hs.value_at(entry), depth + 1);
                    h ^= kh.wrapping_mul(31).wrapping_add(vh);
                }
                h
            }
            Object::Handle(h) => h.data.value_hash(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_only_equals_int() {
        let heap = Heap::new();
        assert!(heap.values_equal(Value::int(3), Value::int(3)).unwrap());
        assert!(!heap.values_equal(Value::int(3), Value::float(3.0)).unwrap());
        assert!(!heap.values_equal(Value::int(0), Value::float(0.0)).unwrap());
    }

    #[test]
    fn test_nan_never_equal() {
        let heap = Heap::new();
        let nan = Value::float(f32::NAN);
        assert!(!heap.values_equal(nan, nan).unwrap());
        assert!(heap.values_equal(Value::float(2.5), Value::float(2.5)).unwrap());
    }

    #[test]
    fn test_array_structural_equality() {
        let mut heap = Heap::new();
        let a = heap.create_array(2).unwrap();
        let b = heap.create_array(2).unwrap();
        heap.set_array_elem(a, 0, Value::int(1)).unwrap();
        heap.set_array_elem(b, 0, Value::int(1)).unwrap();
        let inner_a = heap.create_string("s").unwrap();
        let inner_b = heap.create_string("s").unwrap();
        heap.set_array_elem(a, 1, inner_a).unwrap();
        heap.set_array_elem(b, 1, inner_b).unwrap();
        assert!(heap.values_equal(a, b).unwrap());
        heap.set_array_elem(b, 0, Value::int(2)).unwrap();
        assert!(!heap.values_equal(a, b).unwrap());
    }

    #[test]
    fn test_ref_flag_respected() {
        let mut heap = Heap::new();
        let a = heap.create_array(1).unwrap();
        let b = heap.create_array(1).unwrap();
        let target = heap.create_array(0).unwrap();
        heap.set_array_elem(a, 0, target).unwrap();
        // Same payload stored as a plain integer
        heap.set_array_elem(b, 0, Value::int(target.data)).unwrap();
        assert!(!heap.values_equal(a, b).unwrap());
    }

    #[test]
    fn test_hash_subset_equality() {
        let mut heap = Heap::new();
        let a = heap.create_hash().unwrap();
        let b = heap.create_hash().unwrap();
        let k1 = heap.create_const_string("x").unwrap();
        let k2 = heap.create_const_string("y").unwrap();
        heap.set_hash_elem(a, k1, Value::int(1)).unwrap();
        heap.set_hash_elem(a, k2, Value::int(2)).unwrap();
        heap.set_hash_elem(b, k2, Value::int(2)).unwrap();
        assert!(!heap.values_equal(a, b).unwrap());
        heap.set_hash_elem(b, k1, Value::int(1)).unwrap();
        assert!(heap.values_equal(a, b).unwrap());
    }

    #[test]
    fn test_cyclic_equality_hits_recursion_limit() {
        let mut heap = Heap::new();
        let a = heap.create_array(1).unwrap();
        let b = heap.create_array(1).unwrap();
        heap.set_array_elem(a, 0, a).unwrap();
        heap.set_array_elem(b, 0, b).unwrap();
        assert_eq!(heap.values_equal(a, b), Err(FixError::RecursionLimit));
    }

    #[test]
    fn test_equal_strings_hash_alike() {
        let mut heap = Heap::new();
        let a = heap.create_string("hash me").unwrap();
        let b = heap.create_const_string("hash me").unwrap();
        assert_eq!(heap.value_hash(a), heap.value_hash(b));
    }

    #[test]
    fn test_cyclic_hash_terminates() {
        let mut heap = Heap::new();
        let a = heap.create_array(1).unwrap();
        heap.set_array_elem(a, 0, a).unwrap();
        let _ = heap.value_hash(a);
    }
}
