//! Value Cloning
//!
//! Deep clone produces a structurally equal graph with disjoint object
//! identities, except const strings and shared arrays, which may be shared.
//! The traversal recurses up to a cutoff and queues deeper objects for
//! iterative processing, so arbitrarily deep graphs clone with bounded
//! stack use. Cross-heap clone re-interns const strings, re-views shared
//! buffers, resolves function references by name, and copies handles
//! through their `copy` operation.

use crate::error::FixError;
use crate::heap::Heap;
use crate::object::{Object, ObjFlags};
use fixscript_core::Value;
use rustc_hash::FxHashMap;

/// Recursion cutoff; deeper graphs continue through the work queue.
const CLONE_RECURSION_CUTOFF: usize = 100;

impl Heap {
    /// Clone a value within this heap. A shallow clone copies only the top
    /// object; a deep clone copies the whole graph.
    pub fn clone_value(&mut self, v: Value, deep: bool) -> Result<Value, FixError> {
        if !v.is_object() {
            return Ok(v);
        }
        if !deep {
            return self.clone_shallow(v);
        }
        let mut map = FxHashMap::default();
        let mut queue: Vec<(Value, Value)> = Vec::new();
        let mut result = self.clone_intra(v, &mut map, 0, &mut queue);
        if result.is_ok() {
            while let Some((src, dst)) = queue.pop() {
                if let Err(e) = self.clone_intra_children(src, dst, &mut map, 0, &mut queue) {
                    result = Err(e);
                    break;
                }
            }
        }
        // Cloned objects were pinned while the graph was incomplete.
        let pinned: Vec<Value> = map.values().copied().collect();
        for p in pinned {
            self.unref(p);
        }
        result
    }

    fn clone_shallow(&mut self, v: Value) -> Result<Value, FixError> {
        let idx = self.index_of(v)?;
        match self.obj(idx)? {
            Object::Array(a) if a.flags.contains(ObjFlags::CONST) => Ok(v),
            Object::Array(a) if a.is_shared() => Ok(v),
            Object::Array(a) if a.is_string() => {
                let content = self.get_string(v)?;
                self.create_string(&content)
            }
            Object::Array(a) => {
                let len = a.len;
                let out = self.create_array(len)?;
                for i in 0..len {
                    let e = self.get_array_elem(v, i)?;
                    self.set_array_elem(out, i, e)?;
                }
                Ok(out)
            }
            Object::Hash(_) => {
                let out = self.create_hash()?;
                for (k, val) in self.hash_entries(v)? {
                    self.set_hash_elem(out, k, val)?;
                }
                Ok(out)
            }
            Object::Handle(h) => {
                let copied = h.data.copy().ok_or(FixError::UnserializableRef)?;
                self.create_handle(copied)
            }
        }
    }

    fn clone_intra(
        &mut self,
        v: Value,
        map: &mut FxHashMap<usize, Value>,
        depth: usize,
        queue: &mut Vec<(Value, Value)>,
    ) -> Result<Value, FixError> {
        if !v.is_object() {
            return Ok(v);
        }
        let idx = self.index_of(v)?;
        if let Some(&d) = map.get(&idx) {
            return Ok(d);
        }
        let out = match self.obj(idx)? {
            Object::Array(a) if a.flags.contains(ObjFlags::CONST) => v,
            Object::Array(a) if a.is_shared() => v,
            Object::Array(a) if a.is_string() => {
                let content = self.get_string(v)?;
                self.create_string(&content)?
            }
            Object::Array(a) => {
                let len = a.len;
                let out = self.create_array(len)?;
                self.add_ref(out);
                map.insert(idx, out);
                if depth >= CLONE_RECURSION_CUTOFF {
                    queue.push((v, out));
                } else {
                    self.clone_intra_children(v, out, map, depth, queue)?;
                }
                return Ok(out);
            }
            Object::Hash(_) => {
                let out = self.create_hash()?;
                self.add_ref(out);
                map.insert(idx, out);
                if depth >= CLONE_RECURSION_CUTOFF {
                    queue.push((v, out));
                } else {
                    self.clone_intra_children(v, out, map, depth, queue)?;
                }
                return Ok(out);
            }
            Object::Handle(h) => {
                let copied = h.data.copy().ok_or(FixError::UnserializableRef)?;
                self.create_handle(copied)?
            }
        };
        self.add_ref(out);
        map.insert(idx, out);
        Ok(out)
    }

    fn clone_intra_children(
        &mut self,
        src: Value,
        dst: Value,
        map: &mut FxHashMap<usize, Value>,
        depth: usize,
        queue: &mut Vec<(Value, Value)>,
    ) -> Result<(), FixError> {
        if self.is_hash(src) {
            for (k, val) in self.hash_entries(src)? {
                let ck = self.clone_intra(k, map, depth + 1, queue)?;
                let cv = self.clone_intra(val, map, depth + 1, queue)?;
                self.set_hash_elem(dst, ck, cv)?;
            }
            return Ok(());
        }
        let len = self.length(src)?;
        for i in 0..len {
            let e = self.get_array_elem(src, i)?;
            let c = self.clone_intra(e, map, depth + 1, queue)?;
            self.set_array_elem(dst, i, c)?;
        }
        Ok(())
    }

    /// Clone a value graph from another heap into this one.
    pub fn clone_from(&mut self, src: &Heap, v: Value) -> Result<Value, FixError> {
        let mut map = FxHashMap::default();
        let mut queue: Vec<(Value, Value)> = Vec::new();
        let mut result = self.clone_cross(src, v, &mut map, 0, &mut queue);
        if result.is_ok() {
            while let Some((s, d)) = queue.pop() {
                if let Err(e) = self.clone_cross_children(src, s, d, &mut map, 0, &mut queue) {
                    result = Err(e);
                    break;
                }
            }
        }
        let pinned: Vec<Value> = map.values().copied().collect();
        for p in pinned {
            self.unref(p);
        }
        result
    }

    fn clone_cross(
        &mut self,
        src: &Heap,
        v: Value,
        map: &mut FxHashMap<usize, Value>,
        depth: usize,
        queue: &mut Vec<(Value, Value)>,
    ) -> Result<Value, FixError> {
        if v.is_int() || v.is_float() {
            return Ok(v);
        }
        if let Some(id) = v.func_id() {
            let func = src.function(id).ok_or(FixError::FuncRefLoad)?;
            let script_name = src.script(func.script).name.clone();
            let func_name = func.name.clone();
            return self.resolve_func_ref(&script_name, &func_name);
        }
        let idx = src.index_of(v)?;
        if let Some(&d) = map.get(&idx) {
            return Ok(d);
        }
        let out = match src.obj(idx)? {
            Object::Array(a) if a.is_shared() => {
                let buf = a.shared.clone().ok_or(FixError::InvalidShared)?;
                self.shared_view(&buf)?
            }
            Object::Array(a) if a.flags.contains(ObjFlags::CONST) => {
                let content = src.get_string(v)?;
                self.create_const_string(&content)?
            }
            Object::Array(a) if a.is_string() => {
                let content = src.get_string(v)?;
                self.create_string(&content)?
            }
            Object::Array(a) => {
                let out = self.create_array(a.len)?;
                self.add_ref(out);
                map.insert(idx, out);
                if depth >= CLONE_RECURSION_CUTOFF {
                    queue.push((v, out));
                } else {
                    self.clone_cross_children(src, v, out, map, depth, queue)?;
                }
                return Ok(out);
            }
            Object::Hash(_) => {
                let out = self.create_hash()?;
                self.add_ref(out);
                map.insert(idx, out);
                if depth >= CLONE_RECURSION_CUTOFF {
                    queue.push((v, out));
                } else {
                    self.clone_cross_children(src, v, out, map, depth, queue)?;
                }
                return Ok(out);
            }
            Object::Handle(h) => {
                let copied = h.data.copy().ok_or(FixError::UnserializableRef)?;
                self.create_handle(copied)?
            }
        };
        self.add_ref(out);
        map.insert(idx, out);
        Ok(out)
    }

    fn clone_cross_children(
        &mut self,
        src: &Heap,
        s: Value,
        d: Value,
        map: &mut FxHashMap<usize, Value>,
        depth: usize,
        queue: &mut Vec<(Value, Value)>,
    ) -> Result<(), FixError> {
        if src.is_hash(s) {
            for (k, val) in src.hash_entries(s)? {
                let ck = self.clone_cross(src, k, map, depth + 1, queue)?;
                let cv = self.clone_cross(src, val, map, depth + 1, queue)?;
                self.set_hash_elem(d, ck, cv)?;
            }
            return Ok(());
        }
        let len = src.length(s)?;
        for i in 0..len {
            let e = src.get_array_elem(s, i)?;
            let c = self.clone_cross(src, e, map, depth + 1, queue)?;
            self.set_array_elem(d, i, c)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deep_clone_disjoint_identity() {
        let mut heap = Heap::new();
        let inner = heap.create_array(1).unwrap();
        heap.set_array_elem(inner, 0, Value::int(5)).unwrap();
        let outer = heap.create_array(1).unwrap();
        heap.set_array_elem(outer, 0, inner).unwrap();
        let copy = heap.clone_value(outer, true).unwrap();
        assert_ne!(copy, outer);
        assert!(heap.values_equal(copy, outer).unwrap());
        let copy_inner = heap.get_array_elem(copy, 0).unwrap();
        assert_ne!(copy_inner, inner);
    }

    #[test]
    fn test_shallow_clone_shares_children() {
        let mut heap = Heap::new();
        let inner = heap.create_array(0).unwrap();
        let outer = heap.create_array(1).unwrap();
        heap.set_array_elem(outer, 0, inner).unwrap();
        let copy = heap.clone_value(outer, false).unwrap();
        assert_ne!(copy, outer);
        assert_eq!(heap.get_array_elem(copy, 0).unwrap(), inner);
    }

    #[test]
    fn test_const_string_identity_shared() {
        let mut heap = Heap::new();
        let s = heap.create_const_string("kept").unwrap();
        let a = heap.create_array(1).unwrap();
        heap.set_array_elem(a, 0, s).unwrap();
        let copy = heap.clone_value(a, true).unwrap();
        assert_eq!(heap.get_array_elem(copy, 0).unwrap(), s);
    }

    #[test]
    fn test_cyclic_clone() {
        let mut heap = Heap::new();
        let a = heap.create_array(1).unwrap();
        heap.set_array_elem(a, 0, a).unwrap();
        let copy = heap.clone_value(a, true).unwrap();
        assert_eq!(heap.get_array_elem(copy, 0).unwrap(), copy);
        assert_ne!(copy, a);
    }

    #[test]
    fn test_deep_graph_clones_iteratively() {
        let mut heap = Heap::new();
        let head = heap.create_array(1).unwrap();
        let mut cur = head;
        for _ in 0..500 {
            let next = heap.create_array(1).unwrap();
            heap.set_array_elem(cur, 0, next).unwrap();
            cur = next;
        }
        heap.set_array_elem(cur, 0, Value::int(1)).unwrap();
        let copy = heap.clone_value(head, true).unwrap();
        let mut c = copy;
        let mut depth = 0;
        loop {
            let next = heap.get_array_elem(c, 0).unwrap();
            if !next.is_object() {
                break;
            }
            c = next;
            depth += 1;
        }
        assert_eq!(depth, 500);
    }

    #[test]
    fn test_cross_heap_clone() {
        let mut a = Heap::new();
        let mut b = Heap::new();
        let arr = a.create_array(2).unwrap();
        let s = a.create_string("text").unwrap();
        a.set_array_elem(arr, 0, s).unwrap();
        a.set_array_elem(arr, 1, Value::int(3)).unwrap();
        let copy = b.clone_from(&a, arr).unwrap();
        assert_eq!(b.length(copy).unwrap(), 2);
        let cs = b.get_array_elem(copy, 0).unwrap();
        assert_eq!(b.get_string(cs).unwrap(), "text");
    }

    #[test]
    fn test_cross_heap_shared_buffer_is_shared() {
        let mut a = Heap::new();
        let mut b = Heap::new();
        let s = a.create_shared_array(1, 4, 4).unwrap();
        a.set_array_elem(s, 0, Value::int(11)).unwrap();
        let copy = b.clone_from(&a, s).unwrap();
        assert_eq!(b.get_array_elem(copy, 0).unwrap(), Value::int(11));
        b.set_array_elem(copy, 1, Value::int(22)).unwrap();
        assert_eq!(a.get_array_elem(s, 1).unwrap(), Value::int(22));
    }
}
