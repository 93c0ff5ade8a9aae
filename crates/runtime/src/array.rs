//! Array Operations
//!
//! Arrays store elements in the smallest sufficient width and widen in place
//! when a wider value is stored. Const strings and shared views reject
//! mutation (`const_write` / `invalid_shared`). Capacity is capped at 2^30
//! elements.

use crate::error::FixError;
use crate::heap::Heap;
use crate::object::{ArrayObj, Object, Store, bit_set, bit_words};
use fixscript_core::{SharedBufferRef, Value};

/// Hard cap on array length.
const MAX_ARRAY_LEN: usize = 1 << 30;

/// Access mode for [`Heap::lock_array`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAccess {
    ReadOnly,
    ReadWrite,
}

/// A locked, contiguous byte view of an array range. Pair every lock with
/// [`Heap::unlock_array`] so modifications are written back.
pub struct ArrayLock {
    pub data: Vec<u8>,
    off: usize,
    len: usize,
    elem_size: usize,
    access: LockAccess,
}

impl ArrayLock {
    #[inline]
    pub fn elem_size(&self) -> usize {
        self.elem_size
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Heap {
    pub fn create_array(&mut self, len: usize) -> Result<Value, FixError> {
        if len > MAX_ARRAY_LEN {
            return Err(FixError::OutOfMemory);
        }
        let idx = self.alloc_object(Object::Array(ArrayObj::new(len)))?;
        Ok(Value::object(idx))
    }

    /// Create a shared array backed by a fresh refcounted buffer.
    pub fn create_shared_array(
        &mut self,
        type_tag: i32,
        len: usize,
        elem_size: usize,
    ) -> Result<Value, FixError> {
        if len > MAX_ARRAY_LEN {
            return Err(FixError::OutOfMemory);
        }
        let buf = SharedBufferRef::new(type_tag, len, elem_size).ok_or(FixError::OutOfMemory)?;
        let idx = self.alloc_object(Object::Array(ArrayObj::shared_view(buf)))?;
        let key = match self.obj(idx)? {
            Object::Array(a) => a.shared.as_ref().map(|b| b.key()),
            _ => None,
        };
        if let Some(key) = key {
            self.shared_intern.insert(key, idx);
        }
        Ok(Value::object(idx))
    }

    /// Obtain this heap's view of a shared buffer. The per-heap intern map
    /// guarantees at most one view per buffer; a fresh view retains the
    /// buffer's script-visible count.
    pub fn shared_view(&mut self, buf: &SharedBufferRef) -> Result<Value, FixError> {
        if let Some(&idx) = self.shared_intern.get(&buf.key())
            && self.objects.get(idx).is_some_and(|o| o.is_some())
        {
            return Ok(Value::object(idx));
        }
        buf.retain();
        let idx = self.alloc_object(Object::Array(ArrayObj::shared_view(buf.clone())))?;
        self.shared_intern.insert(buf.key(), idx);
        Ok(Value::object(idx))
    }

    /// The shared buffer behind a shared-array view.
    pub fn get_shared_buffer(&self, v: Value) -> Result<SharedBufferRef, FixError> {
        let a = self.array_of(v)?;
        a.shared.clone().ok_or(FixError::InvalidShared)
    }

    /// Element count of an array or string; entry count of a hash.
    pub fn length(&self, v: Value) -> Result<usize, FixError> {
        match self.obj(self.index_of(v)?)? {
            Object::Array(a) => Ok(a.len),
            Object::Hash(h) => Ok(h.len),
            Object::Handle(_) => Err(FixError::InvalidAccess),
        }
    }

    /// Resize an array. New slots read as integer zero.
    pub fn set_array_length(&mut self, v: Value, len: usize) -> Result<(), FixError> {
        if len > MAX_ARRAY_LEN {
            return Err(FixError::OutOfMemory);
        }
        let a = self.array_of(v)?;
        if a.is_const() {
            return Err(FixError::ConstWrite);
        }
        if a.is_shared() {
            return Err(FixError::InvalidShared);
        }
        let old_size = a.byte_size();
        let a = self.array_of_mut(v)?;
        if len > a.store.capacity() {
            grow_store(a, len)?;
        }
        if len > a.len {
            // Zero-fill slots that may hold stale payloads from a previous
            // longer length.
            for i in a.len..len {
                a.store.set(i, 0);
                bit_set(&mut a.ref_bits, i, false);
            }
        }
        a.len = len;
        let new_size = a.byte_size();
        self.note_size_change(old_size, new_size);
        Ok(())
    }

    pub fn get_array_elem(&self, v: Value, idx: usize) -> Result<Value, FixError> {
        let a = self.array_of(v)?;
        if idx >= a.len {
            return Err(FixError::OutOfBounds);
        }
        Ok(a.get(idx))
    }

    pub fn set_array_elem(&mut self, v: Value, idx: usize, value: Value) -> Result<(), FixError> {
        let a = self.array_of(v)?;
        if idx >= a.len {
            return Err(FixError::OutOfBounds);
        }
        if a.is_const() {
            return Err(FixError::ConstWrite);
        }
        if let Some(buf) = &a.shared {
            if value.is_ref {
                return Err(FixError::InvalidShared);
            }
            let fits = match buf.elem_size() {
                1 => (0..=0xFF).contains(&value.data),
                2 => (0..=0xFFFF).contains(&value.data),
                _ => true,
            };
            if !fits {
                return Err(FixError::InvalidShared);
            }
            buf.write(idx, value.data);
            return Ok(());
        }
        let old_size = a.byte_size();
        let a = self.array_of_mut(v)?;
        a.upgrade_for(value.data);
        a.store.set(idx, value.data);
        bit_set(&mut a.ref_bits, idx, value.is_ref);
        let new_size = self.array_of(v)?.byte_size();
        self.note_size_change(old_size, new_size);
        Ok(())
    }

    pub fn append_array_elem(&mut self, v: Value, value: Value) -> Result<(), FixError> {
        let a = self.array_of(v)?;
        if a.is_const() {
            return Err(FixError::ConstWrite);
        }
        if a.is_shared() {
            return Err(FixError::InvalidShared);
        }
        let len = a.len;
        self.set_array_length(v, len.checked_add(1).ok_or(FixError::OutOfMemory)?)?;
        self.set_array_elem(v, len, value)
    }

    /// Remove the element at `idx`, shifting the tail down.
    pub fn remove_array_elem(&mut self, v: Value, idx: usize) -> Result<(), FixError> {
        let a = self.array_of(v)?;
        if idx >= a.len {
            return Err(FixError::OutOfBounds);
        }
        if a.is_const() {
            return Err(FixError::ConstWrite);
        }
        if a.is_shared() {
            return Err(FixError::InvalidShared);
        }
        let len = a.len;
        for i in idx..len - 1 {
            let next = self.get_array_elem(v, i + 1)?;
            self.set_array_elem(v, i, next)?;
        }
        self.set_array_length(v, len - 1)
    }

    pub fn get_array_range(
        &self,
        v: Value,
        off: usize,
        len: usize,
    ) -> Result<Vec<Value>, FixError> {
        let a = self.array_of(v)?;
        if off.checked_add(len).is_none_or(|end| end > a.len) {
            return Err(FixError::OutOfBounds);
        }
        Ok((off..off + len).map(|i| a.get(i)).collect())
    }

    pub fn set_array_range(
        &mut self,
        v: Value,
        off: usize,
        values: &[Value],
    ) -> Result<(), FixError> {
        let a = self.array_of(v)?;
        if off.checked_add(values.len()).is_none_or(|end| end > a.len) {
            return Err(FixError::OutOfBounds);
        }
        for (i, &val) in values.iter().enumerate() {
            self.set_array_elem(v, off + i, val)?;
        }
        Ok(())
    }

    /// Copy `count` elements between arrays. Overlap-safe; widens the
    /// destination as needed. Copying references into a shared destination
    /// fails with `invalid_shared`.
    pub fn copy_array(
        &mut self,
        dst: Value,
        dst_off: usize,
        src: Value,
        src_off: usize,
        count: usize,
    ) -> Result<(), FixError> {
        // Materialising the source range first makes same-array overlapping
        // copies behave like memmove.
        let values = self.get_array_range(src, src_off, count)?;
        self.set_array_range(dst, dst_off, &values)
    }

    pub fn array_fill(&mut self, v: Value, value: Value) -> Result<(), FixError> {
        let len = self.length(v)?;
        for i in 0..len {
            self.set_array_elem(v, i, value)?;
        }
        Ok(())
    }

    /// Materialise a contiguous byte buffer of `len` elements at the
    /// requested element size. Elements that do not fit the requested width
    /// fail with `invalid_byte_array` / `invalid_short_array`.
    pub fn lock_array(
        &mut self,
        v: Value,
        off: usize,
        len: usize,
        elem_size: usize,
        access: LockAccess,
    ) -> Result<ArrayLock, FixError> {
        assert!(matches!(elem_size, 1 | 2 | 4));
        let a = self.array_of(v)?;
        if off.checked_add(len).is_none_or(|end| end > a.len) {
            return Err(FixError::OutOfBounds);
        }
        if access == LockAccess::ReadWrite && a.is_const() {
            return Err(FixError::ConstWrite);
        }
        let mut data = Vec::with_capacity(len * elem_size);
        for i in off..off + len {
            let e = a.get(i).data;
            match elem_size {
                1 => {
                    if !(0..=0xFF).contains(&e) {
                        return Err(FixError::InvalidByteArray);
                    }
                    data.push(e as u8);
                }
                2 => {
                    if !(0..=0xFFFF).contains(&e) {
                        return Err(FixError::InvalidShortArray);
                    }
                    data.extend_from_slice(&(e as u16).to_le_bytes());
                }
                _ => data.extend_from_slice(&e.to_le_bytes()),
            }
        }
        Ok(ArrayLock {
            data,
            off,
            len,
            elem_size,
            access,
        })
    }

    /// Write a lock back (unless it was read-only) and release it.
    pub fn unlock_array(&mut self, v: Value, lock: ArrayLock) -> Result<(), FixError> {
        if lock.access == LockAccess::ReadOnly {
            return Ok(());
        }
        for i in 0..lock.len {
            let value = match lock.elem_size {
                1 => lock.data[i] as i32,
                2 => u16::from_le_bytes([lock.data[i * 2], lock.data[i * 2 + 1]]) as i32,
                _ => i32::from_le_bytes([
                    lock.data[i * 4],
                    lock.data[i * 4 + 1],
                    lock.data[i * 4 + 2],
                    lock.data[i * 4 + 3],
                ]),
            };
            self.set_array_elem(v, lock.off + i, Value::int(value))?;
        }
        Ok(())
    }
}

fn grow_store(a: &mut ArrayObj, needed: usize) -> Result<(), FixError> {
    if needed > MAX_ARRAY_LEN {
        return Err(FixError::OutOfMemory);
    }
    let new_cap = a.store.capacity().max(4).checked_mul(2).map_or(needed, |c| c.max(needed));
    let new_cap = new_cap.min(MAX_ARRAY_LEN).max(needed);
    match &mut a.store {
        Store::Bytes(v) => v.resize(new_cap, 0),
        Store::Shorts(v) => v.resize(new_cap, 0),
        Store::Ints(v) => v.resize(new_cap, 0),
    }
    a.ref_bits.resize(bit_words(new_cap), 0);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_slots_read_zero() {
        let mut heap = Heap::new();
        let a = heap.create_array(1).unwrap();
        heap.set_array_elem(a, 0, Value::int(7)).unwrap();
        heap.set_array_length(a, 4).unwrap();
        for i in 1..4 {
            let v = heap.get_array_elem(a, i).unwrap();
            assert_eq!(v, Value::ZERO);
            assert!(!v.is_ref);
        }
    }

    #[test]
    fn test_shrink_then_grow_rezeroes() {
        let mut heap = Heap::new();
        let a = heap.create_array(3).unwrap();
        heap.set_array_elem(a, 2, Value::int(99)).unwrap();
        heap.set_array_length(a, 1).unwrap();
        heap.set_array_length(a, 3).unwrap();
        assert_eq!(heap.get_array_elem(a, 2).unwrap(), Value::ZERO);
    }

    #[test]
    fn test_upgrade_preserves_values() {
        let mut heap = Heap::new();
        let a = heap.create_array(3).unwrap();
        heap.set_array_elem(a, 0, Value::int(0x12)).unwrap();
        heap.set_array_elem(a, 1, Value::int(0xFF)).unwrap();
        heap.set_array_elem(a, 2, Value::int(0x100)).unwrap();
        assert_eq!(heap.get_array_elem(a, 0).unwrap(), Value::int(0x12));
        assert_eq!(heap.get_array_elem(a, 1).unwrap(), Value::int(0xFF));
        assert_eq!(heap.get_array_elem(a, 2).unwrap(), Value::int(0x100));
        heap.set_array_elem(a, 0, Value::int(-1)).unwrap();
        assert_eq!(heap.get_array_elem(a, 1).unwrap(), Value::int(0xFF));
        assert_eq!(heap.get_array_elem(a, 2).unwrap(), Value::int(0x100));
    }

    #[test]
    fn test_out_of_bounds() {
        let mut heap = Heap::new();
        let a = heap.create_array(2).unwrap();
        assert_eq!(heap.get_array_elem(a, 2), Err(FixError::OutOfBounds));
        assert_eq!(
            heap.set_array_elem(a, 2, Value::int(1)),
            Err(FixError::OutOfBounds)
        );
    }

    #[test]
    fn test_append_and_remove() {
        let mut heap = Heap::new();
        let a = heap.create_array(0).unwrap();
        for i in 0..5 {
            heap.append_array_elem(a, Value::int(i)).unwrap();
        }
        assert_eq!(heap.length(a).unwrap(), 5);
        heap.remove_array_elem(a, 1).unwrap();
        assert_eq!(heap.length(a).unwrap(), 4);
        assert_eq!(heap.get_array_elem(a, 1).unwrap(), Value::int(2));
        assert_eq!(heap.get_array_elem(a, 3).unwrap(), Value::int(4));
    }

    #[test]
    fn test_overlapping_copy_is_memmove() {
        let mut heap = Heap::new();
        let a = heap.create_array(5).unwrap();
        for i in 0..5 {
            heap.set_array_elem(a, i, Value::int(i as i32)).unwrap();
        }
        heap.copy_array(a, 1, a, 0, 4).unwrap();
        let got: Vec<i32> = (0..5)
            .map(|i| heap.get_array_elem(a, i).unwrap().data)
            .collect();
        assert_eq!(got, vec![0, 0, 1, 2, 3]);
    }

    #[test]
    fn test_shared_array_rejects_references() {
        let mut heap = Heap::new();
        let s = heap.create_shared_array(1, 4, 4).unwrap();
        let a = heap.create_array(1).unwrap();
        assert_eq!(heap.set_array_elem(s, 0, a), Err(FixError::InvalidShared));
        heap.set_array_elem(s, 0, Value::int(42)).unwrap();
        assert_eq!(heap.get_array_elem(s, 0).unwrap(), Value::int(42));
    }

    #[test]
    fn test_shared_scalar_visible_through_second_view() {
        let mut heap_a = Heap::new();
        let mut heap_b = Heap::new();
        let s = heap_a.create_shared_array(1, 4, 4).unwrap();
        let buf = heap_a.get_shared_buffer(s).unwrap();
        let view = heap_b.shared_view(&buf).unwrap();
        heap_a.set_array_elem(s, 2, Value::int(7)).unwrap();
        assert_eq!(heap_b.get_array_elem(view, 2).unwrap(), Value::int(7));
        // One view per (heap, buffer)
        assert_eq!(heap_b.shared_view(&buf).unwrap(), view);
    }

    #[test]
    fn test_lock_validates_width() {
        let mut heap = Heap::new();
        let a = heap.create_array(2).unwrap();
        heap.set_array_elem(a, 0, Value::int(0x1FF)).unwrap();
        assert_eq!(
            heap.lock_array(a, 0, 2, 1, LockAccess::ReadOnly).err(),
            Some(FixError::InvalidByteArray)
        );
        let lock = heap.lock_array(a, 0, 2, 2, LockAccess::ReadOnly).unwrap();
        assert_eq!(lock.data, vec![0xFF, 0x01, 0, 0]);
    }

    #[test]
    fn test_lock_write_back() {
        let mut heap = Heap::new();
        let a = heap.create_array(3).unwrap();
        let mut lock = heap.lock_array(a, 0, 3, 1, LockAccess::ReadWrite).unwrap();
        lock.data[1] = 0x42;
        heap.unlock_array(a, lock).unwrap();
        assert_eq!(heap.get_array_elem(a, 1).unwrap(), Value::int(0x42));
    }
}
