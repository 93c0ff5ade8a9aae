//! Typed Value Stack
//!
//! Two parallel arrays: `data: Vec<i32>` and `flags: Vec<u8>`. Opcodes poke
//! at the flag byte independently of the payload (width checks in array
//! copies, reference scans in the collector), which is why the layout is two
//! arrays rather than one array of pairs.
//!
//! The stack doubles its capacity on demand up to a configurable hard cap.
//! Call-site return addresses are stored in `data` with the high bit set and
//! the flag byte clear, so a reference scan never mistakes them for object
//! indices.

use crate::value::Value;

/// Flag bit: the slot holds a reference payload.
pub const FLAG_REF: u8 = 1;

/// High bit marking an encoded return PC in a data slot.
pub const PC_MARK: i32 = i32::MIN;

/// Default initial capacity in slots.
pub const DEFAULT_STACK_CAPACITY: usize = 1024;

/// Default hard cap in slots.
pub const DEFAULT_MAX_STACK: usize = 256 * 1024;

/// Growable stack of tagged values with a hard cap.
pub struct ValueStack {
    data: Vec<i32>,
    flags: Vec<u8>,
    max_size: usize,
}

impl ValueStack {
    pub fn new(initial: usize, max_size: usize) -> Self {
        ValueStack {
            data: Vec::with_capacity(initial),
            flags: Vec::with_capacity(initial),
            max_size,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
    }

    /// Ensure room for `extra` more slots. Returns false when the hard cap
    /// would be exceeded.
    pub fn reserve(&mut self, extra: usize) -> bool {
        let needed = self.data.len().saturating_add(extra);
        if needed > self.max_size {
            return false;
        }
        if needed > self.data.capacity() {
            let new_cap = (self.data.capacity().max(1) * 2)
                .max(needed)
                .min(self.max_size);
            self.data.reserve(new_cap - self.data.len());
            self.flags.reserve(new_cap - self.flags.len());
        }
        true
    }

    /// Push a value. Returns false on stack overflow.
    #[inline]
    pub fn push(&mut self, v: Value) -> bool {
        if self.data.len() >= self.max_size {
            return false;
        }
        self.data.push(v.data);
        self.flags.push(if v.is_ref { FLAG_REF } else { 0 });
        true
    }

    /// Push an encoded return PC.
    #[inline]
    pub fn push_pc(&mut self, pc: u32) -> bool {
        if self.data.len() >= self.max_size {
            return false;
        }
        self.data.push(pc as i32 | PC_MARK);
        self.flags.push(0);
        true
    }

    #[inline]
    pub fn pop(&mut self) -> Option<Value> {
        let data = self.data.pop()?;
        let flags = self.flags.pop()?;
        Some(Value {
            data,
            is_ref: flags & FLAG_REF != 0,
        })
    }

    #[inline]
    pub fn get(&self, idx: usize) -> Value {
        Value {
            data: self.data[idx],
            is_ref: self.flags[idx] & FLAG_REF != 0,
        }
    }

    #[inline]
    pub fn set(&mut self, idx: usize, v: Value) {
        self.data[idx] = v.data;
        self.flags[idx] = if v.is_ref { FLAG_REF } else { 0 };
    }

    /// Store an encoded return PC into an existing slot.
    #[inline]
    pub fn set_pc(&mut self, idx: usize, pc: u32) {
        self.data[idx] = pc as i32 | PC_MARK;
        self.flags[idx] = 0;
    }

    /// Read back an encoded return PC, if the slot holds one.
    #[inline]
    pub fn get_pc(&self, idx: usize) -> Option<u32> {
        let d = self.data[idx];
        if d & PC_MARK != 0 && self.flags[idx] & FLAG_REF == 0 {
            Some((d & !PC_MARK) as u32)
        } else {
            None
        }
    }

    #[inline]
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
        self.flags.truncate(len);
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.flags.clear();
    }

    /// Grow to `len` slots, filling new slots with integer zero.
    pub fn grow_to(&mut self, len: usize) -> bool {
        if len > self.max_size {
            return false;
        }
        while self.data.len() < len {
            self.data.push(0);
            self.flags.push(0);
        }
        true
    }

    #[inline]
    pub fn data(&self) -> &[i32] {
        &self.data
    }

    #[inline]
    pub fn flags(&self) -> &[u8] {
        &self.flags
    }
}
