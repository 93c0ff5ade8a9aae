//! Heap Object Records
//!
//! The heap is a single indexed object table. Every object is one of three
//! records: an array (variable-width integer storage, possibly a string or a
//! shared-buffer view), a hash, or an opaque handle. Each array and hash
//! slot carries a slot-is-reference bit in a packed `u32` bitset so the
//! collector never mistakes an integer for a pointer.

use crate::handle::HandleOps;
use bitflags::bitflags;
use fixscript_core::{SharedBufferRef, Value};

bitflags! {
    /// Per-object flag word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ObjFlags: u16 {
        /// The array holds string content (codepoints).
        const STRING = 1 << 0;
        /// Interned immutable string.
        const CONST = 1 << 1;
        /// Never collected.
        const STATIC = 1 << 2;
        /// View of a shared backing buffer.
        const SHARED = 1 << 3;
        /// At least one weak reference targets this object.
        const HAS_WEAK_REFS = 1 << 4;
        /// Advisory user-critical marker.
        const PROTECTED = 1 << 5;
    }
}

/// Variable-width element storage. Widens in place when a value wider than
/// the current element width is stored.
#[derive(Debug, Clone, PartialEq)]
pub enum Store {
    Bytes(Vec<u8>),
    Shorts(Vec<u16>),
    Ints(Vec<i32>),
}

impl Store {
    pub fn elem_size(&self) -> usize {
        match self {
            Store::Bytes(_) => 1,
            Store::Shorts(_) => 2,
            Store::Ints(_) => 4,
        }
    }

    pub fn capacity(&self) -> usize {
        match self {
            Store::Bytes(v) => v.len(),
            Store::Shorts(v) => v.len(),
            Store::Ints(v) => v.len(),
        }
    }

    #[inline]
    pub fn get(&self, idx: usize) -> i32 {
        match self {
            Store::Bytes(v) => v[idx] as i32,
            Store::Shorts(v) => v[idx] as i32,
            Store::Ints(v) => v[idx],
        }
    }

    /// Store a payload that is known to fit the current width.
    #[inline]
    pub fn set(&mut self, idx: usize, value: i32) {
        match self {
            Store::Bytes(v) => v[idx] = value as u8,
            Store::Shorts(v) => v[idx] = value as u16,
            Store::Ints(v) => v[idx] = value,
        }
    }

    /// Whether `value` can be stored without widening.
    #[inline]
    pub fn fits(&self, value: i32) -> bool {
        match self {
            Store::Bytes(_) => (0..=0xFF).contains(&value),
            Store::Shorts(_) => (0..=0xFFFF).contains(&value),
            Store::Ints(_) => true,
        }
    }
}

/// Packed one-bit-per-slot bitset helpers.
#[inline]
pub fn bit_get(bits: &[u32], idx: usize) -> bool {
    bits[idx >> 5] & (1 << (idx & 31)) != 0
}

#[inline]
pub fn bit_set(bits: &mut [u32], idx: usize, value: bool) {
    if value {
        bits[idx >> 5] |= 1 << (idx & 31);
    } else {
        bits[idx >> 5] &= !(1 << (idx & 31));
    }
}

/// Number of u32 words needed for `n` bits.
#[inline]
pub fn bit_words(n: usize) -> usize {
    n.div_ceil(32)
}

/// Array object: element storage, slot-is-reference bits, and an optional
/// shared-buffer view. Shared views keep their elements in the shared
/// header; `store` stays empty for them.
#[derive(Debug)]
pub struct ArrayObj {
    pub store: Store,
    pub len: usize,
    pub ref_bits: Vec<u32>,
    pub flags: ObjFlags,
    pub shared: Option<SharedBufferRef>,
}

impl ArrayObj {
    pub fn new(len: usize) -> ArrayObj {
        ArrayObj {
            store: Store::Bytes(vec![0; len]),
            len,
            ref_bits: vec![0; bit_words(len)],
            flags: ObjFlags::empty(),
            shared: None,
        }
    }

    pub fn shared_view(buf: SharedBufferRef) -> ArrayObj {
        let len = buf.len();
        ArrayObj {
            store: Store::Bytes(Vec::new()),
            len,
            ref_bits: Vec::new(),
            flags: ObjFlags::SHARED,
            shared: Some(buf),
        }
    }

    #[inline]
    pub fn is_string(&self) -> bool {
        self.flags.contains(ObjFlags::STRING)
    }

    #[inline]
    pub fn is_const(&self) -> bool {
        self.flags.contains(ObjFlags::CONST)
    }

    #[inline]
    pub fn is_shared(&self) -> bool {
        self.shared.is_some()
    }

    /// Read the element at `idx` as a value, consulting the reference bits.
    #[inline]
    pub fn get(&self, idx: usize) -> Value {
        if let Some(buf) = &self.shared {
            return Value {
                data: buf.read(idx),
                is_ref: false,
            };
        }
        Value {
            data: self.store.get(idx),
            is_ref: bit_get(&self.ref_bits, idx),
        }
    }

    /// Widen the storage to the next width that fits `value`, preserving
    /// all stored payloads bit-exactly.
    pub fn upgrade_for(&mut self, value: i32) {
        while !self.store.fits(value) {
            self.store = match std::mem::replace(&mut self.store, Store::Ints(Vec::new())) {
                Store::Bytes(v) => Store::Shorts(v.iter().map(|&b| b as u16).collect()),
                Store::Shorts(v) => Store::Ints(v.iter().map(|&s| s as i32).collect()),
                ints => ints,
            };
        }
    }

    /// Approximate heap footprint in bytes, used for collection scheduling.
    pub fn byte_size(&self) -> usize {
        if self.shared.is_some() {
            return 16;
        }
        self.store.capacity() * self.store.elem_size() + self.ref_bits.len() * 4 + 32
    }
}

/// Open-addressed hash body. Keys and values interleave in `data` (an entry
/// occupies two i32 slots), probing steps over entries. Removal clears the
/// entry's has-data bit but leaves the key, preserving probe chains. The
/// `order` list tracks insertion order and may carry stale entries until an
/// iteration re-materialises it.
#[derive(Debug, Default)]
pub struct HashObj {
    pub data: Vec<i32>,
    pub ref_bits: Vec<u32>,
    pub has_data: Vec<u32>,
    pub key_present: Vec<u32>,
    pub order: Vec<u32>,
    pub order_stale: bool,
    pub len: usize,
    pub occupied: usize,
    pub flags: ObjFlags,
}

impl HashObj {
    pub fn new() -> HashObj {
        HashObj::with_capacity(4)
    }

    /// Capacity is the entry count and must be a power of two.
    pub fn with_capacity(entries: usize) -> HashObj {
        debug_assert!(entries.is_power_of_two());
        HashObj {
            data: vec![0; entries * 2],
            ref_bits: vec![0; bit_words(entries * 2)],
            has_data: vec![0; bit_words(entries)],
            key_present: vec![0; bit_words(entries)],
            order: Vec::new(),
            order_stale: false,
            len: 0,
            occupied: 0,
            flags: ObjFlags::empty(),
        }
    }

    #[inline]
    pub fn entry_capacity(&self) -> usize {
        self.data.len() / 2
    }

    #[inline]
    pub fn key_at(&self, entry: usize) -> Value {
        Value {
            data: self.data[entry * 2],
            is_ref: bit_get(&self.ref_bits, entry * 2),
        }
    }

    #[inline]
    pub fn value_at(&self, entry: usize) -> Value {
        Value {
            data: self.data[entry * 2 + 1],
            is_ref: bit_get(&self.ref_bits, entry * 2 + 1),
        }
    }

    #[inline]
    pub fn set_key_at(&mut self, entry: usize, key: Value) {
        self.data[entry * 2] = key.data;
        bit_set(&mut self.ref_bits, entry * 2, key.is_ref);
    }

    #[inline]
    pub fn set_value_at(&mut self, entry: usize, value: Value) {
        self.data[entry * 2 + 1] = value.data;
        bit_set(&mut self.ref_bits, entry * 2 + 1, value.is_ref);
    }

    pub fn byte_size(&self) -> usize {
        self.data.len() * 4
            + (self.ref_bits.len() + self.has_data.len() + self.key_present.len()) * 4
            + self.order.len() * 4
            + 48
    }
}

/// Opaque handle object: host-managed data behind a trait vtable.
pub struct HandleObj {
    pub data: Box<dyn HandleOps>,
    pub flags: ObjFlags,
}

impl std::fmt::Debug for HandleObj {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleObj")
            .field("type_tag", &self.data.type_tag())
            .field("flags", &self.flags)
            .finish()
    }
}

/// A slot in the object table.
#[derive(Debug)]
pub enum Object {
    Array(ArrayObj),
    Hash(HashObj),
    Handle(HandleObj),
}

impl Object {
    pub fn flags(&self) -> ObjFlags {
        match self {
            Object::Array(a) => a.flags,
            Object::Hash(h) => h.flags,
            Object::Handle(h) => h.flags,
        }
    }

    pub fn flags_mut(&mut self) -> &mut ObjFlags {
        match self {
            Object::Array(a) => &mut a.flags,
            Object::Hash(h) => &mut h.flags,
            Object::Handle(h) => &mut h.flags,
        }
    }

    pub fn byte_size(&self) -> usize {
        match self {
            Object::Array(a) => a.byte_size(),
            Object::Hash(h) => h.byte_size(),
            Object::Handle(_) => 64,
        }
    }
}
