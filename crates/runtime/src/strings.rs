//! Strings
//!
//! A string is any array with the string flag set. UTF-8 is only the wire
//! form; the stored form is codepoints in the smallest sufficient element
//! width. Const strings are interned per heap in a probed set keyed by
//! content hash and are immutable.

use crate::error::FixError;
use crate::heap::Heap;
use crate::object::{ArrayObj, Object, ObjFlags, Store, bit_words};
use fixscript_core::Value;

/// Element-wise content hash (`h = h*31 + x`) over stored codepoints.
pub(crate) fn content_hash(a: &ArrayObj) -> u64 {
    let mut h = 0u64;
    for i in 0..a.len {
        h = h.wrapping_mul(31).wrapping_add(a.store.get(i) as u32 as u64);
    }
    h
}

fn content_hash_str(s: &str) -> u64 {
    let mut h = 0u64;
    for c in s.chars() {
        h = h.wrapping_mul(31).wrapping_add(c as u64);
    }
    h
}

fn string_object(s: &str) -> ArrayObj {
    let cps: Vec<u32> = s.chars().map(|c| c as u32).collect();
    let max = cps.iter().copied().max().unwrap_or(0);
    let store = if max <= 0xFF {
        Store::Bytes(cps.iter().map(|&c| c as u8).collect())
    } else if max <= 0xFFFF {
        Store::Shorts(cps.iter().map(|&c| c as u16).collect())
    } else {
        Store::Ints(cps.iter().map(|&c| c as i32).collect())
    };
    let len = cps.len();
    ArrayObj {
        store,
        len,
        ref_bits: vec![0; bit_words(len)],
        flags: ObjFlags::STRING,
        shared: None,
    }
}

impl Heap {
    /// Create a mutable string from UTF-8 text.
    pub fn create_string(&mut self, s: &str) -> Result<Value, FixError> {
        let idx = self.alloc_object(Object::Array(string_object(s)))?;
        Ok(Value::object(idx))
    }

    /// Create or look up the interned const string for `s`. Equal contents
    /// dedup to the same object identity.
    pub fn create_const_string(&mut self, s: &str) -> Result<Value, FixError> {
        let hash = content_hash_str(s);
        if let Some(list) = self.const_strings.get(&hash) {
            for &idx in list {
                if let Ok(Object::Array(a)) = self.obj(idx)
                    && a.flags.contains(ObjFlags::CONST)
                    && string_content_eq(a, s)
                {
                    return Ok(Value::object(idx));
                }
            }
        }
        let mut obj = string_object(s);
        obj.flags |= ObjFlags::CONST;
        let idx = self.alloc_object(Object::Array(obj))?;
        self.const_strings.entry(hash).or_default().push(idx);
        Ok(Value::object(idx))
    }

    /// Decode a string object to UTF-8 text. Invalid codepoints (including
    /// surrogates) decode as U+FFFD.
    pub fn get_string(&self, v: Value) -> Result<String, FixError> {
        if v.is_null() {
            return Err(FixError::InvalidNullString);
        }
        let a = self.array_of(v)?;
        if !a.is_string() {
            return Err(FixError::InvalidAccess);
        }
        let mut out = String::with_capacity(a.len);
        for i in 0..a.len {
            let cp = a.get(i).data as u32;
            out.push(char::from_u32(cp).unwrap_or('\u{FFFD}'));
        }
        Ok(out)
    }

    pub fn is_const_string(&self, v: Value) -> bool {
        self.index_of(v)
            .and_then(|i| self.obj(i))
            .is_ok_and(|o| matches!(o, Object::Array(a) if a.flags.contains(ObjFlags::CONST)))
    }

    /// Printable form of any value, used by string building and error
    /// rendering. Recursion is depth-bounded; deeper structure renders as
    /// an ellipsis.
    pub fn to_display_string(&self, v: Value) -> String {
        self.display_depth(v, 0)
    }

    fn display_depth(&self, v: Value, depth: usize) -> String {
        if depth > 20 {
            return "...".to_string();
        }
        if v.is_int() {
            return v.data.to_string();
        }
        if v.is_float() {
            let f = v.as_float();
            let s = f.to_string();
            if s.contains('.') || s.contains('e') || s.contains("inf") || s.contains("NaN") {
                return s;
            }
            return format!("{}.0", s);
        }
        if let Some(id) = v.func_id() {
            if let Some(func) = self.function(id) {
                return format!("<{}>", func.name);
            }
            return format!("<funcref#{}>", id);
        }
        let Ok(obj) = self.obj(v.data as usize) else {
            return "<invalid>".to_string();
        };
        match obj {
            Object::Array(a) if a.is_string() => self.get_string(v).unwrap_or_default(),
            Object::Array(a) => {
                let elems: Vec<String> = (0..a.len)
                    .map(|i| self.display_depth(a.get(i), depth + 1))
                    .collect();
                format!("[{}]", elems.join(", "))
            }
            Object::Hash(_) => {
                let mut parts = Vec::new();
                if let Ok(entries) = self.hash_entries(v) {
                    for (k, val) in entries {
                        parts.push(format!(
                            "{}: {}",
                            self.display_depth(k, depth + 1),
                            self.display_depth(val, depth + 1)
                        ));
                    }
                }
                format!("{{{}}}", parts.join(", "))
            }
            Object::Handle(h) => h
                .data
                .to_display()
                .unwrap_or_else(|| format!("<handle#{}>", h.data.type_tag())),
        }
    }
}

fn string_content_eq(a: &ArrayObj, s: &str) -> bool {
    let mut chars = s.chars();
    for i in 0..a.len {
        match chars.next() {
            Some(c) if c as u32 == a.store.get(i) as u32 => {}
            _ => return false,
        }
    }
    chars.next().is_none()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_roundtrip() {
        let mut heap = Heap::new();
        let v = heap.create_string("hello").unwrap();
        assert!(heap.is_string(v));
        assert_eq!(heap.get_string(v).unwrap(), "hello");
    }

    #[test]
    fn test_wide_codepoints_choose_width() {
        let mut heap = Heap::new();
        let v = heap.create_string("caf\u{E9}").unwrap();
        assert_eq!(heap.get_string(v).unwrap(), "caf\u{E9}");
        let v = heap.create_string("\u{1F600}").unwrap();
        assert_eq!(heap.get_string(v).unwrap(), "\u{1F600}");
        assert_eq!(heap.length(v).unwrap(), 1);
    }

    #[test]
    fn test_const_string_interning() {
        let mut heap = Heap::new();
        let a = heap.create_const_string("shared text").unwrap();
        let b = heap.create_const_string("shared text").unwrap();
        assert_eq!(a, b);
        let c = heap.create_const_string("other").unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_const_string_is_immutable() {
        let mut heap = Heap::new();
        let v = heap.create_const_string("abc").unwrap();
        assert_eq!(
            heap.set_array_elem(v, 0, Value::int(0x7A)),
            Err(FixError::ConstWrite)
        );
    }

    #[test]
    fn test_null_string_error() {
        let heap = Heap::new();
        assert_eq!(heap.get_string(Value::ZERO), Err(FixError::InvalidNullString));
    }

    #[test]
    fn test_display_forms() {
        let mut heap = Heap::new();
        assert_eq!(heap.to_display_string(Value::int(14)), "14");
        assert_eq!(heap.to_display_string(Value::float(1.5)), "1.5");
        assert_eq!(heap.to_display_string(Value::float(2.0)), "2.0");
        let s = heap.create_string("x").unwrap();
        assert_eq!(heap.to_display_string(s), "x");
        let a = heap.create_array(2).unwrap();
        heap.set_array_elem(a, 0, Value::int(1)).unwrap();
        heap.set_array_elem(a, 1, s).unwrap();
        assert_eq!(heap.to_display_string(a), "[1, x]");
    }

    #[test]
    fn test_collected_const_string_reinterned() {
        let mut heap = Heap::new();
        let a = heap.create_const_string("transient").unwrap();
        let idx = a.object_index().unwrap();
        heap.collect();
        heap.collect();
        assert!(!heap.is_valid(a));
        // A fresh intern gets a new object rather than the stale index.
        let b = heap.create_const_string("transient").unwrap();
        assert!(heap.is_valid(b));
        let _ = idx;
    }
}
