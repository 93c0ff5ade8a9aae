//! Binary Serialization
//!
//! A compact tag-length-value format used for `serialize`/`unserialize` and
//! for cross-heap clone snapshots. The tag byte packs the type into the low
//! nibble and a length field into the high nibble; length values 13/14/15
//! escape to 1/2/4 trailing length bytes.
//!
//! Canonicality is enforced on unserialize: a value encoded in a wider form
//! than necessary is rejected with `bad_format`. Self-referential and cyclic
//! graphs are supported through back-references into the
//! order-of-first-appearance table.
//!
//! Function references encode as an opaque `(script_name, func_name)` pair
//! (a zero-type tag with aux nibble 1) resolvable back to a function at
//! unserialize time when a loader is available.

use crate::error::FixError;
use crate::handle::FuncRefHandle;
use crate::heap::Heap;
use crate::object::Object;
use fixscript_core::{Value, canonical_nan};
use rustc_hash::FxHashMap;

const T_ZERO: u8 = 0;
const T_BYTE: u8 = 1;
const T_SHORT: u8 = 2;
const T_INT: u8 = 3;
const T_FLOAT: u8 = 4;
const T_FLOAT_ZERO: u8 = 5;
const T_REF: u8 = 6;
const T_REF_SHORT: u8 = 7;
const T_ARRAY: u8 = 8;
const T_ARRAY_BYTE: u8 = 9;
const T_ARRAY_SHORT: u8 = 10;
const T_ARRAY_INT: u8 = 11;
const T_STRING_BYTE: u8 = 12;
const T_STRING_SHORT: u8 = 13;
const T_STRING_INT: u8 = 14;
const T_HASH: u8 = 15;

/// Aux nibble on a zero-type tag marking a function reference record.
const AUX_FUNC_REF: u8 = 1;

/// Serialization recursion bound (cycles are caught by the seen table, so
/// only pathological nesting depth trips this).
const SERIALIZE_RECURSION_CUTOFF: usize = 4096;

struct Serializer<'h> {
    heap: &'h Heap,
    out: Vec<u8>,
    seen: FxHashMap<usize, usize>,
}

impl<'h> Serializer<'h> {
    fn write_tag(&mut self, ty: u8, len: usize) {
        if len < 13 {
            self.out.push(ty | (len as u8) << 4);
        } else if len <= 0xFF {
            self.out.push(ty | 13 << 4);
            self.out.push(len as u8);
        } else if len <= 0xFFFF {
            self.out.push(ty | 14 << 4);
            self.out.extend_from_slice(&(len as u16).to_le_bytes());
        } else {
            self.out.push(ty | 15 << 4);
            self.out.extend_from_slice(&(len as u32).to_le_bytes());
        }
    }

    fn write_int(&mut self, v: i32) {
        if v == 0 {
            self.out.push(T_ZERO);
        } else if (-0x80..0x80).contains(&v) {
            self.out.push(T_BYTE);
            self.out.push(v as i8 as u8);
        } else if (-0x8000..0x8000).contains(&v) {
            self.out.push(T_SHORT);
            self.out.extend_from_slice(&(v as i16).to_le_bytes());
        } else {
            self.out.push(T_INT);
            self.out.extend_from_slice(&v.to_le_bytes());
        }
    }

    fn write_back_ref(&mut self, order: usize) {
        if order < 13 {
            self.out.push(T_REF_SHORT | (order as u8) << 4);
        } else {
            self.write_tag(T_REF, order);
        }
    }

    fn write_str(&mut self, s: &str) {
        self.write_tag(T_STRING_BYTE, s.len());
        self.out.extend_from_slice(s.as_bytes());
    }

    fn write_func_ref(&mut self, script_name: &str, func_name: &str) {
        self.out.push(T_ZERO | AUX_FUNC_REF << 4);
        self.write_str(script_name);
        self.write_str(func_name);
    }

    fn serialize_value(&mut self, v: Value, depth: usize) -> Result<(), FixError> {
        if depth > SERIALIZE_RECURSION_CUTOFF {
            return Err(FixError::RecursionLimit);
        }
        if v.is_int() {
            self.write_int(v.data);
            return Ok(());
        }
        if v.is_float() {
            if v.data == 0 {
                self.out.push(T_FLOAT_ZERO);
            } else {
                self.out.push(T_FLOAT);
                self.out
                    .extend_from_slice(&canonical_nan(v.data as u32).to_le_bytes());
            }
            return Ok(());
        }
        if let Some(id) = v.func_id() {
            let func = self
                .heap
                .function(id)
                .ok_or(FixError::UnserializableRef)?;
            let script_name = self.heap.script(func.script).name.clone();
            self.write_func_ref(&script_name, &func.name);
            return Ok(());
        }
        let idx = v.object_index().ok_or(FixError::UnserializableRef)?;
        if let Some(&order) = self.seen.get(&idx) {
            self.write_back_ref(order);
            return Ok(());
        }
        match self.heap.obj(idx)? {
            Object::Handle(h) => {
                // Name-pair records re-encode on every occurrence: they do
                // not join the back-reference table because the decoder may
                // resolve them to plain function references.
                if let Some(fr) = h.data.as_any().downcast_ref::<FuncRefHandle>() {
                    self.write_func_ref(&fr.script_name, &fr.func_name);
                    Ok(())
                } else {
                    Err(FixError::UnserializableRef)
                }
            }
            Object::Array(a) => {
                let order = self.seen.len();
                self.seen.insert(idx, order);
                let pure_data = a.ref_bits.iter().all(|&w| w == 0) || a.is_shared();
                if pure_data {
                    let ty = match (a.is_string(), a.shared.as_ref().map_or(a.store.elem_size(), |b| b.elem_size())) {
                        (true, 1) => T_STRING_BYTE,
                        (true, 2) => T_STRING_SHORT,
                        (true, _) => T_STRING_INT,
                        (false, 1) => T_ARRAY_BYTE,
                        (false, 2) => T_ARRAY_SHORT,
                        (false, _) => T_ARRAY_INT,
                    };
                    self.write_tag(ty, a.len);
                    for i in 0..a.len {
                        let e = a.get(i).data;
                        match ty {
                            T_ARRAY_BYTE | T_STRING_BYTE => self.out.push(e as u8),
                            T_ARRAY_SHORT | T_STRING_SHORT => {
                                self.out.extend_from_slice(&(e as u16).to_le_bytes())
                            }
                            _ => self.out.extend_from_slice(&e.to_le_bytes()),
                        }
                    }
                    Ok(())
                } else {
                    self.write_tag(T_ARRAY, a.len);
                    let elems: Vec<Value> = (0..a.len).map(|i| a.get(i)).collect();
                    for e in elems {
                        self.serialize_value(e, depth + 1)?;
                    }
                    Ok(())
                }
            }
            Object::Hash(_) => {
                let order = self.seen.len();
                self.seen.insert(idx, order);
                let entries = self.heap.hash_entries(v)?;
                self.write_tag(T_HASH, entries.len());
                for (k, val) in entries {
                    self.serialize_value(k, depth + 1)?;
                    self.serialize_value(val, depth + 1)?;
                }
                Ok(())
            }
        }
    }
}

struct Deserializer<'a> {
    data: &'a [u8],
    pos: usize,
    objects: Vec<Value>,
}

impl<'a> Deserializer<'a> {
    fn byte(&mut self) -> Result<u8, FixError> {
        let b = *self.data.get(self.pos).ok_or(FixError::BadFormat)?;
        self.pos += 1;
        Ok(b)
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], FixError> {
        let end = self.pos.checked_add(n).ok_or(FixError::BadFormat)?;
        if end > self.data.len() {
            return Err(FixError::BadFormat);
        }
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    /// Read the length field after a tag, rejecting non-canonical escapes.
    fn read_len(&mut self, aux: u8) -> Result<usize, FixError> {
        match aux {
            0..=12 => Ok(aux as usize),
            13 => {
                let n = self.byte()? as usize;
                if n < 13 {
                    return Err(FixError::BadFormat);
                }
                Ok(n)
            }
            14 => {
                let n = u16::from_le_bytes(self.bytes(2)?.try_into().unwrap()) as usize;
                if n <= 0xFF {
                    return Err(FixError::BadFormat);
                }
                Ok(n)
            }
            _ => {
                let n = u32::from_le_bytes(self.bytes(4)?.try_into().unwrap()) as usize;
                if n <= 0xFFFF {
                    return Err(FixError::BadFormat);
                }
                Ok(n)
            }
        }
    }

    fn read_string_payload(&mut self, ty: u8, len: usize) -> Result<String, FixError> {
        let mut out = String::with_capacity(len);
        for _ in 0..len {
            let cp = match ty {
                T_STRING_BYTE => self.byte()? as u32,
                T_STRING_SHORT => u16::from_le_bytes(self.bytes(2)?.try_into().unwrap()) as u32,
                _ => u32::from_le_bytes(self.bytes(4)?.try_into().unwrap()),
            };
            out.push(char::from_u32(cp).unwrap_or('\u{FFFD}'));
        }
        Ok(out)
    }

    fn read_value(&mut self, heap: &mut Heap, depth: usize) -> Result<Value, FixError> {
        if depth > SERIALIZE_RECURSION_CUTOFF {
            return Err(FixError::RecursionLimit);
        }
        let tag = self.byte()?;
        let ty = tag & 0x0F;
        let aux = tag >> 4;
        match ty {
            T_ZERO => match aux {
                0 => Ok(Value::ZERO),
                AUX_FUNC_REF => self.read_func_ref(heap, depth),
                _ => Err(FixError::BadFormat),
            },
            T_BYTE => {
                if aux != 0 {
                    return Err(FixError::BadFormat);
                }
                let v = self.byte()? as i8 as i32;
                if v == 0 {
                    return Err(FixError::BadFormat);
                }
                Ok(Value::int(v))
            }
            T_SHORT => {
                if aux != 0 {
                    return Err(FixError::BadFormat);
                }
                let v = i16::from_le_bytes(self.bytes(2)?.try_into().unwrap()) as i32;
                if (-0x80..0x80).contains(&v) {
                    return Err(FixError::BadFormat);
                }
                Ok(Value::int(v))
            }
            T_INT => {
                if aux != 0 {
                    return Err(FixError::BadFormat);
                }
                let v = i32::from_le_bytes(self.bytes(4)?.try_into().unwrap());
                if (-0x8000..0x8000).contains(&v) {
                    return Err(FixError::BadFormat);
                }
                Ok(Value::int(v))
            }
            T_FLOAT => {
                if aux != 0 {
                    return Err(FixError::BadFormat);
                }
                let bits = u32::from_le_bytes(self.bytes(4)?.try_into().unwrap());
                if bits == 0 {
                    return Err(FixError::BadFormat);
                }
                Ok(Value {
                    data: canonical_nan(bits) as i32,
                    is_ref: true,
                })
            }
            T_FLOAT_ZERO => {
                if aux != 0 {
                    return Err(FixError::BadFormat);
                }
                Ok(Value::float(0.0))
            }
            T_REF_SHORT => self
                .objects
                .get(aux as usize)
                .copied()
                .ok_or(FixError::BadFormat),
            T_REF => {
                let order = self.read_len(aux)?;
                if order < 13 {
                    return Err(FixError::BadFormat);
                }
                self.objects.get(order).copied().ok_or(FixError::BadFormat)
            }
            T_ARRAY => {
                let len = self.read_len(aux)?;
                let arr = heap.create_array(len).map_err(|_| FixError::OutOfMemory)?;
                heap.add_ref(arr);
                self.objects.push(arr);
                for i in 0..len {
                    let e = self.read_value(heap, depth + 1)?;
                    heap.set_array_elem(arr, i, e)?;
                }
                Ok(arr)
            }
            T_ARRAY_BYTE | T_ARRAY_SHORT | T_ARRAY_INT => {
                let len = self.read_len(aux)?;
                let arr = heap.create_array(len)?;
                heap.add_ref(arr);
                self.objects.push(arr);
                for i in 0..len {
                    let e = match ty {
                        T_ARRAY_BYTE => self.byte()? as i32,
                        T_ARRAY_SHORT => {
                            u16::from_le_bytes(self.bytes(2)?.try_into().unwrap()) as i32
                        }
                        _ => i32::from_le_bytes(self.bytes(4)?.try_into().unwrap()),
                    };
                    heap.set_array_elem(arr, i, Value::int(e))?;
                }
                Ok(arr)
            }
            T_STRING_BYTE | T_STRING_SHORT | T_STRING_INT => {
                let len = self.read_len(aux)?;
                let s = self.read_string_payload(ty, len)?;
                let v = heap.create_string(&s)?;
                heap.add_ref(v);
                self.objects.push(v);
                Ok(v)
            }
            _ => {
                let len = self.read_len(aux)?;
                let h = heap.create_hash()?;
                heap.add_ref(h);
                self.objects.push(h);
                for _ in 0..len {
                    let k = self.read_value(heap, depth + 1)?;
                    let v = self.read_value(heap, depth + 1)?;
                    heap.set_hash_elem(h, k, v)?;
                }
                Ok(h)
            }
        }
    }

    /// Read a name string belonging to a function-reference record. These
    /// strings stay outside the back-reference table, mirroring the writer.
    fn read_name_string(&mut self) -> Result<String, FixError> {
        let tag = self.byte()?;
        let ty = tag & 0x0F;
        if !matches!(ty, T_STRING_BYTE | T_STRING_SHORT | T_STRING_INT) {
            return Err(FixError::BadFormat);
        }
        let len = self.read_len(tag >> 4)?;
        self.read_string_payload(ty, len)
    }

    fn read_func_ref(&mut self, heap: &mut Heap, _depth: usize) -> Result<Value, FixError> {
        let script_name = self.read_name_string()?;
        let func_name = self.read_name_string()?;
        heap.resolve_func_ref(&script_name, &func_name)
    }
}

impl Heap {
    /// Serialize a value graph to the binary format.
    pub fn serialize(&self, v: Value) -> Result<Vec<u8>, FixError> {
        let mut ser = Serializer {
            heap: self,
            out: Vec::new(),
            seen: FxHashMap::default(),
        };
        ser.serialize_value(v, 0)?;
        Ok(ser.out)
    }

    /// Serialize into a byte-array object, optionally prefixed with a
    /// 4-byte little-endian length.
    pub fn serialize_to_array(&mut self, v: Value, length_prefix: bool) -> Result<Value, FixError> {
        let bytes = self.serialize(v)?;
        let total = bytes.len() + if length_prefix { 4 } else { 0 };
        let arr = self.create_array(total)?;
        let mut pos = 0;
        if length_prefix {
            for b in (bytes.len() as u32).to_le_bytes() {
                self.set_array_elem(arr, pos, Value::int(b as i32))?;
                pos += 1;
            }
        }
        for b in bytes {
            self.set_array_elem(arr, pos, Value::int(b as i32))?;
            pos += 1;
        }
        Ok(arr)
    }

    /// Reconstruct a value graph. Trailing bytes fail with `bad_format`.
    pub fn unserialize(&mut self, data: &[u8]) -> Result<Value, FixError> {
        let mut de = Deserializer {
            data,
            pos: 0,
            objects: Vec::new(),
        };
        let result = de.read_value(self, 0);
        // Decoded objects were pinned while the graph was incomplete.
        for &v in &de.objects {
            self.unref(v);
        }
        let v = result?;
        if de.pos != data.len() {
            return Err(FixError::BadFormat);
        }
        Ok(v)
    }

    /// Unserialize from a byte-array object.
    pub fn unserialize_from_array(&mut self, arr: Value) -> Result<Value, FixError> {
        let len = self.length(arr)?;
        let mut data = Vec::with_capacity(len);
        for i in 0..len {
            let e = self.get_array_elem(arr, i)?;
            if e.is_ref || !(0..=0xFF).contains(&e.data) {
                return Err(FixError::BadFormat);
            }
            data.push(e.data as u8);
        }
        self.unserialize(&data)
    }

    /// Resolve a serialized function reference back to a function, loading
    /// the script when a loader is available. Falls back to an opaque
    /// name-pair handle when the script cannot be resolved without one.
    pub(crate) fn resolve_func_ref(
        &mut self,
        script_name: &str,
        func_name: &str,
    ) -> Result<Value, FixError> {
        let script_id = match self.script_by_name(script_name) {
            Some(id) => Some(id),
            None => {
                if self.load_fn.is_some() {
                    Some(
                        self.load_script(script_name)
                            .map_err(|_| FixError::FuncRefLoad)?,
                    )
                } else {
                    None
                }
            }
        };
        match script_id {
            Some(id) => {
                let fid = self
                    .script(id)
                    .functions
                    .get(func_name)
                    .copied()
                    .ok_or(FixError::FuncRefLoad)?;
                Ok(Value::func_ref(fid))
            }
            None => self.create_handle(Box::new(FuncRefHandle {
                script_name: script_name.to_string(),
                func_name: func_name.to_string(),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(heap: &mut Heap, v: Value) -> Value {
        let bytes = heap.serialize(v).unwrap();
        heap.unserialize(&bytes).unwrap()
    }

    #[test]
    fn test_integer_encodings_are_canonical() {
        let heap = Heap::new();
        assert_eq!(heap.serialize(Value::int(0)).unwrap(), vec![T_ZERO]);
        assert_eq!(heap.serialize(Value::int(1)).unwrap(), vec![T_BYTE, 1]);
        assert_eq!(heap.serialize(Value::int(-1)).unwrap(), vec![T_BYTE, 0xFF]);
        assert_eq!(
            heap.serialize(Value::int(0x1234)).unwrap(),
            vec![T_SHORT, 0x34, 0x12]
        );
        assert_eq!(
            heap.serialize(Value::int(0x12345678)).unwrap(),
            vec![T_INT, 0x78, 0x56, 0x34, 0x12]
        );
    }

    #[test]
    fn test_non_canonical_int_rejected() {
        let mut heap = Heap::new();
        // 0 encoded as BYTE
        assert_eq!(heap.unserialize(&[T_BYTE, 0]), Err(FixError::BadFormat));
        // 5 encoded as SHORT
        assert_eq!(
            heap.unserialize(&[T_SHORT, 5, 0]),
            Err(FixError::BadFormat)
        );
        // small value encoded as INT
        assert_eq!(
            heap.unserialize(&[T_INT, 5, 0, 0, 0]),
            Err(FixError::BadFormat)
        );
    }

    #[test]
    fn test_float_encoding() {
        let mut heap = Heap::new();
        let v = roundtrip(&mut Heap::new(), Value::float(1.5));
        assert_eq!(v, Value::float(1.5));
        assert_eq!(heap.serialize(Value::float(0.0)).unwrap(), vec![T_FLOAT_ZERO]);
        // float zero encoded long-form is rejected
        assert_eq!(
            heap.unserialize(&[T_FLOAT, 0, 0, 0, 0]),
            Err(FixError::BadFormat)
        );
        // negative zero keeps its sign bit and the long form
        let nz = roundtrip(&mut heap, Value::float(-0.0));
        assert_eq!(nz.as_float().to_bits(), (-0.0f32).to_bits());
    }

    #[test]
    fn test_nan_canonicalised() {
        let mut heap = Heap::new();
        let odd_nan = Value {
            data: 0x7FA0_0001u32 as i32,
            is_ref: true,
        };
        let v = roundtrip(&mut heap, odd_nan);
        assert_eq!(v.data as u32, 0x7FC0_0000);
    }

    #[test]
    fn test_string_roundtrip() {
        let mut heap = Heap::new();
        let s = heap.create_string("hello world").unwrap();
        let back = roundtrip(&mut heap, s);
        assert_eq!(heap.get_string(back).unwrap(), "hello world");
        assert!(heap.values_equal(s, back).unwrap());
    }

    #[test]
    fn test_mixed_array_roundtrip() {
        let mut heap = Heap::new();
        let a = heap.create_array(3).unwrap();
        let s = heap.create_string("x").unwrap();
        heap.set_array_elem(a, 0, Value::int(300)).unwrap();
        heap.set_array_elem(a, 1, Value::float(2.5)).unwrap();
        heap.set_array_elem(a, 2, s).unwrap();
        let back = roundtrip(&mut heap, a);
        assert!(heap.values_equal(a, back).unwrap());
        assert_ne!(a, back);
    }

    #[test]
    fn test_pure_data_array_compact() {
        let mut heap = Heap::new();
        let a = heap.create_array(4).unwrap();
        for i in 0..4 {
            heap.set_array_elem(a, i, Value::int(i as i32 + 1)).unwrap();
        }
        let bytes = heap.serialize(a).unwrap();
        assert_eq!(bytes, vec![T_ARRAY_BYTE | 4 << 4, 1, 2, 3, 4]);
        let back = heap.unserialize(&bytes).unwrap();
        assert!(heap.values_equal(a, back).unwrap());
    }

    #[test]
    fn test_hash_roundtrip_preserves_order() {
        let mut heap = Heap::new();
        let h = heap.create_hash().unwrap();
        for name in ["one", "two", "three"] {
            let k = heap.create_const_string(name).unwrap();
            heap.set_hash_elem(h, k, Value::int(name.len() as i32)).unwrap();
        }
        let back = roundtrip(&mut heap, h);
        assert!(heap.values_equal(h, back).unwrap());
        let keys = heap.hash_keys(back).unwrap();
        let names: Vec<String> = keys.iter().map(|&k| heap.get_string(k).unwrap()).collect();
        assert_eq!(names, vec!["one", "two", "three"]);
    }

    #[test]
    fn test_cyclic_graph_roundtrip() {
        let mut heap = Heap::new();
        let a = heap.create_array(0).unwrap();
        for i in 1..=3 {
            heap.append_array_elem(a, Value::int(i)).unwrap();
        }
        heap.append_array_elem(a, a).unwrap();
        let bytes = heap.serialize(a).unwrap();
        let b = heap.unserialize(&bytes).unwrap();
        assert_eq!(heap.length(b).unwrap(), 4);
        assert_eq!(heap.get_array_elem(b, 3).unwrap(), b);
    }

    #[test]
    fn test_shared_object_becomes_back_ref() {
        let mut heap = Heap::new();
        let inner = heap.create_array(1).unwrap();
        heap.set_array_elem(inner, 0, Value::int(500)).unwrap();
        let outer = heap.create_array(2).unwrap();
        heap.set_array_elem(outer, 0, inner).unwrap();
        heap.set_array_elem(outer, 1, inner).unwrap();
        let back = roundtrip(&mut heap, outer);
        let x = heap.get_array_elem(back, 0).unwrap();
        let y = heap.get_array_elem(back, 1).unwrap();
        assert_eq!(x, y);
    }

    #[test]
    fn test_truncated_input_rejected() {
        let mut heap = Heap::new();
        let a = heap.create_array(2).unwrap();
        heap.set_array_elem(a, 0, Value::int(1000)).unwrap();
        let bytes = heap.serialize(a).unwrap();
        assert!(heap.unserialize(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut heap = Heap::new();
        assert_eq!(heap.unserialize(&[T_ZERO, T_ZERO]), Err(FixError::BadFormat));
    }

    #[test]
    fn test_plain_handle_unserializable() {
        use crate::handle::HandleOps;
        struct Opaque;
        impl HandleOps for Opaque {
            fn type_tag(&self) -> i32 {
                99
            }
            fn as_any(&self) -> &dyn std::any::Any {
                self
            }
            fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
                self
            }
        }
        let mut heap = Heap::new();
        let h = heap.create_handle(Box::new(Opaque)).unwrap();
        assert_eq!(heap.serialize(h), Err(FixError::UnserializableRef));
    }

    #[test]
    fn test_length_prefix_helper() {
        let mut heap = Heap::new();
        let arr = heap.serialize_to_array(Value::int(7), true).unwrap();
        assert_eq!(heap.length(arr).unwrap(), 6);
        assert_eq!(heap.get_array_elem(arr, 0).unwrap(), Value::int(2));
        let plain = heap.serialize_to_array(Value::int(7), false).unwrap();
        assert_eq!(heap.length(plain).unwrap(), 2);
    }
}
