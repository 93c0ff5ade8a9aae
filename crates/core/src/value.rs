//! Tagged Value Representation
//!
//! Every runtime datum is a pair `(data: i32, is_ref: bool)`. Integers and
//! single-precision floats are unboxed in `data`; the `is_ref` flag
//! distinguishes a reference (index into the heap's object table, or a
//! function reference) from a plain integer.
//!
//! ## Payload layout for `is_ref = true`
//!
//! ```text
//! 0                      float zero (+0.0)
//! 1 .. FUNC_REF_OFFSET   object table index
//! FUNC_REF_OFFSET..2^23  function reference (payload - FUNC_REF_OFFSET = id)
//! >= 2^23 (as u32)       IEEE-754 single bits
//! ```
//!
//! Non-zero float bit patterns below 2^23 are denormals, and denormals are
//! flushed to signed zero after every float-producing operation, so the three
//! ranges never overlap. Type predicates visible to scripts depend on this
//! partition staying exact.

/// First payload value used for function references. Object table indices
/// stay strictly below this, so the two ranges never collide.
pub const FUNC_REF_OFFSET: i32 = 0x0078_0000;

/// Hard cap on the object table size.
pub const MAX_OBJECTS: usize = FUNC_REF_OFFSET as usize;

/// Payloads at or above this (as u32) are float bit patterns.
const FLOAT_CUTOFF: u32 = 1 << 23;

/// Quiet NaN bit pattern all NaNs canonicalise to on serialization.
const CANONICAL_NAN_BITS: u32 = 0x7FC0_0000;

/// A runtime value: unboxed integer, unboxed float, object reference or
/// function reference.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Value {
    pub data: i32,
    pub is_ref: bool,
}

impl Value {
    /// Integer zero. Also the result of failed allocations.
    pub const ZERO: Value = Value {
        data: 0,
        is_ref: false,
    };

    #[inline]
    pub fn int(v: i32) -> Value {
        Value {
            data: v,
            is_ref: false,
        }
    }

    /// Encode a float, flushing denormals to signed zero.
    #[inline]
    pub fn float(v: f32) -> Value {
        Value {
            data: flush_denormal(v).to_bits() as i32,
            is_ref: true,
        }
    }

    /// Reference to an object table slot. Index 0 is reserved and encodes
    /// the float zero instead, so callers must pass a valid index.
    #[inline]
    pub fn object(idx: usize) -> Value {
        debug_assert!(idx > 0 && idx < MAX_OBJECTS);
        Value {
            data: idx as i32,
            is_ref: true,
        }
    }

    /// Reference to a function by id.
    #[inline]
    pub fn func_ref(id: usize) -> Value {
        debug_assert!((id as u32) < FLOAT_CUTOFF - FUNC_REF_OFFSET as u32);
        Value {
            data: FUNC_REF_OFFSET + id as i32,
            is_ref: true,
        }
    }

    #[inline]
    pub fn is_int(&self) -> bool {
        !self.is_ref
    }

    /// Payloads in `[1, 2^23)` with `is_ref` set are reserved for object
    /// indices and function references and are never floats.
    #[inline]
    pub fn is_float(&self) -> bool {
        self.is_ref && (self.data == 0 || self.data as u32 >= FLOAT_CUTOFF)
    }

    #[inline]
    pub fn is_object(&self) -> bool {
        self.is_ref && self.data > 0 && self.data < FUNC_REF_OFFSET
    }

    #[inline]
    pub fn is_func_ref(&self) -> bool {
        self.is_ref && self.data >= FUNC_REF_OFFSET && (self.data as u32) < FLOAT_CUTOFF
    }

    /// The zero integer, which scripts spell `null`.
    #[inline]
    pub fn is_null(&self) -> bool {
        !self.is_ref && self.data == 0
    }

    #[inline]
    pub fn as_float(&self) -> f32 {
        f32::from_bits(self.data as u32)
    }

    #[inline]
    pub fn object_index(&self) -> Option<usize> {
        if self.is_object() {
            Some(self.data as usize)
        } else {
            None
        }
    }

    #[inline]
    pub fn func_id(&self) -> Option<usize> {
        if self.is_func_ref() {
            Some((self.data - FUNC_REF_OFFSET) as usize)
        } else {
            None
        }
    }
}

/// Flush denormals to signed zero. Applied after every float-producing
/// operation so that all live float payloads are either zero or >= 2^23.
#[inline]
pub fn flush_denormal(v: f32) -> f32 {
    if v.is_subnormal() {
        if v.is_sign_negative() { -0.0 } else { 0.0 }
    } else {
        v
    }
}

/// Canonicalise NaN bit patterns to a single quiet representation.
#[inline]
pub fn canonical_nan(bits: u32) -> u32 {
    if f32::from_bits(bits).is_nan() {
        CANONICAL_NAN_BITS
    } else {
        bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_roundtrip() {
        let v = Value::int(-123);
        assert!(v.is_int());
        assert!(!v.is_float());
        assert_eq!(v.data, -123);
    }

    #[test]
    fn test_float_zero_is_payload_zero() {
        let v = Value::float(0.0);
        assert_eq!(v.data, 0);
        assert!(v.is_ref);
        assert!(v.is_float());
        assert!(!v.is_object());
    }

    #[test]
    fn test_negative_float_is_float() {
        let v = Value::float(-1.5);
        assert!(v.is_float());
        assert_eq!(v.as_float(), -1.5);
    }

    #[test]
    fn test_denormal_flushes_to_signed_zero() {
        let denormal = f32::from_bits(1);
        let v = Value::float(denormal);
        assert_eq!(v.data, 0);
        let v = Value::float(-denormal);
        assert_eq!(v.as_float().to_bits(), (-0.0f32).to_bits());
        assert!(v.is_float());
    }

    #[test]
    fn test_object_index_not_float() {
        let v = Value::object(1);
        assert!(v.is_object());
        assert!(!v.is_float());
        assert_eq!(v.object_index(), Some(1));
    }

    #[test]
    fn test_func_ref_partition() {
        let v = Value::func_ref(7);
        assert!(v.is_func_ref());
        assert!(!v.is_float());
        assert!(!v.is_object());
        assert_eq!(v.func_id(), Some(7));
        // Function reference payloads stay below the float cutoff
        assert!((v.data as u32) < (1 << 23));
    }

    #[test]
    fn test_canonical_nan() {
        let weird_nan = 0x7FA0_0001;
        assert!(f32::from_bits(weird_nan).is_nan());
        assert_eq!(canonical_nan(weird_nan), 0x7FC0_0000);
        assert_eq!(canonical_nan(1.5f32.to_bits()), 1.5f32.to_bits());
    }
}
