//! Process-Wide Counters
//!
//! Two atomics assign stable identifiers across every heap in the process:
//! handle type tags for host-registered handle kinds, and keys for heap-local
//! storage. Both counters live for the process lifetime and are never reused.

use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

/// Next handle type tag. Tags 0 and below are reserved (the engine uses
/// negative tags for function-reference and weak-reference handles), so
/// user tags start at 1.
static NATIVE_HANDLE_TYPES: AtomicI32 = AtomicI32::new(1);

/// Next heap-local storage key, starting at 0.
static HEAP_KEYS: AtomicUsize = AtomicUsize::new(0);

/// Allocate a fresh handle type tag.
pub fn next_handle_type() -> i32 {
    NATIVE_HANDLE_TYPES.fetch_add(1, Ordering::Relaxed)
}

/// Allocate a fresh heap-local storage key.
pub fn next_heap_key() -> usize {
    HEAP_KEYS.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_monotonic() {
        let a = next_handle_type();
        let b = next_handle_type();
        assert!(b > a);
        assert!(a >= 1);

        let k1 = next_heap_key();
        let k2 = next_heap_key();
        assert!(k2 > k1);
    }
}
