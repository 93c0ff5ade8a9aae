//! Engine Built-ins
//!
//! Natives registered on every heap. These are engine-level operations on
//! the heap (lengths, clones, serialization, weak references, collection),
//! not a standard library: embedders and scripts layer their own helpers on
//! top.

use crate::error::FixError;
use crate::heap::Heap;
use crate::native::NativeResult;
use fixscript_core::Value;

fn fail(heap: &mut Heap, e: FixError) -> NativeResult {
    match heap.create_string(&e.to_string()) {
        Ok(msg) => NativeResult::Error(msg),
        Err(_) => NativeResult::Error(Value::ZERO),
    }
}

fn result(heap: &mut Heap, r: Result<Value, FixError>) -> NativeResult {
    match r {
        Ok(v) => NativeResult::Value(v),
        Err(e) => fail(heap, e),
    }
}

fn as_index(v: Value) -> Result<usize, FixError> {
    if v.is_int() && v.data >= 0 {
        Ok(v.data as usize)
    } else {
        Err(FixError::OutOfBounds)
    }
}

pub(crate) fn register_builtins(heap: &mut Heap) {
    heap.register_native("length#1", |heap, args| {
        let r = heap.length(args[0]).map(|n| Value::int(n as i32));
        result(heap, r)
    });

    heap.register_native("set_length#2", |heap, args| {
        let r = as_index(args[1]).and_then(|n| heap.set_array_length(args[0], n));
        result(heap, r.map(|_| args[0]))
    });

    heap.register_native("copy#1", |heap, args| {
        let r = heap.clone_value(args[0], false);
        result(heap, r)
    });

    heap.register_native("clone_deep#1", |heap, args| {
        let r = heap.clone_value(args[0], true);
        result(heap, r)
    });

    heap.register_native("array_fill#2", |heap, args| {
        let r = heap.array_fill(args[0], args[1]);
        result(heap, r.map(|_| args[0]))
    });

    heap.register_native("hash_keys#1", |heap, args| {
        let r = heap.hash_keys(args[0]).and_then(|keys| {
            let arr = heap.create_array(keys.len())?;
            for (i, k) in keys.into_iter().enumerate() {
                heap.set_array_elem(arr, i, k)?;
            }
            Ok(arr)
        });
        result(heap, r)
    });

    heap.register_native("hash_contains#2", |heap, args| {
        let r = heap
            .hash_contains(args[0], args[1])
            .map(|b| Value::int(b as i32));
        result(heap, r)
    });

    heap.register_native("hash_remove#2", |heap, args| {
        let r = heap.remove_hash_elem(args[0], args[1]);
        result(heap, r)
    });

    heap.register_native("hash_entry#2", |heap, args| {
        let r = as_index(args[1])
            .and_then(|n| heap.hash_entry(args[0], n))
            .and_then(|(k, v)| {
                let pair = heap.create_array(2)?;
                heap.set_array_elem(pair, 0, k)?;
                heap.set_array_elem(pair, 1, v)?;
                Ok(pair)
            });
        result(heap, r)
    });

    heap.register_native("serialize#1", |heap, args| {
        let r = heap.serialize_to_array(args[0], false);
        result(heap, r)
    });

    heap.register_native("unserialize#1", |heap, args| {
        let r = heap.unserialize_from_array(args[0]);
        result(heap, r)
    });

    heap.register_native("weakref_create#1", |heap, args| {
        let r = heap.create_weak_ref(args[0], None, None);
        result(heap, r)
    });

    heap.register_native("weakref_create#3", |heap, args| {
        let r = heap.create_weak_ref(args[0], Some(args[1]), Some(args[2]));
        result(heap, r)
    });

    heap.register_native("weakref_get#1", |heap, args| {
        let r = heap.weak_ref_get(args[0]);
        result(heap, r)
    });

    heap.register_native("funcref_call#2", |heap, args| {
        let argv = match heap.get_array_range(args[1], 0, heap.length(args[1]).unwrap_or(0)) {
            Ok(v) => v,
            Err(e) => return fail(heap, e),
        };
        match heap.call(args[0], &argv) {
            Ok(v) => NativeResult::Value(v),
            Err(e) => NativeResult::Error(e.value),
        }
    });

    heap.register_native("heap_collect#0", |heap, _args| {
        heap.collect();
        NativeResult::Value(Value::ZERO)
    });

    heap.register_native("to_string#1", |heap, args| {
        let s = heap.to_display_string(args[0]);
        let r = heap.create_string(&s);
        result(heap, r)
    });

    heap.register_native("error_msg#1", |heap, args| {
        let msg = heap.error_message(args[0]);
        let r = heap.create_string(&msg);
        result(heap, r)
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_registered() {
        let heap = Heap::new();
        for name in [
            "length#1",
            "serialize#1",
            "unserialize#1",
            "weakref_create#3",
            "hash_keys#1",
            "heap_collect#0",
        ] {
            assert!(heap.find_native(name).is_some(), "missing {}", name);
        }
    }
}
