//! End-to-end behavior of compiled scripts: arithmetic and string building,
//! hash iteration order, weak references, serialization round trips, time
//! limits and script reload.

use fixscript_core::Value;
use fixscript_compiler::{compile_source, reload_script};
use fixscript_runtime::Heap;
use std::time::Duration;

fn run(heap: &mut Heap, src: &str, func: &str) -> Result<Value, String> {
    compile_source(heap, "test.fix", src).map_err(|e| e.to_string())?;
    heap.call_by_name("test.fix", func, &[]).map_err(|e| e.to_string())
}

#[test]
fn test_arithmetic_and_string_concat() {
    let mut heap = Heap::new();
    let v = run(
        &mut heap,
        r#"function test() { var x = 2 + 3 * 4; return {=", x=", x}; }"#,
        "test#0",
    )
    .unwrap();
    assert_eq!(heap.get_string(v).unwrap(), ", x=14");
}

#[test]
fn test_hash_iteration_order() {
    let mut heap = Heap::new();
    let keys = run(
        &mut heap,
        r#"
        function test() {
            var h = {"a": 1, "b": 2, "c": 3};
            hash_remove(h, "b");
            h{"d"} = 4;
            return hash_keys(h);
        }
        "#,
        "test#0",
    )
    .unwrap();
    assert_eq!(heap.length(keys).unwrap(), 3);
    let names: Vec<String> = (0..3)
        .map(|i| {
            let k = heap.get_array_elem(keys, i).unwrap();
            heap.get_string(k).unwrap()
        })
        .collect();
    assert_eq!(names, vec!["a", "c", "d"]);
}

#[test]
fn test_weak_ref_clears_container_entry() {
    let mut heap = Heap::new();
    let v = run(
        &mut heap,
        r#"
        function test() {
            var k = {1, 2, 3};
            var h = {};
            weakref_create(k, h, "k");
            h{"k"} = k;
            k = null;
            heap_collect();
            return hash_contains(h, "k");
        }
        "#,
        "test#0",
    )
    .unwrap();
    assert_eq!(v, Value::int(0));
}

#[test]
fn test_weak_ref_kept_while_strongly_held() {
    let mut heap = Heap::new();
    let v = run(
        &mut heap,
        r#"
        function test() {
            var k = {1, 2, 3};
            var h = {};
            weakref_create(k, h, "k");
            h{"k"} = k;
            heap_collect();
            return hash_contains(h, "k");
        }
        "#,
        "test#0",
    )
    .unwrap();
    assert_eq!(v, Value::int(1));
}

#[test]
fn test_serialize_round_trip_with_cycle() {
    let mut heap = Heap::new();
    let v = run(
        &mut heap,
        r#"
        function test() {
            var a = {1, 2, 3};
            a[] = a;
            var buf = serialize(a);
            var b = unserialize(buf);
            if (b[3] === b) {
                return length(b);
            }
            return -1;
        }
        "#,
        "test#0",
    )
    .unwrap();
    assert_eq!(v, Value::int(4));
}

#[test]
fn test_time_limit_stops_infinite_loop() {
    let mut heap = Heap::new();
    heap.set_time_limit(Some(Duration::from_millis(50)));
    let err = run(&mut heap, "function test() { while (1) {} }", "test#0").unwrap_err();
    assert!(err.contains("execution time limit"), "{}", err);
}

#[test]
fn test_stop_execution_flag() {
    let mut heap = Heap::new();
    heap.set_time_limit(Some(Duration::from_secs(3600)));
    heap.stop_execution();
    let err = run(&mut heap, "function test() { while (1) {} }", "test#0").unwrap_err();
    assert!(err.contains("execution stopped"), "{}", err);
}

#[test]
fn test_reload_preserves_function_references() {
    let mut heap = Heap::new();
    compile_source(&mut heap, "m.fix", "function foo() { return 10; }").unwrap();
    let fr = heap.get_function("m.fix", "foo#0").unwrap();
    assert_eq!(heap.call(fr, &[]).unwrap(), Value::int(10));
    reload_script(&mut heap, "m.fix", "function foo() { return 20; }").unwrap();
    assert_eq!(heap.call(fr, &[]).unwrap(), Value::int(20));
}

#[test]
fn test_funcref_serialize_round_trip() {
    let mut heap = Heap::new();
    compile_source(&mut heap, "m.fix", "function foo(x) { return x + 1; }").unwrap();
    let fr = heap.get_function("m.fix", "foo#1").unwrap();
    let bytes = heap.serialize(fr).unwrap();
    // The script is loaded, so the name pair resolves straight back
    let back = heap.unserialize(&bytes).unwrap();
    assert_eq!(back, fr);
    assert_eq!(heap.call(back, &[Value::int(4)]).unwrap(), Value::int(5));
}

#[test]
fn test_funcref_clones_across_heaps() {
    let mut a = Heap::new();
    let mut b = Heap::new();
    compile_source(&mut a, "m.fix", "function foo() { return 31; }").unwrap();
    compile_source(&mut b, "m.fix", "function foo() { return 32; }").unwrap();
    let fr = a.get_function("m.fix", "foo#0").unwrap();
    let moved = b.clone_from(&a, fr).unwrap();
    // Resolution is by (script, function) name in the destination heap
    assert_eq!(b.call(moved, &[]).unwrap(), Value::int(32));
}

#[test]
fn test_funcref_to_unloaded_script_is_opaque_handle() {
    let mut a = Heap::new();
    let mut b = Heap::new();
    compile_source(&mut a, "only_a.fix", "function foo() { return 1; }").unwrap();
    let fr = a.get_function("only_a.fix", "foo#0").unwrap();
    let bytes = a.serialize(fr).unwrap();
    // No loader and no such script in b: the reference survives as an
    // opaque name pair
    let opaque = b.unserialize(&bytes).unwrap();
    assert!(b.is_handle(opaque));
    let reserialized = b.serialize(opaque).unwrap();
    assert_eq!(bytes, reserialized);
}

#[test]
fn test_error_carries_stack_trace() {
    let mut heap = Heap::new();
    let err = run(
        &mut heap,
        r#"
        function inner() { return 1 / 0; }
        function test() { return inner(); }
        "#,
        "test#0",
    )
    .unwrap_err();
    assert!(err.contains("division by zero"), "{}", err);
}

#[test]
fn test_trace_names_functions() {
    let mut heap = Heap::new();
    compile_source(
        &mut heap,
        "t.fix",
        r#"
        function inner() { return 1 / 0; }
        function test() { return inner(); }
        "#,
    )
    .unwrap();
    let err = heap.call_by_name("t.fix", "test#0", &[]).unwrap_err();
    let trace = heap.error_stack_trace(err.value);
    assert!(trace.iter().any(|l| l.contains("inner#0")), "{:?}", trace);
    assert!(trace.iter().any(|l| l.contains("test#0")), "{:?}", trace);
    assert!(trace.iter().any(|l| l.contains("t.fix")), "{:?}", trace);
}
