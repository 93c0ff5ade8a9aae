//! Metacircular pipeline: `use` preprocessors rewriting token streams, and
//! scripts compiling and querying other scripts at build time.

use fixscript_core::Value;
use fixscript_compiler::{compile_source, register_script_api};
use fixscript_runtime::Heap;

#[test]
fn test_use_preprocessor_identity() {
    let mut heap = Heap::new();
    register_script_api(&mut heap);
    compile_source(
        &mut heap,
        "pre.fix",
        "function process_tokens(fname, tokens, src) { return 0; }",
    )
    .unwrap();
    compile_source(
        &mut heap,
        "main.fix",
        r#"
        use "pre.fix";
        function test() { return 5; }
        "#,
    )
    .unwrap();
    let v = heap.call_by_name("main.fix", "test#0", &[]).unwrap();
    assert_eq!(v, Value::int(5));
}

#[test]
fn test_use_preprocessor_rewrites_numbers() {
    let mut heap = Heap::new();
    register_script_api(&mut heap);
    // Rewrite every integer literal to 42 by appending new text to the
    // source and retargeting the token records.
    compile_source(
        &mut heap,
        "fortytwo.fix",
        r#"
        import "__fixscript_tokens__";
        function process_tokens(fname, tokens, src) {
            var n = length(tokens) / 4;
            for (var i = 0; i < n; i++) {
                if (tokens[i * 4] == TOK_NUMBER) {
                    var off = length(src);
                    src[] = '4';
                    src[] = '2';
                    tokens[i * 4 + 1] = off;
                    tokens[i * 4 + 2] = 2;
                }
            }
            return 0;
        }
        "#,
    )
    .unwrap();
    compile_source(
        &mut heap,
        "main.fix",
        r#"
        use "fortytwo.fix";
        function test() { return 7; }
        "#,
    )
    .unwrap();
    let v = heap.call_by_name("main.fix", "test#0", &[]).unwrap();
    assert_eq!(v, Value::int(42));
}

#[test]
fn test_script_compile_and_query() {
    let mut heap = Heap::new();
    register_script_api(&mut heap);
    compile_source(
        &mut heap,
        "main.fix",
        r#"
        function test() {
            script_compile("gen.fix", "function gen() { return 99; }");
            var funcs = {};
            script_query("gen.fix", null, null, funcs);
            var fr = funcs{"gen#0"};
            return fr();
        }
        "#,
    )
    .unwrap();
    let v = heap.call_by_name("main.fix", "test#0", &[]).unwrap();
    assert_eq!(v, Value::int(99));
}

#[test]
fn test_script_query_constants() {
    let mut heap = Heap::new();
    register_script_api(&mut heap);
    compile_source(&mut heap, "c.fix", "const ANSWER = 41;").unwrap();
    compile_source(
        &mut heap,
        "main.fix",
        r#"
        function test() {
            var consts = {};
            script_query("c.fix", consts, null, null);
            return consts{"ANSWER"} + 1;
        }
        "#,
    )
    .unwrap();
    let v = heap.call_by_name("main.fix", "test#0", &[]).unwrap();
    assert_eq!(v, Value::int(42));
}

#[test]
fn test_tokens_parse_from_script() {
    let mut heap = Heap::new();
    register_script_api(&mut heap);
    compile_source(
        &mut heap,
        "main.fix",
        r#"
        function test() {
            var toks = tokens_parse(null, "var x = 1;", "inline.fix", 1);
            return length(toks) / 4;
        }
        "#,
    )
    .unwrap();
    let v = heap.call_by_name("main.fix", "test#0", &[]).unwrap();
    assert_eq!(v, Value::int(5));
}

#[test]
fn test_compiled_script_serializes_tokens() {
    let mut heap = Heap::new();
    register_script_api(&mut heap);
    compile_source(
        &mut heap,
        "main.fix",
        r#"
        function test() {
            var toks = tokens_parse(null, "1 + 2", "x.fix", 1);
            var buf = serialize(toks);
            var back = unserialize(buf);
            return length(back) == length(toks);
        }
        "#,
    )
    .unwrap();
    let v = heap.call_by_name("main.fix", "test#0", &[]).unwrap();
    assert_eq!(v, Value::int(1));
}

#[test]
fn test_missing_preprocessor_function_errors() {
    let mut heap = Heap::new();
    register_script_api(&mut heap);
    compile_source(&mut heap, "empty.fix", "function unrelated() { return 0; }").unwrap();
    let err = compile_source(
        &mut heap,
        "main.fix",
        r#"
        use "empty.fix";
        function test() { return 1; }
        "#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("process_tokens"), "{}", err);
}
