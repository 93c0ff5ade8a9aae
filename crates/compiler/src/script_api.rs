//! Metacircular Script API
//!
//! The tokenizer and compile pipeline exposed to user scripts as natives,
//! so scripts can preprocess, inspect, compile and serialize other scripts
//! at build time. `register_script_api` also compiles a small helper script
//! exposing the token-type constants, so preprocessors can
//! `import "__fixscript_tokens__";` and name token kinds symbolically.

use crate::error::CompileError;
use crate::parser::compile_source;
use crate::token::Tokenizer;
use fixscript_core::Value;
use fixscript_runtime::{FixError, Heap, NativeResult};

/// Name of the auto-registered constants script.
pub const TOKENS_SCRIPT: &str = "__fixscript_tokens__";

const TOKENS_SOURCE: &str = "\
const TOK_IDENT = 0;\n\
const TOK_FUNC_REF = 1;\n\
const TOK_NUMBER = 2;\n\
const TOK_HEX_NUMBER = 3;\n\
const TOK_FLOAT_NUMBER = 4;\n\
const TOK_CHAR = 5;\n\
const TOK_STRING = 6;\n\
const TOK_SYMBOL = 7;\n\
const TOK_KEYWORD = 8;\n\
const TOK_UNKNOWN = 9;\n";

fn fail_str(heap: &mut Heap, msg: &str) -> NativeResult {
    match heap.create_string(msg) {
        Ok(s) => NativeResult::Error(s),
        Err(_) => NativeResult::Error(Value::ZERO),
    }
}

fn fail(heap: &mut Heap, e: FixError) -> NativeResult {
    fail_str(heap, &e.to_string())
}

fn fail_compile(heap: &mut Heap, e: &CompileError) -> NativeResult {
    fail_str(heap, &e.to_string())
}

/// Register the metacircular natives (and the token-constants script) on a
/// heap. Call once after creating the heap.
pub fn register_script_api(heap: &mut Heap) {
    compile_source(heap, TOKENS_SCRIPT, TOKENS_SOURCE).expect("token constants script");

    // tokens_parse(tokens, src, fname, line): lex `src` and append token
    // records (type, off, len, line) to `tokens`, creating the array when
    // null. Returns the record array.
    heap.register_native("tokens_parse#4", |heap, args| {
        let src = match heap.get_string(args[1]) {
            Ok(s) => s,
            Err(e) => return fail(heap, e),
        };
        let first_line = if args[3].is_int() && args[3].data > 0 {
            args[3].data as u32
        } else {
            1
        };
        let tokens = if args[0].is_null() {
            match heap.create_array(0) {
                Ok(a) => a,
                Err(e) => return fail(heap, e),
            }
        } else {
            args[0]
        };
        let lexed = match Tokenizer::new(&src, first_line, true).tokenize_all() {
            Ok(t) => t,
            Err(e) => return fail_compile(heap, &e),
        };
        for t in lexed {
            for field in [t.ty, t.off as i32, t.len as i32, t.line as i32] {
                if let Err(e) = heap.append_array_elem(tokens, Value::int(field)) {
                    return fail(heap, e);
                }
            }
        }
        NativeResult::Value(tokens)
    });

    // script_query(name, constants, locals, functions): fill the supplied
    // containers with the script's constants (hash name -> value), script
    // variable names (array of strings) and functions (hash mangled name ->
    // function reference). Null containers are skipped.
    heap.register_native("script_query#4", |heap, args| {
        let name = match heap.get_string(args[0]) {
            Ok(s) => s,
            Err(e) => return fail(heap, e),
        };
        let id = match heap.load_script(&name) {
            Ok(id) => id,
            Err(msg) => return fail_str(heap, &msg),
        };
        if !args[1].is_null() {
            let constants: Vec<(String, Value)> = heap
                .script(id)
                .constants
                .iter()
                .map(|(k, &v)| (k.clone(), v))
                .collect();
            for (k, v) in constants {
                let key = match heap.create_const_string(&k) {
                    Ok(k) => k,
                    Err(e) => return fail(heap, e),
                };
                if let Err(e) = heap.set_hash_elem(args[1], key, v) {
                    return fail(heap, e);
                }
            }
        }
        if !args[2].is_null() {
            let names: Vec<String> = heap.script(id).globals.keys().cloned().collect();
            for n in names {
                let s = match heap.create_const_string(&n) {
                    Ok(s) => s,
                    Err(e) => return fail(heap, e),
                };
                if let Err(e) = heap.append_array_elem(args[2], s) {
                    return fail(heap, e);
                }
            }
        }
        if !args[3].is_null() {
            let funcs: Vec<(String, usize)> = heap
                .script(id)
                .functions
                .iter()
                .map(|(k, &fid)| (k.clone(), fid))
                .collect();
            for (n, fid) in funcs {
                let key = match heap.create_const_string(&n) {
                    Ok(k) => k,
                    Err(e) => return fail(heap, e),
                };
                if let Err(e) = heap.set_hash_elem(args[3], key, Value::func_ref(fid)) {
                    return fail(heap, e);
                }
            }
        }
        NativeResult::Value(Value::ZERO)
    });

    // script_compile(name, src): compile source text under a name. The
    // loaded script's functions become resolvable through script_query and
    // function references.
    heap.register_native("script_compile#2", |heap, args| {
        let name = match heap.get_string(args[0]) {
            Ok(s) => s,
            Err(e) => return fail(heap, e),
        };
        let src = match heap.get_string(args[1]) {
            Ok(s) => s,
            Err(e) => return fail(heap, e),
        };
        match compile_source(heap, &name, &src) {
            Ok(_) => NativeResult::Value(Value::ZERO),
            Err(e) => fail_compile(heap, &e),
        }
    });

    // script_line(funcref): source line of the function's entry point.
    heap.register_native("script_line#1", |heap, args| {
        let Some(fid) = args[0].func_id() else {
            return fail(heap, FixError::InvalidAccess);
        };
        let Some(func) = heap.function(fid) else {
            return fail(heap, FixError::InvalidAccess);
        };
        let line = heap
            .script(func.script)
            .line_for_pc(func.addr)
            .unwrap_or(0);
        NativeResult::Value(Value::int(line as i32))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_compiles_constants_script() {
        let mut heap = Heap::new();
        register_script_api(&mut heap);
        let id = heap.script_by_name(TOKENS_SCRIPT).unwrap();
        assert_eq!(
            heap.script(id).constants.get("TOK_STRING"),
            Some(&Value::int(6))
        );
    }

    #[test]
    fn test_tokens_parse_records() {
        let mut heap = Heap::new();
        register_script_api(&mut heap);
        let src = heap.create_string("var x = 1;").unwrap();
        let fname = heap.create_string("t.fix").unwrap();
        let out = heap
            .call_native("tokens_parse#4", &[Value::ZERO, src, fname, Value::int(1)])
            .unwrap();
        // 5 tokens, 4 fields each
        assert_eq!(heap.length(out).unwrap(), 20);
        assert_eq!(
            heap.get_array_elem(out, 0).unwrap(),
            Value::int(crate::token::TOK_KEYWORD)
        );
    }
}
