//! FixScript compiler: tokenizer, bytecode generator and script API
//!
//! Compiles FixScript source text directly into a heap's bytecode area in a
//! single recursive-descent pass, and exposes the metacircular operations
//! (`tokens_parse`, `script_query`, `script_compile`) that let scripts
//! preprocess and compile other scripts at build time.
//!
//! # Embedding
//!
//! ```rust
//! use fixscript_runtime::Heap;
//! use fixscript_compiler::{compile_source, register_script_api};
//!
//! let mut heap = Heap::new();
//! register_script_api(&mut heap);
//! compile_source(&mut heap, "hello.fix", "function main() { return 42; }").unwrap();
//! let result = heap.call_by_name("hello.fix", "main#0", &[]).unwrap();
//! assert_eq!(result.data, 42);
//! ```

pub mod error;
pub mod loader;
pub mod parser;
pub mod script_api;
pub mod token;

pub use error::CompileError;
pub use loader::FileLoader;
pub use parser::compile_source;
pub use script_api::{TOKENS_SCRIPT, register_script_api};
pub use token::{Token, TokenValue, Tokenizer};

use fixscript_core::Value;
use fixscript_runtime::Heap;

/// Recompile a script under its existing name. Function ids are preserved
/// for every function whose mangled name survives the reload, so existing
/// function references call the new bodies. The replaced script stays
/// registered under a synthetic `name#old_<n>` alias.
pub fn reload_script(heap: &mut Heap, name: &str, source: &str) -> Result<usize, CompileError> {
    let Some(old_id) = heap.script_by_name(name) else {
        return compile_source(heap, name, source);
    };
    let mut n = 0;
    let synthetic = loop {
        let candidate = format!("{}#old_{}", name, n);
        if heap.script_by_name(&candidate).is_none() {
            break candidate;
        }
        n += 1;
    };
    heap.rename_script(old_id, synthetic);
    let new_id = match compile_source(heap, name, source) {
        Ok(id) => id,
        Err(e) => {
            // Restore the original registration on failure
            heap.rename_script(old_id, name.to_string());
            return Err(e);
        }
    };
    let shared: Vec<(String, usize, usize)> = heap
        .script(new_id)
        .functions
        .iter()
        .filter_map(|(fname, &new_fid)| {
            heap.script(old_id)
                .functions
                .get(fname)
                .map(|&old_fid| (fname.clone(), new_fid, old_fid))
        })
        .collect();
    for (fname, new_fid, old_fid) in shared {
        let func = heap
            .function(new_fid)
            .expect("freshly compiled function")
            .clone();
        heap.replace_function(old_fid, func);
        heap.script_mut(new_id).functions.insert(fname, old_fid);
    }
    Ok(new_id)
}

/// Printable single-line message for a script error value, with control
/// characters stripped.
pub fn get_compiler_error(heap: &Heap, error: Value) -> String {
    heap.error_message(error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reload_preserves_function_ids() {
        let mut heap = Heap::new();
        compile_source(&mut heap, "m.fix", "function foo() { return 1; }").unwrap();
        let fr = heap.get_function("m.fix", "foo#0").unwrap();
        assert_eq!(heap.call(fr, &[]).unwrap(), Value::int(1));

        reload_script(&mut heap, "m.fix", "function foo() { return 2; }").unwrap();
        // The same reference now reaches the new body
        assert_eq!(heap.call(fr, &[]).unwrap(), Value::int(2));
        // The old script is retained under a synthetic name
        assert!(heap.script_by_name("m.fix#old_0").is_some());
    }

    #[test]
    fn test_reload_failure_restores_name() {
        let mut heap = Heap::new();
        compile_source(&mut heap, "m.fix", "function foo() { return 1; }").unwrap();
        assert!(reload_script(&mut heap, "m.fix", "function {").is_err());
        assert!(heap.script_by_name("m.fix").is_some());
        assert_eq!(
            heap.call_by_name("m.fix", "foo#0", &[]).unwrap(),
            Value::int(1)
        );
    }
}
