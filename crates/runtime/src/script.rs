//! Scripts and Functions
//!
//! Compiled scripts are keyed by name in the heap's registry. Functions live
//! in a heap-wide vector so function references (which encode the function
//! id in their payload) stay valid across script reloads: reload patches the
//! existing function slots in place and retires the old script under a
//! synthetic name.

use crate::heap::Heap;
use fixscript_core::Value;
use rustc_hash::FxHashMap;
use std::rc::Rc;

/// Callback resolving a script name to a loaded script id, typically by
/// compiling source text. Invoked from `import`, `use`, function-reference
/// resolution and the metacircular operations. Must be idempotent for the
/// same name.
pub type LoadScriptFn = Rc<dyn Fn(&mut Heap, &str) -> Result<usize, String>>;

/// One compiled function. `name` is the mangled `name#arity` form.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub script: usize,
    pub addr: u32,
    pub num_params: usize,
}

/// A compiled script registered in a heap.
#[derive(Debug, Default)]
pub struct Script {
    pub name: String,
    /// mangled `name#arity` -> function id
    pub functions: FxHashMap<String, usize>,
    /// script variable name -> globals slot
    pub globals: FxHashMap<String, usize>,
    /// `const` declarations
    pub constants: FxHashMap<String, Value>,
    /// script ids of imports
    pub imports: Vec<usize>,
    /// values referenced from this script's bytecode (interned strings,
    /// prebuilt constants); collector roots
    pub const_roots: Vec<Value>,
    /// sorted (pc, line) pairs covering this script's bytecode
    pub line_table: Vec<(u32, u32)>,
    /// bytecode range occupied by this script
    pub code_range: (u32, u32),
}

impl Script {
    pub fn new(name: &str) -> Script {
        Script {
            name: name.to_string(),
            ..Script::default()
        }
    }

    /// Source line for a bytecode offset, from the line-number table.
    pub fn line_for_pc(&self, pc: u32) -> Option<u32> {
        if self.line_table.is_empty() || pc < self.code_range.0 || pc >= self.code_range.1 {
            return None;
        }
        match self.line_table.binary_search_by_key(&pc, |&(p, _)| p) {
            Ok(i) => Some(self.line_table[i].1),
            Err(0) => None,
            Err(i) => Some(self.line_table[i - 1].1),
        }
    }
}
