//! FixScript runtime: managed heap, collector, and bytecode interpreter
//!
//! Key design principles:
//! - Heap: one indexed object table per execution context, single-threaded
//! - Value: unboxed integer/float or an index into the object table
//! - Collector: mark-and-sweep with stack-bounded traversal and weak-map
//!   semantics for weak references with containers
//! - Interpreter: typed value stack with a two-result call/error protocol
//!
//! The compiler crate layers the tokenizer, parser and metacircular script
//! API on top of this crate through public registration hooks
//! ([`Heap::set_load_fn`], [`Heap::register_native`], [`Heap::append_bytecode`]).

pub mod array;
pub mod builtins;
pub mod clone;
pub mod error;
pub mod gc;
pub mod handle;
pub mod hash;
pub mod heap;
pub mod interp;
pub mod native;
pub mod object;
pub mod script;
pub mod serialize;
pub mod strings;
pub mod value_ops;

// Re-export key types
pub use array::{ArrayLock, LockAccess};
pub use error::{FixError, ScriptError};
pub use handle::{HANDLE_TYPE_FUNC_REF, HANDLE_TYPE_WEAK_REF, FuncRefHandle, HandleOps};
pub use heap::Heap;
pub use interp::CallOutcome;
pub use native::{Continuation, NativeFn, NativeResult};
pub use script::{Function, LoadScriptFn, Script};

// The core value model is part of this crate's API surface
pub use fixscript_core::{FUNC_REF_OFFSET, SharedBuffer, SharedBufferRef, Value};
