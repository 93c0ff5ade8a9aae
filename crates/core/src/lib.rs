//! FixScript core: the value model and bytecode foundation
//!
//! Key design principles:
//! - Value: a 33-bit tagged datum (32-bit payload + reference flag)
//! - ValueStack: parallel data/flags arrays, the layout the interpreter
//!   and the code generator both rely on
//! - Bytecode: opcode definitions shared by the compiler and the interpreter
//! - SharedBuffer: the only cross-thread state in the engine

pub mod bytecode;
pub mod counters;
pub mod shared;
pub mod stack;
pub mod value;

pub use counters::{next_handle_type, next_heap_key};
pub use shared::{SharedBuffer, SharedBufferRef};
pub use stack::{FLAG_REF, ValueStack};
pub use value::{FUNC_REF_OFFSET, MAX_OBJECTS, Value, canonical_nan, flush_denormal};
