//! Runtime Error Kinds
//!
//! All heap and array operations return a status distinct from the value;
//! the interpreter converts these statuses into script-level error values
//! (a two-element array of `[message, stack_trace]`) at opcode boundaries.

use fixscript_core::Value;
use thiserror::Error;

/// Status codes for fallible engine operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FixError {
    #[error("invalid access")]
    InvalidAccess,
    #[error("invalid byte array element")]
    InvalidByteArray,
    #[error("invalid short array element")]
    InvalidShortArray,
    #[error("invalid null string")]
    InvalidNullString,
    #[error("write to constant string")]
    ConstWrite,
    #[error("out of bounds access")]
    OutOfBounds,
    #[error("out of memory")]
    OutOfMemory,
    #[error("invalid use of shared array")]
    InvalidShared,
    #[error("key not found")]
    KeyNotFound,
    #[error("recursion limit exceeded")]
    RecursionLimit,
    #[error("unserializable reference")]
    UnserializableRef,
    #[error("bad format")]
    BadFormat,
    #[error("function reference loading failed")]
    FuncRefLoad,
    #[error("weak reference to weak reference")]
    NestedWeakRef,
    #[error("integer overflow")]
    IntegerOverflow,
    #[error("division by zero")]
    DivisionByZero,
    #[error("stack overflow")]
    StackOverflow,
    #[error("execution stopped")]
    ExecutionStop,
    #[error("execution time limit reached")]
    TimeLimit,
    #[error("improper parameters passed to function")]
    ImproperParams,
    #[error("native function not present")]
    NativeNotPresent,
}

/// Error delivered to the embedder when a script-level call propagates an
/// error to the top of the interpreter. Carries the raw error value (valid
/// in the originating heap) and a rendered message.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ScriptError {
    pub value: Value,
    pub message: String,
}

impl ScriptError {
    pub fn new(value: Value, message: String) -> ScriptError {
        ScriptError { value, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        assert_eq!(FixError::IntegerOverflow.to_string(), "integer overflow");
        assert_eq!(FixError::DivisionByZero.to_string(), "division by zero");
        assert!(FixError::TimeLimit.to_string().contains("execution time limit"));
    }
}
