//! Native Function Registry
//!
//! Native functions are registered under a mangled `name#arity` and called
//! with the heap and a rooted parameter slice. A native returns a value, an
//! error value to raise at the call site, or suspends: the interpreter then
//! bails out to the host, which later delivers a `(result, error)` pair
//! through [`Heap::resume`](crate::Heap::resume).

use crate::heap::Heap;
use fixscript_core::Value;
use std::rc::Rc;

/// Result of one native call.
#[derive(Debug)]
pub enum NativeResult {
    Value(Value),
    Error(Value),
    /// Hand control back to the host; the call completes on resume.
    Suspend,
}

pub type NativeFn = Rc<dyn Fn(&mut Heap, &[Value]) -> NativeResult>;

pub(crate) struct NativeEntry {
    pub name: String,
    pub func: NativeFn,
}

/// Token for resuming a suspended call. A heap holds at most one pending
/// suspension at a time.
#[derive(Debug)]
pub struct Continuation {
    _private: (),
}

impl Continuation {
    pub(crate) fn new() -> Continuation {
        Continuation { _private: () }
    }
}

impl Heap {
    /// Call a registered native directly from the host. Suspension is not
    /// supported through this path.
    pub fn call_native(
        &mut self,
        name: &str,
        args: &[Value],
    ) -> Result<Value, crate::ScriptError> {
        let id = self
            .find_native(name)
            .ok_or_else(|| crate::ScriptError::new(Value::ZERO, format!("unknown native {}", name)))?;
        let func = self.natives[id].func.clone();
        match func.as_ref()(self, args) {
            NativeResult::Value(v) => Ok(v),
            NativeResult::Error(e) => {
                let message = self.error_message(e);
                Err(crate::ScriptError::new(e, message))
            }
            NativeResult::Suspend => Err(crate::ScriptError::new(
                Value::ZERO,
                "native suspended outside the interpreter".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_native_directly() {
        let mut heap = Heap::new();
        let arr = heap.create_array(3).unwrap();
        let len = heap.call_native("length#1", &[arr]).unwrap();
        assert_eq!(len, Value::int(3));
        assert!(heap.call_native("missing#0", &[]).is_err());
    }
}
