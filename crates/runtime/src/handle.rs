//! Opaque Handles
//!
//! A handle stores host-managed data in the heap, parameterised by a 32-bit
//! type tag and an operations vtable. In this implementation the vtable is
//! the [`HandleOps`] trait; releasing the handle during sweep drops the box,
//! so cleanup lives in `Drop` implementations.
//!
//! Two type tags are reserved by the engine: function-reference handles
//! (used when a function reference outlives its declaring script or crosses
//! heaps) and weak-reference handles.

use fixscript_core::Value;
use std::any::Any;

/// Reserved tag for function-reference handles.
pub const HANDLE_TYPE_FUNC_REF: i32 = -1;

/// Reserved tag for weak-reference handles.
pub const HANDLE_TYPE_WEAK_REF: i32 = -2;

/// Operations vtable for opaque handles. Every method has a default, so a
/// plain resource handle only implements `type_tag`.
pub trait HandleOps: Any {
    /// The 32-bit type tag (allocate user tags with
    /// [`fixscript_core::next_handle_type`]).
    fn type_tag(&self) -> i32;

    /// Structural comparison against another handle of the same type tag.
    /// Identity equality is handled before this is consulted.
    fn compare(&self, _other: &dyn HandleOps) -> bool {
        false
    }

    /// Content hash. Handles that implement `compare` should override this
    /// so equal handles hash alike.
    fn value_hash(&self) -> u32 {
        self.type_tag() as u32
    }

    /// Printable form used by string building and error messages.
    fn to_display(&self) -> Option<String> {
        None
    }

    /// Report values this handle keeps alive to the collector.
    fn mark_refs(&self, _marker: &mut dyn FnMut(Value)) {}

    /// Duplicate the handle data for serialization or cross-heap clone.
    /// Handles that return `None` are unserializable.
    fn copy(&self) -> Option<Box<dyn HandleOps>> {
        None
    }

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Handle data for a function reference detached from its heap, stored as
/// the `(script_name, func_name)` pair that resolves back to a function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuncRefHandle {
    pub script_name: String,
    pub func_name: String,
}

impl HandleOps for FuncRefHandle {
    fn type_tag(&self) -> i32 {
        HANDLE_TYPE_FUNC_REF
    }

    fn compare(&self, other: &dyn HandleOps) -> bool {
        other
            .as_any()
            .downcast_ref::<FuncRefHandle>()
            .is_some_and(|o| o == self)
    }

    fn value_hash(&self) -> u32 {
        let mut h = 0u32;
        for b in self.script_name.bytes().chain(self.func_name.bytes()) {
            h = h.wrapping_mul(31).wrapping_add(b as u32);
        }
        h
    }

    fn to_display(&self) -> Option<String> {
        Some(format!("<{}:{}>", self.script_name, self.func_name))
    }

    fn copy(&self) -> Option<Box<dyn HandleOps>> {
        Some(Box::new(self.clone()))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Handle data for a weak reference. `target` is an object table index or 0
/// once cleared. When the target is collected and a container is attached,
/// the engine also removes `key` from the container (hash key or array
/// element), realizing weak-map semantics.
#[derive(Debug)]
pub struct WeakRefHandle {
    pub target: i32,
    pub container: i32,
    pub key: Value,
}

impl HandleOps for WeakRefHandle {
    fn type_tag(&self) -> i32 {
        HANDLE_TYPE_WEAK_REF
    }

    fn mark_refs(&self, marker: &mut dyn FnMut(Value)) {
        // The target is deliberately not marked. The container and key are
        // strong: they must outlive the weak reference for cleanup to work.
        if self.container > 0 {
            marker(Value::object(self.container as usize));
        }
        if self.key.is_ref {
            marker(self.key);
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl crate::heap::Heap {
    /// Store host-managed data as a handle object.
    pub fn create_handle(&mut self, data: Box<dyn HandleOps>) -> Result<Value, crate::FixError> {
        let idx = self.alloc_object(crate::object::Object::Handle(crate::object::HandleObj {
            data,
            flags: crate::object::ObjFlags::empty(),
        }))?;
        Ok(Value::object(idx))
    }

    pub fn handle_type(&self, v: Value) -> Result<i32, crate::FixError> {
        match self.obj(self.index_of(v)?)? {
            crate::object::Object::Handle(h) => Ok(h.data.type_tag()),
            _ => Err(crate::FixError::InvalidAccess),
        }
    }

    /// Downcast access to the handle data.
    pub fn handle_data<T: 'static>(&self, v: Value) -> Result<&T, crate::FixError> {
        match self.obj(self.index_of(v)?)? {
            crate::object::Object::Handle(h) => h
                .data
                .as_any()
                .downcast_ref()
                .ok_or(crate::FixError::InvalidAccess),
            _ => Err(crate::FixError::InvalidAccess),
        }
    }

    pub fn handle_data_mut<T: 'static>(&mut self, v: Value) -> Result<&mut T, crate::FixError> {
        match self.obj_mut(self.index_of(v)?)? {
            crate::object::Object::Handle(h) => h
                .data
                .as_any_mut()
                .downcast_mut()
                .ok_or(crate::FixError::InvalidAccess),
            _ => Err(crate::FixError::InvalidAccess),
        }
    }

    /// Create a weak reference to `target`, optionally associated with a
    /// container entry (`container[key]`) that is dropped when the target
    /// is collected. Weak references to weak references are rejected.
    pub fn create_weak_ref(
        &mut self,
        target: Value,
        container: Option<Value>,
        key: Option<Value>,
    ) -> Result<Value, crate::FixError> {
        let target_idx = self.index_of(target)?;
        if matches!(self.obj(target_idx)?, crate::object::Object::Handle(h)
            if h.data.type_tag() == HANDLE_TYPE_WEAK_REF)
        {
            return Err(crate::FixError::NestedWeakRef);
        }
        let container_idx = match container {
            Some(c) => self.index_of(c)? as i32,
            None => 0,
        };
        let w = self.create_handle(Box::new(WeakRefHandle {
            target: target_idx as i32,
            container: container_idx,
            key: key.unwrap_or(Value::ZERO),
        }))?;
        self.obj_mut(target_idx)?
            .flags_mut()
            .insert(crate::object::ObjFlags::HAS_WEAK_REFS);
        self.weak_targets
            .entry(target_idx)
            .or_default()
            .push(w.object_index().ok_or(crate::FixError::InvalidAccess)?);
        Ok(w)
    }

    /// Dereference a weak reference: the target value, or integer zero once
    /// the target has been collected.
    pub fn weak_ref_get(&self, w: Value) -> Result<Value, crate::FixError> {
        let wr: &WeakRefHandle = self.handle_data(w)?;
        if wr.target > 0 && self.is_valid(Value::object(wr.target as usize)) {
            Ok(Value::object(wr.target as usize))
        } else {
            Ok(Value::ZERO)
        }
    }
}
