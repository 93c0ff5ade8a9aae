//! The Managed Heap
//!
//! A heap owns the object table, the execution stacks, the compiled
//! bytecode, the script and native registries, and every per-heap intern
//! table. Heaps are single-threaded: all entry points assume the caller
//! holds exclusive access. The only cross-thread state is the shared-buffer
//! refcount and the stop flag.
//!
//! Object lifecycle: objects are created by the `create_*` operations and
//! become reclaimable when no root reaches them. External roots are explicit
//! `add_ref`/`unref` pairs; internal roots are the value stack, the globals
//! area, script constants, and an auxiliary root vector populated by the
//! allocator so fresh objects survive until the next collection.

use crate::error::FixError;
use crate::native::NativeEntry;
use crate::object::{ArrayObj, Object};
use crate::script::{Function, LoadScriptFn, Script};
use fixscript_core::bytecode::MAX_BYTECODE;
use fixscript_core::{MAX_OBJECTS, Value, ValueStack};
use rustc_hash::FxHashMap;
use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Object tables at or below this size double on growth; larger tables grow
/// linearly by this amount.
pub(crate) const ARRAYS_GROW_CUTOFF: usize = 4096;

/// External reference counts saturate at 24 bits and then pin the object.
const EXT_REF_SATURATED: u32 = (1 << 24) - 1;

/// Initial soft cap for tracked heap bytes.
const INITIAL_SOFT_CAP: usize = 256 * 1024;

/// Saved interpreter position while a native suspension is pending.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SuspendState {
    pub resume_pc: u32,
    pub push_result: bool,
    pub host_base: u32,
    pub host_depth: u32,
}

pub struct Heap {
    pub(crate) objects: Vec<Option<Object>>,
    pub(crate) next_idx: usize,
    pub(crate) ext_refs: FxHashMap<usize, u32>,
    pub(crate) roots: Vec<usize>,
    /// target object index -> weak-ref handle indices
    pub(crate) weak_targets: FxHashMap<usize, Vec<usize>>,
    /// content hash -> interned const string indices
    pub(crate) const_strings: FxHashMap<u64, Vec<usize>>,
    /// shared buffer identity -> view object index
    pub(crate) shared_intern: FxHashMap<usize, usize>,
    pub(crate) total_size: usize,
    pub(crate) soft_cap: usize,

    pub(crate) stack: ValueStack,
    pub(crate) globals: ValueStack,
    /// (return_pc_on_error, frame_base) pairs for the CALL2 protocol
    pub(crate) error_stack: Vec<(u32, u32)>,
    pub(crate) code: Vec<u8>,
    pub(crate) functions: Vec<Function>,
    pub(crate) scripts: Vec<Script>,
    pub(crate) script_names: FxHashMap<String, usize>,
    pub(crate) natives: Vec<NativeEntry>,
    pub(crate) native_names: FxHashMap<String, usize>,

    pub(crate) time_limit: Option<Duration>,
    pub(crate) deadline: Option<Instant>,
    pub(crate) time_counter: u32,
    pub(crate) stop_flag: Arc<AtomicBool>,
    pub(crate) auto_suspend: Option<u32>,
    pub(crate) suspended: Option<SuspendState>,

    pub(crate) load_fn: Option<LoadScriptFn>,
    heap_data: FxHashMap<usize, Box<dyn Any>>,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Heap {
        let mut heap = Heap {
            objects: {
                let mut v = Vec::with_capacity(64);
                // index 0 is reserved
                v.resize_with(64, || None);
                v
            },
            next_idx: 1,
            ext_refs: FxHashMap::default(),
            roots: Vec::new(),
            weak_targets: FxHashMap::default(),
            const_strings: FxHashMap::default(),
            shared_intern: FxHashMap::default(),
            total_size: 0,
            soft_cap: INITIAL_SOFT_CAP,
            stack: ValueStack::new(
                fixscript_core::stack::DEFAULT_STACK_CAPACITY,
                fixscript_core::stack::DEFAULT_MAX_STACK,
            ),
            globals: ValueStack::new(64, 1 << 20),
            error_stack: Vec::new(),
            code: vec![0],
            functions: Vec::new(),
            scripts: Vec::new(),
            script_names: FxHashMap::default(),
            natives: Vec::new(),
            native_names: FxHashMap::default(),
            time_limit: None,
            deadline: None,
            time_counter: 0,
            stop_flag: Arc::new(AtomicBool::new(false)),
            auto_suspend: None,
            suspended: None,
            load_fn: None,
            heap_data: FxHashMap::default(),
        };
        crate::builtins::register_builtins(&mut heap);
        heap
    }

    // ---------------------------------------------------------------------
    // Object table
    // ---------------------------------------------------------------------

    /// Install an object, collecting and growing the table as needed.
    pub(crate) fn alloc_object(&mut self, obj: Object) -> Result<usize, FixError> {
        let size = obj.byte_size();
        if self.total_size.saturating_add(size) > self.soft_cap {
            self.collect_internal();
        }
        let idx = self.find_free_slot()?;
        self.objects[idx] = Some(obj);
        self.next_idx = idx + 1;
        self.total_size += size;
        self.roots.push(idx);
        Ok(idx)
    }

    fn find_free_slot(&mut self) -> Result<usize, FixError> {
        if let Some(idx) = self.scan_free(self.next_idx) {
            return Ok(idx);
        }
        if let Some(idx) = self.scan_free(1) {
            return Ok(idx);
        }
        self.collect_internal();
        if let Some(idx) = self.scan_free(1) {
            return Ok(idx);
        }
        let old = self.objects.len();
        if old >= MAX_OBJECTS {
            return Err(FixError::OutOfMemory);
        }
        let new_len = if old <= ARRAYS_GROW_CUTOFF {
            old * 2
        } else {
            old + ARRAYS_GROW_CUTOFF
        }
        .min(MAX_OBJECTS);
        self.objects.resize_with(new_len, || None);
        Ok(old)
    }

    fn scan_free(&self, from: usize) -> Option<usize> {
        (from.max(1)..self.objects.len()).find(|&i| self.objects[i].is_none())
    }

    #[inline]
    pub(crate) fn obj(&self, idx: usize) -> Result<&Object, FixError> {
        self.objects
            .get(idx)
            .and_then(|o| o.as_ref())
            .ok_or(FixError::InvalidAccess)
    }

    #[inline]
    pub(crate) fn obj_mut(&mut self, idx: usize) -> Result<&mut Object, FixError> {
        self.objects
            .get_mut(idx)
            .and_then(|o| o.as_mut())
            .ok_or(FixError::InvalidAccess)
    }

    #[inline]
    pub(crate) fn index_of(&self, v: Value) -> Result<usize, FixError> {
        v.object_index().ok_or(FixError::InvalidAccess)
    }

    pub(crate) fn array_of(&self, v: Value) -> Result<&ArrayObj, FixError> {
        match self.obj(self.index_of(v)?)? {
            Object::Array(a) => Ok(a),
            _ => Err(FixError::InvalidAccess),
        }
    }

    pub(crate) fn array_of_mut(&mut self, v: Value) -> Result<&mut ArrayObj, FixError> {
        match self.obj_mut(self.index_of(v)?)? {
            Object::Array(a) => Ok(a),
            _ => Err(FixError::InvalidAccess),
        }
    }

    /// Whether the value references a live object of any kind.
    pub fn is_valid(&self, v: Value) -> bool {
        v.object_index()
            .is_some_and(|idx| self.objects.get(idx).is_some_and(|o| o.is_some()))
    }

    pub fn is_array(&self, v: Value) -> bool {
        self.index_of(v)
            .and_then(|i| self.obj(i))
            .is_ok_and(|o| matches!(o, Object::Array(_)))
    }

    pub fn is_string(&self, v: Value) -> bool {
        self.index_of(v)
            .and_then(|i| self.obj(i))
            .is_ok_and(|o| matches!(o, Object::Array(a) if a.is_string()))
    }

    pub fn is_hash(&self, v: Value) -> bool {
        self.index_of(v)
            .and_then(|i| self.obj(i))
            .is_ok_and(|o| matches!(o, Object::Hash(_)))
    }

    pub fn is_handle(&self, v: Value) -> bool {
        self.index_of(v)
            .and_then(|i| self.obj(i))
            .is_ok_and(|o| matches!(o, Object::Handle(_)))
    }

    pub fn is_shared_array(&self, v: Value) -> bool {
        self.index_of(v)
            .and_then(|i| self.obj(i))
            .is_ok_and(|o| matches!(o, Object::Array(a) if a.is_shared()))
    }

    /// Account a storage growth or shrink against the soft cap.
    #[inline]
    pub(crate) fn note_size_change(&mut self, old: usize, new: usize) {
        self.total_size = self.total_size.saturating_sub(old).saturating_add(new);
    }

    // ---------------------------------------------------------------------
    // External roots
    // ---------------------------------------------------------------------

    /// Add an external reference. Counts saturate at 24 bits and then pin
    /// the object for the heap's lifetime.
    pub fn add_ref(&mut self, v: Value) {
        if let Some(idx) = v.object_index()
            && self.is_valid(v)
        {
            let cnt = self.ext_refs.entry(idx).or_insert(0);
            if *cnt < EXT_REF_SATURATED {
                *cnt += 1;
            }
        }
    }

    /// Remove an external reference. Saturated counters never decrement.
    pub fn unref(&mut self, v: Value) {
        if let Some(idx) = v.object_index()
            && let Some(cnt) = self.ext_refs.get_mut(&idx)
        {
            if *cnt >= EXT_REF_SATURATED {
                return;
            }
            *cnt -= 1;
            if *cnt == 0 {
                self.ext_refs.remove(&idx);
            }
        }
    }

    /// Advisory marker for user-critical objects.
    pub fn set_protected(&mut self, v: Value, protected: bool) -> Result<(), FixError> {
        let idx = self.index_of(v)?;
        let flags = self.obj_mut(idx)?.flags_mut();
        flags.set(crate::object::ObjFlags::PROTECTED, protected);
        Ok(())
    }

    pub fn is_protected(&self, v: Value) -> Result<bool, FixError> {
        let idx = self.index_of(v)?;
        Ok(self
            .obj(idx)?
            .flags()
            .contains(crate::object::ObjFlags::PROTECTED))
    }

    // ---------------------------------------------------------------------
    // Heap-local storage
    // ---------------------------------------------------------------------

    /// Stash per-heap data under a process-stable key (allocate keys with
    /// [`fixscript_core::next_heap_key`]).
    pub fn set_heap_data(&mut self, key: usize, data: Box<dyn Any>) {
        self.heap_data.insert(key, data);
    }

    pub fn heap_data<T: 'static>(&self, key: usize) -> Option<&T> {
        self.heap_data.get(&key).and_then(|d| d.downcast_ref())
    }

    pub fn heap_data_mut<T: 'static>(&mut self, key: usize) -> Option<&mut T> {
        self.heap_data.get_mut(&key).and_then(|d| d.downcast_mut())
    }

    // ---------------------------------------------------------------------
    // Execution limits
    // ---------------------------------------------------------------------

    /// Configure the execution time limit. Functions compiled while a limit
    /// is configured check it at loop back-edges.
    pub fn set_time_limit(&mut self, limit: Option<Duration>) {
        self.time_limit = limit;
        self.deadline = limit.map(|d| Instant::now() + d);
        self.time_counter = 0;
    }

    pub fn has_time_limit(&self) -> bool {
        self.time_limit.is_some()
    }

    /// Request a clean abort. The next time-limit check raises a
    /// script-level error. Safe to call from another thread through the
    /// handle returned by [`stop_handle`](Self::stop_handle).
    pub fn stop_execution(&self) {
        self.stop_flag.store(true, Ordering::Release);
    }

    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop_flag.clone()
    }

    /// Suspend automatically every `n` instructions to cooperate with a
    /// host event loop.
    pub fn set_auto_suspend(&mut self, n: Option<u32>) {
        self.auto_suspend = n;
    }

    // ---------------------------------------------------------------------
    // Scripts, functions, natives
    // ---------------------------------------------------------------------

    /// Append compiled bytecode, returning its base offset. The total code
    /// size is capped at 2^23 bytes because return addresses embed the PC.
    pub fn append_bytecode(&mut self, code: &[u8]) -> Result<u32, FixError> {
        if self.code.len() + code.len() > MAX_BYTECODE {
            return Err(FixError::OutOfMemory);
        }
        let base = self.code.len() as u32;
        self.code.extend_from_slice(code);
        Ok(base)
    }

    pub fn bytecode(&self) -> &[u8] {
        &self.code
    }

    pub fn add_function(&mut self, func: Function) -> usize {
        self.functions.push(func);
        self.functions.len() - 1
    }

    /// Replace a function slot in place, preserving its id. Used by script
    /// reload so existing function references stay valid.
    pub fn replace_function(&mut self, id: usize, func: Function) {
        self.functions[id] = func;
    }

    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    pub fn function(&self, id: usize) -> Option<&Function> {
        self.functions.get(id)
    }

    pub fn register_script(&mut self, script: Script) -> usize {
        let id = self.scripts.len();
        self.script_names.insert(script.name.clone(), id);
        self.scripts.push(script);
        id
    }

    /// Re-key a script under a new name (reload bookkeeping).
    pub fn rename_script(&mut self, id: usize, new_name: String) {
        let old = std::mem::replace(&mut self.scripts[id].name, new_name.clone());
        self.script_names.remove(&old);
        self.script_names.insert(new_name, id);
    }

    pub fn script_by_name(&self, name: &str) -> Option<usize> {
        self.script_names.get(name).copied()
    }

    pub fn script(&self, id: usize) -> &Script {
        &self.scripts[id]
    }

    pub fn script_mut(&mut self, id: usize) -> &mut Script {
        &mut self.scripts[id]
    }

    pub fn scripts_len(&self) -> usize {
        self.scripts.len()
    }

    /// Allocate a script-variable slot in the globals area.
    pub fn alloc_global(&mut self) -> Result<usize, FixError> {
        let idx = self.globals.len();
        if !self.globals.grow_to(idx + 1) {
            return Err(FixError::OutOfMemory);
        }
        Ok(idx)
    }

    pub fn global(&self, idx: usize) -> Value {
        self.globals.get(idx)
    }

    pub fn set_global(&mut self, idx: usize, v: Value) {
        self.globals.set(idx, v);
    }

    /// Register a native function under its mangled `name#arity` form.
    pub fn register_native(
        &mut self,
        name: &str,
        func: impl Fn(&mut Heap, &[Value]) -> crate::native::NativeResult + 'static,
    ) {
        let id = self.natives.len();
        self.natives.push(NativeEntry {
            name: name.to_string(),
            func: std::rc::Rc::new(func),
        });
        self.native_names.insert(name.to_string(), id);
    }

    pub fn find_native(&self, name: &str) -> Option<usize> {
        self.native_names.get(name).copied()
    }

    pub fn native_name(&self, id: usize) -> Option<&str> {
        self.natives.get(id).map(|n| n.name.as_str())
    }

    /// Install the script loader used by `import`, `use` and the
    /// metacircular operations. Must be idempotent for the same name.
    pub fn set_load_fn(&mut self, f: LoadScriptFn) {
        self.load_fn = Some(f);
    }

    /// Resolve a script by name, loading it through the registered loader
    /// when it is not present yet.
    pub fn load_script(&mut self, name: &str) -> Result<usize, String> {
        if let Some(id) = self.script_by_name(name) {
            return Ok(id);
        }
        let load = self
            .load_fn
            .clone()
            .ok_or_else(|| format!("script {} is not loaded and no loader is set", name))?;
        load(self, name)
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        // Release shared views explicitly; handle cleanup runs through Drop
        // of the boxed handle data.
        for slot in &mut self.objects {
            if let Some(Object::Array(a)) = slot
                && let Some(buf) = &a.shared
            {
                buf.release();
            }
        }
    }
}
