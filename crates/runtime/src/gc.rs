//! Mark-and-Sweep Collector
//!
//! Two reachability bitsets are built per cycle: `reachable` and `deferred`.
//! Marking recurses with a depth cap; objects hit at the cap land in the
//! deferred set, which is then drained to a fixed point so traversal stays
//! stack-bounded on deep graphs.
//!
//! Weak-map semantics: a container entry whose value is the target of a weak
//! reference attached to that container is skipped during marking, so the
//! entry alone never keeps the target alive. When the target dies, the weak
//! reference is cleared and the entry is removed from the container.

use crate::error::FixError;
use crate::handle::WeakRefHandle;
use crate::heap::{ARRAYS_GROW_CUTOFF, Heap};
use crate::object::{Object, ObjFlags, bit_get, bit_set, bit_words};
use fixscript_core::Value;
use tracing::debug;

/// Marking recursion depth cap; deeper objects go to the deferred set.
const MARK_RECURSION_CUTOFF: usize = 1000;

struct MarkState {
    reachable: Vec<u32>,
    deferred: Vec<u32>,
    any_deferred: bool,
}

impl Heap {
    /// Run collection cycles until one completes with no weak-induced
    /// container removals.
    pub fn collect(&mut self) {
        loop {
            if self.collect_internal() == 0 {
                break;
            }
        }
    }

    /// One full mark/sweep cycle. Returns the number of weak-induced
    /// container removals performed.
    pub(crate) fn collect_internal(&mut self) -> usize {
        // Fresh allocations were rooted only until this point.
        self.roots.clear();
        let table_len = self.objects.len();
        let mut state = MarkState {
            reachable: vec![0; bit_words(table_len)],
            deferred: vec![0; bit_words(table_len)],
            any_deferred: false,
        };

        self.mark_roots(&mut state);
        self.drain_deferred(&mut state);

        let removals = self.process_dead_weak_targets(&state);
        for (container, key) in &removals {
            self.remove_weak_entry(*container, *key);
        }

        let freed = self.sweep(&state.reachable);
        self.shrink_table();
        self.adjust_soft_cap();

        debug!(
            freed,
            live_bytes = self.total_size,
            weak_removals = removals.len(),
            "heap collection cycle"
        );
        removals.len()
    }

    fn mark_roots(&self, state: &mut MarkState) {
        // Value stack: reference-flagged slots only, so encoded return PCs
        // and integers are never chased.
        for i in 0..self.stack.len() {
            self.mark_value(self.stack.get(i), 0, state);
        }
        for i in 0..self.globals.len() {
            self.mark_value(self.globals.get(i), 0, state);
        }
        for &idx in &self.roots {
            self.mark_value(Value::object(idx), 0, state);
        }
        for &idx in self.ext_refs.keys() {
            self.mark_value(Value::object(idx), 0, state);
        }
        for script in &self.scripts {
            for &v in &script.const_roots {
                self.mark_value(v, 0, state);
            }
            for &v in script.constants.values() {
                self.mark_value(v, 0, state);
            }
        }
        for (idx, slot) in self.objects.iter().enumerate() {
            if let Some(obj) = slot
                && obj.flags().contains(ObjFlags::STATIC)
            {
                self.mark_value(Value::object(idx), 0, state);
            }
        }
    }

    fn mark_value(&self, v: Value, depth: usize, state: &mut MarkState) {
        let Some(idx) = v.object_index() else {
            return;
        };
        if idx >= self.objects.len() || self.objects[idx].is_none() {
            return;
        }
        if bit_get(&state.reachable, idx) {
            return;
        }
        bit_set(&mut state.reachable, idx, true);
        if depth >= MARK_RECURSION_CUTOFF {
            bit_set(&mut state.deferred, idx, true);
            state.any_deferred = true;
            return;
        }
        self.mark_children(idx, depth, state);
    }

    fn mark_children(&self, idx: usize, depth: usize, state: &mut MarkState) {
        match &self.objects[idx] {
            Some(Object::Array(a)) => {
                if a.shared.is_some() {
                    return;
                }
                let weakly = self.weak_targets_for_container(idx);
                for i in 0..a.len {
                    if !bit_get(&a.ref_bits, i) {
                        continue;
                    }
                    let elem = a.get(i);
                    if !weakly.is_empty() && self.entry_weakly_held(&weakly, Value::int(i as i32), elem)
                    {
                        continue;
                    }
                    self.mark_value(elem, depth + 1, state);
                }
            }
            Some(Object::Hash(h)) => {
                let weakly = self.weak_targets_for_container(idx);
                for entry in 0..h.entry_capacity() {
                    if !bit_get(&h.key_present, entry) {
                        continue;
                    }
                    self.mark_value(h.key_at(entry), depth + 1, state);
                    if !bit_get(&h.has_data, entry) {
                        continue;
                    }
                    let value = h.value_at(entry);
                    if !weakly.is_empty() && self.entry_weakly_held(&weakly, h.key_at(entry), value)
                    {
                        continue;
                    }
                    self.mark_value(value, depth + 1, state);
                }
            }
            Some(Object::Handle(h)) => {
                let mut referenced = Vec::new();
                h.data.mark_refs(&mut |v| referenced.push(v));
                for v in referenced {
                    self.mark_value(v, depth + 1, state);
                }
            }
            None => {}
        }
    }

    fn drain_deferred(&self, state: &mut MarkState) {
        while state.any_deferred {
            state.any_deferred = false;
            let words = state.deferred.len();
            let deferred = std::mem::replace(&mut state.deferred, vec![0; words]);
            for (word_idx, &word) in deferred.iter().enumerate() {
                if word == 0 {
                    continue;
                }
                for bit in 0..32 {
                    if word & (1 << bit) != 0 {
                        self.mark_children(word_idx * 32 + bit, 0, state);
                    }
                }
            }
        }
    }

    /// Weak-ref handle indices attached to `container`.
    fn weak_targets_for_container(&self, container: usize) -> Vec<usize> {
        if self.weak_targets.is_empty() {
            return Vec::new();
        }
        let mut out = Vec::new();
        for refs in self.weak_targets.values() {
            for &w in refs {
                if let Ok(Object::Handle(h)) = self.obj(w)
                    && let Some(wr) = h.data.as_any().downcast_ref::<WeakRefHandle>()
                    && wr.container as usize == container
                {
                    out.push(w);
                }
            }
        }
        out
    }

    /// Whether a container entry `(key, value)` is held only weakly by one
    /// of the weak references in `weakly`.
    fn entry_weakly_held(&self, weakly: &[usize], key: Value, value: Value) -> bool {
        for &w in weakly {
            if let Ok(Object::Handle(h)) = self.obj(w)
                && let Some(wr) = h.data.as_any().downcast_ref::<WeakRefHandle>()
                && wr.target == value.data
                && value.is_ref
                && self.values_equal(wr.key, key).unwrap_or(false)
            {
                return true;
            }
        }
        false
    }

    /// Clear weak references whose target died; collect container removals.
    fn process_dead_weak_targets(&mut self, state: &MarkState) -> Vec<(usize, Value)> {
        let dead: Vec<usize> = self
            .weak_targets
            .keys()
            .copied()
            .filter(|&t| t >= self.objects.len() || !bit_get(&state.reachable, t))
            .collect();
        let mut removals = Vec::new();
        for t in dead {
            let Some(refs) = self.weak_targets.remove(&t) else {
                continue;
            };
            for w in refs {
                let Ok(Object::Handle(h)) = self.obj_mut(w) else {
                    continue;
                };
                let Some(wr) = h.data.as_any_mut().downcast_mut::<WeakRefHandle>() else {
                    continue;
                };
                wr.target = 0;
                let container = wr.container;
                let key = wr.key;
                if container > 0
                    && (container as usize) < self.objects.len()
                    && bit_get(&state.reachable, container as usize)
                {
                    removals.push((container as usize, key));
                }
            }
        }
        removals
    }

    fn remove_weak_entry(&mut self, container: usize, key: Value) {
        let cv = Value::object(container);
        let result: Result<(), FixError> = match self.obj(container) {
            Ok(Object::Hash(_)) => self.remove_hash_elem(cv, key).map(|_| ()),
            Ok(Object::Array(_)) => {
                if key.is_int() && key.data >= 0 {
                    self.remove_array_elem(cv, key.data as usize)
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        };
        // A failed removal leaves the entry for the next cycle.
        let _ = result;
    }

    fn sweep(&mut self, reachable: &[u32]) -> usize {
        let mut freed = 0;
        let mut total = 0usize;
        for idx in 1..self.objects.len() {
            let live = bit_get(reachable, idx) && self.objects[idx].is_some();
            if live {
                total += self.objects[idx].as_ref().map_or(0, |o| o.byte_size());
                continue;
            }
            let Some(obj) = self.objects[idx].take() else {
                continue;
            };
            freed += 1;
            match obj {
                Object::Array(a) => {
                    if let Some(buf) = &a.shared {
                        self.shared_intern.remove(&buf.key());
                        buf.release();
                    } else if a.flags.contains(ObjFlags::CONST) {
                        self.unintern_const_string(&a);
                    }
                }
                Object::Hash(_) => {}
                Object::Handle(h) => {
                    if let Some(wr) = h.data.as_any().downcast_ref::<WeakRefHandle>() {
                        if let Some(list) = self.weak_targets.get_mut(&(wr.target as usize)) {
                            list.retain(|&w| w != idx);
                            if list.is_empty() {
                                self.weak_targets.remove(&(wr.target as usize));
                            }
                        }
                    }
                    // Handle cleanup runs through Drop of the boxed data.
                }
            }
        }
        if self.next_idx >= self.objects.len() {
            self.next_idx = 1;
        }
        self.total_size = total;
        freed
    }

    fn unintern_const_string(&mut self, a: &crate::object::ArrayObj) {
        let hash = crate::strings::content_hash(a);
        let objects = &self.objects;
        if let Some(list) = self.const_strings.get_mut(&hash) {
            // Identity is recovered by content: the freed object was already
            // removed from the table, so prune indices that no longer
            // resolve to a const string.
            list.retain(|&idx| {
                matches!(objects.get(idx), Some(Some(Object::Array(s))) if s.flags.contains(ObjFlags::CONST))
            });
            if list.is_empty() {
                self.const_strings.remove(&hash);
            }
        }
    }

    fn shrink_table(&mut self) {
        let highest = (1..self.objects.len())
            .rev()
            .find(|&i| self.objects[i].is_some())
            .unwrap_or(0);
        let wanted = (highest + 1).next_power_of_two().max(64);
        if self.objects.len() > wanted + ARRAYS_GROW_CUTOFF {
            self.objects.truncate(wanted);
            self.next_idx = self.next_idx.min(wanted);
        }
    }

    fn adjust_soft_cap(&mut self) {
        if self.total_size * 5 > self.soft_cap * 4 {
            self.soft_cap = self.soft_cap.saturating_mul(2);
        } else if self.total_size * 4 < self.soft_cap {
            self.soft_cap = (self.soft_cap / 2).max(256 * 1024);
        }
    }
}
