//! Shared Array Buffers
//!
//! A shared array's backing storage lives in a separately allocated header
//! that multiple heaps may reference. The header carries the only
//! cross-thread state in the engine: an atomic reference count with a
//! saturation sentinel. Element reads and writes are raw and unsynchronised;
//! the engine-level contract is that concurrent access is limited to scalar
//! elements and races on the same element yield one of the written values.
//!
//! Memory management is layered: the script-visible count decides when the
//! optional free hook runs, while the `Arc` in [`SharedBufferRef`] keeps the
//! header itself alive for as long as any heap holds a view. A saturated
//! count leaks one `Arc` clone, pinning the buffer for the process lifetime.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Reference counts saturate here and never decrement afterwards.
pub const REFCNT_SATURATED: u32 = (1 << 30) - 1;

type FreeHook = Box<dyn Fn() + Send + Sync>;

/// Header of a shared backing buffer.
pub struct SharedBuffer {
    type_tag: i32,
    refcnt: AtomicU32,
    ptr: *mut u8,
    len: usize,
    elem_size: usize,
    free_hook: Option<FreeHook>,
}

// Safety: the buffer pointer is owned by this header for its whole lifetime
// and freed exactly once in Drop. Element access is unsynchronised by
// documented contract (scalar cross-heap channel); all other fields are
// immutable or atomic.
unsafe impl Send for SharedBuffer {}
unsafe impl Sync for SharedBuffer {}

impl SharedBuffer {
    #[inline]
    pub fn type_tag(&self) -> i32 {
        self.type_tag
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn elem_size(&self) -> usize {
        self.elem_size
    }

    #[inline]
    pub fn refcnt(&self) -> u32 {
        self.refcnt.load(Ordering::Acquire)
    }

    /// Read the element at `idx`, widened to i32.
    #[inline]
    pub fn read(&self, idx: usize) -> i32 {
        assert!(idx < self.len);
        unsafe {
            match self.elem_size {
                1 => *self.ptr.add(idx) as i32,
                2 => *(self.ptr as *const u16).add(idx) as i32,
                _ => *(self.ptr as *const i32).add(idx),
            }
        }
    }

    /// Write the element at `idx`, truncating to the element width.
    #[inline]
    pub fn write(&self, idx: usize, v: i32) {
        assert!(idx < self.len);
        unsafe {
            match self.elem_size {
                1 => *self.ptr.add(idx) = v as u8,
                2 => *(self.ptr as *mut u16).add(idx) = v as u16,
                _ => *(self.ptr as *mut i32).add(idx) = v,
            }
        }
    }

    /// Increment the script-visible count. Returns true on the transition
    /// into saturation, at which point the caller must pin the buffer.
    fn retain(&self) -> bool {
        loop {
            let cur = self.refcnt.load(Ordering::Relaxed);
            if cur >= REFCNT_SATURATED {
                return false;
            }
            let next = cur + 1;
            if self
                .refcnt
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return next == REFCNT_SATURATED;
            }
        }
    }

    /// Decrement the script-visible count. Saturated counts never decrement.
    /// Runs the free hook on the 1 -> 0 transition.
    fn release(&self) {
        loop {
            let cur = self.refcnt.load(Ordering::Relaxed);
            if cur >= REFCNT_SATURATED || cur == 0 {
                return;
            }
            if self
                .refcnt
                .compare_exchange_weak(cur, cur - 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                if cur == 1
                    && let Some(hook) = &self.free_hook
                {
                    hook();
                }
                return;
            }
        }
    }
}

impl Drop for SharedBuffer {
    fn drop(&mut self) {
        if !self.ptr.is_null() && self.len > 0 {
            let layout = Layout::from_size_align(self.len * self.elem_size, 4)
                .expect("shared buffer layout");
            unsafe { dealloc(self.ptr, layout) };
        }
    }
}

/// Reference-counted handle to a shared buffer held by one heap view.
#[derive(Clone)]
pub struct SharedBufferRef(Arc<SharedBuffer>);

impl SharedBufferRef {
    /// Allocate a zeroed buffer of `len` elements of `elem_size` bytes
    /// (1, 2 or 4). The initial script-visible count is 1.
    pub fn new(type_tag: i32, len: usize, elem_size: usize) -> Option<SharedBufferRef> {
        Self::build(type_tag, len, elem_size, None)
    }

    /// As [`new`](Self::new), with a hook run when the script-visible count
    /// reaches zero.
    pub fn with_free_hook(
        type_tag: i32,
        len: usize,
        elem_size: usize,
        hook: FreeHook,
    ) -> Option<SharedBufferRef> {
        Self::build(type_tag, len, elem_size, Some(hook))
    }

    fn build(
        type_tag: i32,
        len: usize,
        elem_size: usize,
        free_hook: Option<FreeHook>,
    ) -> Option<SharedBufferRef> {
        assert!(matches!(elem_size, 1 | 2 | 4));
        let ptr = if len == 0 {
            std::ptr::null_mut()
        } else {
            let layout = Layout::from_size_align(len.checked_mul(elem_size)?, 4).ok()?;
            let ptr = unsafe { alloc_zeroed(layout) };
            if ptr.is_null() {
                return None;
            }
            ptr
        };
        Some(SharedBufferRef(Arc::new(SharedBuffer {
            type_tag,
            refcnt: AtomicU32::new(1),
            ptr,
            len,
            elem_size,
            free_hook,
        })))
    }

    /// Increment the script-visible count, pinning the buffer on saturation.
    pub fn retain(&self) {
        if self.0.retain() {
            // Saturation pins the buffer for the process lifetime
            std::mem::forget(self.0.clone());
        }
    }

    pub fn release(&self) {
        self.0.release();
    }

    /// Stable identity of the backing buffer, used by the per-heap intern
    /// map to guarantee at most one view per (heap, buffer).
    #[inline]
    pub fn key(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }
}

impl std::fmt::Debug for SharedBufferRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBufferRef")
            .field("type_tag", &self.0.type_tag)
            .field("len", &self.0.len)
            .field("elem_size", &self.0.elem_size)
            .finish()
    }
}

impl std::ops::Deref for SharedBufferRef {
    type Target = SharedBuffer;

    fn deref(&self) -> &SharedBuffer {
        &self.0
    }
}
