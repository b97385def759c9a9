//! A thread-caching drop-in memory allocator.
//!
//! `stealloc` replaces the platform `malloc`/`free`/`calloc`/`realloc`
//! family for programs that mix many small allocations with occasional large
//! ones. Small requests are rounded into one of 64 size classes and served
//! from per-thread page-blocks with a bump pointer and a local free LIFO, so
//! the hot paths take no locks and touch no shared state. Frees from other
//! threads are published through one atomic word per block; when a thread
//! exits with live blocks, those blocks are orphaned and the next thread to
//! free into one adopts it wholesale ("page stealing"). Requests of half a
//! page and up bypass the class machinery and map their own pages.
//!
//! Retired page-blocks flow through a three-tier supply chain (thread-local
//! cache, then a global lock-free freelist, then the OS), so a hot thread
//! rarely reaches the kernel.
//!
//! ```
//! use stealloc::Stealloc;
//!
//! let p = Stealloc.allocate(64).expect("out of memory");
//! unsafe {
//!     p.as_ptr().write_bytes(0xa5, 64);
//!     Stealloc.release(p);
//! }
//! ```
//!
//! The handle also implements [`GlobalAlloc`] for alignments up to 16:
//!
//! ```no_run
//! use stealloc::Stealloc;
//!
//! #[global_allocator]
//! static A: Stealloc = Stealloc;
//! ```
//!
//! With the `c` feature the crate additionally exports `malloc`-compatible
//! C symbols, so a `cdylib` build can interpose via `LD_PRELOAD`.

mod base;
mod block;
#[cfg(feature = "c")]
mod c;
mod class;
mod header;
mod heap;
mod list;
mod stack;
mod stat;
mod track;

use core::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
};

/// Every payload is aligned to this many bytes.
pub const ALIGNMENT: usize = 16;

/// The allocator handle. A unit type: all state lives in thread-local heaps
/// and process-wide freelists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Stealloc;

impl Stealloc {
    /// Allocates `size` bytes, aligned to [`ALIGNMENT`].
    ///
    /// Returns `None` for zero-size requests and when the OS refuses memory.
    #[inline]
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        heap::with(|heap| heap.allocate(size))
    }

    /// Allocates `count * size` zero-filled bytes.
    ///
    /// Returns `None` when the product overflows, is zero, or memory runs
    /// out.
    #[inline]
    pub fn allocate_zeroed(&self, count: usize, size: usize) -> Option<NonNull<u8>> {
        heap::with(|heap| heap.allocate_zeroed(count, size))
    }

    /// Resizes an allocation, preserving its contents.
    ///
    /// A `None` pointer behaves as [`allocate`](Self::allocate). Shrinking
    /// (or staying) within the current slot returns the same pointer; growth
    /// allocates, copies, and releases the old block. On failure the old
    /// allocation is untouched and remains valid.
    ///
    /// # Safety
    ///
    /// `payload`, when present, must be a live allocation from this
    /// allocator; if a different pointer is returned, the old one must not
    /// be used again.
    #[inline]
    pub unsafe fn reallocate(
        &self,
        payload: Option<NonNull<u8>>,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        heap::with(|heap| unsafe { heap.reallocate(payload, new_size) })
    }

    /// Releases an allocation.
    ///
    /// A corrupt or doubly-freed header is unrecoverable: a diagnostic goes
    /// to stderr and the process aborts.
    ///
    /// # Safety
    ///
    /// `payload` must be a live allocation from this allocator and must not
    /// be used after the call.
    #[inline]
    pub unsafe fn release(&self, payload: NonNull<u8>) {
        heap::with(|heap| unsafe { heap.release(payload) })
    }

    /// Writes allocator statistics to stdout; a no-op without the `stat`
    /// feature.
    pub fn debug_stats(&self) {
        #[cfg(feature = "stat")]
        heap::with(|heap| heap.debug_stats());
    }
}

// SAFETY: payloads are valid for their layout while live, distinct, and
// 16-byte aligned; layouts over-aligned for this allocator are refused with
// null rather than misaligned.
unsafe impl GlobalAlloc for Stealloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }
        self.allocate(layout.size())
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }
        self.allocate_zeroed(1, layout.size())
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(payload) = NonNull::new(ptr) {
            // SAFETY: `ptr` was allocated by `alloc` above.
            unsafe { self.release(payload) }
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }
        // SAFETY: `ptr` was allocated by `alloc` above.
        unsafe { self.reallocate(NonNull::new(ptr), new_size) }
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }
}
