//! Thread heaps and the page-block supply chain.
//!
//! Each thread lazily builds a [`ThreadHeap`]: an id drawn from a global
//! counter, one page-block list per size class, and a small stack of recycled
//! page-blocks per page-block size. All allocation routing happens here; the
//! blocks themselves do the slot bookkeeping ([`crate::block`]).
//!
//! Page-blocks travel a three-tier supply chain. Acquisition tries the
//! thread-local cache, then the global per-size freelist, then the OS;
//! release walks the same tiers in order and unmaps only when both caches are
//! full, which caps the memory the caches can retain.
//!
//! On thread exit the heap must not lose objects still referenced elsewhere:
//! blocks that are empty (or whose every outstanding object already sits in
//! their remote LIFO) are reclaimed, the rest are marked orphaned and wait
//! for their last remote free to adopt them.

use core::{
    ptr::{self, NonNull},
    sync::atomic::{AtomicU32, Ordering::*},
};

use array_macro::array;

use crate::{
    base::{page_count_for, Mmap, PAGE_SIZE},
    block::{PageBlock, ORPHAN},
    class::{self, CLASS_COUNT, PAGE_CLASS_COUNT, SMALL_LIMIT},
    header::{self, ObjKind, LARGE_PREFIX},
    list::BlockList,
    stack::{AtomicStack, LocalStack},
    stat, track,
};

/// The middle supply tier: one lock-free freelist per page-block size,
/// shared by all threads.
static GLOBAL_FREE: [AtomicStack; PAGE_CLASS_COUNT] =
    [AtomicStack::new(), AtomicStack::new(), AtomicStack::new()];

/// Thread ids are handed out sequentially and must fit the sync word's
/// 24-bit owner field; the [`ORPHAN`] value is skipped.
static NEXT_THREAD_ID: AtomicU32 = AtomicU32::new(1);

fn assign_thread_id() -> u32 {
    loop {
        let id = NEXT_THREAD_ID.fetch_add(1, Relaxed) & ORPHAN;
        if id != ORPHAN {
            return id;
        }
    }
}

/// Unrecoverable corruption: a silent recovery would poison every subsequent
/// call, so write a diagnostic and die. The raw `write` avoids the formatting
/// machinery, which could call back into this allocator when it is installed
/// as the global one.
#[cold]
pub(crate) fn oops(msg: &str) -> ! {
    unsafe { libc::write(2, msg.as_ptr().cast(), msg.len()) };
    std::process::abort();
}

fn log_mapping_failure(page_count: usize) {
    #[cfg(feature = "error-log")]
    log::error!("stealloc: the OS refused a mapping of {page_count} page(s)");
    #[cfg(not(feature = "error-log"))]
    let _ = page_count;
}

/// The per-thread allocator state. Constructed on first touch, torn down by
/// the orphan protocol on thread exit.
pub(crate) struct ThreadHeap {
    thread_id: u32,
    bins: [BlockList; CLASS_COUNT],
    cache: [LocalStack; PAGE_CLASS_COUNT],
}

impl ThreadHeap {
    fn new() -> Self {
        ThreadHeap {
            thread_id: assign_thread_id(),
            bins: array![_ => BlockList::new(); CLASS_COUNT],
            cache: array![_ => LocalStack::new(); PAGE_CLASS_COUNT],
        }
    }

    /// Acquires a page-block: thread cache, then global freelist, then mmap.
    fn get_pageblock(&self, page_count: usize) -> Option<NonNull<()>> {
        let page_class = class::page_class_of(page_count);
        if let Some(block) = self.cache[page_class].pop() {
            return Some(block);
        }
        if let Some(block) = GLOBAL_FREE[page_class].pop() {
            return Some(block);
        }
        match Mmap::map(page_count) {
            Some(block) => Some(block),
            None => {
                log_mapping_failure(page_count);
                None
            }
        }
    }

    /// Releases a page-block down the same tiers; unmaps when both caches
    /// refuse.
    fn ret_pageblock(&self, block: NonNull<()>, page_count: usize) {
        let page_class = class::page_class_of(page_count);
        // SAFETY: ownership of `block` transfers to whichever tier takes it.
        unsafe {
            if self.cache[page_class].push(block) {
                return;
            }
            if GLOBAL_FREE[page_class].push(block) {
                return;
            }
            Mmap::unmap(block, page_count);
        }
    }

    pub(crate) fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        stat::count_malloc();
        let payload = if size < SMALL_LIMIT {
            self.allocate_small(size)
        } else {
            large_alloc(size)
        };
        payload.inspect(|&p| track::allocate(p, size))
    }

    fn allocate_small(&self, size: usize) -> Option<NonNull<u8>> {
        let (class_index, page_count) = class::decode(size);
        stat::count_requested(class::class_size(class_index));
        let bin = &self.bins[class_index];

        let mut cur = bin.head();
        while let Some(block) = cur {
            // SAFETY: blocks in our bins are live and owned by this thread.
            let b = unsafe { block.as_ref() };
            if let Some(payload) = b.allocate() {
                return Some(payload);
            }
            // SAFETY: `block` is linked in `bin`.
            cur = unsafe { BlockList::next(block) };
        }

        self.allocate_fresh(bin, class_index, page_count)
    }

    /// Every block of the class is full: pull a fresh one through the supply
    /// chain and serve from it.
    #[cold]
    fn allocate_fresh(
        &self,
        bin: &BlockList,
        class_index: usize,
        page_count: usize,
    ) -> Option<NonNull<u8>> {
        let raw = self.get_pageblock(page_count)?;
        // SAFETY: the mapping is exclusively ours, fresh or recycled.
        let block = unsafe { PageBlock::init(raw, class_index, page_count, self.thread_id) };
        // SAFETY: freshly initialised, unlinked, ours.
        unsafe { bin.push_front(block) };
        // A fresh block always has bump room.
        unsafe { block.as_ref() }.allocate()
    }

    pub(crate) fn allocate_zeroed(&self, count: usize, size: usize) -> Option<NonNull<u8>> {
        let total = count.checked_mul(size)?;
        let payload = self.allocate(total)?;
        // SAFETY: `total` bytes were just allocated at `payload`.
        unsafe { ptr::write_bytes(payload.as_ptr(), 0, total) };
        Some(payload)
    }

    /// # Safety
    ///
    /// `payload` must be a live allocation produced by this allocator, and
    /// must not be used after the call.
    pub(crate) unsafe fn release(&self, payload: NonNull<u8>) {
        stat::count_free();
        track::deallocate(payload);
        match unsafe { header::decode(payload) } {
            None => oops("stealloc: broken object, aborting [release]\n"),
            // SAFETY: a large header means a live large mapping.
            Some(ObjKind::Large) => unsafe { large_free(payload) },
            Some(ObjKind::Small { page_offset }) => {
                // SAFETY: a valid small header leads back to the owning block.
                unsafe { self.release_small(payload, page_offset) }
            }
        }
    }

    /// # Safety
    ///
    /// Same as [`release`](Self::release); `page_offset` must come from
    /// `payload`'s own header.
    unsafe fn release_small(&self, payload: NonNull<u8>, page_offset: usize) {
        let block = unsafe { header::owner_block(payload, page_offset) };
        // The block may belong to another thread: only raw reads of the
        // immutable and atomic header halves until ownership is settled.
        let object_size = unsafe { PageBlock::object_size_raw(block) };
        let (class_index, _) = class::decode(object_size - 1);
        let bin = &self.bins[class_index];

        if unsafe { PageBlock::owner_raw(block) } == self.thread_id {
            // SAFETY: we own the block.
            let b = unsafe { block.as_ref() };
            let unused = unsafe { b.push_local(payload) };
            // An empty block is recycled unless it is the list head; keeping
            // the head avoids churn when one block is drained and refilled
            // in a tight loop.
            if unused && !bin.is_head(block) {
                let page_count = b.page_count();
                // SAFETY: `block` is linked in `bin`.
                unsafe { bin.remove(block) };
                self.ret_pageblock(block.cast(), page_count);
            }
        } else {
            // SAFETY: `payload` is ours to publish; `block` may be remote.
            if unsafe { PageBlock::push_remote(block, payload, self.thread_id) } {
                // The previous owner exited; the block is ours now.
                stat::count_steal();
                // SAFETY: adoption transferred ownership to this thread.
                unsafe { bin.push_front(block) };
            }
        }
    }

    /// # Safety
    ///
    /// `payload`, when present, must be a live allocation produced by this
    /// allocator; it is invalidated when a new pointer is returned.
    pub(crate) unsafe fn reallocate(
        &self,
        payload: Option<NonNull<u8>>,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        let Some(payload) = payload else {
            return self.allocate(new_size);
        };
        stat::count_realloc();

        let old_size = match unsafe { header::decode(payload) } {
            None => oops("stealloc: broken object, aborting [reallocate]\n"),
            Some(ObjKind::Small { page_offset }) => {
                let block = unsafe { header::owner_block(payload, page_offset) };
                (unsafe { PageBlock::object_size_raw(block) }) - 1
            }
            Some(ObjKind::Large) => {
                let (_, page_count) = unsafe { header::large_mapping(payload) };
                page_count * PAGE_SIZE - LARGE_PREFIX
            }
        };
        // Shrinking never moves: the slot (or mapping) already covers it.
        if old_size >= new_size {
            return Some(payload);
        }

        let new = self.allocate(new_size)?;
        // SAFETY: both regions are live and span at least `old_size` bytes.
        unsafe {
            ptr::copy_nonoverlapping(payload.as_ptr(), new.as_ptr(), old_size);
            self.release(payload);
        }
        Some(new)
    }

    #[cfg(feature = "stat")]
    pub(crate) fn debug_stats(&self) {
        stat::report(self.thread_id, |class_index| {
            let bin = &self.bins[class_index];
            let mut blocks = 0;
            let mut objects = 0;
            let mut cur = bin.head();
            while let Some(block) = cur {
                // SAFETY: blocks in our bins are live and owned by us.
                let b = unsafe { block.as_ref() };
                blocks += 1;
                objects += b.allocated();
                cur = unsafe { BlockList::next(block) };
            }
            (blocks, objects)
        });
    }
}

impl Drop for ThreadHeap {
    fn drop(&mut self) {
        for bin in &self.bins {
            // SAFETY: every block in our bins is live and owned by us.
            while let Some(block) = unsafe { bin.pop_front() } {
                let b = unsafe { block.as_ref() };
                if b.teardown_disposition() {
                    release_to_global(block.cast(), b.page_count());
                }
                // Otherwise the block is now orphaned; its last remote free
                // will adopt it into another heap.
            }
        }
        for (page_class, cache) in self.cache.iter().enumerate() {
            let page_count = class::pages_of_class(page_class);
            while let Some(block) = cache.pop() {
                release_to_global(block, page_count);
            }
        }
    }
}

/// Teardown release: the thread cache is dying, so only the global tier and
/// the OS remain.
fn release_to_global(block: NonNull<()>, page_count: usize) {
    let page_class = class::page_class_of(page_count);
    // SAFETY: ownership transfers to the global tier or back to the OS.
    unsafe {
        if !GLOBAL_FREE[page_class].push(block) {
            Mmap::unmap(block, page_count);
        }
    }
}

/// Large requests bypass the class heap entirely: a dedicated mapping with
/// the page count stamped in its 16-byte prefix.
#[cold]
fn large_alloc(size: usize) -> Option<NonNull<u8>> {
    let total = size.checked_add(LARGE_PREFIX)?;
    let page_count = page_count_for(total);
    let base = match Mmap::map(page_count) {
        Some(base) => base,
        None => {
            log_mapping_failure(page_count);
            return None;
        }
    };
    stat::count_requested(page_count * PAGE_SIZE);
    // SAFETY: the mapping is fresh and page-aligned, so the payload keeps the
    // 16-byte alignment guarantee.
    unsafe {
        header::write_large(base.cast(), page_count);
        Some(NonNull::new_unchecked(base.as_ptr().cast::<u8>().add(LARGE_PREFIX)))
    }
}

/// # Safety
///
/// `payload` must be a live large allocation, never used again.
#[cold]
unsafe fn large_free(payload: NonNull<u8>) {
    let (base, page_count) = unsafe { header::large_mapping(payload) };
    // SAFETY: the mapping covers exactly `page_count` pages and no reference
    // into it survives.
    unsafe { Mmap::unmap(base, page_count) };
}

thread_local! {
    static HEAP: ThreadHeap = ThreadHeap::new();
}

/// Runs `f` against the current thread's heap, building it on first touch.
#[inline]
pub(crate) fn with<T>(f: impl FnOnce(&ThreadHeap) -> T) -> T {
    HEAP.with(|heap| f(heap))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supply_chain_recycles_through_the_thread_cache() {
        let heap = ThreadHeap::new();
        let block = heap.get_pageblock(8).unwrap();
        heap.ret_pageblock(block, 8);
        // The cached block comes back before anything touches the globals.
        assert_eq!(heap.get_pageblock(8), Some(block));
        unsafe { Mmap::unmap(block, 8) };
    }

    #[test]
    fn burst_retains_at_most_one_block() {
        let heap = ThreadHeap::new();
        for _ in 0..10_000 {
            let payload = heap.allocate(100).unwrap();
            unsafe { heap.release(payload) };
        }
        let (class_index, _) = class::decode(100);
        let head = heap.bins[class_index].head().unwrap();
        assert_eq!(unsafe { BlockList::next(head) }, None);
    }

    #[test]
    fn draining_a_class_returns_its_extra_blocks() {
        let heap = ThreadHeap::new();
        // Class 63 blocks hold 63 slots each; force several blocks live.
        let held: Vec<_> = (0..200).map(|_| heap.allocate(2000).unwrap()).collect();
        let (class_index, _) = class::decode(2000);

        let mut blocks = 0;
        let mut cur = heap.bins[class_index].head();
        while let Some(block) = cur {
            blocks += 1;
            cur = unsafe { BlockList::next(block) };
        }
        assert!(blocks >= 3);

        for payload in held {
            unsafe { heap.release(payload) };
        }
        // Only the head survives the drain.
        let head = heap.bins[class_index].head().unwrap();
        assert!(unsafe { block_ref(head) }.is_unused());
        assert_eq!(unsafe { BlockList::next(head) }, None);
    }

    unsafe fn block_ref<'a>(block: NonNull<PageBlock>) -> &'a PageBlock {
        unsafe { block.as_ref() }
    }

    #[test]
    fn thread_ids_skip_the_orphan_value() {
        for _ in 0..4 {
            assert_ne!(assign_thread_id(), ORPHAN);
        }
    }
}
