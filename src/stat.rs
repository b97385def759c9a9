//! Process-wide debug counters.
//!
//! Compiled to no-ops unless the `stat` feature is on, so the hot paths pay
//! nothing in release builds. The counters deliberately live at process
//! scope, not per heap: cross-thread frees and page steals make per-thread
//! numbers misleading.

#[cfg(feature = "stat")]
mod imp {
    use core::sync::atomic::{AtomicU64, Ordering::Relaxed};

    static TOTAL_MALLOC_OPS: AtomicU64 = AtomicU64::new(0);
    static TOTAL_REALLOC_OPS: AtomicU64 = AtomicU64::new(0);
    static TOTAL_FREE_OPS: AtomicU64 = AtomicU64::new(0);

    static TOTAL_MMAP: AtomicU64 = AtomicU64::new(0);
    static TOTAL_MUNMAP: AtomicU64 = AtomicU64::new(0);

    static TOTAL_ALLOC_MEM: AtomicU64 = AtomicU64::new(0);
    static TOTAL_DEALLOC_MEM: AtomicU64 = AtomicU64::new(0);
    static TOTAL_REQUESTED_MEM: AtomicU64 = AtomicU64::new(0);
    static PEAK_MEM: AtomicU64 = AtomicU64::new(0);

    static TOTAL_PAGE_STEALS: AtomicU64 = AtomicU64::new(0);

    pub(crate) fn count_malloc() {
        TOTAL_MALLOC_OPS.fetch_add(1, Relaxed);
    }

    pub(crate) fn count_realloc() {
        TOTAL_REALLOC_OPS.fetch_add(1, Relaxed);
    }

    pub(crate) fn count_free() {
        TOTAL_FREE_OPS.fetch_add(1, Relaxed);
    }

    pub(crate) fn count_mmap(bytes: usize) {
        TOTAL_MMAP.fetch_add(1, Relaxed);
        let alloc = TOTAL_ALLOC_MEM.fetch_add(bytes as u64, Relaxed) + bytes as u64;
        let resident = alloc.saturating_sub(TOTAL_DEALLOC_MEM.load(Relaxed));
        PEAK_MEM.fetch_max(resident, Relaxed);
    }

    pub(crate) fn count_munmap(bytes: usize) {
        TOTAL_MUNMAP.fetch_add(1, Relaxed);
        TOTAL_DEALLOC_MEM.fetch_add(bytes as u64, Relaxed);
    }

    /// Bytes the caller effectively asked for (slot or mapping size), as
    /// opposed to the mapped bytes above.
    pub(crate) fn count_requested(bytes: usize) {
        TOTAL_REQUESTED_MEM.fetch_add(bytes as u64, Relaxed);
    }

    pub(crate) fn count_steal() {
        TOTAL_PAGE_STEALS.fetch_add(1, Relaxed);
    }

    /// A point-in-time copy of the counters.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub(crate) struct Stat {
        pub malloc_ops: u64,
        pub realloc_ops: u64,
        pub free_ops: u64,
        pub mmap_calls: u64,
        pub munmap_calls: u64,
        pub total_alloc_mem: u64,
        pub total_dealloc_mem: u64,
        pub total_requested_mem: u64,
        pub peak_mem: u64,
        pub page_steals: u64,
    }

    pub(crate) fn snapshot() -> Stat {
        Stat {
            malloc_ops: TOTAL_MALLOC_OPS.load(Relaxed),
            realloc_ops: TOTAL_REALLOC_OPS.load(Relaxed),
            free_ops: TOTAL_FREE_OPS.load(Relaxed),
            mmap_calls: TOTAL_MMAP.load(Relaxed),
            munmap_calls: TOTAL_MUNMAP.load(Relaxed),
            total_alloc_mem: TOTAL_ALLOC_MEM.load(Relaxed),
            total_dealloc_mem: TOTAL_DEALLOC_MEM.load(Relaxed),
            total_requested_mem: TOTAL_REQUESTED_MEM.load(Relaxed),
            peak_mem: PEAK_MEM.load(Relaxed),
            page_steals: TOTAL_PAGE_STEALS.load(Relaxed),
        }
    }

    /// Prints the report; `per_class` yields (blocks, live objects) for each
    /// size class of the calling thread's heap.
    pub(crate) fn report(thread_id: u32, per_class: impl Fn(usize) -> (usize, u32)) {
        let stat = snapshot();
        println!("********** stealloc stats **********");
        println!(" this thread id: {thread_id}");
        println!(
            " ops: malloc {} / realloc {} / free {}",
            stat.malloc_ops, stat.realloc_ops, stat.free_ops
        );
        println!(
            " kernel: mmap {} / munmap {}",
            stat.mmap_calls, stat.munmap_calls
        );
        println!(
            " mem(kb): mapped {} / unmapped {} / requested {} / peak {}",
            stat.total_alloc_mem >> 10,
            stat.total_dealloc_mem >> 10,
            stat.total_requested_mem >> 10,
            stat.peak_mem >> 10,
        );
        println!(" page steals: {}", stat.page_steals);
        for class_index in 0..crate::class::CLASS_COUNT {
            let (blocks, objects) = per_class(class_index);
            if blocks == 0 {
                continue;
            }
            println!(
                " object size {}: blocks {blocks} - live objects {objects}",
                crate::class::class_size(class_index),
            );
        }
    }
}

#[cfg(not(feature = "stat"))]
mod imp {
    #[inline]
    pub(crate) fn count_malloc() {}

    #[inline]
    pub(crate) fn count_realloc() {}

    #[inline]
    pub(crate) fn count_free() {}

    #[inline]
    pub(crate) fn count_mmap(bytes: usize) {
        let _ = bytes;
    }

    #[inline]
    pub(crate) fn count_munmap(bytes: usize) {
        let _ = bytes;
    }

    #[inline]
    pub(crate) fn count_requested(bytes: usize) {
        let _ = bytes;
    }

    #[inline]
    pub(crate) fn count_steal() {}
}

pub(crate) use imp::*;
