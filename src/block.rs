//! The page-block engine.
//!
//! A page-block is a contiguous mapping of 8, 16 or 32 pages carved into
//! equally sized slots of one size class. Its header sits at the front of the
//! mapping and splits into two halves with very different access rules:
//!
//! - everything except `sync` belongs to the owning thread alone (the
//!   teardown orphan hand-off transfers that ownership wholesale);
//! - `sync` is an atomic word packing `{count: 16, remote_head: 24,
//!   owner: 24}` and is the *only* cross-thread mutable state. Non-owning
//!   threads publish their frees through it, and an exiting owner parks the
//!   sentinel owner id [`ORPHAN`] in it so the next remote free can adopt the
//!   whole block.
//!
//! Freed slots link through their own payload bytes: the local LIFO keeps a
//! 4-byte next offset at the payload start, the remote LIFO keeps a full
//! copy of the sync word that was current when the slot was pushed (its
//! `remote_head` field is the chain link).

use core::{
    cell::Cell,
    mem,
    ptr::{addr_of, addr_of_mut, NonNull},
    sync::atomic::{AtomicU64, Ordering::*},
};

use crate::{
    class::{block_bytes, class_size},
    header,
    list::ListLink,
};

const SYNC_COUNT_BITS: u32 = 16;
const SYNC_REMOTE_BITS: u32 = 24;
const SYNC_TID_BITS: u32 = 24;

const SYNC_COUNT_MASK: u64 = (1 << SYNC_COUNT_BITS) - 1;
const SYNC_REMOTE_SHIFT: u32 = SYNC_COUNT_BITS;
const SYNC_REMOTE_MASK: u64 = (1 << SYNC_REMOTE_BITS) - 1;
const SYNC_TID_SHIFT: u32 = SYNC_COUNT_BITS + SYNC_REMOTE_BITS;

/// The owner id of a block whose thread has exited; the next remote freer
/// adopts the block by swapping its own id in.
pub(crate) const ORPHAN: u32 = (1 << SYNC_TID_BITS) - 1;

const fn sync_pack(count: u32, remote_head: u32, owner: u32) -> u64 {
    (count as u64 & SYNC_COUNT_MASK)
        | ((remote_head as u64 & SYNC_REMOTE_MASK) << SYNC_REMOTE_SHIFT)
        | ((owner as u64) << SYNC_TID_SHIFT)
}

const fn sync_count(word: u64) -> u32 {
    (word & SYNC_COUNT_MASK) as u32
}

const fn sync_remote(word: u64) -> u32 {
    ((word >> SYNC_REMOTE_SHIFT) & SYNC_REMOTE_MASK) as u32
}

const fn sync_owner(word: u64) -> u32 {
    (word >> SYNC_TID_SHIFT) as u32
}

/// The page-block header, resident at the start of its own mapping.
#[repr(C)]
pub(crate) struct PageBlock {
    /// Reserved for the supply-chain stacks, which link cached blocks through
    /// their first 8 bytes (by casting the block pointer, not through this
    /// field). Must stay the first field.
    #[allow(dead_code)]
    cache_link: AtomicU64,
    pub(crate) link: ListLink,
    page_count: u16,
    object_size: u16,
    /// Net objects live from the owner's viewpoint: bump pops plus drained
    /// remote frees, minus local LIFO pushes. Remote frees do not touch it
    /// until they are drained.
    allocated: Cell<u32>,
    /// Offset of the next never-allocated slot.
    bump: Cell<u32>,
    /// Offset of the local freed LIFO head; 0 means empty (no slot starts
    /// below the header).
    freed: Cell<u32>,
    sync: AtomicU64,
}

impl PageBlock {
    /// Lays a fresh header over `raw` and claims it for `thread_id`.
    ///
    /// # Safety
    ///
    /// `raw` must be an owned, unshared mapping of exactly `page_count`
    /// pages, and `page_count` must match `class_index`'s range.
    pub(crate) unsafe fn init(
        raw: NonNull<()>,
        class_index: usize,
        page_count: usize,
        thread_id: u32,
    ) -> NonNull<Self> {
        let block = raw.cast::<Self>().as_ptr();
        // Slot bases sit one byte below their payloads, so the bump start is
        // aligned to 16 *minus one*: every payload lands on a 16-byte
        // boundary.
        let mut bump = mem::size_of::<Self>();
        bump += 15 - ((raw.addr().get() + bump) & 15);

        // SAFETY: field-by-field initialisation of the owned header. The
        // link word is stored atomically: a stale popper of the supply
        // stacks may still load it concurrently (and then fail its tag CAS).
        unsafe {
            (*addr_of!((*block).cache_link)).store(0, Relaxed);
            addr_of_mut!((*block).link).write(ListLink::new());
            addr_of_mut!((*block).page_count).write(page_count as u16);
            addr_of_mut!((*block).object_size).write(class_size(class_index) as u16);
            addr_of_mut!((*block).allocated).write(Cell::new(0));
            addr_of_mut!((*block).bump).write(Cell::new(bump as u32));
            addr_of_mut!((*block).freed).write(Cell::new(0));
            addr_of_mut!((*block).sync).write(AtomicU64::new(sync_pack(0, 0, thread_id)));
        }
        raw.cast()
    }

    pub(crate) fn page_count(&self) -> usize {
        self.page_count as usize
    }

    pub(crate) fn object_size(&self) -> usize {
        self.object_size as usize
    }

    #[cfg(feature = "stat")]
    pub(crate) fn allocated(&self) -> u32 {
        self.allocated.get()
    }

    /// No object is live from the owner's viewpoint.
    pub(crate) fn is_unused(&self) -> bool {
        self.allocated.get() == 0
    }

    fn base(&self) -> usize {
        (self as *const Self).addr()
    }

    /// # Safety
    ///
    /// `offset` must be a payload offset previously produced by this block.
    unsafe fn payload_at(&self, offset: u32) -> NonNull<u8> {
        debug_assert!(offset as usize >= mem::size_of::<Self>());
        // SAFETY: the sum stays within the mapping and is non-zero.
        unsafe { NonNull::new_unchecked((self.base() + offset as usize) as *mut u8) }
    }

    /// Tries to hand out one slot. Owning thread only.
    ///
    /// Order: drain the remote LIFO if non-empty, then the local LIFO, then
    /// the bump area. `None` sends the caller to the next block in the list.
    pub(crate) fn allocate(&self) -> Option<NonNull<u8>> {
        if sync_remote(self.sync.load(Relaxed)) != 0 {
            self.drain_remote();
        }

        let freed = self.freed.get();
        if freed != 0 {
            let payload = unsafe { self.payload_at(freed) };
            // SAFETY: the slot holds the next offset in its first 4 bytes.
            let next = unsafe { payload.as_ptr().cast::<u32>().read() };
            self.freed.set(next);
            self.allocated.set(self.allocated.get() + 1);
            // The header was invalidated when the slot was freed.
            unsafe { header::write_small(NonNull::from(self).cast(), payload) };
            return Some(payload);
        }

        let bump = self.bump.get() as usize;
        let object_size = self.object_size();
        if bump + object_size <= block_bytes(self.page_count()) {
            // SAFETY: the slot lies wholly inside the mapping.
            let payload = unsafe { self.payload_at(bump as u32 + 1) };
            unsafe { header::write_small(NonNull::from(self).cast(), payload) };
            self.bump.set((bump + object_size) as u32);
            self.allocated.set(self.allocated.get() + 1);
            return Some(payload);
        }

        None
    }

    /// Detaches the remote LIFO in one CAS and splices it onto the local
    /// LIFO; the received slots count as not-yet-allocated again.
    #[cold]
    fn drain_remote(&self) {
        let mut old = self.sync.load(Relaxed);
        loop {
            let new = sync_pack(0, 0, sync_owner(old));
            match self.sync.compare_exchange_weak(old, new, SeqCst, Relaxed) {
                Ok(_) => break,
                Err(actual) => old = actual,
            }
        }

        let mut offset = sync_remote(old);
        let mut received = 0;
        while offset != 0 {
            let payload = unsafe { self.payload_at(offset) };
            // The freer stored the then-current sync word here; its
            // remote_head field is the next link. The successful CAS above
            // made every store in the chain visible to us.
            let word = unsafe { &*payload.as_ptr().cast::<AtomicU64>() }.load(Relaxed);
            // SAFETY: the chain is exclusively ours now.
            unsafe { payload.as_ptr().cast::<u32>().write(self.freed.get()) };
            self.freed.set(offset);
            received += 1;
            offset = sync_remote(word);
        }
        debug_assert_eq!(received, sync_count(old));
        self.allocated.set(self.allocated.get() - received);
    }

    /// Pushes a freed slot onto the local LIFO. Owning thread only.
    ///
    /// Returns `true` when the block became unused.
    ///
    /// # Safety
    ///
    /// `payload` must be a live allocation from this block, never used again
    /// by the caller.
    pub(crate) unsafe fn push_local(&self, payload: NonNull<u8>) -> bool {
        // SAFETY: the slot is ours again; clearing validity first makes a
        // double free trip the decoder.
        unsafe {
            header::invalidate(payload);
            payload.as_ptr().cast::<u32>().write(self.freed.get());
        }
        self.freed.set((payload.addr().get() - self.base()) as u32);
        self.allocated.set(self.allocated.get() - 1);
        self.allocated.get() == 0
    }

    /// Publishes a freed slot onto the remote LIFO from a non-owning thread.
    ///
    /// Returns `true` when the block was orphaned and this free adopted it;
    /// the caller must then link the block into its own heap.
    ///
    /// # Safety
    ///
    /// `payload` must be a live allocation from `this`, never used again by
    /// the caller. No reference to owner-side state may be formed here.
    pub(crate) unsafe fn push_remote(
        this: NonNull<Self>,
        payload: NonNull<u8>,
        thread_id: u32,
    ) -> bool {
        unsafe { header::invalidate(payload) };
        let offset = (payload.addr().get() - this.addr().get()) as u32;
        // SAFETY: `sync` is the shared half of the header.
        let sync = unsafe { &*addr_of!((*this.as_ptr()).sync) };
        // SAFETY: payloads are 16-byte aligned and at least 8 bytes.
        let slot = unsafe { &*payload.as_ptr().cast::<AtomicU64>() };

        let mut old = sync.load(Relaxed);
        loop {
            slot.store(old, Relaxed);
            let adopting = sync_owner(old) == ORPHAN;
            let owner = if adopting { thread_id } else { sync_owner(old) };
            let new = sync_pack(sync_count(old) + 1, offset, owner);
            match sync.compare_exchange_weak(old, new, SeqCst, Relaxed) {
                Ok(_) => return adopting,
                Err(actual) => old = actual,
            }
        }
    }

    /// The current owner id, readable from any thread.
    ///
    /// # Safety
    ///
    /// `this` must point to a live page-block.
    pub(crate) unsafe fn owner_raw(this: NonNull<Self>) -> u32 {
        // SAFETY: `sync` is the shared half of the header.
        sync_owner(unsafe { &*addr_of!((*this.as_ptr()).sync) }.load(Relaxed))
    }

    /// # Safety
    ///
    /// `this` must point to a live page-block; `object_size` is written once
    /// at init and immutable afterwards.
    pub(crate) unsafe fn object_size_raw(this: NonNull<Self>) -> usize {
        unsafe { addr_of!((*this.as_ptr()).object_size).read() as usize }
    }

    /// Decides the block's fate at owner teardown.
    ///
    /// `true` means reclaimable: unused, or every outstanding object already
    /// sits in the remote LIFO (no live pointer remains, no further free can
    /// arrive). `false` means the block was marked [`ORPHAN`] and now awaits
    /// adoption by its last remote freer.
    pub(crate) fn teardown_disposition(&self) -> bool {
        let allocated = self.allocated.get();
        if allocated == 0 {
            return true;
        }
        let mut old = self.sync.load(Relaxed);
        loop {
            if sync_count(old) == allocated {
                return true;
            }
            let new = sync_pack(sync_count(old), sync_remote(old), ORPHAN);
            match self.sync.compare_exchange_weak(old, new, SeqCst, Relaxed) {
                Ok(_) => return false,
                Err(actual) => old = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::{base::Mmap, class};

    fn mapped_block(class_index: usize, thread_id: u32) -> NonNull<PageBlock> {
        let (_, page_count) = class::decode(class_size(class_index) - 1);
        let raw = Mmap::map(page_count).unwrap();
        unsafe { PageBlock::init(raw, class_index, page_count, thread_id) }
    }

    fn dispose(block: NonNull<PageBlock>) {
        let page_count = unsafe { block.as_ref() }.page_count();
        unsafe { Mmap::unmap(block.cast(), page_count) };
    }

    #[test]
    fn bump_allocation_is_aligned_and_distinct() {
        let block = mapped_block(0, 1);
        let b = unsafe { block.as_ref() };

        let mut seen = Vec::new();
        for _ in 0..100 {
            let payload = b.allocate().unwrap();
            assert_eq!(payload.addr().get() & 0xf, 0);
            assert!(!seen.contains(&payload));
            seen.push(payload);
        }
        assert_eq!(b.allocated.get(), 100);
        dispose(block);
    }

    #[test]
    fn local_lifo_reuses_most_recent() {
        let block = mapped_block(3, 1);
        let b = unsafe { block.as_ref() };

        let first = b.allocate().unwrap();
        let second = b.allocate().unwrap();
        assert!(!unsafe { b.push_local(second) });
        assert!(!unsafe { b.push_local(first) });
        // LIFO: the last freed comes back first, with its header restamped.
        assert_eq!(b.allocate(), Some(first));
        assert_eq!(b.allocate(), Some(second));
        assert!(unsafe { crate::header::decode(first) }.is_some());
        dispose(block);
    }

    #[test]
    fn block_exhausts_then_recycles() {
        let block = mapped_block(63, 1);
        let b = unsafe { block.as_ref() };

        let mut all = Vec::new();
        while let Some(payload) = b.allocate() {
            all.push(payload);
        }
        // 32 pages minus header, 2048-byte slots.
        assert!(all.len() >= 62);

        for &payload in all.iter().rev() {
            unsafe { b.push_local(payload) };
        }
        assert!(b.is_unused());
        assert_eq!(b.allocate(), Some(all[0]));
        dispose(block);
    }

    #[test]
    fn remote_frees_are_drained_on_allocate() {
        let block = mapped_block(0, 1);
        let b = unsafe { block.as_ref() };

        let objs: Vec<_> = (0..64).map(|_| b.allocate().unwrap()).collect();
        let addrs: Vec<_> = objs.iter().map(|p| p.addr().get()).collect();
        let block_addr = block.addr().get();

        thread::scope(|s| {
            s.spawn(move || {
                let this = NonNull::new(block_addr as *mut PageBlock).unwrap();
                for addr in addrs {
                    let payload = NonNull::new(addr as *mut u8).unwrap();
                    let adopted = unsafe { PageBlock::push_remote(this, payload, 2) };
                    assert!(!adopted);
                }
            });
        });

        // Still 64 from the owner's view until the next allocate drains.
        assert_eq!(b.allocated.get(), 64);
        let payload = b.allocate().unwrap();
        assert_eq!(b.allocated.get(), 1);
        assert!(objs.contains(&payload));
        dispose(block);
    }

    #[test]
    fn orphaned_block_is_adopted_by_remote_freer() {
        let block = mapped_block(0, 1);
        let b = unsafe { block.as_ref() };

        let payload = b.allocate().unwrap();
        // Outstanding object: teardown must orphan instead of reclaiming.
        assert!(!b.teardown_disposition());
        assert_eq!(unsafe { PageBlock::owner_raw(block) }, ORPHAN);

        let adopted = unsafe { PageBlock::push_remote(block, payload, 7) };
        assert!(adopted);
        assert_eq!(unsafe { PageBlock::owner_raw(block) }, 7);
        dispose(block);
    }

    #[test]
    fn teardown_reclaims_when_all_frees_arrived_remotely() {
        let block = mapped_block(0, 1);
        let b = unsafe { block.as_ref() };

        let objs: Vec<_> = (0..5).map(|_| b.allocate().unwrap()).collect();
        for payload in objs {
            unsafe { PageBlock::push_remote(block, payload, 9) };
        }
        // count == allocated: nothing is live anywhere, reclaim directly.
        assert!(b.teardown_disposition());
        dispose(block);
    }
}
