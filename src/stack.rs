//! Counting LIFO stacks with a packed 64-bit head.
//!
//! The head word packs three fields so that a single compare-and-swap moves
//! the whole stack state at once:
//!
//! ```text
//! | state: 12 | count: 12 | ptr: 40 |
//! ```
//!
//! `ptr` is the head node's address shifted right by [`PAGE_BITS`]: nodes are
//! always page-aligned, and usable virtual addresses are assumed to fit in 52
//! bits, so 40 bits recover the full address. `count` bounds the stack (a
//! full stack refuses the push, cascading the caller to the next supply
//! tier). `state` advances on every successful push *and* pop, so a CAS that
//! observes a recycled head pointer with the same count still fails.
//!
//! Each node's first 8 bytes hold a copy of the head word current at push
//! time; a pop recovers the next pointer from that copy's `ptr` field. The
//! word is read and written through an atomic view even on the thread-local
//! variant: a concurrent popper of the atomic stack may load the word of a
//! node that has already been popped and reused, and the stale value must be
//! discarded by the tag CAS rather than constitute a data race.

use core::{
    cell::Cell,
    ptr::NonNull,
    sync::atomic::{AtomicU64, Ordering::*},
};

use crate::base::PAGE_BITS;

const PTR_BITS: u32 = 40;
const COUNT_BITS: u32 = 12;

const PTR_MASK: u64 = (1 << PTR_BITS) - 1;
const COUNT_SHIFT: u32 = PTR_BITS;
const COUNT_MASK: u64 = (1 << COUNT_BITS) - 1;
const STATE_SHIFT: u32 = PTR_BITS + COUNT_BITS;
const STATE_MASK: u64 = (1 << (64 - STATE_SHIFT)) - 1;

/// The per-stack node capacity; pushing into a stack holding this many nodes
/// fails, which is what bounds the memory retained by each cache tier.
pub(crate) const COUNT_MAX: u64 = COUNT_MASK;

const fn pack(ptr: u64, count: u64, state: u64) -> u64 {
    (ptr & PTR_MASK) | ((count & COUNT_MASK) << COUNT_SHIFT) | ((state & STATE_MASK) << STATE_SHIFT)
}

const fn ptr_field(word: u64) -> u64 {
    word & PTR_MASK
}

const fn count_field(word: u64) -> u64 {
    (word >> COUNT_SHIFT) & COUNT_MASK
}

const fn state_field(word: u64) -> u64 {
    word >> STATE_SHIFT
}

fn encode_node(node: NonNull<()>) -> u64 {
    debug_assert_eq!(node.addr().get() & ((1 << PAGE_BITS) - 1), 0);
    (node.addr().get() >> PAGE_BITS) as u64
}

fn decode_node(ptr: u64) -> NonNull<()> {
    debug_assert_ne!(ptr, 0);
    // SAFETY: `ptr` came from a non-null page-aligned address.
    unsafe { NonNull::new_unchecked(((ptr as usize) << PAGE_BITS) as *mut ()) }
}

/// # Safety
///
/// `node` must point to at least 8 owned bytes.
unsafe fn link<'a>(node: NonNull<()>) -> &'a AtomicU64 {
    // SAFETY: the first 8 bytes of every node are reserved for the link word.
    unsafe { &*node.as_ptr().cast::<AtomicU64>() }
}

/// The lock-free counting stack; one per page-block size in the global
/// free heap.
pub(crate) struct AtomicStack {
    head: AtomicU64,
}

impl AtomicStack {
    pub(crate) const fn new() -> Self {
        AtomicStack { head: AtomicU64::new(0) }
    }

    /// Pushes `node`, or refuses with `false` when the stack already holds
    /// [`COUNT_MAX`] nodes.
    ///
    /// # Safety
    ///
    /// `node` must be a page-aligned block owned by the caller; ownership
    /// transfers to the stack on success.
    pub(crate) unsafe fn push(&self, node: NonNull<()>) -> bool {
        let mut old = self.head.load(Relaxed);
        loop {
            if count_field(old) == COUNT_MAX {
                return false;
            }
            // node.next = head; the whole word is stored, poppers only
            // consume its ptr field.
            unsafe { link(node) }.store(old, Relaxed);
            let new = pack(encode_node(node), count_field(old) + 1, state_field(old) + 1);
            match self.head.compare_exchange_weak(old, new, SeqCst, Relaxed) {
                Ok(_) => return true,
                Err(actual) => old = actual,
            }
        }
    }

    /// Pops the most recently pushed node, transferring its ownership to the
    /// caller.
    pub(crate) fn pop(&self) -> Option<NonNull<()>> {
        let mut old = self.head.load(Relaxed);
        loop {
            if ptr_field(old) == 0 {
                return None;
            }
            let node = decode_node(ptr_field(old));
            // `node` may already have been popped and reused by another
            // thread; the stale load below is then discarded when the state
            // tag makes the CAS fail.
            let next = unsafe { link(node) }.load(Relaxed);
            let new = pack(ptr_field(next), count_field(old) - 1, state_field(old) + 1);
            match self.head.compare_exchange_weak(old, new, SeqCst, Relaxed) {
                Ok(_) => return Some(node),
                Err(actual) => old = actual,
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> u64 {
        count_field(self.head.load(Relaxed))
    }
}

/// The single-threaded variant with the identical head layout; one per
/// page-block size in each thread's local page cache.
pub(crate) struct LocalStack {
    head: Cell<u64>,
}

impl LocalStack {
    pub(crate) const fn new() -> Self {
        LocalStack { head: Cell::new(0) }
    }

    /// # Safety
    ///
    /// Same contract as [`AtomicStack::push`].
    pub(crate) unsafe fn push(&self, node: NonNull<()>) -> bool {
        let old = self.head.get();
        if count_field(old) == COUNT_MAX {
            return false;
        }
        unsafe { link(node) }.store(old, Relaxed);
        self.head
            .set(pack(encode_node(node), count_field(old) + 1, state_field(old) + 1));
        true
    }

    pub(crate) fn pop(&self) -> Option<NonNull<()>> {
        let old = self.head.get();
        if ptr_field(old) == 0 {
            return None;
        }
        let node = decode_node(ptr_field(old));
        let next = unsafe { link(node) }.load(Relaxed);
        self.head
            .set(pack(ptr_field(next), count_field(old) - 1, state_field(old) + 1));
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeSet, thread};

    use super::*;
    use crate::base::Mmap;

    #[test]
    fn packed_roundtrip() {
        let word = pack(0xdead_beef_42, 1234, 4001);
        assert_eq!(ptr_field(word), 0xdead_beef_42);
        assert_eq!(count_field(word), 1234);
        assert_eq!(state_field(word), 4001);

        // Field arithmetic wraps within its own lane.
        let word = pack(1, COUNT_MAX, STATE_MASK);
        assert_eq!(count_field(pack(1, count_field(word) + 1, 0)), 0);
        assert_eq!(state_field(pack(1, 0, state_field(word) + 1)), 0);
    }

    #[test]
    fn local_lifo_order() {
        let stack = LocalStack::new();
        let nodes: Vec<_> = (0..3).map(|_| Mmap::map(1).unwrap()).collect();

        for &node in &nodes {
            assert!(unsafe { stack.push(node) });
        }
        for &node in nodes.iter().rev() {
            assert_eq!(stack.pop(), Some(node));
        }
        assert_eq!(stack.pop(), None);

        for node in nodes {
            unsafe { Mmap::unmap(node, 1) };
        }
    }

    #[test]
    fn local_refuses_when_full() {
        let stack = LocalStack::new();
        stack.head.set(pack(0, COUNT_MAX, 7));
        let node = Mmap::map(1).unwrap();
        assert!(!unsafe { stack.push(node) });
        unsafe { Mmap::unmap(node, 1) };
    }

    /// Concurrent pushes and pops must neither lose nor duplicate nodes.
    #[test]
    fn atomic_multiset_preserved() {
        const NODES: usize = 512;
        const THREADS: usize = 4;

        let stack = AtomicStack::new();
        let mut expected = BTreeSet::new();
        for _ in 0..NODES {
            let node = Mmap::map(1).unwrap();
            expected.insert(node.addr().get());
            assert!(unsafe { stack.push(node) });
        }

        thread::scope(|s| {
            for seed in 0..THREADS as u64 {
                let stack = &stack;
                s.spawn(move || {
                    let mut rng = fastrand::Rng::with_seed(seed);
                    for _ in 0..1000 {
                        let trials = rng.usize(1..16);
                        let mut held = Vec::with_capacity(trials);
                        for _ in 0..trials {
                            match stack.pop() {
                                Some(node) => held.push(node),
                                None => break,
                            }
                        }
                        for node in held {
                            assert!(unsafe { stack.push(node) });
                        }
                    }
                });
            }
        });

        assert_eq!(stack.len() as usize, NODES);
        let mut drained = BTreeSet::new();
        while let Some(node) = stack.pop() {
            assert!(drained.insert(node.addr().get()), "duplicate node popped");
        }
        assert_eq!(drained, expected);

        for addr in drained {
            unsafe { Mmap::unmap(NonNull::new(addr as *mut ()).unwrap(), 1) };
        }
    }
}
