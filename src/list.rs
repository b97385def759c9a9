//! Intrusive doubly linked lists of page-blocks.
//!
//! One list per size class in each thread heap. Links live inside the
//! page-block header and are touched only by the owning thread, so plain
//! `Cell`s suffice; the list hands out raw block pointers because the blocks
//! themselves live in mapped memory the list does not own.

use core::{cell::Cell, ptr::{self, NonNull}};

use crate::block::PageBlock;

/// The link fields embedded in every page-block header.
pub(crate) struct ListLink {
    prev: Cell<Option<NonNull<PageBlock>>>,
    next: Cell<Option<NonNull<PageBlock>>>,
}

impl ListLink {
    pub(crate) const fn new() -> Self {
        ListLink {
            prev: Cell::new(None),
            next: Cell::new(None),
        }
    }
}

/// # Safety
///
/// `block` must point to a valid page-block whose links are only touched by
/// the current thread.
unsafe fn link<'a>(block: NonNull<PageBlock>) -> &'a ListLink {
    // SAFETY: only the link field is projected; no reference to the rest of
    // the header is formed.
    unsafe { &*ptr::addr_of!((*block.as_ptr()).link) }
}

/// The per-class list, walked head to tail on allocation.
pub(crate) struct BlockList {
    head: Cell<Option<NonNull<PageBlock>>>,
    tail: Cell<Option<NonNull<PageBlock>>>,
}

impl BlockList {
    pub(crate) const fn new() -> Self {
        BlockList {
            head: Cell::new(None),
            tail: Cell::new(None),
        }
    }

    pub(crate) fn head(&self) -> Option<NonNull<PageBlock>> {
        self.head.get()
    }

    pub(crate) fn is_head(&self, block: NonNull<PageBlock>) -> bool {
        self.head.get() == Some(block)
    }

    /// The successor of `block` within this list.
    ///
    /// # Safety
    ///
    /// `block` must be linked into this list.
    pub(crate) unsafe fn next(block: NonNull<PageBlock>) -> Option<NonNull<PageBlock>> {
        unsafe { link(block) }.next.get()
    }

    /// # Safety
    ///
    /// `block` must be valid, owned by the current thread, and unlinked.
    pub(crate) unsafe fn push_front(&self, block: NonNull<PageBlock>) {
        let links = unsafe { link(block) };
        let old_head = self.head.get();
        links.prev.set(None);
        links.next.set(old_head);
        match old_head {
            Some(head) => unsafe { link(head) }.prev.set(Some(block)),
            None => self.tail.set(Some(block)),
        }
        self.head.set(Some(block));
    }

    /// # Safety
    ///
    /// All blocks in this list must be valid and owned by the current thread.
    pub(crate) unsafe fn pop_front(&self) -> Option<NonNull<PageBlock>> {
        let block = self.head.get()?;
        let links = unsafe { link(block) };
        let next = links.next.take();
        links.prev.set(None);
        match next {
            Some(next) => unsafe { link(next) }.prev.set(None),
            None => self.tail.set(None),
        }
        self.head.set(next);
        Some(block)
    }

    /// Unlinks `block` from anywhere in the list.
    ///
    /// # Safety
    ///
    /// `block` must be linked into this list, which must be owned by the
    /// current thread.
    pub(crate) unsafe fn remove(&self, block: NonNull<PageBlock>) {
        let links = unsafe { link(block) };
        let prev = links.prev.take();
        let next = links.next.take();
        match prev {
            Some(prev) => unsafe { link(prev) }.next.set(next),
            None => self.head.set(next),
        }
        match next {
            Some(next) => unsafe { link(next) }.prev.set(prev),
            None => self.tail.set(prev),
        }
    }
}
