//! The object header codec.
//!
//! Every small payload is prefixed by one byte:
//!
//! ```text
//! | kind: 1 | page_offset: 5 | validity: 2 |
//! ```
//!
//! `kind` distinguishes small from large allocations, `page_offset` is the
//! distance in pages from the owning page-block's start to the page holding
//! the payload (32-page blocks are the largest, so 5 bits cover it), and
//! `validity` is a fixed all-ones pattern whose absence marks a corrupt or
//! double-freed object.
//!
//! Large allocations carry a 16-byte prefix instead: the mapping's page count
//! as a `u64` at offset 0, and the common header byte at offset 15 so the
//! `payload - 1` read decodes both kinds through one path.

use core::ptr::NonNull;

use crate::{
    base::{PAGE_BITS, PAGE_SIZE},
    block::PageBlock,
    class::PAGE_MULTIPLIER,
};

/// Bytes reserved in front of every large payload.
pub(crate) const LARGE_PREFIX: usize = 16;

const KIND_LARGE: u8 = 0x80;
const PAGE_OFF_BITS: u32 = 2 + PAGE_MULTIPLIER;
const PAGE_OFF_SHIFT: u32 = 7 - PAGE_OFF_BITS;
const PAGE_OFF_MASK: u8 = ((1 << PAGE_OFF_BITS) - 1) << PAGE_OFF_SHIFT;
const VALID_MASK: u8 = (1 << PAGE_OFF_SHIFT) - 1;
const VALID: u8 = 0xff & VALID_MASK;

/// What the header byte of a well-formed object says about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ObjKind {
    Small { page_offset: usize },
    Large,
}

/// Stamps the header of a small slot about to be handed out.
///
/// # Safety
///
/// `payload` must point one byte past a slot start inside the page-block at
/// `block`.
pub(crate) unsafe fn write_small(block: NonNull<()>, payload: NonNull<u8>) {
    let page_offset = (payload.addr().get() - block.addr().get()) >> PAGE_BITS;
    debug_assert!(page_offset < 1 << PAGE_OFF_BITS);
    let header = ((page_offset as u8) << PAGE_OFF_SHIFT) | VALID;
    // SAFETY: the slot's first byte is the header slot.
    unsafe { payload.as_ptr().sub(1).write(header) };
}

/// Stamps the prefix of a large mapping; `base` is the mapping start.
///
/// # Safety
///
/// `base` must point to at least [`LARGE_PREFIX`] owned bytes.
pub(crate) unsafe fn write_large(base: NonNull<u8>, page_count: usize) {
    // SAFETY: mappings are page-aligned, so the u64 store is aligned too.
    unsafe {
        base.as_ptr().cast::<u64>().write(page_count as u64);
        base.as_ptr().add(LARGE_PREFIX - 1).write(KIND_LARGE | VALID);
    }
}

/// Reads an object's header, or `None` if its validity bits are malformed;
/// the caller treats that as unrecoverable corruption.
///
/// # Safety
///
/// `payload` must have been produced by this allocator (its preceding byte
/// must be readable).
pub(crate) unsafe fn decode(payload: NonNull<u8>) -> Option<ObjKind> {
    // SAFETY: both allocation kinds reserve the byte before the payload.
    let header = unsafe { payload.as_ptr().sub(1).read() };
    if header & VALID_MASK != VALID {
        return None;
    }
    Some(if header & KIND_LARGE != 0 {
        ObjKind::Large
    } else {
        ObjKind::Small {
            page_offset: ((header & PAGE_OFF_MASK) >> PAGE_OFF_SHIFT) as usize,
        }
    })
}

/// Clears the validity bits of a freed object so a second release of the
/// same pointer trips the corruption check instead of corrupting a LIFO.
///
/// # Safety
///
/// `payload` must point to a small object owned by the caller.
pub(crate) unsafe fn invalidate(payload: NonNull<u8>) {
    // SAFETY: same byte the encoder wrote.
    unsafe {
        let header = payload.as_ptr().sub(1);
        header.write(header.read() & !VALID_MASK);
    }
}

/// Recovers the owning page-block of a small object from its page offset.
///
/// # Safety
///
/// `page_offset` must come from `payload`'s own decoded header.
pub(crate) unsafe fn owner_block(payload: NonNull<u8>, page_offset: usize) -> NonNull<PageBlock> {
    let boundary = payload.addr().get() & !(PAGE_SIZE - 1);
    let start = boundary - (page_offset << PAGE_BITS);
    // SAFETY: a valid header always leads back to a live block start.
    unsafe { NonNull::new_unchecked(start as *mut PageBlock) }
}

/// Recovers a large allocation's mapping start and page count.
///
/// # Safety
///
/// `payload` must be a live large allocation from this allocator.
pub(crate) unsafe fn large_mapping(payload: NonNull<u8>) -> (NonNull<()>, usize) {
    // SAFETY: the prefix sits immediately before the payload.
    unsafe {
        let base = payload.as_ptr().sub(LARGE_PREFIX);
        let page_count = base.cast::<u64>().read() as usize;
        (NonNull::new_unchecked(base.cast()), page_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::Mmap;

    #[test]
    fn small_roundtrip_all_offsets() {
        let block = Mmap::map(32).unwrap();
        for page_offset in 0..32 {
            let payload = unsafe {
                NonNull::new_unchecked(
                    block.as_ptr().cast::<u8>().add((page_offset << PAGE_BITS) + 64),
                )
            };
            unsafe { write_small(block, payload) };
            assert_eq!(unsafe { decode(payload) }, Some(ObjKind::Small { page_offset }));
            assert_eq!(unsafe { owner_block(payload, page_offset) }, block.cast());

            unsafe { invalidate(payload) };
            assert_eq!(unsafe { decode(payload) }, None);
        }
        unsafe { Mmap::unmap(block, 32) };
    }

    #[test]
    fn large_roundtrip() {
        let base = Mmap::map(3).unwrap();
        unsafe { write_large(base.cast(), 3) };
        let payload =
            unsafe { NonNull::new_unchecked(base.as_ptr().cast::<u8>().add(LARGE_PREFIX)) };
        assert_eq!(unsafe { decode(payload) }, Some(ObjKind::Large));
        let (start, page_count) = unsafe { large_mapping(payload) };
        assert_eq!(start, base);
        assert_eq!(page_count, 3);
        unsafe { Mmap::unmap(base, 3) };
    }

    #[test]
    fn garbage_is_rejected() {
        let block = Mmap::map(1).unwrap();
        let payload = unsafe { NonNull::new_unchecked(block.as_ptr().cast::<u8>().add(64)) };
        for garbage in [0x00u8, 0x01, 0x80, 0xfe, 0x54] {
            unsafe { payload.as_ptr().sub(1).write(garbage) };
            assert_eq!(unsafe { decode(payload) }, None, "header {garbage:#x}");
        }
        unsafe { Mmap::unmap(block, 1) };
    }
}
