//! Valgrind memcheck integration (feature `track-valgrind`).
//!
//! Without the feature the hooks compile away. The 1-byte object header acts
//! as the red zone, so memcheck flags writes that clip it.

#[cfg(feature = "track-valgrind")]
mod imp {
    use core::ptr::NonNull;

    use crabgrind::memcheck::alloc;

    const RED_ZONE: usize = 1;

    pub(crate) fn allocate(payload: NonNull<u8>, size: usize) {
        alloc::malloc(payload.as_ptr().cast(), size, RED_ZONE, false);
    }

    pub(crate) fn deallocate(payload: NonNull<u8>) {
        alloc::free(payload.as_ptr().cast(), RED_ZONE);
    }
}

#[cfg(not(feature = "track-valgrind"))]
mod imp {
    use core::ptr::NonNull;

    #[inline]
    pub(crate) fn allocate(payload: NonNull<u8>, size: usize) {
        let _ = (payload, size);
    }

    #[inline]
    pub(crate) fn deallocate(payload: NonNull<u8>) {
        let _ = payload;
    }
}

pub(crate) use imp::*;
