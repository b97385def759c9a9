//! C-compatible entry points (feature `c`).
//!
//! Thin forwarding shims: the names interpose on the platform allocator
//! through the usual linker mechanisms, which is also why this module is off
//! by default. A test binary linking these symbols would route every libc
//! allocation in the process through this crate.

use core::{
    ffi::c_void,
    ptr::{self, NonNull},
};

use crate::Stealloc;

#[no_mangle]
extern "C" fn malloc(size: usize) -> *mut c_void {
    Stealloc
        .allocate(size)
        .map_or(ptr::null_mut(), |p| p.as_ptr().cast())
}

#[no_mangle]
extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    Stealloc
        .allocate_zeroed(nmemb, size)
        .map_or(ptr::null_mut(), |p| p.as_ptr().cast())
}

#[no_mangle]
unsafe extern "C" fn realloc(obj: *mut c_void, size: usize) -> *mut c_void {
    // SAFETY: the caller passes an owned allocation (or null).
    unsafe { Stealloc.reallocate(NonNull::new(obj.cast()), size) }
        .map_or(ptr::null_mut(), |p| p.as_ptr().cast())
}

#[no_mangle]
unsafe extern "C" fn free(obj: *mut c_void) {
    if let Some(obj) = NonNull::new(obj) {
        // SAFETY: the caller passes an owned allocation.
        unsafe { Stealloc.release(obj.cast()) }
    }
}

#[no_mangle]
extern "C" fn malloc_debug_stats() {
    Stealloc.debug_stats();
}
