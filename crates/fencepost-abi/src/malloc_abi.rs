//! Exported allocation symbols (`malloc`, `free`, `calloc`, `realloc`, and the
//! aligned family).
//!
//! Every call enters the reentry guard, then asks [`alloc_path`] to serve it
//! from the debugging heap. Nested calls, calls made before the options are
//! resolved, and pointers the heap does not own go to the native libc
//! allocator.
//!
//! In test mode, this module is suppressed to avoid shadowing the system
//! allocator of the test binary itself.

use std::ffi::{c_char, c_int, c_void};
use std::ptr;

use fencepost_core::CallSite;
use fencepost_core::constants::BLOCK_SIZE;

use crate::alloc_path::{self, Route, site_from_c};
use crate::reentry;
use crate::state::{self, AbiEvent};

/// The platform allocator, bound to its versioned glibc symbols so the
/// exports below cannot resolve back to themselves.
mod native {
    use std::ffi::{c_int, c_void};

    unsafe extern "C" {
        #[link_name = "__libc_malloc@GLIBC_2.2.5"]
        pub fn malloc(size: usize) -> *mut c_void;
        #[link_name = "__libc_calloc@GLIBC_2.2.5"]
        pub fn calloc(nmemb: usize, size: usize) -> *mut c_void;
        #[link_name = "__libc_realloc@GLIBC_2.2.5"]
        pub fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void;
        #[link_name = "__libc_free@GLIBC_2.2.5"]
        pub fn free(ptr: *mut c_void);
        #[link_name = "__libc_memalign@GLIBC_2.2.5"]
        pub fn memalign(alignment: usize, size: usize) -> *mut c_void;
        #[link_name = "posix_memalign@GLIBC_2.2.5"]
        pub fn posix_memalign(out: *mut *mut c_void, alignment: usize, size: usize) -> c_int;
        #[link_name = "aligned_alloc@GLIBC_2.16"]
        pub fn aligned_alloc(alignment: usize, size: usize) -> *mut c_void;
    }
}

/// Runs `heap` under the reentry guard. Nested calls and requests the heap
/// declines go to `fallback`.
#[inline]
fn dispatch<T>(heap: impl FnOnce() -> Route<T>, fallback: impl FnOnce() -> T) -> T {
    let Some(_reentry_guard) = reentry::enter() else {
        state::counters().record(AbiEvent::Native);
        return fallback();
    };
    match heap() {
        Route::Heap(out) => out,
        Route::Native => fallback(),
    }
}

// ---------------------------------------------------------------------------
// malloc / calloc
// ---------------------------------------------------------------------------

/// POSIX `malloc`. Null on failure, with the error logged and `errno` set.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    // SAFETY: null file means an unknown call site.
    unsafe { fencepost_malloc_at(ptr::null(), 0, size) }
}

/// `malloc` recording `file:line` as the call site.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fencepost_malloc_at(
    file: *const c_char,
    line: c_int,
    size: usize,
) -> *mut c_void {
    dispatch(
        // SAFETY: caller passes a string literal or null.
        || alloc_path::malloc(size, unsafe { site_from_c(file, line) }),
        // SAFETY: plain libc allocation.
        || unsafe { native::malloc(size.max(1)) },
    )
}

/// POSIX `calloc`: zeroed `nmemb * size` bytes, null on overflow.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    // SAFETY: null file means an unknown call site.
    unsafe { fencepost_calloc_at(ptr::null(), 0, nmemb, size) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn fencepost_calloc_at(
    file: *const c_char,
    line: c_int,
    nmemb: usize,
    size: usize,
) -> *mut c_void {
    dispatch(
        // SAFETY: caller passes a string literal or null.
        || alloc_path::calloc(nmemb, size, unsafe { site_from_c(file, line) }),
        // SAFETY: plain libc allocation.
        || unsafe { native::calloc(nmemb, size) },
    )
}

// ---------------------------------------------------------------------------
// realloc / free
// ---------------------------------------------------------------------------

/// POSIX `realloc`. Pointers the heap does not own are resized by libc.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn realloc(old: *mut c_void, size: usize) -> *mut c_void {
    // SAFETY: null file means an unknown call site.
    unsafe { fencepost_realloc_at(ptr::null(), 0, old, size) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn fencepost_realloc_at(
    file: *const c_char,
    line: c_int,
    old: *mut c_void,
    size: usize,
) -> *mut c_void {
    dispatch(
        // SAFETY: caller passes a string literal or null.
        || alloc_path::realloc(old, size, unsafe { site_from_c(file, line) }),
        // SAFETY: `old` is null or came from libc.
        || unsafe { native::realloc(old, size) },
    )
}

/// POSIX `free`. Null follows the configured null-release policy.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn free(block: *mut c_void) {
    // SAFETY: null file means an unknown call site.
    unsafe { fencepost_free_at(ptr::null(), 0, block) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn fencepost_free_at(file: *const c_char, line: c_int, block: *mut c_void) {
    dispatch(
        // SAFETY: caller passes a string literal or null.
        || alloc_path::free(block, unsafe { site_from_c(file, line) }),
        // SAFETY: `block` came from libc.
        || unsafe { native::free(block) },
    );
}

// ---------------------------------------------------------------------------
// aligned family
// ---------------------------------------------------------------------------

/// Legacy `memalign`. Alignments above one block are rejected with `EINVAL`.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn memalign(alignment: usize, size: usize) -> *mut c_void {
    dispatch(
        || alloc_path::memalign(alignment, size, CallSite::Unknown),
        // SAFETY: plain libc allocation.
        || unsafe { native::memalign(alignment, size) },
    )
}

/// C11 `aligned_alloc`, served like `memalign`.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn aligned_alloc(alignment: usize, size: usize) -> *mut c_void {
    dispatch(
        || alloc_path::memalign(alignment, size, CallSite::Unknown),
        // SAFETY: plain libc allocation.
        || unsafe { native::aligned_alloc(alignment, size) },
    )
}

/// POSIX `posix_memalign`. Returns 0, `EINVAL` or `ENOMEM`; `errno` is left
/// untouched.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn posix_memalign(
    memptr: *mut *mut c_void,
    alignment: usize,
    size: usize,
) -> c_int {
    if memptr.is_null() {
        return libc::EINVAL;
    }
    dispatch(
        || {
            // SAFETY: `memptr` is non-null and points to writable storage per POSIX.
            let out = unsafe { &mut *memptr };
            alloc_path::posix_memalign(out, alignment, size, CallSite::Unknown)
        },
        // SAFETY: `memptr` checked above.
        || unsafe { native::posix_memalign(memptr, alignment, size) },
    )
}

/// `valloc`: block-aligned memory.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn valloc(size: usize) -> *mut c_void {
    dispatch(
        || alloc_path::valloc(size, CallSite::Unknown),
        // SAFETY: plain libc allocation.
        || unsafe { native::memalign(BLOCK_SIZE, size) },
    )
}

/// `pvalloc`: block-aligned memory rounded up to whole blocks.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn pvalloc(size: usize) -> *mut c_void {
    let whole_blocks = size
        .max(1)
        .checked_next_multiple_of(BLOCK_SIZE)
        .unwrap_or(usize::MAX);
    dispatch(
        || alloc_path::pvalloc(size, CallSite::Unknown),
        // SAFETY: plain libc allocation.
        || unsafe { native::memalign(BLOCK_SIZE, whole_blocks) },
    )
}
