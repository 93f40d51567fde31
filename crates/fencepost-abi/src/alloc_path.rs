//! Heap side of the allocation entry points.
//!
//! Each function either serves the call from the debugging heap or answers
//! [`Route::Native`], telling the exported symbol to use the platform
//! allocator instead. Errors have already been logged and recorded by
//! [`state::with_heap`] when these return; what is left is the C-visible
//! result (null and `errno`).

use std::ffi::{CStr, c_char, c_int, c_void};
use std::ptr::{self, NonNull};

use fencepost_core::constants::BLOCK_SIZE;
use fencepost_core::{CallSite, ChunkError};

use crate::state::{self, AbiEvent};

/// Who serves a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route<T> {
    Heap(T),
    Native,
}

#[inline]
pub(crate) fn set_errno(code: c_int) {
    // SAFETY: __errno_location returns this thread's errno slot.
    unsafe { *libc::__errno_location() = code };
}

fn errno_for(err: &ChunkError) -> c_int {
    match err {
        ChunkError::BadAlignment(_) => libc::EINVAL,
        _ => libc::ENOMEM,
    }
}

fn served(res: Option<Result<NonNull<u8>, ChunkError>>) -> Route<*mut c_void> {
    match res {
        Some(Ok(ptr)) => Route::Heap(ptr.as_ptr().cast()),
        Some(Err(err)) => {
            set_errno(errno_for(&err));
            Route::Heap(ptr::null_mut())
        }
        None => {
            state::counters().record(AbiEvent::Native);
            Route::Native
        }
    }
}

/// Call site from a C `__FILE__`/`__LINE__` pair.
///
/// # Safety
///
/// `file` must be null or a NUL-terminated string that stays valid for the
/// rest of the process, as string literals do.
#[must_use]
pub unsafe fn site_from_c(file: *const c_char, line: c_int) -> CallSite {
    if file.is_null() {
        return CallSite::Unknown;
    }
    // SAFETY: caller guarantees a NUL-terminated string with static lifetime.
    let file: &'static CStr = unsafe { CStr::from_ptr(file) };
    match (file.to_str(), u32::try_from(line)) {
        (Ok(file), Ok(line)) => CallSite::Location { file, line },
        _ => CallSite::Unknown,
    }
}

pub fn malloc(size: usize, site: CallSite) -> Route<*mut c_void> {
    served(state::with_heap("malloc", |heap| heap.allocate(size, site)))
}

pub fn calloc(count: usize, size: usize, site: CallSite) -> Route<*mut c_void> {
    served(state::with_heap("calloc", |heap| {
        heap.allocate_zeroed(count, size, site)
    }))
}

pub fn memalign(alignment: usize, size: usize, site: CallSite) -> Route<*mut c_void> {
    served(state::with_heap("memalign", |heap| {
        heap.allocate_aligned(size, alignment, site)
    }))
}

pub fn valloc(size: usize, site: CallSite) -> Route<*mut c_void> {
    served(state::with_heap("valloc", |heap| {
        heap.allocate_block_aligned(size, site)
    }))
}

/// `valloc` of `size` rounded up to whole blocks, at least one.
pub fn pvalloc(size: usize, site: CallSite) -> Route<*mut c_void> {
    let Some(rounded) = size.max(1).checked_next_multiple_of(BLOCK_SIZE) else {
        set_errno(libc::ENOMEM);
        return Route::Heap(ptr::null_mut());
    };
    valloc(rounded, site)
}

/// `posix_memalign` result code. The alignment must be a power of two and a
/// multiple of the pointer size.
pub fn posix_memalign(
    out: &mut *mut c_void,
    alignment: usize,
    size: usize,
    site: CallSite,
) -> Route<c_int> {
    if !alignment.is_power_of_two() || alignment % size_of::<*mut c_void>() != 0 {
        return Route::Heap(libc::EINVAL);
    }
    let res = state::with_heap("posix_memalign", |heap| {
        heap.allocate_aligned(size, alignment, site)
    });
    match res {
        Some(Ok(ptr)) => {
            *out = ptr.as_ptr().cast();
            Route::Heap(0)
        }
        Some(Err(err)) => Route::Heap(errno_for(&err)),
        None => {
            state::counters().record(AbiEvent::Native);
            Route::Native
        }
    }
}

/// Releases `ptr`. Pointers outside the arena belong to the native
/// allocator; null goes to the heap so its null-release policy applies.
pub fn free(ptr: *mut c_void, site: CallSite) -> Route<()> {
    let res = state::with_heap("free", |heap| {
        let ptr = ptr.cast::<u8>();
        if !ptr.is_null() && !heap.contains(ptr) {
            return Ok(false);
        }
        heap.release(ptr, site).map(|()| true)
    });
    match res {
        Some(Ok(true) | Err(_)) => Route::Heap(()),
        Some(Ok(false)) => {
            state::counters().record(AbiEvent::Foreign);
            Route::Native
        }
        None if ptr.is_null() => Route::Heap(()),
        None => {
            state::counters().record(AbiEvent::Native);
            Route::Native
        }
    }
}

/// Resizes `ptr`. A zero-size resize that released the block yields null.
pub fn realloc(ptr: *mut c_void, size: usize, site: CallSite) -> Route<*mut c_void> {
    let res = state::with_heap("realloc", |heap| {
        let ptr = ptr.cast::<u8>();
        if !ptr.is_null() && !heap.contains(ptr) {
            return Ok(None);
        }
        heap.resize(ptr, size, site).map(Some)
    });
    match res {
        Some(Ok(Some(out))) => Route::Heap(out.map_or(ptr::null_mut(), |p| p.as_ptr().cast())),
        Some(Ok(None)) => {
            state::counters().record(AbiEvent::Foreign);
            Route::Native
        }
        Some(Err(err)) => {
            set_errno(errno_for(&err));
            Route::Heap(ptr::null_mut())
        }
        None => {
            state::counters().record(AbiEvent::Native);
            Route::Native
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap_ptr(route: Route<*mut c_void>) -> *mut c_void {
        match route {
            Route::Heap(ptr) => ptr,
            Route::Native => panic!("heap should serve the call"),
        }
    }

    #[test]
    fn served_allocations_round_trip() {
        let site = CallSite::caller();
        let ptr = heap_ptr(malloc(40, site));
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % 16, 0);
        let grown = heap_ptr(realloc(ptr, 5000, site));
        assert!(!grown.is_null());
        assert_eq!(free(grown, site), Route::Heap(()));
    }

    #[test]
    fn calloc_overflow_sets_enomem() {
        let ptr = heap_ptr(calloc(usize::MAX, 2, CallSite::Unknown));
        assert!(ptr.is_null());
        // SAFETY: reading this thread's errno.
        assert_eq!(unsafe { *libc::__errno_location() }, libc::ENOMEM);
    }

    #[test]
    fn pvalloc_rounds_to_blocks() {
        let ptr = heap_ptr(pvalloc(0, CallSite::Unknown));
        assert_eq!(ptr as usize % BLOCK_SIZE, 0);
        free(ptr, CallSite::Unknown);
    }

    #[test]
    fn posix_memalign_validates_alignment() {
        let mut out = ptr::null_mut();
        assert_eq!(
            posix_memalign(&mut out, 12, 8, CallSite::Unknown),
            Route::Heap(libc::EINVAL)
        );
        assert_eq!(
            posix_memalign(&mut out, 256, 100, CallSite::Unknown),
            Route::Heap(0)
        );
        assert_eq!(out as usize % 256, 0);
        free(out, CallSite::Unknown);
    }

    #[test]
    fn foreign_pointers_go_native() {
        let mut local = 0u64;
        let foreign = (&raw mut local).cast::<c_void>();
        assert_eq!(free(foreign, CallSite::Unknown), Route::Native);
        assert_eq!(realloc(foreign, 16, CallSite::Unknown), Route::Native);
        assert!(state::counters().snapshot().foreign_pointers >= 2);
    }

    #[test]
    fn c_call_sites() {
        // SAFETY: literal with static lifetime.
        let site = unsafe { site_from_c(c"main.c".as_ptr(), 42) };
        assert_eq!(
            site,
            CallSite::Location {
                file: "main.c",
                line: 42
            }
        );
        // SAFETY: null is accepted.
        assert_eq!(unsafe { site_from_c(ptr::null(), 1) }, CallSite::Unknown);
        // SAFETY: literal with static lifetime.
        assert_eq!(unsafe { site_from_c(c"a.c".as_ptr(), -1) }, CallSite::Unknown);
    }
}
