//! Contract tests for the exported allocator entry points.
//!
//! Debug builds do not unmangle the symbols, so the functions are called as
//! plain Rust items and the test binary keeps the system allocator.

use std::ffi::{CStr, c_uint, c_ulong, c_void};
use std::ptr;

use fencepost_abi::introspect_abi::{
    fencepost_debug, fencepost_debug_current, fencepost_errno, fencepost_examine, fencepost_mark,
    fencepost_strerror, fencepost_verify,
};
use fencepost_abi::malloc_abi::{
    calloc, fencepost_free_at, fencepost_malloc_at, free, malloc, memalign, posix_memalign,
    realloc, valloc,
};
use fencepost_abi::state;
use fencepost_core::DebugFlags;
use fencepost_core::constants::BLOCK_SIZE;

fn examine(ptr: *const c_void) -> Option<(usize, c_uint, c_ulong)> {
    let mut size = 0usize;
    let mut line: c_uint = 0;
    let mut iter: c_ulong = 0;
    // SAFETY: all output pointers are valid locals.
    let found = unsafe { fencepost_examine(ptr, &mut size, &mut line, &mut iter) };
    (found == 1).then_some((size, line, iter))
}

#[test]
fn malloc_free_lifecycle() {
    // SAFETY: exercising the allocator contract.
    unsafe {
        let p = malloc(100);
        assert!(!p.is_null());
        let (size, _, _) = examine(p).expect("live pointer");
        assert_eq!(size, 100);
        assert_eq!(fencepost_verify(p), 1);
        free(p);
        assert!(examine(p).is_none());
    }
}

#[test]
fn call_site_is_recorded() {
    // SAFETY: literal file name and a live pointer.
    unsafe {
        let p = fencepost_malloc_at(c"widget.c".as_ptr(), 88, 24);
        let (size, line, iter) = examine(p).unwrap();
        assert_eq!((size, line), (24, 88));
        assert!(iter > 0);
        assert!(fencepost_mark() >= iter);
        fencepost_free_at(c"widget.c".as_ptr(), 90, p);
    }
}

#[test]
fn realloc_preserves_prefix() {
    // SAFETY: writes stay inside the allocations.
    unsafe {
        let p = malloc(32).cast::<u8>();
        for i in 0..32u8 {
            p.add(usize::from(i)).write(i);
        }
        let q = realloc(p.cast(), 3 * BLOCK_SIZE).cast::<u8>();
        assert!(!q.is_null());
        for i in 0..32u8 {
            assert_eq!(q.add(usize::from(i)).read(), i);
        }
        let (size, _, _) = examine(q.cast()).unwrap();
        assert_eq!(size, 3 * BLOCK_SIZE);
        free(q.cast());
    }
}

#[test]
fn calloc_zeroes() {
    // SAFETY: reads stay inside the allocation.
    unsafe {
        let p = calloc(10, 30).cast::<u8>();
        assert!((0..300).all(|i| p.add(i).read() == 0));
        free(p.cast());
    }
}

#[test]
fn aligned_family() {
    // SAFETY: exercising the allocator contract.
    unsafe {
        let m = memalign(64, 200);
        assert_eq!(m as usize % 64, 0);
        let v = valloc(10);
        assert_eq!(v as usize % BLOCK_SIZE, 0);
        let mut out = ptr::null_mut();
        assert_eq!(posix_memalign(&mut out, 128, 50), 0);
        assert_eq!(out as usize % 128, 0);
        assert_eq!(posix_memalign(&mut out, 3, 50), libc::EINVAL);
        assert_eq!(posix_memalign(ptr::null_mut(), 16, 50), libc::EINVAL);
        free(m);
        free(v);
        free(out);
    }
}

#[test]
fn foreign_pointers_are_released_natively() {
    // SAFETY: the pointer comes from the system allocator of this binary.
    unsafe {
        let native = libc::malloc(64);
        assert!(!native.is_null());
        free(native);
    }
    assert!(state::counters().snapshot().foreign_pointers >= 1);
}

#[test]
fn flags_round_trip_through_debug() {
    let stamp = DebugFlags::LOG_STAMP.bits();
    let before = fencepost_debug_current();
    let previous = fencepost_debug(before | stamp);
    assert_eq!(previous, before);
    assert_eq!(fencepost_debug_current(), before | stamp);
    fencepost_debug(before);
}

#[test]
fn strerror_matches_errno() {
    let code = fencepost_errno();
    // SAFETY: static C string.
    let msg = unsafe { CStr::from_ptr(fencepost_strerror(code)) };
    assert!(!msg.is_empty());
}
