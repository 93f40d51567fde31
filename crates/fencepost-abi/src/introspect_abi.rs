//! `fencepost_*` introspection entry points: error codes, runtime flags,
//! reports and pointer verification.

use std::ffi::{c_char, c_int, c_uint, c_ulong, c_void};

use fencepost_core::{CallSite, DebugFlags, c_strerror};

use crate::config;
use crate::reentry;
use crate::state;

/// Code of the last error the heap reported.
#[unsafe(no_mangle)]
pub extern "C" fn fencepost_errno() -> c_int {
    state::last_error().code() as c_int
}

/// Static message for an error code; never null.
#[unsafe(no_mangle)]
pub extern "C" fn fencepost_strerror(code: c_int) -> *const c_char {
    c_strerror(u32::try_from(code).unwrap_or(u32::MAX)).as_ptr()
}

/// Replaces the debug flag mask and returns the previous one. The heap picks
/// the new mask up on its next call.
#[unsafe(no_mangle)]
pub extern "C" fn fencepost_debug(flags: c_uint) -> c_uint {
    config::set_flags(DebugFlags::from_bits_truncate(flags)).bits()
}

#[unsafe(no_mangle)]
pub extern "C" fn fencepost_debug_current() -> c_uint {
    config::ensure_resolved();
    config::flags().bits()
}

/// Operation counter, for use as a `fencepost_log_changed` mark.
#[unsafe(no_mangle)]
pub extern "C" fn fencepost_mark() -> c_ulong {
    let Some(_guard) = reentry::enter() else {
        return 0;
    };
    state::with_heap("fencepost_mark", |heap| Ok(heap.iteration()))
        .and_then(Result::ok)
        .map_or(0, |iter| c_ulong::try_from(iter).unwrap_or(c_ulong::MAX))
}

/// Writes the statistics report to the log.
#[unsafe(no_mangle)]
pub extern "C" fn fencepost_log_stats() {
    let Some(_guard) = reentry::enter() else {
        return;
    };
    let _ = state::with_heap("fencepost_log_stats", |heap| {
        heap.log_stats();
        Ok(())
    });
}

/// Logs allocations touched since `mark`.
#[unsafe(no_mangle)]
pub extern "C" fn fencepost_log_changed(
    mark: c_ulong,
    not_freed: c_int,
    freed: c_int,
    details: c_int,
) {
    let Some(_guard) = reentry::enter() else {
        return;
    };
    let _ = state::with_heap("fencepost_log_changed", |heap| {
        heap.log_changed(u64::from(mark), not_freed != 0, freed != 0, details != 0);
        Ok(())
    });
}

/// Logs every allocation not yet released.
#[unsafe(no_mangle)]
pub extern "C" fn fencepost_log_unfreed() {
    fencepost_log_changed(0, 1, 0, 1);
}

/// Verifies one pointer, or the whole heap when `ptr` is null. Returns 1
/// when no problem was found and 0 otherwise. Pointers outside the heap
/// verify as good.
#[unsafe(no_mangle)]
pub extern "C" fn fencepost_verify(ptr: *const c_void) -> c_int {
    let Some(_guard) = reentry::enter() else {
        return 1;
    };
    let res = state::with_heap("fencepost_verify", |heap| {
        if ptr.is_null() {
            heap.heap_check()
        } else {
            heap.check_pointer("fencepost_verify", ptr.cast(), true, 0)
        }
    });
    c_int::from(!matches!(res, Some(Err(_))))
}

/// Reports the user size, call-site line and last-use counter of a live
/// allocation. Any output pointer may be null. Returns 1 when `ptr` is a live
/// allocation and 0 otherwise.
///
/// # Safety
///
/// Non-null output pointers must be valid for writes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fencepost_examine(
    ptr: *const c_void,
    size_out: *mut usize,
    line_out: *mut c_uint,
    use_iter_out: *mut c_ulong,
) -> c_int {
    let Some(_guard) = reentry::enter() else {
        return 0;
    };
    let info = state::with_heap("fencepost_examine", |heap| heap.read_info(ptr.cast()));
    let Some(Ok(info)) = info else {
        return 0;
    };
    let line = match info.site {
        CallSite::Location { line, .. } => line,
        CallSite::Unknown | CallSite::ReturnAddress(_) => 0,
    };
    // SAFETY: each non-null output pointer is writable per the contract.
    unsafe {
        if !size_out.is_null() {
            *size_out = info.user_size;
        }
        if !line_out.is_null() {
            *line_out = line;
        }
        if !use_iter_out.is_null() {
            *use_iter_out = c_ulong::try_from(info.use_iter).unwrap_or(c_ulong::MAX);
        }
    }
    1
}
