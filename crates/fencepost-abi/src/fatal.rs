//! Fatal path: log, optionally dump core, and leave without cleanup.

use std::ffi::c_int;

use fencepost_core::{ChunkError, DebugFlags, EventSink};

const FATAL_EXIT_CODE: c_int = 1;

/// Reports `err` from `func` and terminates the process.
///
/// With error-dump the process aborts so the system can write a core file;
/// otherwise it exits immediately, skipping atexit handlers and destructors
/// that would run against a heap nobody can trust any more.
pub fn die(sink: &mut dyn EventSink, flags: DebugFlags, func: &str, err: &ChunkError) -> ! {
    let code = err.code().code();
    sink.record(format_args!("FATAL: {func}: {err} (err {code})"));
    let mut stderr = crate::log_sink::FdSink::stderr_only();
    stderr.configure(DebugFlags::PRINT_MESSAGES);
    stderr.record(format_args!("fencepost: fatal error in {func}: {err}"));
    if flags.contains(DebugFlags::ERROR_DUMP) {
        // SAFETY: abort has no preconditions.
        unsafe { libc::abort() }
    }
    // SAFETY: _exit has no preconditions and does not return.
    unsafe { libc::_exit(FATAL_EXIT_CODE) }
}
