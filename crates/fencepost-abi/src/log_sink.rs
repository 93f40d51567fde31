//! Event sink writing lines to a file descriptor with `libc::write`.
//!
//! Each message is formatted into a fixed stack buffer, so logging from
//! inside `malloc` never allocates. Overlong messages are truncated.

use std::ffi::{CStr, c_int};
use std::fmt::{self, Write as _};

use fencepost_core::{DebugFlags, EventSink};

/// Longest line written, newline included.
pub const LINE_MAX: usize = 1024;

const STDERR: c_int = 2;

/// Fixed-capacity line buffer implementing `fmt::Write`.
pub struct LineBuf {
    buf: [u8; LINE_MAX],
    len: usize,
}

impl LineBuf {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            buf: [0; LINE_MAX],
            len: 0,
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Terminates the line, overwriting the last byte when full.
    pub fn finish(&mut self) {
        if self.len == LINE_MAX {
            self.len -= 1;
        }
        self.buf[self.len] = b'\n';
        self.len += 1;
    }
}

impl Default for LineBuf {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Write for LineBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = LINE_MAX - self.len;
        let take = s.len().min(room);
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

fn write_all(fd: c_int, mut bytes: &[u8]) {
    while !bytes.is_empty() {
        // SAFETY: `bytes` is a valid readable slice for its length.
        let n = unsafe { libc::write(fd, bytes.as_ptr().cast(), bytes.len()) };
        if n <= 0 {
            return;
        }
        bytes = &bytes[n.unsigned_abs()..];
    }
}

/// Writes events to the log file and, with print-messages, to stderr.
pub struct FdSink {
    fd: Option<c_int>,
    echo: bool,
    stamp: bool,
}

impl FdSink {
    /// Sink with no log file.
    #[must_use]
    pub const fn stderr_only() -> Self {
        Self {
            fd: None,
            echo: false,
            stamp: false,
        }
    }

    /// Opens (truncating) the log file at `path`. Falls back to no log file
    /// when it cannot be opened.
    #[must_use]
    pub fn open(path: Option<&CStr>) -> Self {
        let fd = path.and_then(|path| {
            // SAFETY: `path` is NUL-terminated.
            let fd = unsafe {
                libc::open(
                    path.as_ptr(),
                    libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC | libc::O_CLOEXEC,
                    0o644,
                )
            };
            (fd >= 0).then_some(fd)
        });
        Self {
            fd,
            ..Self::stderr_only()
        }
    }

    #[must_use]
    pub fn has_log_file(&self) -> bool {
        self.fd.is_some()
    }

    /// Picks up the flags that shape output.
    pub fn configure(&mut self, flags: DebugFlags) {
        self.echo = flags.contains(DebugFlags::PRINT_MESSAGES);
        self.stamp = flags.contains(DebugFlags::LOG_STAMP);
    }

    /// Formats one line into `line`.
    pub fn format(&self, line: &mut LineBuf, args: fmt::Arguments<'_>) {
        if self.stamp {
            // SAFETY: time accepts a null output pointer.
            let now = unsafe { libc::time(std::ptr::null_mut()) };
            let _ = write!(line, "{now}: ");
        }
        let _ = line.write_fmt(args);
        line.finish();
    }
}

impl EventSink for FdSink {
    fn record(&mut self, args: fmt::Arguments<'_>) {
        if self.fd.is_none() && !self.echo {
            return;
        }
        let mut line = LineBuf::new();
        self.format(&mut line, args);
        if let Some(fd) = self.fd {
            write_all(fd, line.as_bytes());
        }
        if self.echo {
            write_all(STDERR, line.as_bytes());
        }
    }
}

impl Drop for FdSink {
    fn drop(&mut self) {
        if let Some(fd) = self.fd.take() {
            // SAFETY: the descriptor was opened by this sink.
            unsafe { libc::close(fd) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_lines_are_truncated_with_newline() {
        let sink = FdSink::stderr_only();
        let mut line = LineBuf::new();
        let long = "y".repeat(2 * LINE_MAX);
        sink.format(&mut line, format_args!("{long}"));
        assert_eq!(line.as_bytes().len(), LINE_MAX);
        assert_eq!(line.as_bytes().last(), Some(&b'\n'));
    }

    #[test]
    fn stamp_prefixes_seconds() {
        let mut sink = FdSink::stderr_only();
        sink.configure(DebugFlags::LOG_STAMP);
        let mut line = LineBuf::new();
        sink.format(&mut line, format_args!("1: free"));
        let text = std::str::from_utf8(line.as_bytes()).unwrap();
        let (secs, rest) = text.split_once(": ").unwrap();
        assert!(secs.parse::<i64>().unwrap() > 0);
        assert_eq!(rest, "1: free\n");
    }

    #[test]
    fn log_file_receives_lines() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("fencepost-sink-{}.log", std::process::id()));
        let c_path = std::ffi::CString::new(path.to_str().unwrap()).unwrap();
        let mut sink = FdSink::open(Some(&c_path));
        assert!(sink.has_log_file());
        sink.record(format_args!("3: alloc {} bytes", 10));
        drop(sink);
        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(text, "3: alloc 10 bytes\n");
    }

    #[test]
    fn unopenable_path_disables_file() {
        let sink = FdSink::open(Some(c"/nonexistent-dir/fencepost.log"));
        assert!(!sink.has_log_file());
    }
}
