//! Runtime configuration from the `FENCEPOST_OPTIONS` environment variable.
//!
//! The variable is read once, through `libc::getenv` so that resolution never
//! allocates. Settings live in atomics afterwards; `fencepost_debug` can
//! replace the flag mask at runtime and the heap picks it up on the next call.

use std::ffi::{CStr, c_char};
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicUsize, Ordering};

use fencepost_core::{AddressBreak, DebugFlags, Options};
use parking_lot::Mutex;

/// Name of the options variable.
pub const OPTIONS_ENV: &CStr = c"FENCEPOST_OPTIONS";

/// Longest log path kept, including the terminating NUL.
pub const LOG_PATH_MAX: usize = 256;

/// NUL-terminated log path in a fixed buffer, with `%p` expanded to the pid.
#[derive(Clone, Copy)]
pub struct LogPath {
    buf: [u8; LOG_PATH_MAX],
    len: usize,
}

impl LogPath {
    pub const fn empty() -> Self {
        Self {
            buf: [0; LOG_PATH_MAX],
            len: 0,
        }
    }

    /// Copies `raw`, replacing each `%p` with `pid`. Paths that do not fit
    /// are dropped.
    #[must_use]
    pub fn expand(raw: &str, pid: u32) -> Self {
        let mut path = Self::empty();
        let mut rest = raw;
        while !rest.is_empty() {
            let (chunk, next) = match rest.find("%p") {
                Some(at) => (&rest[..at], Some(&rest[at + 2..])),
                None => (rest, None),
            };
            if !path.push(chunk.as_bytes()) {
                return Self::empty();
            }
            let Some(next) = next else {
                break;
            };
            let mut digits = [0u8; 10];
            if !path.push(format_decimal(pid, &mut digits)) {
                return Self::empty();
            }
            rest = next;
        }
        path
    }

    fn push(&mut self, bytes: &[u8]) -> bool {
        if bytes.contains(&0) || self.len + bytes.len() >= LOG_PATH_MAX {
            return false;
        }
        self.buf[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        true
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn as_c_str(&self) -> Option<&CStr> {
        if self.is_empty() {
            return None;
        }
        CStr::from_bytes_with_nul(&self.buf[..=self.len]).ok()
    }
}

fn format_decimal(mut value: u32, out: &mut [u8; 10]) -> &[u8] {
    let mut at = out.len();
    loop {
        at -= 1;
        out[at] = b'0' + (value % 10) as u8;
        value /= 10;
        if value == 0 {
            break;
        }
    }
    &out[at..]
}

/// Everything the heap needs at construction.
#[derive(Clone, Copy)]
pub struct Settings {
    pub flags: DebugFlags,
    pub interval: Option<u32>,
    pub lock_on: u32,
    pub watch: Option<AddressBreak>,
    pub log_path: LogPath,
    /// The option string did not parse; defaults are in effect.
    pub rejected: bool,
}

impl Settings {
    /// Settings from an option string. A malformed string yields defaults
    /// with `rejected` set; the allocator must keep working either way.
    #[must_use]
    pub fn from_options(raw: &str, pid: u32) -> Self {
        match Options::parse(raw) {
            Ok(opts) => Self {
                flags: opts.flags_or_empty(),
                interval: opts.interval,
                lock_on: opts.lock_on.unwrap_or(0),
                watch: opts.address,
                log_path: opts
                    .log_path
                    .map_or(LogPath::empty(), |path| LogPath::expand(path, pid)),
                rejected: false,
            },
            Err(_) => Self {
                rejected: true,
                ..Self::default()
            },
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            flags: DebugFlags::empty(),
            interval: None,
            lock_on: 0,
            watch: None,
            log_path: LogPath::empty(),
            rejected: false,
        }
    }
}

// 0=unresolved, 1=resolving, 2=resolved. A reentrant or concurrent reader
// that sees RESOLVING gets `None` and takes the native path.
const CONFIG_UNRESOLVED: u8 = 0;
const CONFIG_RESOLVING: u8 = 1;
const CONFIG_RESOLVED: u8 = 2;

static CONFIG_STATE: AtomicU8 = AtomicU8::new(CONFIG_UNRESOLVED);
static FLAGS: AtomicU32 = AtomicU32::new(0);
static INTERVAL: AtomicU32 = AtomicU32::new(0);
static LOCK_ON: AtomicU32 = AtomicU32::new(0);
static WATCH_ADDR: AtomicUsize = AtomicUsize::new(0);
static WATCH_COUNT: AtomicU32 = AtomicU32::new(0);
static REJECTED: AtomicU8 = AtomicU8::new(0);
static LOG_PATH: Mutex<LogPath> = Mutex::new(LogPath::empty());

fn read_env() -> Settings {
    // SAFETY: getenv returns null or a NUL-terminated string owned by the
    // environment; it is only read before this function returns.
    let raw = unsafe { libc::getenv(OPTIONS_ENV.as_ptr()) };
    if raw.is_null() {
        return Settings::default();
    }
    // SAFETY: non-null getenv results are NUL-terminated.
    let value = unsafe { CStr::from_ptr(raw.cast::<c_char>()) };
    // SAFETY: getpid has no preconditions.
    let pid = unsafe { libc::getpid() }.unsigned_abs();
    match value.to_str() {
        Ok(text) => Settings::from_options(text, pid),
        Err(_) => Settings {
            rejected: true,
            ..Settings::default()
        },
    }
}

fn publish(settings: &Settings) {
    FLAGS.store(settings.flags.bits(), Ordering::Relaxed);
    INTERVAL.store(settings.interval.unwrap_or(0), Ordering::Relaxed);
    LOCK_ON.store(settings.lock_on, Ordering::Relaxed);
    let (addr, count) = settings
        .watch
        .map_or((0, 0), |w| (w.addr, w.count.unwrap_or(0)));
    WATCH_ADDR.store(addr, Ordering::Relaxed);
    WATCH_COUNT.store(count, Ordering::Relaxed);
    REJECTED.store(u8::from(settings.rejected), Ordering::Relaxed);
    *LOG_PATH.lock() = settings.log_path;
}

fn load() -> Settings {
    let watch_addr = WATCH_ADDR.load(Ordering::Relaxed);
    let watch_count = WATCH_COUNT.load(Ordering::Relaxed);
    Settings {
        flags: DebugFlags::from_bits_truncate(FLAGS.load(Ordering::Relaxed)),
        interval: Some(INTERVAL.load(Ordering::Relaxed)).filter(|n| *n > 0),
        lock_on: LOCK_ON.load(Ordering::Relaxed),
        watch: (watch_addr != 0).then_some(AddressBreak {
            addr: watch_addr,
            count: Some(watch_count).filter(|n| *n > 0),
        }),
        log_path: *LOG_PATH.lock(),
        rejected: REJECTED.load(Ordering::Relaxed) != 0,
    }
}

/// Resolves the options on first use. False while another caller (or a
/// reentrant call on this thread) is still resolving them.
pub fn ensure_resolved() -> bool {
    let state = CONFIG_STATE.load(Ordering::Acquire);
    if state == CONFIG_RESOLVED {
        return true;
    }
    if state == CONFIG_RESOLVING {
        return false;
    }
    if CONFIG_STATE
        .compare_exchange(
            CONFIG_UNRESOLVED,
            CONFIG_RESOLVING,
            Ordering::SeqCst,
            Ordering::Relaxed,
        )
        .is_err()
    {
        return CONFIG_STATE.load(Ordering::Acquire) == CONFIG_RESOLVED;
    }
    publish(&read_env());
    CONFIG_STATE.store(CONFIG_RESOLVED, Ordering::Release);
    true
}

/// Resolved settings, or `None` while they are being resolved.
#[must_use]
pub fn settings() -> Option<Settings> {
    ensure_resolved().then(load)
}

/// Current flag mask; empty until the options are resolved.
#[must_use]
pub fn flags() -> DebugFlags {
    DebugFlags::from_bits_truncate(FLAGS.load(Ordering::Relaxed))
}

/// Replaces the flag mask and returns the previous one.
pub fn set_flags(flags: DebugFlags) -> DebugFlags {
    ensure_resolved();
    DebugFlags::from_bits_truncate(FLAGS.swap(flags.bits(), Ordering::Relaxed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_follow_option_string() {
        let s = Settings::from_options("check-fence,log-stats,inter=5,lockon=3,addr=0x1000:2", 1);
        assert_eq!(s.flags, DebugFlags::CHECK_FENCE | DebugFlags::LOG_STATS);
        assert_eq!(s.interval, Some(5));
        assert_eq!(s.lock_on, 3);
        assert_eq!(
            s.watch,
            Some(AddressBreak {
                addr: 0x1000,
                count: Some(2)
            })
        );
        assert!(s.log_path.is_empty());
        assert!(!s.rejected);
    }

    #[test]
    fn malformed_string_falls_back_to_defaults() {
        let s = Settings::from_options("check-fence,no-such-token", 1);
        assert!(s.rejected);
        assert!(s.flags.is_empty());
    }

    #[test]
    fn log_path_expands_pid() {
        let path = LogPath::expand("/tmp/fp.%p.log", 4321);
        assert_eq!(path.as_c_str(), Some(c"/tmp/fp.4321.log"));
        let twice = LogPath::expand("%p-%p", 7);
        assert_eq!(twice.as_c_str(), Some(c"7-7"));
        let plain = Settings::from_options("log=out.log", 9);
        assert_eq!(plain.log_path.as_c_str(), Some(c"out.log"));
    }

    #[test]
    fn overlong_log_path_is_dropped() {
        let long = "x".repeat(LOG_PATH_MAX);
        assert!(LogPath::expand(&long, 1).is_empty());
        assert_eq!(LogPath::expand("", 1).as_c_str(), None);
    }

    #[test]
    fn decimal_formatting() {
        let mut buf = [0u8; 10];
        assert_eq!(format_decimal(0, &mut buf), b"0");
        assert_eq!(format_decimal(u32::MAX, &mut buf), b"4294967295");
    }
}
