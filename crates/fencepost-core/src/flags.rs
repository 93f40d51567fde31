//! Debug flags, their tokens, and the tags that group them.
//!
//! Flags are read by the heap at every operation; the embedding layer may
//! change them between calls with [`crate::ChunkHeap::set_flags`].

use core::fmt;
use core::ops::{BitAnd, BitOr, BitOrAssign, Not};

/// Bit set of debugging behaviours.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DebugFlags(u32);

impl DebugFlags {
    pub const LOG_STATS: Self = Self(1 << 0);
    pub const LOG_NON_FREE: Self = Self(1 << 1);
    pub const LOG_TRANS: Self = Self(1 << 2);
    pub const LOG_ADMIN: Self = Self(1 << 3);
    pub const LOG_BAD_SPACE: Self = Self(1 << 4);
    pub const LOG_UNKNOWN: Self = Self(1 << 5);
    pub const CHECK_FENCE: Self = Self(1 << 6);
    pub const CHECK_HEAP: Self = Self(1 << 7);
    pub const CHECK_LISTS: Self = Self(1 << 8);
    pub const CHECK_BLANK: Self = Self(1 << 9);
    pub const CATCH_NULL: Self = Self(1 << 10);
    pub const FREE_BLANK: Self = Self(1 << 11);
    pub const ALLOC_BLANK: Self = Self(1 << 12);
    pub const REALLOC_COPY: Self = Self(1 << 13);
    pub const NEVER_REUSE: Self = Self(1 << 14);
    pub const ERROR_ABORT: Self = Self(1 << 15);
    pub const ERROR_FREE_NULL: Self = Self(1 << 16);
    pub const ALLOW_ZERO: Self = Self(1 << 17);
    pub const PRINT_MESSAGES: Self = Self(1 << 18);
    pub const LOG_STAMP: Self = Self(1 << 19);
    pub const ERROR_DUMP: Self = Self(1 << 20);

    const KNOWN: u32 = (1 << 21) - 1;

    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Keeps only bits that name a flag.
    #[must_use]
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & Self::KNOWN)
    }

    /// Bits that do not correspond to any flag.
    #[must_use]
    pub const fn unknown_bits(bits: u32) -> u32 {
        bits & !Self::KNOWN
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    /// Tokens whose flag is fully contained in `self`.
    pub fn tokens(self) -> impl Iterator<Item = &'static Token> {
        TOKENS.iter().filter(move |t| self.contains(t.flag))
    }
}

impl BitOr for DebugFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl BitOrAssign for DebugFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.insert(rhs);
    }
}

impl BitAnd for DebugFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl Not for DebugFlags {
    type Output = Self;

    fn not(self) -> Self {
        Self(!self.0 & Self::KNOWN)
    }
}

impl fmt::Display for DebugFlags {
    /// Comma separated long tokens, or `none`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for token in self.tokens() {
            if !first {
                f.write_str(",")?;
            }
            f.write_str(token.name)?;
            first = false;
        }
        if first {
            f.write_str("none")?;
        }
        Ok(())
    }
}

/// A named debug flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub name: &'static str,
    pub short: &'static str,
    pub flag: DebugFlags,
    pub description: &'static str,
}

const fn token(
    name: &'static str,
    short: &'static str,
    flag: DebugFlags,
    description: &'static str,
) -> Token {
    Token {
        name,
        short,
        flag,
        description,
    }
}

pub const TOKENS: &[Token] = &[
    token("log-stats", "lst", DebugFlags::LOG_STATS, "log general statistics"),
    token("log-non-free", "lnf", DebugFlags::LOG_NON_FREE, "log non-freed pointers"),
    token("log-trans", "ltr", DebugFlags::LOG_TRANS, "log memory transactions"),
    token("log-admin", "lad", DebugFlags::LOG_ADMIN, "log administrative info"),
    token("log-bad-space", "lbs", DebugFlags::LOG_BAD_SPACE, "dump space from bad pointers"),
    token("log-unknown", "lun", DebugFlags::LOG_UNKNOWN, "report unknown call sites"),
    token("check-fence", "cfe", DebugFlags::CHECK_FENCE, "check fence-post errors"),
    token("check-heap", "che", DebugFlags::CHECK_HEAP, "examine heap adm structs"),
    token("check-lists", "cli", DebugFlags::CHECK_LISTS, "check every index level"),
    token("check-blank", "cbl", DebugFlags::CHECK_BLANK, "check for blanked free memory"),
    token("catch-null", "cnu", DebugFlags::CATCH_NULL, "abort if the heap cannot grow"),
    token("free-blank", "fbl", DebugFlags::FREE_BLANK, "overwrite freed memory"),
    token("alloc-blank", "abl", DebugFlags::ALLOC_BLANK, "overwrite allocated memory"),
    token("realloc-copy", "rco", DebugFlags::REALLOC_COPY, "copy all re-allocations"),
    token("never-reuse", "nre", DebugFlags::NEVER_REUSE, "never reuse freed memory"),
    token("error-abort", "eab", DebugFlags::ERROR_ABORT, "abort immediately on error"),
    token("error-free-null", "efn", DebugFlags::ERROR_FREE_NULL, "generate error when freeing null"),
    token("allow-zero", "azr", DebugFlags::ALLOW_ZERO, "allow zero-size allocations"),
    token("print-messages", "pme", DebugFlags::PRINT_MESSAGES, "write messages to stderr"),
    token("log-stamp", "lsm", DebugFlags::LOG_STAMP, "timestamp each log line"),
    token("error-dump", "edu", DebugFlags::ERROR_DUMP, "dump core on fatal errors"),
];

/// A named group of tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tag {
    pub name: &'static str,
    pub flags: DebugFlags,
}

const RUNTIME: DebugFlags = DebugFlags(
    DebugFlags::LOG_STATS.0
        | DebugFlags::LOG_NON_FREE.0
        | DebugFlags::LOG_BAD_SPACE.0
        | DebugFlags::LOG_UNKNOWN.0
        | DebugFlags::CHECK_FENCE.0
        | DebugFlags::CATCH_NULL.0,
);
const LOW: DebugFlags = DebugFlags(
    RUNTIME.0 | DebugFlags::FREE_BLANK.0 | DebugFlags::ERROR_ABORT.0 | DebugFlags::ALLOC_BLANK.0,
);
const MEDIUM: DebugFlags = DebugFlags(
    LOW.0 | DebugFlags::CHECK_HEAP.0 | DebugFlags::CHECK_LISTS.0 | DebugFlags::REALLOC_COPY.0,
);
const HIGH: DebugFlags = DebugFlags(MEDIUM.0 | DebugFlags::CHECK_BLANK.0);
const ALL: DebugFlags = DebugFlags(
    HIGH.0
        | DebugFlags::LOG_TRANS.0
        | DebugFlags::LOG_STAMP.0
        | DebugFlags::LOG_ADMIN.0
        | DebugFlags::NEVER_REUSE.0,
);

pub const TAGS: &[Tag] = &[
    Tag { name: "runtime", flags: RUNTIME },
    Tag { name: "run", flags: RUNTIME },
    Tag { name: "low", flags: LOW },
    Tag { name: "med", flags: MEDIUM },
    Tag { name: "medium", flags: MEDIUM },
    Tag { name: "high", flags: HIGH },
    Tag { name: "all", flags: ALL },
];

/// Flag for a long or short token name (case-insensitive).
#[must_use]
pub fn token_flag(name: &str) -> Option<DebugFlags> {
    TOKENS
        .iter()
        .find(|t| t.name.eq_ignore_ascii_case(name) || t.short.eq_ignore_ascii_case(name))
        .map(|t| t.flag)
}

/// Flags grouped under a tag name (case-insensitive).
#[must_use]
pub fn tag_flags(name: &str) -> Option<DebugFlags> {
    TAGS.iter()
        .find(|t| t.name.eq_ignore_ascii_case(name))
        .map(|t| t.flags)
}
