//! Error taxonomy for the chunk allocator.
//!
//! Recoverable errors (bad arguments, unknown pointers, fence damage, dirty
//! free memory) are returned to the caller, which records them as the last
//! error. [`ChunkError::Corrupt`] means the indexes can no longer be trusted
//! and must reach a fatal handler; it is never absorbed.

use core::ffi::CStr;
use core::fmt;
use thiserror::Error;

/// Which fence of an allocation was found damaged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum FenceSide {
    Bottom,
    Top,
}

impl fmt::Display for FenceSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Bottom => "under",
            Self::Top => "over",
        })
    }
}

/// Specific index or metadata inconsistency behind [`ChunkError::Corrupt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Corruption {
    #[error("address index already holds {0:#x}")]
    DuplicateAddress(usize),
    #[error("slot for {0:#x} is not linked at level 0 of its index")]
    Unlinked(usize),
    #[error("free-size index returned {0:#x} which is not flagged free")]
    NotFree(usize),
    #[error("divided block of {0} bytes missing right after creation")]
    DividedMiss(usize),
    #[error("entry block at {0:#x} has a damaged magic marker")]
    EntryMagic(usize),
    #[error("address index out of order at {0:#x}")]
    AddressOrder(usize),
    #[error("free-size index out of order at {0:#x}")]
    SizeOrder(usize),
    #[error("slot for {0:#x} lies outside the arena")]
    OutsideArena(usize),
    #[error("slot for {0:#x} carries inconsistent flags")]
    BadFlags(usize),
    #[error("arena returned misaligned memory at {0:#x}")]
    ArenaAlignment(usize),
}

/// Errors produced by heap operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChunkError {
    #[error("invalid allocation size {0}")]
    BadSize(usize),
    #[error("allocation of {size} bytes exceeds the largest block of {limit} bytes")]
    TooBig { size: usize, limit: usize },
    #[error("alignment {0} is not supported")]
    BadAlignment(usize),
    #[error("tried to free a null pointer")]
    FreeNull,
    #[error("pointer {0:#x} not found")]
    NotFound(usize),
    #[error("{side} fence post overwritten for pointer {addr:#x}")]
    Fence { side: FenceSide, addr: usize },
    #[error("free memory at {addr:#x} was overwritten")]
    FreeNonBlank { addr: usize },
    #[error("pointer {addr:#x} has fewer than {needed} bytes available")]
    WouldOverwrite { addr: usize, needed: usize },
    #[error("arena could not supply {0} bytes")]
    ArenaExhausted(usize),
    #[error("heap corruption: {0}")]
    Corrupt(Corruption),
}

impl From<Corruption> for ChunkError {
    fn from(value: Corruption) -> Self {
        Self::Corrupt(value)
    }
}

impl ChunkError {
    /// Stable code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::BadSize(_) => ErrorCode::BadSize,
            Self::TooBig { .. } => ErrorCode::TooBig,
            Self::BadAlignment(_) => ErrorCode::BadAlignment,
            Self::FreeNull => ErrorCode::FreeNull,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Fence {
                side: FenceSide::Bottom,
                ..
            } => ErrorCode::UnderFence,
            Self::Fence {
                side: FenceSide::Top,
                ..
            } => ErrorCode::OverFence,
            Self::FreeNonBlank { .. } => ErrorCode::FreeNonBlank,
            Self::WouldOverwrite { .. } => ErrorCode::WouldOverwrite,
            Self::ArenaExhausted(_) => ErrorCode::ArenaExhausted,
            Self::Corrupt(_) => ErrorCode::Corrupt,
        }
    }

    /// True when the heap must not be used again after this error.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Corrupt(_))
    }
}

/// Numeric error codes, stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
#[repr(u32)]
pub enum ErrorCode {
    None = 0,
    BadSize = 10,
    TooBig = 11,
    BadAlignment = 12,
    FreeNull = 13,
    NotFound = 20,
    UnderFence = 30,
    OverFence = 31,
    FreeNonBlank = 40,
    WouldOverwrite = 41,
    ArenaExhausted = 50,
    Corrupt = 60,
}

impl ErrorCode {
    pub const ALL: [Self; 12] = [
        Self::None,
        Self::BadSize,
        Self::TooBig,
        Self::BadAlignment,
        Self::FreeNull,
        Self::NotFound,
        Self::UnderFence,
        Self::OverFence,
        Self::FreeNonBlank,
        Self::WouldOverwrite,
        Self::ArenaExhausted,
        Self::Corrupt,
    ];

    #[must_use]
    pub const fn code(self) -> u32 {
        self as u32
    }

    #[must_use]
    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.code() == code)
    }

    /// Message as a C string, for the C ABI.
    #[must_use]
    pub const fn c_message(self) -> &'static CStr {
        match self {
            Self::None => c"no error",
            Self::BadSize => c"invalid allocation size",
            Self::TooBig => c"allocation exceeds the largest block",
            Self::BadAlignment => c"unsupported alignment",
            Self::FreeNull => c"tried to free a null pointer",
            Self::NotFound => c"pointer not found",
            Self::UnderFence => c"failed under fence-post check",
            Self::OverFence => c"failed over fence-post check",
            Self::FreeNonBlank => c"free space has been overwritten",
            Self::WouldOverwrite => c"use of pointer would exceed allocation",
            Self::ArenaExhausted => c"could not grow the heap",
            Self::Corrupt => c"heap index corruption",
        }
    }

    #[must_use]
    pub fn message(self) -> &'static str {
        self.c_message().to_str().unwrap_or_default()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

const INVALID_CODE: &CStr = c"errno value is not valid";

/// Message for a raw error number, tolerating values that are not codes.
#[must_use]
pub fn strerror(code: u32) -> &'static str {
    c_strerror(code).to_str().unwrap_or_default()
}

/// [`strerror`] as a C string.
#[must_use]
pub fn c_strerror(code: u32) -> &'static CStr {
    ErrorCode::from_code(code).map_or(INVALID_CODE, ErrorCode::c_message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_through_from_code() {
        for code in ErrorCode::ALL {
            assert_eq!(ErrorCode::from_code(code.code()), Some(code));
        }
    }

    #[test]
    fn unknown_code_has_generic_message() {
        assert_eq!(strerror(9999), "errno value is not valid");
        assert_eq!(strerror(20), "pointer not found");
    }

    #[test]
    fn only_corruption_is_fatal() {
        assert!(ChunkError::Corrupt(Corruption::NotFree(0x10)).is_fatal());
        assert!(!ChunkError::NotFound(0x10).is_fatal());
        assert!(!ChunkError::BadSize(0).is_fatal());
    }

    #[test]
    fn fence_side_selects_code() {
        let under = ChunkError::Fence {
            side: FenceSide::Bottom,
            addr: 0x1000,
        };
        let over = ChunkError::Fence {
            side: FenceSide::Top,
            addr: 0x1000,
        };
        assert_eq!(under.code(), ErrorCode::UnderFence);
        assert_eq!(over.code(), ErrorCode::OverFence);
        assert_eq!(over.to_string(), "over fence post overwritten for pointer 0x1000");
    }

    #[test]
    fn corruption_converts_into_chunk_error() {
        let err: ChunkError = Corruption::DuplicateAddress(0x2000).into();
        assert_eq!(err.code(), ErrorCode::Corrupt);
        assert_eq!(
            err.to_string(),
            "heap corruption: address index already holds 0x2000"
        );
    }
}
