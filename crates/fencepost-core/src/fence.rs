//! Fence posts and pointer-info translation.
//!
//! [`PointerInfo`] splits a block into its regions:
//!
//! ```text
//! alloc_start  fence_bottom  user_start        user_bounds/fence_top  upper_bounds  alloc_bounds
//!     |  (valloc pad)  |  bottom fence  |  user data  |  top fence  |  slack  |
//! ```
//!
//! A fenced, block-aligned allocation gives up a whole block below the user
//! region so the user pointer stays aligned; the bottom fence is the last
//! [`FENCE_BOTTOM_SIZE`] bytes of that block.

#![allow(unsafe_code)]

use core::fmt;

use crate::constants::{
    BLOCK_SIZE, FENCE_BOTTOM_SIZE, FENCE_MAGIC_BOTTOM, FENCE_MAGIC_TOP, FENCE_TOP_SIZE,
};
use crate::error::FenceSide;
use crate::slot::SlotFlags;

/// Region boundaries of one block. Derived on demand, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PointerInfo {
    pub fenced: bool,
    pub aligned: bool,
    pub alloc_start: usize,
    pub fence_bottom: usize,
    pub user_start: usize,
    pub user_bounds: usize,
    pub fence_top: usize,
    pub upper_bounds: usize,
    pub alloc_bounds: usize,
}

impl PointerInfo {
    /// Boundaries of a block at `mem` reserving `total_size` bytes for a
    /// user request of `user_size`.
    #[must_use]
    pub const fn compute(mem: usize, total_size: usize, user_size: usize, flags: SlotFlags) -> Self {
        let fenced = flags.contains(SlotFlags::FENCE);
        let aligned = flags.contains(SlotFlags::VALLOC);
        let alloc_bounds = mem + total_size;
        let (fence_bottom, user_start, upper_bounds) = if fenced {
            let user_start = if aligned {
                mem + BLOCK_SIZE
            } else {
                mem + FENCE_BOTTOM_SIZE
            };
            (user_start - FENCE_BOTTOM_SIZE, user_start, alloc_bounds - FENCE_TOP_SIZE)
        } else {
            (mem, mem, alloc_bounds)
        };
        let user_bounds = user_start + user_size;
        Self {
            fenced,
            aligned,
            alloc_start: mem,
            fence_bottom,
            user_start,
            user_bounds,
            fence_top: user_bounds,
            upper_bounds,
            alloc_bounds,
        }
    }

    /// Bytes the user asked for.
    #[must_use]
    pub const fn user_size(&self) -> usize {
        self.user_bounds - self.user_start
    }

    /// Largest user size this reservation can hold in place.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.upper_bounds - self.user_start
    }

    /// Same reservation carrying a different user size.
    #[must_use]
    pub const fn resized(&self, user_size: usize) -> Self {
        let user_bounds = self.user_start + user_size;
        Self {
            user_bounds,
            fence_top: user_bounds,
            ..*self
        }
    }
}

/// Overhead added to a request of a block with these layout flags.
#[must_use]
pub const fn overhead(fenced: bool, aligned: bool) -> usize {
    match (fenced, aligned) {
        (true, true) => BLOCK_SIZE + FENCE_TOP_SIZE,
        (true, false) => FENCE_BOTTOM_SIZE + FENCE_TOP_SIZE,
        (false, _) => 0,
    }
}

fn pattern_byte(magic: u32, offset: usize) -> u8 {
    magic.to_ne_bytes()[offset % 4]
}

/// Stamps both fences of `info`.
///
/// # Safety
///
/// Both fence regions of `info` must be writable memory owned by the heap.
pub(crate) unsafe fn write_fences(info: &PointerInfo) {
    if !info.fenced {
        return;
    }
    // SAFETY: caller guarantees both regions are writable.
    unsafe {
        for i in 0..FENCE_BOTTOM_SIZE {
            ((info.fence_bottom + i) as *mut u8).write(pattern_byte(FENCE_MAGIC_BOTTOM, i));
        }
        for i in 0..FENCE_TOP_SIZE {
            ((info.fence_top + i) as *mut u8).write(pattern_byte(FENCE_MAGIC_TOP, i));
        }
    }
}

/// Compares both fences of `info` with their patterns.
///
/// # Safety
///
/// Both fence regions of `info` must be readable memory owned by the heap.
pub(crate) unsafe fn check_fences(info: &PointerInfo) -> Result<(), FenceSide> {
    if !info.fenced {
        return Ok(());
    }
    // SAFETY: caller guarantees both regions are readable.
    let (bottom, top) = unsafe {
        (
            bytes(info.fence_bottom, FENCE_BOTTOM_SIZE),
            bytes(info.fence_top, FENCE_TOP_SIZE),
        )
    };
    if bottom
        .iter()
        .enumerate()
        .any(|(i, b)| *b != pattern_byte(FENCE_MAGIC_BOTTOM, i))
    {
        return Err(FenceSide::Bottom);
    }
    if top
        .iter()
        .enumerate()
        .any(|(i, b)| *b != pattern_byte(FENCE_MAGIC_TOP, i))
    {
        return Err(FenceSide::Top);
    }
    Ok(())
}

/// Shared view of `len` bytes at `start`.
///
/// # Safety
///
/// `[start, start + len)` must be readable and not written while the view lives.
pub(crate) unsafe fn bytes<'a>(start: usize, len: usize) -> &'a [u8] {
    // SAFETY: forwarded to the caller.
    unsafe { core::slice::from_raw_parts(start as *const u8, len) }
}

/// Mutable view of `len` bytes at `start`.
///
/// # Safety
///
/// `[start, start + len)` must be writable and not otherwise aliased while the
/// view lives.
pub(crate) unsafe fn bytes_mut<'a>(start: usize, len: usize) -> &'a mut [u8] {
    // SAFETY: forwarded to the caller.
    unsafe { core::slice::from_raw_parts_mut(start as *mut u8, len) }
}

/// Fills `[start, end)` with `byte`.
///
/// # Safety
///
/// The range must be writable memory owned by the heap.
pub(crate) unsafe fn fill(start: usize, end: usize, byte: u8) {
    if end > start {
        // SAFETY: forwarded to the caller.
        unsafe { bytes_mut(start, end - start) }.fill(byte);
    }
}

/// Address of the first byte in `[start, end)` that differs from `byte`.
///
/// # Safety
///
/// The range must be readable memory owned by the heap.
pub(crate) unsafe fn first_mismatch(start: usize, end: usize, byte: u8) -> Option<usize> {
    if end <= start {
        return None;
    }
    // SAFETY: forwarded to the caller.
    let view = unsafe { bytes(start, end - start) };
    view.iter().position(|b| *b != byte).map(|i| start + i)
}

/// Printable rendering of raw bytes: ASCII graphic characters as-is, common
/// escapes by name, everything else as `\xNN`.
pub struct ByteDump<'a>(pub &'a [u8]);

impl fmt::Display for ByteDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in self.0 {
            match b {
                b'\\' => f.write_str("\\\\")?,
                b'"' => f.write_str("\\\"")?,
                b'\n' => f.write_str("\\n")?,
                b'\r' => f.write_str("\\r")?,
                b'\t' => f.write_str("\\t")?,
                0x07 => f.write_str("\\a")?,
                0x08 => f.write_str("\\b")?,
                0x0C => f.write_str("\\f")?,
                b if b.is_ascii_graphic() || b == b' ' => write!(f, "{}", b as char)?,
                b => write!(f, "\\x{b:02x}")?,
            }
        }
        Ok(())
    }
}
