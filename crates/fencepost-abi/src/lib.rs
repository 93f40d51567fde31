// Exported allocator symbols take raw pointers from C callers and follow the
// libc contracts, so per-function safety docs would restate the C manual.
#![allow(clippy::missing_safety_doc)]
//! # fencepost-abi
//!
//! C allocator boundary for the fencepost debugging heap.
//!
//! This crate produces a `cdylib` that can be preloaded in front of libc. It
//! exports `malloc`, `free`, `calloc`, `realloc`, `memalign`,
//! `posix_memalign`, `aligned_alloc`, `valloc` and `pvalloc`, plus the
//! `fencepost_*` introspection calls.
//!
//! ```text
//! C caller -> malloc_abi (reentry guard) -> alloc_path -> state (lock, options) -> ChunkHeap
//!                   \-> native libc allocator (reentrant, bootstrap, foreign pointers)
//! ```
//!
//! Behavior is configured through `FENCEPOST_OPTIONS`, read once at the first
//! allocation.

pub mod alloc_path;
pub mod config;
mod fatal;
pub mod introspect_abi;
pub mod log_sink;
pub mod mmap_arena;
mod reentry;
pub mod state;

// Gated behind cfg(not(test)) because in release builds these symbols would
// shadow the system allocator of the test binary.
#[cfg(not(test))]
pub mod malloc_abi;
