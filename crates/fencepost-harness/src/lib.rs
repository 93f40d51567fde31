//! Tooling around the fencepost debugging heap.
//!
//! This crate provides:
//! - `env`: compose `FENCEPOST_OPTIONS` values and shell export code
//! - `errno`: error code lookup
//! - `tokens`: debug token and tag listings
//! - `torture`: seeded randomized workloads with a digest of the op trace
//! - JSONL structured logs for the above

#![forbid(unsafe_code)]

pub mod codes;
pub mod env_cmd;
pub mod error;
pub mod structured_log;
pub mod torture;

pub use error::HarnessError;
pub use torture::{TortureConfig, TortureReport};
