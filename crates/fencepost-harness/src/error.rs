//! Harness error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("invalid option string: {0}")]
    Options(String),
    #[error("invalid {what} '{value}'")]
    BadArgument { what: &'static str, value: String },
    #[error("unknown error code {0}")]
    UnknownCode(u32),
    #[error("torture run stopped at op {op}: {source}")]
    Torture {
        op: u64,
        #[source]
        source: fencepost_core::ChunkError,
    },
    #[error("op {op}: contents of {addr:#x} changed behind the heap's back")]
    DataMismatch { op: u64, addr: usize },
    #[error("heap setup failed: {0}")]
    Heap(#[from] fencepost_core::ChunkError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<fencepost_core::OptionsError<'_>> for HarnessError {
    fn from(err: fencepost_core::OptionsError<'_>) -> Self {
        Self::Options(err.to_string())
    }
}
