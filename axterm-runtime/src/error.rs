use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced upward by the runtime. Never thrown as panics - malformed
/// input is logged and dropped, connection trouble is reported through this
/// type so a caller can decide whether to retry.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("no active session for this destination")]
    NotConnected,

    #[error("transport reported a write error: {0}")]
    SendFailed(String),

    #[error("malformed {0} bytes")]
    DecodeError(String),

    #[error("decompressed length did not match the claimed size, or exceeded the cap")]
    SizeMismatch,

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("retry limit exceeded")]
    RetriesExceeded,

    #[error("peer does not support a required capability: {0}")]
    CapabilityRefused(String),

    #[error("saved queue/transfer path could not be opened: {0}")]
    InvalidPath(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Serial(#[from] serialport::Error),
}
