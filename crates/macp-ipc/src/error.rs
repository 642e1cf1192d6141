//! Inter-process transport errors.

use macp_types::MacpError;
use thiserror::Error;

/// Errors from an [`IpcChannel`](crate::IpcChannel).
///
/// Background tasks treat [`Timeout`](IpcError::Timeout) as "poll again",
/// [`Closed`](IpcError::Closed) as "stop", and everything else as a single
/// dropped frame.
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("Receive timed out")]
    Timeout,
    #[error("Malformed frame: {0}")]
    Malformed(String),
    #[error("Channel closed")]
    Closed,
    #[error("Missing environment variable {0}")]
    MissingEnv(&'static str),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl IpcError {
    /// Whether the channel can no longer carry frames.
    pub fn is_fatal(&self) -> bool {
        matches!(self, IpcError::Closed)
    }
}

impl From<IpcError> for MacpError {
    fn from(err: IpcError) -> Self {
        match err {
            IpcError::Closed => MacpError::ShuttingDown,
            IpcError::Malformed(reason) => MacpError::MalformedFrame(reason),
            IpcError::Io(e) => MacpError::Io(e),
            other => MacpError::Transport(other.to_string()),
        }
    }
}
