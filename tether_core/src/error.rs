use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::handle::{Handle, HandleKind};

#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Never issued, already removed, or issued by a different registry.
    #[error("invalid {kind} handle {raw:#x}")]
    InvalidHandle { kind: &'static str, raw: u64 },

    /// A non-blocking call had nothing to do.
    #[error("operation would block")]
    WouldBlock,

    #[error("{0} is closed")]
    Closed(Handle),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Listener or connection handle that is not (or no longer) registered.
    #[error("{0} not found")]
    NotFound(Handle),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl RuntimeError {
    pub fn invalid(kind: HandleKind, raw: u64) -> Self {
        RuntimeError::InvalidHandle {
            kind: kind.name(),
            raw,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        RuntimeError::Config(message.into())
    }

    pub fn eof() -> Self {
        RuntimeError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed by peer",
        ))
    }

    pub fn is_invalid_handle(&self) -> bool {
        matches!(self, RuntimeError::InvalidHandle { .. })
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, RuntimeError::Closed(_))
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
