use std::io;

use thiserror::Error;

/// Failures surfaced by the chat core.
///
/// A clean end of stream is not an error: `receive_line` reports it as `Ok(None)`.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("transport is closed")]
    Closed,

    #[error("line must not contain a line terminator")]
    InvalidLine,
}

pub type Result<T, E = ChatError> = std::result::Result<T, E>;
