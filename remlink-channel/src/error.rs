//! Channel error types.

use remlink_protocol::ProtocolError;
use thiserror::Error;

/// Errors surfaced by the channel API.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Framing violation with a dump of the bytes that led up to it.
    #[error("corrupt stream: {source}\n{diagnostics}")]
    CorruptStream {
        source: ProtocolError,
        diagnostics: String,
    },

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("channel closed: {cause}")]
    Closed { cause: String },

    #[error("request aborted: {cause}")]
    RequestAborted { cause: String },

    #[error("invalid object id {id}{diagnostics}")]
    InvalidObjectId { id: u64, diagnostics: String },

    #[error("callable refused: {0}")]
    SecurityRefused(String),

    /// The remote callable completed with a failure payload.
    #[error("remote call failed: {message}")]
    RemoteCall { message: String },

    #[error("call cancelled")]
    Cancelled,

    #[error("remote pipe is dead: {cause}")]
    PipeDead { cause: String },
}

impl ChannelError {
    /// True when the operation failed because the channel went away, as
    /// opposed to the operation itself being at fault.
    pub fn is_termination(&self) -> bool {
        matches!(
            self,
            ChannelError::Io(_)
                | ChannelError::Closed { .. }
                | ChannelError::RequestAborted { .. }
        )
    }
}
