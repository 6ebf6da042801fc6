//! Protocol error types.

use thiserror::Error;

/// Errors raised by the wire layer.
///
/// Every variant is fatal to the connection that produced it: framing state
/// cannot be resynchronized once a malformed header or command has been read.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown command tag 0x{0:02x}")]
    UnknownCommandTag(u8),

    #[error("frame of {size} bytes exceeds maximum of {max}")]
    FrameTooLarge { size: u32, max: u32 },

    #[error("command body truncated: needed {needed} more bytes")]
    Truncated { needed: usize },

    #[error("{0} trailing bytes after command body")]
    TrailingBytes(usize),

    #[error("invalid UTF-8 in command field")]
    InvalidUtf8,

    #[error("invalid base64 in text-mode line")]
    InvalidBase64,

    #[error("invalid chunk frame size {0} (must be 1..=32767)")]
    InvalidFrameSize(usize),

    #[error("capability payload of {0} bytes exceeds preamble limit")]
    CapabilityTooLarge(usize),
}
