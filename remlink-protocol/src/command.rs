//! The command sum type and its binary codec.
//!
//! Every message exchanged after the handshake is one `Command`, encoded as
//! a single tag byte followed by big-endian fixed fields and u32
//! length-prefixed variable fields. Framing (classic length prefix or
//! chunking) wraps this encoding; the codec here never sees partial input.

use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

const TAG_USER_REQUEST: u8 = 0x01;
const TAG_USER_RESPONSE: u8 = 0x02;
const TAG_CANCEL: u8 = 0x03;
const TAG_PIPE_CHUNK: u8 = 0x04;
const TAG_PIPE_ACK: u8 = 0x05;
const TAG_PIPE_EOF: u8 = 0x06;
const TAG_PIPE_FLUSH: u8 = 0x07;
const TAG_PIPE_UNEXPORT: u8 = 0x08;
const TAG_PIPE_DEAD_WRITER: u8 = 0x09;
const TAG_CLOSE: u8 = 0x0a;

/// A control message exchanged between two channel peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Invoke a callable on the remote peer.
    UserRequest {
        /// Correlation id, unique per originating peer.
        id: u64,
        /// Last I/O id the sender issued before this request; the receiver
        /// must drain its sequencer up to here before executing.
        last_io_id: u64,
        /// Opaque deserialization-context reference (0 = none).
        context_oid: u64,
        /// Optional call-site description, carried when cause chaining is on.
        origin: Option<String>,
        /// Serialized callable, opaque to the channel core.
        payload: Bytes,
    },
    /// The result of a `UserRequest` with the same id.
    UserResponse {
        id: u64,
        /// Last I/O id the responder issued while executing; the caller
        /// waits for it before returning.
        response_io_id: u64,
        /// True when the payload is a serialized failure.
        is_exception: bool,
        payload: Bytes,
    },
    /// Ask the peer to interrupt the executing request with this id.
    Cancel { id: u64 },
    /// Flow-controlled bytes for a remote sink.
    PipeChunk { io_id: u64, oid: u64, payload: Bytes },
    /// Window credit returned after the receiver consumed `size` bytes.
    PipeAck { oid: u64, size: u32 },
    /// Close the remote sink, then release its export entry.
    PipeEof { io_id: u64, oid: u64 },
    /// Flush the remote sink.
    PipeFlush { io_id: u64, oid: u64 },
    /// Release the export entry without closing the sink.
    PipeUnexport { io_id: u64, oid: u64 },
    /// The receiving sink failed; the sender's window is poisoned.
    PipeDeadWriter { oid: u64, cause: String },
    /// Orderly close notification.
    Close { cause: String },
}

impl Command {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Command::UserRequest { .. } => "UserRequest",
            Command::UserResponse { .. } => "UserResponse",
            Command::Cancel { .. } => "Cancel",
            Command::PipeChunk { .. } => "PipeChunk",
            Command::PipeAck { .. } => "PipeAck",
            Command::PipeEof { .. } => "PipeEof",
            Command::PipeFlush { .. } => "PipeFlush",
            Command::PipeUnexport { .. } => "PipeUnexport",
            Command::PipeDeadWriter { .. } => "PipeDeadWriter",
            Command::Close { .. } => "Close",
        }
    }

    /// Encodes the command into a standalone buffer.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.encoded_hint());
        match self {
            Command::UserRequest {
                id,
                last_io_id,
                context_oid,
                origin,
                payload,
            } => {
                buf.put_u8(TAG_USER_REQUEST);
                buf.put_u64(*id);
                buf.put_u64(*last_io_id);
                buf.put_u64(*context_oid);
                put_opt_string(&mut buf, origin.as_deref());
                put_bytes(&mut buf, payload);
            }
            Command::UserResponse {
                id,
                response_io_id,
                is_exception,
                payload,
            } => {
                buf.put_u8(TAG_USER_RESPONSE);
                buf.put_u64(*id);
                buf.put_u64(*response_io_id);
                buf.put_u8(u8::from(*is_exception));
                put_bytes(&mut buf, payload);
            }
            Command::Cancel { id } => {
                buf.put_u8(TAG_CANCEL);
                buf.put_u64(*id);
            }
            Command::PipeChunk { io_id, oid, payload } => {
                buf.put_u8(TAG_PIPE_CHUNK);
                buf.put_u64(*io_id);
                buf.put_u64(*oid);
                put_bytes(&mut buf, payload);
            }
            Command::PipeAck { oid, size } => {
                buf.put_u8(TAG_PIPE_ACK);
                buf.put_u64(*oid);
                buf.put_u32(*size);
            }
            Command::PipeEof { io_id, oid } => {
                buf.put_u8(TAG_PIPE_EOF);
                buf.put_u64(*io_id);
                buf.put_u64(*oid);
            }
            Command::PipeFlush { io_id, oid } => {
                buf.put_u8(TAG_PIPE_FLUSH);
                buf.put_u64(*io_id);
                buf.put_u64(*oid);
            }
            Command::PipeUnexport { io_id, oid } => {
                buf.put_u8(TAG_PIPE_UNEXPORT);
                buf.put_u64(*io_id);
                buf.put_u64(*oid);
            }
            Command::PipeDeadWriter { oid, cause } => {
                buf.put_u8(TAG_PIPE_DEAD_WRITER);
                buf.put_u64(*oid);
                put_string(&mut buf, cause);
            }
            Command::Close { cause } => {
                buf.put_u8(TAG_CLOSE);
                put_string(&mut buf, cause);
            }
        }
        buf
    }

    fn encoded_hint(&self) -> usize {
        match self {
            Command::UserRequest { payload, .. } => 64 + payload.len(),
            Command::UserResponse { payload, .. } => 32 + payload.len(),
            Command::PipeChunk { payload, .. } => 32 + payload.len(),
            _ => 64,
        }
    }

    /// Decodes a command from a complete frame body.
    pub fn decode(frame: Bytes) -> Result<Self, ProtocolError> {
        let mut buf = frame;
        let tag = get_u8(&mut buf)?;
        let command = match tag {
            TAG_USER_REQUEST => Command::UserRequest {
                id: get_u64(&mut buf)?,
                last_io_id: get_u64(&mut buf)?,
                context_oid: get_u64(&mut buf)?,
                origin: get_opt_string(&mut buf)?,
                payload: get_bytes(&mut buf)?,
            },
            TAG_USER_RESPONSE => Command::UserResponse {
                id: get_u64(&mut buf)?,
                response_io_id: get_u64(&mut buf)?,
                is_exception: get_u8(&mut buf)? != 0,
                payload: get_bytes(&mut buf)?,
            },
            TAG_CANCEL => Command::Cancel {
                id: get_u64(&mut buf)?,
            },
            TAG_PIPE_CHUNK => Command::PipeChunk {
                io_id: get_u64(&mut buf)?,
                oid: get_u64(&mut buf)?,
                payload: get_bytes(&mut buf)?,
            },
            TAG_PIPE_ACK => Command::PipeAck {
                oid: get_u64(&mut buf)?,
                size: get_u32(&mut buf)?,
            },
            TAG_PIPE_EOF => Command::PipeEof {
                io_id: get_u64(&mut buf)?,
                oid: get_u64(&mut buf)?,
            },
            TAG_PIPE_FLUSH => Command::PipeFlush {
                io_id: get_u64(&mut buf)?,
                oid: get_u64(&mut buf)?,
            },
            TAG_PIPE_UNEXPORT => Command::PipeUnexport {
                io_id: get_u64(&mut buf)?,
                oid: get_u64(&mut buf)?,
            },
            TAG_PIPE_DEAD_WRITER => Command::PipeDeadWriter {
                oid: get_u64(&mut buf)?,
                cause: get_string(&mut buf)?,
            },
            TAG_CLOSE => Command::Close {
                cause: get_string(&mut buf)?,
            },
            other => return Err(ProtocolError::UnknownCommandTag(other)),
        };
        if !buf.is_empty() {
            return Err(ProtocolError::TrailingBytes(buf.len()));
        }
        Ok(command)
    }
}

fn need(buf: &Bytes, n: usize) -> Result<(), ProtocolError> {
    if buf.len() < n {
        Err(ProtocolError::Truncated {
            needed: n - buf.len(),
        })
    } else {
        Ok(())
    }
}

fn get_u8(buf: &mut Bytes) -> Result<u8, ProtocolError> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

fn get_u32(buf: &mut Bytes) -> Result<u32, ProtocolError> {
    need(buf, 4)?;
    Ok(buf.get_u32())
}

fn get_u64(buf: &mut Bytes) -> Result<u64, ProtocolError> {
    need(buf, 8)?;
    Ok(buf.get_u64())
}

fn put_bytes(buf: &mut BytesMut, bytes: &Bytes) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

fn get_bytes(buf: &mut Bytes) -> Result<Bytes, ProtocolError> {
    let len = get_u32(buf)? as usize;
    need(buf, len)?;
    Ok(buf.split_to(len))
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn get_string(buf: &mut Bytes) -> Result<String, ProtocolError> {
    let bytes = get_bytes(buf)?;
    std::str::from_utf8(&bytes)
        .map(str::to_owned)
        .map_err(|_| ProtocolError::InvalidUtf8)
}

fn put_opt_string(buf: &mut BytesMut, s: Option<&str>) {
    match s {
        Some(s) => {
            buf.put_u8(1);
            put_string(buf, s);
        }
        None => buf.put_u8(0),
    }
}

fn get_opt_string(buf: &mut Bytes) -> Result<Option<String>, ProtocolError> {
    if get_u8(buf)? == 0 {
        Ok(None)
    } else {
        get_string(buf).map(Some)
    }
}
