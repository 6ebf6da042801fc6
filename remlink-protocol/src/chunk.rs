//! Chunked command framing.
//!
//! When both peers advertise chunking, a serialized command is carried as a
//! sequence of chunks, each prefixed by a 16-bit big-endian header:
//!
//! ```text
//! bit 15      : continuation flag (1 = more chunks follow this command)
//! bits 14..0  : payload length, 0..=32767
//! ```
//!
//! The reader concatenates payloads until a header with the continuation
//! flag clear, then hands the reassembled body to the command codec.

use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Largest payload a single chunk header can describe.
pub const MAX_CHUNK_PAYLOAD: usize = 0x7fff;

/// Continuation flag in the chunk header.
pub const CONTINUATION: u16 = 0x8000;

/// Default per-chunk payload size used by the transport.
pub const DEFAULT_FRAME_SIZE: usize = 8192;

/// Splits `payload` into chunk frames of at most `frame_size` bytes each and
/// appends them to `out`.
///
/// `frame_size` is configurable so tests can force unaligned chunk
/// boundaries; it must fit the 15-bit length field. An empty payload still
/// produces one terminal chunk so the reader sees the command boundary.
pub fn encode_chunks(
    payload: &[u8],
    frame_size: usize,
    out: &mut BytesMut,
) -> Result<(), ProtocolError> {
    if frame_size == 0 || frame_size > MAX_CHUNK_PAYLOAD {
        return Err(ProtocolError::InvalidFrameSize(frame_size));
    }
    let mut rest = payload;
    loop {
        let take = rest.len().min(frame_size);
        let last = take == rest.len();
        let mut header = take as u16;
        if !last {
            header |= CONTINUATION;
        }
        out.put_u16(header);
        out.put_slice(&rest[..take]);
        if last {
            return Ok(());
        }
        rest = &rest[take..];
    }
}

/// Incremental chunk reassembler.
///
/// Fed from the transport's receive buffer; yields one complete command
/// body per terminal chunk. Partial chunks are left in the input buffer
/// untouched, matching the rest of the codec's `Ok(None)` means read-more
/// contract.
#[derive(Debug, Default)]
pub struct ChunkAssembler {
    partial: BytesMut,
}

impl ChunkAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes as many complete chunks from `buf` as are available.
    ///
    /// Returns a reassembled command body when a terminal chunk was seen,
    /// `Ok(None)` when more input is needed.
    pub fn feed(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
        loop {
            if buf.len() < 2 {
                return Ok(None);
            }
            let header = u16::from_be_bytes([buf[0], buf[1]]);
            let len = (header & !CONTINUATION) as usize;
            if buf.len() < 2 + len {
                return Ok(None);
            }
            buf.advance(2);
            self.partial.extend_from_slice(&buf.split_to(len));
            if header & CONTINUATION == 0 {
                return Ok(Some(self.partial.split().freeze()));
            }
        }
    }

    /// Bytes of the command currently being reassembled.
    pub fn pending(&self) -> usize {
        self.partial.len()
    }
}
