//! Command transport over a negotiated duplex stream.
//!
//! The handshake decides two independent things: the framing (classic
//! length-prefixed frames, or chunked frames when both peers advertise
//! chunking) and the wire mode (raw binary, or base64 text lines). The
//! transport applies both at the frame boundary, so a command is always
//! encoded into one contiguous buffer and written with a single flush.

use crate::error::ChannelError;
use crate::flight::FlightRecorder;
use bytes::{Bytes, BytesMut};
use remlink_protocol::codec::{classic, text};
use remlink_protocol::{chunk, ChunkAssembler, Command, Mode, ProtocolError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Read half of the underlying stream, type-erased.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
/// Write half of the underlying stream, type-erased.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

const READ_CHUNK: usize = 8 * 1024;

/// How command bodies are framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// One u32 big-endian length-prefixed frame per command.
    Classic,
    /// 15-bit length-prefixed chunks with a continuation flag.
    Chunked { frame_size: usize },
}

/// A negotiated transport, ready to be split between the channel's writer
/// task and reader task.
pub struct CommandTransport {
    pub reader: CommandReader,
    pub writer: CommandWriter,
}

impl CommandTransport {
    pub fn new(
        reader: BoxedReader,
        writer: BoxedWriter,
        framing: Framing,
        mode: Mode,
    ) -> Self {
        Self {
            reader: CommandReader::new(reader, framing, mode),
            writer: CommandWriter::new(writer, framing, mode),
        }
    }
}

/// Serializes and writes commands. Writes are serialized by the owning
/// channel's writer task; this type itself is single-owner.
pub struct CommandWriter {
    io: BoxedWriter,
    framing: Framing,
    mode: Mode,
}

impl CommandWriter {
    pub fn new(io: BoxedWriter, framing: Framing, mode: Mode) -> Self {
        Self { io, framing, mode }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Encodes `command` and writes it with one flush.
    pub async fn write(&mut self, command: &Command) -> Result<(), ChannelError> {
        let body = command.encode();

        let mut frame = BytesMut::with_capacity(body.len() + 16);
        match self.framing {
            Framing::Classic => classic::encode_frame(&body, &mut frame)?,
            Framing::Chunked { frame_size } => {
                chunk::encode_chunks(&body, frame_size, &mut frame)?
            }
        }

        let wire = match self.mode {
            Mode::Text => {
                let mut line = BytesMut::with_capacity(frame.len() * 4 / 3 + 8);
                text::encode_line(&frame, &mut line);
                line
            }
            _ => frame,
        };

        self.io.write_all(&wire).await?;
        self.io.flush().await?;
        Ok(())
    }

    /// Shuts down the write side of the underlying stream.
    pub async fn shutdown(&mut self) {
        let _ = self.io.shutdown().await;
    }
}

/// Reads and reassembles commands. Owned by the channel's reader task.
pub struct CommandReader {
    io: BoxedReader,
    framing: Framing,
    mode: Mode,
    /// Undecoded frame bytes (after text-mode line decoding, if any).
    frames: BytesMut,
    line_decoder: text::LineDecoder,
    assembler: ChunkAssembler,
    recorder: FlightRecorder,
}

impl CommandReader {
    pub fn new(io: BoxedReader, framing: Framing, mode: Mode) -> Self {
        Self {
            io,
            framing,
            mode,
            frames: BytesMut::with_capacity(READ_CHUNK),
            line_decoder: text::LineDecoder::new(),
            assembler: ChunkAssembler::new(),
            recorder: FlightRecorder::default(),
        }
    }

    /// Reads the next command. `Ok(None)` means the peer closed cleanly at
    /// a command boundary; anything else mid-frame is a corrupt stream.
    pub async fn read(&mut self) -> Result<Option<Command>, ChannelError> {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            if let Some(body) = self.next_body()? {
                let command = Command::decode(body).map_err(|e| self.corrupt(e))?;
                tracing::trace!(kind = command.kind(), "received command");
                return Ok(Some(command));
            }

            let n = self.io.read(&mut buf).await?;
            if n == 0 {
                if self.has_partial_input() {
                    return Err(self.corrupt(ProtocolError::Truncated { needed: 1 }));
                }
                return Ok(None);
            }
            self.recorder.record(&buf[..n]);

            match self.mode {
                Mode::Text => {
                    self.line_decoder.extend(&buf[..n]);
                    loop {
                        match self.line_decoder.decode_line() {
                            Ok(Some(frame)) => self.frames.extend_from_slice(&frame),
                            Ok(None) => break,
                            Err(e) => return Err(self.corrupt(e)),
                        }
                    }
                }
                _ => self.frames.extend_from_slice(&buf[..n]),
            }
        }
    }

    fn next_body(&mut self) -> Result<Option<Bytes>, ChannelError> {
        let result = match self.framing {
            Framing::Classic => classic::decode_frame(&mut self.frames),
            Framing::Chunked { .. } => self.assembler.feed(&mut self.frames),
        };
        result.map_err(|e| self.corrupt(e))
    }

    fn has_partial_input(&self) -> bool {
        !self.frames.is_empty()
            || self.assembler.pending() > 0
            || self.line_decoder.buffered() > 0
    }

    fn corrupt(&self, source: ProtocolError) -> ChannelError {
        ChannelError::CorruptStream {
            source,
            diagnostics: self.recorder.dump(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(framing: Framing, mode: Mode) -> (CommandWriter, CommandReader) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (_, client_w) = tokio::io::split(client);
        let (server_r, _) = tokio::io::split(server);
        (
            CommandWriter::new(Box::new(client_w), framing, mode),
            CommandReader::new(Box::new(server_r), framing, mode),
        )
    }

    fn sample_commands() -> Vec<Command> {
        vec![
            Command::UserRequest {
                id: 1,
                last_io_id: 0,
                context_oid: 0,
                origin: None,
                payload: Bytes::from_static(b"payload"),
            },
            Command::PipeChunk {
                io_id: 1,
                oid: 9,
                payload: Bytes::from(vec![0xab; 4096]),
            },
            Command::Close {
                cause: "done".to_string(),
            },
        ]
    }

    #[tokio::test]
    async fn test_classic_binary_roundtrip() {
        let (mut w, mut r) = pair(Framing::Classic, Mode::Binary);
        for cmd in sample_commands() {
            w.write(&cmd).await.unwrap();
            assert_eq!(r.read().await.unwrap().unwrap(), cmd);
        }
    }

    #[tokio::test]
    async fn test_chunked_binary_roundtrip() {
        let (mut w, mut r) = pair(Framing::Chunked { frame_size: 115 }, Mode::Binary);
        for cmd in sample_commands() {
            w.write(&cmd).await.unwrap();
            assert_eq!(r.read().await.unwrap().unwrap(), cmd);
        }
    }

    #[tokio::test]
    async fn test_chunked_text_roundtrip() {
        let (mut w, mut r) = pair(Framing::Chunked { frame_size: 64 }, Mode::Text);
        for cmd in sample_commands() {
            w.write(&cmd).await.unwrap();
            assert_eq!(r.read().await.unwrap().unwrap(), cmd);
        }
    }

    #[tokio::test]
    async fn test_clean_eof_returns_none() {
        let (w, mut r) = pair(Framing::Classic, Mode::Binary);
        drop(w);
        assert!(r.read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_eof_mid_frame_is_corrupt() {
        let (client, server) = tokio::io::duplex(1024);
        let (_, mut client_w) = tokio::io::split(client);
        let (server_r, _) = tokio::io::split(server);
        let mut r = CommandReader::new(Box::new(server_r), Framing::Classic, Mode::Binary);

        // A length prefix promising more than ever arrives.
        client_w.write_all(&[0, 0, 1, 0, 0xde]).await.unwrap();
        client_w.shutdown().await.unwrap();
        drop(client_w);

        let err = r.read().await.unwrap_err();
        assert!(matches!(err, ChannelError::CorruptStream { .. }));
        let text = err.to_string();
        assert!(text.contains("de"));
    }

    #[tokio::test]
    async fn test_garbage_frame_reports_diagnostics() {
        let (client, server) = tokio::io::duplex(1024);
        let (_, mut client_w) = tokio::io::split(client);
        let (server_r, _) = tokio::io::split(server);
        let mut r = CommandReader::new(Box::new(server_r), Framing::Classic, Mode::Binary);

        // Valid classic frame carrying an unknown command tag.
        client_w.write_all(&[0, 0, 0, 1, 0x7f]).await.unwrap();

        let err = r.read().await.unwrap_err();
        match err {
            ChannelError::CorruptStream { source, diagnostics } => {
                assert!(matches!(source, ProtocolError::UnknownCommandTag(0x7f)));
                assert!(diagnostics.contains("bytes received"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
