//! Handshake and mode negotiation.
//!
//! Both peers immediately write their capability preamble, followed by a
//! mode preamble if their mode is preset. Each then scans the inbound
//! stream for the three known preambles; transports forked through shells
//! often emit banner noise first, and every byte consumed during the scan
//! can be teed to a caller-supplied header sink for diagnosis. A peer in
//! NEGOTIATE mode adopts whatever the remote announces and echoes the
//! matching preamble back.

use crate::error::ChannelError;
use crate::transport::{BoxedReader, BoxedWriter, CommandTransport, Framing};
use bytes::BytesMut;
use remlink_protocol::{Capability, Mode, PreambleHit, PreambleMatcher};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};

/// Observer for bytes consumed before the handshake completes.
pub type HeaderSink = Box<dyn std::io::Write + Send>;

/// Handshake inputs.
pub struct Negotiation {
    pub mode: Mode,
    pub capability: Capability,
    pub frame_size: usize,
    pub header_sink: Option<HeaderSink>,
}

/// Handshake outputs: the negotiated transport and what was learned about
/// the peer.
pub struct Negotiated {
    pub transport: CommandTransport,
    pub remote_capability: Capability,
    pub mode: Mode,
}

/// Runs the preamble exchange and returns the negotiated transport.
pub async fn negotiate(
    reader: BoxedReader,
    mut writer: BoxedWriter,
    mut opts: Negotiation,
) -> Result<Negotiated, ChannelError> {
    let mut greeting = BytesMut::new();
    opts.capability.write_preamble(&mut greeting);
    let mut mode = opts.mode;
    if let Some(preamble) = mode.preamble() {
        greeting.extend_from_slice(preamble);
    } else {
        tracing::debug!("awaiting mode preamble from peer");
    }
    writer.write_all(&greeting).await?;
    writer.flush().await?;
    tracing::debug!(capability = %opts.capability, %mode, "sent handshake preamble");

    // Single-byte scan. The BufReader keeps post-handshake bytes for the
    // transport, which takes ownership of it below.
    let mut reader = BufReader::new(reader);
    let mut matcher = PreambleMatcher::new();
    // Peers that never announce capabilities get the empty set.
    let mut remote_capability = Capability::empty();

    loop {
        let byte = match reader.read_u8().await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(ChannelError::Handshake(
                    "unexpected stream termination".to_string(),
                ));
            }
            Err(e) => return Err(e.into()),
        };
        if let Some(sink) = opts.header_sink.as_mut() {
            let _ = sink.write_all(&[byte]);
        }

        let remote_mode = match matcher.feed(byte) {
            None => continue,
            Some(PreambleHit::Capability) => {
                let len = reader.read_u16().await? as usize;
                let mut payload = vec![0u8; len];
                reader.read_exact(&mut payload).await?;
                remote_capability = Capability::parse_payload(&payload)?;
                tracing::debug!(capability = %remote_capability, "received capability preamble");
                continue;
            }
            Some(PreambleHit::Binary) => Mode::Binary,
            Some(PreambleHit::Text) => Mode::Text,
        };

        tracing::debug!(%remote_mode, "received mode preamble");
        if mode == Mode::Negotiate {
            mode = remote_mode;
            if let Some(preamble) = mode.preamble() {
                writer.write_all(preamble).await?;
                writer.flush().await?;
            }
            tracing::debug!(%mode, "echoed agreed mode preamble");
        } else if mode != remote_mode {
            return Err(ChannelError::Handshake(format!(
                "mode negotiation failure: local {mode}, remote {remote_mode}"
            )));
        }

        let framing = if opts.capability.supports_chunking()
            && remote_capability.supports_chunking()
        {
            Framing::Chunked {
                frame_size: opts.frame_size,
            }
        } else {
            Framing::Classic
        };
        tracing::debug!(%mode, ?framing, "handshake complete");

        return Ok(Negotiated {
            transport: CommandTransport::new(Box::new(reader), writer, framing, mode),
            remote_capability,
            mode,
        });
    }
}
