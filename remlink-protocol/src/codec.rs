//! Classic framing and the text-mode line codec.

use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Classic (non-chunked) framing: each command is one u32 big-endian
/// length-prefixed frame. Used when either peer does not advertise
/// chunking.
pub mod classic {
    use super::*;

    /// Maximum classic frame body (16 MiB).
    pub const MAX_FRAME: u32 = 16 * 1024 * 1024;

    /// Appends a length-prefixed frame to `out`.
    pub fn encode_frame(body: &[u8], out: &mut BytesMut) -> Result<(), ProtocolError> {
        let len = body.len() as u32;
        if len > MAX_FRAME {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: MAX_FRAME,
            });
        }
        out.put_u32(len);
        out.put_slice(body);
        Ok(())
    }

    /// Decodes the next frame body, or `Ok(None)` if `buf` is incomplete.
    pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if len > MAX_FRAME {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: MAX_FRAME,
            });
        }
        if buf.len() < 4 + len as usize {
            return Ok(None);
        }
        buf.advance(4);
        Ok(Some(buf.split_to(len as usize).freeze()))
    }
}

/// Text wire mode: each frame travels as one newline-terminated base64
/// line, so the stream survives carriers that mangle raw bytes.
pub mod text {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;

    /// Encodes one frame as a base64 line.
    pub fn encode_line(frame: &[u8], out: &mut BytesMut) {
        let encoded = STANDARD.encode(frame);
        out.reserve(encoded.len() + 1);
        out.put_slice(encoded.as_bytes());
        out.put_u8(b'\n');
    }

    /// Splits inbound text-mode bytes into decoded frames.
    #[derive(Debug, Default)]
    pub struct LineDecoder {
        buffer: BytesMut,
    }

    impl LineDecoder {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn extend(&mut self, data: &[u8]) {
            self.buffer.extend_from_slice(data);
        }

        /// Decodes the next complete line, or `Ok(None)` if none is buffered.
        ///
        /// Tolerates `\r\n` endings and skips blank lines.
        pub fn decode_line(&mut self) -> Result<Option<Bytes>, ProtocolError> {
            loop {
                let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') else {
                    return Ok(None);
                };
                let mut line = self.buffer.split_to(pos + 1);
                line.truncate(pos);
                if line.last() == Some(&b'\r') {
                    line.truncate(line.len() - 1);
                }
                if line.is_empty() {
                    continue;
                }
                let decoded = STANDARD
                    .decode(&line[..])
                    .map_err(|_| ProtocolError::InvalidBase64)?;
                return Ok(Some(Bytes::from(decoded)));
            }
        }

        /// Bytes buffered but not yet forming a complete line.
        pub fn buffered(&self) -> usize {
            self.buffer.len()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classic_roundtrip() {
        let mut wire = BytesMut::new();
        classic::encode_frame(b"abc", &mut wire).unwrap();
        classic::encode_frame(b"", &mut wire).unwrap();

        let first = classic::decode_frame(&mut wire).unwrap().unwrap();
        assert_eq!(first, Bytes::from_static(b"abc"));
        let second = classic::decode_frame(&mut wire).unwrap().unwrap();
        assert!(second.is_empty());
        assert!(classic::decode_frame(&mut wire).unwrap().is_none());
    }

    #[test]
    fn test_classic_partial_frame() {
        let mut wire = BytesMut::new();
        classic::encode_frame(b"payload", &mut wire).unwrap();
        let mut partial = wire.split_to(wire.len() - 1);
        assert!(classic::decode_frame(&mut partial).unwrap().is_none());
        partial.unsplit(wire);
        assert!(classic::decode_frame(&mut partial).unwrap().is_some());
    }

    #[test]
    fn test_classic_oversize_rejected() {
        let mut wire = BytesMut::new();
        wire.put_u32(classic::MAX_FRAME + 1);
        assert!(matches!(
            classic::decode_frame(&mut wire),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_text_roundtrip() {
        let mut wire = BytesMut::new();
        text::encode_line(&[0x00, 0xff, 0x10, 0x7f], &mut wire);
        text::encode_line(b"second", &mut wire);

        let mut decoder = text::LineDecoder::new();
        decoder.extend(&wire);
        assert_eq!(
            decoder.decode_line().unwrap().unwrap(),
            Bytes::from_static(&[0x00, 0xff, 0x10, 0x7f])
        );
        assert_eq!(
            decoder.decode_line().unwrap().unwrap(),
            Bytes::from_static(b"second")
        );
        assert!(decoder.decode_line().unwrap().is_none());
    }

    #[test]
    fn test_text_partial_line() {
        let mut wire = BytesMut::new();
        text::encode_line(b"data", &mut wire);

        let mut decoder = text::LineDecoder::new();
        decoder.extend(&wire[..wire.len() - 1]);
        assert!(decoder.decode_line().unwrap().is_none());
        decoder.extend(b"\n");
        assert_eq!(
            decoder.decode_line().unwrap().unwrap(),
            Bytes::from_static(b"data")
        );
    }

    #[test]
    fn test_text_crlf_and_blank_lines() {
        let mut decoder = text::LineDecoder::new();
        decoder.extend(b"\r\naGk=\r\n");
        assert_eq!(
            decoder.decode_line().unwrap().unwrap(),
            Bytes::from_static(b"hi")
        );
    }

    #[test]
    fn test_text_garbage_rejected() {
        let mut decoder = text::LineDecoder::new();
        decoder.extend(b"!!!not base64!!!\n");
        assert!(matches!(
            decoder.decode_line(),
            Err(ProtocolError::InvalidBase64)
        ));
    }
}
