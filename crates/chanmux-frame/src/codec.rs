use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::error::{FrameError, Result};
use crate::header::{
    decode_header, Flags, FrameHeader, FrameType, HEADER_SIZE, MAX_FRAME_LENGTH, NO_CHANNEL,
};

/// Recommended payload ceiling per frame: one Ethernet TCP segment (1500 MTU minus
/// IP/TCP headers). Writers chunk channel data to this size by default.
pub const RECOMMENDED_PAYLOAD: usize = 1460;

/// A complete frame: header fields plus payload.
///
/// The wire `length` is always derived from `payload`, so a `Frame` can never
/// disagree with its own header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub flags: Flags,
    pub src_channel_id: u32,
    pub dest_channel_id: u32,
    pub payload: Bytes,
}

impl Frame {
    /// A data frame from `src` to `dest`.
    pub fn data(src: u32, dest: u32, payload: impl Into<Bytes>, end_stream: bool) -> Self {
        Self {
            frame_type: FrameType::Data,
            flags: if end_stream {
                Flags::END_STREAM
            } else {
                Flags::NONE
            },
            src_channel_id: src,
            dest_channel_id: dest,
            payload: payload.into(),
        }
    }

    /// A liveness probe (`ack == false`) or the reply to one.
    pub fn ping(payload: impl Into<Bytes>, ack: bool) -> Self {
        Self {
            frame_type: FrameType::Ping,
            flags: if ack { Flags::ACK } else { Flags::NONE },
            src_channel_id: NO_CHANNEL,
            dest_channel_id: NO_CHANNEL,
            payload: payload.into(),
        }
    }

    pub fn go_away() -> Self {
        Self {
            frame_type: FrameType::GoAway,
            flags: Flags::NONE,
            src_channel_id: NO_CHANNEL,
            dest_channel_id: NO_CHANNEL,
            payload: Bytes::new(),
        }
    }

    /// Header describing this frame on the wire.
    pub fn header(&self) -> FrameHeader {
        FrameHeader {
            frame_type: self.frame_type,
            flags: self.flags,
            length: self.payload.len() as u32,
            src_channel_id: self.src_channel_id,
            dest_channel_id: self.dest_channel_id,
        }
    }

    pub fn is_end_stream(&self) -> bool {
        self.header().is_end_stream()
    }

    pub fn is_ack(&self) -> bool {
        self.header().is_ack()
    }

    /// The total wire size of this frame (header + payload).
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Encode a frame into the wire format.
pub fn encode_frame(frame: &Frame, max_payload: usize, dst: &mut BytesMut) -> Result<()> {
    let max = max_payload.min(MAX_FRAME_LENGTH);
    if frame.payload.len() > max {
        return Err(FrameError::PayloadTooLarge {
            size: frame.payload.len(),
            max,
        });
    }

    let mut scratch = [0u8; HEADER_SIZE];
    frame.header().encode_into(&mut scratch);

    dst.reserve(frame.wire_size());
    dst.put_slice(&scratch);
    dst.put_slice(&frame.payload);
    Ok(())
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<Frame>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    let header = decode_header(&src[..HEADER_SIZE])?;
    let payload_len = header.length as usize;

    if payload_len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }

    let total = HEADER_SIZE + payload_len;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    let payload = src.split_to(payload_len).freeze();

    Ok(Some(Frame {
        frame_type: header.frame_type,
        flags: header.flags,
        src_channel_id: header.src_channel_id,
        dest_channel_id: header.dest_channel_id,
        payload,
    }))
}

/// Configuration for the frame codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size in bytes. Default: the 24-bit field limit.
    pub max_payload_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: MAX_FRAME_LENGTH,
        }
    }
}

/// `tokio_util` codec for use with `FramedRead` / `FramedWrite`.
#[derive(Debug, Clone, Default)]
pub struct FrameCodec {
    config: FrameConfig,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: FrameConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        let frame = decode_frame(src, self.config.max_payload_size.min(MAX_FRAME_LENGTH))?;
        if let Some(frame) = &frame {
            trace!(
                kind = frame.frame_type.name(),
                flags = ?frame.flags.names(frame.frame_type),
                src = frame.src_channel_id,
                dest = frame.dest_channel_id,
                len = frame.payload.len(),
                "decoded frame"
            );
        }
        Ok(frame)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        match src.len() {
            0 => Ok(None),
            n if n < HEADER_SIZE => Err(FrameError::TruncatedHeader { available: n }),
            n => Err(FrameError::Truncated { buffered: n }),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        encode_frame(&frame, self.config.max_payload_size, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut buf = BytesMut::new();
        let frame = Frame::data(3, 5, Bytes::from_static(b"hello, chanmux!"), false);

        encode_frame(&frame, MAX_FRAME_LENGTH, &mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE + frame.payload.len());

        let decoded = decode_frame(&mut buf, MAX_FRAME_LENGTH).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_incomplete_header() {
        let mut buf = BytesMut::from(&[0x00, 0x00, 0x00][..]);
        assert!(decode_frame(&mut buf, MAX_FRAME_LENGTH).unwrap().is_none());
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_decode_incomplete_payload() {
        let mut buf = BytesMut::new();
        encode_frame(&Frame::data(1, 0, &b"hello"[..], false), MAX_FRAME_LENGTH, &mut buf).unwrap();
        buf.truncate(HEADER_SIZE + 2);

        assert!(decode_frame(&mut buf, MAX_FRAME_LENGTH).unwrap().is_none());
        assert_eq!(buf.len(), HEADER_SIZE + 2);
    }

    #[test]
    fn test_decode_payload_too_large() {
        let mut buf = BytesMut::new();
        buf.put_slice(&FrameHeader::data(1, 0, 4096, Flags::NONE).encode());

        let result = decode_frame(&mut buf, 1460);
        assert!(matches!(
            result,
            Err(FrameError::PayloadTooLarge {
                size: 4096,
                max: 1460
            })
        ));
    }

    #[test]
    fn test_encode_payload_too_large() {
        let mut buf = BytesMut::new();
        let frame = Frame::data(1, 0, vec![0u8; 32], false);
        let err = encode_frame(&frame, 16, &mut buf).unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { size: 32, max: 16 }));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_multiple_frames() {
        let mut buf = BytesMut::new();
        encode_frame(&Frame::data(1, 0, &b"first"[..], false), MAX_FRAME_LENGTH, &mut buf).unwrap();
        encode_frame(&Frame::ping(&b"12345678"[..], false), MAX_FRAME_LENGTH, &mut buf).unwrap();
        encode_frame(&Frame::go_away(), MAX_FRAME_LENGTH, &mut buf).unwrap();

        let f1 = decode_frame(&mut buf, MAX_FRAME_LENGTH).unwrap().unwrap();
        assert_eq!(f1.frame_type, FrameType::Data);
        assert_eq!(f1.payload.as_ref(), b"first");

        let f2 = decode_frame(&mut buf, MAX_FRAME_LENGTH).unwrap().unwrap();
        assert_eq!(f2.frame_type, FrameType::Ping);
        assert!(!f2.is_ack());

        let f3 = decode_frame(&mut buf, MAX_FRAME_LENGTH).unwrap().unwrap();
        assert_eq!(f3.frame_type, FrameType::GoAway);
        assert!(f3.payload.is_empty());

        assert!(buf.is_empty());
    }

    #[test]
    fn test_end_stream_flag_survives() {
        let mut buf = BytesMut::new();
        encode_frame(&Frame::data(4, 2, Bytes::new(), true), MAX_FRAME_LENGTH, &mut buf).unwrap();
        let frame = decode_frame(&mut buf, MAX_FRAME_LENGTH).unwrap().unwrap();
        assert!(frame.is_end_stream());
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn test_decode_eof_clean_close() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_decode_eof_truncated_header() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[0x00, 0x01][..]);
        let err = codec.decode_eof(&mut buf).unwrap_err();
        assert!(matches!(err, FrameError::TruncatedHeader { available: 2 }));
    }

    #[test]
    fn test_decode_eof_truncated_payload() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::data(9, 0, &b"partial"[..], false), &mut buf)
            .unwrap();
        buf.truncate(HEADER_SIZE + 3);

        let err = codec.decode_eof(&mut buf).unwrap_err();
        assert!(matches!(err, FrameError::Truncated { buffered } if buffered == HEADER_SIZE + 3));
    }

    #[test]
    fn test_frame_wire_size() {
        let frame = Frame::data(1, 0, Bytes::from_static(b"test"), false);
        assert_eq!(frame.wire_size(), HEADER_SIZE + 4);
        assert_eq!(frame.header().length, 4);
    }
}
