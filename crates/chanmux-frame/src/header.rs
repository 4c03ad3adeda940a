//! Frame header layout and flag definitions.
//!
//! Every frame on the wire starts with a fixed 13-byte big-endian header:
//!
//! ```text
//! ┌──────────┬──────────┬────────────┬──────────────┬───────────────┐
//! │ Type (1) │ Flags(1) │ Length (3) │ Src chan (4) │ Dest chan (4) │
//! └──────────┴──────────┴────────────┴──────────────┴───────────────┘
//! ```
//!
//! `Length` counts payload bytes only. Channel ID 0 means "not channel-specific".

use std::fmt;

use crate::error::{FrameError, Result};

/// Frame header size in bytes.
pub const HEADER_SIZE: usize = 13;

/// Largest payload the 24-bit length field can describe.
pub const MAX_FRAME_LENGTH: usize = 0x00FF_FFFF;

/// Channel ID used by frames that are not bound to a channel.
pub const NO_CHANNEL: u32 = 0;

/// Frame type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Channel payload bytes.
    Data = 0x00,
    /// Liveness probe or its acknowledgement.
    Ping = 0x01,
    /// The sender will not process further channels on this connection.
    GoAway = 0x02,
}

impl FrameType {
    /// Parse a wire type code.
    pub fn from_u8(code: u8) -> Result<Self> {
        match code {
            0x00 => Ok(FrameType::Data),
            0x01 => Ok(FrameType::Ping),
            0x02 => Ok(FrameType::GoAway),
            other => Err(FrameError::UnknownFrameType(other)),
        }
    }

    /// Human-readable name used in log output.
    pub fn name(self) -> &'static str {
        match self {
            FrameType::Data => "DATA",
            FrameType::Ping => "PING",
            FrameType::GoAway => "GOAWAY",
        }
    }
}

/// Per-frame flag bits. Their meaning depends on the frame type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Flags(u8);

impl Flags {
    /// No flags set.
    pub const NONE: Flags = Flags(0);
    /// `Data`: the sender will not send further data on this channel.
    pub const END_STREAM: Flags = Flags(0x01);
    /// `Ping`: this frame answers an earlier ping.
    pub const ACK: Flags = Flags(0x01);

    pub const fn from_bits(bits: u8) -> Self {
        Flags(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Flags) -> Flags {
        Flags(self.0 | other.0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Names of the known flags set for `frame_type`, e.g. `["END_STREAM"]`.
    pub fn names(self, frame_type: FrameType) -> Vec<&'static str> {
        let known: &[(Flags, &'static str)] = match frame_type {
            FrameType::Data => &[(Flags::END_STREAM, "END_STREAM")],
            FrameType::Ping => &[(Flags::ACK, "ACK")],
            FrameType::GoAway => &[],
        };
        known
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Flags(0x{:02x})", self.0)
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_type: FrameType,
    pub flags: Flags,
    /// Payload length in bytes (24-bit on the wire).
    pub length: u32,
    pub src_channel_id: u32,
    pub dest_channel_id: u32,
}

impl FrameHeader {
    /// Header for a data frame.
    pub fn data(src: u32, dest: u32, length: u32, flags: Flags) -> Self {
        Self {
            frame_type: FrameType::Data,
            flags,
            length,
            src_channel_id: src,
            dest_channel_id: dest,
        }
    }

    /// Header for a ping, or a ping acknowledgement when `ack` is set.
    pub fn ping(length: u32, ack: bool) -> Self {
        Self {
            frame_type: FrameType::Ping,
            flags: if ack { Flags::ACK } else { Flags::NONE },
            length,
            src_channel_id: NO_CHANNEL,
            dest_channel_id: NO_CHANNEL,
        }
    }

    /// Header for a payload-less go-away frame.
    pub fn go_away() -> Self {
        Self {
            frame_type: FrameType::GoAway,
            flags: Flags::NONE,
            length: 0,
            src_channel_id: NO_CHANNEL,
            dest_channel_id: NO_CHANNEL,
        }
    }

    pub fn is_end_stream(&self) -> bool {
        self.frame_type == FrameType::Data && self.flags.contains(Flags::END_STREAM)
    }

    pub fn is_ack(&self) -> bool {
        self.frame_type == FrameType::Ping && self.flags.contains(Flags::ACK)
    }

    /// Write the header into a caller-owned scratch buffer.
    ///
    /// Every byte of `dst` is overwritten. The length is truncated to 24 bits;
    /// callers validate it against [`MAX_FRAME_LENGTH`] first.
    pub fn encode_into(&self, dst: &mut [u8; HEADER_SIZE]) {
        let len = self.length.to_be_bytes();
        dst[0] = self.frame_type as u8;
        dst[1] = self.flags.bits();
        dst[2..5].copy_from_slice(&len[1..4]);
        dst[5..9].copy_from_slice(&self.src_channel_id.to_be_bytes());
        dst[9..13].copy_from_slice(&self.dest_channel_id.to_be_bytes());
    }

    /// Encode into a fresh stack array.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }
}

/// Decode a header from the first 13 bytes of `src`.
pub fn decode_header(src: &[u8]) -> Result<FrameHeader> {
    if src.len() < HEADER_SIZE {
        return Err(FrameError::TruncatedHeader {
            available: src.len(),
        });
    }

    let frame_type = FrameType::from_u8(src[0])?;
    let flags = Flags::from_bits(src[1]);
    let length = u32::from_be_bytes([0, src[2], src[3], src[4]]);
    let src_channel_id = u32::from_be_bytes([src[5], src[6], src[7], src[8]]);
    let dest_channel_id = u32::from_be_bytes([src[9], src[10], src[11], src[12]]);

    Ok(FrameHeader {
        frame_type,
        flags,
        length,
        src_channel_id,
        dest_channel_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_header_layout() {
        let header = FrameHeader::data(0x0102_0304, 0x0A0B_0C0D, 0x00AB_CDEF, Flags::END_STREAM);
        assert_eq!(
            header.encode(),
            [
                0x00, 0x01, 0xAB, 0xCD, 0xEF, 0x01, 0x02, 0x03, 0x04, 0x0A, 0x0B, 0x0C, 0x0D
            ]
        );
    }

    #[test]
    fn ping_ack_layout() {
        let header = FrameHeader::ping(8, true);
        assert_eq!(
            header.encode(),
            [0x01, 0x01, 0x00, 0x00, 0x08, 0, 0, 0, 0, 0, 0, 0, 0]
        );
        assert!(header.is_ack());
        assert!(!header.is_end_stream());
    }

    #[test]
    fn decode_matches_encode() {
        let header = FrameHeader::data(7, 9, 1460, Flags::NONE);
        let decoded = decode_header(&header.encode()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn decode_ignores_trailing_bytes() {
        let mut wire = FrameHeader::go_away().encode().to_vec();
        wire.extend_from_slice(b"payload");
        let decoded = decode_header(&wire).unwrap();
        assert_eq!(decoded.frame_type, FrameType::GoAway);
        assert_eq!(decoded.length, 0);
    }

    #[test]
    fn truncated_header_rejected() {
        let err = decode_header(&[0x00, 0x00, 0x00]).unwrap_err();
        assert!(matches!(err, FrameError::TruncatedHeader { available: 3 }));
    }

    #[test]
    fn unknown_type_rejected() {
        let mut wire = FrameHeader::go_away().encode();
        wire[0] = 0x7F;
        let err = decode_header(&wire).unwrap_err();
        assert!(matches!(err, FrameError::UnknownFrameType(0x7F)));
    }

    #[test]
    fn encode_into_overwrites_stale_scratch() {
        let mut scratch = [0xFFu8; HEADER_SIZE];
        FrameHeader::data(1, 0, 0, Flags::NONE).encode_into(&mut scratch);
        assert_eq!(scratch, [0, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0]);
    }

    #[test]
    fn flag_names_are_type_scoped() {
        assert_eq!(Flags::END_STREAM.names(FrameType::Data), vec!["END_STREAM"]);
        assert_eq!(Flags::ACK.names(FrameType::Ping), vec!["ACK"]);
        assert!(Flags::ACK.names(FrameType::GoAway).is_empty());
        assert!(Flags::NONE.names(FrameType::Data).is_empty());
    }
}
