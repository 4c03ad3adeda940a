//! Fixed-header framing for channel-multiplexed connections.
//!
//! Every frame carries a 13-byte big-endian header:
//! - 1-byte frame type (`Data`, `Ping`, `GoAway`)
//! - 1-byte type-scoped flags (`END_STREAM` for data, `ACK` for ping)
//! - 3-byte payload length
//! - 4-byte source and 4-byte destination channel IDs
//!
//! [`FrameCodec`] plugs into `tokio_util::codec::Framed*` so callers always see
//! complete frames, never partial reads.

pub mod codec;
pub mod error;
pub mod header;

pub use codec::{decode_frame, encode_frame, Frame, FrameCodec, FrameConfig, RECOMMENDED_PAYLOAD};
pub use error::{FrameError, Result};
pub use header::{
    decode_header, Flags, FrameHeader, FrameType, HEADER_SIZE, MAX_FRAME_LENGTH, NO_CHANNEL,
};
