/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The header carries a frame type code this codec does not know.
    #[error("unknown frame type 0x{0:02x}")]
    UnknownFrameType(u8),

    /// Fewer than 13 bytes were available for a frame header.
    #[error("truncated frame header ({available} of 13 bytes)")]
    TruncatedHeader { available: usize },

    /// The stream ended part-way through a frame.
    #[error("stream ended mid-frame ({buffered} bytes buffered)")]
    Truncated { buffered: usize },

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FrameError>;
