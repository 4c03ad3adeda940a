use std::io;

use chanmux_frame::FrameError;

/// Errors that can occur in channel and connection operations.
#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// The channel no longer accepts writes (local END_STREAM sent or fully closed).
    #[error("channel {0} is closed")]
    ChannelClosed(u32),

    /// The connection was torn down (local shutdown, GoAway or peer EOF).
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// The connection was torn down because it failed (heartbeat timeout,
    /// transport error, malformed frames).
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// A channel with this ID is already registered.
    #[error("channel {0} is already registered")]
    DuplicateChannel(u32),

    /// All 32-bit channel IDs have been handed out.
    #[error("channel ids exhausted")]
    ChannelIdsExhausted,

    /// The connection is draining and refuses new channels.
    #[error("connection is not accepting new channels")]
    NotAccepting,

    /// A connection for this peer address already exists in the context.
    #[error("peer {0} is already attached")]
    AlreadyAttached(String),

    /// The context is shutting down.
    #[error("context is shutting down")]
    ShuttingDown,

    /// Configuration values are out of range.
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, ConnError>;

impl From<ConnError> for io::Error {
    fn from(err: ConnError) -> Self {
        let kind = match &err {
            ConnError::Frame(FrameError::Io(inner)) => inner.kind(),
            ConnError::ChannelClosed(_) => io::ErrorKind::BrokenPipe,
            ConnError::ConnectionClosed(_) => io::ErrorKind::ConnectionAborted,
            ConnError::ConnectionFailed(_) => io::ErrorKind::ConnectionReset,
            ConnError::InvalidConfig(_) => io::ErrorKind::InvalidInput,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}
