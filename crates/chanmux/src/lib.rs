//! Channel multiplexing over a single reliable byte stream.
//!
//! chanmux carries many independent bidirectional channels over one ordered
//! byte stream (a TCP connection, a Unix socket, an in-memory pipe), watches
//! the peer with heartbeats, and offers a small typed message layer for channel
//! payloads.
//!
//! # Crate Structure
//!
//! - [`frame`]: the 13-byte frame header and its tokio codec
//! - [`conn`]: channels, connections, failure detection and the owning context
//! - [`protocol`]: versioned message registry and codec (behind `protocol`)
//! - [`logging`]: stderr `tracing` subscriber for binaries (behind `logging`)

/// Re-export frame types.
pub mod frame {
    pub use chanmux_frame::*;
}

/// Re-export connection types.
pub mod conn {
    pub use chanmux_conn::*;
}

/// Re-export message protocol types (requires `protocol` feature).
#[cfg(feature = "protocol")]
pub mod protocol {
    pub use chanmux_protocol::*;
}

#[cfg(feature = "logging")]
pub mod logging;

pub use chanmux_conn::{
    Channel, ChannelState, ChannelStream, CloseReason, ConnError, ConnectionConfig,
    ConnectionContext, Context,
};
