//! Channel multiplexing over a single reliable byte stream.
//!
//! A [`Context`] owns one [`ConnectionContext`] per peer address. Each
//! connection carries any number of independent [`Channel`]s, keeps the peer
//! under heartbeat-based failure detection, and shuts down gracefully with
//! GOAWAY.
//!
//! # Example
//!
//! ```no_run
//! use chanmux_conn::{ConnectionConfig, Context};
//!
//! # async fn demo(stream: tokio::net::TcpStream) -> chanmux_conn::Result<()> {
//! let ctx = Context::new(ConnectionConfig::default())?;
//! let conn = ctx.attach("10.0.0.2:7000", stream)?;
//!
//! let channel = conn.open_channel()?;
//! channel.write_final(b"hello").await?;
//! let reply = channel.read_to_end().await?;
//! # let _ = reply;
//!
//! ctx.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod config;
pub mod connection;
pub mod context;
pub mod detector;
pub mod error;
pub mod registry;

pub use channel::{Channel, ChannelState, ChannelStream};
pub use config::{ConnectionConfig, MIN_FAILURE_THRESHOLD};
pub use connection::{CloseReason, ConnectionContext, ConnectionStats};
pub use context::Context;
pub use detector::{FailureDetector, Health, Liveness, Pulse};
pub use error::{ConnError, Result};
pub use registry::{ChannelRegistry, Identified};
