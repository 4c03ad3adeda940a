//! Versioned, signature-checked application message codec.
//!
//! A [`Protocol`] maps each kind of an application's message enum to a compact
//! one-byte type ID and back. Every encoded message starts with a 4-byte header:
//! the `0x0622` signature followed by `(version << 8) | type_id`, big-endian.
//!
//! Registrations happen once through [`ProtocolBuilder`]; conflicting or reserved
//! type IDs are rejected there, before any traffic is processed. The built
//! protocol is immutable and shared freely across tasks.

pub mod error;
pub mod header_pool;
pub mod message;
pub mod protocol;

pub use error::{ProtocolError, Result};
pub use header_pool::{HeaderPool, PooledHeader};
pub use message::{Constructor, Message};
pub use protocol::{Protocol, ProtocolBuilder, MESSAGE_HEADER_SIZE, RESERVED_TYPE_ID, SIGNATURE};
