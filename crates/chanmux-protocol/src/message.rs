//! Application message contract.
//!
//! A protocol speaks one closed set of messages, usually an enum with one variant
//! per message kind. The enum names its kinds through [`Message::Kind`] and
//! serializes its own body; the protocol owns the header and the dispatch from
//! wire type IDs back to constructors.

use std::fmt;
use std::hash::Hash;
use std::io::{self, Read, Write};

/// A message that can travel through a [`Protocol`](crate::Protocol).
pub trait Message: Sized {
    /// Discriminant naming each message kind.
    type Kind: Copy + Eq + Hash + fmt::Debug;

    /// The kind of this instance.
    fn kind(&self) -> Self::Kind;

    /// Serialize the body (everything after the 4-byte header).
    ///
    /// Returns the number of body bytes written.
    fn write_body(&self, dst: &mut dyn Write) -> io::Result<usize>;
}

/// Builds a fresh message of one kind by deserializing its body from `src`.
///
/// A body that ends early should surface `io::ErrorKind::UnexpectedEof`
/// (as `Read::read_exact` does); the protocol reports it as malformed data.
pub type Constructor<M> = fn(&mut dyn Read) -> io::Result<M>;
