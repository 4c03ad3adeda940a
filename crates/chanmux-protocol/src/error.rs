/// Errors that can occur while registering, encoding or decoding messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The input is not a well-formed message for this protocol
    /// (bad signature, short header, version mismatch, unknown type, short body).
    #[error("malformed data: {0}")]
    MalformedData(String),

    /// The message kind has no registered type ID.
    #[error("illegal message: {0}")]
    IllegalMessage(String),

    /// Conflicting or invalid type registration at setup time.
    #[error("invalid message registration: {0}")]
    Registration(String),

    /// An I/O error from the underlying reader or writer.
    #[error("message I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
