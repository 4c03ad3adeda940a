use std::collections::HashMap;
use std::fmt;
use std::io::{self, Cursor, ErrorKind, Read, Write};

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, error, trace};

use crate::error::{ProtocolError, Result};
use crate::header_pool::HeaderPool;
use crate::message::{Constructor, Message};

/// Fixed signature that opens every message header.
pub const SIGNATURE: u16 = 0x0622;

/// Message header: signature (2) + version/type composite (2) = 4 bytes.
pub const MESSAGE_HEADER_SIZE: usize = 4;

/// Type ID reserved as "unused"; never registrable.
pub const RESERVED_TYPE_ID: u8 = 0;

const VERSION_SHIFT: u16 = 8;

fn composite(version: u8, type_id: u8) -> u16 {
    (u16::from(version) << VERSION_SHIFT) | u16::from(type_id)
}

fn split_composite(value: u16) -> (u8, u8) {
    ((value >> VERSION_SHIFT) as u8, (value & 0x00FF) as u8)
}

/// Collects `(kind, type_id)` registrations before a [`Protocol`] is frozen.
///
/// Every registration is checked against the bijection invariant; a rejected
/// registration leaves the builder exactly as it was.
pub struct ProtocolBuilder<M: Message> {
    version: u8,
    constructors: HashMap<u8, (M::Kind, Constructor<M>)>,
    type_ids: HashMap<M::Kind, u8>,
    pool_capacity: usize,
}

impl<M: Message> ProtocolBuilder<M> {
    /// Start a registry for protocol `version`.
    pub fn new(version: u8) -> Self {
        Self {
            version,
            constructors: HashMap::new(),
            type_ids: HashMap::new(),
            pool_capacity: crate::header_pool::DEFAULT_POOL_CAPACITY,
        }
    }

    /// Bind `kind` to `type_id`, using `constructor` to decode it.
    pub fn register(
        &mut self,
        kind: M::Kind,
        type_id: u8,
        constructor: Constructor<M>,
    ) -> Result<&mut Self> {
        if type_id == RESERVED_TYPE_ID {
            return Err(registration_error(format!(
                "type id {RESERVED_TYPE_ID} is reserved (kind {kind:?})"
            )));
        }
        if let Some((existing, _)) = self.constructors.get(&type_id) {
            return Err(registration_error(format!(
                "duplicate declaration of type id {type_id}: already bound to {existing:?}, \
                 cannot bind {kind:?}"
            )));
        }
        if let Some(existing) = self.type_ids.get(&kind) {
            return Err(registration_error(format!(
                "conflicting type id for {kind:?}: already bound to {existing}, cannot bind {type_id}"
            )));
        }

        self.constructors.insert(type_id, (kind, constructor));
        self.type_ids.insert(kind, type_id);
        debug!(version = self.version, type_id, ?kind, "registered message type");
        Ok(self)
    }

    /// Override how many idle header buffers the protocol keeps.
    pub fn header_pool_capacity(&mut self, capacity: usize) -> &mut Self {
        self.pool_capacity = capacity;
        self
    }

    /// Type ID currently bound to `kind`.
    pub fn type_id_of(&self, kind: M::Kind) -> Option<u8> {
        self.type_ids.get(&kind).copied()
    }

    /// Kind currently bound to `type_id`.
    pub fn kind_of(&self, type_id: u8) -> Option<M::Kind> {
        self.constructors.get(&type_id).map(|(kind, _)| *kind)
    }

    /// Number of registered kinds.
    pub fn len(&self) -> usize {
        self.type_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.type_ids.is_empty()
    }

    /// Freeze the registry. The result is read-only.
    pub fn build(self) -> Protocol<M> {
        Protocol {
            version: self.version,
            constructors: self.constructors,
            type_ids: self.type_ids,
            pool: HeaderPool::with_capacity(self.pool_capacity),
        }
    }
}

fn registration_error(message: String) -> ProtocolError {
    error!(%message, "rejected message registration");
    ProtocolError::Registration(message)
}

/// A frozen, versioned message registry with signature-checked encode/decode.
///
/// Wire format (big-endian):
/// ```text
/// ┌────────────────┬──────────────┬──────────────┬──────────────┐
/// │ Signature (2B) │ Version (1B) │ Type ID (1B) │ Body         │
/// │ 0x06 0x22      │              │              │              │
/// └────────────────┴──────────────┴──────────────┴──────────────┘
/// ```
pub struct Protocol<M: Message> {
    version: u8,
    constructors: HashMap<u8, (M::Kind, Constructor<M>)>,
    type_ids: HashMap<M::Kind, u8>,
    pool: HeaderPool<MESSAGE_HEADER_SIZE>,
}

impl<M: Message> Protocol<M> {
    /// Start building a protocol for `version`.
    pub fn builder(version: u8) -> ProtocolBuilder<M> {
        ProtocolBuilder::new(version)
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn type_id_of(&self, kind: M::Kind) -> Option<u8> {
        self.type_ids.get(&kind).copied()
    }

    pub fn kind_of(&self, type_id: u8) -> Option<M::Kind> {
        self.constructors.get(&type_id).map(|(kind, _)| *kind)
    }

    /// Write header and body of `message`, returning the total byte count.
    pub fn encode<W: Write>(&self, dst: &mut W, message: &M) -> Result<usize> {
        let kind = message.kind();
        let type_id = self.type_ids.get(&kind).copied().ok_or_else(|| {
            ProtocolError::IllegalMessage(format!(
                "message kind {kind:?} is not registered with protocol v{}",
                self.version
            ))
        })?;

        {
            let mut header = self.pool.checkout();
            header[..2].copy_from_slice(&SIGNATURE.to_be_bytes());
            header[2..].copy_from_slice(&composite(self.version, type_id).to_be_bytes());
            dst.write_all(&header[..])?;
        }

        let body = message.write_body(dst)?;
        trace!(type_id, ?kind, body, "encoded message");
        Ok(MESSAGE_HEADER_SIZE + body)
    }

    /// Encode into a fresh buffer.
    pub fn encode_to_bytes(&self, message: &M) -> Result<Bytes> {
        let mut writer = BytesMut::new().writer();
        self.encode(&mut writer, message)?;
        Ok(writer.into_inner().freeze())
    }

    /// Read one message: header first, then the registered constructor reads the body.
    pub fn decode<R: Read>(&self, src: &mut R) -> Result<M> {
        let (version, type_id) = {
            let mut header = self.pool.checkout();
            read_header(src, &mut header)?;

            let signature = u16::from_be_bytes([header[0], header[1]]);
            if signature != SIGNATURE {
                return Err(ProtocolError::MalformedData(format!(
                    "illegal signature: expected 0x{SIGNATURE:04x}, got 0x{signature:04x}"
                )));
            }
            split_composite(u16::from_be_bytes([header[2], header[3]]))
        };

        if version != self.version {
            return Err(ProtocolError::MalformedData(format!(
                "illegal protocol version: expected {}, got {version}",
                self.version
            )));
        }

        let (kind, constructor) = self.constructors.get(&type_id).ok_or_else(|| {
            ProtocolError::MalformedData(format!("unregistered message type {type_id}"))
        })?;

        let message = constructor(src).map_err(|err| match err.kind() {
            ErrorKind::UnexpectedEof => ProtocolError::MalformedData(format!(
                "insufficient bytes for {kind:?} body"
            )),
            _ => ProtocolError::Io(err),
        })?;
        trace!(type_id, ?kind, "decoded message");
        Ok(message)
    }

    /// Decode exactly one message occupying all of `bytes`.
    pub fn decode_from_slice(&self, bytes: &[u8]) -> Result<M> {
        let mut cursor = Cursor::new(bytes);
        let message = self.decode(&mut cursor)?;
        let consumed = cursor.position() as usize;
        if consumed != bytes.len() {
            return Err(ProtocolError::MalformedData(format!(
                "{} trailing bytes after message",
                bytes.len() - consumed
            )));
        }
        Ok(message)
    }
}

fn read_header<R: Read>(src: &mut R, header: &mut [u8; MESSAGE_HEADER_SIZE]) -> Result<()> {
    src.read_exact(header).map_err(|err: io::Error| match err.kind() {
        ErrorKind::UnexpectedEof => {
            ProtocolError::MalformedData("illegal header: insufficient bytes".to_string())
        }
        _ => ProtocolError::Io(err),
    })
}

impl<M: Message> fmt::Debug for Protocol<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<u8> = self.constructors.keys().copied().collect();
        ids.sort_unstable();
        f.debug_struct("Protocol")
            .field("version", &self.version)
            .field("type_ids", &ids)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum TestKind {
        Empty,
        Int8,
        Text,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum TestMessage {
        Empty,
        Int8(i8),
        Text(String),
    }

    impl Message for TestMessage {
        type Kind = TestKind;

        fn kind(&self) -> TestKind {
            match self {
                TestMessage::Empty => TestKind::Empty,
                TestMessage::Int8(_) => TestKind::Int8,
                TestMessage::Text(_) => TestKind::Text,
            }
        }

        fn write_body(&self, dst: &mut dyn Write) -> io::Result<usize> {
            match self {
                TestMessage::Empty => Ok(0),
                TestMessage::Int8(v) => {
                    dst.write_all(&v.to_be_bytes())?;
                    Ok(1)
                }
                TestMessage::Text(s) => {
                    dst.write_all(&(s.len() as u16).to_be_bytes())?;
                    dst.write_all(s.as_bytes())?;
                    Ok(2 + s.len())
                }
            }
        }
    }

    fn read_empty(_: &mut dyn Read) -> io::Result<TestMessage> {
        Ok(TestMessage::Empty)
    }

    fn read_int8(src: &mut dyn Read) -> io::Result<TestMessage> {
        let mut buf = [0u8; 1];
        src.read_exact(&mut buf)?;
        Ok(TestMessage::Int8(i8::from_be_bytes(buf)))
    }

    fn read_text(src: &mut dyn Read) -> io::Result<TestMessage> {
        let mut len = [0u8; 2];
        src.read_exact(&mut len)?;
        let mut text = vec![0u8; u16::from_be_bytes(len) as usize];
        src.read_exact(&mut text)?;
        String::from_utf8(text)
            .map(TestMessage::Text)
            .map_err(|err| io::Error::new(ErrorKind::InvalidData, err))
    }

    fn test_protocol() -> Protocol<TestMessage> {
        let mut builder = Protocol::builder(1);
        builder
            .register(TestKind::Empty, 1, read_empty)
            .unwrap()
            .register(TestKind::Int8, 2, read_int8)
            .unwrap()
            .register(TestKind::Text, 3, read_text)
            .unwrap();
        builder.build()
    }

    #[test]
    fn encodes_exact_fixture() {
        let protocol = test_protocol();
        let mut wire = Vec::new();
        let written = protocol.encode(&mut wire, &TestMessage::Int8(8)).unwrap();
        assert_eq!(wire, vec![0x06, 0x22, 0x01, 0x02, 0x08]);
        assert_eq!(written, 5);
    }

    #[test]
    fn decodes_exact_fixture() {
        let protocol = test_protocol();
        let mut src = Cursor::new(vec![0x06, 0x22, 0x01, 0x02, 0x08]);
        let message = protocol.decode(&mut src).unwrap();
        assert_eq!(message, TestMessage::Int8(8));
    }

    #[test]
    fn roundtrip_every_kind() {
        let protocol = test_protocol();
        for message in [
            TestMessage::Empty,
            TestMessage::Int8(-128),
            TestMessage::Int8(127),
            TestMessage::Text(String::new()),
            TestMessage::Text("multiplexed".to_string()),
        ] {
            let bytes = protocol.encode_to_bytes(&message).unwrap();
            assert_eq!(protocol.decode_from_slice(&bytes).unwrap(), message);
        }
    }

    #[test]
    fn consecutive_messages_share_a_stream() {
        let protocol = test_protocol();
        let mut wire = Vec::new();
        protocol.encode(&mut wire, &TestMessage::Int8(1)).unwrap();
        protocol
            .encode(&mut wire, &TestMessage::Text("two".to_string()))
            .unwrap();
        protocol.encode(&mut wire, &TestMessage::Empty).unwrap();

        let mut src = Cursor::new(wire);
        assert_eq!(protocol.decode(&mut src).unwrap(), TestMessage::Int8(1));
        assert_eq!(
            protocol.decode(&mut src).unwrap(),
            TestMessage::Text("two".to_string())
        );
        assert_eq!(protocol.decode(&mut src).unwrap(), TestMessage::Empty);
    }

    #[test]
    fn rejects_bad_signature() {
        let protocol = test_protocol();
        for header in [[0x00, 0x00, 0x01, 0x02], [0x22, 0x06, 0x01, 0x02], [0x06, 0x23, 0x01, 0x01]] {
            let err = protocol.decode_from_slice(&header).unwrap_err();
            assert!(matches!(err, ProtocolError::MalformedData(_)), "{header:?}");
        }
    }

    #[test]
    fn rejects_version_mismatch() {
        let protocol = test_protocol();
        let err = protocol
            .decode_from_slice(&[0x06, 0x22, 0x02, 0x02, 0x08])
            .unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedData(msg) if msg.contains("version")));
    }

    #[test]
    fn rejects_unregistered_type_on_decode() {
        let protocol = test_protocol();
        let err = protocol.decode_from_slice(&[0x06, 0x22, 0x01, 0x09]).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedData(msg) if msg.contains("unregistered")));
    }

    #[test]
    fn rejects_short_header() {
        let protocol = test_protocol();
        for len in 0..MESSAGE_HEADER_SIZE {
            let wire = &[0x06, 0x22, 0x01, 0x02][..len];
            let err = protocol.decode(&mut Cursor::new(wire)).unwrap_err();
            assert!(matches!(err, ProtocolError::MalformedData(_)));
        }
    }

    #[test]
    fn rejects_short_body() {
        let protocol = test_protocol();
        let err = protocol
            .decode_from_slice(&[0x06, 0x22, 0x01, 0x03, 0x00, 0x05, b'a'])
            .unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedData(_)));
    }

    #[test]
    fn rejects_trailing_bytes() {
        let protocol = test_protocol();
        let err = protocol
            .decode_from_slice(&[0x06, 0x22, 0x01, 0x02, 0x08, 0xFF])
            .unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedData(msg) if msg.contains("trailing")));
    }

    #[test]
    fn unregistered_kind_is_illegal_on_encode() {
        let mut builder = Protocol::builder(1);
        builder.register(TestKind::Empty, 1, read_empty).unwrap();
        let protocol = builder.build();

        let mut wire = Vec::new();
        let err = protocol.encode(&mut wire, &TestMessage::Int8(8)).unwrap_err();
        assert!(matches!(err, ProtocolError::IllegalMessage(_)));
        assert!(wire.is_empty());

        protocol.encode(&mut wire, &TestMessage::Empty).unwrap();
        assert_eq!(wire, vec![0x06, 0x22, 0x01, 0x01]);
    }

    #[test]
    fn duplicate_type_id_rejected_and_state_kept() {
        let mut builder: ProtocolBuilder<TestMessage> = Protocol::builder(1);
        builder.register(TestKind::Empty, 1, read_empty).unwrap();

        let err = builder.register(TestKind::Int8, 1, read_int8).err().unwrap();
        assert!(matches!(err, ProtocolError::Registration(_)));
        assert_eq!(builder.kind_of(1), Some(TestKind::Empty));
        assert_eq!(builder.type_id_of(TestKind::Int8), None);
        assert_eq!(builder.len(), 1);
    }

    #[test]
    fn conflicting_kind_rejected_and_state_kept() {
        let mut builder: ProtocolBuilder<TestMessage> = Protocol::builder(1);
        builder.register(TestKind::Int8, 2, read_int8).unwrap();

        let err = builder.register(TestKind::Int8, 5, read_int8).err().unwrap();
        assert!(matches!(err, ProtocolError::Registration(_)));
        assert_eq!(builder.type_id_of(TestKind::Int8), Some(2));
        assert_eq!(builder.kind_of(5), None);
    }

    #[test]
    fn reserved_type_id_rejected() {
        let mut builder: ProtocolBuilder<TestMessage> = Protocol::builder(1);
        let err = builder.register(TestKind::Empty, 0, read_empty).err().unwrap();
        assert!(matches!(err, ProtocolError::Registration(_)));
        assert!(builder.is_empty());
    }

    #[test]
    fn header_buffers_are_returned() {
        let protocol = test_protocol();
        let _ = protocol.decode_from_slice(&[0x00, 0x00, 0x00, 0x00]);
        let _ = protocol.encode_to_bytes(&TestMessage::Empty).unwrap();
        assert_eq!(protocol.pool.idle(), 1);
    }

    #[test]
    fn composite_field_layout() {
        assert_eq!(composite(1, 2), 0x0102);
        assert_eq!(split_composite(0xAB07), (0xAB, 0x07));
    }
}
