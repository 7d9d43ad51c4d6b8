//! Frame and message data model
//!
//! A [`Frame`] is one decoded wire unit, stamped with its connection's
//! [`FrameContext`]. A [`Message`] is an outbound logical unit handed to the
//! encoder. A [`LogicalMessage`] is the application-visible result of
//! reassembly: either a single final frame passed through, or a joined
//! continuation chain.

use std::sync::Arc;

use bytes::Bytes;

use crate::mask::MaskedSource;
use crate::opcode::OpCode;
use crate::storage::{BytesSource, EmptySource, PayloadSource};

/// Connection-scoped metadata stamped on every decoded frame.
///
/// One instance is built at upgrade time and shared by reference; fragment
/// chains verify that all members agree on it (first frame authoritative).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameContext {
    /// Request path the connection was upgraded on
    pub path: String,
    /// Negotiated WebSocket protocol version
    pub version: u16,
    /// Sub-protocols offered by the client, in offer order
    pub protocols: Vec<String>,
    /// Authenticated principal, if the upgrade authorizer supplied one
    pub principal: Option<String>,
    /// Resolved device identifier, if any
    pub device: Option<String>,
}

impl FrameContext {
    /// Context for an anonymous connection on `path`
    pub fn new(path: impl Into<String>, version: u16, protocols: Vec<String>) -> Self {
        Self {
            path: path.into(),
            version,
            protocols,
            principal: None,
            device: None,
        }
    }
}

/// One decoded WebSocket frame: header fields plus the payload source.
///
/// The payload is stored exactly as received; masked frames are unmasked
/// lazily when the payload is read via [`Frame::into_payload`].
pub struct Frame {
    /// Frame type
    pub opcode: OpCode,
    /// FIN bit
    pub fin: bool,
    /// MASK bit
    pub masked: bool,
    /// Masking key, present when `masked`
    pub mask_key: Option<[u8; 4]>,
    /// Declared (and delivered) payload length in bytes
    pub payload_len: u64,
    /// Connection metadata
    pub context: Arc<FrameContext>,
    payload: Box<dyn PayloadSource>,
}

impl Frame {
    /// Build an unmasked frame, mainly useful for tests and local injection
    pub fn new(
        opcode: OpCode,
        fin: bool,
        payload: Box<dyn PayloadSource>,
        context: Arc<FrameContext>,
    ) -> Self {
        Self {
            opcode,
            fin,
            masked: false,
            mask_key: None,
            payload_len: payload.remaining(),
            context,
            payload,
        }
    }

    pub(crate) fn from_wire(
        opcode: OpCode,
        fin: bool,
        mask_key: Option<[u8; 4]>,
        payload_len: u64,
        payload: Box<dyn PayloadSource>,
        context: Arc<FrameContext>,
    ) -> Self {
        Self {
            opcode,
            fin,
            masked: mask_key.is_some(),
            mask_key,
            payload_len,
            context,
            payload,
        }
    }

    /// Whether this is a control frame (Close, Ping, Pong)
    pub fn is_control(&self) -> bool {
        self.opcode.is_control()
    }

    /// Consume the frame, yielding the unmasked payload stream
    pub fn into_payload(self) -> Box<dyn PayloadSource> {
        match self.mask_key {
            Some(key) => Box::new(MaskedSource::new(self.payload, key)),
            None => self.payload,
        }
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("opcode", &self.opcode)
            .field("fin", &self.fin)
            .field("masked", &self.masked)
            .field("payload_len", &self.payload_len)
            .field("path", &self.context.path)
            .finish()
    }
}

/// Outbound logical unit: opcode, FIN flag and a lazily-consumed payload.
pub struct Message {
    /// Frame type
    pub opcode: OpCode,
    /// FIN bit
    pub fin: bool,
    /// Payload length in bytes
    pub payload_len: u64,
    payload: Box<dyn PayloadSource>,
}

impl Message {
    /// Build a message from an explicit payload source.
    ///
    /// `payload_len` must equal the number of bytes the source will yield.
    pub fn new(opcode: OpCode, fin: bool, payload_len: u64, payload: Box<dyn PayloadSource>) -> Self {
        Self {
            opcode,
            fin,
            payload_len,
            payload,
        }
    }

    /// Final text message
    pub fn text(text: impl Into<String>) -> Self {
        let bytes = Bytes::from(text.into().into_bytes());
        Self::new(
            OpCode::Text,
            true,
            bytes.len() as u64,
            Box::new(BytesSource::new(bytes)),
        )
    }

    /// Final binary message
    pub fn binary(data: impl Into<Bytes>) -> Self {
        let bytes = data.into();
        Self::new(
            OpCode::Binary,
            true,
            bytes.len() as u64,
            Box::new(BytesSource::new(bytes)),
        )
    }

    /// Ping with empty payload
    pub fn ping() -> Self {
        Self::new(OpCode::Ping, true, 0, Box::new(EmptySource))
    }

    /// Pong with empty payload
    pub fn pong() -> Self {
        Self::new(OpCode::Pong, true, 0, Box::new(EmptySource))
    }

    /// Close with empty payload
    pub fn close() -> Self {
        Self::new(OpCode::Close, true, 0, Box::new(EmptySource))
    }

    /// Consume the message, yielding the payload stream
    pub fn into_payload(self) -> Box<dyn PayloadSource> {
        self.payload
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("opcode", &self.opcode)
            .field("fin", &self.fin)
            .field("payload_len", &self.payload_len)
            .finish()
    }
}

/// Application-visible message: one final frame, or a joined fragment chain.
pub struct LogicalMessage {
    /// Logical frame type (the first frame's opcode for a joined chain)
    pub opcode: OpCode,
    /// Whether every member frame arrived masked
    pub masked: bool,
    /// Total payload length across all member frames
    pub payload_len: u64,
    /// Connection metadata, shared by all member frames
    pub context: Arc<FrameContext>,
    payload: Box<dyn PayloadSource>,
}

impl LogicalMessage {
    /// Pass a single final frame through unchanged (the unfragmented fast path)
    pub fn from_frame(frame: Frame) -> Self {
        let opcode = frame.opcode;
        let masked = frame.masked;
        let payload_len = frame.payload_len;
        let context = Arc::clone(&frame.context);
        Self {
            opcode,
            masked,
            payload_len,
            context,
            payload: frame.into_payload(),
        }
    }

    pub(crate) fn from_parts(
        opcode: OpCode,
        masked: bool,
        payload_len: u64,
        context: Arc<FrameContext>,
        payload: Box<dyn PayloadSource>,
    ) -> Self {
        Self {
            opcode,
            masked,
            payload_len,
            context,
            payload,
        }
    }

    /// Consume the message, yielding the unmasked payload stream
    pub fn into_payload(self) -> Box<dyn PayloadSource> {
        self.payload
    }
}

impl std::fmt::Debug for LogicalMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicalMessage")
            .field("opcode", &self.opcode)
            .field("masked", &self.masked)
            .field("payload_len", &self.payload_len)
            .field("path", &self.context.path)
            .finish()
    }
}
