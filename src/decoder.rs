//! Incremental frame decoder
//!
//! A push-driven state machine that turns an arbitrarily-chunked byte stream
//! into [`Frame`]s. The caller feeds whatever bytes the transport produced
//! into [`FrameDecoder::push`]; the decoder consumes only what it can use,
//! leaving trailing bytes (the start of the next frame) in the caller's
//! buffer. Payload bytes are streamed straight into a sink obtained from the
//! [`MessageStore`], so payload size is not bounded by available memory.
//!
//! Header layout (RFC 6455 section 5.2):
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Extended payload length continued, if payload len == 127  |
//! + - - - - - - - - - - - - - - - +-------------------------------+
//! |                               |Masking-key, if MASK set to 1  |
//! +-------------------------------+-------------------------------+
//! | Masking-key (continued)       |          Payload Data         |
//! +---------------------------------------------------------------+
//! ```
//!
//! 2 base bytes + 8 extended-length bytes + 4 mask bytes = 14 bytes, the
//! largest header the protocol allows.

use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tracing::trace;

use crate::error::{Error, Result};
use crate::frame::{Frame, FrameContext};
use crate::opcode::OpCode;
use crate::storage::{MessageStore, PayloadSink, WEBSOCKET_TAG};

/// Largest possible frame header
const MAX_HEADER_SIZE: usize = 14;

/// Upper bound on a single write into the payload sink
const COPY_WINDOW: usize = 4096;

/// Outcome of one [`FrameDecoder::push`] call.
#[derive(Debug)]
pub enum Progress {
    /// Not enough bytes buffered to make progress; wait for more
    NeedMoreData,
    /// One complete frame was decoded; trailing bytes remain in the buffer
    Frame(Frame),
    /// The transport reached EOF; any half-read frame was discarded
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Header,
    Payload,
    Closed,
    Failed,
}

/// Incremental, resumable decoder for one connection.
///
/// Drive it with [`push`](Self::push) as transport bytes arrive and
/// [`push_eof`](Self::push_eof) when the peer closes. Calls must not be made
/// concurrently for the same connection; the decoder is a sequential state
/// machine.
pub struct FrameDecoder {
    store: Arc<dyn MessageStore>,
    context: Arc<FrameContext>,

    phase: Phase,
    scratch: [u8; MAX_HEADER_SIZE],
    scratch_len: usize,

    fin: Option<bool>,
    opcode: Option<OpCode>,
    masked: Option<bool>,
    base_len: Option<u8>,
    extended_len: Option<u64>,
    mask_key: Option<[u8; 4]>,

    payload_len: u64,
    payload_read: u64,
    sink: Option<Box<dyn PayloadSink>>,
}

impl FrameDecoder {
    pub fn new(store: Arc<dyn MessageStore>, context: Arc<FrameContext>) -> Self {
        Self {
            store,
            context,
            phase: Phase::Header,
            scratch: [0; MAX_HEADER_SIZE],
            scratch_len: 0,
            fin: None,
            opcode: None,
            masked: None,
            base_len: None,
            extended_len: None,
            mask_key: None,
            payload_len: 0,
            payload_read: 0,
            sink: None,
        }
    }

    /// Whether the decoder sits between frames, with no partial header or
    /// payload in flight
    pub fn is_idle(&self) -> bool {
        matches!(self.phase, Phase::Header) && self.scratch_len == 0
    }

    /// Feed newly-arrived transport bytes.
    ///
    /// Consumes from the front of `buf` only what the current frame needs;
    /// anything past the declared payload length stays in `buf` for the next
    /// call (frames may arrive back-to-back in one read). An empty `buf` is a
    /// no-op returning [`Progress::NeedMoreData`].
    pub fn push(&mut self, buf: &mut BytesMut) -> Result<Progress> {
        match self.phase {
            Phase::Closed => return Ok(Progress::Closed),
            Phase::Failed => {
                return Err(Error::malformed_header("decoder unusable after failure"))
            }
            Phase::Header | Phase::Payload => {}
        }

        if self.phase == Phase::Header {
            match self.parse_header(buf) {
                Ok(true) => {}
                Ok(false) => return Ok(Progress::NeedMoreData),
                Err(e) => {
                    self.phase = Phase::Failed;
                    return Err(e);
                }
            }
        }

        match self.drain_payload(buf) {
            Ok(Some(frame)) => Ok(Progress::Frame(frame)),
            Ok(None) => Ok(Progress::NeedMoreData),
            Err(e) => {
                self.phase = Phase::Failed;
                Err(e)
            }
        }
    }

    /// Signal transport EOF.
    ///
    /// Transitions to `Closed` and discards any half-read frame; partial
    /// frames are never delivered.
    pub fn push_eof(&mut self) -> Progress {
        if !self.is_idle() {
            trace!(
                path = %self.context.path,
                read = self.payload_read,
                declared = self.payload_len,
                "transport closed mid-frame, discarding partial state"
            );
        }
        self.sink = None;
        self.phase = Phase::Closed;
        Progress::Closed
    }

    /// Copy bytes from `buf` into the header scratch until it holds `target`
    /// bytes, returning true once it does
    fn fill_scratch(&mut self, buf: &mut BytesMut, target: usize) -> Result<bool> {
        if target > MAX_HEADER_SIZE {
            // Cannot happen for a conformant peer; guards corrupt input.
            return Err(Error::malformed_header(
                "could not parse header within allotted space",
            ));
        }
        if self.scratch_len < target {
            let take = (target - self.scratch_len).min(buf.len());
            self.scratch[self.scratch_len..self.scratch_len + take]
                .copy_from_slice(&buf[..take]);
            self.scratch_len += take;
            buf.advance(take);
        }
        Ok(self.scratch_len >= target)
    }

    /// Parse header fields strictly in wire order, each attempted only once
    /// enough bytes are buffered. Returns true when the header is complete
    /// and the payload sink is installed.
    fn parse_header(&mut self, buf: &mut BytesMut) -> Result<bool> {
        if !self.fill_scratch(buf, 2)? {
            return Ok(false);
        }

        if self.fin.is_none() {
            let b0 = self.scratch[0];
            if b0 & 0x70 != 0 {
                return Err(Error::malformed_header("non-zero RSV bits"));
            }
            self.fin = Some(b0 & 0x80 != 0);
        }
        if self.opcode.is_none() {
            self.opcode = Some(OpCode::from_u8(self.scratch[0] & 0x0F)?);
        }
        if self.masked.is_none() {
            self.masked = Some(self.scratch[1] & 0x80 != 0);
        }
        if self.base_len.is_none() {
            self.base_len = Some(self.scratch[1] & 0x7F);
        }

        let base_len = self.base_len.expect("base length parsed above");
        let mut header_size = 2;

        if base_len == 126 {
            header_size += 2;
            if self.extended_len.is_none() {
                if !self.fill_scratch(buf, header_size)? {
                    return Ok(false);
                }
                self.extended_len =
                    Some(u16::from_be_bytes([self.scratch[2], self.scratch[3]]) as u64);
            }
        } else if base_len == 127 {
            header_size += 8;
            if self.extended_len.is_none() {
                if !self.fill_scratch(buf, header_size)? {
                    return Ok(false);
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&self.scratch[2..10]);
                // RFC 6455 requires the top bit to be 0; mask it off rather
                // than reject, matching permissive real-world behavior.
                self.extended_len = Some(u64::from_be_bytes(raw) & i64::MAX as u64);
            }
        }

        if self.masked == Some(true) && self.mask_key.is_none() {
            if !self.fill_scratch(buf, header_size + 4)? {
                return Ok(false);
            }
            let mut key = [0u8; 4];
            key.copy_from_slice(&self.scratch[header_size..header_size + 4]);
            self.mask_key = Some(key);
        }

        let opcode = self.opcode.expect("opcode parsed above");
        let fin = self.fin.expect("fin parsed above");
        self.payload_len = self.extended_len.unwrap_or(base_len as u64);

        // Control frames are never fragmented and carry at most 125 bytes.
        if opcode.is_control() {
            if !fin {
                return Err(Error::malformed_header("fragmented control frame"));
            }
            if self.payload_len > 125 {
                return Err(Error::malformed_header("control frame payload exceeds 125 bytes"));
            }
        }

        let sink = self.store.create_sink(
            WEBSOCKET_TAG,
            &self.context.path,
            self.context.version,
            self.payload_len,
        )?;
        self.sink = Some(sink);
        self.payload_read = 0;
        self.phase = Phase::Payload;
        trace!(
            ?opcode,
            fin,
            masked = self.masked == Some(true),
            payload_len = self.payload_len,
            "frame header complete"
        );
        Ok(true)
    }

    /// Stream payload bytes from `buf` into the sink; complete the frame
    /// exactly when bytes-written equals the declared length
    fn drain_payload(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>> {
        let sink = self.sink.as_mut().expect("payload phase has a sink");

        while self.payload_read < self.payload_len && !buf.is_empty() {
            let want = (self.payload_len - self.payload_read).min(buf.len() as u64) as usize;
            let take = want.min(COPY_WINDOW);
            sink.write(&buf[..take])?;
            buf.advance(take);
            self.payload_read += take as u64;
        }

        if self.payload_read < self.payload_len {
            return Ok(None);
        }

        let sink = self.sink.take().expect("payload phase has a sink");
        let payload = sink.finish()?;
        let frame = Frame::from_wire(
            self.opcode.expect("header complete"),
            self.fin.expect("header complete"),
            self.mask_key,
            self.payload_len,
            payload,
            Arc::clone(&self.context),
        );
        self.reset_for_next_frame();
        Ok(Some(frame))
    }

    fn reset_for_next_frame(&mut self) {
        self.phase = Phase::Header;
        self.scratch_len = 0;
        self.fin = None;
        self.opcode = None;
        self.masked = None;
        self.base_len = None;
        self.extended_len = None;
        self.mask_key = None;
        self.payload_len = 0;
        self.payload_read = 0;
    }
}

impl std::fmt::Debug for FrameDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameDecoder")
            .field("phase", &self.phase)
            .field("scratch_len", &self.scratch_len)
            .field("payload_len", &self.payload_len)
            .field("payload_read", &self.payload_read)
            .finish()
    }
}
