//! Per-connection engine
//!
//! Owns the decoder, encoder configuration, control handler and fragment
//! accumulator for one live connection and wires them together: transport
//! bytes go in through [`WebSocketConnection::push`], and the caller gets
//! back the messages to deliver upstream and the frames to write to the
//! transport. One instance per connection, never shared; the whole engine
//! is a sequential state machine driven by the transport's read loop.

use std::sync::Arc;

use bytes::BytesMut;
use tracing::debug;

use crate::config::ProtocolConfig;
use crate::control::{ControlFrameHandler, Disposition, ErrorFormatter, PongListener};
use crate::decoder::{FrameDecoder, Progress};
use crate::encoder::{EncodedFrame, FrameEncoder};
use crate::error::{Error, Result};
use crate::fragment::FragmentAccumulator;
use crate::frame::{FrameContext, LogicalMessage, Message};
use crate::opcode::OpCode;
use crate::storage::{MessageStore, PayloadSource};

/// What the caller should do after feeding bytes into the engine.
#[derive(Debug)]
pub enum Action {
    /// Hand this message to the application dispatcher
    Deliver(LogicalMessage),
    /// Write these bytes to the transport (auto replies: PONG, CLOSE echo)
    Send(EncodedFrame),
    /// Close the transport once previously returned frames are flushed
    Terminate,
}

/// The framing engine for one connection.
pub struct WebSocketConnection {
    context: Arc<FrameContext>,
    decoder: FrameDecoder,
    encoder: FrameEncoder,
    control: ControlFrameHandler,
    accumulator: FragmentAccumulator,
    formatter: ErrorFormatter,
    closing: bool,
}

impl WebSocketConnection {
    /// Build the engine for a freshly upgraded connection
    pub fn new(
        store: Arc<dyn MessageStore>,
        context: FrameContext,
        config: ProtocolConfig,
    ) -> Self {
        let context = Arc::new(context);
        Self {
            decoder: FrameDecoder::new(store, Arc::clone(&context)),
            encoder: FrameEncoder::new(config.mask_outgoing),
            control: ControlFrameHandler::new(),
            accumulator: FragmentAccumulator::new(),
            formatter: ErrorFormatter,
            context,
            closing: false,
        }
    }

    /// The context stamped on every frame decoded on this connection
    pub fn context(&self) -> &Arc<FrameContext> {
        &self.context
    }

    /// Whether a CLOSE has been seen or the transport has ended; no further
    /// inbound frames are processed once set
    pub fn is_closing(&self) -> bool {
        self.closing
    }

    /// Feed newly arrived transport bytes and collect the resulting actions.
    ///
    /// Decodes as many complete frames as `buf` yields; control frames are
    /// answered immediately, data frames flow through reassembly. On a
    /// decode or chain error the in-flight state has been discarded and the
    /// error propagates; the caller should answer with
    /// [`close_frame_for`](Self::close_frame_for) and terminate.
    pub fn push(&mut self, buf: &mut BytesMut) -> Result<Vec<Action>> {
        let mut actions = Vec::new();
        if self.closing {
            return Ok(actions);
        }

        loop {
            match self.decoder.push(buf) {
                Ok(Progress::NeedMoreData) => break,
                Ok(Progress::Closed) => {
                    self.closing = true;
                    actions.push(Action::Terminate);
                    break;
                }
                Ok(Progress::Frame(frame)) => match self.control.handle(frame) {
                    Disposition::Reply { reply, terminate } => {
                        actions.push(Action::Send(self.encoder.encode(reply)));
                        if terminate {
                            debug!(path = %self.context.path, "connection closing after close reply");
                            self.closing = true;
                            self.accumulator.discard();
                            actions.push(Action::Terminate);
                            break;
                        }
                    }
                    Disposition::Consumed => {}
                    Disposition::Data(frame) => {
                        match self.accumulator.accept(frame) {
                            Ok(Some(message)) => actions.push(Action::Deliver(message)),
                            Ok(None) => {}
                            Err(e) => return Err(e),
                        }
                    }
                },
                Err(e) => {
                    self.accumulator.discard();
                    return Err(e);
                }
            }
        }
        Ok(actions)
    }

    /// Signal transport EOF.
    ///
    /// Discards any half-read frame and buffered chain. Fails with
    /// [`Error::TransportClosed`] when the peer vanished mid-frame, so the
    /// caller can tell an abortive disconnect from an orderly one.
    pub fn push_eof(&mut self) -> Result<Vec<Action>> {
        let mid_frame = !self.decoder.is_idle();
        self.decoder.push_eof();
        self.accumulator.discard();
        let already_closing = self.closing;
        self.closing = true;
        if mid_frame {
            return Err(Error::transport_closed());
        }
        if already_closing {
            return Ok(Vec::new());
        }
        Ok(vec![Action::Terminate])
    }

    /// Encode an outbound message with this connection's masking policy
    pub fn send(&self, message: Message) -> EncodedFrame {
        self.encoder.encode(message)
    }

    /// Encode an outbound frame from raw parts.
    ///
    /// `payload_len` must equal the number of bytes `payload` will yield.
    pub fn send_message(
        &self,
        opcode: OpCode,
        fin: bool,
        payload_len: u64,
        payload: Box<dyn PayloadSource>,
    ) -> EncodedFrame {
        self.encoder.encode(Message::new(opcode, fin, payload_len, payload))
    }

    /// Install the single-shot listener consumed by the next PONG
    pub fn register_pong_listener(&mut self, listener: PongListener) {
        self.control.register_pong_listener(listener);
    }

    /// The CLOSE frame to emit for a fatal processing error
    pub fn close_frame_for(&self, error: &Error) -> EncodedFrame {
        self.encoder.encode(self.formatter.format(error))
    }
}

impl std::fmt::Debug for WebSocketConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConnection")
            .field("path", &self.context.path)
            .field("closing", &self.closing)
            .field("pending_fragments", &self.accumulator.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{read_to_vec, MemoryStore};

    fn connection() -> WebSocketConnection {
        WebSocketConnection::new(
            Arc::new(MemoryStore),
            FrameContext::new("/chat", 13, Vec::new()),
            ProtocolConfig::server(),
        )
    }

    fn wire(frames: &[&[u8]]) -> BytesMut {
        let mut buf = BytesMut::new();
        for frame in frames {
            buf.extend_from_slice(frame);
        }
        buf
    }

    #[test]
    fn ping_produces_exactly_one_pong() {
        let mut connection = connection();
        let mut buf = wire(&[&[0x89, 0x00]]);
        let mut actions = connection.push(&mut buf).unwrap();
        assert_eq!(actions.len(), 1);
        match actions.remove(0) {
            Action::Send(encoded) => {
                let bytes = encoded.into_bytes().unwrap();
                assert_eq!(&bytes[..], &[0x8A, 0x00], "empty pong");
            }
            other => panic!("expected send, got {other:?}"),
        }
        assert!(!connection.is_closing());
    }

    #[test]
    fn close_echoes_and_terminates() {
        let mut connection = connection();
        // A data frame after the CLOSE must not be processed.
        let mut buf = wire(&[&[0x88, 0x00], &[0x81, 0x02, b'h', b'i']]);
        let actions = connection.push(&mut buf).unwrap();
        assert_eq!(actions.len(), 2);
        assert!(matches!(actions[0], Action::Send(_)));
        assert!(matches!(actions[1], Action::Terminate));
        assert!(connection.is_closing());

        let leftover = connection.push(&mut buf).unwrap();
        assert!(leftover.is_empty(), "no frames processed after close");
    }

    #[test]
    fn data_frames_are_delivered_as_messages() {
        let mut connection = connection();
        let mut buf = wire(&[&[0x81, 0x05, b'h', b'e', b'l', b'l', b'o']]);
        let mut actions = connection.push(&mut buf).unwrap();
        assert_eq!(actions.len(), 1);
        let message = match actions.remove(0) {
            Action::Deliver(message) => message,
            other => panic!("expected delivery, got {other:?}"),
        };
        assert_eq!(message.opcode, OpCode::Text);
        let mut payload = message.into_payload();
        assert_eq!(read_to_vec(payload.as_mut()).unwrap(), b"hello");
    }

    #[test]
    fn fragmented_message_survives_an_interleaved_ping() {
        let mut connection = connection();
        let mut buf = wire(&[
            &[0x02, 0x02, b'A', b'B'],
            &[0x89, 0x00],
            &[0x80, 0x02, b'C', b'D'],
        ]);
        let actions = connection.push(&mut buf).unwrap();
        assert_eq!(actions.len(), 2);
        assert!(matches!(actions[0], Action::Send(_)), "pong comes first");
        match &actions[1] {
            Action::Deliver(message) => {
                assert_eq!(message.opcode, OpCode::Binary);
                assert_eq!(message.payload_len, 4);
            }
            other => panic!("expected delivery, got {other:?}"),
        }
    }

    #[test]
    fn pong_is_never_forwarded() {
        let mut connection = connection();
        let mut buf = wire(&[&[0x8A, 0x00]]);
        let actions = connection.push(&mut buf).unwrap();
        assert!(actions.is_empty());
    }

    #[test]
    fn pong_listener_fires_once() {
        let mut connection = connection();
        let fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        connection.register_pong_listener(Box::new(move |_frame| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }));

        let mut buf = wire(&[&[0x8A, 0x00], &[0x8A, 0x00]]);
        connection.push(&mut buf).unwrap();
        assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn decode_error_maps_to_a_close_frame() {
        let mut connection = connection();
        let mut buf = wire(&[&[0x83, 0x00]]);
        let err = connection.push(&mut buf).unwrap_err();
        assert!(err.is_fatal());
        let close = connection.close_frame_for(&err).into_bytes().unwrap();
        assert_eq!(&close[..], &[0x88, 0x00]);
    }

    #[test]
    fn eof_mid_frame_is_a_transport_error() {
        let mut connection = connection();
        let mut buf = wire(&[&[0x82, 0x04, 1, 2]]);
        assert!(connection.push(&mut buf).unwrap().is_empty());
        let err = connection.push_eof().unwrap_err();
        assert!(matches!(err, Error::TransportClosed { .. }));
        assert!(connection.is_closing());
    }

    #[test]
    fn orderly_eof_terminates() {
        let mut connection = connection();
        let actions = connection.push_eof().unwrap();
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], Action::Terminate));
    }

    #[test]
    fn send_uses_the_connection_masking_policy() {
        let server = connection();
        let bytes = server.send(Message::text("ok")).into_bytes().unwrap();
        assert_eq!(bytes[1] & 0x80, 0, "server frames are unmasked");

        let client = WebSocketConnection::new(
            Arc::new(MemoryStore),
            FrameContext::new("/chat", 13, Vec::new()),
            ProtocolConfig::client(),
        );
        let bytes = client.send(Message::text("ok")).into_bytes().unwrap();
        assert_eq!(bytes[1] & 0x80, 0x80, "client frames are masked");
    }
}
