//! Control frame policy
//!
//! CLOSE, PING and PONG are handled per frame, ahead of reassembly, and are
//! never fragmented. CLOSE is echoed and terminates the connection, PING is
//! answered with an empty PONG, PONG feeds the single-shot listener (if one
//! is registered) and is never forwarded to the application.

use tracing::{debug, warn};

use crate::error::Error;
use crate::frame::{Frame, Message};
use crate::opcode::OpCode;

/// Single-shot callback invoked with the PONG frame that consumed it.
pub type PongListener = Box<dyn FnOnce(Frame) + Send>;

/// What to do with a frame after control handling.
#[derive(Debug)]
pub enum Disposition {
    /// Emit `reply`; when `terminate` is set, close the connection once the
    /// reply has been flushed and process no further frames
    Reply { reply: Message, terminate: bool },
    /// The frame was consumed (PONG); nothing to emit or forward
    Consumed,
    /// A data frame, to be forwarded to the fragment accumulator
    Data(Frame),
}

/// Per-connection control policy with an optional pending pong listener.
#[derive(Default)]
pub struct ControlFrameHandler {
    pong_listener: Option<PongListener>,
}

impl ControlFrameHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the listener consumed by the next PONG.
    ///
    /// At most one listener is pending at a time; a new registration
    /// replaces the old one.
    pub fn register_pong_listener(&mut self, listener: PongListener) {
        self.pong_listener = Some(listener);
    }

    /// Whether a pong listener is currently pending
    pub fn has_pong_listener(&self) -> bool {
        self.pong_listener.is_some()
    }

    /// Apply the control policy to one complete frame
    pub fn handle(&mut self, frame: Frame) -> Disposition {
        match frame.opcode {
            OpCode::Close => {
                debug!(path = %frame.context.path, "close frame received, echoing closure");
                Disposition::Reply {
                    reply: Message::close(),
                    terminate: true,
                }
            }
            OpCode::Ping => {
                debug!(path = %frame.context.path, "ping received, replying with pong");
                Disposition::Reply {
                    reply: Message::pong(),
                    terminate: false,
                }
            }
            OpCode::Pong => {
                // Consumed by at most one pending listener, silently
                // discarded otherwise.
                if let Some(listener) = self.pong_listener.take() {
                    listener(frame);
                }
                Disposition::Consumed
            }
            OpCode::Text | OpCode::Binary | OpCode::Continuation => Disposition::Data(frame),
        }
    }
}

impl std::fmt::Debug for ControlFrameHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlFrameHandler")
            .field("pong_listener", &self.pong_listener.is_some())
            .finish()
    }
}

/// Maps a processing failure onto the CLOSE frame that ends the connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorFormatter;

impl ErrorFormatter {
    /// Build the outgoing CLOSE for `error`.
    ///
    /// Always `CLOSE, fin, empty payload`; no close-reason body is produced.
    pub fn format(&self, error: &Error) -> Message {
        warn!(%error, "closing websocket connection");
        Message::close()
    }
}
