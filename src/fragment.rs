//! Fragmentation and reassembly
//!
//! Data frames flow through one [`FragmentAccumulator`] per connection.
//! Final, unfragmented frames pass straight through; non-final frames are
//! buffered until the closing final frame arrives, at which point the whole
//! chain is validated and joined into a single [`LogicalMessage`] whose
//! payload concatenates the member payloads in arrival order.

use std::mem;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::frame::{Frame, LogicalMessage};
use crate::opcode::OpCode;
use crate::storage::ChainedSource;

/// Per-connection buffer for continuation chains.
///
/// The accumulator exclusively owns buffered frames until release: a join
/// hands the message to the caller, an error discards the whole chain.
#[derive(Debug, Default)]
pub struct FragmentAccumulator {
    pending: Vec<Frame>,
}

impl FragmentAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of frames currently buffered
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Consume one decoded data frame.
    ///
    /// Returns a [`LogicalMessage`] when the frame completes a message:
    /// either a final frame with nothing buffered (pass-through, no join
    /// allocation), or a final frame closing a buffered chain. Control
    /// frames never reach the accumulator; route them through the control
    /// handler first.
    ///
    /// On error the buffered chain has been discarded; partial chains are
    /// never delivered.
    pub fn accept(&mut self, frame: Frame) -> Result<Option<LogicalMessage>> {
        if !frame.fin {
            self.pending.push(frame);
            return Ok(None);
        }
        if self.pending.is_empty() {
            return Ok(Some(LogicalMessage::from_frame(frame)));
        }
        self.pending.push(frame);
        let chain = mem::take(&mut self.pending);
        join_chain(chain).map(Some)
    }

    /// Drop any buffered chain, e.g. when the connection fails
    pub fn discard(&mut self) {
        self.pending.clear();
    }
}

/// Validate a complete chain and join it into one logical message.
///
/// The first frame's metadata is authoritative: every member must agree on
/// path, version, sub-protocols and identity (`InconsistentChain`
/// otherwise). The first frame's opcode is the logical opcode; every later
/// frame must carry CONTINUATION, only the last may (and must) be final
/// (`InvalidChainSequence` otherwise).
fn join_chain(chain: Vec<Frame>) -> Result<LogicalMessage> {
    let first = chain
        .first()
        .ok_or_else(|| Error::invalid_chain_sequence("empty chain"))?;

    let opcode = first.opcode;
    let context = Arc::clone(&first.context);
    let last_index = chain.len() - 1;

    let mut masked = true;
    let mut total_len: u64 = 0;

    for (index, frame) in chain.iter().enumerate() {
        masked &= frame.masked;
        total_len += frame.payload_len;

        if frame.context != first.context {
            return Err(Error::inconsistent_chain(format!(
                "frame {} does not match the chain head (path '{}' vs '{}')",
                index, frame.context.path, first.context.path
            )));
        }
        if index > 0 && frame.opcode != OpCode::Continuation {
            return Err(Error::invalid_chain_sequence(format!(
                "frame {} carries {:?}, expected CONTINUATION",
                index, frame.opcode
            )));
        }
        if index == last_index {
            if !frame.fin {
                return Err(Error::invalid_chain_sequence(
                    "last frame in the chain must be final",
                ));
            }
        } else if frame.fin {
            return Err(Error::invalid_chain_sequence(
                "only the last frame in the chain may be final",
            ));
        }
    }

    let parts = chain.into_iter().map(Frame::into_payload).collect();
    Ok(LogicalMessage::from_parts(
        opcode,
        masked,
        total_len,
        context,
        Box::new(ChainedSource::new(parts)),
    ))
}
