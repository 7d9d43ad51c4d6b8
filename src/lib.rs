//! An RFC 6455 WebSocket framing engine for arbitrary byte-stream transports
//!
//! This crate provides the protocol state machine between a transport and an
//! application dispatcher:
//! - Incremental frame decoding that tolerates arbitrarily-chunked reads
//! - Streaming frame encoding with per-frame masking
//! - Fragmentation and reassembly under strict consistency rules
//! - The opening handshake, server and client side
//!
//! It deliberately owns no socket: transport bytes are pushed in, wire bytes
//! and decoded messages come out, and payload bodies live behind a pluggable
//! storage boundary so messages larger than memory can be streamed.
// Performance-focused clippy lints
#![warn(
    clippy::perf,
    clippy::redundant_clone,
    clippy::needless_pass_by_value,
    clippy::inefficient_to_string,
    clippy::clone_on_copy
)]

pub mod config;
pub mod connection;
pub mod control;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod fragment;
pub mod frame;
pub mod handshake;
pub mod mask;
pub mod opcode;
pub mod storage;

pub use config::ProtocolConfig;
pub use connection::{Action, WebSocketConnection};
pub use control::{ControlFrameHandler, Disposition, ErrorFormatter, PongListener};
pub use decoder::{FrameDecoder, Progress};
pub use encoder::{EncodedFrame, FrameEncoder};
pub use error::{Error, Result};
pub use fragment::FragmentAccumulator;
pub use frame::{Frame, FrameContext, LogicalMessage, Message};
pub use handshake::{
    derive_accept_key, generate_client_key, rejection_response, ClientHandshake, ClientUpgrade,
    HandshakeNegotiator, Identity, Negotiation, ServerUpgrade, UpgradeAuthorizer,
    SUPPORTED_VERSION,
};
pub use mask::{apply_mask, MaskedSource};
pub use opcode::OpCode;
pub use storage::{
    BytesSource, ChainedSource, EmptySource, MemoryStore, MessageStore, PayloadSink,
    PayloadSource, WEBSOCKET_TAG,
};
