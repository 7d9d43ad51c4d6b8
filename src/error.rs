//! Error types for the framing engine

use snafu::{Backtrace, Snafu};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Malformed frame header: {message}"))]
    MalformedHeader {
        message: String,
        backtrace: Backtrace,
    },

    #[snafu(display("Invalid opcode: 0x{value:x}"))]
    InvalidOpcode { value: u8, backtrace: Backtrace },

    #[snafu(display("Inconsistent fragment chain: {message}"))]
    InconsistentChain {
        message: String,
        backtrace: Backtrace,
    },

    #[snafu(display("Invalid fragment sequence: {message}"))]
    InvalidChainSequence {
        message: String,
        backtrace: Backtrace,
    },

    #[snafu(display("Upgrade precondition failed ({status}): {message}"))]
    UpgradePrecondition {
        message: String,
        status: u16,
        backtrace: Backtrace,
    },

    #[snafu(display("Handshake mismatch: expected accept value '{expected}', received '{received}'"))]
    HandshakeMismatch {
        expected: String,
        received: String,
        backtrace: Backtrace,
    },

    #[snafu(display("Transport closed mid-frame"))]
    TransportClosed { backtrace: Backtrace },

    #[snafu(display("Payload storage error: {message}"))]
    Storage {
        message: String,
        backtrace: Backtrace,
    },
}

impl Error {
    /// Create a malformed header error
    pub fn malformed_header(message: impl Into<String>) -> Self {
        Self::MalformedHeader {
            message: message.into(),
            backtrace: Backtrace::capture(),
        }
    }

    /// Create an invalid opcode error
    pub fn invalid_opcode(value: u8) -> Self {
        Self::InvalidOpcode {
            value,
            backtrace: Backtrace::capture(),
        }
    }

    /// Create an inconsistent chain error
    pub fn inconsistent_chain(message: impl Into<String>) -> Self {
        Self::InconsistentChain {
            message: message.into(),
            backtrace: Backtrace::capture(),
        }
    }

    /// Create an invalid chain sequence error
    pub fn invalid_chain_sequence(message: impl Into<String>) -> Self {
        Self::InvalidChainSequence {
            message: message.into(),
            backtrace: Backtrace::capture(),
        }
    }

    /// Create an upgrade precondition error carrying an HTTP status code
    pub fn upgrade_precondition(status: u16, message: impl Into<String>) -> Self {
        Self::UpgradePrecondition {
            message: message.into(),
            status,
            backtrace: Backtrace::capture(),
        }
    }

    /// Create a handshake mismatch error
    pub fn handshake_mismatch(expected: impl Into<String>, received: impl Into<String>) -> Self {
        Self::HandshakeMismatch {
            expected: expected.into(),
            received: received.into(),
            backtrace: Backtrace::capture(),
        }
    }

    /// Create a transport closed error
    pub fn transport_closed() -> Self {
        Self::TransportClosed {
            backtrace: Backtrace::capture(),
        }
    }

    /// Create a payload storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            backtrace: Backtrace::capture(),
        }
    }

    /// Whether this error is fatal to the connection.
    ///
    /// Fatal errors require the caller to emit a CLOSE frame and terminate
    /// the connection; handshake failures are recoverable at the HTTP layer
    /// and produce a normal non-101 response instead.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::UpgradePrecondition { .. } | Self::HandshakeMismatch { .. }
        )
    }

    /// The HTTP status code a handshake failure should be answered with
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::UpgradePrecondition { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
