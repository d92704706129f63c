//! Error types for xic connections.

use crate::{message::MessageKind, state::ConState};
use thiserror::Error;
use xic_types::{error::CodecError, Exception};

/// The result for connection operations.
pub type XicResult<T> = Result<T, XicError>;

/// Conditions that end a connection's read loop.
///
/// None of these are retried: the socket is force-closed and every pending call fails.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// IO error on the socket, including EOF in the middle of a header or body.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The header did not start with the xic magic and version bytes.
    #[error("unknown message magic ({magic:#04x}) and version ({version:#04x})")]
    BadMagic {
        /// Received magic byte.
        magic: u8,
        /// Received version byte.
        version: u8,
    },
    /// The header carried an unknown message type.
    #[error("unknown message type ({0:#04x})")]
    UnknownType(u8),
    /// Flags outside the allowed set for the message type.
    #[error("invalid flags {flags:#04x} for {kind:?} message")]
    BadFlags {
        /// The message type.
        kind: MessageKind,
        /// Received flags byte.
        flags: u8,
    },
    /// Body larger than the maximum message size.
    #[error("message size too large: {size} > {max}")]
    BodyTooLarge {
        /// Body size from the header.
        size: u32,
        /// Configured maximum.
        max: u32,
    },
    /// Hello or Bye with a body or flags.
    #[error("invalid {0:?} message: flags and body size must be zero")]
    InvalidEmptyMessage(MessageKind),
    /// The body did not decode to the message type's shape.
    #[error("failed to decode {kind:?} body: {source}")]
    Decode {
        /// The message type.
        kind: MessageKind,
        /// Underlying codec failure.
        #[source]
        source: CodecError,
    },
    /// The body could not be encoded.
    #[error("failed to encode {kind:?} body: {source}")]
    Encode {
        /// The message type.
        kind: MessageKind,
        /// Underlying codec failure.
        #[source]
        source: CodecError,
    },
    /// A message arrived in a state where it is not allowed.
    #[error("unexpected {kind:?} message in state {state:?}")]
    UnexpectedMessage {
        /// The message type.
        kind: MessageKind,
        /// State of the connection when it arrived.
        state: ConState,
    },
    /// No message header arrived within the idle timeout.
    #[error("connection idle for too long")]
    IdleTimeout,
}

/// Error type returned to callers of a connection.
#[derive(Debug, Error)]
pub enum XicError {
    /// The connection closed before the call completed.
    #[error("connection closed")]
    ConnectionClosed,
    /// The call did not complete within the configured timeout.
    #[error("call timed out")]
    Timeout,
    /// The peer answered with an application exception.
    #[error("remote exception: {0}")]
    Exception(Exception),
    /// Protocol failure while sending.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// Arguments or results could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// The service name cannot be used for a proxy.
    #[error("invalid service name: {0}")]
    InvalidService(String),
}

impl XicError {
    /// The remote exception, if this error carries one.
    pub fn exception(&self) -> Option<&Exception> {
        match self {
            Self::Exception(ex) => Some(ex),
            _ => None,
        }
    }
}

impl From<std::io::Error> for XicError {
    fn from(e: std::io::Error) -> Self {
        Self::Protocol(e.into())
    }
}
