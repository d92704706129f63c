//! Wire format for xic messages.
//!
//! Every message starts with an 8-byte header:
//! ```text
//! +-------+---------+------+-------+-----------+
//! | magic | version | type | flags | body_size |
//! | 'X'   | '!'     | 1 B  | 1 B   | 4 B (BE)  |
//! +-------+---------+------+-------+-----------+
//! ```
//!
//! The body follows immediately after the header. Quest, Answer, and Check bodies are encoded
//! with the argument codec; Hello and Bye have no body.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use xic_types::{error::CodecResult, Arguments, Context};

/// First header byte.
pub const MAGIC: u8 = b'X';
/// Second header byte.
pub const VERSION: u8 = b'!';
/// Size of the message header in bytes.
pub const HEADER_SIZE: usize = 8;

/// Message type discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// A request.
    Quest = b'Q',
    /// A response correlated by transaction id.
    Answer = b'A',
    /// A pre-activation negotiation command.
    Check = b'C',
    /// Sent by the accepting side once it is ready.
    Hello = b'H',
    /// Announces intent to close.
    Bye = b'B',
}

impl MessageKind {
    /// Hello and Bye never carry a body.
    pub fn is_empty_body(&self) -> bool {
        matches!(self, Self::Hello | Self::Bye)
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            b'Q' => Ok(Self::Quest),
            b'A' => Ok(Self::Answer),
            b'C' => Ok(Self::Check),
            b'H' => Ok(Self::Hello),
            b'B' => Ok(Self::Bye),
            _ => Err(ProtocolError::UnknownType(value)),
        }
    }
}

impl From<MessageKind> for u8 {
    fn from(value: MessageKind) -> Self {
        value as u8
    }
}

/// Header flags byte.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageFlags(u8);

impl MessageFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);

    /// Marks a body produced by a negotiated cipher. Accepted on the wire, never produced here.
    pub const CIPHER: Self = Self(0x01);

    /// Whether the flags are allowed on a message of the given kind.
    pub fn is_allowed_for(&self, kind: MessageKind) -> bool {
        if kind.is_empty_body() {
            *self == Self::NONE
        } else {
            *self == Self::NONE || *self == Self::CIPHER
        }
    }
}

impl From<u8> for MessageFlags {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl From<MessageFlags> for u8 {
    fn from(value: MessageFlags) -> Self {
        value.0
    }
}

/// Decoded message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Type of message.
    pub kind: MessageKind,
    /// Flags byte.
    pub flags: MessageFlags,
    /// Length of the body in bytes, not including the header.
    pub body_size: u32,
}

impl MessageHeader {
    /// Create a new header.
    pub fn new(kind: MessageKind, flags: MessageFlags, body_size: u32) -> Self {
        Self { kind, flags, body_size }
    }

    /// Encode the header to bytes.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = MAGIC;
        buf[1] = VERSION;
        buf[2] = self.kind.into();
        buf[3] = self.flags.into();
        buf[4..8].copy_from_slice(&self.body_size.to_be_bytes());
        buf
    }

    /// Decode and validate a header.
    ///
    /// Magic and version are checked first, then the per-type flag and size rules.
    pub fn decode(buf: &[u8; HEADER_SIZE], max_message_size: u32) -> Result<Self, ProtocolError> {
        if buf[0] != MAGIC || buf[1] != VERSION {
            return Err(ProtocolError::BadMagic { magic: buf[0], version: buf[1] });
        }

        let kind = MessageKind::try_from(buf[2])?;
        let flags = MessageFlags::from(buf[3]);
        let body_size = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);

        if kind.is_empty_body() {
            if flags != MessageFlags::NONE || body_size != 0 {
                return Err(ProtocolError::InvalidEmptyMessage(kind));
            }
        } else {
            if !flags.is_allowed_for(kind) {
                return Err(ProtocolError::BadFlags { kind, flags: flags.into() });
            }
            if body_size > max_message_size {
                return Err(ProtocolError::BodyTooLarge { size: body_size, max: max_message_size });
            }
        }

        Ok(Self { kind, flags, body_size })
    }
}

/// A request.
///
/// The body carries no separate oneway flag: txid 0 is the oneway marker on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quest {
    /// Transaction id. Zero means no answer is expected.
    pub txid: i64,
    /// Target service name.
    pub service: String,
    /// Target method name.
    pub method: String,
    /// Request metadata.
    pub context: Context,
    /// Encoded arguments.
    pub args: Vec<u8>,
}

impl Quest {
    /// Whether the caller expects no answer.
    pub fn is_oneway(&self) -> bool {
        self.txid == 0
    }
}

/// Answer status for a normal result.
pub const STATUS_NORMAL: i32 = 0;
/// Answer status for an application failure.
pub const STATUS_EXCEPTIONAL: i32 = 1;

/// A response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    /// Transaction id of the quest being answered.
    pub txid: i64,
    /// [`STATUS_NORMAL`] or a nonzero exceptional status.
    pub status: i32,
    /// Encoded result, or encoded failure payload when exceptional.
    pub args: Vec<u8>,
}

impl Answer {
    /// A normal answer carrying an encoded result.
    pub fn normal(txid: i64, args: Vec<u8>) -> Self {
        Self { txid, status: STATUS_NORMAL, args }
    }

    /// An exceptional answer carrying an encoded failure payload.
    pub fn exceptional(txid: i64, failure: &Arguments) -> CodecResult<Self> {
        Ok(Self { txid, status: STATUS_EXCEPTIONAL, args: xic_types::encode(failure)? })
    }

    /// Whether the answer carries a failure payload.
    pub fn is_exceptional(&self) -> bool {
        self.status != STATUS_NORMAL
    }
}

/// A negotiation command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Check {
    /// Command name.
    pub command: String,
    /// Command-specific fields.
    pub args: Arguments,
}

impl Check {
    /// Create a check command.
    pub fn new(command: impl Into<String>, args: Arguments) -> Self {
        Self { command: command.into(), args }
    }
}

/// A complete xic message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Request.
    Quest(Quest),
    /// Response.
    Answer(Answer),
    /// Negotiation command.
    Check(Check),
    /// Ready announcement.
    Hello,
    /// Close announcement.
    Bye,
}

impl Message {
    /// The message type.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Quest(_) => MessageKind::Quest,
            Self::Answer(_) => MessageKind::Answer,
            Self::Check(_) => MessageKind::Check,
            Self::Hello => MessageKind::Hello,
            Self::Bye => MessageKind::Bye,
        }
    }

    /// Serialize header and body into one contiguous buffer.
    pub fn encode(&self, max_message_size: u32) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = vec![0u8; HEADER_SIZE];
        let kind = self.kind();
        let body = match self {
            Self::Quest(quest) => xic_types::encode_into_buffer(&mut buf, quest),
            Self::Answer(answer) => xic_types::encode_into_buffer(&mut buf, answer),
            Self::Check(check) => xic_types::encode_into_buffer(&mut buf, check),
            Self::Hello | Self::Bye => Ok(()),
        };
        body.map_err(|source| ProtocolError::Encode { kind, source })?;

        // NOTE: usize -> u64 won't lose precision
        let body_size = (buf.len() - HEADER_SIZE) as u64;
        if body_size > u64::from(max_message_size) {
            return Err(ProtocolError::BodyTooLarge {
                size: u32::try_from(body_size).unwrap_or(u32::MAX),
                max: max_message_size,
            });
        }

        let header = MessageHeader::new(kind, MessageFlags::NONE, body_size as u32);
        buf[..HEADER_SIZE].copy_from_slice(&header.encode());
        Ok(buf)
    }

    /// Decode a body for a validated header.
    pub fn decode(header: &MessageHeader, body: &[u8]) -> Result<Self, ProtocolError> {
        let kind = header.kind;
        let wrap = |source| ProtocolError::Decode { kind, source };
        let msg = match kind {
            MessageKind::Quest => Self::Quest(xic_types::decode(body).map_err(wrap)?),
            MessageKind::Answer => Self::Answer(xic_types::decode(body).map_err(wrap)?),
            MessageKind::Check => Self::Check(xic_types::decode(body).map_err(wrap)?),
            MessageKind::Hello => Self::Hello,
            MessageKind::Bye => Self::Bye,
        };
        Ok(msg)
    }
}
