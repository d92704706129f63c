//! Check commands exchanged before a connection becomes active.
//!
//! Only the shape of each command is decoded here. The authentication math belongs to a
//! [`Negotiator`] supplied by the owner of the connection.

use crate::message::Check;
use xic_types::{error::CodecResult, Arguments};

/// Client identity. Received by the accepting side.
pub const CMD_SRP6A1: &str = "SRP6a1";
/// Server challenge. Received by the initiating side.
pub const CMD_SRP6A2: &str = "SRP6a2";
/// Client proof. Received by the accepting side.
pub const CMD_SRP6A3: &str = "SRP6a3";
/// Server proof and negotiated cipher. Received by the initiating side.
pub const CMD_SRP6A4: &str = "SRP6a4";
/// Rejection. Received by the initiating side.
pub const CMD_FORBIDDEN: &str = "FORBIDDEN";
/// Authentication method to use. Received by the initiating side.
pub const CMD_AUTHENTICATE: &str = "AUTHENTICATE";

/// A decoded check command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckCommand {
    /// `SRP6a1`: client identity.
    Srp6a1 {
        /// Identity (`I`).
        identity: String,
    },
    /// `SRP6a3`: client public value and proof.
    Srp6a3 {
        /// Client public value (`A`).
        a: Vec<u8>,
        /// Client proof (`M1`).
        m1: Vec<u8>,
    },
    /// `FORBIDDEN`: the peer refused the connection.
    Forbidden {
        /// Reason given by the peer.
        reason: String,
    },
    /// `AUTHENTICATE`: the peer requires authentication.
    Authenticate {
        /// Authentication method name.
        method: String,
    },
    /// `SRP6a2`: server challenge.
    Srp6a2 {
        /// Hash algorithm name.
        hash: String,
        /// Modulus (`N`).
        modulus: Vec<u8>,
        /// Generator (`g`).
        generator: Vec<u8>,
        /// Salt (`s`).
        salt: Vec<u8>,
        /// Server public value (`B`).
        b: Vec<u8>,
    },
    /// `SRP6a4`: server proof and negotiated cipher.
    Srp6a4 {
        /// Server proof (`M2`).
        m2: Vec<u8>,
        /// Cipher name.
        cipher: String,
        /// Cipher mode.
        mode: i64,
    },
    /// A command not recognized for this side of the connection.
    Unrecognized(String),
}

impl CheckCommand {
    /// Decode a check command as seen by one side of the connection.
    ///
    /// The accepting side recognizes `SRP6a1` and `SRP6a3`; the initiating side recognizes
    /// `FORBIDDEN`, `AUTHENTICATE`, `SRP6a2`, and `SRP6a4`. Anything else is
    /// [`CheckCommand::Unrecognized`]. A recognized command with missing or mistyped fields
    /// is an error.
    pub fn decode(check: &Check, incoming: bool) -> CodecResult<Self> {
        let args = &check.args;
        let cmd = if incoming {
            match check.command.as_str() {
                CMD_SRP6A1 => Self::Srp6a1 { identity: args.require_str("I")?.to_string() },
                CMD_SRP6A3 => Self::Srp6a3 {
                    a: args.require_blob("A")?.to_vec(),
                    m1: args.require_blob("M1")?.to_vec(),
                },
                other => Self::Unrecognized(other.to_string()),
            }
        } else {
            match check.command.as_str() {
                CMD_FORBIDDEN => Self::Forbidden { reason: args.require_str("reason")?.to_string() },
                CMD_AUTHENTICATE => {
                    Self::Authenticate { method: args.require_str("method")?.to_string() }
                }
                CMD_SRP6A2 => Self::Srp6a2 {
                    hash: args.require_str("hash")?.to_string(),
                    modulus: args.require_blob("N")?.to_vec(),
                    generator: args.require_blob("g")?.to_vec(),
                    salt: args.require_blob("s")?.to_vec(),
                    b: args.require_blob("B")?.to_vec(),
                },
                CMD_SRP6A4 => Self::Srp6a4 {
                    m2: args.require_blob("M2")?.to_vec(),
                    cipher: args.require_str("CIPHER")?.to_string(),
                    mode: args.require_int("MODE")?,
                },
                other => Self::Unrecognized(other.to_string()),
            }
        };
        Ok(cmd)
    }

    /// Encode back into a check message.
    ///
    /// Returns `None` for [`CheckCommand::Unrecognized`], which carries no fields.
    pub fn to_check(&self) -> Option<Check> {
        let check = match self {
            Self::Srp6a1 { identity } => {
                Check::new(CMD_SRP6A1, Arguments::new().with("I", identity.as_str()))
            }
            Self::Srp6a3 { a, m1 } => Check::new(
                CMD_SRP6A3,
                Arguments::new().with("A", a.clone()).with("M1", m1.clone()),
            ),
            Self::Forbidden { reason } => {
                Check::new(CMD_FORBIDDEN, Arguments::new().with("reason", reason.as_str()))
            }
            Self::Authenticate { method } => {
                Check::new(CMD_AUTHENTICATE, Arguments::new().with("method", method.as_str()))
            }
            Self::Srp6a2 { hash, modulus, generator, salt, b } => Check::new(
                CMD_SRP6A2,
                Arguments::new()
                    .with("hash", hash.as_str())
                    .with("N", modulus.clone())
                    .with("g", generator.clone())
                    .with("s", salt.clone())
                    .with("B", b.clone()),
            ),
            Self::Srp6a4 { m2, cipher, mode } => Check::new(
                CMD_SRP6A4,
                Arguments::new()
                    .with("M2", m2.clone())
                    .with("CIPHER", cipher.as_str())
                    .with("MODE", *mode),
            ),
            Self::Unrecognized(_) => return None,
        };
        Some(check)
    }
}

/// Participant in the check negotiation.
///
/// Receives every recognized command and may reply with a command of its own.
pub trait Negotiator: Send + Sync + 'static {
    /// Handle a decoded command. The returned command, if any, is sent to the peer.
    fn on_check(&self, command: CheckCommand) -> Option<CheckCommand>;
}
