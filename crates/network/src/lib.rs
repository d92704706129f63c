// SPDX-License-Identifier: Apache-2.0
//! Connection core of the xic binary RPC protocol.
//!
//! A [`Connection`] frames messages on a byte stream, runs the Hello/Bye lifecycle, matches
//! answers to outstanding calls, and dispatches incoming quests to [`Servant`]s found through
//! an [`Adapter`].

mod adapter;
mod codec;
mod connection;
mod dispatch;
pub mod error;
mod handshake;
mod message;
mod pending;
mod proxy;
mod servant;
mod state;

pub use adapter::*;
pub use codec::MessageCodec;
pub use connection::Connection;
pub use dispatch::dispatch_quest;
pub use error::{ProtocolError, XicError, XicResult};
pub use handshake::*;
pub use message::*;
pub use pending::{AnswerResult, PendingCall, PendingCalls};
pub use proxy::Proxy;
pub use servant::*;
pub use state::ConState;
