// SPDX-License-Identifier: Apache-2.0
//! Value types shared by xic peers: dynamic arguments, request context, application
//! exceptions, and the argument codec.

mod codec;
mod exception;
mod value;
pub mod error;
pub use codec::*;
pub use exception::*;
pub use value::*;
