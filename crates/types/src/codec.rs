//! Argument codec.
//!
//! Every message body and argument payload is BCS encoded. Peers must agree on the shape of
//! a payload: BCS is not self-describing, so a typed struct and an [`Arguments`] dictionary
//! produce different bytes.
//!
//! [`Arguments`]: crate::Arguments

use crate::error::{CodecError, CodecResult};
use serde::{de::DeserializeOwned, Serialize};

/// Encode a value into a new buffer.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> CodecResult<Vec<u8>> {
    bcs::to_bytes(value).map_err(CodecError::Encode)
}

/// Encode a value into an existing buffer, appending to its contents.
///
/// Lets callers reuse allocations across messages.
pub fn encode_into_buffer<T: Serialize + ?Sized>(
    buffer: &mut Vec<u8>,
    value: &T,
) -> CodecResult<()> {
    bcs::serialize_into(buffer, value).map_err(CodecError::Encode)
}

/// Decode bytes into the requested shape.
///
/// Trailing bytes are an error.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<T> {
    bcs::from_bytes(bytes).map_err(CodecError::Decode)
}
