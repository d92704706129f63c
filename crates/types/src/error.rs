//! Error types for the argument codec.

use thiserror::Error;

/// The result for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Failure to move a value to or from its wire representation.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The value could not be serialized.
    #[error("encode error: {0}")]
    Encode(#[source] bcs::Error),
    /// The bytes do not match the requested shape.
    #[error("decode error: {0}")]
    Decode(#[source] bcs::Error),
    /// A dictionary field was missing or carried the wrong kind of value.
    #[error("field `{field}`: expected {expected}")]
    Field {
        /// The dictionary key.
        field: String,
        /// The kind of value that was expected.
        expected: &'static str,
    },
}
