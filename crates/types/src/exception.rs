//! Application-level exceptions raised by servants and reconstructed by callers.

use crate::{error::CodecResult, Arguments, Value};
use std::{fmt, panic::Location};

/// Exception name for a quest whose service or method has no servant.
pub const SERVICE_NOT_FOUND_EXCEPTION: &str = "ServiceNotFoundException";
/// Exception name for a quest whose arguments do not match the method's input shape.
pub const ARGUMENT_EXCEPTION: &str = "ArgumentException";
/// Exception name for a oneway method called with a transaction id.
pub const ONEWAY_MISMATCH_EXCEPTION: &str = "OnewayMismatchException";

/// A declared application exception.
///
/// Servants raise these to report failures a caller is expected to handle. The name, code,
/// tag, and message cross the wire; the source location is reported in the failure payload
/// detail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exception {
    exname: String,
    code: i64,
    tag: String,
    message: String,
    file: String,
    line: u32,
}

impl Exception {
    /// Create an exception raised at the caller's location.
    #[track_caller]
    pub fn new(exname: impl Into<String>, code: i64, message: impl Into<String>) -> Self {
        let location = Location::caller();
        Self {
            exname: exname.into(),
            code,
            tag: String::new(),
            message: message.into(),
            file: location.file().to_string(),
            line: location.line(),
        }
    }

    /// Attach a tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    /// The exception family name.
    pub fn exname(&self) -> &str {
        &self.exname
    }

    /// The numeric code.
    pub fn code(&self) -> i64 {
        self.code
    }

    /// The tag, possibly empty.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// The human-readable message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Source file where the exception was raised. Empty for remote exceptions.
    pub fn file(&self) -> &str {
        &self.file
    }

    /// Source line where the exception was raised. Zero for remote exceptions.
    pub fn line(&self) -> u32 {
        self.line
    }

    /// Rebuild an exception from an exceptional answer's failure payload.
    ///
    /// Missing fields default to empty/zero: opaque servant errors carry only a message.
    pub fn from_failure(failure: &Arguments) -> Self {
        Self {
            exname: failure.get_string("exname"),
            code: failure.get_int("code"),
            tag: failure.get_string("tag"),
            message: failure.get_string("message"),
            file: String::new(),
            line: 0,
        }
    }

    /// Build the failure payload for an exceptional answer.
    pub fn to_failure(&self, raiser: &str) -> Arguments {
        let detail = Arguments::new()
            .with("file", self.file.as_str())
            .with("line", self.line);
        Arguments::new()
            .with("raiser", raiser)
            .with("exname", self.exname.as_str())
            .with("code", self.code)
            .with("tag", self.tag.as_str())
            .with("message", self.message.as_str())
            .with("detail", Value::Dict(detail))
    }

    /// Decode an exception from encoded failure payload bytes.
    pub fn decode_failure(bytes: &[u8]) -> CodecResult<Self> {
        let failure: Arguments = crate::decode(bytes)?;
        Ok(Self::from_failure(&failure))
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.exname, self.code)?;
        if !self.tag.is_empty() {
            write!(f, "[{}]", self.tag)?;
        }
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for Exception {}

/// Failure payload for an error that is not a declared [`Exception`].
pub fn opaque_failure(raiser: &str, message: &str) -> Arguments {
    Arguments::new().with("raiser", raiser).with("message", message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_raise_location() {
        let ex = Exception::new("NotFound", 404, "no such object");
        assert!(ex.file().ends_with("exception.rs"));
        assert!(ex.line() > 0);
    }

    #[test]
    fn test_failure_payload_roundtrip() {
        let ex = Exception::new("NotFound", 404, "no such object").with_tag("lookup");
        let failure = ex.to_failure("Get*Store");

        assert_eq!(failure.get_string("raiser"), "Get*Store");
        let detail = failure.get("detail").and_then(Value::as_dict).unwrap();
        assert_eq!(detail.get_string("file"), ex.file());

        let bytes = crate::encode(&failure).unwrap();
        let remote = Exception::decode_failure(&bytes).unwrap();
        assert_eq!(remote.exname(), "NotFound");
        assert_eq!(remote.code(), 404);
        assert_eq!(remote.tag(), "lookup");
        assert_eq!(remote.message(), "no such object");
        assert_eq!(remote.line(), 0);
    }

    #[test]
    fn test_opaque_failure_has_message_only() {
        let failure = opaque_failure("Ping*Echo", "boom");
        let remote = Exception::from_failure(&failure);
        assert_eq!(remote.exname(), "");
        assert_eq!(remote.code(), 0);
        assert_eq!(remote.message(), "boom");
        assert_eq!(remote.to_string(), "(0): boom");
    }
}
