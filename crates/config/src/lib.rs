//! Crate for configuring xic connections.
//!
//! Per-connection limits and timeouts, loadable from YAML.
mod connection;
pub use connection::*;
