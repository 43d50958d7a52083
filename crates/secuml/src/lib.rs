//! SecuML experiment runtime.
//!
//! This crate re-exports the core library (configuration, sessions,
//! experiment lifecycle, classification) and the web server.

pub use secuml_core::*;
pub use secuml_server as server;
