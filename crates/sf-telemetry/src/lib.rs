//! Logging setup shared by the subfleet binaries.
//!
//! Everything else in the workspace only emits `tracing` events; this crate
//! owns the global subscriber.

pub mod logging;

pub use logging::{init_logging, init_logging_json, LogFormat};
