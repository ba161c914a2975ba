//! Process wiring for subfleet: builds an instance manager from config,
//! talks to the chat platform over HTTP and runs until asked to stop.

pub mod daemon;
pub mod gateway;

pub use daemon::{BootReport, Daemon, ShutdownSummary};
pub use gateway::HttpGatewayAdapter;
