//! Execution and reliability infrastructure for the subfleet
//! orchestration core.
//!
//! - [`task_manager`]: bounded-concurrency execution, batch fan-out and
//!   named cancellable background tasks
//! - [`priority_gate`]: the slot gate that orders waiting work by priority
//! - [`error_handler`]: failure classification, statistics and
//!   recovery directives

pub mod error_handler;
pub mod priority_gate;
pub mod task_manager;
