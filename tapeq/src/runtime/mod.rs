//! Background tasks: agent heartbeats and periodic garbage collection.

/// Periodic garbage collection task.
pub mod collector;
/// Agent heartbeat task.
pub mod heartbeat;
/// Cooperative shutdown signal.
pub mod shutdown;

pub use collector::{GcPassResult, spawn_collector};
pub use heartbeat::spawn_heartbeat;
pub use shutdown::ShutdownToken;
