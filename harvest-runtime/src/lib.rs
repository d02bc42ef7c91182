//! Scholar Harvest runtime
//!
//! Wires the ingestion stages into runs:
//! - [`Orchestrator`]: run admission, execution, cancellation and queue operations
//! - [`Scheduler`]: the process-local tick loop behind automated runs
//! - [`BroadcastSink`]: lifecycle event fan-out to subscribers

pub mod events;
pub mod orchestrator;
pub mod scheduler;

#[cfg(test)]
mod testing;

pub use events::*;
pub use orchestrator::*;
pub use scheduler::*;
