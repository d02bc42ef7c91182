//! Scholar Harvest Core - domain model for rate-limited publication harvesting
//!
//! This crate provides the foundational primitives:
//! - Run, scholar, queue and safety records
//! - Publication fingerprints, identifiers and merge rules
//! - Lifecycle events and sinks
//! - Configuration and the wall-clock abstraction

pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod identifiers;
pub mod model;
pub mod publication;

pub use clock::*;
pub use config::*;
pub use error::*;
pub use events::*;
pub use identifiers::*;
pub use model::*;
pub use publication::*;

/// Scope used when the operator does not name one
pub const DEFAULT_SCOPE: &str = "default";
