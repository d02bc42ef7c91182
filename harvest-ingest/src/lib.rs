//! Scholar Harvest ingestion pipeline
//!
//! The stages a run is made of:
//! - **Iteration**: two-pass page acquisition with a shared page budget
//! - **Retry**: bounded per-page retry with separate network/rate-limit budgets
//! - **Dedup**: fingerprint and cluster based publication merging
//! - **Queue**: cross-tick continuation of unfinished scholars
//! - **Safety**: per-scope cooldowns after repeated failures
//! - **Enrichment**: best-effort DOI/arXiv resolution after commit
//!
//! Persistence goes through the [`HarvestStore`] traits; [`MemoryStore`] is the
//! bundled implementation (optionally snapshotted to a JSON file).

pub mod dedup;
pub mod enrichment;
#[cfg(any(test, feature = "test-util"))]
pub mod fixtures;
pub mod iteration;
pub mod memory;
pub mod queue;
pub mod retry;
pub mod safety;
pub mod store;

pub use dedup::*;
pub use enrichment::*;
pub use iteration::*;
pub use memory::*;
pub use queue::*;
pub use retry::*;
pub use safety::*;
pub use store::*;
