//! Storage collaborator interfaces
//!
//! Each call is assumed atomic. The orchestration layers only ever hold an
//! `Arc<dyn HarvestStore>`; [`crate::MemoryStore`] is the bundled
//! implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use harvest_core::{
    Identifier, Publication, PublicationId, QueueItem, Run, RunId, RunPlanKind, SafetyCounters, Scholar,
    StorageError, TriggerKind,
};

/// Result of an atomic insert keyed by fingerprint
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Inserted(PublicationId),
    /// A publication with the same fingerprint already exists
    Existing(Publication),
}

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn insert_run(&self, run: &Run) -> Result<(), StorageError>;

    async fn update_run(&self, run: &Run) -> Result<(), StorageError>;

    async fn get_run(&self, id: RunId) -> Result<Option<Run>, StorageError>;

    /// Any run of `scope` started with idempotency key `key`
    async fn find_run_by_key(&self, scope: &str, key: &str) -> Result<Option<Run>, StorageError>;

    /// Most recently created run of `scope` matching the filters
    async fn latest_run(
        &self,
        scope: &str,
        trigger: Option<TriggerKind>,
        plan: Option<RunPlanKind>,
    ) -> Result<Option<Run>, StorageError>;

    /// Runs of `scope`, newest first
    async fn list_runs(&self, scope: &str, limit: usize) -> Result<Vec<Run>, StorageError>;
}

#[async_trait]
pub trait ScholarStore: Send + Sync {
    async fn upsert_scholar(&self, scholar: &Scholar) -> Result<(), StorageError>;

    async fn get_scholar(&self, id: &str) -> Result<Option<Scholar>, StorageError>;

    /// Scholars of `scope` in tracking order
    async fn list_scholars(&self, scope: &str) -> Result<Vec<Scholar>, StorageError>;

    /// Every scope with at least one tracked scholar
    async fn list_scopes(&self) -> Result<Vec<String>, StorageError>;
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn get_queue_item(&self, scholar_id: &str) -> Result<Option<QueueItem>, StorageError>;

    /// Insert or replace the item of `item.scholar_id`
    async fn put_queue_item(&self, item: &QueueItem) -> Result<(), StorageError>;

    async fn delete_queue_item(&self, scholar_id: &str) -> Result<(), StorageError>;

    async fn list_queue_items(&self, scope: Option<&str>) -> Result<Vec<QueueItem>, StorageError>;

    /// Claim up to `limit` due `queued` items of `scope` (oldest due first)
    /// and mark them `retrying`, as one indivisible step.
    async fn claim_due(
        &self,
        scope: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueueItem>, StorageError>;
}

#[async_trait]
pub trait SafetyStore: Send + Sync {
    async fn get_safety(&self, scope: &str) -> Result<Option<SafetyCounters>, StorageError>;

    async fn put_safety(&self, counters: &SafetyCounters) -> Result<(), StorageError>;
}

#[async_trait]
pub trait PublicationStore: Send + Sync {
    async fn get_publication(&self, id: PublicationId) -> Result<Option<Publication>, StorageError>;

    async fn find_by_cluster(&self, cluster_id: &str) -> Result<Option<Publication>, StorageError>;

    async fn find_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Publication>, StorageError>;

    /// Insert unless a publication with the same fingerprint exists
    async fn insert_if_absent(&self, publication: Publication) -> Result<InsertOutcome, StorageError>;

    async fn update_publication(&self, publication: &Publication) -> Result<(), StorageError>;

    /// Add identifiers to the stored publication in one step, leaving every
    /// other field as stored. Returns whether anything changed.
    async fn add_identifiers(
        &self,
        id: PublicationId,
        identifiers: Vec<Identifier>,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError>;

    async fn list_publications(&self) -> Result<Vec<Publication>, StorageError>;

    /// Link a scholar to a publication; returns whether the link is new
    async fn link_scholar_publication(
        &self,
        scholar_id: &str,
        publication: PublicationId,
    ) -> Result<bool, StorageError>;

    async fn scholar_publications(&self, scholar_id: &str) -> Result<Vec<PublicationId>, StorageError>;

    /// Re-point every scholar link of `from` to `to`
    async fn move_links(&self, from: PublicationId, to: PublicationId) -> Result<(), StorageError>;
}

/// Everything the harvesting layers persist
pub trait HarvestStore: RunStore + ScholarStore + QueueStore + SafetyStore + PublicationStore {}

impl<T> HarvestStore for T where T: RunStore + ScholarStore + QueueStore + SafetyStore + PublicationStore {}
