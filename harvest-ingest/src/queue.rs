//! Continuation queue
//!
//! Scholars whose run ended before the end of their feed (page budget spent or
//! a recoverable failure) are queued with their resume offset and picked up by
//! later ticks. At most one item exists per scholar.
//!
//! Item lifecycle:
//! - `queued`: waiting for `next_attempt_at`
//! - `retrying`: claimed by a run
//! - `dropped`: attempts exhausted or operator drop; never revived automatically
//! - `cleared`: operator dismissed it; a later enqueue starts fresh

use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use harvest_core::{
    Clock, EventSink, LifecycleEvent, QueueConfig, QueueItem, QueueReason, QueueStatus, RunId,
    StorageError,
};

use crate::HarvestStore;

/// Drop reason recorded when the retry budget runs out
pub const ATTEMPTS_EXHAUSTED: &str = "queue_attempts_exhausted";

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("No queue item for scholar {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// How a claimed item's run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Reached the end of the feed
    Completed,
    /// Made progress but the budget ran out again
    Progressed { cstart: u32 },
    /// Failed after local retries
    Failed { cstart: u32, error: String },
    /// The run was canceled before finishing the item
    Released,
}

/// `min(base × 2^(attempt-1), max)`
pub fn backoff_delay(config: &QueueConfig, attempt: u32) -> chrono::Duration {
    let exponent = attempt.saturating_sub(1).min(30);
    let secs = config
        .base_delay_secs
        .saturating_mul(1u64 << exponent)
        .min(config.max_delay_secs);
    chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1000))
}

pub struct ContinuationQueue {
    store: Arc<dyn HarvestStore>,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
}

impl ContinuationQueue {
    pub fn new(
        store: Arc<dyn HarvestStore>,
        config: QueueConfig,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            config,
            clock,
            events,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn next_attempt(&self, now: DateTime<Utc>, attempt: u32) -> DateTime<Utc> {
        now + backoff_delay(&self.config, attempt)
    }

    fn emit_enqueued(&self, item: &QueueItem) {
        self.events.emit(LifecycleEvent::QueueItemEnqueued {
            scholar_id: item.scholar_id.clone(),
            resume_cstart: item.resume_cstart,
            attempt_count: item.attempt_count,
            next_attempt_at: item.next_attempt_at,
        });
    }

    /// Queue (or update) the continuation of `scholar_id`
    pub async fn enqueue(
        &self,
        scholar_id: &str,
        scope: &str,
        resume_cstart: u32,
        reason: QueueReason,
        last_error: Option<String>,
        run_id: Option<RunId>,
    ) -> Result<QueueItem, QueueError> {
        let now = self.clock.now();

        let item = match self.store.get_queue_item(scholar_id).await? {
            Some(mut existing) => {
                existing.scope = scope.to_string();
                existing.reason = reason;
                existing.last_error = last_error;
                existing.last_run_id = run_id;
                existing.updated_at = now;
                match existing.status {
                    QueueStatus::Dropped => {
                        existing.resume_cstart = existing.resume_cstart.max(resume_cstart);
                        debug!(scholar_id, "Queue item is dropped; recording cursor only");
                    }
                    QueueStatus::Cleared => {
                        existing.resume_cstart = resume_cstart;
                        existing.status = QueueStatus::Queued;
                        existing.attempt_count = 1;
                        existing.next_attempt_at = self.next_attempt(now, 1);
                    }
                    QueueStatus::Queued | QueueStatus::Retrying => {
                        // never move a live continuation backwards
                        existing.resume_cstart = existing.resume_cstart.max(resume_cstart);
                        existing.status = QueueStatus::Queued;
                        existing.next_attempt_at = self.next_attempt(now, existing.attempt_count);
                    }
                }
                existing
            }
            None => QueueItem {
                scholar_id: scholar_id.to_string(),
                scope: scope.to_string(),
                status: QueueStatus::Queued,
                reason,
                resume_cstart,
                attempt_count: 1,
                next_attempt_at: self.next_attempt(now, 1),
                last_error,
                last_run_id: run_id,
                created_at: now,
                updated_at: now,
            },
        };

        self.store.put_queue_item(&item).await?;
        if item.status == QueueStatus::Queued {
            info!(
                scholar_id,
                resume_cstart = item.resume_cstart,
                attempt = item.attempt_count,
                next_attempt_at = %item.next_attempt_at,
                "Continuation queued"
            );
            self.emit_enqueued(&item);
        }
        Ok(item)
    }

    /// Atomically claim up to `batch_size` due items of `scope`
    pub async fn drain(&self, scope: &str, batch_size: usize) -> Result<Vec<QueueItem>, QueueError> {
        let claimed = self.store.claim_due(scope, self.clock.now(), batch_size).await?;
        if !claimed.is_empty() {
            debug!(scope, count = claimed.len(), "Claimed continuation items");
        }
        Ok(claimed)
    }

    /// Settle a claimed item after its run
    pub async fn resolve(
        &self,
        item: &QueueItem,
        resolution: Resolution,
    ) -> Result<Option<QueueItem>, QueueError> {
        let now = self.clock.now();
        let mut current = self
            .store
            .get_queue_item(&item.scholar_id)
            .await?
            .unwrap_or_else(|| item.clone());
        // operator decisions taken while the item was claimed stand
        let operator_owned = matches!(current.status, QueueStatus::Dropped | QueueStatus::Cleared);
        current.updated_at = now;
        let mut requeued = false;

        match resolution {
            Resolution::Completed => {
                self.store.delete_queue_item(&item.scholar_id).await?;
                debug!(scholar_id = %item.scholar_id, "Continuation completed");
                return Ok(None);
            }
            Resolution::Progressed { cstart } => {
                current.resume_cstart = cstart;
                current.last_error = None;
                if !operator_owned {
                    current.status = QueueStatus::Queued;
                    current.attempt_count = 1;
                    current.next_attempt_at = self.next_attempt(now, 1);
                    requeued = true;
                }
            }
            Resolution::Failed { cstart, error } => {
                current.resume_cstart = cstart;
                if operator_owned {
                    current.last_error = Some(error);
                } else {
                    current.attempt_count += 1;
                    if current.attempt_count > self.config.max_attempts {
                        current.status = QueueStatus::Dropped;
                        current.last_error = Some(format!("{}: {}", ATTEMPTS_EXHAUSTED, error));
                        warn!(
                            scholar_id = %current.scholar_id,
                            attempts = current.attempt_count - 1,
                            "Continuation dropped after exhausting attempts"
                        );
                        self.events.emit(LifecycleEvent::QueueItemDropped {
                            scholar_id: current.scholar_id.clone(),
                            reason: ATTEMPTS_EXHAUSTED.to_string(),
                        });
                    } else {
                        current.status = QueueStatus::Queued;
                        current.last_error = Some(error);
                        current.next_attempt_at = self.next_attempt(now, current.attempt_count);
                        requeued = true;
                    }
                }
            }
            Resolution::Released => {
                if current.status == QueueStatus::Retrying {
                    current.status = QueueStatus::Queued;
                }
            }
        }

        self.store.put_queue_item(&current).await?;
        if requeued {
            self.emit_enqueued(&current);
        }
        Ok(Some(current))
    }

    /// Operator: make an item due now with a fresh attempt budget
    pub async fn retry(&self, scholar_id: &str) -> Result<QueueItem, QueueError> {
        let now = self.clock.now();
        let mut item = self.require(scholar_id).await?;
        item.status = QueueStatus::Queued;
        item.attempt_count = 1;
        item.next_attempt_at = now;
        item.last_error = None;
        item.updated_at = now;
        self.store.put_queue_item(&item).await?;
        info!(scholar_id, "Continuation re-queued by operator");
        self.emit_enqueued(&item);
        Ok(item)
    }

    /// Operator: stop retrying an item
    pub async fn drop_item(&self, scholar_id: &str) -> Result<QueueItem, QueueError> {
        let mut item = self.require(scholar_id).await?;
        item.status = QueueStatus::Dropped;
        item.updated_at = self.clock.now();
        self.store.put_queue_item(&item).await?;
        info!(scholar_id, "Continuation dropped by operator");
        self.events.emit(LifecycleEvent::QueueItemDropped {
            scholar_id: scholar_id.to_string(),
            reason: "operator".to_string(),
        });
        Ok(item)
    }

    /// Operator: dismiss an item
    pub async fn clear(&self, scholar_id: &str) -> Result<QueueItem, QueueError> {
        let mut item = self.require(scholar_id).await?;
        item.status = QueueStatus::Cleared;
        item.updated_at = self.clock.now();
        self.store.put_queue_item(&item).await?;
        info!(scholar_id, "Continuation cleared by operator");
        Ok(item)
    }

    pub async fn list(&self, scope: Option<&str>) -> Result<Vec<QueueItem>, QueueError> {
        Ok(self.store.list_queue_items(scope).await?)
    }

    /// Whether `scope` has queued items that are due now
    pub async fn has_due(&self, scope: &str) -> Result<bool, QueueError> {
        let now = self.clock.now();
        Ok(self
            .store
            .list_queue_items(Some(scope))
            .await?
            .iter()
            .any(|item| item.is_due(now)))
    }

    async fn require(&self, scholar_id: &str) -> Result<QueueItem, QueueError> {
        self.store
            .get_queue_item(scholar_id)
            .await?
            .ok_or_else(|| QueueError::NotFound(scholar_id.to_string()))
    }
}
