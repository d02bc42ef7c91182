//! Run, scholar, queue and safety state
//!
//! These are the records the orchestration layer persists between ticks:
//! - [`Run`] with its status machine and counters
//! - [`Scholar`] and the per-run [`ScholarCursor`]
//! - [`QueueItem`] for deferred continuation work
//! - [`SafetyCounters`] and [`RateLimiterState`] for the safety floors

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::CoreError;

/// Unique identifier of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        RunId(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(RunId(Uuid::parse_str(s)?))
    }
}

/// What started a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Manual,
    Automated,
}

/// Which scholars a run covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunPlanKind {
    /// Every enabled scholar in the scope
    #[default]
    Full,
    /// Only scholars claimed from the continuation queue
    Continuation,
}

/// Run lifecycle: `pending -> running -> {success, partial, failed, canceled}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Partial,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Success | RunStatus::Partial | RunStatus::Failed | RunStatus::Canceled
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        match (self, next) {
            (RunStatus::Pending, RunStatus::Running) => true,
            (RunStatus::Pending, RunStatus::Canceled) => true,
            (RunStatus::Running, RunStatus::Success)
            | (RunStatus::Running, RunStatus::Partial)
            | (RunStatus::Running, RunStatus::Failed)
            | (RunStatus::Running, RunStatus::Canceled) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
            RunStatus::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregated per-scholar outcomes of a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub scholars_total: u32,
    /// Reached the end of the feed (or caught up with known records)
    pub succeeded: u32,
    /// Page budget ran out; continuation queued
    pub partial: u32,
    /// Ended with an error after local retries
    pub failed: u32,
    /// Failed scholars queued for another attempt
    pub retried: u32,
    /// Not finished because the run was canceled
    pub canceled: u32,
    pub blocked_failures: u32,
    pub network_failures: u32,
    pub pages_fetched: u32,
    pub new_publications: u64,
    pub merged_publications: u64,
}

/// One ingestion cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub scope: String,
    pub trigger: TriggerKind,
    #[serde(default)]
    pub plan: RunPlanKind,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub counters: RunCounters,
    pub idempotency_key: Option<String>,
    pub error: Option<String>,
}

impl Run {
    pub fn new(
        scope: &str,
        trigger: TriggerKind,
        idempotency_key: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: RunId::new(),
            scope: scope.to_string(),
            trigger,
            plan: RunPlanKind::Full,
            status: RunStatus::Pending,
            created_at: now,
            started_at: None,
            finished_at: None,
            counters: RunCounters::default(),
            idempotency_key,
            error: None,
        }
    }

    /// Apply a status transition, stamping start/finish times
    pub fn transition(&mut self, next: RunStatus, now: DateTime<Utc>) -> Result<RunStatus, CoreError> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        let previous = self.status;
        self.status = next;
        if next == RunStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        Ok(previous)
    }
}

/// A tracked external profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scholar {
    /// External profile id on the primary source
    pub id: String,
    /// Operator scope owning this scholar
    pub scope: String,
    pub display_name: Option<String>,
    pub enabled: bool,
    /// Whether the first-ever full crawl reached the end of the feed
    pub baseline_complete: bool,
    pub last_crawled_at: Option<DateTime<Utc>>,
}

impl Scholar {
    pub fn new(id: &str, scope: &str) -> Self {
        Self {
            id: id.to_string(),
            scope: scope.to_string(),
            display_name: None,
            enabled: true,
            baseline_complete: false,
            last_crawled_at: None,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.display_name = Some(name.to_string());
        self
    }
}

/// Pagination progress of one scholar within one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScholarCursor {
    pub scholar_id: String,
    /// Record offset of the next unseen page
    pub cstart: u32,
    pub page_size: u32,
    /// Pages fetched during the current run
    pub pages_fetched: u32,
    pub baseline_complete: bool,
    /// The upstream reported no further pages
    pub reached_end: bool,
}

impl ScholarCursor {
    pub fn fresh(scholar: &Scholar, page_size: u32) -> Self {
        Self::resume(scholar, 0, page_size)
    }

    pub fn resume(scholar: &Scholar, cstart: u32, page_size: u32) -> Self {
        Self {
            scholar_id: scholar.id.clone(),
            cstart,
            page_size,
            pages_fetched: 0,
            baseline_complete: scholar.baseline_complete,
            reached_end: false,
        }
    }

    /// Zero-based index of the next unseen page
    pub fn page_index(&self) -> u32 {
        if self.page_size == 0 {
            0
        } else {
            self.cstart / self.page_size
        }
    }

    /// Record one consumed page
    pub fn advance(&mut self, has_more: bool) {
        self.cstart = self.cstart.saturating_add(self.page_size);
        self.pages_fetched += 1;
        if !has_more {
            self.reached_end = true;
            self.baseline_complete = true;
        }
    }
}

/// Continuation queue item status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Queued,
    Retrying,
    Dropped,
    Cleared,
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            QueueStatus::Queued => "queued",
            QueueStatus::Retrying => "retrying",
            QueueStatus::Dropped => "dropped",
            QueueStatus::Cleared => "cleared",
        };
        f.write_str(label)
    }
}

/// Why a scholar was queued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueReason {
    /// Pass-2 budget ran out before the end of the feed
    PageBudgetExhausted,
    /// A recoverable failure ended the scholar's acquisition
    TransientFailure,
}

/// A deferred resumption unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    pub scholar_id: String,
    pub scope: String,
    pub status: QueueStatus,
    pub reason: QueueReason,
    /// Record offset to resume from
    pub resume_cstart: u32,
    pub attempt_count: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub last_run_id: Option<RunId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueItem {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == QueueStatus::Queued && self.next_attempt_at <= now
    }
}

/// Why a scope is cooling down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CooldownReason {
    BlockedFailureThresholdExceeded,
    NetworkFailureThresholdExceeded,
}

impl CooldownReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CooldownReason::BlockedFailureThresholdExceeded => "blocked_failure_threshold_exceeded",
            CooldownReason::NetworkFailureThresholdExceeded => "network_failure_threshold_exceeded",
        }
    }
}

impl std::fmt::Display for CooldownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-scope safety state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyCounters {
    pub scope: String,
    pub consecutive_blocked_runs: u32,
    pub consecutive_network_runs: u32,
    pub cooldown_reason: Option<CooldownReason>,
    pub cooldown_until: Option<DateTime<Utc>>,
    /// Lifetime number of cooldowns entered
    pub cooldown_entry_count: u64,
    pub last_run_started_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl SafetyCounters {
    pub fn new(scope: &str) -> Self {
        Self {
            scope: scope.to_string(),
            consecutive_blocked_runs: 0,
            consecutive_network_runs: 0,
            cooldown_reason: None,
            cooldown_until: None,
            cooldown_entry_count: 0,
            last_run_started_at: None,
            updated_at: None,
        }
    }

    pub fn is_cooling_down(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| until > now)
    }
}

/// Shared throttle state of one external service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RateLimiterState {
    pub next_allowed_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
}

impl RateLimiterState {
    /// Earliest instant a request may be dispatched
    pub fn earliest_slot(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let mut slot = now;
        if let Some(next) = self.next_allowed_at {
            slot = slot.max(next);
        }
        if let Some(until) = self.cooldown_until {
            slot = slot.max(until);
        }
        slot
    }

    pub fn is_cooling_down(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| until > now)
    }
}

#[derive(Debug, Default)]
struct CancelState {
    canceled: AtomicBool,
    notify: Notify,
}

/// Run-level cancellation flag, checked between fetches and scholars.
///
/// Waits that may outlast a fetch (retry backoff) race [`CancelFlag::canceled`].
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<CancelState>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.canceled.store(true, Ordering::SeqCst);
        self.0.notify.notify_waiters();
    }

    pub fn is_canceled(&self) -> bool {
        self.0.canceled.load(Ordering::SeqCst)
    }

    /// Resolves once the flag is set
    pub async fn canceled(&self) {
        loop {
            // register before checking so a concurrent cancel is not missed
            let notified = self.0.notify.notified();
            if self.is_canceled() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_transitions() {
        let now = Utc::now();
        let mut run = Run::new("lab", TriggerKind::Manual, None, now);
        assert_eq!(run.status, RunStatus::Pending);

        run.transition(RunStatus::Running, now).unwrap();
        assert_eq!(run.started_at, Some(now));

        run.transition(RunStatus::Partial, now).unwrap();
        assert!(run.finished_at.is_some());

        // Terminal runs are immutable
        assert!(run.transition(RunStatus::Running, now).is_err());
        assert!(run.transition(RunStatus::Canceled, now).is_err());
    }

    #[test]
    fn test_pending_can_be_canceled() {
        assert!(RunStatus::Pending.can_transition_to(RunStatus::Canceled));
        assert!(!RunStatus::Pending.can_transition_to(RunStatus::Success));
    }

    #[test]
    fn test_cursor_advance() {
        let scholar = Scholar::new("abc123", "lab");
        let mut cursor = ScholarCursor::fresh(&scholar, 20);
        cursor.advance(true);
        cursor.advance(true);
        assert_eq!(cursor.cstart, 40);
        assert_eq!(cursor.page_index(), 2);
        assert!(!cursor.reached_end);

        cursor.advance(false);
        assert!(cursor.reached_end);
        assert!(cursor.baseline_complete);
        assert_eq!(cursor.pages_fetched, 3);
    }

    #[test]
    fn test_cursor_saturates_at_offset_limit() {
        let scholar = Scholar::new("abc123", "lab");
        let mut cursor = ScholarCursor::resume(&scholar, u32::MAX - 5, 20);
        cursor.advance(true);
        assert_eq!(cursor.cstart, u32::MAX);
        assert_eq!(cursor.pages_fetched, 1);
    }

    #[test]
    fn test_earliest_slot_prefers_cooldown() {
        let now = Utc::now();
        let state = RateLimiterState {
            next_allowed_at: Some(now + chrono::Duration::seconds(2)),
            cooldown_until: Some(now + chrono::Duration::seconds(60)),
        };
        assert_eq!(state.earliest_slot(now), now + chrono::Duration::seconds(60));
        assert!(state.is_cooling_down(now));
    }

    #[test]
    fn test_cancel_flag_shared() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        clone.cancel();
        assert!(flag.is_canceled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_canceled_wakes_waiter() {
        let flag = CancelFlag::new();
        let waiter = {
            let flag = flag.clone();
            tokio::spawn(async move { flag.canceled().await })
        };
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        assert!(!waiter.is_finished());

        flag.cancel();
        waiter.await.unwrap();
        // already set: resolves immediately
        flag.canceled().await;
    }
}
