//! Run Orchestrator
//!
//! Owns the run lifecycle `pending -> running -> {success, partial, failed,
//! canceled}`:
//! - admission (trigger policy, idempotency, single active run per scope,
//!   safety cooldowns)
//! - execution through the iteration engine
//! - aggregation, queue resolution and safety bookkeeping
//! - the post-commit identifier resolution stage

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use harvest_core::{
    CancelFlag, Clock, CooldownReason, CoreError, EventSink, FetchError, GatewayConfig,
    HarvestConfig, LifecycleEvent, QueueItem, QueueReason, QueueStatus, Run, RunId, RunPlanKind,
    RunStatus, SafetyCounters, Scholar, StorageError, SystemClock, TriggerKind,
    ARXIV_SERVICE, CROSSREF_SERVICE, SCHOLAR_SERVICE,
};
use harvest_ingest::{
    ContinuationQueue, DedupEngine, EnrichmentSummary, HarvestStore, IdentifierResolver,
    IterationEngine, LookupChannel, QueueError, Resolution, SafetyController, SafetyDecision,
    ScholarOutcome, ScholarReport, ScholarTask,
};
use harvest_net::{
    ArxivLookup, CrossrefLookup, Gateway, HttpSourceFetcher, IdentifierLookup, LocalThrottleStore,
    PageParser, ProfilePageParser, SourceFetcher, ThrottleStore,
};

use crate::BroadcastSink;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("{trigger:?} runs are disabled by configuration")]
    PolicyBlocked { trigger: TriggerKind },

    #[error("Scope already has an active run: {run_id}")]
    AlreadyRunning { run_id: RunId },

    #[error("Safety cooldown active ({reason}); {remaining_secs}s remaining")]
    SafetyCooldownActive {
        reason: CooldownReason,
        remaining_secs: u64,
    },

    #[error("Minimum interval between runs not elapsed; {remaining_secs}s remaining")]
    RunThrottled { remaining_secs: u64 },

    #[error("Run not found: {0}")]
    NotFound(RunId),

    #[error(transparent)]
    InvalidTransition(#[from] CoreError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Result of [`Orchestrator::start_run`]
#[derive(Debug, Clone)]
pub struct StartedRun {
    pub run: Run,
    /// The idempotency key matched an earlier run; nothing new was created
    pub reused_existing_run: bool,
}

/// Which scholars a run visits
#[derive(Debug, Clone, Default)]
pub struct RunPlan {
    /// Visit every enabled scholar of the scope (after the claimed ones)
    pub include_all_scholars: bool,
    /// Continuations claimed from the queue; visited first, at their cursors
    pub claimed: Vec<QueueItem>,
}

impl RunPlan {
    pub fn full(claimed: Vec<QueueItem>) -> Self {
        Self {
            include_all_scholars: true,
            claimed,
        }
    }

    pub fn continuation(claimed: Vec<QueueItem>) -> Self {
        Self {
            include_all_scholars: false,
            claimed,
        }
    }
}

#[derive(Debug)]
pub struct ExecutedRun {
    pub run: Run,
    pub reports: Vec<ScholarReport>,
    /// Identifier resolution running in the background (non-canceled runs only)
    pub enrichment: Option<JoinHandle<EnrichmentSummary>>,
}

/// Result of [`Orchestrator::spawn_run`]
#[derive(Debug)]
pub struct SpawnedRun {
    pub started: StartedRun,
    /// Execution task; `None` when an existing run was reused
    pub handle: Option<JoinHandle<Result<ExecutedRun, RunError>>>,
}

/// Operator-facing summary of one scope
#[derive(Debug, Clone)]
pub struct ScopeStatus {
    pub scope: String,
    pub safety: SafetyCounters,
    pub cooldown_remaining_secs: Option<u64>,
    pub active_run: Option<RunId>,
    pub last_run: Option<Run>,
    pub queued: usize,
    pub dropped: usize,
}

/// External collaborators the orchestrator is built from
pub struct Collaborators {
    pub store: Arc<dyn HarvestStore>,
    pub clock: Arc<dyn Clock>,
    pub throttle: Arc<dyn ThrottleStore>,
    pub fetcher: Arc<dyn SourceFetcher>,
    pub parser: Arc<dyn PageParser>,
    /// Identifier services, tried in order
    pub lookups: Vec<Arc<dyn IdentifierLookup>>,
}

impl Collaborators {
    /// Real HTTP collaborators around `store`
    pub fn http(config: &HarvestConfig, store: Arc<dyn HarvestStore>) -> Result<Self, FetchError> {
        let gateways = &config.gateways;
        let fetcher = HttpSourceFetcher::new(&config.http, gateways.scholar_profile.request_timeout())?;
        let crossref: Arc<dyn IdentifierLookup> = Arc::new(CrossrefLookup::new(
            gateways.crossref.request_timeout(),
            config.enrichment.mailto.clone(),
        )?);
        let arxiv: Arc<dyn IdentifierLookup> = Arc::new(ArxivLookup::new(gateways.arxiv.request_timeout())?);

        Ok(Self {
            store,
            clock: Arc::new(SystemClock),
            throttle: Arc::new(LocalThrottleStore::new()),
            fetcher: Arc::new(fetcher),
            parser: Arc::new(ProfilePageParser::new()),
            lookups: vec![crossref, arxiv],
        })
    }
}

struct ActiveRun {
    run_id: RunId,
    cancel: CancelFlag,
    /// The run as admitted, answered to a repeat of its key
    admitted: Run,
}

fn gateway_config(config: &HarvestConfig, service: &str) -> GatewayConfig {
    match service {
        SCHOLAR_SERVICE => config.gateways.scholar_profile.clone(),
        CROSSREF_SERVICE => config.gateways.crossref.clone(),
        ARXIV_SERVICE => config.gateways.arxiv.clone(),
        _ => GatewayConfig::default(),
    }
}

/// Status a finished run ends in
fn classify(canceled: bool, scholars_total: u32, failed: u32) -> RunStatus {
    if canceled {
        RunStatus::Canceled
    } else if scholars_total > 0 && failed == scholars_total {
        RunStatus::Failed
    } else if failed > 0 {
        RunStatus::Partial
    } else {
        RunStatus::Success
    }
}

pub struct Orchestrator {
    config: HarvestConfig,
    store: Arc<dyn HarvestStore>,
    clock: Arc<dyn Clock>,
    events: Arc<BroadcastSink>,
    safety: SafetyController,
    queue: ContinuationQueue,
    dedup: Arc<DedupEngine>,
    engine: IterationEngine,
    resolver: Arc<IdentifierResolver>,
    active: Mutex<HashMap<String, ActiveRun>>,
}

impl Orchestrator {
    pub fn new(config: HarvestConfig, deps: Collaborators) -> Self {
        let events = Arc::new(BroadcastSink::default());
        let sink: Arc<dyn EventSink> = events.clone();
        let store = deps.store;
        let clock = deps.clock;

        let safety = SafetyController::new(store.clone(), config.safety.clone(), clock.clone(), sink.clone());
        let queue = ContinuationQueue::new(store.clone(), config.queue.clone(), clock.clone(), sink.clone());
        let dedup = Arc::new(DedupEngine::new(store.clone(), clock.clone(), &config.enrichment));

        let profile_gateway = Arc::new(Gateway::new(
            SCHOLAR_SERVICE,
            gateway_config(&config, SCHOLAR_SERVICE),
            deps.throttle.clone(),
            clock.clone(),
            sink.clone(),
        ));
        let engine = IterationEngine::new(
            deps.fetcher,
            deps.parser,
            profile_gateway,
            dedup.clone(),
            config.ingestion.clone(),
        );

        let mut resolver =
            IdentifierResolver::new(store.clone(), config.enrichment.clone(), clock.clone(), sink.clone());
        for lookup in deps.lookups {
            let service = lookup.service();
            let gateway = Arc::new(Gateway::new(
                service,
                gateway_config(&config, service),
                deps.throttle.clone(),
                clock.clone(),
                sink.clone(),
            ));
            resolver = resolver.with_channel(LookupChannel::new(lookup, gateway));
        }

        Self {
            config,
            store,
            clock,
            events,
            safety,
            queue,
            dedup,
            engine,
            resolver: Arc::new(resolver),
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn HarvestStore> {
        &self.store
    }

    pub fn dedup(&self) -> &DedupEngine {
        &self.dedup
    }

    pub fn queue(&self) -> &ContinuationQueue {
        &self.queue
    }

    pub(crate) fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    /// Lifecycle event stream
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// Run currently registered as active for `scope`
    pub fn active_run(&self, scope: &str) -> Option<RunId> {
        self.active.lock().get(scope).map(|a| a.run_id)
    }

    fn cancel_flag(&self, scope: &str, run_id: RunId) -> Option<CancelFlag> {
        self.active
            .lock()
            .get(scope)
            .filter(|a| a.run_id == run_id)
            .map(|a| a.cancel.clone())
    }

    fn deregister(&self, scope: &str, run_id: RunId) {
        let mut active = self.active.lock();
        if active.get(scope).is_some_and(|a| a.run_id == run_id) {
            active.remove(scope);
        }
    }

    fn emit_transition(&self, run: &Run, from: Option<RunStatus>) {
        info!(run_id = %run.id, scope = %run.scope, from = ?from, to = %run.status, "Run transition");
        self.events.emit(LifecycleEvent::RunTransition {
            run_id: run.id,
            scope: run.scope.clone(),
            from,
            to: run.status,
            at: self.clock.now(),
        });
    }

    async fn transition(&self, run: &mut Run, next: RunStatus) -> Result<(), RunError> {
        let previous = run.transition(next, self.clock.now())?;
        self.store.update_run(run).await?;
        self.emit_transition(run, Some(previous));
        Ok(())
    }

    /// Add (or update) a tracked scholar
    pub async fn track_scholar(
        &self,
        scholar_id: &str,
        scope: &str,
        display_name: Option<&str>,
    ) -> Result<Scholar, RunError> {
        let mut scholar = self
            .store
            .get_scholar(scholar_id)
            .await?
            .unwrap_or_else(|| Scholar::new(scholar_id, scope));
        scholar.scope = scope.to_string();
        scholar.enabled = true;
        if let Some(name) = display_name {
            scholar.display_name = Some(name.to_string());
        }
        self.store.upsert_scholar(&scholar).await?;
        info!(scholar_id, scope, "Tracking scholar");
        Ok(scholar)
    }

    /// Admit a new run, or return the run an idempotency key already names
    pub async fn start_run(
        &self,
        trigger: TriggerKind,
        scope: &str,
        idempotency_key: Option<&str>,
    ) -> Result<StartedRun, RunError> {
        let enabled = match trigger {
            TriggerKind::Manual => self.config.scheduler.manual_enabled,
            TriggerKind::Automated => self.config.scheduler.automation_enabled,
        };
        if !enabled {
            return Err(RunError::PolicyBlocked { trigger });
        }

        if let Some(key) = idempotency_key {
            if let Some(run) = self.store.find_run_by_key(scope, key).await? {
                info!(scope, key, run_id = %run.id, "Idempotency key matched an existing run");
                return Ok(StartedRun {
                    run,
                    reused_existing_run: true,
                });
            }
        }

        if let Some(run_id) = self.active_run(scope) {
            return Err(RunError::AlreadyRunning { run_id });
        }

        match self.safety.may_start_run(scope).await? {
            SafetyDecision::Allowed => {}
            SafetyDecision::CoolingDown {
                reason,
                remaining_secs,
                ..
            } => {
                return Err(RunError::SafetyCooldownActive {
                    reason,
                    remaining_secs,
                })
            }
            SafetyDecision::Throttled { remaining_secs } => {
                return Err(RunError::RunThrottled { remaining_secs })
            }
        }

        let run = Run::new(scope, trigger, idempotency_key.map(str::to_string), self.clock.now());
        let repeated = {
            let mut active = self.active.lock();
            match active.get(scope) {
                // same key admitted between the lookup above and this lock
                Some(existing)
                    if idempotency_key.is_some()
                        && existing.admitted.idempotency_key.as_deref() == idempotency_key =>
                {
                    Some(existing.admitted.clone())
                }
                Some(existing) => {
                    return Err(RunError::AlreadyRunning {
                        run_id: existing.run_id,
                    })
                }
                None => {
                    active.insert(
                        scope.to_string(),
                        ActiveRun {
                            run_id: run.id,
                            cancel: CancelFlag::new(),
                            admitted: run.clone(),
                        },
                    );
                    None
                }
            }
        };
        if let Some(admitted) = repeated {
            let run = self.store.get_run(admitted.id).await?.unwrap_or(admitted);
            info!(scope, run_id = %run.id, "Idempotency key matched the active run");
            return Ok(StartedRun {
                run,
                reused_existing_run: true,
            });
        }

        let persisted: Result<(), StorageError> = async {
            self.store.insert_run(&run).await?;
            self.safety.note_run_started(scope).await
        }
        .await;
        if let Err(e) = persisted {
            self.deregister(scope, run.id);
            return Err(e.into());
        }

        self.emit_transition(&run, None);
        Ok(StartedRun {
            run,
            reused_existing_run: false,
        })
    }

    /// Start a run and execute it on a spawned task
    pub async fn spawn_run(
        self: &Arc<Self>,
        trigger: TriggerKind,
        scope: &str,
        idempotency_key: Option<&str>,
    ) -> Result<SpawnedRun, RunError> {
        let started = self.start_run(trigger, scope, idempotency_key).await?;
        if started.reused_existing_run {
            return Ok(SpawnedRun {
                started,
                handle: None,
            });
        }

        let this = self.clone();
        let run_id = started.run.id;
        let scope = scope.to_string();
        let handle = tokio::spawn(async move { this.drive(run_id, &scope, true).await });
        Ok(SpawnedRun {
            started,
            handle: Some(handle),
        })
    }

    /// Claim due continuations for an admitted run and execute it
    pub(crate) async fn drive(
        &self,
        run_id: RunId,
        scope: &str,
        include_all_scholars: bool,
    ) -> Result<ExecutedRun, RunError> {
        let claimed = match self.queue.drain(scope, self.config.queue.drain_batch_size).await {
            Ok(claimed) => claimed,
            Err(e) => {
                // never leave an admitted run pending
                if let Err(cancel_err) = self.cancel_run(run_id).await {
                    warn!(%run_id, error = %cancel_err, "Failed to cancel run after queue error");
                }
                return Err(e.into());
            }
        };
        let plan = RunPlan {
            include_all_scholars,
            claimed,
        };
        self.execute(run_id, plan).await
    }

    /// Cancel a pending or running run
    pub async fn cancel_run(&self, run_id: RunId) -> Result<Run, RunError> {
        let mut run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or(RunError::NotFound(run_id))?;

        match run.status {
            RunStatus::Pending => {
                if let Some(flag) = self.cancel_flag(&run.scope, run_id) {
                    flag.cancel();
                }
                self.transition(&mut run, RunStatus::Canceled).await?;
                self.deregister(&run.scope, run_id);
            }
            RunStatus::Running => match self.cancel_flag(&run.scope, run_id) {
                Some(flag) => {
                    info!(%run_id, "Cancellation requested");
                    flag.cancel();
                }
                None => warn!(%run_id, "Running run has no registration; nothing to signal"),
            },
            status => {
                return Err(CoreError::InvalidTransition {
                    from: status,
                    to: RunStatus::Canceled,
                }
                .into())
            }
        }
        Ok(run)
    }

    /// Execute an admitted run
    pub async fn execute(&self, run_id: RunId, plan: RunPlan) -> Result<ExecutedRun, RunError> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or(RunError::NotFound(run_id))?;

        if run.status == RunStatus::Canceled {
            debug!(%run_id, "Run canceled before execution");
            self.release_claims(&plan.claimed).await;
            self.deregister(&run.scope, run_id);
            return Ok(ExecutedRun {
                run,
                reports: Vec::new(),
                enrichment: None,
            });
        }

        let scope = run.scope.clone();
        let claimed = plan.claimed.clone();
        let result = self.execute_admitted(run, plan).await;
        if let Err(e) = &result {
            error!(%run_id, error = %e, "Run aborted");
            self.release_claims(&claimed).await;
            if let Ok(Some(mut run)) = self.store.get_run(run_id).await {
                if run.status == RunStatus::Running {
                    run.error = Some(e.to_string());
                    if let Err(e) = self.transition(&mut run, RunStatus::Failed).await {
                        warn!(%run_id, error = %e, "Failed to mark aborted run");
                    }
                }
            }
        }
        self.deregister(&scope, run_id);
        result
    }

    /// Hand still-claimed queue items back to the queue
    async fn release_claims(&self, claimed: &[QueueItem]) {
        for item in claimed {
            match self.store.get_queue_item(&item.scholar_id).await {
                Ok(Some(current)) if current.status == QueueStatus::Retrying => {
                    if let Err(e) = self.queue.resolve(&current, Resolution::Released).await {
                        warn!(scholar_id = %item.scholar_id, error = %e, "Failed to release queue item");
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(scholar_id = %item.scholar_id, error = %e, "Failed to read queue item"),
            }
        }
    }

    async fn build_tasks(&self, scope: &str, plan: RunPlan) -> Result<Vec<ScholarTask>, RunError> {
        let page_size = self.engine.page_size();
        let mut tasks = Vec::new();
        let mut planned = BTreeSet::new();

        for item in plan.claimed {
            match self.store.get_scholar(&item.scholar_id).await? {
                Some(scholar) if scholar.enabled => {
                    planned.insert(scholar.id.clone());
                    tasks.push(ScholarTask::resumed(scholar, item, page_size));
                }
                _ => {
                    debug!(scholar_id = %item.scholar_id, "Queued scholar no longer tracked");
                    self.queue.resolve(&item, Resolution::Completed).await?;
                }
            }
        }

        if plan.include_all_scholars {
            for scholar in self.store.list_scholars(scope).await? {
                if !scholar.enabled || planned.contains(&scholar.id) {
                    continue;
                }
                // a pending continuation that is not due yet still owns the cursor
                match self.store.get_queue_item(&scholar.id).await? {
                    Some(item) if matches!(item.status, QueueStatus::Queued | QueueStatus::Retrying) => {
                        debug!(scholar_id = %scholar.id, cstart = item.resume_cstart, "Resuming pending continuation");
                        tasks.push(ScholarTask::resumed(scholar, item, page_size));
                    }
                    _ => tasks.push(ScholarTask::fresh(scholar, page_size)),
                }
            }
        }
        Ok(tasks)
    }

    async fn execute_admitted(&self, mut run: Run, plan: RunPlan) -> Result<ExecutedRun, RunError> {
        let run_id = run.id;
        let scope = run.scope.clone();
        let cancel = self.cancel_flag(&scope, run_id).unwrap_or_default();

        run.plan = if plan.include_all_scholars {
            RunPlanKind::Full
        } else {
            RunPlanKind::Continuation
        };
        self.transition(&mut run, RunStatus::Running).await?;

        let tasks = self.build_tasks(&scope, plan).await?;
        run.counters.scholars_total = tasks.len() as u32;
        info!(%run_id, scope = %scope, scholars = tasks.len(), plan = ?run.plan, "Executing run");

        let reports = self.engine.run(tasks, &cancel).await;

        let now = self.clock.now();
        let mut first_error = None;
        let mut touched = BTreeSet::new();

        for report in &reports {
            let counters = &mut run.counters;
            counters.pages_fetched += report.cursor.pages_fetched;
            counters.new_publications += report.new_publications;
            counters.merged_publications += report.merged_publications;
            touched.extend(report.touched.iter().copied());

            match &report.outcome {
                ScholarOutcome::Completed => counters.succeeded += 1,
                ScholarOutcome::Deferred => counters.partial += 1,
                ScholarOutcome::Canceled => counters.canceled += 1,
                ScholarOutcome::Failed(err) => {
                    counters.failed += 1;
                    if err.counts_as_blocked() {
                        counters.blocked_failures += 1;
                    } else if err.counts_as_network() {
                        counters.network_failures += 1;
                    }
                    first_error.get_or_insert_with(|| format!("{}: {}", report.scholar.id, err));
                }
            }

            if self.settle_queue(&run, report).await? {
                run.counters.retried += 1;
            }

            if report.cursor.pages_fetched > 0 {
                let mut scholar = report.scholar.clone();
                scholar.baseline_complete |= report.cursor.baseline_complete;
                scholar.last_crawled_at = Some(now);
                self.store.upsert_scholar(&scholar).await?;
            }

            self.events.emit(LifecycleEvent::ScholarProcessed {
                run_id,
                scholar_id: report.scholar.id.clone(),
                outcome: report.outcome.as_str().to_string(),
                pages_fetched: report.cursor.pages_fetched,
                new_publications: report.new_publications,
            });
        }

        let counters = &run.counters;
        let status = classify(cancel.is_canceled(), counters.scholars_total, counters.failed);
        self.safety
            .record_run(&scope, counters.blocked_failures, counters.network_failures)
            .await?;

        if matches!(status, RunStatus::Failed | RunStatus::Partial) {
            run.error = first_error;
        }
        self.transition(&mut run, status).await?;
        self.deregister(&scope, run_id);
        info!(
            %run_id,
            status = %run.status,
            succeeded = run.counters.succeeded,
            partial = run.counters.partial,
            failed = run.counters.failed,
            pages = run.counters.pages_fetched,
            new_publications = run.counters.new_publications,
            "Run finished"
        );

        let enrichment = if status != RunStatus::Canceled && self.config.enrichment.enabled && !touched.is_empty() {
            let resolver = self.resolver.clone();
            let ids: Vec<_> = touched.into_iter().collect();
            Some(tokio::spawn(async move {
                resolver.resolve_publications(Some(run_id), &ids).await
            }))
        } else {
            None
        };

        Ok(ExecutedRun {
            run,
            reports,
            enrichment,
        })
    }

    /// Apply one scholar's outcome to the continuation queue.
    /// Returns whether the scholar was queued for another attempt after failing.
    async fn settle_queue(&self, run: &Run, report: &ScholarReport) -> Result<bool, RunError> {
        let scholar_id = report.scholar.id.as_str();
        let cstart = report.cursor.cstart;

        match (&report.outcome, &report.queue_item) {
            (ScholarOutcome::Completed, Some(item)) => {
                self.queue.resolve(item, Resolution::Completed).await?;
            }
            (ScholarOutcome::Completed, None) => {}
            (ScholarOutcome::Deferred, Some(item)) => {
                self.queue.resolve(item, Resolution::Progressed { cstart }).await?;
            }
            (ScholarOutcome::Deferred, None) => {
                self.queue
                    .enqueue(scholar_id, &run.scope, cstart, QueueReason::PageBudgetExhausted, None, Some(run.id))
                    .await?;
            }
            (ScholarOutcome::Failed(err), Some(item)) => {
                let resolution = Resolution::Failed {
                    cstart,
                    error: err.to_string(),
                };
                let settled = self.queue.resolve(item, resolution).await?;
                return Ok(settled.is_some_and(|i| i.status == QueueStatus::Queued));
            }
            (ScholarOutcome::Failed(err), None) if err.is_recoverable() => {
                let item = self
                    .queue
                    .enqueue(
                        scholar_id,
                        &run.scope,
                        cstart,
                        QueueReason::TransientFailure,
                        Some(err.to_string()),
                        Some(run.id),
                    )
                    .await?;
                return Ok(item.status == QueueStatus::Queued);
            }
            (ScholarOutcome::Failed(_), None) => {}
            (ScholarOutcome::Canceled, Some(item)) => {
                self.queue.resolve(item, Resolution::Released).await?;
            }
            (ScholarOutcome::Canceled, None) => {}
        }
        Ok(false)
    }

    pub async fn list_queue_items(&self, scope: Option<&str>) -> Result<Vec<QueueItem>, RunError> {
        Ok(self.queue.list(scope).await?)
    }

    pub async fn retry_queue_item(&self, scholar_id: &str) -> Result<QueueItem, RunError> {
        Ok(self.queue.retry(scholar_id).await?)
    }

    pub async fn drop_queue_item(&self, scholar_id: &str) -> Result<QueueItem, RunError> {
        Ok(self.queue.drop_item(scholar_id).await?)
    }

    pub async fn clear_queue_item(&self, scholar_id: &str) -> Result<QueueItem, RunError> {
        Ok(self.queue.clear(scholar_id).await?)
    }

    /// Safety, queue and run summary of `scope`
    pub async fn status(&self, scope: &str) -> Result<ScopeStatus, RunError> {
        let now = self.clock.now();
        let safety = self.safety.state(scope).await?;
        let cooldown_remaining_secs = safety
            .cooldown_until
            .filter(|until| *until > now)
            .map(|until| harvest_core::remaining_secs(until, now));
        let items = self.queue.list(Some(scope)).await?;

        Ok(ScopeStatus {
            scope: scope.to_string(),
            cooldown_remaining_secs,
            active_run: self.active_run(scope),
            last_run: self.store.latest_run(scope, None, None).await?,
            queued: items
                .iter()
                .filter(|i| matches!(i.status, QueueStatus::Queued | QueueStatus::Retrying))
                .count(),
            dropped: items.iter().filter(|i| i.status == QueueStatus::Dropped).count(),
            safety,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{harness, harness_with, test_config};
    use harvest_ingest::fixtures::{synthetic_records, ScriptedFetcher};
    use harvest_ingest::{PublicationStore, QueueStore, RunStore, ScholarStore};
    use std::time::Duration;

    fn drain_events(rx: &mut broadcast::Receiver<LifecycleEvent>) -> Vec<LifecycleEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_key_while_running_reuses_run() {
        let h = harness(test_config()).await;
        let first = h.orchestrator.start_run(TriggerKind::Manual, "lab", Some("nightly-1")).await.unwrap();
        assert!(!first.reused_existing_run);
        assert_eq!(first.run.status, RunStatus::Pending);

        let again = h.orchestrator.start_run(TriggerKind::Manual, "lab", Some("nightly-1")).await.unwrap();
        assert!(again.reused_existing_run);
        assert_eq!(again.run.id, first.run.id);

        match h.orchestrator.start_run(TriggerKind::Manual, "lab", None).await {
            Err(RunError::AlreadyRunning { run_id }) => assert_eq!(run_id, first.run.id),
            other => panic!("expected AlreadyRunning, got {:?}", other),
        }
        assert_eq!(h.store.list_runs("lab", 10).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_starts_with_same_key_share_one_run() {
        let h = harness(test_config()).await;

        let starts: Vec<_> = (0..8)
            .map(|_| {
                let orchestrator = h.orchestrator.clone();
                tokio::spawn(async move { orchestrator.start_run(TriggerKind::Manual, "lab", Some("nightly-7")).await })
            })
            .collect();
        let mut ids = Vec::new();
        let mut created = 0;
        for start in starts {
            let started = start.await.unwrap().unwrap();
            if !started.reused_existing_run {
                created += 1;
            }
            ids.push(started.run.id);
        }

        assert_eq!(created, 1);
        assert!(ids.iter().all(|id| *id == ids[0]));
        assert_eq!(h.store.list_runs("lab", 10).await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_trigger_is_rejected_without_state() {
        let mut config = test_config();
        config.scheduler.manual_enabled = false;
        let h = harness(config).await;

        let result = h.orchestrator.start_run(TriggerKind::Manual, "lab", None).await;
        assert!(matches!(
            result,
            Err(RunError::PolicyBlocked {
                trigger: TriggerKind::Manual
            })
        ));
        assert!(h.store.list_runs("lab", 10).await.unwrap().is_empty());
        assert!(h.orchestrator.active_run("lab").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhaustion_enqueues_continuation() {
        let h = harness(test_config()).await;
        h.fetcher.set_profile("s1", synthetic_records("s1", 50));
        let mut rx = h.orchestrator.subscribe();

        let started = h.orchestrator.start_run(TriggerKind::Manual, "lab", None).await.unwrap();
        let executed = h.orchestrator.execute(started.run.id, RunPlan::full(Vec::new())).await.unwrap();

        assert_eq!(executed.run.status, RunStatus::Success);
        assert_eq!(executed.run.counters.pages_fetched, 3);
        assert_eq!(executed.run.counters.partial, 1);
        assert_eq!(h.fetcher.calls_for("s1"), vec![0, 10, 20]);

        let items = h.orchestrator.list_queue_items(Some("lab")).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].resume_cstart, 30);
        assert_eq!(items[0].resume_cstart / 10, 3);
        assert_eq!(items[0].attempt_count, 1);
        assert_eq!(items[0].reason, QueueReason::PageBudgetExhausted);
        assert_eq!(items[0].last_run_id, Some(started.run.id));

        let transitions: Vec<RunStatus> = drain_events(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                LifecycleEvent::RunTransition { to, .. } => Some(to),
                _ => None,
            })
            .collect();
        assert_eq!(transitions, vec![RunStatus::Pending, RunStatus::Running, RunStatus::Success]);
        assert!(h.orchestrator.active_run("lab").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuation_resumes_at_cursor() {
        let h = harness(test_config()).await;
        h.fetcher.set_profile("s1", synthetic_records("s1", 50));

        let first = h.orchestrator.start_run(TriggerKind::Manual, "lab", None).await.unwrap();
        h.orchestrator.execute(first.run.id, RunPlan::full(Vec::new())).await.unwrap();

        tokio::time::advance(Duration::from_secs(600)).await;
        let claimed = h.orchestrator.queue().drain("lab", 10).await.unwrap();
        assert_eq!(claimed.len(), 1);

        let second = h.orchestrator.start_run(TriggerKind::Automated, "lab", None).await.unwrap();
        let executed = h
            .orchestrator
            .execute(second.run.id, RunPlan::continuation(claimed))
            .await
            .unwrap();

        assert_eq!(executed.run.plan, RunPlanKind::Continuation);
        assert_eq!(h.fetcher.calls_for("s1"), vec![0, 10, 20, 30, 40]);
        assert!(h.orchestrator.list_queue_items(Some("lab")).await.unwrap().is_empty());
        let scholar = h.store.get_scholar("s1").await.unwrap().unwrap();
        assert!(scholar.baseline_complete);
        assert_eq!(h.store.scholar_publications("s1").await.unwrap().len(), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_run_picks_up_pending_continuation() {
        let h = harness(test_config()).await;
        h.fetcher.set_profile("s1", synthetic_records("s1", 100));

        let first = h.orchestrator.start_run(TriggerKind::Manual, "lab", None).await.unwrap();
        h.orchestrator.execute(first.run.id, RunPlan::full(Vec::new())).await.unwrap();
        assert_eq!(h.store.get_queue_item("s1").await.unwrap().unwrap().resume_cstart, 30);

        // well before the continuation is due
        tokio::time::advance(Duration::from_secs(60)).await;
        let second = h.orchestrator.start_run(TriggerKind::Manual, "lab", None).await.unwrap();
        let executed = h.orchestrator.execute(second.run.id, RunPlan::full(Vec::new())).await.unwrap();

        assert_eq!(executed.run.counters.pages_fetched, 3);
        assert_eq!(h.fetcher.calls_for("s1"), vec![0, 10, 20, 30, 40, 50]);
        let item = h.store.get_queue_item("s1").await.unwrap().unwrap();
        assert_eq!(item.resume_cstart, 60);
        assert_eq!(item.status, QueueStatus::Queued);
        assert_eq!(item.attempt_count, 1);
        assert_eq!(h.store.scholar_publications("s1").await.unwrap().len(), 60);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_run_trips_cooldown() {
        let h = harness(test_config()).await;
        h.fetcher.set_profile("s1", synthetic_records("s1", 5));
        h.fetcher.inject_page("s1", 403, "");

        let started = h.orchestrator.start_run(TriggerKind::Manual, "lab", None).await.unwrap();
        let executed = h.orchestrator.execute(started.run.id, RunPlan::full(Vec::new())).await.unwrap();
        assert_eq!(executed.run.status, RunStatus::Failed);
        assert_eq!(executed.run.counters.blocked_failures, 1);
        assert!(executed.run.error.as_deref().is_some_and(|e| e.starts_with("s1:")));

        match h.orchestrator.start_run(TriggerKind::Manual, "lab", None).await {
            Err(RunError::SafetyCooldownActive {
                reason,
                remaining_secs,
            }) => {
                assert_eq!(reason, CooldownReason::BlockedFailureThresholdExceeded);
                assert_eq!(remaining_secs, 3600);
            }
            other => panic!("expected cooldown, got {:?}", other),
        }

        let status = h.orchestrator.status("lab").await.unwrap();
        assert_eq!(status.cooldown_remaining_secs, Some(3600));
        assert_eq!(status.safety.cooldown_entry_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mixed_outcomes_make_partial_run() {
        let h = harness(test_config()).await;
        h.orchestrator.track_scholar("s2", "lab", None).await.unwrap();
        h.fetcher.set_profile("s1", synthetic_records("s1", 5));
        h.fetcher.set_profile("s2", synthetic_records("s2", 5));
        for _ in 0..3 {
            h.fetcher.inject_error("s2", FetchError::TransientNetwork("reset".into()));
        }

        let started = h.orchestrator.start_run(TriggerKind::Manual, "lab", None).await.unwrap();
        let executed = h.orchestrator.execute(started.run.id, RunPlan::full(Vec::new())).await.unwrap();

        assert_eq!(executed.run.status, RunStatus::Partial);
        assert_eq!(executed.run.counters.succeeded, 1);
        assert_eq!(executed.run.counters.failed, 1);
        assert_eq!(executed.run.counters.network_failures, 1);
        assert_eq!(executed.run.counters.retried, 1);

        let item = h.store.get_queue_item("s2").await.unwrap().unwrap();
        assert_eq!(item.reason, QueueReason::TransientFailure);
        assert_eq!(item.resume_cstart, 0);
        assert_eq!(h.orchestrator.status("lab").await.unwrap().safety.consecutive_network_runs, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_pending_run() {
        let h = harness(test_config()).await;
        let started = h.orchestrator.start_run(TriggerKind::Manual, "lab", None).await.unwrap();

        let canceled = h.orchestrator.cancel_run(started.run.id).await.unwrap();
        assert_eq!(canceled.status, RunStatus::Canceled);
        assert!(h.orchestrator.active_run("lab").is_none());

        let executed = h.orchestrator.execute(started.run.id, RunPlan::full(Vec::new())).await.unwrap();
        assert_eq!(executed.run.status, RunStatus::Canceled);
        assert_eq!(h.fetcher.total_calls(), 0);
        assert!(matches!(
            h.orchestrator.cancel_run(started.run.id).await,
            Err(RunError::InvalidTransition(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_running_run() {
        let h = harness_with(test_config(), ScriptedFetcher::new().with_delay(Duration::from_secs(5))).await;
        h.fetcher.set_profile("s1", synthetic_records("s1", 50));
        let orchestrator = h.orchestrator.clone();

        let spawned = orchestrator.spawn_run(TriggerKind::Manual, "lab", None).await.unwrap();
        let run_id = spawned.started.run.id;
        tokio::time::sleep(Duration::from_secs(1)).await;

        orchestrator.cancel_run(run_id).await.unwrap();
        let executed = spawned.handle.unwrap().await.unwrap().unwrap();

        assert_eq!(executed.run.status, RunStatus::Canceled);
        assert_eq!(executed.run.counters.canceled, 1);
        assert!(executed.enrichment.is_none());
        assert!(orchestrator.active_run("lab").is_none());
        assert!(orchestrator.status("lab").await.unwrap().safety.updated_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_enrichment_runs_after_commit() {
        let h = harness(test_config()).await;
        h.fetcher.set_profile("s1", synthetic_records("s1", 3));

        let started = h.orchestrator.start_run(TriggerKind::Manual, "lab", None).await.unwrap();
        let executed = h.orchestrator.execute(started.run.id, RunPlan::full(Vec::new())).await.unwrap();

        let summary = executed.enrichment.expect("enrichment spawned").await.unwrap();
        assert_eq!(summary.resolved + summary.unmatched + summary.skipped() + summary.failed, 3);
        assert_eq!(h.store.list_publications().await.unwrap().len(), 3);
    }

    #[test]
    fn test_classification() {
        assert_eq!(classify(true, 3, 3), RunStatus::Canceled);
        assert_eq!(classify(false, 3, 3), RunStatus::Failed);
        assert_eq!(classify(false, 3, 1), RunStatus::Partial);
        assert_eq!(classify(false, 3, 0), RunStatus::Success);
        assert_eq!(classify(false, 0, 0), RunStatus::Success);
    }
}
