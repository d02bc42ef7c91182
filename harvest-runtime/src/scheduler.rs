//! Tick scheduler
//!
//! Each tick looks at every scope with tracked scholars and starts an
//! automated run when continuations are due or the full-run interval has
//! elapsed. Admission rules (cooldowns, one active run per scope) are the
//! orchestrator's; a rejected scope is simply skipped until the next tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use harvest_core::{RunId, RunPlanKind, RunStatus, TriggerKind};
use crate::{Orchestrator, RunError};

/// One tick loop per process
static SCHEDULER_ACTIVE: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("A scheduler is already running in this process")]
    AlreadyRunning,

    #[error("Automated runs are disabled by configuration")]
    AutomationDisabled,
}

/// What one tick did for one scope
#[derive(Debug)]
pub enum TickOutcome {
    /// Nothing due
    Idle { scope: String },
    /// Admission or execution refused
    Skipped { scope: String, reason: String },
    Executed {
        scope: String,
        run_id: RunId,
        status: RunStatus,
    },
}

/// Releases the process-wide scheduler slot
struct SlotGuard;

impl Drop for SlotGuard {
    fn drop(&mut self) {
        SCHEDULER_ACTIVE.store(false, Ordering::SeqCst);
    }
}

pub struct Scheduler {
    orchestrator: Arc<Orchestrator>,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Run one scheduling pass over every scope
    pub async fn tick(&self) -> Vec<TickOutcome> {
        let scopes = match self.orchestrator.store().list_scopes().await {
            Ok(scopes) => scopes,
            Err(e) => {
                error!(error = %e, "Failed to list scopes");
                return Vec::new();
            }
        };

        let mut outcomes = Vec::with_capacity(scopes.len());
        for scope in scopes {
            let outcome = match self.tick_scope(&scope).await {
                Ok(outcome) => outcome,
                Err(e) => TickOutcome::Skipped {
                    scope,
                    reason: e.to_string(),
                },
            };
            debug!(?outcome, "Tick outcome");
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn full_run_due(&self, scope: &str) -> Result<bool, RunError> {
        let last = self
            .orchestrator
            .store()
            .latest_run(scope, Some(TriggerKind::Automated), Some(RunPlanKind::Full))
            .await?;
        let interval = self.orchestrator.config().scheduler.auto_run_interval_secs;
        Ok(match last {
            None => true,
            Some(run) => {
                let elapsed = self.orchestrator.now() - run.created_at;
                elapsed.num_seconds() >= interval as i64
            }
        })
    }

    async fn tick_scope(&self, scope: &str) -> Result<TickOutcome, RunError> {
        let continuation_due = self.orchestrator.queue().has_due(scope).await?;
        let full_due = self.full_run_due(scope).await?;
        if !continuation_due && !full_due {
            return Ok(TickOutcome::Idle {
                scope: scope.to_string(),
            });
        }

        let started = match self
            .orchestrator
            .start_run(TriggerKind::Automated, scope, None)
            .await
        {
            Ok(started) => started,
            Err(e) => {
                info!(scope, reason = %e, "Automated run not started");
                return Ok(TickOutcome::Skipped {
                    scope: scope.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        let executed = self.orchestrator.drive(started.run.id, scope, full_due).await?;
        Ok(TickOutcome::Executed {
            scope: scope.to_string(),
            run_id: executed.run.id,
            status: executed.run.status,
        })
    }

    /// Spawn the tick loop. Fails when another loop is already running in
    /// this process or automation is off.
    pub fn start(self) -> Result<SchedulerHandle, SchedulerError> {
        let config = &self.orchestrator.config().scheduler;
        if !config.automation_enabled {
            return Err(SchedulerError::AutomationDisabled);
        }
        if SCHEDULER_ACTIVE
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SchedulerError::AlreadyRunning);
        }
        let guard = SlotGuard;
        let period = config.tick_interval();
        let (shutdown, mut stop) = watch::channel(false);

        info!(tick_secs = period.as_secs(), "Scheduler started");
        let task = tokio::spawn(async move {
            let _guard = guard;
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let outcomes = self.tick().await;
                        let executed = outcomes
                            .iter()
                            .filter(|o| matches!(o, TickOutcome::Executed { .. }))
                            .count();
                        debug!(scopes = outcomes.len(), executed, "Tick complete");
                    }
                    _ = stop.changed() => {
                        info!("Scheduler stopping");
                        break;
                    }
                }
            }
        });

        Ok(SchedulerHandle { shutdown, task })
    }
}

/// Handle to a running tick loop
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop after the tick in progress (if any) and wait for the loop to exit
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "Scheduler task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{harness, test_config};
    use harvest_ingest::fixtures::synthetic_records;
    use harvest_ingest::RunStore;
    use std::time::Duration;

    fn executed(outcomes: &[TickOutcome]) -> Vec<RunStatus> {
        outcomes
            .iter()
            .filter_map(|o| match o {
                TickOutcome::Executed { status, .. } => Some(*status),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_runs_full_then_drains_continuation() {
        let h = harness(test_config()).await;
        h.fetcher.set_profile("s1", synthetic_records("s1", 50));
        let scheduler = Scheduler::new(h.orchestrator.clone());

        // first tick: no automated full run yet
        let outcomes = scheduler.tick().await;
        assert_eq!(executed(&outcomes), vec![RunStatus::Success]);
        assert_eq!(h.fetcher.calls_for("s1"), vec![0, 10, 20]);

        // continuation not due yet, full interval not elapsed
        let outcomes = scheduler.tick().await;
        assert!(matches!(outcomes.as_slice(), [TickOutcome::Idle { .. }]));

        tokio::time::advance(Duration::from_secs(600)).await;
        let outcomes = scheduler.tick().await;
        assert_eq!(executed(&outcomes), vec![RunStatus::Success]);
        assert_eq!(h.fetcher.calls_for("s1"), vec![0, 10, 20, 30, 40]);
        assert!(h.orchestrator.list_queue_items(Some("lab")).await.unwrap().is_empty());

        let runs = h.store.list_runs("lab", 10).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].plan, RunPlanKind::Continuation);
        assert_eq!(runs[1].plan, RunPlanKind::Full);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_skips_scope_in_cooldown() {
        let mut config = test_config();
        config.scheduler.auto_run_interval_secs = 60;
        let h = harness(config).await;
        h.fetcher.inject_page("s1", 403, "");
        let scheduler = Scheduler::new(h.orchestrator.clone());

        assert_eq!(executed(&scheduler.tick().await), vec![RunStatus::Failed]);

        tokio::time::advance(Duration::from_secs(120)).await;
        match scheduler.tick().await.as_slice() {
            [TickOutcome::Skipped { reason, .. }] => assert!(reason.contains("cooldown")),
            other => panic!("expected skipped scope, got {:?}", other),
        }

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(executed(&scheduler.tick().await), vec![RunStatus::Success]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_scheduler_is_rejected() {
        let h = harness(test_config()).await;
        let first = Scheduler::new(h.orchestrator.clone()).start().unwrap();
        assert!(matches!(
            Scheduler::new(h.orchestrator.clone()).start(),
            Err(SchedulerError::AlreadyRunning)
        ));
        first.stop().await;

        let again = Scheduler::new(h.orchestrator.clone()).start().unwrap();
        again.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_requires_automation() {
        let mut config = test_config();
        config.scheduler.automation_enabled = false;
        let h = harness(config).await;
        assert!(matches!(
            Scheduler::new(h.orchestrator.clone()).start(),
            Err(SchedulerError::AutomationDisabled)
        ));
    }
}
