//! Safety policy controller
//!
//! Per-scope cooldown state machine: `clear -> cooling_down -> clear`.
//! Consecutive failure counters are updated after every run; crossing a
//! threshold starts a wall-clock cooldown that only time can end.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use harvest_core::{
    remaining_secs, Clock, CooldownReason, EventSink, LifecycleEvent, SafetyConfig,
    SafetyCounters, StorageError,
};

use crate::HarvestStore;

/// Whether a run may start now
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyDecision {
    Allowed,
    CoolingDown {
        reason: CooldownReason,
        remaining_secs: u64,
        until: DateTime<Utc>,
    },
    /// Minimum inter-run interval not yet elapsed
    Throttled { remaining_secs: u64 },
}

impl SafetyDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, SafetyDecision::Allowed)
    }
}

pub struct SafetyController {
    store: Arc<dyn HarvestStore>,
    config: SafetyConfig,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
}

impl SafetyController {
    pub fn new(
        store: Arc<dyn HarvestStore>,
        config: SafetyConfig,
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

    /// Current counters of `scope` (fresh counters when none are stored)
    pub async fn state(&self, scope: &str) -> Result<SafetyCounters, StorageError> {
        Ok(self
            .store
            .get_safety(scope)
            .await?
            .unwrap_or_else(|| SafetyCounters::new(scope)))
    }

    /// Gate a run start. The first check after a cooldown expires clears it.
    pub async fn may_start_run(&self, scope: &str) -> Result<SafetyDecision, StorageError> {
        let now = self.clock.now();
        let mut counters = self.state(scope).await?;

        if let Some(until) = counters.cooldown_until {
            if until > now {
                let reason = counters
                    .cooldown_reason
                    .unwrap_or(CooldownReason::BlockedFailureThresholdExceeded);
                return Ok(SafetyDecision::CoolingDown {
                    reason,
                    remaining_secs: remaining_secs(until, now),
                    until,
                });
            }

            counters.cooldown_until = None;
            counters.cooldown_reason = None;
            counters.updated_at = Some(now);
            self.store.put_safety(&counters).await?;
            info!(scope, "Safety cooldown expired");
            self.events.emit(LifecycleEvent::CooldownCleared {
                scope: scope.to_string(),
            });
        }

        if let Some(last) = counters.last_run_started_at {
            let earliest = last + chrono::Duration::seconds(self.config.min_run_interval_secs as i64);
            if earliest > now {
                return Ok(SafetyDecision::Throttled {
                    remaining_secs: remaining_secs(earliest, now),
                });
            }
        }

        Ok(SafetyDecision::Allowed)
    }

    pub async fn note_run_started(&self, scope: &str) -> Result<(), StorageError> {
        let now = self.clock.now();
        let mut counters = self.state(scope).await?;
        counters.last_run_started_at = Some(now);
        counters.updated_at = Some(now);
        self.store.put_safety(&counters).await
    }

    /// Fold one finished run's failure counts into the scope's counters
    pub async fn record_run(
        &self,
        scope: &str,
        blocked_failures: u32,
        network_failures: u32,
    ) -> Result<SafetyCounters, StorageError> {
        let now = self.clock.now();
        let mut counters = self.state(scope).await?;

        counters.consecutive_blocked_runs = if blocked_failures > 0 {
            counters.consecutive_blocked_runs + 1
        } else {
            0
        };
        counters.consecutive_network_runs = if network_failures > 0 {
            counters.consecutive_network_runs + 1
        } else {
            0
        };
        counters.updated_at = Some(now);

        let trip = if counters.consecutive_blocked_runs >= self.config.blocked_failure_threshold {
            Some((
                CooldownReason::BlockedFailureThresholdExceeded,
                self.config.blocked_cooldown_secs,
            ))
        } else if counters.consecutive_network_runs >= self.config.network_failure_threshold {
            Some((
                CooldownReason::NetworkFailureThresholdExceeded,
                self.config.network_cooldown_secs,
            ))
        } else {
            None
        };

        if let Some((reason, secs)) = trip {
            let until = now + chrono::Duration::seconds(secs as i64);
            counters.cooldown_reason = Some(reason);
            counters.cooldown_until = Some(until);
            counters.cooldown_entry_count += 1;
            warn!(scope, %reason, %until, "Entering safety cooldown");
            self.events.emit(LifecycleEvent::CooldownEntered {
                scope: scope.to_string(),
                reason,
                until,
            });
        }

        self.store.put_safety(&counters).await?;
        Ok(counters)
    }
}
