//! Shared test harness: an orchestrator over scripted collaborators

use std::sync::Arc;

use harvest_core::HarvestConfig;
use harvest_ingest::fixtures::ScriptedFetcher;
use harvest_ingest::MemoryStore;
use harvest_net::{LocalThrottleStore, ProfilePageParser, TokioClock};

use crate::{Collaborators, Orchestrator};

pub(crate) struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<MemoryStore>,
    pub fetcher: Arc<ScriptedFetcher>,
}

/// Small pages, tight budget, no spacing or caching, one-hour cooldowns
pub(crate) fn test_config() -> HarvestConfig {
    let mut config = HarvestConfig::default();
    config.gateways.scholar_profile.min_interval_secs = 0.0;
    config.gateways.scholar_profile.cache_ttl_secs = 0;
    config.safety.min_run_interval_secs = 0;
    config.safety.blocked_cooldown_secs = 3600;
    config.ingestion.page_size = 10;
    config.ingestion.pass2_page_budget = 2;
    config.scheduler.automation_enabled = true;
    config
}

pub(crate) async fn harness(config: HarvestConfig) -> Harness {
    harness_with(config, ScriptedFetcher::new()).await
}

/// Harness with scholar `s1` tracked in scope `lab`
pub(crate) async fn harness_with(config: HarvestConfig, fetcher: ScriptedFetcher) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let fetcher = Arc::new(fetcher);
    let deps = Collaborators {
        store: store.clone(),
        clock: Arc::new(TokioClock::new()),
        throttle: Arc::new(LocalThrottleStore::new()),
        fetcher: fetcher.clone(),
        parser: Arc::new(ProfilePageParser::new()),
        lookups: Vec::new(),
    };
    let orchestrator = Arc::new(Orchestrator::new(config, deps));
    orchestrator
        .track_scholar("s1", "lab", Some("Scholar One"))
        .await
        .unwrap();

    Harness {
        orchestrator,
        store,
        fetcher,
    }
}
