//! Identifier resolution stage
//!
//! Runs after a run has committed its publications. Each publication without
//! a strong identifier is looked up by title in the configured services (in
//! order), each behind its own rate-limited gateway. Lookups are best-effort:
//! failures are counted and the stage moves on.

use std::sync::Arc;
use tracing::{debug, info, warn};

use harvest_core::{
    author_key, normalize_text, token_similarity, EnrichmentConfig, EventSink, Identifier,
    LifecycleEvent, Publication, PublicationId, RunId,
};
use harvest_net::{Gateway, IdentifierCandidate, IdentifierLookup, RequestKey};

use crate::HarvestStore;

/// A lookup service paired with the gateway that throttles it
pub struct LookupChannel {
    lookup: Arc<dyn IdentifierLookup>,
    gateway: Arc<Gateway<Vec<IdentifierCandidate>>>,
}

impl LookupChannel {
    pub fn new(
        lookup: Arc<dyn IdentifierLookup>,
        gateway: Arc<Gateway<Vec<IdentifierCandidate>>>,
    ) -> Self {
        Self { lookup, gateway }
    }
}

/// Per-publication result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// At least one identifier was attached
    Resolved,
    /// Already carries a high-confidence identifier
    SkippedSufficient,
    /// Title too short or generic to search for
    SkippedLowQuality,
    /// Every service was cooling down
    Shed,
    /// Lookups ran but nothing matched
    Unmatched,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnrichmentSummary {
    pub resolved: u32,
    pub skipped_sufficient: u32,
    pub skipped_low_quality: u32,
    pub shed: u32,
    pub unmatched: u32,
    pub failed: u32,
}

impl EnrichmentSummary {
    fn record(&mut self, outcome: ResolveOutcome) {
        match outcome {
            ResolveOutcome::Resolved => self.resolved += 1,
            ResolveOutcome::SkippedSufficient => self.skipped_sufficient += 1,
            ResolveOutcome::SkippedLowQuality => self.skipped_low_quality += 1,
            ResolveOutcome::Shed => self.shed += 1,
            ResolveOutcome::Unmatched => self.unmatched += 1,
            ResolveOutcome::Failed => self.failed += 1,
        }
    }

    pub fn skipped(&self) -> u32 {
        self.skipped_sufficient + self.skipped_low_quality + self.shed
    }
}

pub struct IdentifierResolver {
    store: Arc<dyn HarvestStore>,
    config: EnrichmentConfig,
    channels: Vec<LookupChannel>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn harvest_core::Clock>,
}

impl IdentifierResolver {
    pub fn new(
        store: Arc<dyn HarvestStore>,
        config: EnrichmentConfig,
        clock: Arc<dyn harvest_core::Clock>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            config,
            channels: Vec::new(),
            events,
            clock,
        }
    }

    /// Add a lookup service; services are tried in the order added
    pub fn with_channel(mut self, channel: LookupChannel) -> Self {
        self.channels.push(channel);
        self
    }

    fn is_sufficient(&self, publication: &Publication) -> bool {
        publication
            .display_identifier()
            .is_some_and(|i| i.confidence >= self.config.high_confidence)
    }

    fn is_low_quality(&self, title: &str) -> bool {
        let normalized = normalize_text(title);
        normalized.split_whitespace().count() < self.config.min_title_tokens
            || normalized.chars().count() < self.config.min_title_chars
    }

    /// Resolve identifiers for the given publications
    pub async fn resolve_publications(
        &self,
        run_id: Option<RunId>,
        ids: &[PublicationId],
    ) -> EnrichmentSummary {
        let mut summary = EnrichmentSummary::default();

        for id in ids {
            let outcome = match self.store.get_publication(*id).await {
                Ok(Some(publication)) => self.resolve_one(publication).await,
                Ok(None) => {
                    debug!(%id, "Publication vanished before enrichment");
                    continue;
                }
                Err(e) => {
                    warn!(%id, error = %e, "Failed to load publication for enrichment");
                    ResolveOutcome::Failed
                }
            };
            summary.record(outcome);
        }

        info!(
            resolved = summary.resolved,
            skipped = summary.skipped(),
            failed = summary.failed,
            "Identifier resolution finished"
        );
        if let Some(run_id) = run_id {
            self.events.emit(LifecycleEvent::EnrichmentCompleted {
                run_id,
                resolved: summary.resolved,
                skipped: summary.skipped(),
                failed: summary.failed,
            });
        }
        summary
    }

    async fn resolve_one(&self, publication: Publication) -> ResolveOutcome {
        if self.is_sufficient(&publication) {
            return ResolveOutcome::SkippedSufficient;
        }
        if self.is_low_quality(&publication.title) {
            return ResolveOutcome::SkippedLowQuality;
        }

        let author = publication.authors.first().map(|a| author_key(a));
        // local view for the sufficiency check; the store is patched, not overwritten
        let mut working = publication.clone();
        let mut found = Vec::new();
        let mut failed = false;
        let mut attempted = false;

        for channel in &self.channels {
            if self.is_sufficient(&working) {
                break;
            }
            // shed instead of queueing behind a service-wide cooldown
            if let Some(until) = channel.gateway.cooldown_until() {
                debug!(service = channel.lookup.service(), %until, "Lookup service cooling down; skipping");
                continue;
            }
            attempted = true;

            let key = RequestKey::new(channel.lookup.service(), "title_search")
                .param("title", normalize_text(&publication.title))
                .param("author", author.clone().unwrap_or_default());
            let lookup = channel.lookup.clone();
            let title = publication.title.clone();
            let first_author = author.clone();

            let response = channel
                .gateway
                .call(&key, move || async move {
                    lookup.search(&title, first_author.as_deref()).await
                })
                .await;

            match response {
                Ok(response) => {
                    let weight = channel.lookup.weight();
                    for candidate in response.value {
                        if let Some(identifier) = self.score(&publication, &candidate, weight, channel.lookup.service()) {
                            if working.add_identifier(identifier.clone()) {
                                found.push(identifier);
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        service = channel.lookup.service(),
                        publication = %publication.id,
                        error = %e,
                        "Identifier lookup failed"
                    );
                    failed = true;
                }
            }
        }

        if !found.is_empty() {
            return match self.store.add_identifiers(publication.id, found, self.clock.now()).await {
                Ok(_) => ResolveOutcome::Resolved,
                Err(e) => {
                    warn!(publication = %publication.id, error = %e, "Failed to store identifiers");
                    ResolveOutcome::Failed
                }
            };
        }
        if failed {
            ResolveOutcome::Failed
        } else if !attempted {
            ResolveOutcome::Shed
        } else {
            ResolveOutcome::Unmatched
        }
    }

    fn score(
        &self,
        publication: &Publication,
        candidate: &IdentifierCandidate,
        weight: f64,
        service: &str,
    ) -> Option<Identifier> {
        if let (Some(a), Some(b)) = (publication.year, candidate.year) {
            if (a - b).abs() > 1 {
                return None;
            }
        }
        let similarity = token_similarity(&publication.title, &candidate.title);
        if similarity < self.config.min_match_similarity {
            return None;
        }
        Some(Identifier::new(candidate.kind, &candidate.value, similarity * weight, service))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::ScriptedLookup;
    use crate::{DedupEngine, MemoryStore, PublicationStore};
    use harvest_core::{
        FetchError, GatewayConfig, IdentifierKind, PublicationRecord, RecordingSink, ARXIV_SERVICE,
        CROSSREF_SERVICE,
    };
    use harvest_net::{LocalThrottleStore, TokioClock};
    use std::time::Duration;

    struct Harness {
        store: Arc<MemoryStore>,
        sink: Arc<RecordingSink>,
        crossref: Arc<ScriptedLookup>,
        arxiv: Arc<ScriptedLookup>,
        resolver: IdentifierResolver,
    }

    fn harness() -> Harness {
        harness_with(ScriptedLookup::new(CROSSREF_SERVICE, 1.0))
    }

    fn harness_with(crossref: ScriptedLookup) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingSink::new());
        let clock = Arc::new(TokioClock::new());
        let throttle = Arc::new(LocalThrottleStore::new());
        let crossref = Arc::new(crossref);
        let arxiv = Arc::new(ScriptedLookup::new(ARXIV_SERVICE, 0.95));

        let gateway = |service: &str| {
            Arc::new(Gateway::new(
                service,
                GatewayConfig {
                    min_interval_secs: 1.0,
                    ..GatewayConfig::default()
                },
                throttle.clone(),
                clock.clone(),
                sink.clone(),
            ))
        };

        let resolver = IdentifierResolver::new(store.clone(), EnrichmentConfig::default(), clock.clone(), sink.clone())
            .with_channel(LookupChannel::new(crossref.clone(), gateway(CROSSREF_SERVICE)))
            .with_channel(LookupChannel::new(arxiv.clone(), gateway(ARXIV_SERVICE)));

        Harness {
            store,
            sink,
            crossref,
            arxiv,
            resolver,
        }
    }

    async fn insert(store: &MemoryStore, record: PublicationRecord) -> PublicationId {
        let publication = Publication::from_record(&record, chrono::Utc::now());
        let id = publication.id;
        store.insert_if_absent(publication).await.unwrap();
        id
    }

    fn candidate(kind: IdentifierKind, value: &str, title: &str) -> IdentifierCandidate {
        IdentifierCandidate {
            kind,
            value: value.to_string(),
            title: title.to_string(),
            year: Some(2017),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_crossref_match_skips_arxiv() {
        let h = harness();
        let title = "Attention is all you need";
        h.crossref.respond(Ok(vec![candidate(IdentifierKind::Doi, "10.5555/3295222.3295349", title)]));
        let id = insert(&h.store, PublicationRecord::new(title).with_year(2017)).await;

        let summary = h.resolver.resolve_publications(Some(RunId::new()), &[id]).await;

        assert_eq!(summary.resolved, 1);
        assert_eq!(h.arxiv.calls(), 0);
        let stored = h.store.get_publication(id).await.unwrap().unwrap();
        let best = stored.display_identifier().unwrap();
        assert_eq!(best.kind, IdentifierKind::Doi);
        assert_eq!(best.source, CROSSREF_SERVICE);
        assert_eq!(h.sink.count("enrichment_completed"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_falls_back_to_arxiv_when_crossref_misses() {
        let h = harness();
        let title = "Low rank adaptation of large language models";
        h.crossref.respond(Ok(vec![candidate(IdentifierKind::Doi, "10.1/unrelated", "Something else entirely")]));
        h.arxiv.respond(Ok(vec![IdentifierCandidate {
            year: Some(2021),
            ..candidate(IdentifierKind::Arxiv, "2106.09685v2", title)
        }]));
        let id = insert(&h.store, PublicationRecord::new(title).with_year(2021)).await;

        let summary = h.resolver.resolve_publications(None, &[id]).await;

        assert_eq!(summary.resolved, 1);
        let stored = h.store.get_publication(id).await.unwrap().unwrap();
        assert_eq!(stored.identifiers.len(), 1);
        assert_eq!(stored.identifiers[0].value, "2106.09685");
        assert!((stored.identifiers[0].confidence - 0.95).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skips_sufficient_and_low_quality() {
        let h = harness();
        let mut strong = PublicationRecord::new("A well identified paper about graphs");
        strong.identifiers.push(Identifier::new(IdentifierKind::Doi, "10.1/x", 0.95, "profile"));
        let strong = insert(&h.store, strong).await;
        let weak = insert(&h.store, PublicationRecord::new("Preface")).await;

        let summary = h.resolver.resolve_publications(None, &[strong, weak]).await;

        assert_eq!(summary.skipped_sufficient, 1);
        assert_eq!(summary.skipped_low_quality, 1);
        assert_eq!(h.crossref.calls() + h.arxiv.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_failures_are_counted_not_fatal() {
        let h = harness();
        h.crossref.respond(Err(FetchError::TransientNetwork("reset".into())));
        let id = insert(&h.store, PublicationRecord::new("Graph neural networks for molecules")).await;

        let summary = h.resolver.resolve_publications(None, &[id]).await;

        assert_eq!(summary.failed, 1);
        assert_eq!(h.arxiv.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_identifiers_merge_with_concurrent_upsert() {
        let h = harness_with(ScriptedLookup::new(CROSSREF_SERVICE, 1.0).with_delay(Duration::from_secs(5)));
        let title = "Attention is all you need";
        let record = PublicationRecord::new(title).with_authors(&["A Vaswani"]).with_year(2017);
        h.crossref.respond(Ok(vec![candidate(IdentifierKind::Doi, "10.5555/3295222.3295349", title)]));
        let id = insert(&h.store, record.clone()).await;

        let dedup = DedupEngine::new(h.store.clone(), Arc::new(TokioClock::new()), &EnrichmentConfig::default());
        let mut observed = record;
        observed.citation_count = Some(500);
        observed.identifiers.push(Identifier::new(IdentifierKind::Pmid, "28000001", 0.9, "profile"));

        // the page upsert lands while the title search is still in flight
        let upsert = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            dedup.upsert(&observed).await.unwrap()
        };
        let ids = [id];
        let (summary, upserted) = tokio::join!(h.resolver.resolve_publications(None, &ids), upsert);

        assert_eq!(upserted.id(), id);
        assert_eq!(summary.resolved, 1);
        let stored = h.store.get_publication(id).await.unwrap().unwrap();
        assert_eq!(stored.citation_count, Some(500));
        let kinds: Vec<IdentifierKind> = stored.identifiers.iter().map(|i| i.kind).collect();
        assert!(kinds.contains(&IdentifierKind::Doi));
        assert!(kinds.contains(&IdentifierKind::Pmid));
    }
}
