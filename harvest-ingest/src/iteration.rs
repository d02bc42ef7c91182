//! Two-pass scholar iteration
//!
//! Pass 1 gives every scholar in the plan exactly one page, with bounded
//! concurrency, so nobody starves behind a long profile. Pass 2 walks the plan
//! in order and spends a page budget shared by the whole run. Each page is
//! deduplicated as soon as it arrives, so work survives a later failure.

use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

use harvest_core::{
    CancelFlag, FetchError, IngestionConfig, PublicationId, QueueItem, Scholar, ScholarCursor,
    SCHOLAR_SERVICE,
};
use harvest_net::{Gateway, PageParser, ParsedPage, RequestKey, SourceFetcher};

use crate::{DedupEngine, RetryDecision, RetryPolicy, RetryState};

/// One scholar's share of a run
#[derive(Debug, Clone)]
pub struct ScholarTask {
    pub scholar: Scholar,
    pub cursor: ScholarCursor,
    /// Queue item this task was claimed from
    pub queue_item: Option<QueueItem>,
}

impl ScholarTask {
    pub fn fresh(scholar: Scholar, page_size: u32) -> Self {
        let cursor = ScholarCursor::fresh(&scholar, page_size);
        Self {
            scholar,
            cursor,
            queue_item: None,
        }
    }

    pub fn resumed(scholar: Scholar, item: QueueItem, page_size: u32) -> Self {
        let cursor = ScholarCursor::resume(&scholar, item.resume_cstart, page_size);
        Self {
            scholar,
            cursor,
            queue_item: Some(item),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScholarOutcome {
    /// End of feed, or no new records on an incremental crawl
    Completed,
    /// Pages remain but the run's page budget is spent
    Deferred,
    /// Page acquisition failed after local retries
    Failed(FetchError),
    Canceled,
}

impl ScholarOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScholarOutcome::Completed => "completed",
            ScholarOutcome::Deferred => "deferred",
            ScholarOutcome::Failed(_) => "failed",
            ScholarOutcome::Canceled => "canceled",
        }
    }
}

/// What happened to one scholar during a run
#[derive(Debug, Clone)]
pub struct ScholarReport {
    pub scholar: Scholar,
    /// Cursor after the last consumed page
    pub cursor: ScholarCursor,
    pub queue_item: Option<QueueItem>,
    pub outcome: ScholarOutcome,
    pub new_publications: u64,
    pub merged_publications: u64,
    /// Retries spent across all pages (network + rate limit)
    pub retries: u32,
    pub touched: Vec<PublicationId>,
}

impl ScholarReport {
    fn new(task: ScholarTask) -> Self {
        Self {
            scholar: task.scholar,
            cursor: task.cursor,
            queue_item: task.queue_item,
            outcome: ScholarOutcome::Deferred,
            new_publications: 0,
            merged_publications: 0,
            retries: 0,
            touched: Vec::new(),
        }
    }
}

enum PageAttempt {
    Page(ParsedPage),
    Failed(FetchError),
    Canceled,
}

struct ScholarState {
    index: usize,
    report: ScholarReport,
    finished: bool,
}

impl ScholarState {
    fn finish(&mut self, outcome: ScholarOutcome) {
        self.report.outcome = outcome;
        self.finished = true;
    }
}

pub struct IterationEngine {
    fetcher: Arc<dyn SourceFetcher>,
    parser: Arc<dyn PageParser>,
    gateway: Arc<Gateway<ParsedPage>>,
    dedup: Arc<DedupEngine>,
    config: IngestionConfig,
    policy: RetryPolicy,
}

impl IterationEngine {
    pub fn new(
        fetcher: Arc<dyn SourceFetcher>,
        parser: Arc<dyn PageParser>,
        gateway: Arc<Gateway<ParsedPage>>,
        dedup: Arc<DedupEngine>,
        config: IngestionConfig,
    ) -> Self {
        let policy = RetryPolicy::from(&config);
        Self {
            fetcher,
            parser,
            gateway,
            dedup,
            config,
            policy,
        }
    }

    pub fn page_size(&self) -> u32 {
        self.config.page_size
    }

    /// Iterate `tasks` and report one outcome per scholar, in plan order
    pub async fn run(&self, tasks: Vec<ScholarTask>, cancel: &CancelFlag) -> Vec<ScholarReport> {
        let concurrency = self.config.pass1_concurrency.max(1);
        let initial: Vec<ScholarState> = tasks
            .into_iter()
            .enumerate()
            .map(|(index, task)| ScholarState {
                index,
                report: ScholarReport::new(task),
                finished: false,
            })
            .collect();

        info!(scholars = initial.len(), concurrency, "Pass 1: first page per scholar");
        let mut states: Vec<ScholarState> = stream::iter(initial)
            .map(|mut state| async move {
                self.step(&mut state, cancel).await;
                state
            })
            .buffer_unordered(concurrency)
            .collect::<Vec<_>>()
            .await;
        states.sort_by_key(|s| s.index);

        let mut budget = self.config.pass2_page_budget;
        info!(budget, "Pass 2: depth within shared page budget");
        for state in states.iter_mut() {
            while !state.finished {
                if cancel.is_canceled() {
                    state.finish(ScholarOutcome::Canceled);
                    break;
                }
                if budget == 0 {
                    debug!(
                        scholar_id = %state.report.scholar.id,
                        page_index = state.report.cursor.page_index(),
                        "Page budget exhausted; deferring"
                    );
                    state.finish(ScholarOutcome::Deferred);
                    break;
                }
                budget -= 1;
                self.step(state, cancel).await;
            }
        }

        states.into_iter().map(|s| s.report).collect()
    }

    /// Consume one page for `state`
    async fn step(&self, state: &mut ScholarState, cancel: &CancelFlag) {
        let scholar_id = state.report.scholar.id.clone();
        let cstart = state.report.cursor.cstart;

        let parsed = match self.fetch_with_retry(state, cancel).await {
            PageAttempt::Page(parsed) => parsed,
            PageAttempt::Canceled => {
                state.finish(ScholarOutcome::Canceled);
                return;
            }
            PageAttempt::Failed(error) => {
                warn!(%scholar_id, cstart, error = %error, "Scholar failed after retries");
                state.finish(ScholarOutcome::Failed(error));
                return;
            }
        };

        let ingest = match self.dedup.ingest_page(&scholar_id, &parsed.records).await {
            Ok(ingest) => ingest,
            Err(e) => {
                warn!(%scholar_id, cstart, error = %e, "Failed to store page");
                state.finish(ScholarOutcome::Failed(e.into()));
                return;
            }
        };

        let report = &mut state.report;
        report.new_publications += ingest.created;
        report.merged_publications += ingest.merged;
        report.touched.extend(ingest.touched);
        report.cursor.advance(parsed.has_more && !parsed.records.is_empty());

        debug!(
            %scholar_id,
            cstart,
            records = parsed.records.len(),
            new_for_scholar = ingest.new_for_scholar,
            "Page ingested"
        );

        if report.cursor.reached_end {
            state.finish(ScholarOutcome::Completed);
        } else if report.scholar.baseline_complete && ingest.new_for_scholar == 0 {
            // newest-first listing: nothing new here means nothing new further down
            debug!(%scholar_id, "Caught up with known publications");
            state.finish(ScholarOutcome::Completed);
        }
    }

    async fn fetch_with_retry(&self, state: &mut ScholarState, cancel: &CancelFlag) -> PageAttempt {
        let scholar_id = state.report.scholar.id.clone();
        let cstart = state.report.cursor.cstart;
        let mut retry = RetryState::new(self.policy.clone());

        loop {
            if cancel.is_canceled() {
                return PageAttempt::Canceled;
            }
            let result = self.fetch_once(&scholar_id, cstart).await;
            if cancel.is_canceled() {
                debug!(%scholar_id, cstart, "Discarding page fetched after cancellation");
                return PageAttempt::Canceled;
            }

            match retry.classify(&result) {
                RetryDecision::Success => {
                    return match result {
                        Ok(parsed) => PageAttempt::Page(parsed),
                        Err(e) => PageAttempt::Failed(e),
                    };
                }
                RetryDecision::RetryNetwork { delay } | RetryDecision::RetryRateLimited { delay } => {
                    state.report.retries += 1;
                    warn!(
                        %scholar_id,
                        cstart,
                        delay_secs = delay.as_secs(),
                        network_attempts = retry.network_attempts(),
                        rate_limit_attempts = retry.rate_limit_attempts(),
                        "Page fetch failed; backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.canceled() => {
                            debug!(%scholar_id, cstart, "Backoff interrupted by cancellation");
                            return PageAttempt::Canceled;
                        }
                    }
                }
                RetryDecision::Fatal => {
                    return match result {
                        Err(e) => PageAttempt::Failed(e),
                        Ok(parsed) => PageAttempt::Page(parsed),
                    };
                }
            }
        }
    }

    async fn fetch_once(&self, scholar_id: &str, cstart: u32) -> Result<ParsedPage, FetchError> {
        let page_size = self.config.page_size;
        let key = RequestKey::new(SCHOLAR_SERVICE, "profile_page")
            .param("user", scholar_id)
            .param("cstart", cstart)
            .param("pagesize", page_size);

        let fetcher = self.fetcher.clone();
        let parser = self.parser.clone();
        let id = scholar_id.to_string();
        let response = self
            .gateway
            .call(&key, move || async move {
                let page = fetcher.fetch_page(&id, cstart, page_size).await?;
                parser.parse_page(&page).into_result()
            })
            .await?;
        Ok(response.value)
    }
}
