//! Scripted collaborators for tests and offline demos
//!
//! [`ScriptedFetcher`] serves synthetic profile pages rendered in the same
//! markup the real parser expects, so the whole fetch → parse → dedup path is
//! exercised without a network.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use harvest_core::{FetchError, PublicationRecord};
use harvest_net::{FetchedPage, IdentifierCandidate, IdentifierLookup, SourceFetcher};

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Render records as a profile listing page
pub fn profile_page_html(records: &[PublicationRecord], has_more: bool) -> String {
    let mut rows = String::new();
    for record in records {
        let href = match &record.cluster_id {
            Some(cluster) => format!(
                "/citations?view_op=view_citation&amp;citation_for_view={}",
                escape(cluster)
            ),
            None => String::new(),
        };
        let venue = record.venue.as_deref().map(escape).unwrap_or_default();
        let year = record.year.map(|y| y.to_string()).unwrap_or_default();
        rows.push_str(&format!(
            r#"<tr class="gsc_a_tr"><td class="gsc_a_t"><a href="{href}" class="gsc_a_at">{title}</a><div class="gs_gray">{authors}</div><div class="gs_gray">{venue}</div></td><td class="gsc_a_y"><span class="gsc_a_h">{year}</span></td></tr>"#,
            href = href,
            title = escape(&record.title),
            authors = escape(&record.authors.join(", ")),
            venue = venue,
            year = year,
        ));
    }

    let disabled = if has_more { "" } else { " disabled" };
    format!(
        r#"<html><body><table id="gsc_a_t"><tbody id="gsc_a_b">{rows}</tbody></table><button id="gsc_bpf_more" type="button"{disabled}>Show more</button></body></html>"#
    )
}

/// A profile with no (further) publications
pub fn empty_profile_html() -> String {
    r#"<html><body><table id="gsc_a_t"><tbody id="gsc_a_b"><tr><td class="gsc_a_e">There are no articles in this profile.</td></tr></tbody></table></body></html>"#
        .to_string()
}

const TOPICS: &[&str] = &[
    "sparse", "graph", "kernel", "bayesian", "quantum", "robust", "federated", "causal", "spectral",
    "stochastic", "adaptive", "neural", "convex", "streaming", "private", "symbolic",
];

/// `count` distinct synthetic publications owned by `scholar_id`
pub fn synthetic_records(scholar_id: &str, count: usize) -> Vec<PublicationRecord> {
    (0..count)
        .map(|n| {
            let a = TOPICS[n % TOPICS.len()];
            let b = TOPICS[(n / TOPICS.len() + 3) % TOPICS.len()];
            PublicationRecord::new(&format!("{a} {b} methods for {scholar_id} volume {n}"))
                .with_authors(&[&format!("A {scholar_id}"), "B Coauthor"])
                .with_year(2024 - (n as i32 % 10))
                .with_venue("Journal of Synthetic Results")
                .with_cluster_id(&format!("{scholar_id}:{n}"))
        })
        .collect()
}

enum Response {
    Error(FetchError),
    Page { status: u16, body: String },
}

struct Injected {
    /// Only answers a fetch at this offset when set
    cstart: Option<u32>,
    response: Response,
}

/// In-memory primary source
#[derive(Default)]
pub struct ScriptedFetcher {
    profiles: Mutex<HashMap<String, Vec<PublicationRecord>>>,
    injected: Mutex<HashMap<String, VecDeque<Injected>>>,
    calls: Mutex<Vec<(String, u32)>>,
    delay: Option<Duration>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every fetch sleeps this long before answering
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_profile(&self, scholar_id: &str, records: Vec<PublicationRecord>) {
        self.profiles.lock().insert(scholar_id.to_string(), records);
    }

    fn inject(&self, scholar_id: &str, cstart: Option<u32>, response: Response) {
        self.injected
            .lock()
            .entry(scholar_id.to_string())
            .or_default()
            .push_back(Injected { cstart, response });
    }

    /// Answer the next fetch for `scholar_id` with an error
    pub fn inject_error(&self, scholar_id: &str, error: FetchError) {
        self.inject(scholar_id, None, Response::Error(error));
    }

    /// Answer the next fetch for `scholar_id` with a raw page
    pub fn inject_page(&self, scholar_id: &str, status: u16, body: &str) {
        let body = body.to_string();
        self.inject(scholar_id, None, Response::Page { status, body });
    }

    /// Answer the next fetch of `scholar_id` at offset `cstart` with a raw page
    pub fn inject_page_at(&self, scholar_id: &str, cstart: u32, status: u16, body: &str) {
        let body = body.to_string();
        self.inject(scholar_id, Some(cstart), Response::Page { status, body });
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().len()
    }

    /// `cstart` of every fetch for `scholar_id`, in call order
    pub fn calls_for(&self, scholar_id: &str) -> Vec<u32> {
        self.calls
            .lock()
            .iter()
            .filter(|(id, _)| id == scholar_id)
            .map(|(_, cstart)| *cstart)
            .collect()
    }
}

#[async_trait]
impl SourceFetcher for ScriptedFetcher {
    async fn fetch_page(
        &self,
        scholar_id: &str,
        cstart: u32,
        page_size: u32,
    ) -> Result<FetchedPage, FetchError> {
        self.calls.lock().push((scholar_id.to_string(), cstart));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let injected = self.injected.lock().get_mut(scholar_id).and_then(|queue| {
            let position = queue
                .iter()
                .position(|i| i.cstart.map_or(true, |at| at == cstart))?;
            queue.remove(position)
        });
        match injected.map(|i| i.response) {
            Some(Response::Error(error)) => return Err(error),
            Some(Response::Page { status, body }) => {
                return Ok(FetchedPage::new(scholar_id, cstart, page_size, status, body))
            }
            None => {}
        }

        let body = {
            let profiles = self.profiles.lock();
            let records = profiles.get(scholar_id).map(Vec::as_slice).unwrap_or_default();
            let start = (cstart as usize).min(records.len());
            let end = (start + page_size as usize).min(records.len());
            if start == end {
                empty_profile_html()
            } else {
                profile_page_html(&records[start..end], end < records.len())
            }
        };
        Ok(FetchedPage::new(scholar_id, cstart, page_size, 200, body))
    }
}

/// Identifier lookup answering from a script; unscripted calls find nothing
pub struct ScriptedLookup {
    service: &'static str,
    weight: f64,
    responses: Mutex<VecDeque<Result<Vec<IdentifierCandidate>, FetchError>>>,
    calls: Mutex<usize>,
    delay: Option<Duration>,
}

impl ScriptedLookup {
    pub fn new(service: &'static str, weight: f64) -> Self {
        Self {
            service,
            weight,
            responses: Mutex::new(VecDeque::new()),
            calls: Mutex::new(0),
            delay: None,
        }
    }

    /// Every search sleeps this long before answering
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn respond(&self, response: Result<Vec<IdentifierCandidate>, FetchError>) {
        self.responses.lock().push_back(response);
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock()
    }
}

#[async_trait]
impl IdentifierLookup for ScriptedLookup {
    fn service(&self) -> &'static str {
        self.service
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    async fn search(
        &self,
        _title: &str,
        _first_author: Option<&str>,
    ) -> Result<Vec<IdentifierCandidate>, FetchError> {
        *self.calls.lock() += 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.responses.lock().pop_front().unwrap_or_else(|| Ok(Vec::new()))
    }
}
