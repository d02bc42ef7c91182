//! Identifier lookup services
//!
//! Title searches against Crossref (DOIs) and arXiv. Both return raw
//! candidates; matching and confidence scoring happen in the enrichment stage.

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::debug;

use harvest_core::{FetchError, IdentifierKind, ARXIV_SERVICE, CROSSREF_SERVICE};

use crate::create_lookup_client;
use crate::source::map_transport_error;

/// Candidates requested per lookup
const MAX_CANDIDATES: usize = 5;

/// One search hit from a lookup service
#[derive(Debug, Clone, PartialEq)]
pub struct IdentifierCandidate {
    pub kind: IdentifierKind,
    pub value: String,
    pub title: String,
    pub year: Option<i32>,
}

/// Title search against an identifier registry
#[async_trait]
pub trait IdentifierLookup: Send + Sync {
    /// Gateway service name this lookup is throttled under
    fn service(&self) -> &'static str;

    /// Weight applied to title similarity when scoring this source's matches
    fn weight(&self) -> f64;

    async fn search(
        &self,
        title: &str,
        first_author: Option<&str>,
    ) -> Result<Vec<IdentifierCandidate>, FetchError>;
}

fn check_status(service: &str, status: reqwest::StatusCode) -> Result<(), FetchError> {
    if status.is_success() {
        return Ok(());
    }
    match status.as_u16() {
        429 => Err(FetchError::RateLimited {
            service: service.to_string(),
        }),
        403 => Err(FetchError::UpstreamBlocked(format!("{} returned HTTP 403", service))),
        code => Err(FetchError::TransientNetwork(format!("{} returned HTTP {}", service, code))),
    }
}

// -- Crossref --

#[derive(Debug, Deserialize)]
struct CrossrefResponse {
    message: CrossrefMessage,
}

#[derive(Debug, Deserialize)]
struct CrossrefMessage {
    #[serde(default)]
    items: Vec<CrossrefItem>,
}

#[derive(Debug, Deserialize)]
struct CrossrefItem {
    #[serde(rename = "DOI")]
    doi: String,
    #[serde(default)]
    title: Vec<String>,
    issued: Option<CrossrefDate>,
}

#[derive(Debug, Deserialize)]
struct CrossrefDate {
    #[serde(rename = "date-parts", default)]
    date_parts: Vec<Vec<Option<i32>>>,
}

/// Parse a Crossref `/works` response body
pub fn parse_crossref(body: &str) -> Result<Vec<IdentifierCandidate>, FetchError> {
    let response: CrossrefResponse = serde_json::from_str(body)
        .map_err(|e| FetchError::ParseInvariantViolation(format!("crossref response: {}", e)))?;

    Ok(response
        .message
        .items
        .into_iter()
        .filter_map(|item| {
            let title = item.title.into_iter().next()?;
            let year = item
                .issued
                .and_then(|d| d.date_parts.into_iter().next())
                .and_then(|parts| parts.into_iter().next().flatten());
            Some(IdentifierCandidate {
                kind: IdentifierKind::Doi,
                value: item.doi,
                title,
                year,
            })
        })
        .collect())
}

/// DOI lookup via the Crossref REST API
pub struct CrossrefLookup {
    client: Client,
    base_url: String,
    mailto: Option<String>,
    timeout: Duration,
}

impl CrossrefLookup {
    pub fn new(timeout: Duration, mailto: Option<String>) -> Result<Self, FetchError> {
        let client =
            create_lookup_client(timeout).map_err(|e| FetchError::TransientNetwork(e.to_string()))?;
        Ok(Self {
            client,
            base_url: "https://api.crossref.org/works".to_string(),
            mailto,
            timeout,
        })
    }
}

#[async_trait]
impl IdentifierLookup for CrossrefLookup {
    fn service(&self) -> &'static str {
        CROSSREF_SERVICE
    }

    fn weight(&self) -> f64 {
        1.0
    }

    async fn search(
        &self,
        title: &str,
        first_author: Option<&str>,
    ) -> Result<Vec<IdentifierCandidate>, FetchError> {
        let mut url = format!(
            "{}?query.bibliographic={}&rows={}&select=DOI,title,issued",
            self.base_url,
            urlencoding::encode(title),
            MAX_CANDIDATES
        );
        if let Some(author) = first_author {
            url.push_str(&format!("&query.author={}", urlencoding::encode(author)));
        }
        if let Some(mailto) = &self.mailto {
            url.push_str(&format!("&mailto={}", urlencoding::encode(mailto)));
        }

        debug!("Crossref lookup: {}", url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| map_transport_error(CROSSREF_SERVICE, self.timeout, e))?;
        check_status(CROSSREF_SERVICE, response.status())?;
        let body = response
            .text()
            .await
            .map_err(|e| map_transport_error(CROSSREF_SERVICE, self.timeout, e))?;

        parse_crossref(&body)
    }
}

// -- arXiv --

static ENTRY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<entry>(.*?)</entry>").unwrap());
static ENTRY_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<id>\s*https?://arxiv\.org/abs/([^<\s]+)\s*</id>").unwrap());
static ENTRY_TITLE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<title>(.*?)</title>").unwrap());
static ENTRY_PUBLISHED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<published>\s*(\d{4})-").unwrap());

/// Parse an arXiv Atom feed
pub fn parse_arxiv_feed(body: &str) -> Vec<IdentifierCandidate> {
    ENTRY
        .captures_iter(body)
        .filter_map(|entry| {
            let entry = entry.get(1)?.as_str();
            let id = ENTRY_ID.captures(entry)?.get(1)?.as_str().to_string();
            let title = ENTRY_TITLE
                .captures(entry)?
                .get(1)?
                .as_str()
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ");
            let year = ENTRY_PUBLISHED
                .captures(entry)
                .and_then(|c| c.get(1))
                .and_then(|y| y.as_str().parse().ok());
            Some(IdentifierCandidate {
                kind: IdentifierKind::Arxiv,
                value: id,
                title,
                year,
            })
        })
        .collect()
}

/// arXiv id lookup via the export API
pub struct ArxivLookup {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl ArxivLookup {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client =
            create_lookup_client(timeout).map_err(|e| FetchError::TransientNetwork(e.to_string()))?;
        Ok(Self {
            client,
            base_url: "https://export.arxiv.org/api/query".to_string(),
            timeout,
        })
    }
}

#[async_trait]
impl IdentifierLookup for ArxivLookup {
    fn service(&self) -> &'static str {
        ARXIV_SERVICE
    }

    fn weight(&self) -> f64 {
        0.95
    }

    async fn search(
        &self,
        title: &str,
        first_author: Option<&str>,
    ) -> Result<Vec<IdentifierCandidate>, FetchError> {
        let cleaned: String = title
            .chars()
            .map(|c| if c.is_alphanumeric() || c.is_whitespace() { c } else { ' ' })
            .collect();
        let mut query = format!("ti:\"{}\"", cleaned.split_whitespace().collect::<Vec<_>>().join(" "));
        if let Some(author) = first_author.and_then(|a| a.split_whitespace().last()) {
            query.push_str(&format!(" AND au:{}", author));
        }
        let url = format!(
            "{}?search_query={}&max_results={}",
            self.base_url,
            urlencoding::encode(&query),
            MAX_CANDIDATES
        );

        debug!("arXiv lookup: {}", url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| map_transport_error(ARXIV_SERVICE, self.timeout, e))?;
        check_status(ARXIV_SERVICE, response.status())?;
        let body = response
            .text()
            .await
            .map_err(|e| map_transport_error(ARXIV_SERVICE, self.timeout, e))?;

        Ok(parse_arxiv_feed(&body))
    }
}
