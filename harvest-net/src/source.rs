//! Primary-source page fetching
//!
//! [`SourceFetcher`] is the seam the iteration engine fetches through; the
//! HTTP implementation requests one profile page per call and reports the raw
//! status and body. Interpreting the body is the parser's job.

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use harvest_core::{FetchError, HttpConfig, SCHOLAR_SERVICE};

use crate::create_source_client;

/// Base URL of the profile listing
pub const PROFILE_BASE_URL: &str = "https://scholar.google.com/citations";

/// One fetched profile page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    pub scholar_id: String,
    pub cstart: u32,
    pub page_size: u32,
    /// HTTP status code
    pub status: u16,
    /// Raw response body
    pub payload: String,
}

impl FetchedPage {
    pub fn new(scholar_id: &str, cstart: u32, page_size: u32, status: u16, payload: String) -> Self {
        Self {
            scholar_id: scholar_id.to_string(),
            cstart,
            page_size,
            status,
            payload,
        }
    }
}

/// Fetches profile pages from the primary source
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Fetch the page starting at record offset `cstart`.
    /// Transport failures are typed; non-2xx statuses are returned as pages.
    async fn fetch_page(
        &self,
        scholar_id: &str,
        cstart: u32,
        page_size: u32,
    ) -> Result<FetchedPage, FetchError>;
}

/// Build the profile page URL
pub fn profile_url(base_url: &str, scholar_id: &str, cstart: u32, page_size: u32) -> String {
    format!(
        "{}?hl=en&user={}&cstart={}&pagesize={}&sortby=pubdate",
        base_url,
        urlencoding::encode(scholar_id),
        cstart,
        page_size
    )
}

/// Map a reqwest failure onto the shared error taxonomy
pub(crate) fn map_transport_error(service: &str, timeout: Duration, err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout {
            service: service.to_string(),
            secs: timeout.as_secs(),
        }
    } else {
        FetchError::TransientNetwork(err.to_string())
    }
}

/// HTTP fetcher for the primary source
pub struct HttpSourceFetcher {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl HttpSourceFetcher {
    pub fn new(config: &HttpConfig, timeout: Duration) -> Result<Self, FetchError> {
        let client = create_source_client(config, timeout)
            .map_err(|e| FetchError::TransientNetwork(e.to_string()))?;
        Ok(Self {
            client,
            base_url: PROFILE_BASE_URL.to_string(),
            timeout,
        })
    }

    /// Point the fetcher at a different host (mirrors, local fixtures)
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl SourceFetcher for HttpSourceFetcher {
    async fn fetch_page(
        &self,
        scholar_id: &str,
        cstart: u32,
        page_size: u32,
    ) -> Result<FetchedPage, FetchError> {
        let url = profile_url(&self.base_url, scholar_id, cstart, page_size);
        debug!("Fetching profile page: {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| map_transport_error(SCHOLAR_SERVICE, self.timeout, e))?;

        let status = response.status().as_u16();
        let payload = response
            .text()
            .await
            .map_err(|e| map_transport_error(SCHOLAR_SERVICE, self.timeout, e))?;

        debug!(scholar_id, cstart, status, bytes = payload.len(), "Profile page fetched");
        Ok(FetchedPage::new(scholar_id, cstart, page_size, status, payload))
    }
}
