//! HTTP client construction
//!
//! Builds reqwest clients for the harvesting identity, optionally routed
//! through a proxy (SOCKS5h keeps DNS resolution on the proxy side).

use reqwest::{Client, Proxy};
use std::time::Duration;
use thiserror::Error;

use harvest_core::HttpConfig;

/// Errors from client setup
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to build HTTP client: {0}")]
    ClientBuild(String),

    #[error("Invalid proxy address: {0}")]
    InvalidProxy(String),
}

/// User agents for rotation
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/135.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/135.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/135.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:137.0) Gecko/20100101 Firefox/137.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14.7; rv:137.0) Gecko/20100101 Firefox/137.0",
];

/// User agent identifying the harvester to API-style lookup services
pub const LOOKUP_USER_AGENT: &str = concat!("scholar-harvest/", env!("CARGO_PKG_VERSION"));

/// Get a random browser user agent
pub fn random_user_agent() -> &'static str {
    use rand::Rng;
    let idx = rand::thread_rng().gen_range(0..USER_AGENTS.len());
    USER_AGENTS[idx]
}

/// Create the client used against the primary source
pub fn create_source_client(config: &HttpConfig, timeout: Duration) -> Result<Client, ClientError> {
    let user_agent = if config.user_agent_rotation {
        random_user_agent()
    } else {
        USER_AGENTS[0]
    };

    // no cookie jar: every request goes out without session state
    let mut builder = Client::builder().timeout(timeout).user_agent(user_agent);

    if let Some(proxy_addr) = &config.proxy {
        let proxy = Proxy::all(proxy_addr).map_err(|e| ClientError::InvalidProxy(e.to_string()))?;
        builder = builder.proxy(proxy);
    }

    builder.build().map_err(|e| ClientError::ClientBuild(e.to_string()))
}

/// Create the client used against identifier lookup APIs
pub fn create_lookup_client(timeout: Duration) -> Result<Client, ClientError> {
    Client::builder()
        .timeout(timeout)
        .user_agent(LOOKUP_USER_AGENT)
        .build()
        .map_err(|e| ClientError::ClientBuild(e.to_string()))
}
