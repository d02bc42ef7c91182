//! Scholar Harvest network layer
//!
//! Everything that talks to the outside world:
//! - HTTP client construction (proxy, user-agent rotation)
//! - Profile page fetching and parsing
//! - Rate-limited gateway with caching, coalescing and cooldowns
//! - Identifier lookups (Crossref, arXiv)

pub mod cache;
pub mod client;
pub mod gateway;
pub mod lookup;
pub mod parser;
pub mod source;
pub mod throttle;

pub use cache::*;
pub use client::*;
pub use gateway::*;
pub use lookup::*;
pub use parser::*;
pub use source::*;
pub use throttle::*;
