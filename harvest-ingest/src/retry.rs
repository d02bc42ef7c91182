//! Bounded per-page retry state machine
//!
//! Network errors and rate limits have separate budgets: waiting out a rate
//! limit never consumes the network retry budget and vice versa.

use std::time::Duration;

use harvest_core::{FetchError, IngestionConfig};

/// What to do with the outcome of one attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Success,
    RetryNetwork { delay: Duration },
    RetryRateLimited { delay: Duration },
    /// Give up on this scholar for the current run
    Fatal,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub network_max_retries: u32,
    pub network_backoff: Duration,
    pub rate_limit_max_retries: u32,
    pub rate_limit_backoff: Duration,
    pub max_backoff: Duration,
}

impl From<&IngestionConfig> for RetryPolicy {
    fn from(config: &IngestionConfig) -> Self {
        Self {
            network_max_retries: config.network_max_retries,
            network_backoff: Duration::from_secs(config.network_backoff_secs),
            rate_limit_max_retries: config.rate_limit_max_retries,
            rate_limit_backoff: Duration::from_secs(config.rate_limit_backoff_secs),
            max_backoff: Duration::from_secs(config.max_backoff_secs),
        }
    }
}

/// Retry counters for one page acquisition
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: RetryPolicy,
    network_attempts: u32,
    rate_limit_attempts: u32,
}

impl RetryState {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            network_attempts: 0,
            rate_limit_attempts: 0,
        }
    }

    /// Classify an attempt's result, consuming retry budget as needed
    pub fn classify<T>(&mut self, result: &Result<T, FetchError>) -> RetryDecision {
        let err = match result {
            Ok(_) => return RetryDecision::Success,
            Err(err) => err,
        };

        match err {
            FetchError::RateLimited { .. } => {
                if self.rate_limit_attempts >= self.policy.rate_limit_max_retries {
                    return RetryDecision::Fatal;
                }
                self.rate_limit_attempts += 1;
                let factor = 2u32.saturating_pow(self.rate_limit_attempts - 1);
                let delay = self
                    .policy
                    .rate_limit_backoff
                    .saturating_mul(factor)
                    .min(self.policy.max_backoff);
                RetryDecision::RetryRateLimited { delay }
            }
            e if e.counts_as_network() => {
                if self.network_attempts >= self.policy.network_max_retries {
                    return RetryDecision::Fatal;
                }
                self.network_attempts += 1;
                let delay = self
                    .policy
                    .network_backoff
                    .saturating_mul(self.network_attempts)
                    .min(self.policy.max_backoff);
                RetryDecision::RetryNetwork { delay }
            }
            _ => RetryDecision::Fatal,
        }
    }

    pub fn network_attempts(&self) -> u32 {
        self.network_attempts
    }

    pub fn rate_limit_attempts(&self) -> u32 {
        self.rate_limit_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            network_max_retries: 2,
            network_backoff: Duration::from_secs(5),
            rate_limit_max_retries: 3,
            rate_limit_backoff: Duration::from_secs(60),
            max_backoff: Duration::from_secs(200),
        }
    }

    fn network() -> Result<(), FetchError> {
        Err(FetchError::TransientNetwork("reset".into()))
    }

    fn limited() -> Result<(), FetchError> {
        Err(FetchError::RateLimited {
            service: "scholar_profile".into(),
        })
    }

    #[test]
    fn test_network_backoff_is_linear_and_bounded() {
        let mut state = RetryState::new(policy());
        assert_eq!(
            state.classify(&network()),
            RetryDecision::RetryNetwork { delay: Duration::from_secs(5) }
        );
        assert_eq!(
            state.classify(&network()),
            RetryDecision::RetryNetwork { delay: Duration::from_secs(10) }
        );
        assert_eq!(state.classify(&network()), RetryDecision::Fatal);
    }

    #[test]
    fn test_rate_limit_backoff_is_exponential_and_capped() {
        let mut state = RetryState::new(policy());
        let delays: Vec<_> = (0..3)
            .map(|_| match state.classify(&limited()) {
                RetryDecision::RetryRateLimited { delay } => delay,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(
            delays,
            vec![Duration::from_secs(60), Duration::from_secs(120), Duration::from_secs(200)]
        );
        assert_eq!(state.classify(&limited()), RetryDecision::Fatal);
    }

    #[test]
    fn test_budgets_are_independent() {
        let mut state = RetryState::new(policy());
        state.classify(&limited());
        state.classify(&limited());
        assert!(matches!(state.classify(&network()), RetryDecision::RetryNetwork { .. }));
        assert_eq!(state.network_attempts(), 1);
        assert_eq!(state.rate_limit_attempts(), 2);
    }

    #[test]
    fn test_blocked_and_layout_are_fatal() {
        let mut state = RetryState::new(policy());
        let blocked: Result<(), _> = Err(FetchError::UpstreamBlocked("captcha".into()));
        let layout: Result<(), _> = Err(FetchError::LayoutChanged("gone".into()));
        assert_eq!(state.classify(&blocked), RetryDecision::Fatal);
        assert_eq!(state.classify(&layout), RetryDecision::Fatal);
        assert_eq!(state.classify(&Ok::<_, FetchError>(())), RetryDecision::Success);
    }
}
