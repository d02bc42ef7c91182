//! Rate-limited gateway
//!
//! Every outbound request to an external service goes through a [`Gateway`]:
//!
//! 1. cache lookup by request fingerprint
//! 2. coalescing onto an identical in-flight request
//! 3. global throttle slot from the [`ThrottleStore`]
//! 4. dispatch under the request timeout
//!
//! A rate-limit outcome puts the whole service into cooldown, so every later
//! caller waits for `cooldown_until` before dispatching.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use harvest_core::{Clock, EventSink, FetchError, GatewayConfig, LifecycleEvent};

use crate::throttle::{chrono_duration, sleep_until};
use crate::{ResponseCache, ThrottleStore};

/// Normalized description of one outbound request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub service: String,
    pub operation: String,
    pub params: BTreeMap<String, String>,
}

impl RequestKey {
    pub fn new(service: &str, operation: &str) -> Self {
        Self {
            service: service.to_string(),
            operation: operation.to_string(),
            params: BTreeMap::new(),
        }
    }

    /// Add a parameter; keys are lower-cased, values trimmed and whitespace-collapsed
    pub fn param(mut self, key: &str, value: impl ToString) -> Self {
        let value = value.to_string();
        self.params.insert(
            key.trim().to_lowercase(),
            value.split_whitespace().collect::<Vec<_>>().join(" "),
        );
        self
    }

    /// SHA-256 over service, operation and sorted parameters
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.service.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.operation.as_bytes());
        for (key, value) in &self.params {
            hasher.update(b"\n");
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Where a gateway response came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Network,
    Cache,
    Coalesced,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayResponse<T> {
    pub value: T,
    pub source: ResponseSource,
}

type SharedCall<T> = Shared<BoxFuture<'static, Result<T, FetchError>>>;

/// Gateway for one external service
pub struct Gateway<T> {
    service: String,
    config: GatewayConfig,
    throttle: Arc<dyn ThrottleStore>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    cache: Arc<ResponseCache<T>>,
    in_flight: Arc<DashMap<String, SharedCall<T>>>,
}

impl<T> Gateway<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(
        service: &str,
        config: GatewayConfig,
        throttle: Arc<dyn ThrottleStore>,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let cache = Arc::new(ResponseCache::new(config.cache_ttl(), config.cache_max_entries));
        Self {
            service: service.to_string(),
            config,
            throttle,
            clock,
            events,
            cache,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }

    pub fn in_flight_requests(&self) -> usize {
        self.in_flight.len()
    }

    /// Service-wide cooldown currently in force, if any
    pub fn cooldown_until(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        let state = self.throttle.snapshot(&self.service);
        state.cooldown_until.filter(|until| *until > self.clock.now())
    }

    /// Issue (or reuse) the request described by `key`.
    ///
    /// `dispatch` performs the actual network work and is only invoked when
    /// neither the cache nor an in-flight request can answer.
    pub async fn call<F, Fut>(
        &self,
        key: &RequestKey,
        dispatch: F,
    ) -> Result<GatewayResponse<T>, FetchError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let fingerprint = key.fingerprint();

        if let Some(value) = self.cache.get(&fingerprint, self.clock.now()) {
            self.emit_cache_hit(&fingerprint);
            return Ok(GatewayResponse {
                value,
                source: ResponseSource::Cache,
            });
        }

        let (call, source) = match self.in_flight.entry(fingerprint.clone()) {
            Entry::Occupied(entry) => {
                debug!(service = %self.service, %fingerprint, "Coalescing onto in-flight request");
                self.events.emit(LifecycleEvent::GatewayCoalesced {
                    service: self.service.clone(),
                    fingerprint: fingerprint.clone(),
                });
                (entry.get().clone(), ResponseSource::Coalesced)
            }
            Entry::Vacant(entry) => {
                // an identical call may have completed since the first lookup
                if let Some(value) = self.cache.get(&fingerprint, self.clock.now()) {
                    drop(entry);
                    self.emit_cache_hit(&fingerprint);
                    return Ok(GatewayResponse {
                        value,
                        source: ResponseSource::Cache,
                    });
                }
                self.events.emit(LifecycleEvent::GatewayCacheMiss {
                    service: self.service.clone(),
                    fingerprint: fingerprint.clone(),
                });
                let call = self.start_call(fingerprint.clone(), dispatch);
                entry.insert(call.clone());
                (call, ResponseSource::Network)
            }
        };

        let value = call.await?;
        Ok(GatewayResponse { value, source })
    }

    fn emit_cache_hit(&self, fingerprint: &str) {
        debug!(service = %self.service, %fingerprint, "Gateway cache hit");
        self.events.emit(LifecycleEvent::GatewayCacheHit {
            service: self.service.clone(),
            fingerprint: fingerprint.to_string(),
        });
    }

    /// Spawn the throttled dispatch; the task runs to completion even if every
    /// caller goes away, so its in-flight entry is always removed.
    fn start_call<F, Fut>(&self, fingerprint: String, dispatch: F) -> SharedCall<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let service = self.service.clone();
        let min_interval = self.config.min_interval();
        let timeout = self.config.request_timeout();
        let cooldown = self.config.rate_limit_cooldown();
        let throttle = self.throttle.clone();
        let clock = self.clock.clone();
        let events = self.events.clone();
        let cache = self.cache.clone();
        let in_flight = self.in_flight.clone();
        let task_fingerprint = fingerprint.clone();

        let task = tokio::spawn(async move {
            wait_for_slot(&service, &*throttle, &*clock, min_interval).await;

            let result = match tokio::time::timeout(timeout, dispatch()).await {
                Ok(result) => result,
                Err(_) => Err(FetchError::Timeout {
                    service: service.clone(),
                    secs: timeout.as_secs(),
                }),
            };

            let done = clock.now();
            throttle.release(&service, done, min_interval);
            match &result {
                Ok(value) => cache.insert(&task_fingerprint, value.clone(), done),
                Err(FetchError::RateLimited { .. }) => {
                    let until = done + chrono_duration(cooldown);
                    throttle.enter_cooldown(&service, until);
                    warn!(%service, %until, "Rate limited; service cooling down");
                    events.emit(LifecycleEvent::GatewayCooldown {
                        service: service.clone(),
                        until,
                    });
                }
                Err(err) => debug!(%service, error = %err, "Gateway request failed"),
            }

            in_flight.remove(&task_fingerprint);
            result
        });

        let in_flight = self.in_flight.clone();
        async move {
            match task.await {
                Ok(result) => result,
                Err(join_err) => {
                    in_flight.remove(&fingerprint);
                    Err(FetchError::TransientNetwork(format!(
                        "gateway task failed: {}",
                        join_err
                    )))
                }
            }
        }
        .boxed()
        .shared()
    }
}

/// Reserve a throttle slot, sleep until it, and repeat while a cooldown
/// observed in the meantime is still in force.
async fn wait_for_slot(
    service: &str,
    throttle: &dyn ThrottleStore,
    clock: &dyn Clock,
    min_interval: Duration,
) {
    loop {
        let slot = throttle.reserve(service, clock.now(), min_interval);
        sleep_until(clock, slot).await;

        match throttle.snapshot(service).cooldown_until {
            Some(until) if until > clock.now() => {
                debug!(%service, %until, "Cooldown began while waiting; re-reserving");
            }
            _ => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LocalThrottleStore, TokioClock};
    use harvest_core::RecordingSink;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> GatewayConfig {
        GatewayConfig {
            min_interval_secs: 2.0,
            request_timeout_secs: 10,
            cache_ttl_secs: 60,
            cache_max_entries: 16,
            rate_limit_cooldown_secs: 120,
        }
    }

    fn gateway(sink: Arc<RecordingSink>) -> (Gateway<u32>, Arc<TokioClock>) {
        let clock = Arc::new(TokioClock::new());
        let gateway = Gateway::new(
            "crossref",
            config(),
            Arc::new(LocalThrottleStore::new()),
            clock.clone(),
            sink,
        );
        (gateway, clock)
    }

    #[test]
    fn test_request_key_normalization() {
        let a = RequestKey::new("crossref", "search")
            .param("Title", "  Deep   learning ")
            .param("rows", 5);
        let b = RequestKey::new("crossref", "search")
            .param("rows", "5")
            .param("title", "Deep learning");
        assert_eq!(a.fingerprint(), b.fingerprint());

        let c = RequestKey::new("arxiv", "search").param("title", "Deep learning").param("rows", 5);
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_response_not_reissued_before_ttl() {
        let sink = Arc::new(RecordingSink::new());
        let (gateway, _clock) = gateway(sink.clone());
        let calls = Arc::new(AtomicUsize::new(0));
        let key = RequestKey::new("crossref", "search").param("title", "x");

        for _ in 0..3 {
            let calls = calls.clone();
            gateway
                .call(&key, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(7)
                })
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(sink.count("gateway_cache_hit"), 2);

        tokio::time::sleep(Duration::from_secs(61)).await;
        let calls_after = calls.clone();
        let response = gateway
            .call(&key, move || async move {
                calls_after.fetch_add(1, Ordering::SeqCst);
                Ok(8)
            })
            .await
            .unwrap();
        assert_eq!(response.source, ResponseSource::Network);
        assert_eq!(response.value, 8);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_identical_requests_coalesce() {
        let sink = Arc::new(RecordingSink::new());
        let (gateway, _clock) = gateway(sink.clone());
        let calls = Arc::new(AtomicUsize::new(0));
        let key = RequestKey::new("crossref", "search").param("title", "same");

        let make = |calls: Arc<AtomicUsize>| {
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(42u32)
            }
        };

        let (a, b, c) = tokio::join!(
            gateway.call(&key, make(calls.clone())),
            gateway.call(&key, make(calls.clone())),
            gateway.call(&key, make(calls.clone())),
        );
        let responses = [a.unwrap(), b.unwrap(), c.unwrap()];

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(responses.iter().all(|r| r.value == 42));
        assert_eq!(
            responses.iter().filter(|r| r.source == ResponseSource::Network).count(),
            1
        );
        assert_eq!(sink.count("gateway_coalesced"), 2);
        assert_eq!(gateway.in_flight_requests(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_coalesced_callers_share_failure() {
        let sink = Arc::new(RecordingSink::new());
        let (gateway, _clock) = gateway(sink);
        let key = RequestKey::new("crossref", "search").param("title", "fails");

        let failing = || async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Err::<u32, _>(FetchError::TransientNetwork("reset".into()))
        };
        let (a, b) = tokio::join!(gateway.call(&key, failing), gateway.call(&key, failing));

        assert_eq!(a.unwrap_err(), FetchError::TransientNetwork("reset".into()));
        assert_eq!(b.unwrap_err(), FetchError::TransientNetwork("reset".into()));
        assert_eq!(gateway.cached_entries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_are_spaced_by_min_interval() {
        let sink = Arc::new(RecordingSink::new());
        let (gateway, clock) = gateway(sink);
        let stamps = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for i in 0..3u32 {
            let stamps = stamps.clone();
            let clock = clock.clone();
            let key = RequestKey::new("crossref", "search").param("i", i);
            gateway
                .call(&key, move || async move {
                    stamps.lock().push(clock.now());
                    Ok(i)
                })
                .await
                .unwrap();
        }

        let stamps = stamps.lock();
        for pair in stamps.windows(2) {
            assert!(pair[1] - pair[0] >= chrono::Duration::seconds(2));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_makes_next_caller_wait_for_cooldown() {
        let sink = Arc::new(RecordingSink::new());
        let (gateway, clock) = gateway(sink.clone());

        let limited = gateway
            .call(&RequestKey::new("crossref", "search").param("q", "a"), || async {
                Err::<u32, _>(FetchError::RateLimited {
                    service: "crossref".into(),
                })
            })
            .await;
        assert!(matches!(limited, Err(FetchError::RateLimited { .. })));
        let until = gateway.cooldown_until().expect("cooldown recorded");
        assert_eq!(sink.count("gateway_cooldown"), 1);

        let dispatched_at = Arc::new(parking_lot::Mutex::new(None));
        let recorder = dispatched_at.clone();
        let dispatch_clock = clock.clone();
        gateway
            .call(&RequestKey::new("crossref", "search").param("q", "b"), move || async move {
                *recorder.lock() = Some(dispatch_clock.now());
                Ok(1)
            })
            .await
            .unwrap();

        let dispatched_at = dispatched_at.lock().expect("dispatched");
        assert!(dispatched_at >= until);
        assert!(gateway.cooldown_until().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_timeout() {
        let sink = Arc::new(RecordingSink::new());
        let (gateway, _clock) = gateway(sink);
        let result = gateway
            .call(&RequestKey::new("crossref", "slow"), || async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(1u32)
            })
            .await;
        assert_eq!(
            result.unwrap_err(),
            FetchError::Timeout {
                service: "crossref".into(),
                secs: 10
            }
        );
    }
}
