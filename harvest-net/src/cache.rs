//! Bounded TTL response cache

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

struct Entry<T> {
    value: T,
    expires_at: DateTime<Utc>,
    seq: u64,
}

struct Inner<T> {
    entries: HashMap<String, Entry<T>>,
    /// Insertion order as (key, seq); stale pairs are skipped on eviction
    order: VecDeque<(String, u64)>,
    next_seq: u64,
}

/// Response cache keyed by request fingerprint.
///
/// Entries expire after the TTL; when the bound is reached the oldest
/// insertion is evicted first.
pub struct ResponseCache<T> {
    ttl: chrono::Duration,
    max_entries: usize,
    inner: Mutex<Inner<T>>,
}

impl<T: Clone> ResponseCache<T> {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500)),
            max_entries,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
                next_seq: 0,
            }),
        }
    }

    /// Fresh value for `key`; expired entries are removed on access
    pub fn get(&self, key: &str, now: DateTime<Utc>) -> Option<T> {
        let mut inner = self.inner.lock();
        match inner.entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
            Some(_) => {
                inner.entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: &str, value: T, now: DateTime<Utc>) {
        if self.max_entries == 0 || self.ttl <= chrono::Duration::zero() {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.entries.len() >= self.max_entries {
            // expired entries go before anything live is evicted
            inner.entries.retain(|_, entry| entry.expires_at > now);
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: now + self.ttl,
                seq,
            },
        );
        inner.order.push_back((key.to_string(), seq));

        while inner.entries.len() > self.max_entries {
            let Some((oldest, oldest_seq)) = inner.order.pop_front() else {
                break;
            };
            if inner.entries.get(&oldest).is_some_and(|e| e.seq == oldest_seq) {
                inner.entries.remove(&oldest);
            }
        }

        // keep the order queue from growing past live entries by much
        if inner.order.len() > self.max_entries.saturating_mul(2) {
            let Inner { entries, order, .. } = &mut *inner;
            order.retain(|(k, s)| entries.get(k).is_some_and(|e| e.seq == *s));
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
