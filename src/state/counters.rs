//! Sliding-window event counters, keyed by (source IP, counter kind).
//!
//! Counts only mean anything inside a live window: the engine prunes a kind
//! before folding new events into it, so a counter that went quiet past its
//! window restarts from 1 instead of resuming a stale total.

use crate::state::{load_jsonl, save_jsonl};
use crate::{CounterKind, SentryResult};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;

/// One persisted counter row.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CounterRecord {
    ip: IpAddr,
    kind: CounterKind,
    count: u64,
    last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct WindowCounter {
    count: u64,
    last_seen: DateTime<Utc>,
}

/// In-memory counter store, loaded from and persisted to one JSONL file.
pub struct CounterStore {
    counters: HashMap<(IpAddr, CounterKind), WindowCounter>,
}

impl CounterStore {
    pub fn new() -> Self {
        Self {
            counters: HashMap::new(),
        }
    }

    pub fn load(path: &Path) -> SentryResult<Self> {
        let records: Vec<CounterRecord> = load_jsonl(path)?;
        let mut counters = HashMap::new();
        for r in records {
            counters.insert(
                (r.ip, r.kind),
                WindowCounter {
                    count: r.count,
                    last_seen: r.last_seen,
                },
            );
        }
        Ok(Self { counters })
    }

    pub fn persist(&self, path: &Path) -> SentryResult<()> {
        let records: Vec<CounterRecord> = self
            .counters
            .iter()
            .map(|(&(ip, kind), c)| CounterRecord {
                ip,
                kind,
                count: c.count,
                last_seen: c.last_seen,
            })
            .collect();
        save_jsonl(path, &records)
    }

    /// Bump the counter for (ip, kind) and return the new count.
    /// Callers must prune the kind first so stale counters restart at 1.
    pub fn increment(&mut self, ip: IpAddr, kind: CounterKind, now: DateTime<Utc>) -> u64 {
        let counter = self
            .counters
            .entry((ip, kind))
            .and_modify(|c| {
                c.count += 1;
                c.last_seen = now;
            })
            .or_insert(WindowCounter {
                count: 1,
                last_seen: now,
            });
        counter.count
    }

    pub fn count(&self, ip: IpAddr, kind: CounterKind) -> u64 {
        self.counters.get(&(ip, kind)).map(|c| c.count).unwrap_or(0)
    }

    /// Drop every counter of `kind` whose last event is older than `window`.
    /// Returns how many were dropped.
    pub fn prune(&mut self, kind: CounterKind, window: Duration, now: DateTime<Utc>) -> usize {
        let before = self.counters.len();
        self.counters
            .retain(|&(_, k), c| k != kind || now - c.last_seen <= window);
        before - self.counters.len()
    }

    /// IPs of `kind` strictly over `limit`, with their counts.
    pub fn over_limit(&self, kind: CounterKind, limit: u64) -> Vec<(IpAddr, u64)> {
        let mut hits: Vec<(IpAddr, u64)> = self
            .counters
            .iter()
            .filter(|(&(_, k), c)| k == kind && c.count > limit)
            .map(|(&(ip, _), c)| (ip, c.count))
            .collect();
        hits.sort_by_key(|&(ip, _)| ip);
        hits
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

impl Default for CounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_increment_counts_distinct_events() {
        let mut store = CounterStore::new();
        let now = Utc::now();

        for i in 1..=7u64 {
            let count = store.increment(ip("10.0.0.9"), CounterKind::Anonymous, now);
            assert_eq!(count, i);
        }
        assert_eq!(store.count(ip("10.0.0.9"), CounterKind::Anonymous), 7);
        // Different kind for the same IP is a different counter.
        assert_eq!(store.count(ip("10.0.0.9"), CounterKind::LoginFailure), 0);
    }

    #[test]
    fn test_prune_clears_expired_counters() {
        let mut store = CounterStore::new();
        let start = Utc::now();

        store.increment(ip("10.0.0.9"), CounterKind::Anonymous, start);
        store.increment(ip("10.0.0.10"), CounterKind::Anonymous, start);

        // Past the window: both counters drop to absent.
        let later = start + Duration::seconds(901);
        let dropped = store.prune(CounterKind::Anonymous, Duration::seconds(900), later);
        assert_eq!(dropped, 2);
        assert_eq!(store.count(ip("10.0.0.9"), CounterKind::Anonymous), 0);
    }

    #[test]
    fn test_revived_counter_starts_from_one() {
        let mut store = CounterStore::new();
        let start = Utc::now();
        let window = Duration::seconds(900);

        for _ in 0..5 {
            store.increment(ip("10.0.0.9"), CounterKind::LoginFailure, start);
        }

        let later = start + Duration::seconds(1000);
        store.prune(CounterKind::LoginFailure, window, later);
        let count = store.increment(ip("10.0.0.9"), CounterKind::LoginFailure, later);
        assert_eq!(count, 1, "revival after expiry must not resume the stale total");
    }

    #[test]
    fn test_prune_only_touches_the_given_kind() {
        let mut store = CounterStore::new();
        let start = Utc::now();

        store.increment(ip("10.0.0.9"), CounterKind::Anonymous, start);
        store.increment(ip("10.0.0.9"), CounterKind::LoginFailure, start);

        let later = start + Duration::seconds(1000);
        store.prune(CounterKind::Anonymous, Duration::seconds(900), later);
        assert_eq!(store.count(ip("10.0.0.9"), CounterKind::Anonymous), 0);
        assert_eq!(store.count(ip("10.0.0.9"), CounterKind::LoginFailure), 1);
    }

    #[test]
    fn test_over_limit_is_strict() {
        let mut store = CounterStore::new();
        let now = Utc::now();

        for _ in 0..5 {
            store.increment(ip("10.0.0.5"), CounterKind::LoginFailure, now);
        }
        for _ in 0..6 {
            store.increment(ip("10.0.0.6"), CounterKind::LoginFailure, now);
        }

        // count > limit, not >=: exactly at the limit is still allowed.
        let hits = store.over_limit(CounterKind::LoginFailure, 5);
        assert_eq!(hits, vec![(ip("10.0.0.6"), 6)]);
    }

    #[test]
    fn test_persist_and_reload() {
        let dir = std::env::temp_dir().join("kittylog-sentry-counters");
        std::fs::create_dir_all(&dir).expect("create test dir");
        let path = dir.join("counters.jsonl");
        let _ = std::fs::remove_file(&path);

        let now = Utc::now();
        let mut store = CounterStore::new();
        for _ in 0..3 {
            store.increment(ip("203.0.113.5"), CounterKind::Anonymous, now);
        }
        store.increment(ip("203.0.113.6"), CounterKind::LoginFailure, now);
        store.persist(&path).expect("persist");

        let back = CounterStore::load(&path).expect("load");
        assert_eq!(back.len(), 2);
        assert_eq!(back.count(ip("203.0.113.5"), CounterKind::Anonymous), 3);
        assert_eq!(back.count(ip("203.0.113.6"), CounterKind::LoginFailure), 1);

        let _ = std::fs::remove_file(&path);
    }
}
