//! Trusted-source tracking: a static always-trusted set overlaid with
//! per-IP time-limited grants.
//!
//! Dynamic entries are created or refreshed whenever an IP shows
//! authenticated activity and expire `ttl` after the last grant. The static
//! set comes from a plain-text file and never expires. Whitelisting gates ban
//! evaluation only; it never touches the ban ledger.

use crate::state::{load_jsonl, save_jsonl};
use crate::SentryResult;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::Path;

/// One persisted dynamic-whitelist row.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WhitelistRecord {
    ip: IpAddr,
    user: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct DynamicEntry {
    user: String,
    expires_at: DateTime<Utc>,
}

pub struct Whitelist {
    static_set: HashSet<IpAddr>,
    dynamic: HashMap<IpAddr, DynamicEntry>,
}

impl Whitelist {
    pub fn new() -> Self {
        Self {
            static_set: HashSet::new(),
            dynamic: HashMap::new(),
        }
    }

    /// Load dynamic entries from the JSONL state file and the static set
    /// from the configured plain-text file. Either file may be absent.
    pub fn load(state_path: &Path, static_file: &Path) -> SentryResult<Self> {
        let records: Vec<WhitelistRecord> = load_jsonl(state_path)?;
        let mut dynamic = HashMap::new();
        for r in records {
            dynamic.insert(
                r.ip,
                DynamicEntry {
                    user: r.user,
                    expires_at: r.expires_at,
                },
            );
        }

        Ok(Self {
            static_set: load_static_set(static_file),
            dynamic,
        })
    }

    pub fn persist(&self, state_path: &Path) -> SentryResult<()> {
        let records: Vec<WhitelistRecord> = self
            .dynamic
            .iter()
            .map(|(&ip, e)| WhitelistRecord {
                ip,
                user: e.user.clone(),
                expires_at: e.expires_at,
            })
            .collect();
        save_jsonl(state_path, &records)
    }

    /// True iff the IP is in the static set or holds an unexpired grant.
    pub fn is_trusted(&self, ip: IpAddr, now: DateTime<Utc>) -> bool {
        if self.static_set.contains(&ip) {
            return true;
        }
        self.dynamic
            .get(&ip)
            .map(|e| e.expires_at > now)
            .unwrap_or(false)
    }

    /// Create or refresh the grant for an IP that showed authenticated
    /// activity.
    pub fn grant(&mut self, ip: IpAddr, user: &str, now: DateTime<Utc>, ttl: Duration) {
        let expires_at = now + ttl;
        match self.dynamic.insert(
            ip,
            DynamicEntry {
                user: user.to_string(),
                expires_at,
            },
        ) {
            None => log::info!("Whitelist add: {} (user {}, until {})", ip, user, expires_at),
            Some(_) => log::debug!("Whitelist refresh: {} (user {}, until {})", ip, user, expires_at),
        }
    }

    /// Drop expired dynamic grants. Returns how many were dropped.
    pub fn prune_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.dynamic.len();
        self.dynamic.retain(|_, e| e.expires_at > now);
        before - self.dynamic.len()
    }

    pub fn static_len(&self) -> usize {
        self.static_set.len()
    }

    pub fn dynamic_len(&self) -> usize {
        self.dynamic.len()
    }
}

impl Default for Whitelist {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse the static whitelist file: one IP per line, `#` comments and blank
/// lines ignored, anything unparseable skipped with a warning.
fn load_static_set(path: &Path) -> HashSet<IpAddr> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return HashSet::new(),
    };

    let mut set = HashSet::new();
    for (lineno, raw) in content.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        match line.parse::<IpAddr>() {
            Ok(ip) => {
                set.insert(ip);
            }
            Err(_) => {
                log::warn!(
                    "Skipping malformed static-whitelist line {}:{}: {:?}",
                    path.display(),
                    lineno + 1,
                    raw,
                );
            }
        }
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("kittylog-sentry-whitelist").join(name);
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).expect("create test dir");
        dir
    }

    #[test]
    fn test_grant_trusts_until_ttl() {
        let mut wl = Whitelist::new();
        let now = Utc::now();
        let ttl = Duration::seconds(3600);

        assert!(!wl.is_trusted(ip("203.0.113.9"), now));
        wl.grant(ip("203.0.113.9"), "alice", now, ttl);
        assert!(wl.is_trusted(ip("203.0.113.9"), now));
        assert!(wl.is_trusted(ip("203.0.113.9"), now + Duration::seconds(3599)));
        assert!(!wl.is_trusted(ip("203.0.113.9"), now + Duration::seconds(3600)));
    }

    #[test]
    fn test_refresh_extends_the_grant() {
        let mut wl = Whitelist::new();
        let now = Utc::now();
        let ttl = Duration::seconds(3600);

        wl.grant(ip("203.0.113.9"), "alice", now, ttl);
        wl.grant(ip("203.0.113.9"), "alice", now + Duration::seconds(3000), ttl);
        assert!(wl.is_trusted(ip("203.0.113.9"), now + Duration::seconds(6000)));
        assert_eq!(wl.dynamic_len(), 1);
    }

    #[test]
    fn test_prune_drops_only_expired_grants() {
        let mut wl = Whitelist::new();
        let now = Utc::now();

        wl.grant(ip("203.0.113.9"), "alice", now, Duration::seconds(10));
        wl.grant(ip("203.0.113.10"), "bob", now, Duration::seconds(1000));

        let dropped = wl.prune_expired(now + Duration::seconds(60));
        assert_eq!(dropped, 1);
        assert!(!wl.is_trusted(ip("203.0.113.9"), now + Duration::seconds(60)));
        assert!(wl.is_trusted(ip("203.0.113.10"), now + Duration::seconds(60)));
    }

    #[test]
    fn test_static_entries_never_expire() {
        let dir = test_dir("static");
        let static_file = dir.join("whitelist.txt");
        std::fs::write(
            &static_file,
            "# home connections\n192.0.2.40\n2001:db8::1  # office\n\nnot an ip\n",
        )
        .expect("write static file");

        let wl = Whitelist::load(&dir.join("dynamic.jsonl"), &static_file).expect("load");
        assert_eq!(wl.static_len(), 2);

        let far_future = Utc::now() + Duration::days(3650);
        assert!(wl.is_trusted(ip("192.0.2.40"), far_future));
        assert!(wl.is_trusted(ip("2001:db8::1"), far_future));
        assert!(!wl.is_trusted(ip("192.0.2.41"), far_future));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_persist_and_reload() {
        let dir = test_dir("roundtrip");
        let state_path = dir.join("whitelist.jsonl");
        let now = Utc::now();

        let mut wl = Whitelist::new();
        wl.grant(ip("203.0.113.9"), "alice", now, Duration::seconds(3600));
        wl.persist(&state_path).expect("persist");

        let back = Whitelist::load(&state_path, &dir.join("absent.txt")).expect("load");
        assert_eq!(back.dynamic_len(), 1);
        assert!(back.is_trusted(ip("203.0.113.9"), now + Duration::seconds(60)));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
