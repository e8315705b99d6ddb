//! The ban ledger: one record per banned IP.
//!
//! The ledger is what makes ban handling idempotent across passes. It gates
//! duplicate BAN decision lines (re-emit TTL), remembers which remote rule
//! enforces each ban, and drives the expiry sweep. Records outlive
//! enforcement failures; a record with no rule id is a ban the edge firewall
//! has not caught up with yet.
//!
//! Copyright (c) 2026 CIPS Corps. All rights reserved.

use crate::state::{load_jsonl, save_jsonl};
use crate::{BanReason, SentryResult};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;

/// One banned IP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanRecord {
    pub ip: IpAddr,

    /// Which threshold put the IP here.
    pub reason: BanReason,

    /// When the last BAN decision line for this IP was emitted. Expiry and
    /// the re-emit gate both measure from here.
    pub last_banned_at: DateTime<Utc>,

    /// Identifier of the remote block rule, once enforcement has succeeded
    /// (or discovered an equivalent existing rule).
    pub rule_id: Option<String>,
}

pub struct BanLedger {
    bans: HashMap<IpAddr, BanRecord>,
}

impl BanLedger {
    pub fn new() -> Self {
        Self {
            bans: HashMap::new(),
        }
    }

    pub fn load(path: &Path) -> SentryResult<Self> {
        let records: Vec<BanRecord> = load_jsonl(path)?;
        let mut bans = HashMap::new();
        for r in records {
            bans.insert(r.ip, r);
        }
        Ok(Self { bans })
    }

    pub fn persist(&self, path: &Path) -> SentryResult<()> {
        let mut records: Vec<&BanRecord> = self.bans.values().collect();
        records.sort_by_key(|r| r.ip);
        save_jsonl(path, records.into_iter())
    }

    pub fn get(&self, ip: IpAddr) -> Option<&BanRecord> {
        self.bans.get(&ip)
    }

    /// Register a threshold breach for `ip`. Returns true when a BAN decision
    /// line should be emitted: either no record existed, or the previous one
    /// is at least `reemit_ttl` old. Within the gate the existing record is
    /// left untouched (so sustained abuse cannot postpone expiry forever).
    pub fn record_ban(
        &mut self,
        ip: IpAddr,
        reason: BanReason,
        now: DateTime<Utc>,
        reemit_ttl: Duration,
    ) -> bool {
        match self.bans.get_mut(&ip) {
            None => {
                self.bans.insert(
                    ip,
                    BanRecord {
                        ip,
                        reason,
                        last_banned_at: now,
                        rule_id: None,
                    },
                );
                true
            }
            Some(record) if now - record.last_banned_at >= reemit_ttl => {
                record.reason = reason;
                record.last_banned_at = now;
                true
            }
            Some(_) => false,
        }
    }

    /// Attach the remote rule id acquired for an existing ban.
    pub fn set_rule_id(&mut self, ip: IpAddr, rule_id: String) {
        if let Some(record) = self.bans.get_mut(&ip) {
            record.rule_id = Some(rule_id);
        }
    }

    /// Remove and return every record older than `duration`.
    pub fn take_expired(&mut self, now: DateTime<Utc>, duration: Duration) -> Vec<BanRecord> {
        let expired_ips: Vec<IpAddr> = self
            .bans
            .values()
            .filter(|r| now - r.last_banned_at > duration)
            .map(|r| r.ip)
            .collect();

        let mut expired: Vec<BanRecord> = expired_ips
            .into_iter()
            .filter_map(|ip| self.bans.remove(&ip))
            .collect();
        expired.sort_by_key(|r| r.ip);
        expired
    }

    /// IPs banned but not yet backed by a remote rule, oldest first. These
    /// are the enforcement retries for the next sweep.
    pub fn missing_rule_ids(&self) -> Vec<IpAddr> {
        let mut missing: Vec<(DateTime<Utc>, IpAddr)> = self
            .bans
            .values()
            .filter(|r| r.rule_id.is_none())
            .map(|r| (r.last_banned_at, r.ip))
            .collect();
        missing.sort();
        missing.into_iter().map(|(_, ip)| ip).collect()
    }

    pub fn records(&self) -> impl Iterator<Item = &BanRecord> {
        self.bans.values()
    }

    pub fn len(&self) -> usize {
        self.bans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bans.is_empty()
    }
}

impl Default for BanLedger {
    fn default() -> Self {
        Self::new()
    }
}
