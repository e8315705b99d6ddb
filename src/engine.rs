//! The pass orchestrator.
//!
//! One pass walks the whole pipeline in a fixed order:
//!
//! 1. prune expired whitelist grants
//! 2. prune expired counters (so revived IPs restart from a clean slate)
//! 3. read + classify new lines from both logs
//! 4. fold every event into counters/whitelist - all folds happen before any
//!    ban decision, so an authenticated request late in the batch still
//!    protects its IP this pass
//! 5. evaluate bans against the thresholds
//! 6. prune counters again (the folds advanced the window)
//! 7. expiry sweep over the ban ledger, plus opportunistic enforcement
//!    retries for live bans still missing a rule id
//! 8. persist all state
//!
//! Everything is synchronous and single-threaded; the only loop-mode
//! suspension point is the inter-pass sleep, with a stop flag checked
//! between passes.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::classifier::{classify, LogKind};
use crate::decision::{DecisionAction, DecisionLog};
use crate::enforce::{Enforcer, EnforcementClient};
use crate::reader::OffsetReader;
use crate::state::bans::BanLedger;
use crate::state::counters::CounterStore;
use crate::state::whitelist::Whitelist;
use crate::{BanReason, CounterKind, EventKind, SentryConfig, SentryResult};

pub fn counters_path(state_dir: &Path) -> PathBuf {
    state_dir.join("counters.jsonl")
}

pub fn whitelist_path(state_dir: &Path) -> PathBuf {
    state_dir.join("whitelist.jsonl")
}

pub fn bans_path(state_dir: &Path) -> PathBuf {
    state_dir.join("bans.jsonl")
}

/// What one pass did, for logging and the `run` command's report.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassSummary {
    /// Events classified out of the new log lines.
    pub events: usize,

    /// BAN decision lines written this pass.
    pub bans_emitted: usize,

    /// Threshold breaches suppressed by the re-emit gate.
    pub bans_suppressed: usize,

    /// Ban records expired (UNBAN lines written).
    pub expired: usize,

    /// Whitelist grants dropped as expired.
    pub whitelist_pruned: usize,

    /// Counters dropped as outside their window.
    pub counters_pruned: usize,
}

/// Source IPs that must never be banned: loopback and unspecified. Private
/// ranges stay bannable - the app regularly fronts a reverse proxy on the
/// same LAN, and an abusive client behind it still shows a private address.
pub fn is_reserved_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_broadcast() || v4.is_unspecified(),
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}

pub struct Engine<C: EnforcementClient> {
    config: SentryConfig,
    reader: OffsetReader,
    counters: CounterStore,
    whitelist: Whitelist,
    bans: BanLedger,
    decisions: DecisionLog,
    enforcer: Option<Enforcer<C>>,
}

impl<C: EnforcementClient> Engine<C> {
    /// Load all persisted state and build the engine. `client` is `None` in
    /// dry-run mode: decisions and the decision log still happen, remote
    /// calls are skipped. An unwritable state directory is fatal here.
    pub fn new(config: SentryConfig, client: Option<C>) -> SentryResult<Self> {
        std::fs::create_dir_all(&config.general.state_dir)?;

        let state_dir = &config.general.state_dir;
        let counters = CounterStore::load(&counters_path(state_dir))?;
        let whitelist = Whitelist::load(&whitelist_path(state_dir), &config.whitelist.static_file)?;
        let bans = BanLedger::load(&bans_path(state_dir))?;
        let decisions = DecisionLog::new(&config.general.decision_log);
        let reader = OffsetReader::new(state_dir);

        log::info!(
            "State loaded: {} counters, {} whitelisted ({} static), {} bans",
            counters.len(),
            whitelist.dynamic_len() + whitelist.static_len(),
            whitelist.static_len(),
            bans.len(),
        );

        Ok(Self {
            config,
            reader,
            counters,
            whitelist,
            bans,
            decisions,
            enforcer: client.map(Enforcer::new),
        })
    }

    pub fn counters(&self) -> &CounterStore {
        &self.counters
    }

    pub fn whitelist(&self) -> &Whitelist {
        &self.whitelist
    }

    pub fn bans(&self) -> &BanLedger {
        &self.bans
    }

    fn anonymous_window(&self) -> Duration {
        Duration::seconds(self.config.thresholds.anonymous_window_secs as i64)
    }

    fn login_failure_window(&self) -> Duration {
        Duration::seconds(self.config.thresholds.login_failure_window_secs as i64)
    }

    /// Run one full pass at the given clock reading.
    pub fn run_pass(&mut self, now: DateTime<Utc>) -> SentryResult<PassSummary> {
        let mut summary = PassSummary::default();

        summary.whitelist_pruned = self.whitelist.prune_expired(now);
        summary.counters_pruned += self
            .counters
            .prune(CounterKind::Anonymous, self.anonymous_window(), now);
        summary.counters_pruned += self
            .counters
            .prune(CounterKind::LoginFailure, self.login_failure_window(), now);

        let mut events = Vec::new();
        let request_log = self.config.logs.request_log.clone();
        for line in self.reader.read_new_lines("requests", &request_log) {
            if let Some(event) = classify(LogKind::Request, &line) {
                events.push(event);
            }
        }
        let auth_log = self.config.logs.auth_log.clone();
        for line in self.reader.read_new_lines("auth", &auth_log) {
            if let Some(event) = classify(LogKind::Auth, &line) {
                events.push(event);
            }
        }
        summary.events = events.len();

        let ttl = Duration::seconds(self.config.whitelist.ttl_secs as i64);
        for event in &events {
            match event.kind {
                EventKind::AnonymousRequest => {
                    self.counters.increment(event.ip, CounterKind::Anonymous, now);
                }
                EventKind::LoginFailure => {
                    self.counters.increment(event.ip, CounterKind::LoginFailure, now);
                }
                EventKind::AuthenticatedRequest | EventKind::LoginSuccess => {
                    let user = event.user.as_deref().unwrap_or("-");
                    self.whitelist.grant(event.ip, user, now, ttl);
                }
            }
        }

        let attempted = self.evaluate_bans(now, &mut summary)?;

        summary.counters_pruned += self
            .counters
            .prune(CounterKind::Anonymous, self.anonymous_window(), now);
        summary.counters_pruned += self
            .counters
            .prune(CounterKind::LoginFailure, self.login_failure_window(), now);

        summary.expired = self.expiry_sweep(now, &attempted)?;

        self.persist()?;

        log::info!(
            "Pass done: {} events, {} bans emitted, {} suppressed, {} expired",
            summary.events,
            summary.bans_emitted,
            summary.bans_suppressed,
            summary.expired,
        );
        Ok(summary)
    }

    /// Loop mode: pass, sleep, repeat until the stop flag is set.
    ///
    /// A failed pass is logged and retried on the next tick; persisted state
    /// is only as stale as the last successful persist.
    pub fn run_loop(&mut self, stop: &AtomicBool) -> SentryResult<()> {
        let sleep = std::time::Duration::from_secs(self.config.general.sleep_secs);
        loop {
            if stop.load(Ordering::SeqCst) {
                log::info!("Stop signal received. Shutting down after current pass.");
                break;
            }

            if let Err(e) = self.run_pass(Utc::now()) {
                log::error!("Pass failed: {} (retrying next pass)", e);
            }

            std::thread::sleep(sleep);
        }
        Ok(())
    }

    /// Check every over-limit counter against the whitelist and the ban
    /// ledger. Returns the set of IPs whose enforcement was attempted this
    /// pass, so the sweep does not retry them again immediately.
    fn evaluate_bans(
        &mut self,
        now: DateTime<Utc>,
        summary: &mut PassSummary,
    ) -> SentryResult<HashSet<IpAddr>> {
        let checks = [
            (
                CounterKind::Anonymous,
                self.config.thresholds.anonymous_limit,
                BanReason::UnauthenticatedRequests,
            ),
            (
                CounterKind::LoginFailure,
                self.config.thresholds.login_failure_limit,
                BanReason::LoginFailures,
            ),
        ];
        let reemit_ttl = Duration::seconds(self.config.bans.reemit_ttl_secs as i64);
        let mut attempted = HashSet::new();

        for (kind, limit, reason) in checks {
            for (ip, count) in self.counters.over_limit(kind, limit) {
                if self.whitelist.is_trusted(ip, now) {
                    log::debug!(
                        "{} is over the {} limit ({} > {}) but trusted, skipping",
                        ip,
                        kind.as_str(),
                        count,
                        limit,
                    );
                    continue;
                }
                if is_reserved_ip(&ip) {
                    log::debug!("{} is a reserved address, never banned", ip);
                    continue;
                }

                if self.bans.record_ban(ip, reason, now, reemit_ttl) {
                    self.decisions
                        .append(now, DecisionAction::Ban, ip, reason.as_str())?;
                    log::warn!("BAN {} reason={} ({} > limit {})", ip, reason, count, limit);
                    summary.bans_emitted += 1;
                } else {
                    log::debug!("Re-ban for {} within re-emit TTL, no new decision line", ip);
                    summary.bans_suppressed += 1;
                }

                // Enforcement runs on every breach, emitted or suppressed,
                // so a record that failed to enforce earlier gets its rule.
                self.enforce_ban(ip, reason);
                attempted.insert(ip);
            }
        }
        Ok(attempted)
    }

    /// Best-effort remote enforcement for one banned IP. Failures are logged
    /// and left for the next pass; they never affect the local decision.
    fn enforce_ban(&mut self, ip: IpAddr, reason: BanReason) {
        let Some(enforcer) = &self.enforcer else {
            return;
        };

        let known = self.bans.get(ip).and_then(|r| r.rule_id.clone());
        let note = format!("kittylog-sentry: {}", reason);
        match enforcer.ensure_rule(ip, known.as_deref(), &note) {
            Ok(Some(rule_id)) => self.bans.set_rule_id(ip, rule_id),
            Ok(None) => {}
            Err(e) => {
                log::error!("Enforcement for {} failed, will retry next pass: {}", ip, e);
            }
        }
    }

    /// Expire old bans (UNBAN line + remote rule removal), then retry
    /// enforcement for live bans still missing a rule id.
    fn expiry_sweep(
        &mut self,
        now: DateTime<Utc>,
        attempted_this_pass: &HashSet<IpAddr>,
    ) -> SentryResult<usize> {
        let duration = Duration::seconds(self.config.bans.duration_secs as i64);
        let expired = self.bans.take_expired(now, duration);
        let count = expired.len();

        for record in expired {
            self.decisions
                .append(now, DecisionAction::Unban, record.ip, "expired")?;
            log::warn!(
                "UNBAN {} reason=expired (banned at {})",
                record.ip,
                record.last_banned_at,
            );

            if let (Some(enforcer), Some(rule_id)) = (&self.enforcer, record.rule_id.as_deref()) {
                if let Err(e) = enforcer.remove_rule(record.ip, rule_id) {
                    log::error!(
                        "Removing rule {} for {} failed (rule stays remote until manually cleared): {}",
                        rule_id,
                        record.ip,
                        e,
                    );
                }
            }
        }

        if self.enforcer.is_some() {
            let retries: Vec<IpAddr> = self
                .bans
                .missing_rule_ids()
                .into_iter()
                .filter(|ip| !attempted_this_pass.contains(ip))
                .collect();
            for ip in retries {
                if let Some(reason) = self.bans.get(ip).map(|r| r.reason) {
                    log::debug!("Retrying enforcement for {} (no rule id yet)", ip);
                    self.enforce_ban(ip, reason);
                }
            }
        }

        Ok(count)
    }

    fn persist(&self) -> SentryResult<()> {
        let state_dir = &self.config.general.state_dir;
        self.counters.persist(&counters_path(state_dir))?;
        self.whitelist.persist(&whitelist_path(state_dir))?;
        self.bans.persist(&bans_path(state_dir))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_reserved_ip_detection() {
        assert!(is_reserved_ip(&IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))));
        assert!(is_reserved_ip(&IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0))));
        assert!(is_reserved_ip(&"::1".parse().unwrap()));

        // Private ranges are bannable: clients behind a LAN reverse proxy
        // surface as RFC1918 addresses.
        assert!(!is_reserved_ip(&IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9))));
        assert!(!is_reserved_ip(&IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1))));
        assert!(!is_reserved_ip(&IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))));
        assert!(!is_reserved_ip(&IpAddr::V4(Ipv4Addr::new(203, 0, 113, 1))));
        assert!(!is_reserved_ip(&"2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn test_state_paths_live_under_the_state_dir() {
        let dir = PathBuf::from("/var/lib/sentry");
        assert_eq!(counters_path(&dir), dir.join("counters.jsonl"));
        assert_eq!(whitelist_path(&dir), dir.join("whitelist.jsonl"));
        assert_eq!(bans_path(&dir), dir.join("bans.jsonl"));
    }
}
