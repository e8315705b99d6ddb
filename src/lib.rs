//! # KittyLog Sentry - Core Library
//!
//! Adaptive IP-reputation engine for the KittyLog web application.
//!
//! KittyLog Sentry tails the application's request and auth logs, counts
//! per-source-IP behaviour in sliding time windows, promotes authenticated
//! sources to a time-limited whitelist, bans sources that cross the abuse
//! thresholds, and mirrors those bans to an edge-firewall HTTP API.
//!
//! ## Design Philosophy
//! - **Local state is the source of truth.** The edge firewall is best-effort
//!   and reconciled opportunistically; a dead API never blocks a ban decision.
//! - **One pass, one pipeline.** Read, classify, count, decide, sweep, persist.
//! - No daemon magic: a single-threaded poll loop small enough for the
//!   Raspberry Pi the app itself runs on.

pub mod classifier;
pub mod decision;
pub mod enforce;
pub mod engine;
pub mod reader;
pub mod state;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Unified error type for KittyLog Sentry.
#[derive(Error, Debug)]
pub enum SentryError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("State error: {0}")]
    State(String),

    #[error("Enforcement error: {0}")]
    Enforce(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),
}

pub type SentryResult<T> = Result<T, SentryError>;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Top-level configuration for KittyLog Sentry.
///
/// Loaded from `kittylog-sentry.toml` in the working directory or a path
/// supplied via CLI flag. Every key has a default so a missing config file
/// still produces a runnable (dry-run) engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentryConfig {
    /// General daemon settings.
    pub general: GeneralConfig,

    /// Input log file locations.
    pub logs: LogInputsConfig,

    /// Abuse thresholds and their sliding windows.
    pub thresholds: ThresholdConfig,

    /// Dynamic/static whitelist settings.
    pub whitelist: WhitelistConfig,

    /// Ban ledger timing knobs.
    pub bans: BanConfig,

    /// Edge-firewall API settings.
    pub enforcement: EnforcementConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Directory where the engine persists its state (cursors, counters,
    /// whitelist, ban ledger, PID file).
    pub state_dir: PathBuf,

    /// Sleep between passes in watch mode, in seconds.
    pub sleep_secs: u64,

    /// Path of the append-only BAN/UNBAN decision log.
    pub decision_log: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogInputsConfig {
    /// The application's request log (one line per HTTP request).
    pub request_log: PathBuf,

    /// The application's auth log (one line per login attempt).
    pub auth_log: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdConfig {
    /// Anonymous requests from one IP beyond this count trigger a ban.
    pub anonymous_limit: u64,

    /// Sliding window for the anonymous-request counter, in seconds.
    pub anonymous_window_secs: u64,

    /// Failed logins from one IP beyond this count trigger a ban.
    pub login_failure_limit: u64,

    /// Sliding window for the login-failure counter, in seconds.
    pub login_failure_window_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhitelistConfig {
    /// How long a dynamically whitelisted IP stays trusted after its last
    /// authenticated activity, in seconds.
    pub ttl_secs: u64,

    /// Plain-text file of always-trusted IPs (one per line, `#` comments).
    pub static_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanConfig {
    /// Minimum spacing between two BAN decision lines for the same IP,
    /// in seconds. Enforcement retries are not throttled by this.
    pub reemit_ttl_secs: u64,

    /// Lifetime of a ban record (and its remote rule) before the expiry
    /// sweep removes it, in seconds.
    pub duration_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnforcementConfig {
    /// Whether to call the edge-firewall API (false = dry-run: decisions and
    /// the decision log still happen, remote calls are skipped).
    pub enabled: bool,

    /// Base URL of the edge-firewall API.
    pub api_base: String,

    /// Zone identifier the block rules are scoped to.
    pub zone_id: String,

    /// Bearer token for the API.
    pub api_token: String,

    /// Timeout for each API call, in seconds. Bounded so a hung endpoint
    /// cannot stall the pass loop.
    pub timeout_secs: u64,
}

impl Default for SentryConfig {
    fn default() -> Self {
        Self {
            general: GeneralConfig {
                state_dir: PathBuf::from("./sentry-data"),
                sleep_secs: 60,
                decision_log: PathBuf::from("./sentry-data/decisions.log"),
            },
            logs: LogInputsConfig {
                request_log: PathBuf::from("/var/log/kittylog/requests.log"),
                auth_log: PathBuf::from("/var/log/kittylog/auth.log"),
            },
            thresholds: ThresholdConfig {
                anonymous_limit: 120,
                anonymous_window_secs: 300,
                login_failure_limit: 5,
                login_failure_window_secs: 900,
            },
            whitelist: WhitelistConfig {
                ttl_secs: 86_400,
                static_file: PathBuf::from("./whitelist.txt"),
            },
            bans: BanConfig {
                reemit_ttl_secs: 3_600,
                duration_secs: 86_400,
            },
            enforcement: EnforcementConfig {
                enabled: false,
                api_base: "https://api.cloudflare.com/client/v4".to_string(),
                zone_id: String::new(),
                api_token: String::new(),
                timeout_secs: 5,
            },
        }
    }
}

impl SentryConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> SentryResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SentryConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Write the default configuration to a TOML file.
    pub fn write_default(path: &std::path::Path) -> SentryResult<()> {
        let config = Self::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| SentryError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Core Types
// ---------------------------------------------------------------------------

/// A single classified event from one of the two input logs.
///
/// Events are ephemeral: produced by the classifier, folded into the counter
/// store and whitelist within the same pass, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficEvent {
    /// Source IP the event was attributed to.
    pub ip: IpAddr,

    /// What kind of traffic this was.
    pub kind: EventKind,

    /// Authenticated username, when the event carries one.
    pub user: Option<String>,

    /// Timestamp embedded in the log line (kept for logging; the engine's
    /// window arithmetic runs on the pass clock).
    pub timestamp: DateTime<Utc>,
}

/// Classification of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Request-log line with the anonymous placeholder user.
    AnonymousRequest,

    /// Request-log line carrying an authenticated username.
    AuthenticatedRequest,

    /// Auth-log line with status OK.
    LoginSuccess,

    /// Auth-log line with any non-OK status.
    LoginFailure,
}

/// Which sliding-window counter an event feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterKind {
    Anonymous,
    LoginFailure,
}

impl CounterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CounterKind::Anonymous => "anonymous",
            CounterKind::LoginFailure => "login_failure",
        }
    }
}

/// Why an IP was banned. Appears verbatim in decision-log lines and in the
/// note attached to remote block rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BanReason {
    UnauthenticatedRequests,
    LoginFailures,
}

impl BanReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BanReason::UnauthenticatedRequests => "unauthenticated_requests",
            BanReason::LoginFailures => "login_failures",
        }
    }
}

impl std::fmt::Display for BanReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_roundtrips_through_toml() {
        let config = SentryConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let back: SentryConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.thresholds.login_failure_limit, 5);
        assert_eq!(back.general.sleep_secs, 60);
        assert!(!back.enforcement.enabled);
    }

    #[test]
    fn test_ban_reason_strings_are_stable() {
        // These appear in the decision log, which downstream daemons parse.
        assert_eq!(BanReason::UnauthenticatedRequests.as_str(), "unauthenticated_requests");
        assert_eq!(BanReason::LoginFailures.as_str(), "login_failures");
    }

    #[test]
    fn test_counter_kind_serde_tags() {
        let json = serde_json::to_string(&CounterKind::LoginFailure).unwrap();
        assert_eq!(json, "\"login_failure\"");
        let back: CounterKind = serde_json::from_str("\"anonymous\"").unwrap();
        assert_eq!(back, CounterKind::Anonymous);
    }
}
