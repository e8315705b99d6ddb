//! # KittyLog Sentry - CLI Entry Point
//!
//! Command-line interface for the IP-reputation engine.
//!
//! Commands:
//! - `run`         - One pass over both logs, then exit
//! - `watch`       - Poll forever with a sleep between passes
//! - `status`      - Show persisted state and configuration
//! - `init-config` - Generate a default configuration file

use clap::{Parser, Subcommand};
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use kittylog_sentry::enforce::edge_api::EdgeFirewallClient;
use kittylog_sentry::engine::{self, Engine};
use kittylog_sentry::reader::OffsetReader;
use kittylog_sentry::state::bans::BanLedger;
use kittylog_sentry::state::counters::CounterStore;
use kittylog_sentry::state::whitelist::Whitelist;
use kittylog_sentry::{SentryConfig, SentryError, SentryResult};

/// KittyLog Sentry - adaptive IP-reputation engine.
///
/// Tails the KittyLog request and auth logs, whitelists authenticated
/// sources, bans abusive ones, and mirrors bans to the edge firewall.
#[derive(Parser, Debug)]
#[command(name = "kittylog-sentry")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, default_value = "kittylog-sentry.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a single pass over both logs, then exit.
    Run,

    /// Poll the logs forever with a sleep between passes.
    Watch,

    /// Show persisted state and configuration.
    Status,

    /// Generate a default configuration file.
    InitConfig,
}

fn main() -> SentryResult<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run => cmd_run(&cli.config, false),
        Commands::Watch => cmd_run(&cli.config, true),
        Commands::Status => cmd_status(&cli.config),
        Commands::InitConfig => cmd_init_config(&cli.config),
    }
}

fn load_config(config_path: &Path) -> SentryResult<SentryConfig> {
    if config_path.exists() {
        info!("Loading configuration from: {}", config_path.display());
        SentryConfig::from_file(config_path)
    } else {
        info!("No config file found, using defaults. Run 'init-config' to generate one.");
        Ok(SentryConfig::default())
    }
}

/// Build the edge-firewall client, or `None` in dry-run mode. Enforcement
/// enabled without credentials is a startup error, not a silent dry-run.
fn build_client(config: &SentryConfig) -> SentryResult<Option<EdgeFirewallClient>> {
    if !config.enforcement.enabled {
        info!("Enforcement disabled - decisions are logged, no API calls are made.");
        return Ok(None);
    }
    if config.enforcement.api_token.is_empty() || config.enforcement.zone_id.is_empty() {
        return Err(SentryError::Config(
            "enforcement.enabled requires enforcement.api_token and enforcement.zone_id".to_string(),
        ));
    }
    Ok(Some(EdgeFirewallClient::new(&config.enforcement)))
}

/// Run a single pass (`run`) or the poll loop (`watch`).
fn cmd_run(config_path: &Path, watch: bool) -> SentryResult<()> {
    let config = load_config(config_path)?;

    // State files are not protected by any lock; a second live instance
    // would double-count and clobber cursors. The PID file makes this a
    // startup error instead.
    std::fs::create_dir_all(&config.general.state_dir)?;
    let pid_path = config.general.state_dir.join("kittylog-sentry.pid");
    acquire_pid_file(&pid_path)?;

    let client = build_client(&config)?;
    let mut engine = Engine::new(config.clone(), client)?;

    let result = if watch {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            shutdown_clone.store(true, Ordering::SeqCst);
        }) {
            warn!("Could not install signal handler: {}. Use kill to stop.", e);
        }

        info!(
            "KittyLog Sentry watching (pass every {}s). Ctrl-C to stop.",
            config.general.sleep_secs,
        );
        engine.run_loop(&shutdown)
    } else {
        engine.run_pass(chrono::Utc::now()).map(|summary| {
            println!(
                "Pass complete: {} events, {} bans emitted, {} suppressed, {} expired",
                summary.events, summary.bans_emitted, summary.bans_suppressed, summary.expired,
            );
            println!(
                "State: {} counters, {} whitelisted, {} active bans",
                engine.counters().len(),
                engine.whitelist().dynamic_len() + engine.whitelist().static_len(),
                engine.bans().len(),
            );
        })
    };

    if let Err(e) = std::fs::remove_file(&pid_path) {
        warn!("Could not remove PID file: {}", e);
    }
    result
}

/// Report on the persisted state without running a pass.
fn cmd_status(config_path: &Path) -> SentryResult<()> {
    let config = load_config(config_path)?;
    let state_dir = &config.general.state_dir;

    let pid_path = state_dir.join("kittylog-sentry.pid");
    match read_pid_file(&pid_path) {
        Some(pid) if is_process_running(pid) => {
            println!("KittyLog Sentry is RUNNING (PID: {})", pid);
        }
        Some(pid) => {
            println!("KittyLog Sentry is NOT RUNNING (stale PID file, PID {} not found)", pid);
        }
        None => {
            println!("KittyLog Sentry is NOT RUNNING (no PID file)");
        }
    }

    if !state_dir.exists() {
        println!("No state directory at {}. Run 'kittylog-sentry run' first.", state_dir.display());
        return Ok(());
    }

    println!("State directory: {}", state_dir.display());

    let reader = OffsetReader::new(state_dir);
    println!(
        "  Cursors: requests={} auth={}",
        reader.load_cursor("requests"),
        reader.load_cursor("auth"),
    );

    let counters = CounterStore::load(&engine::counters_path(state_dir))?;
    println!("  Live counters: {}", counters.len());

    let whitelist = Whitelist::load(&engine::whitelist_path(state_dir), &config.whitelist.static_file)?;
    println!(
        "  Whitelist: {} dynamic, {} static",
        whitelist.dynamic_len(),
        whitelist.static_len(),
    );

    let bans = BanLedger::load(&engine::bans_path(state_dir))?;
    println!("  Active bans: {}", bans.len());
    let mut records: Vec<_> = bans.records().collect();
    records.sort_by_key(|r| r.ip);
    for record in records {
        println!(
            "    {} reason={} since={} rule={}",
            record.ip,
            record.reason,
            record.last_banned_at.to_rfc3339(),
            record.rule_id.as_deref().unwrap_or("(pending)"),
        );
    }

    if config.general.decision_log.exists() {
        let metadata = std::fs::metadata(&config.general.decision_log)?;
        println!(
            "Decision log: {} ({} bytes)",
            config.general.decision_log.display(),
            metadata.len(),
        );
    } else {
        println!("Decision log: not written yet");
    }

    println!();
    println!("Configuration:");
    println!("  Request log: {}", config.logs.request_log.display());
    println!("  Auth log: {}", config.logs.auth_log.display());
    println!(
        "  Thresholds: {} anonymous / {}s, {} login failures / {}s",
        config.thresholds.anonymous_limit,
        config.thresholds.anonymous_window_secs,
        config.thresholds.login_failure_limit,
        config.thresholds.login_failure_window_secs,
    );
    println!(
        "  Whitelist TTL: {}s, ban duration: {}s, re-emit TTL: {}s",
        config.whitelist.ttl_secs, config.bans.duration_secs, config.bans.reemit_ttl_secs,
    );
    println!("  Enforcement enabled: {}", config.enforcement.enabled);
    println!("  Sleep between passes: {}s", config.general.sleep_secs);

    Ok(())
}

/// Generate a default configuration file.
fn cmd_init_config(config_path: &Path) -> SentryResult<()> {
    if config_path.exists() {
        return Err(SentryError::Config(format!(
            "Configuration file already exists: {}. Remove it first or use a different path.",
            config_path.display()
        )));
    }

    SentryConfig::write_default(config_path)?;
    println!("Default configuration written to: {}", config_path.display());
    println!("Edit this file to point at your log files and tune thresholds.");
    println!();
    println!("Key settings to configure:");
    println!("  [logs]        - The KittyLog request and auth log paths");
    println!("  [thresholds]  - Abuse limits and their windows");
    println!("  [enforcement] - Edge-firewall credentials; enabled=false is a dry run");

    Ok(())
}

// ---------------------------------------------------------------------------
// PID file management
// ---------------------------------------------------------------------------

/// Claim the PID file, failing if another live instance holds it. A PID file
/// left by a dead process is reclaimed with a warning.
fn acquire_pid_file(path: &Path) -> SentryResult<()> {
    if let Some(pid) = read_pid_file(path) {
        if pid != std::process::id() && is_process_running(pid) {
            return Err(SentryError::Config(format!(
                "Another instance is already running against this state directory (PID {}). \
                 Two instances would corrupt cursors and counters.",
                pid
            )));
        }
        warn!("Reclaiming stale PID file from dead process {}", pid);
    }
    std::fs::write(path, std::process::id().to_string())?;
    Ok(())
}

/// Read a PID from a PID file. Returns None if file doesn't exist or is invalid.
fn read_pid_file(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path)
        .ok()?
        .trim()
        .parse::<u32>()
        .ok()
}

/// Check if a process with the given PID is still running.
fn is_process_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        // On Unix, kill -0 checks if a process exists without signalling it.
        use std::process::Command;
        Command::new("kill")
            .args(["-0", &pid.to_string()])
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    #[cfg(windows)]
    {
        use std::process::Command;
        let output = Command::new("tasklist")
            .args(["/FI", &format!("PID eq {}", pid), "/NH"])
            .output();
        match output {
            Ok(out) => {
                let stdout = String::from_utf8_lossy(&out.stdout);
                !stdout.contains("No tasks") && stdout.contains(&pid.to_string())
            }
            Err(_) => false,
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = pid;
        false
    }
}
