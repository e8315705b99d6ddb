//! The append-only decision log.
//!
//! One line per action:
//! `<RFC3339 UTC> SECURITY BAN <ip> reason=<reason>`
//! `<RFC3339 UTC> SECURITY UNBAN <ip> reason=<reason>`
//!
//! This file is the engine's audit trail and a stable contract: external
//! blocking daemons tail it, so the format never changes shape. Lines are
//! appended and flushed immediately, never rewritten.

use crate::SentryResult;
use chrono::{DateTime, SecondsFormat, Utc};
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionAction {
    Ban,
    Unban,
}

impl DecisionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionAction::Ban => "BAN",
            DecisionAction::Unban => "UNBAN",
        }
    }
}

/// Format one decision line (without trailing newline).
pub fn format_line(
    now: DateTime<Utc>,
    action: DecisionAction,
    ip: IpAddr,
    reason: &str,
) -> String {
    format!(
        "{} SECURITY {} {} reason={}",
        now.to_rfc3339_opts(SecondsFormat::Secs, true),
        action.as_str(),
        ip,
        reason,
    )
}

pub struct DecisionLog {
    path: PathBuf,
}

impl DecisionLog {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one decision line. Creates the file and parent directories on
    /// first use.
    pub fn append(
        &self,
        now: DateTime<Utc>,
        action: DecisionAction,
        ip: IpAddr,
        reason: &str,
    ) -> SentryResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", format_line(now, action, ip, reason))?;
        file.flush()?;
        Ok(())
    }
}
