//! Persistent per-IP state: sliding-window counters, whitelist, ban ledger.
//!
//! Each store is an explicit struct loaded at engine start, mutated through
//! the pass pipeline, and persisted at end of pass. The on-disk format is
//! JSON Lines: one serde-encoded record per line. A corrupt line is skipped
//! with a warning on load; it never aborts the engine.

pub mod bans;
pub mod counters;
pub mod whitelist;

use crate::SentryResult;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Write;
use std::path::Path;

/// Load all records from a JSONL state file. A missing file is an empty
/// store; a corrupt line is skipped.
pub(crate) fn load_jsonl<T: DeserializeOwned>(path: &Path) -> SentryResult<Vec<T>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut records = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(line) {
            Ok(record) => records.push(record),
            Err(e) => {
                log::warn!(
                    "Skipping corrupt state line {}:{}: {}",
                    path.display(),
                    lineno + 1,
                    e,
                );
            }
        }
    }
    Ok(records)
}

/// Rewrite a JSONL state file from an iterator of records.
pub(crate) fn save_jsonl<'a, T, I>(path: &Path, records: I) -> SentryResult<()>
where
    T: Serialize + 'a,
    I: IntoIterator<Item = &'a T>,
{
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let mut file = std::fs::File::create(path)?;
    for record in records {
        let line = serde_json::to_string(record)?;
        writeln!(file, "{}", line)?;
    }
    file.flush()?;
    Ok(())
}
