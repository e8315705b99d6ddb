//! Offset-tracked incremental log reading.
//!
//! Each monitored log file gets a cursor file under the state directory
//! holding the byte offset of the last read position. A pass reads only the
//! bytes appended since that offset. Rotation is detected by the file being
//! smaller than the stored cursor, in which case the cursor resets to 0 and
//! the whole current content is returned (lines written just before rotation
//! was noticed may be reprocessed).
//!
//! Copyright (c) 2026 CIPS Corps. All rights reserved.

use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Reads new lines from monitored log files, keyed by a short source id
/// ("requests", "auth"). The cursor files are the only durable state this
/// component owns.
pub struct OffsetReader {
    state_dir: PathBuf,
}

impl OffsetReader {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            state_dir: state_dir.to_path_buf(),
        }
    }

    /// Path of the cursor file for a source id.
    pub fn cursor_path(&self, source: &str) -> PathBuf {
        self.state_dir.join(format!("cursor-{}.offset", source))
    }

    /// Load the persisted cursor for a source. Missing or unparseable cursor
    /// files read as 0 (never an error).
    pub fn load_cursor(&self, source: &str) -> u64 {
        let path = self.cursor_path(source);
        match std::fs::read_to_string(&path) {
            Ok(text) => match text.trim().parse::<u64>() {
                Ok(offset) => offset,
                Err(_) => {
                    log::warn!(
                        "Corrupt cursor file {} ({:?}), treating as 0",
                        path.display(),
                        text.trim(),
                    );
                    0
                }
            },
            Err(_) => 0,
        }
    }

    fn store_cursor(&self, source: &str, offset: u64) {
        let path = self.cursor_path(source);
        if let Err(e) = std::fs::write(&path, offset.to_string()) {
            log::warn!("Cannot persist cursor {}: {}", path.display(), e);
        }
    }

    /// Read the complete lines appended to `path` since the last read, then
    /// persist the new offset.
    ///
    /// Handles:
    /// - Missing file: returns empty and writes a cursor of 0.
    /// - Rotation (file smaller than cursor): resets to 0 and reads from the
    ///   start of the current file.
    /// - Normal growth: reads from the stored offset to the current end.
    pub fn read_new_lines(&self, source: &str, path: &Path) -> Vec<String> {
        let stored = self.load_cursor(source);

        let metadata = match std::fs::metadata(path) {
            Ok(m) => m,
            Err(_) => {
                // Log not written yet (fresh deployment) or rotated away.
                self.store_cursor(source, 0);
                return Vec::new();
            }
        };

        let file_size = metadata.len();
        let read_from = if file_size < stored {
            log::info!(
                "Rotation detected for {} (size {} < cursor {}), resetting",
                path.display(),
                file_size,
                stored,
            );
            0
        } else if file_size == stored {
            return Vec::new();
        } else {
            stored
        };

        let file = match std::fs::File::open(path) {
            Ok(f) => f,
            Err(e) => {
                log::warn!("Cannot open log file {}: {}", path.display(), e);
                return Vec::new();
            }
        };

        let mut reader = BufReader::new(file);
        if let Err(e) = reader.seek(SeekFrom::Start(read_from)) {
            log::warn!("Cannot seek in {}: {}", path.display(), e);
            return Vec::new();
        }

        let mut lines = Vec::new();
        let mut current_offset = read_from;

        loop {
            let mut line = String::new();
            match reader.read_line(&mut line) {
                Ok(0) => break,
                Ok(bytes_read) => {
                    current_offset += bytes_read as u64;
                    let trimmed = line.trim_end_matches(['\n', '\r']);
                    if !trimmed.is_empty() {
                        lines.push(trimmed.to_string());
                    }
                }
                Err(e) => {
                    log::warn!("Read error in {}: {}", path.display(), e);
                    break;
                }
            }
        }

        self.store_cursor(source, current_offset);
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("kittylog-sentry-reader").join(name);
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).expect("create test dir");
        dir
    }

    fn append(path: &Path, text: &str) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .expect("open");
        file.write_all(text.as_bytes()).expect("write");
        file.flush().expect("flush");
    }

    #[test]
    fn test_missing_file_reads_empty_and_writes_zero_cursor() {
        let dir = test_dir("missing");
        let reader = OffsetReader::new(&dir);

        let lines = reader.read_new_lines("requests", &dir.join("absent.log"));
        assert!(lines.is_empty());
        assert_eq!(reader.load_cursor("requests"), 0);
        assert!(reader.cursor_path("requests").exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_incremental_reads_return_only_new_lines() {
        let dir = test_dir("incremental");
        let log = dir.join("app.log");
        let reader = OffsetReader::new(&dir);

        append(&log, "one\ntwo\n");
        let first = reader.read_new_lines("requests", &log);
        assert_eq!(first, vec!["one", "two"]);

        append(&log, "three\n");
        let second = reader.read_new_lines("requests", &log);
        assert_eq!(second, vec!["three"]);

        // Nothing new.
        let third = reader.read_new_lines("requests", &log);
        assert!(third.is_empty());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_cursor_survives_reader_recreation() {
        let dir = test_dir("durable");
        let log = dir.join("app.log");

        append(&log, "one\n");
        OffsetReader::new(&dir).read_new_lines("auth", &log);

        append(&log, "two\n");
        let lines = OffsetReader::new(&dir).read_new_lines("auth", &log);
        assert_eq!(lines, vec!["two"]);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_rotation_resets_to_start() {
        let dir = test_dir("rotation");
        let log = dir.join("app.log");
        let reader = OffsetReader::new(&dir);

        append(&log, "old line one\nold line two\n");
        reader.read_new_lines("requests", &log);

        // Simulate logrotate: new, shorter file at the same path.
        std::fs::write(&log, "fresh\n").expect("truncate");
        let lines = reader.read_new_lines("requests", &log);
        assert_eq!(lines, vec!["fresh"]);
        assert_eq!(reader.load_cursor("requests"), "fresh\n".len() as u64);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_corrupt_cursor_file_reads_as_zero() {
        let dir = test_dir("corrupt_cursor");
        let log = dir.join("app.log");
        let reader = OffsetReader::new(&dir);

        append(&log, "one\n");
        std::fs::write(reader.cursor_path("requests"), "not a number").expect("write cursor");

        let lines = reader.read_new_lines("requests", &log);
        assert_eq!(lines, vec!["one"]);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_partial_trailing_line_without_newline_is_still_counted() {
        // A writer that has not yet flushed the newline: the bytes are read
        // and the offset advances past them, matching the original tailer.
        let dir = test_dir("partial");
        let log = dir.join("app.log");
        let reader = OffsetReader::new(&dir);

        append(&log, "complete\nincomplete");
        let lines = reader.read_new_lines("requests", &log);
        assert_eq!(lines, vec!["complete", "incomplete"]);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
