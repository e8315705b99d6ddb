//! Line classification for the two KittyLog log formats.
//!
//! Each format gets its own parser module returning `Option<TrafficEvent>`:
//! `Some` for a recognized line, `None` to skip. The classifier is
//! best-effort by contract - malformed lines are dropped silently, never an
//! error. Both parsers are plain field splitters; the formats are fixed and
//! machine-written, so there is nothing for a regex to do here.
//!
//! Copyright (c) 2026 CIPS Corps. All rights reserved.

pub mod auth_log;
pub mod request_log;

use crate::TrafficEvent;
use chrono::{DateTime, Utc};

/// Which log file a line came from. The two formats are not
/// self-identifying, so the reader declares the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    Request,
    Auth,
}

/// Classify one raw line from the declared source into zero or one event.
pub fn classify(kind: LogKind, line: &str) -> Option<TrafficEvent> {
    match kind {
        LogKind::Request => request_log::parse_line(line),
        LogKind::Auth => auth_log::parse_line(line),
    }
}

/// Parse the timestamp field shared by both formats (RFC 3339, any offset),
/// normalized to UTC.
pub(crate) fn parse_timestamp(field: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(field)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventKind;

    #[test]
    fn test_classify_dispatches_by_source() {
        let request = "2026-03-01T08:00:00Z 203.0.113.9 GET /tasks 200 -";
        let auth = "2026-03-01T08:00:00Z\t203.0.113.9\talice\tOK\tpassword";

        let event = classify(LogKind::Request, request).expect("request line");
        assert_eq!(event.kind, EventKind::AnonymousRequest);

        let event = classify(LogKind::Auth, auth).expect("auth line");
        assert_eq!(event.kind, EventKind::LoginSuccess);

        // Crossed formats do not parse.
        assert!(classify(LogKind::Auth, request).is_none());
        assert!(classify(LogKind::Request, auth).is_none());
    }

    #[test]
    fn test_timestamp_offsets_normalize_to_utc() {
        let ts = parse_timestamp("2026-03-01T10:30:00+02:00").expect("parse");
        assert_eq!(ts.to_rfc3339(), "2026-03-01T08:30:00+00:00");
        assert!(parse_timestamp("yesterday").is_none());
    }
}
