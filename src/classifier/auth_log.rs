//! Parser for the KittyLog auth log.
//!
//! Format: five tab-separated fields per line:
//! `<RFC3339 timestamp>\t<ip>\t<username>\t<status>\t<reason>`
//! `status` is `OK` for a successful login, any other code is a failure
//! (`BAD_PASSWORD`, `UNKNOWN_USER`, ...). The reason field is free text and
//! only matters to humans.
//!
//! Copyright (c) 2026 CIPS Corps. All rights reserved.

use crate::classifier::parse_timestamp;
use crate::{EventKind, TrafficEvent};
use std::net::IpAddr;

const STATUS_OK: &str = "OK";

pub fn parse_line(line: &str) -> Option<TrafficEvent> {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() != 5 {
        return None;
    }

    let timestamp = parse_timestamp(fields[0])?;
    let ip: IpAddr = fields[1].parse().ok()?;
    let user = fields[2];
    let status = fields[3];
    if user.is_empty() || status.is_empty() {
        return None;
    }

    let kind = if status == STATUS_OK {
        EventKind::LoginSuccess
    } else {
        EventKind::LoginFailure
    };

    Some(TrafficEvent {
        ip,
        kind,
        user: Some(user.to_string()),
        timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth_line(ip: &str, user: &str, status: &str, reason: &str) -> String {
        format!("2026-03-01T08:00:00Z\t{}\t{}\t{}\t{}", ip, user, status, reason)
    }

    #[test]
    fn test_login_success() {
        let event = parse_line(&auth_line("203.0.113.9", "alice", "OK", "password"))
            .expect("should parse");
        assert_eq!(event.kind, EventKind::LoginSuccess);
        assert_eq!(event.user.as_deref(), Some("alice"));
        assert_eq!(event.ip, "203.0.113.9".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_login_failure_bad_password() {
        let event = parse_line(&auth_line("203.0.113.9", "alice", "BAD_PASSWORD", "hash mismatch"))
            .expect("should parse");
        assert_eq!(event.kind, EventKind::LoginFailure);
    }

    #[test]
    fn test_login_failure_unknown_user() {
        let event = parse_line(&auth_line("203.0.113.9", "admin", "UNKNOWN_USER", "no such user"))
            .expect("should parse");
        assert_eq!(event.kind, EventKind::LoginFailure);
        assert_eq!(event.user.as_deref(), Some("admin"));
    }

    #[test]
    fn test_status_is_case_sensitive() {
        // Only the exact OK code counts as success.
        let event = parse_line(&auth_line("203.0.113.9", "alice", "ok", "?")).expect("parse");
        assert_eq!(event.kind, EventKind::LoginFailure);
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        assert!(parse_line("").is_none());
        // Space-separated (request-log shape) does not parse as auth
        assert!(parse_line("2026-03-01T08:00:00Z 203.0.113.9 alice OK password").is_none());
        // Too few / too many fields
        assert!(parse_line("2026-03-01T08:00:00Z\t203.0.113.9\talice\tOK").is_none());
        assert!(parse_line("2026-03-01T08:00:00Z\t203.0.113.9\talice\tOK\tx\ty").is_none());
        // Bad IP and bad timestamp
        assert!(parse_line(&auth_line("not-an-ip", "alice", "OK", "x")).is_none());
        assert!(parse_line("noon\t203.0.113.9\talice\tOK\tx").is_none());
        // Empty user or status
        assert!(parse_line(&auth_line("203.0.113.9", "", "OK", "x")).is_none());
        assert!(parse_line(&auth_line("203.0.113.9", "alice", "", "x")).is_none());
    }
}
