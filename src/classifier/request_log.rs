//! Parser for the KittyLog request log.
//!
//! Format: six space-separated fields per line:
//! `<RFC3339 timestamp> <client-ip> <METHOD> <path> <status> <user>`
//! where `<user>` is the authenticated username or `-` for anonymous.
//! Paths are URL-encoded by the writer and never contain spaces.
//!
//! Copyright (c) 2026 CIPS Corps. All rights reserved.

use crate::classifier::parse_timestamp;
use crate::{EventKind, TrafficEvent};
use std::net::IpAddr;

/// The username field value denoting an unauthenticated request.
pub const ANONYMOUS_USER: &str = "-";

pub fn parse_line(line: &str) -> Option<TrafficEvent> {
    let mut fields = line.split_ascii_whitespace();
    let ts_field = fields.next()?;
    let ip_field = fields.next()?;
    let _method = fields.next()?;
    let _path = fields.next()?;
    let status_field = fields.next()?;
    let user_field = fields.next()?;
    if fields.next().is_some() {
        return None;
    }

    let timestamp = parse_timestamp(ts_field)?;
    let ip: IpAddr = ip_field.parse().ok()?;
    let status: u16 = status_field.parse().ok()?;
    if !(100..=599).contains(&status) {
        return None;
    }

    if user_field == ANONYMOUS_USER {
        Some(TrafficEvent {
            ip,
            kind: EventKind::AnonymousRequest,
            user: None,
            timestamp,
        })
    } else {
        Some(TrafficEvent {
            ip,
            kind: EventKind::AuthenticatedRequest,
            user: Some(user_field.to_string()),
            timestamp,
        })
    }
}
