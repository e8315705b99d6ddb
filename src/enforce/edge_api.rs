//! HTTP client for the edge firewall's zone access-rule API.
//!
//! Three endpoints, bearer-token auth, JSON envelope responses:
//! - `GET    {base}/zones/{zone}/firewall/access_rules/rules?configuration.target=ip&configuration.value=<ip>`
//! - `POST   {base}/zones/{zone}/firewall/access_rules/rules`
//! - `DELETE {base}/zones/{zone}/firewall/access_rules/rules/{id}`
//!
//! Every response body uses the `{success, errors, result}` envelope. Two
//! error answers get special classification instead of bubbling up as
//! failures: "duplicate of existing rule" on create (recovered by the
//! adapter) and "rule not found" on delete (already gone = success).
//!
//! All calls share one blocking agent with a bounded timeout so a hung
//! endpoint cannot stall the pass loop.

use crate::enforce::{CreateOutcome, EnforcementClient};
use crate::{EnforcementConfig, SentryError, SentryResult};
use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;

/// Error code the API uses for "a rule with this configuration already
/// exists" on create.
const CODE_DUPLICATE_RULE: i64 = 10009;

/// Error code the API uses for "no such rule" on delete.
const CODE_RULE_NOT_FOUND: i64 = 10001;

/// Longest response-body snippet quoted in error messages and logs.
const SNIPPET_LEN: usize = 200;

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    #[serde(default)]
    success: bool,

    #[serde(default)]
    errors: Vec<ApiError>,

    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    code: i64,

    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct RuleResult {
    id: String,
}

fn has_error_code(errors: &[ApiError], code: i64, message_hint: &str) -> bool {
    errors
        .iter()
        .any(|e| e.code == code || e.message.to_lowercase().contains(message_hint))
}

fn snippet(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= SNIPPET_LEN {
        trimmed.to_string()
    } else {
        let mut end = SNIPPET_LEN;
        while !trimmed.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &trimmed[..end])
    }
}

pub struct EdgeFirewallClient {
    agent: ureq::Agent,
    rules_url: String,
    auth_header: String,
}

impl EdgeFirewallClient {
    pub fn new(config: &EnforcementConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build();
        let rules_url = format!(
            "{}/zones/{}/firewall/access_rules/rules",
            config.api_base.trim_end_matches('/'),
            config.zone_id,
        );
        Self {
            agent,
            rules_url,
            auth_header: format!("Bearer {}", config.api_token),
        }
    }

    /// Read the body of a non-2xx response. Used both to classify known
    /// error answers and to quote a snippet in the failure message; a body
    /// that cannot be read or parsed degrades to an empty classification,
    /// never a panic.
    fn error_body(response: ureq::Response) -> (String, Vec<ApiError>) {
        let body = response.into_string().unwrap_or_default();
        let errors = serde_json::from_str::<ApiEnvelope<serde_json::Value>>(&body)
            .map(|envelope| envelope.errors)
            .unwrap_or_default();
        (body, errors)
    }
}

impl EnforcementClient for EdgeFirewallClient {
    fn create_rule(&self, ip: IpAddr, note: &str) -> SentryResult<CreateOutcome> {
        let payload = serde_json::json!({
            "mode": "block",
            "configuration": { "target": "ip", "value": ip.to_string() },
            "notes": note,
        });

        let result = self
            .agent
            .post(&self.rules_url)
            .set("Authorization", &self.auth_header)
            .send_json(payload);

        match result {
            Ok(response) => {
                let envelope: ApiEnvelope<RuleResult> = response
                    .into_json()
                    .map_err(|e| SentryError::Enforce(format!("create: malformed body: {}", e)))?;
                if envelope.success {
                    match envelope.result {
                        Some(rule) => Ok(CreateOutcome::Created(rule.id)),
                        None => Err(SentryError::Enforce(
                            "create: success without a rule in the body".to_string(),
                        )),
                    }
                } else if has_error_code(&envelope.errors, CODE_DUPLICATE_RULE, "duplicate") {
                    Ok(CreateOutcome::Duplicate)
                } else {
                    Err(SentryError::Enforce(format!(
                        "create for {} rejected: {:?}",
                        ip,
                        envelope.errors.first().map(|e| e.message.as_str()).unwrap_or(""),
                    )))
                }
            }
            Err(ureq::Error::Status(status, response)) => {
                let (body, errors) = Self::error_body(response);
                if has_error_code(&errors, CODE_DUPLICATE_RULE, "duplicate") {
                    Ok(CreateOutcome::Duplicate)
                } else {
                    Err(SentryError::Enforce(format!(
                        "create for {} failed with HTTP {}: {}",
                        ip,
                        status,
                        snippet(&body),
                    )))
                }
            }
            Err(e) => Err(SentryError::Enforce(format!("create for {}: {}", ip, e))),
        }
    }

    fn find_rule(&self, ip: IpAddr) -> SentryResult<Option<String>> {
        let result = self
            .agent
            .get(&self.rules_url)
            .set("Authorization", &self.auth_header)
            .query("configuration.target", "ip")
            .query("configuration.value", &ip.to_string())
            .call();

        match result {
            Ok(response) => {
                let envelope: ApiEnvelope<Vec<RuleResult>> = response
                    .into_json()
                    .map_err(|e| SentryError::Enforce(format!("find: malformed body: {}", e)))?;
                if envelope.success {
                    Ok(envelope
                        .result
                        .unwrap_or_default()
                        .into_iter()
                        .next()
                        .map(|rule| rule.id))
                } else {
                    Err(SentryError::Enforce(format!(
                        "find for {} rejected: {:?}",
                        ip,
                        envelope.errors.first().map(|e| e.message.as_str()).unwrap_or(""),
                    )))
                }
            }
            Err(ureq::Error::Status(status, response)) => {
                let (body, _) = Self::error_body(response);
                Err(SentryError::Enforce(format!(
                    "find for {} failed with HTTP {}: {}",
                    ip,
                    status,
                    snippet(&body),
                )))
            }
            Err(e) => Err(SentryError::Enforce(format!("find for {}: {}", ip, e))),
        }
    }

    fn delete_rule(&self, rule_id: &str) -> SentryResult<()> {
        let url = format!("{}/{}", self.rules_url, rule_id);
        let result = self
            .agent
            .delete(&url)
            .set("Authorization", &self.auth_header)
            .call();

        match result {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(404, _)) => {
                log::debug!("Rule {} already gone (HTTP 404)", rule_id);
                Ok(())
            }
            Err(ureq::Error::Status(status, response)) => {
                let (body, errors) = Self::error_body(response);
                if has_error_code(&errors, CODE_RULE_NOT_FOUND, "not found") {
                    log::debug!("Rule {} already gone", rule_id);
                    Ok(())
                } else {
                    Err(SentryError::Enforce(format!(
                        "delete of {} failed with HTTP {}: {}",
                        rule_id,
                        status,
                        snippet(&body),
                    )))
                }
            }
            Err(e) => Err(SentryError::Enforce(format!("delete of {}: {}", rule_id, e))),
        }
    }
}
