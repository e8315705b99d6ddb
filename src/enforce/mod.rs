//! Edge-firewall enforcement.
//!
//! The engine never talks HTTP directly: it goes through [`Enforcer`], which
//! wraps any [`EnforcementClient`]. The client is three dumb remote calls;
//! the adapter above it owns the correctness-critical behaviour:
//!
//! - a "duplicate rule" answer from create is recovered into the existing
//!   rule's id via a lookup, never surfaced as a failure;
//! - deleting an already-gone rule is success;
//! - every failure is logged and left for the next pass - enforcement is
//!   best-effort, local state is authoritative.

pub mod edge_api;

use crate::SentryResult;
use std::net::IpAddr;

/// Outcome of a create call against the remote API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    /// A new rule was created.
    Created(String),

    /// The remote already holds an equivalent block for this IP.
    Duplicate,
}

/// The three operations the edge firewall exposes.
///
/// Implementations map remote idiosyncrasies into this shape: `create_rule`
/// reports an equivalent existing block as `Duplicate` (not an error), and
/// `delete_rule` returns `Ok` when the rule is already gone.
pub trait EnforcementClient {
    fn create_rule(&self, ip: IpAddr, note: &str) -> SentryResult<CreateOutcome>;

    /// Look up an existing block rule for `ip`. `Ok(None)` means the remote
    /// holds no rule for this IP.
    fn find_rule(&self, ip: IpAddr) -> SentryResult<Option<String>>;

    fn delete_rule(&self, rule_id: &str) -> SentryResult<()>;
}

/// Reconciles a local ban with the remote rule set.
pub struct Enforcer<C: EnforcementClient> {
    client: C,
}

impl<C: EnforcementClient> Enforcer<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }

    /// Make sure a block rule exists for `ip` and return its id.
    ///
    /// `known` is the rule id already recorded locally, if any; it is trusted
    /// as-is (the remote is not re-checked every pass). Returns `Ok(None)`
    /// when the remote claimed a duplicate but the lookup found nothing - a
    /// remote inconsistency that resolves itself on a later pass.
    pub fn ensure_rule(
        &self,
        ip: IpAddr,
        known: Option<&str>,
        note: &str,
    ) -> SentryResult<Option<String>> {
        if let Some(id) = known {
            return Ok(Some(id.to_string()));
        }

        match self.client.create_rule(ip, note)? {
            CreateOutcome::Created(id) => {
                log::info!("Enforcement rule created for {}: {}", ip, id);
                Ok(Some(id))
            }
            CreateOutcome::Duplicate => {
                log::debug!("Remote already blocks {}, recovering rule id", ip);
                let found = self.client.find_rule(ip)?;
                match &found {
                    Some(id) => log::info!("Recovered existing rule for {}: {}", ip, id),
                    None => log::warn!(
                        "Remote reported a duplicate block for {} but lookup found none",
                        ip,
                    ),
                }
                Ok(found)
            }
        }
    }

    /// Remove the remote rule backing an expired ban. A rule that is already
    /// gone is success by contract.
    pub fn remove_rule(&self, ip: IpAddr, rule_id: &str) -> SentryResult<()> {
        self.client.delete_rule(rule_id)?;
        log::info!("Enforcement rule removed for {}: {}", ip, rule_id);
        Ok(())
    }
}
