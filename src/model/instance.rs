//! Instance record
//!
//! Instances are keyed by `(challenge_id, identity)`. The identity is the
//! opaque name the provisioner deploys under; pool-held instances carry no
//! source binding until a tenant claims them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A provisioned challenge instance
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Instance {
    /// Owning challenge
    pub challenge_id: String,
    /// Opaque provisioning identity, unique within the challenge
    pub identity: String,
    /// Tenant the instance is bound to; None while pool-held
    pub source_id: Option<String>,
    /// Opaque provisioner state blob, round-tripped on destroy/update
    pub state: Option<String>,
    /// Hash of the scenario this instance was deployed from
    pub scenario_hash: String,
    /// Deployment timestamp
    pub since: DateTime<Utc>,
    /// Last successful renewal, if any
    pub last_renew: Option<DateTime<Utc>>,
    /// Expiry; None means unbounded
    pub until: Option<DateTime<Utc>>,
    /// How the tenant reaches the instance
    pub connection_info: String,
    /// Flag issued by the scenario, if any
    pub flag: Option<String>,
    /// Additional scenario outputs
    #[serde(default)]
    pub outputs: HashMap<String, String>,
}

impl Instance {
    /// A freshly deployed, unclaimed pool instance.
    pub fn pooled(challenge_id: &str, identity: &str, scenario_hash: &str) -> Self {
        Self {
            challenge_id: challenge_id.to_string(),
            identity: identity.to_string(),
            source_id: None,
            state: None,
            scenario_hash: scenario_hash.to_string(),
            since: Utc::now(),
            last_renew: None,
            until: None,
            connection_info: String::new(),
            flag: None,
            outputs: HashMap::new(),
        }
    }

    /// A freshly deployed instance already bound to a tenant.
    pub fn claimed(challenge_id: &str, identity: &str, source_id: &str, scenario_hash: &str) -> Self {
        let mut instance = Self::pooled(challenge_id, identity, scenario_hash);
        instance.source_id = Some(source_id.to_string());
        instance
    }

    /// Whether a tenant holds this instance.
    pub fn is_claimed(&self) -> bool {
        self.source_id.is_some()
    }

    /// The name this instance locks under: the source for claimed
    /// instances, the opaque identity while pool-held.
    pub fn lock_name(&self) -> &str {
        self.source_id.as_deref().unwrap_or(&self.identity)
    }

    /// Whether the instance is past its expiry at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.until, Some(until) if until <= now)
    }

    /// Whether the deployed scenario differs from the challenge's current one.
    pub fn is_drifted(&self, challenge_hash: &str) -> bool {
        self.scenario_hash != challenge_hash
    }
}
