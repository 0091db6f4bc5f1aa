//! Challenge record and update strategies

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::errors::{Error, Result};

/// How running instances are brought up to date after a scenario change
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStrategy {
    /// Reuse the existing stack state and redeploy over it
    #[default]
    InPlace,
    /// Stand the replacement up before tearing the old stack down
    BlueGreen,
    /// Tear down, then deploy from scratch
    Recreate,
}

/// Bounds on how many unclaimed instances to keep pre-provisioned
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PoolBounds {
    /// Lower bound on the warm pool
    pub min: u32,
    /// Upper bound on total instances; 0 means unbounded
    pub max: u32,
}

/// A deployable challenge definition
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Challenge {
    /// Unique challenge ID
    pub id: String,
    /// Scenario directory the provisioner deploys from
    pub scenario_directory: PathBuf,
    /// Content hash of the scenario directory, for drift detection
    pub scenario_hash: String,
    /// Absolute expiry applied to every instance, if set
    pub until: Option<DateTime<Utc>>,
    /// Relative instance TTL in seconds, if set
    pub timeout_secs: Option<u64>,
    /// Strategy used when an update must redeploy instances
    #[serde(default)]
    pub update_strategy: UpdateStrategy,
    /// Warm pool bounds
    #[serde(default)]
    pub pool: PoolBounds,
    /// Opaque key/value configuration forwarded to the provisioner
    #[serde(default)]
    pub additional: HashMap<String, String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

/// Fields an update may change; `None` leaves the current value in place
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChallengePatch {
    pub scenario_directory: Option<PathBuf>,
    pub until: Option<Option<DateTime<Utc>>>,
    pub timeout_secs: Option<Option<u64>>,
    pub update_strategy: Option<UpdateStrategy>,
    pub pool: Option<PoolBounds>,
    pub additional: Option<HashMap<String, String>>,
}

impl Challenge {
    pub fn new(id: String, scenario_directory: PathBuf, scenario_hash: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            scenario_directory,
            scenario_hash,
            until: None,
            timeout_secs: None,
            update_strategy: UpdateStrategy::default(),
            pool: PoolBounds::default(),
            additional: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    pub fn with_pool(mut self, min: u32, max: u32) -> Self {
        self.pool = PoolBounds { min, max };
        self
    }

    pub fn with_update_strategy(mut self, strategy: UpdateStrategy) -> Self {
        self.update_strategy = strategy;
        self
    }

    /// Relative TTL as a chrono duration
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(|s| Duration::seconds(s as i64))
    }

    /// Expiry an instance deployed (or claimed) at `now` gets:
    /// min(now + timeout, until). None when neither bound is set.
    pub fn effective_until(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match (self.timeout(), self.until) {
            (Some(timeout), Some(until)) => Some((now + timeout).min(until)),
            (Some(timeout), None) => Some(now + timeout),
            (None, Some(until)) => Some(until),
            (None, None) => None,
        }
    }

    /// Validate the record before persisting.
    pub fn validate(&self) -> Result<()> {
        validate_id(&self.id)?;
        if self.pool.max != 0 && self.pool.min > self.pool.max {
            return Err(Error::ValidationFailed(format!(
                "pool min {} exceeds max {}",
                self.pool.min, self.pool.max
            )));
        }
        if self.timeout_secs == Some(0) {
            return Err(Error::ValidationFailed(
                "timeout must be at least one second".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply an update patch, bumping `updated_at`. Returns whether the
    /// scenario directory changed (the caller rehashes and redeploys).
    pub fn apply(&mut self, patch: ChallengePatch) -> bool {
        let mut scenario_changed = false;
        if let Some(dir) = patch.scenario_directory {
            if dir != self.scenario_directory {
                self.scenario_directory = dir;
                scenario_changed = true;
            }
        }
        if let Some(until) = patch.until {
            self.until = until;
        }
        if let Some(timeout) = patch.timeout_secs {
            self.timeout_secs = timeout;
        }
        if let Some(strategy) = patch.update_strategy {
            self.update_strategy = strategy;
        }
        if let Some(pool) = patch.pool {
            self.pool = pool;
        }
        if let Some(additional) = patch.additional {
            self.additional = additional;
        }
        self.updated_at = Utc::now();
        scenario_changed
    }
}

/// Challenge and source IDs share one character policy: they appear in lock
/// keys and provisioner workspace paths, so keep them flat and unambiguous.
pub(crate) fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::ValidationFailed("id must not be empty".to_string()));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
    {
        return Err(Error::ValidationFailed(format!(
            "id {id:?} may only contain lowercase letters, digits, '-' and '_'"
        )));
    }
    Ok(())
}
