//! Provisioning engine surface
//!
//! The engine that actually creates and destroys infrastructure is an
//! external capability: this core hands it a scenario directory and an
//! identity, and round-trips the opaque state blob it returns. Every call
//! here is potentially slow (minutes) and therefore always happens outside
//! any coarse lock.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use walkdir::WalkDir;

use crate::model::Challenge;

/// Result type for provisioning calls
pub type ProvisionResult<T> = std::result::Result<T, ProvisionError>;

/// Errors raised by the provisioning engine
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// The scenario itself is unusable; surfaced to the caller verbatim.
    #[error("{0}")]
    Scenario(String),

    /// The deployment failed for a reason the caller caused or can act on.
    #[error("{0}")]
    Failed(String),

    /// Engine-internal failure; logged in full, surfaced generically.
    #[error("{0}")]
    Internal(String),
}

/// Outputs a deployed stack hands back to the tenant.
#[derive(Clone, Debug, Default)]
pub struct StackOutputs {
    pub connection_info: String,
    pub flag: Option<String>,
    pub outputs: HashMap<String, String>,
}

/// A handle on one declared stack.
#[async_trait]
pub trait Provisioner: Send {
    /// Deploy the stack. Returns the scenario outputs and an opaque state
    /// blob the caller persists for later [`Provisioner::import`].
    async fn up(&mut self) -> ProvisionResult<(StackOutputs, String)>;

    /// Tear the stack down.
    async fn destroy(&mut self) -> ProvisionResult<()>;

    /// Load previously persisted state, before a destroy or redeploy.
    async fn import(&mut self, state: &str) -> ProvisionResult<()>;

    /// Forward opaque configuration values to the stack.
    async fn set_config(&mut self, values: &HashMap<String, String>) -> ProvisionResult<()>;
}

/// Mints [`Provisioner`] handles, one per (challenge, identity) stack.
pub trait ProvisionerFactory: Send + Sync {
    fn open(&self, challenge: &Challenge, identity: &str) -> ProvisionResult<Box<dyn Provisioner>>;
}

/// Content hash of a scenario directory: relative paths and file contents in
/// deterministic order. Instances record the hash they were deployed from;
/// a mismatch after an update is what marks them for redeployment.
pub fn scenario_hash(dir: &Path) -> ProvisionResult<String> {
    if !dir.is_dir() {
        return Err(ProvisionError::Scenario(format!(
            "scenario directory not found: {}",
            dir.display()
        )));
    }

    let mut hasher = Sha256::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry =
            entry.map_err(|e| ProvisionError::Scenario(format!("unreadable scenario: {e}")))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(dir)
            .map_err(|e| ProvisionError::Internal(e.to_string()))?;
        hasher.update(relative.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        let contents = std::fs::read(entry.path())
            .map_err(|e| ProvisionError::Scenario(format!("unreadable scenario file: {e}")))?;
        hasher.update(&contents);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_scenario_hash_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("main.yml"), "services: {}").unwrap();
        fs::write(dir.path().join("flag.txt"), "FLAG{x}").unwrap();

        let first = scenario_hash(dir.path()).unwrap();
        let second = scenario_hash(dir.path()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_scenario_hash_tracks_content_changes() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("main.yml"), "services: {}").unwrap();
        let before = scenario_hash(dir.path()).unwrap();

        fs::write(dir.path().join("main.yml"), "services: {web: {}}").unwrap();
        let after = scenario_hash(dir.path()).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn test_missing_directory_is_a_scenario_error() {
        let result = scenario_hash(Path::new("/nonexistent/scenario"));
        assert!(matches!(result, Err(ProvisionError::Scenario(_))));
    }
}
