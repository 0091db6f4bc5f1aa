//! Data persistence layer
//!
//! Persisted records are shared by every replica; the lock hierarchy, not
//! the store, governs who may mutate a given record. Backends implement
//! [`Store`]; a SQLite reference backend ships here.

mod sqlite;

pub use sqlite::SqliteStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{Challenge, Instance};

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors raised by storage backends
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Corrupt(err.to_string())
    }
}

/// Persistence surface consumed by the lifecycle operations.
#[async_trait]
pub trait Store: Send + Sync {
    async fn load_challenge(&self, id: &str) -> StoreResult<Option<Challenge>>;
    async fn save_challenge(&self, challenge: &Challenge) -> StoreResult<()>;
    async fn delete_challenge(&self, id: &str) -> StoreResult<()>;
    async fn list_challenges(&self) -> StoreResult<Vec<String>>;
    async fn challenge_exists(&self, id: &str) -> StoreResult<bool>;

    async fn load_instance(
        &self,
        challenge_id: &str,
        identity: &str,
    ) -> StoreResult<Option<Instance>>;
    async fn save_instance(&self, instance: &Instance) -> StoreResult<()>;
    async fn delete_instance(&self, challenge_id: &str, identity: &str) -> StoreResult<()>;
    async fn list_instances(&self, challenge_id: &str) -> StoreResult<Vec<Instance>>;
    async fn find_instance_by_source(
        &self,
        challenge_id: &str,
        source_id: &str,
    ) -> StoreResult<Option<Instance>>;
}
