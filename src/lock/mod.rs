//! Hierarchical distributed reader-writer locking
//!
//! One lock handle protects one logical key. Handles are minted by a
//! [`LockFactory`] owned by the service instance, so replicas and tests
//! compose their own lock space instead of sharing a process-global
//! registry. Two backends provide the same contract:
//!
//! - [`local::LocalLockFactory`] - per-key native rwlocks, single replica
//! - [`redis::RedisLockFactory`] - the writer-preference construction over a
//!   shared coordination store, for multi-replica deployments
//!
//! Acquisition across keys always follows the top-down order documented in
//! [`keys`].

pub mod dist;
pub mod keys;
pub mod local;
pub mod redis;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

/// Result type for lock operations
pub type LockResult<T> = std::result::Result<T, LockError>;

/// Errors raised by lock backends
#[derive(Error, Debug)]
pub enum LockError {
    /// Coordination-store failure or acquisition deadline exceeded.
    /// Transient: the caller may retry. Never returned for a granted lock.
    #[error("lock unavailable: {0}")]
    Unavailable(String),

    /// Unlock without lock, double lock, and similar programming errors.
    #[error("lock misuse on {key}: {reason}")]
    Misuse { key: String, reason: String },
}

impl LockError {
    pub(crate) fn misuse(key: &str, reason: &str) -> Self {
        LockError::Misuse {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// A reader-writer lock handle over one logical key.
///
/// Many readers may hold the lock concurrently; a writer excludes readers
/// and other writers; a waiting writer is served before readers that arrive
/// after it. The handle is scoped to one request or one fan-out worker.
#[async_trait]
pub trait RwLock: Send {
    /// The logical key this handle locks.
    fn key(&self) -> &str;

    async fn read_lock(&mut self) -> LockResult<()>;
    async fn read_unlock(&mut self) -> LockResult<()>;
    async fn write_lock(&mut self) -> LockResult<()>;
    async fn write_unlock(&mut self) -> LockResult<()>;

    /// Release the underlying session. Safe to call after unlock failures;
    /// must never grant anything.
    async fn close(&mut self) -> LockResult<()>;
}

/// Mints lock handles. Injected into the service instance.
#[async_trait]
pub trait LockFactory: Send + Sync {
    async fn create(&self, key: &str) -> LockResult<Box<dyn RwLock>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Read,
    Write,
}

/// A held lock with guaranteed release on every exit path.
///
/// The happy path calls [`Held::release`] explicitly; dropping a still-held
/// guard (error return, cancellation) spawns a best-effort release whose
/// failure is logged and never propagated.
pub struct Held {
    inner: Option<Box<dyn RwLock>>,
    mode: Option<Mode>,
    key: String,
}

impl Held {
    /// Acquire `key` in read mode.
    pub async fn read(factory: &dyn LockFactory, key: &str) -> LockResult<Held> {
        let mut lock = factory.create(key).await?;
        if let Err(err) = lock.read_lock().await {
            let _ = lock.close().await;
            return Err(err);
        }
        tracing::debug!(key, mode = "read", "lock acquired");
        Ok(Held {
            inner: Some(lock),
            mode: Some(Mode::Read),
            key: key.to_string(),
        })
    }

    /// Acquire `key` in write mode.
    pub async fn write(factory: &dyn LockFactory, key: &str) -> LockResult<Held> {
        let mut lock = factory.create(key).await?;
        if let Err(err) = lock.write_lock().await {
            let _ = lock.close().await;
            return Err(err);
        }
        tracing::debug!(key, mode = "write", "lock acquired");
        Ok(Held {
            inner: Some(lock),
            mode: Some(Mode::Write),
            key: key.to_string(),
        })
    }

    /// Release the lock. Failures are logged, never returned: by this point
    /// the operation's own result is what the caller needs to see.
    pub async fn release(mut self) {
        if let (Some(mut lock), Some(mode)) = (self.inner.take(), self.mode.take()) {
            release_quietly(&mut lock, mode).await;
        }
    }
}

async fn release_quietly(lock: &mut Box<dyn RwLock>, mode: Mode) {
    let result = match mode {
        Mode::Read => lock.read_unlock().await,
        Mode::Write => lock.write_unlock().await,
    };
    if let Err(err) = result {
        warn!(key = %lock.key(), ?mode, error = %err, "failed to release lock");
    }
    if let Err(err) = lock.close().await {
        warn!(key = %lock.key(), error = %err, "failed to close lock session");
    }
    tracing::debug!(key = %lock.key(), ?mode, "lock released");
}

impl Drop for Held {
    fn drop(&mut self) {
        if let (Some(mut lock), Some(mode)) = (self.inner.take(), self.mode.take()) {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        release_quietly(&mut lock, mode).await;
                    });
                }
                Err(_) => {
                    warn!(key = %self.key, "lock guard dropped outside a runtime; relying on lease expiry");
                }
            }
        }
    }
}
