//! Lifecycle operations
//!
//! One [`LifecycleManager`] per replica, sharing nothing with its siblings
//! but the store and the lock space. Every operation follows the same
//! protocol: acquire lock keys strictly top-down (`totw`, then the
//! challenge, then the instance), do the slow work outside coarse locks via
//! the two-barrier fan-out, release everything on every exit path.
//!
//! Error exits release held locks through the guard's drop path; the happy
//! path releases explicitly so the handoff ordering stays visible in the
//! code.

mod challenge;
mod instance;

pub use challenge::{ChallengeSummary, CreateChallenge};

use std::sync::Arc;

use crate::errors::Result;
use crate::lock::{keys, Held, LockFactory};
use crate::provision::ProvisionerFactory;
use crate::store::Store;

/// Manages the lifecycle of challenges and their instances.
#[derive(Clone)]
pub struct LifecycleManager {
    store: Arc<dyn Store>,
    provisioner: Arc<dyn ProvisionerFactory>,
    locks: Arc<dyn LockFactory>,
}

impl LifecycleManager {
    pub fn new(
        store: Arc<dyn Store>,
        provisioner: Arc<dyn ProvisionerFactory>,
        locks: Arc<dyn LockFactory>,
    ) -> Self {
        Self {
            store,
            provisioner,
            locks,
        }
    }

    pub(crate) fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub(crate) fn locks(&self) -> &dyn LockFactory {
        self.locks.as_ref()
    }

    pub(crate) fn provisioner(&self) -> &dyn ProvisionerFactory {
        self.provisioner.as_ref()
    }

    pub(crate) async fn totw_read(&self) -> Result<Held> {
        Ok(Held::read(self.locks.as_ref(), keys::TOTW).await?)
    }

    pub(crate) async fn totw_write(&self) -> Result<Held> {
        Ok(Held::write(self.locks.as_ref(), keys::TOTW).await?)
    }

    pub(crate) async fn challenge_read(&self, id: &str) -> Result<Held> {
        Ok(Held::read(self.locks.as_ref(), &keys::challenge(id)).await?)
    }

    pub(crate) async fn challenge_write(&self, id: &str) -> Result<Held> {
        Ok(Held::write(self.locks.as_ref(), &keys::challenge(id)).await?)
    }

    pub(crate) async fn instance_read(&self, challenge_id: &str, name: &str) -> Result<Held> {
        Ok(Held::read(self.locks.as_ref(), &keys::instance(challenge_id, name)).await?)
    }

    pub(crate) async fn instance_write(&self, challenge_id: &str, name: &str) -> Result<Held> {
        Ok(Held::write(self.locks.as_ref(), &keys::instance(challenge_id, name)).await?)
    }
}
