//! Challenge lifecycle operations
//!
//! Point operations take `totw` as reader and the challenge key as writer
//! (create/update/delete) or reader (retrieve). Fleet-wide listing is the
//! one `totw` writer. Any operation that must touch every instance runs the
//! two-barrier fan-out: the challenge lock is held only until each worker
//! holds its own instance lock, then released while the slow work finishes.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::info;
use uuid::Uuid;

use super::LifecycleManager;
use crate::errors::{Error, Result};
use crate::fanout::{Handoff, TaskGroup};
use crate::lock::{keys, Held};
use crate::model::{Challenge, ChallengePatch, Instance, PoolBounds, UpdateStrategy};
use crate::pool;
use crate::provision;

/// Request to create a challenge.
#[derive(Clone, Debug)]
pub struct CreateChallenge {
    pub id: String,
    pub scenario_directory: PathBuf,
    pub until: Option<DateTime<Utc>>,
    pub timeout_secs: Option<u64>,
    pub update_strategy: UpdateStrategy,
    pub pool: PoolBounds,
    pub additional: HashMap<String, String>,
}

impl CreateChallenge {
    pub fn new(id: impl Into<String>, scenario_directory: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            scenario_directory: scenario_directory.into(),
            until: None,
            timeout_secs: None,
            update_strategy: UpdateStrategy::default(),
            pool: PoolBounds::default(),
            additional: HashMap::new(),
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
}

/// A challenge with its current instances.
#[derive(Clone, Debug)]
pub struct ChallengeSummary {
    pub challenge: Challenge,
    pub instances: Vec<Instance>,
}

/// Work items of the update cascade.
enum UpdateTask {
    /// Mirror the new expiry and redeploy when drifted.
    Refresh(Instance),
    /// Destroy an unclaimed pooled instance (pool shrank).
    Retire(Instance),
    /// Deploy an additional pooled instance (pool grew).
    Extend,
}

pub(crate) fn pool_identity() -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("pool-{}", &uuid[..12])
}

impl LifecycleManager {
    /// Create a challenge and warm its pool. Fails if one already exists
    /// for that ID.
    pub async fn create_challenge(&self, request: CreateChallenge) -> Result<Challenge> {
        let scenario_hash = provision::scenario_hash(&request.scenario_directory)?;
        let mut challenge = Challenge::new(request.id, request.scenario_directory, scenario_hash);
        challenge.until = request.until;
        challenge.timeout_secs = request.timeout_secs;
        challenge.update_strategy = request.update_strategy;
        challenge.pool = request.pool;
        challenge.additional = request.additional;
        challenge.validate()?;

        let totw = self.totw_read().await?;
        let result = self.create_challenge_locked(challenge).await;
        totw.release().await;
        result
    }

    async fn create_challenge_locked(&self, challenge: Challenge) -> Result<Challenge> {
        let chall_lock = self.challenge_write(&challenge.id).await?;
        let exists = match self.store().challenge_exists(&challenge.id).await {
            Ok(exists) => exists,
            Err(err) => {
                chall_lock.release().await;
                return Err(err.into());
            }
        };
        if exists {
            let id = challenge.id.clone();
            chall_lock.release().await;
            return Err(Error::AlreadyExists(id));
        }
        self.store().save_challenge(&challenge).await?;
        info!(challenge_id = %challenge.id, "challenge created");

        // Warm the pool; the challenge lock drops as soon as every worker
        // holds its own instance lock.
        let warm = pool::desired_size(challenge.pool.min, challenge.pool.max, 0);
        let mut group = self.spawn_pool_creations(&challenge, warm);
        group.handoff().await;
        chall_lock.release().await;
        group.join_aggregated("create_challenge").await?;
        Ok(challenge)
    }

    pub(crate) fn spawn_pool_creations(&self, challenge: &Challenge, count: u32) -> TaskGroup<()> {
        let identities: Vec<String> = (0..count).map(|_| pool_identity()).collect();
        let manager = self.clone();
        let challenge = challenge.clone();
        TaskGroup::spawn(identities, move |identity, handoff| {
            let manager = manager.clone();
            let challenge = challenge.clone();
            async move {
                let lock = Held::write(
                    manager.locks(),
                    &keys::instance(&challenge.id, &identity),
                )
                .await?;
                handoff.passed();
                let result = manager
                    .deploy_instance(&challenge, &identity, None)
                    .await
                    .map(|_| ());
                lock.release().await;
                result
            }
        })
    }

    /// Retrieve one challenge with its instances.
    pub async fn retrieve_challenge(&self, id: &str) -> Result<ChallengeSummary> {
        let totw = self.totw_read().await?;
        let result = self.retrieve_challenge_locked(id).await;
        totw.release().await;
        result
    }

    async fn retrieve_challenge_locked(&self, id: &str) -> Result<ChallengeSummary> {
        let chall_lock = self.challenge_read(id).await?;
        let result = async {
            let challenge = self
                .store()
                .load_challenge(id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("challenge {id}")))?;
            // Listing skips per-instance locks: throughput over a perfect
            // snapshot for read-heavy retrieval.
            let instances = self.store().list_instances(id).await?;
            Ok(ChallengeSummary {
                challenge,
                instances,
            })
        }
        .await;
        chall_lock.release().await;
        result
    }

    /// Update a challenge, cascading the new expiry, scenario and pool
    /// bounds to its instances.
    pub async fn update_challenge(&self, id: &str, patch: ChallengePatch) -> Result<Challenge> {
        let totw = self.totw_read().await?;
        let result = self.update_challenge_locked(id, patch).await;
        totw.release().await;
        result
    }

    async fn update_challenge_locked(&self, id: &str, patch: ChallengePatch) -> Result<Challenge> {
        let chall_lock = self.challenge_write(id).await?;

        let prepared = async {
            let mut challenge = self
                .store()
                .load_challenge(id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("challenge {id}")))?;
            let old_pool = challenge.pool;
            challenge.apply(patch);
            // Rehash unconditionally: the directory's content may have
            // changed in place without the path changing.
            challenge.scenario_hash = provision::scenario_hash(&challenge.scenario_directory)?;
            challenge.validate()?;

            let instances = self.store().list_instances(id).await?;
            let claimed = instances.iter().filter(|i| i.is_claimed()).count() as u32;
            let delta = pool::delta(
                old_pool.min,
                challenge.pool.min,
                old_pool.max,
                challenge.pool.max,
                claimed,
            );
            self.store().save_challenge(&challenge).await?;
            info!(
                challenge_id = %id,
                pool_create = delta.create,
                pool_delete = delta.delete,
                "challenge updated"
            );
            Ok((challenge, instances, delta))
        }
        .await;

        let (challenge, instances, delta) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                chall_lock.release().await;
                return Err(err);
            }
        };

        // Pool shrinkage never evicts claimed instances: victims come from
        // the unclaimed pool only.
        let mut tasks = Vec::with_capacity(instances.len() + delta.create as usize);
        let mut victims = delta.delete;
        for instance in instances {
            if !instance.is_claimed() && victims > 0 {
                victims -= 1;
                tasks.push(UpdateTask::Retire(instance));
            } else {
                tasks.push(UpdateTask::Refresh(instance));
            }
        }
        for _ in 0..delta.create {
            tasks.push(UpdateTask::Extend);
        }

        let manager = self.clone();
        let fan_challenge = challenge.clone();
        let mut group = TaskGroup::spawn(tasks, move |task, handoff| {
            let manager = manager.clone();
            let challenge = fan_challenge.clone();
            async move { manager.run_update_task(challenge, task, handoff).await }
        });
        group.handoff().await;
        chall_lock.release().await;
        group.join_aggregated("update_challenge").await?;
        Ok(challenge)
    }

    async fn run_update_task(
        &self,
        challenge: Challenge,
        task: UpdateTask,
        handoff: Handoff,
    ) -> Result<()> {
        match task {
            UpdateTask::Extend => {
                let identity = pool_identity();
                let lock = Held::write(
                    self.locks(),
                    &keys::instance(&challenge.id, &identity),
                )
                .await?;
                handoff.passed();
                let result = self
                    .deploy_instance(&challenge, &identity, None)
                    .await
                    .map(|_| ());
                lock.release().await;
                result
            }
            UpdateTask::Retire(instance) => {
                let lock = Held::write(
                    self.locks(),
                    &keys::instance(&challenge.id, instance.lock_name()),
                )
                .await?;
                handoff.passed();
                let result = self.retire_instance(&challenge, &instance).await;
                lock.release().await;
                result
            }
            UpdateTask::Refresh(instance) => {
                let lock = Held::write(
                    self.locks(),
                    &keys::instance(&challenge.id, instance.lock_name()),
                )
                .await?;
                handoff.passed();
                let result = self.refresh_instance(&challenge, &instance.identity).await;
                lock.release().await;
                result
            }
        }
    }

    /// Delete a challenge and destroy every instance of it.
    pub async fn delete_challenge(&self, id: &str) -> Result<()> {
        let totw = self.totw_read().await?;
        let result = self.delete_challenge_locked(id).await;
        totw.release().await;
        result
    }

    async fn delete_challenge_locked(&self, id: &str) -> Result<()> {
        let chall_lock = self.challenge_write(id).await?;

        let loaded = async {
            let challenge = self
                .store()
                .load_challenge(id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("challenge {id}")))?;
            let instances = self.store().list_instances(id).await?;
            Ok((challenge, instances))
        }
        .await;
        let (challenge, instances) = match loaded {
            Ok(loaded) => loaded,
            Err(err) => {
                chall_lock.release().await;
                return Err(err);
            }
        };

        let manager = self.clone();
        let fan_challenge = challenge.clone();
        let mut group = TaskGroup::spawn(instances, move |instance, handoff| {
            let manager = manager.clone();
            let challenge = fan_challenge.clone();
            async move {
                let lock = Held::write(
                    manager.locks(),
                    &keys::instance(&challenge.id, instance.lock_name()),
                )
                .await?;
                handoff.passed();
                let result = manager.retire_instance(&challenge, &instance).await;
                lock.release().await;
                result
            }
        });
        group.handoff().await;

        // Every instance is pinned by its own lock now: the challenge can be
        // gone for new requests while the destroys catch up. The record goes
        // away even when some of them fail.
        self.store().delete_challenge(id).await?;
        info!(challenge_id = %id, "challenge deleted");
        chall_lock.release().await;

        group.join_aggregated("delete_challenge").await?;
        Ok(())
    }

    /// List every challenge with its instances. The only operation that
    /// needs a stable view of the whole namespace, hence the only `totw`
    /// writer: each worker is released from it as soon as it holds its own
    /// challenge read lock.
    pub async fn query_challenges(&self) -> Result<Vec<ChallengeSummary>> {
        let totw = self.totw_write().await?;
        let ids = match self.store().list_challenges().await {
            Ok(ids) => ids,
            Err(err) => {
                totw.release().await;
                return Err(err.into());
            }
        };

        let manager = self.clone();
        let mut group = TaskGroup::spawn(ids, move |id, handoff| {
            let manager = manager.clone();
            async move {
                let lock = Held::read(manager.locks(), &keys::challenge(&id)).await?;
                handoff.passed();
                let result = async {
                    match manager.store().load_challenge(&id).await? {
                        // Deleted between listing and locking.
                        None => Ok(None),
                        Some(challenge) => {
                            let instances = manager.store().list_instances(&id).await?;
                            Ok(Some(ChallengeSummary {
                                challenge,
                                instances,
                            }))
                        }
                    }
                }
                .await;
                lock.release().await;
                result
            }
        });
        group.handoff().await;
        totw.release().await;

        let summaries = group.join_aggregated("query_challenges").await?;
        Ok(summaries.into_iter().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::local::LocalLockFactory;
    use crate::service::testutil::{FailMode, FakeProvisionerFactory};
    use crate::store::SqliteStore;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn scenario_dir() -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.yml"), "services: {web: {}}").unwrap();
        dir
    }

    fn manager() -> (LifecycleManager, FakeProvisionerFactory, TempDir) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let provisioner = FakeProvisionerFactory::default();
        let locks = Arc::new(LocalLockFactory::new());
        let manager = LifecycleManager::new(store, Arc::new(provisioner.clone()), locks);
        (manager, provisioner, scenario_dir())
    }

    #[tokio::test]
    async fn test_create_and_retrieve() {
        let (manager, _prov, dir) = manager();
        let created = manager
            .create_challenge(CreateChallenge::new("web-intro", dir.path()).with_timeout_secs(600))
            .await
            .unwrap();
        assert_eq!(created.id, "web-intro");
        assert!(!created.scenario_hash.is_empty());

        let summary = manager.retrieve_challenge("web-intro").await.unwrap();
        assert_eq!(summary.challenge.id, "web-intro");
        assert!(summary.instances.is_empty());
    }

    #[tokio::test]
    async fn test_create_duplicate_rejected() {
        let (manager, _prov, dir) = manager();
        manager
            .create_challenge(CreateChallenge::new("web-intro", dir.path()))
            .await
            .unwrap();
        let err = manager
            .create_challenge(CreateChallenge::new("web-intro", dir.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_create_warms_pool() {
        let (manager, prov, dir) = manager();
        manager
            .create_challenge(CreateChallenge::new("web-intro", dir.path()).with_pool(2, 0))
            .await
            .unwrap();

        assert_eq!(prov.up_count(), 2);
        let summary = manager.retrieve_challenge("web-intro").await.unwrap();
        assert_eq!(summary.instances.len(), 2);
        assert!(summary.instances.iter().all(|i| !i.is_claimed()));
    }

    #[tokio::test]
    async fn test_retrieve_missing_is_not_found() {
        let (manager, _prov, _dir) = manager();
        assert!(matches!(
            manager.retrieve_challenge("nope").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_issues_one_destroy_per_instance() {
        let (manager, prov, dir) = manager();
        manager
            .create_challenge(CreateChallenge::new("web-intro", dir.path()).with_pool(3, 0))
            .await
            .unwrap();
        assert_eq!(prov.up_count(), 3);

        manager.delete_challenge("web-intro").await.unwrap();
        assert_eq!(prov.destroy_count(), 3);
        assert!(matches!(
            manager.retrieve_challenge("web-intro").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_with_user_failure_still_removes_record() {
        let (manager, prov, dir) = manager();
        manager
            .create_challenge(CreateChallenge::new("web-intro", dir.path()).with_pool(3, 0))
            .await
            .unwrap();
        let victim = manager.retrieve_challenge("web-intro").await.unwrap().instances[0]
            .identity
            .clone();
        prov.fail_destroy(&victim, FailMode::User);

        let err = manager.delete_challenge("web-intro").await.unwrap_err();
        assert!(!err.is_internal());
        assert!(err.to_string().contains("destroy refused"));

        // The record is gone regardless; the two healthy destroys ran.
        assert!(matches!(
            manager.retrieve_challenge("web-intro").await,
            Err(Error::NotFound(_))
        ));
        assert_eq!(prov.destroy_count(), 2);
    }

    #[tokio::test]
    async fn test_delete_with_internal_failure_surfaces_generically() {
        let (manager, prov, dir) = manager();
        manager
            .create_challenge(CreateChallenge::new("web-intro", dir.path()).with_pool(2, 0))
            .await
            .unwrap();
        let victim = manager.retrieve_challenge("web-intro").await.unwrap().instances[0]
            .identity
            .clone();
        prov.fail_destroy(&victim, FailMode::Internal);

        let err = manager.delete_challenge("web-intro").await.unwrap_err();
        assert!(err.is_internal());
        assert_eq!(err.to_string(), "internal error");
        assert!(matches!(
            manager.retrieve_challenge("web-intro").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_update_grows_pool() {
        let (manager, prov, dir) = manager();
        manager
            .create_challenge(CreateChallenge::new("web-intro", dir.path()).with_pool(1, 0))
            .await
            .unwrap();
        assert_eq!(prov.up_count(), 1);

        manager
            .update_challenge(
                "web-intro",
                ChallengePatch {
                    pool: Some(PoolBounds { min: 3, max: 0 }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(prov.up_count(), 3);
        let summary = manager.retrieve_challenge("web-intro").await.unwrap();
        assert_eq!(summary.instances.len(), 3);
    }

    #[tokio::test]
    async fn test_update_shrinks_pool_without_touching_claimed() {
        let (manager, prov, dir) = manager();
        manager
            .create_challenge(
                CreateChallenge::new("web-intro", dir.path()).with_timeout_secs(600),
            )
            .await
            .unwrap();
        // Claim first (a direct deploy, the pool is empty), then grow the
        // pool, then shrink it back down.
        let claimed = manager.create_instance("web-intro", "team-a").await.unwrap();
        assert!(claimed.is_claimed());
        manager
            .update_challenge(
                "web-intro",
                ChallengePatch {
                    pool: Some(PoolBounds { min: 3, max: 0 }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(prov.up_count(), 4);

        manager
            .update_challenge(
                "web-intro",
                ChallengePatch {
                    pool: Some(PoolBounds { min: 1, max: 0 }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let summary = manager.retrieve_challenge("web-intro").await.unwrap();
        let claimed_left = summary.instances.iter().filter(|i| i.is_claimed()).count();
        let pooled_left = summary.instances.iter().filter(|i| !i.is_claimed()).count();
        assert_eq!(claimed_left, 1, "claimed instances are never evicted");
        assert_eq!(pooled_left, 1);
        assert_eq!(prov.destroy_count(), 2);
    }

    #[tokio::test]
    async fn test_update_redeploys_drifted_instances() {
        let (manager, prov, dir) = manager();
        manager
            .create_challenge(
                CreateChallenge::new("web-intro", dir.path()).with_timeout_secs(600),
            )
            .await
            .unwrap();
        manager.create_instance("web-intro", "team-a").await.unwrap();
        assert_eq!(prov.up_count(), 1);

        // Change the scenario in place; the update rehashes and redeploys.
        std::fs::write(dir.path().join("main.yml"), "services: {web: {}, db: {}}").unwrap();
        let updated = manager
            .update_challenge("web-intro", ChallengePatch::default())
            .await
            .unwrap();

        assert_eq!(prov.up_count(), 2);
        let summary = manager.retrieve_challenge("web-intro").await.unwrap();
        assert_eq!(summary.instances[0].scenario_hash, updated.scenario_hash);
    }

    #[tokio::test]
    async fn test_update_mirrors_new_expiry() {
        let (manager, _prov, dir) = manager();
        manager
            .create_challenge(
                CreateChallenge::new("web-intro", dir.path()).with_timeout_secs(600),
            )
            .await
            .unwrap();
        manager.create_instance("web-intro", "team-a").await.unwrap();

        let before = Utc::now();
        manager
            .update_challenge(
                "web-intro",
                ChallengePatch {
                    timeout_secs: Some(Some(7200)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let instance = manager.retrieve_instance("web-intro", "team-a").await.unwrap();
        let until = instance.until.expect("instance must stay bounded");
        let lower = before + chrono::Duration::seconds(7190);
        let upper = Utc::now() + chrono::Duration::seconds(7210);
        assert!(until > lower && until < upper, "until {until} outside {lower}..{upper}");
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let (manager, _prov, _dir) = manager();
        assert!(matches!(
            manager
                .update_challenge("nope", ChallengePatch::default())
                .await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_query_challenges() {
        let (manager, _prov, dir) = manager();
        manager
            .create_challenge(CreateChallenge::new("crypto-a", dir.path()))
            .await
            .unwrap();
        manager
            .create_challenge(CreateChallenge::new("pwn-b", dir.path()).with_pool(1, 0))
            .await
            .unwrap();

        let mut summaries = manager.query_challenges().await.unwrap();
        summaries.sort_by(|a, b| a.challenge.id.cmp(&b.challenge.id));
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].challenge.id, "crypto-a");
        assert_eq!(summaries[1].instances.len(), 1);
    }
}
