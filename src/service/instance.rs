//! Instance lifecycle operations
//!
//! Instance-scoped operations take `totw` and the challenge key as readers
//! (the challenge only has to keep existing) and the instance key as writer
//! for any mutation, reader for retrieval. Claiming a pooled instance locks
//! the pooled identity's own key as well, so an in-flight cascade worker on
//! that instance serializes correctly with the claim.

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use super::LifecycleManager;
use crate::errors::{Error, Result};
use crate::model::{validate_id, Challenge, Instance, UpdateStrategy};
use crate::pool;
use crate::provision::StackOutputs;
use crate::renewal;

impl LifecycleManager {
    /// Create (or claim) the instance of `challenge_id` for `source_id`.
    /// At most one claimed instance exists per (challenge, source).
    pub async fn create_instance(&self, challenge_id: &str, source_id: &str) -> Result<Instance> {
        validate_id(source_id)?;
        let totw = self.totw_read().await?;
        let result = self.create_instance_locked(challenge_id, source_id).await;
        totw.release().await;
        result
    }

    async fn create_instance_locked(
        &self,
        challenge_id: &str,
        source_id: &str,
    ) -> Result<Instance> {
        let chall_lock = self.challenge_read(challenge_id).await?;
        let result = self.create_instance_inner(challenge_id, source_id).await;
        chall_lock.release().await;
        result
    }

    async fn create_instance_inner(
        &self,
        challenge_id: &str,
        source_id: &str,
    ) -> Result<Instance> {
        let challenge = self
            .store()
            .load_challenge(challenge_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("challenge {challenge_id}")))?;

        let inst_lock = self.instance_write(challenge_id, source_id).await?;
        let result = async {
            if self
                .store()
                .find_instance_by_source(challenge_id, source_id)
                .await?
                .is_some()
            {
                return Err(Error::AlreadyExists(format!(
                    "instance {challenge_id}/{source_id}"
                )));
            }
            if let Some(claimed) = self.claim_pooled(&challenge, source_id).await? {
                return Ok(claimed);
            }
            // Nothing warm: provision a dedicated stack under the source's
            // own identity.
            self.deploy_instance(&challenge, source_id, Some(source_id))
                .await
        }
        .await;
        inst_lock.release().await;
        result
    }

    /// Claim an unclaimed pooled instance, if one is available. Candidates
    /// are re-validated under their own lock; a raced-away candidate just
    /// means trying the next one.
    async fn claim_pooled(
        &self,
        challenge: &Challenge,
        source_id: &str,
    ) -> Result<Option<Instance>> {
        let pooled: Vec<Instance> = self
            .store()
            .list_instances(&challenge.id)
            .await?
            .into_iter()
            .filter(|i| !i.is_claimed())
            .collect();

        for candidate in pooled {
            let lock = self
                .instance_write(&challenge.id, &candidate.identity)
                .await?;
            let claim: Result<Option<Instance>> = async {
                match self
                    .store()
                    .load_instance(&challenge.id, &candidate.identity)
                    .await?
                {
                    Some(mut instance) if !instance.is_claimed() => {
                        let now = Utc::now();
                        instance.source_id = Some(source_id.to_string());
                        instance.until = challenge.effective_until(now);
                        instance.last_renew = None;
                        self.store().save_instance(&instance).await?;
                        Ok(Some(instance))
                    }
                    // Claimed or retired since the listing.
                    _ => Ok(None),
                }
            }
            .await;
            lock.release().await;

            match claim? {
                Some(instance) => {
                    info!(
                        challenge_id = %challenge.id,
                        source_id,
                        identity = %instance.identity,
                        "pool instance claimed"
                    );
                    self.refill_pool_detached(challenge.id.clone());
                    return Ok(Some(instance));
                }
                None => continue,
            }
        }
        Ok(None)
    }

    /// Top the warm pool back up after a claim, off the claiming request's
    /// path. Failures never fail the claim.
    fn refill_pool_detached(&self, challenge_id: String) {
        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(err) = manager.refill_pool(&challenge_id).await {
                warn!(challenge_id = %challenge_id, error = %err, "pool refill failed");
            }
        });
    }

    async fn refill_pool(&self, challenge_id: &str) -> Result<()> {
        let totw = self.totw_read().await?;
        let result = self.refill_pool_locked(challenge_id).await;
        totw.release().await;
        result
    }

    async fn refill_pool_locked(&self, challenge_id: &str) -> Result<()> {
        let chall_lock = self.challenge_read(challenge_id).await?;
        let prepared = async {
            let Some(challenge) = self.store().load_challenge(challenge_id).await? else {
                // Deleted while the refill was queued.
                return Ok(None);
            };
            let instances = self.store().list_instances(challenge_id).await?;
            let claimed = instances.iter().filter(|i| i.is_claimed()).count() as u32;
            let unclaimed = instances.len() as u32 - claimed;
            let desired = pool::desired_size(challenge.pool.min, challenge.pool.max, claimed);
            Ok(Some((challenge, desired.saturating_sub(unclaimed))))
        }
        .await;

        match prepared {
            Ok(Some((challenge, missing))) if missing > 0 => {
                let mut group = self.spawn_pool_creations(&challenge, missing);
                group.handoff().await;
                chall_lock.release().await;
                group.join_aggregated("refill_pool").await?;
                Ok(())
            }
            Ok(_) => {
                chall_lock.release().await;
                Ok(())
            }
            Err(err) => {
                chall_lock.release().await;
                Err(err)
            }
        }
    }

    /// Retrieve the instance claimed by `source_id`.
    pub async fn retrieve_instance(&self, challenge_id: &str, source_id: &str) -> Result<Instance> {
        let totw = self.totw_read().await?;
        let result = self.retrieve_instance_locked(challenge_id, source_id).await;
        totw.release().await;
        result
    }

    async fn retrieve_instance_locked(
        &self,
        challenge_id: &str,
        source_id: &str,
    ) -> Result<Instance> {
        let chall_lock = self.challenge_read(challenge_id).await?;
        let result = async {
            if self.store().load_challenge(challenge_id).await?.is_none() {
                return Err(Error::NotFound(format!("challenge {challenge_id}")));
            }
            let inst_lock = self.instance_read(challenge_id, source_id).await?;
            let found = self
                .store()
                .find_instance_by_source(challenge_id, source_id)
                .await;
            inst_lock.release().await;
            found?.ok_or_else(|| Error::NotFound(format!("instance {challenge_id}/{source_id}")))
        }
        .await;
        chall_lock.release().await;
        result
    }

    /// Re-sync one instance with its challenge's current definition: mirror
    /// the expiry and redeploy when the deployed scenario drifted. The
    /// challenge update cascade applies the same effect fleet-wide.
    pub async fn update_instance(&self, challenge_id: &str, source_id: &str) -> Result<Instance> {
        let totw = self.totw_read().await?;
        let result = self.update_instance_locked(challenge_id, source_id).await;
        totw.release().await;
        result
    }

    async fn update_instance_locked(
        &self,
        challenge_id: &str,
        source_id: &str,
    ) -> Result<Instance> {
        let chall_lock = self.challenge_read(challenge_id).await?;
        let result = async {
            let challenge = self
                .store()
                .load_challenge(challenge_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("challenge {challenge_id}")))?;

            let inst_lock = self.instance_write(challenge_id, source_id).await?;
            let updated = async {
                let instance = self
                    .store()
                    .find_instance_by_source(challenge_id, source_id)
                    .await?
                    .ok_or_else(|| {
                        Error::NotFound(format!("instance {challenge_id}/{source_id}"))
                    })?;

                self.refresh_instance(&challenge, &instance.identity).await?;
                self.store()
                    .load_instance(challenge_id, &instance.identity)
                    .await?
                    .ok_or_else(|| {
                        Error::NotFound(format!("instance {challenge_id}/{source_id}"))
                    })
            }
            .await;
            inst_lock.release().await;
            updated
        }
        .await;
        chall_lock.release().await;
        result
    }

    /// Extend the instance's expiry by one timeout window.
    pub async fn renew_instance(&self, challenge_id: &str, source_id: &str) -> Result<Instance> {
        let totw = self.totw_read().await?;
        let result = self.renew_instance_locked(challenge_id, source_id).await;
        totw.release().await;
        result
    }

    async fn renew_instance_locked(
        &self,
        challenge_id: &str,
        source_id: &str,
    ) -> Result<Instance> {
        let chall_lock = self.challenge_read(challenge_id).await?;
        let result = async {
            let challenge = self
                .store()
                .load_challenge(challenge_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("challenge {challenge_id}")))?;

            let inst_lock = self.instance_write(challenge_id, source_id).await?;
            let renewed = async {
                let mut instance = self
                    .store()
                    .find_instance_by_source(challenge_id, source_id)
                    .await?
                    .ok_or_else(|| {
                        Error::NotFound(format!("instance {challenge_id}/{source_id}"))
                    })?;

                let now = Utc::now();
                let new_until =
                    renewal::renew_until(challenge.timeout(), challenge.until, instance.until, now)?;
                instance.until = Some(new_until);
                instance.last_renew = Some(now);
                self.store().save_instance(&instance).await?;
                info!(
                    challenge_id,
                    source_id,
                    until = %new_until,
                    "instance renewed"
                );
                Ok(instance)
            }
            .await;
            inst_lock.release().await;
            renewed
        }
        .await;
        chall_lock.release().await;
        result
    }

    /// Destroy the instance claimed by `source_id` and drop its record.
    pub async fn delete_instance(&self, challenge_id: &str, source_id: &str) -> Result<()> {
        let totw = self.totw_read().await?;
        let result = self.delete_instance_locked(challenge_id, source_id).await;
        totw.release().await;
        result
    }

    async fn delete_instance_locked(&self, challenge_id: &str, source_id: &str) -> Result<()> {
        let chall_lock = self.challenge_read(challenge_id).await?;
        let result = async {
            let challenge = self
                .store()
                .load_challenge(challenge_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("challenge {challenge_id}")))?;

            let inst_lock = self.instance_write(challenge_id, source_id).await?;
            let deleted = async {
                let instance = self
                    .store()
                    .find_instance_by_source(challenge_id, source_id)
                    .await?
                    .ok_or_else(|| {
                        Error::NotFound(format!("instance {challenge_id}/{source_id}"))
                    })?;

                self.destroy_stack(&challenge, &instance).await?;
                self.store()
                    .delete_instance(challenge_id, &instance.identity)
                    .await?;
                info!(challenge_id, source_id, "instance deleted");
                Ok(())
            }
            .await;
            inst_lock.release().await;
            deleted
        }
        .await;
        chall_lock.release().await;
        result
    }

    /// List a challenge's instances. Per-instance locks are deliberately not
    /// taken here.
    pub async fn query_instances(&self, challenge_id: &str) -> Result<Vec<Instance>> {
        let totw = self.totw_read().await?;
        let result = async {
            let chall_lock = self.challenge_read(challenge_id).await?;
            let listed = async {
                if !self.store().challenge_exists(challenge_id).await? {
                    return Err(Error::NotFound(format!("challenge {challenge_id}")));
                }
                Ok(self.store().list_instances(challenge_id).await?)
            }
            .await;
            chall_lock.release().await;
            listed
        }
        .await;
        totw.release().await;
        result
    }

    /// Deploy a stack and persist its record. The instance's lock must
    /// already be held.
    pub(crate) async fn deploy_instance(
        &self,
        challenge: &Challenge,
        identity: &str,
        source_id: Option<&str>,
    ) -> Result<Instance> {
        let mut stack = self.provisioner().open(challenge, identity)?;
        stack.set_config(&challenge.additional).await?;
        let (outputs, state) = stack.up().await?;

        let mut instance = match source_id {
            Some(source) => {
                Instance::claimed(&challenge.id, identity, source, &challenge.scenario_hash)
            }
            None => Instance::pooled(&challenge.id, identity, &challenge.scenario_hash),
        };
        apply_outputs(&mut instance, outputs, state, &challenge.scenario_hash);
        if instance.is_claimed() {
            instance.until = challenge.effective_until(instance.since);
        }
        self.store().save_instance(&instance).await?;
        info!(
            challenge_id = %challenge.id,
            identity,
            claimed = instance.is_claimed(),
            "instance deployed"
        );
        Ok(instance)
    }

    /// Round-trip the persisted state into the engine and tear the stack
    /// down.
    pub(crate) async fn destroy_stack(
        &self,
        challenge: &Challenge,
        instance: &Instance,
    ) -> Result<()> {
        let mut stack = self.provisioner().open(challenge, &instance.identity)?;
        if let Some(state) = &instance.state {
            stack.import(state).await?;
        }
        stack.destroy().await?;
        Ok(())
    }

    /// Destroy a stack and drop its record. Used by the delete cascade and
    /// pool shrinkage; a failed destroy leaves the record behind as the
    /// orphan trace.
    pub(crate) async fn retire_instance(
        &self,
        challenge: &Challenge,
        instance: &Instance,
    ) -> Result<()> {
        match self
            .store()
            .load_instance(&challenge.id, &instance.identity)
            .await?
        {
            // Already gone.
            None => Ok(()),
            Some(current) => {
                self.destroy_stack(challenge, &current).await?;
                self.store()
                    .delete_instance(&challenge.id, &current.identity)
                    .await?;
                info!(
                    challenge_id = %challenge.id,
                    identity = %current.identity,
                    "instance destroyed"
                );
                Ok(())
            }
        }
    }

    /// Mirror the challenge's current expiry onto a claimed instance and
    /// redeploy the stack when its scenario drifted.
    pub(crate) async fn refresh_instance(&self, challenge: &Challenge, identity: &str) -> Result<()> {
        let Some(mut instance) = self.store().load_instance(&challenge.id, identity).await? else {
            // Retired since enumeration.
            return Ok(());
        };
        if instance.is_claimed() {
            instance.until = challenge.effective_until(Utc::now());
        }
        if instance.is_drifted(&challenge.scenario_hash) {
            self.redeploy(challenge, &mut instance).await?;
        }
        self.store().save_instance(&instance).await?;
        Ok(())
    }

    async fn redeploy(&self, challenge: &Challenge, instance: &mut Instance) -> Result<()> {
        match challenge.update_strategy {
            UpdateStrategy::InPlace => {
                let mut stack = self.provisioner().open(challenge, &instance.identity)?;
                if let Some(state) = &instance.state {
                    stack.import(state).await?;
                }
                stack.set_config(&challenge.additional).await?;
                let (outputs, state) = stack.up().await?;
                apply_outputs(instance, outputs, state, &challenge.scenario_hash);
            }
            UpdateStrategy::Recreate => {
                let mut stack = self.provisioner().open(challenge, &instance.identity)?;
                if let Some(state) = &instance.state {
                    stack.import(state).await?;
                    stack.destroy().await?;
                }
                stack.set_config(&challenge.additional).await?;
                let (outputs, state) = stack.up().await?;
                apply_outputs(instance, outputs, state, &challenge.scenario_hash);
            }
            UpdateStrategy::BlueGreen => {
                // Replacement first; the old stack goes down only once the
                // new one is live.
                let staging = {
                    let uuid = Uuid::new_v4().simple().to_string();
                    format!("{}-{}", instance.identity, &uuid[..8])
                };
                let mut next = self.provisioner().open(challenge, &staging)?;
                next.set_config(&challenge.additional).await?;
                let (outputs, state) = next.up().await?;

                let mut old = self.provisioner().open(challenge, &instance.identity)?;
                if let Some(old_state) = &instance.state {
                    old.import(old_state).await?;
                    old.destroy().await?;
                }
                apply_outputs(instance, outputs, state, &challenge.scenario_hash);
            }
        }
        info!(
            challenge_id = %challenge.id,
            identity = %instance.identity,
            strategy = ?challenge.update_strategy,
            "instance redeployed"
        );
        Ok(())
    }
}

fn apply_outputs(
    instance: &mut Instance,
    outputs: StackOutputs,
    state: String,
    scenario_hash: &str,
) {
    instance.state = Some(state);
    instance.connection_info = outputs.connection_info;
    instance.flag = outputs.flag;
    instance.outputs = outputs.outputs;
    instance.scenario_hash = scenario_hash.to_string();
}
