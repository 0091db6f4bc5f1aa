//! End-to-end lifecycle tests
//!
//! Drives the full manager - store, locks, fan-out, pool, renewal - against
//! an in-memory store, in-process locks and a recording fake engine.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::TempDir;

use instancer::lock::local::LocalLockFactory;
use instancer::provision::{
    ProvisionError, Provisioner, ProvisionerFactory, ProvisionResult, StackOutputs,
};
use instancer::store::{SqliteStore, Store};
use instancer::{Challenge, CreateChallenge, Error, LifecycleManager};

// ============================================================================
// TEST HELPERS
// ============================================================================

#[derive(Default)]
struct EngineLog {
    ups: Vec<String>,
    destroys: Vec<String>,
    refuse_destroy: Vec<String>,
}

/// Fake engine recording every deploy and destroy by identity.
#[derive(Clone, Default)]
struct RecordingEngine {
    log: Arc<Mutex<EngineLog>>,
}

impl RecordingEngine {
    fn ups(&self) -> usize {
        self.log.lock().ups.len()
    }

    fn destroys(&self) -> usize {
        self.log.lock().destroys.len()
    }

    fn refuse_destroy(&self, identity: &str) {
        self.log.lock().refuse_destroy.push(identity.to_string());
    }
}

impl ProvisionerFactory for RecordingEngine {
    fn open(&self, _challenge: &Challenge, identity: &str) -> ProvisionResult<Box<dyn Provisioner>> {
        Ok(Box::new(RecordingStack {
            identity: identity.to_string(),
            log: self.log.clone(),
        }))
    }
}

struct RecordingStack {
    identity: String,
    log: Arc<Mutex<EngineLog>>,
}

#[async_trait]
impl Provisioner for RecordingStack {
    async fn up(&mut self) -> ProvisionResult<(StackOutputs, String)> {
        self.log.lock().ups.push(self.identity.clone());
        let outputs = StackOutputs {
            connection_info: format!("ssh {}.challenge.local", self.identity),
            flag: Some(format!("FLAG{{{}}}", self.identity)),
            outputs: HashMap::new(),
        };
        Ok((outputs, format!("state-{}", self.identity)))
    }

    async fn destroy(&mut self) -> ProvisionResult<()> {
        let mut log = self.log.lock();
        if log.refuse_destroy.contains(&self.identity) {
            return Err(ProvisionError::Failed(format!(
                "destroy refused for {}",
                self.identity
            )));
        }
        log.destroys.push(self.identity.clone());
        Ok(())
    }

    async fn import(&mut self, _state: &str) -> ProvisionResult<()> {
        Ok(())
    }

    async fn set_config(&mut self, _values: &HashMap<String, String>) -> ProvisionResult<()> {
        Ok(())
    }
}

struct Harness {
    manager: LifecycleManager,
    engine: RecordingEngine,
    store: Arc<SqliteStore>,
    locks: Arc<LocalLockFactory>,
    _scenario: TempDir,
    scenario_path: std::path::PathBuf,
}

fn harness() -> Harness {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let engine = RecordingEngine::default();
    let locks = Arc::new(LocalLockFactory::new());
    let manager = LifecycleManager::new(store.clone(), Arc::new(engine.clone()), locks.clone());

    let scenario = tempfile::tempdir().unwrap();
    std::fs::write(scenario.path().join("main.yml"), "services: {web: {}}").unwrap();
    let scenario_path = scenario.path().to_path_buf();

    Harness {
        manager,
        engine,
        store,
        locks,
        _scenario: scenario,
        scenario_path,
    }
}

// ============================================================================
// END-TO-END SCENARIOS
// ============================================================================

#[tokio::test]
async fn test_full_lifecycle() {
    let h = harness();

    // Create c1 with a 10 minute relative timeout and no absolute deadline.
    let challenge = h
        .manager
        .create_challenge(CreateChallenge::new("c1", &h.scenario_path).with_timeout_secs(600))
        .await
        .unwrap();
    assert_eq!(challenge.id, "c1");

    // First request from team-a deploys and binds an instance expiring in
    // about one timeout window.
    let before = Utc::now();
    let instance = h.manager.create_instance("c1", "team-a").await.unwrap();
    let until = instance.until.expect("instance must carry an expiry");
    assert!(until > before + Duration::seconds(590));
    assert!(until < Utc::now() + Duration::seconds(610));

    // A renewal right away still has the full window left.
    let err = h.manager.renew_instance("c1", "team-a").await.unwrap_err();
    assert!(matches!(err, Error::RenewNotAllowed(_)));

    // Simulate 9m01s elapsing, leaving 59s on the clock.
    let mut aged = instance.clone();
    let nearly = Utc::now() + Duration::seconds(59);
    aged.until = Some(nearly);
    h.store.save_instance(&aged).await.unwrap();

    let renewed = h.manager.renew_instance("c1", "team-a").await.unwrap();
    assert_eq!(renewed.until, Some(nearly + Duration::seconds(600)));

    // Deleting the challenge destroys the instance; nothing is retrievable
    // afterwards.
    h.manager.delete_challenge("c1").await.unwrap();
    assert_eq!(h.engine.destroys(), 1);
    assert!(matches!(
        h.manager.retrieve_instance("c1", "team-a").await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        h.manager.retrieve_challenge("c1").await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_delete_cascade_counts_and_best_effort() {
    let h = harness();
    h.manager
        .create_challenge(CreateChallenge::new("c1", &h.scenario_path).with_timeout_secs(600))
        .await
        .unwrap();
    for source in ["team-a", "team-b", "team-c"] {
        h.manager.create_instance("c1", source).await.unwrap();
    }
    assert_eq!(h.engine.ups(), 3);

    // One destroy fails for a request-caused reason: the other two still
    // run and the challenge record is removed regardless.
    h.engine.refuse_destroy("team-b");
    let err = h.manager.delete_challenge("c1").await.unwrap_err();
    assert!(!err.is_internal());
    assert!(err.to_string().contains("team-b"));

    assert_eq!(h.engine.destroys(), 2);
    assert!(matches!(
        h.manager.retrieve_challenge("c1").await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_two_replicas_share_state_and_locks() {
    let h = harness();
    // A second stateless replica over the same store and lock space.
    let replica = LifecycleManager::new(
        h.store.clone(),
        Arc::new(h.engine.clone()),
        h.locks.clone(),
    );

    h.manager
        .create_challenge(CreateChallenge::new("c1", &h.scenario_path).with_timeout_secs(600))
        .await
        .unwrap();
    replica.create_instance("c1", "team-a").await.unwrap();

    // Each replica sees the other's work; the uniqueness invariant holds
    // across replicas.
    let seen = h.manager.retrieve_instance("c1", "team-a").await.unwrap();
    assert_eq!(seen.source_id.as_deref(), Some("team-a"));
    assert!(matches!(
        h.manager.create_instance("c1", "team-a").await,
        Err(Error::AlreadyExists(_))
    ));
}

#[tokio::test]
async fn test_concurrent_sources_get_independent_instances() {
    let h = harness();
    h.manager
        .create_challenge(CreateChallenge::new("c1", &h.scenario_path).with_timeout_secs(600))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for source in ["team-a", "team-b", "team-c", "team-d", "team-e"] {
        let manager = h.manager.clone();
        handles.push(tokio::spawn(async move {
            manager.create_instance("c1", source).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let instances = h.manager.query_instances("c1").await.unwrap();
    assert_eq!(instances.len(), 5);
    assert!(instances.iter().all(|i| i.is_claimed()));
    assert_eq!(h.engine.ups(), 5);
}

#[tokio::test]
async fn test_query_challenges_spans_fleet() {
    let h = harness();
    for id in ["crypto-a", "pwn-b", "web-c"] {
        h.manager
            .create_challenge(CreateChallenge::new(id, &h.scenario_path))
            .await
            .unwrap();
    }
    h.manager.create_instance("pwn-b", "team-a").await.unwrap();

    let mut summaries = h.manager.query_challenges().await.unwrap();
    summaries.sort_by(|a, b| a.challenge.id.cmp(&b.challenge.id));
    assert_eq!(summaries.len(), 3);
    assert_eq!(summaries[1].challenge.id, "pwn-b");
    assert_eq!(summaries[1].instances.len(), 1);
}
