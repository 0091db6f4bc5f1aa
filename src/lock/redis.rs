//! Redis coordination backend
//!
//! Supplies the [`Coordination`] primitives the writer-preference
//! construction needs: lease-bound mutexes (`SET NX PX` with
//! compare-and-delete release) and shared counters (`INCRBY`). Every handle
//! opens its own session; a keepalive task extends the leases of whatever
//! the session currently holds, so a crashed replica stops renewing and its
//! mutexes expire on their own.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rand::Rng;
use redis::aio::ConnectionManager;
use redis::Script;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::dist::{Coordination, DistRwLock};
use super::{LockError, LockFactory, LockResult, RwLock};

/// Release only what the caller still holds.
static RELEASE_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#,
    )
});

/// Extend a lease only while the entry still belongs to the caller, so a
/// session never prolongs a mutex that has moved on to another holder.
static RENEW_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('pexpire', KEYS[1], ARGV[2])
else
    return 0
end
"#,
    )
});

fn unavailable(err: redis::RedisError) -> LockError {
    LockError::Unavailable(err.to_string())
}

/// Lock factory over a shared redis connection.
pub struct RedisLockFactory {
    conn: ConnectionManager,
    lease: Duration,
    acquire_timeout: Duration,
}

impl RedisLockFactory {
    /// Connect to the coordination store. Failures surface as
    /// [`LockError::Unavailable`] like any other coordination failure.
    pub async fn connect(
        url: &str,
        lease: Duration,
        acquire_timeout: Duration,
    ) -> LockResult<Self> {
        let client = redis::Client::open(url).map_err(unavailable)?;
        let conn = ConnectionManager::new(client).await.map_err(unavailable)?;
        debug!(url, "connected to lock coordination store");
        Ok(Self {
            conn,
            lease,
            acquire_timeout,
        })
    }
}

#[async_trait]
impl LockFactory for RedisLockFactory {
    async fn create(&self, key: &str) -> LockResult<Box<dyn RwLock>> {
        let session = RedisCoordination::open(self.conn.clone(), self.lease);
        Ok(Box::new(DistRwLock::new(
            key.to_string(),
            session,
            self.acquire_timeout,
        )))
    }
}

/// One lease-bound coordination session.
pub struct RedisCoordination {
    conn: ConnectionManager,
    lease: Duration,
    /// Currently held mutexes and the values they were written with. Entries
    /// released by another session (group-gate turnover) go stale here; the
    /// renewal value check makes extending them a no-op.
    held: Arc<Mutex<HashMap<String, String>>>,
    keepalive: tokio::task::JoinHandle<()>,
}

impl RedisCoordination {
    fn open(conn: ConnectionManager, lease: Duration) -> Self {
        let held: Arc<Mutex<HashMap<String, String>>> = Arc::new(Mutex::new(HashMap::new()));
        let keepalive = tokio::spawn(keepalive_loop(conn.clone(), held.clone(), lease));
        Self {
            conn,
            lease,
            held,
            keepalive,
        }
    }
}

async fn keepalive_loop(
    mut conn: ConnectionManager,
    held: Arc<Mutex<HashMap<String, String>>>,
    lease: Duration,
) {
    let mut ticker = tokio::time::interval(lease / 3);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let entries: Vec<(String, String)> = held
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (key, value) in entries {
            let renewed: Result<i64, _> = RENEW_SCRIPT
                .key(&key)
                .arg(&value)
                .arg(lease.as_millis() as u64)
                .invoke_async(&mut conn)
                .await;
            if let Err(err) = renewed {
                warn!(key = %key, error = %err, "lease renewal failed");
            }
        }
    }
}

#[async_trait]
impl Coordination for RedisCoordination {
    async fn acquire(&mut self, key: &str, value: &str, deadline: Instant) -> LockResult<()> {
        let mut delay = Duration::from_millis(10);
        loop {
            let set: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .arg("PX")
                .arg(self.lease.as_millis() as u64)
                .query_async(&mut self.conn)
                .await
                .map_err(unavailable)?;
            if set.is_some() {
                self.held.lock().insert(key.to_string(), value.to_string());
                return Ok(());
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(LockError::Unavailable(format!(
                    "timed out waiting for {key}"
                )));
            }
            let jitter_ms = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 2);
            let backoff = delay + Duration::from_millis(jitter_ms);
            tokio::time::sleep(backoff.min(remaining)).await;
            delay = (delay * 2).min(Duration::from_millis(250));
        }
    }

    async fn release(&mut self, key: &str, value: &str) -> LockResult<bool> {
        // Stop renewing first: a release that fails must not be kept alive.
        self.held.lock().remove(key);
        let removed: i64 = RELEASE_SCRIPT
            .key(key)
            .arg(value)
            .invoke_async(&mut self.conn)
            .await
            .map_err(unavailable)?;
        Ok(removed == 1)
    }

    async fn add(&mut self, key: &str, delta: i64) -> LockResult<i64> {
        redis::cmd("INCRBY")
            .arg(key)
            .arg(delta)
            .query_async(&mut self.conn)
            .await
            .map_err(unavailable)
    }

    async fn close(&mut self) -> LockResult<()> {
        self.keepalive.abort();
        let leftover: Vec<(String, String)> = self.held.lock().drain().collect();
        for (key, value) in leftover {
            let removed: Result<i64, _> = RELEASE_SCRIPT
                .key(&key)
                .arg(&value)
                .invoke_async(&mut self.conn)
                .await;
            if let Err(err) = removed {
                // The lease will expire it.
                warn!(key = %key, error = %err, "failed to release mutex at session close");
            }
        }
        Ok(())
    }
}

impl Drop for RedisCoordination {
    fn drop(&mut self) {
        self.keepalive.abort();
    }
}
