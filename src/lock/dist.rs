//! Distributed reader-writer lock construction
//!
//! The classical writer-preference construction (Courtois, Heymans, Parnas,
//! 1971) built from primitives any coordination store can supply: lease-bound
//! mutual exclusion with compare-and-delete release, plus an adjustable
//! shared counter. Per logical key the construction keeps two counters and
//! five named mutexes:
//!
//! - `gate1`, `gate2`, `gate3` - serialize counter mutation and arrival order
//! - `rgate` - held by the writer group to stop new readers
//! - `wgate` - the gate readers-as-a-group and each writer actually block on
//!
//! A gate acquired on behalf of a whole group (`rgate` by the first pending
//! writer, `wgate` by the first active reader) is written with a group tag
//! instead of the session token, because the member that releases it may be
//! a different session than the one that acquired it.

use async_trait::async_trait;
use std::time::{Duration, Instant};
use tracing::warn;
use uuid::Uuid;

use super::{LockError, LockResult, Mode, RwLock};

/// Group tag for `wgate` while the reader group holds it.
const READER_GROUP: &str = "readers";
/// Group tag for `rgate` while the writer group holds it.
const WRITER_GROUP: &str = "writers";

/// Primitives the construction needs from a coordination store.
///
/// Implementations bind every held entry to a lease so a crashed session
/// auto-releases whatever it held.
#[async_trait]
pub trait Coordination: Send + Sync {
    /// Block until the named mutex is held with `value`, or `deadline`
    /// passes. A store failure or an elapsed deadline must surface as
    /// [`LockError::Unavailable`], never as a granted mutex.
    async fn acquire(&mut self, key: &str, value: &str, deadline: Instant) -> LockResult<()>;

    /// Compare-and-delete release. Returns false when the entry was already
    /// gone or held with a different value (lease expiry, group turnover).
    async fn release(&mut self, key: &str, value: &str) -> LockResult<bool>;

    /// Adjust the named counter, returning the new value.
    async fn add(&mut self, key: &str, delta: i64) -> LockResult<i64>;

    /// Tear the session down: stop lease renewals, best-effort drop of
    /// anything still held.
    async fn close(&mut self) -> LockResult<()>;
}

/// Readers-writer lock over one logical key, generic in the store.
pub struct DistRwLock<C: Coordination> {
    key: String,
    coord: C,
    session: String,
    acquire_timeout: Duration,
    mode: Option<Mode>,
}

impl<C: Coordination> DistRwLock<C> {
    pub fn new(key: String, coord: C, acquire_timeout: Duration) -> Self {
        Self {
            key,
            coord,
            session: Uuid::new_v4().to_string(),
            acquire_timeout,
            mode: None,
        }
    }

    fn subkey(&self, suffix: &str) -> String {
        format!("{}:{}", self.key, suffix)
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.acquire_timeout
    }

    /// Counter adjustment with drift correction: a crashed session cannot
    /// decrement what it incremented, so a negative counter means its lease
    /// already expired. Clamp back to zero and continue.
    async fn add_clamped(&mut self, key: &str, delta: i64) -> LockResult<i64> {
        let value = self.coord.add(key, delta).await?;
        if value < 0 {
            warn!(key, value, "counter drift detected, clamping to zero");
            self.coord.add(key, -value).await?;
            return Ok(0);
        }
        Ok(value)
    }

    async fn release_logged(&mut self, key: &str, value: &str) {
        match self.coord.release(key, value).await {
            Ok(true) => {}
            Ok(false) => warn!(key, "mutex already released (lease expiry or group turnover)"),
            Err(err) => warn!(key, error = %err, "failed to release mutex"),
        }
    }
}

#[async_trait]
impl<C: Coordination> RwLock for DistRwLock<C> {
    fn key(&self) -> &str {
        &self.key
    }

    async fn read_lock(&mut self) -> LockResult<()> {
        if self.mode.is_some() {
            return Err(LockError::misuse(&self.key, "handle already holds the lock"));
        }
        let deadline = self.deadline();
        let (gate3, rgate, gate1) = (self.subkey("gate3"), self.subkey("rgate"), self.subkey("gate1"));
        let readers = self.subkey("readers");
        let wgate = self.subkey("wgate");
        let session = self.session.clone();

        self.coord.acquire(&gate3, &session, deadline).await?;
        if let Err(err) = self.coord.acquire(&rgate, &session, deadline).await {
            self.release_logged(&gate3, &session).await;
            return Err(err);
        }
        if let Err(err) = self.coord.acquire(&gate1, &session, deadline).await {
            self.release_logged(&rgate, &session).await;
            self.release_logged(&gate3, &session).await;
            return Err(err);
        }

        let result = async {
            let count = self.add_clamped(&readers, 1).await?;
            if count == 1 {
                // First reader locks writers out on behalf of the group.
                if let Err(err) = self.coord.acquire(&wgate, READER_GROUP, deadline).await {
                    self.add_clamped(&readers, -1).await?;
                    return Err(err);
                }
            }
            Ok(())
        }
        .await;

        self.release_logged(&gate1, &session).await;
        self.release_logged(&rgate, &session).await;
        self.release_logged(&gate3, &session).await;

        result?;
        self.mode = Some(Mode::Read);
        Ok(())
    }

    async fn read_unlock(&mut self) -> LockResult<()> {
        if self.mode != Some(Mode::Read) {
            return Err(LockError::misuse(&self.key, "read_unlock without read_lock"));
        }
        let deadline = self.deadline();
        let gate1 = self.subkey("gate1");
        let readers = self.subkey("readers");
        let wgate = self.subkey("wgate");
        let session = self.session.clone();

        self.coord.acquire(&gate1, &session, deadline).await?;
        let count = self.add_clamped(&readers, -1).await;
        if let Ok(0) = count {
            // Last reader out lets writers through.
            self.release_logged(&wgate, READER_GROUP).await;
        }
        self.release_logged(&gate1, &session).await;

        count?;
        self.mode = None;
        Ok(())
    }

    async fn write_lock(&mut self) -> LockResult<()> {
        if self.mode.is_some() {
            return Err(LockError::misuse(&self.key, "handle already holds the lock"));
        }
        let deadline = self.deadline();
        let gate2 = self.subkey("gate2");
        let writers = self.subkey("writers");
        let rgate = self.subkey("rgate");
        let wgate = self.subkey("wgate");
        let session = self.session.clone();

        // Register as a pending writer; the first one shuts the reader gate
        // so readers arriving from now on queue behind us.
        self.coord.acquire(&gate2, &session, deadline).await?;
        let registration = async {
            let count = self.add_clamped(&writers, 1).await?;
            if count == 1 {
                if let Err(err) = self.coord.acquire(&rgate, WRITER_GROUP, deadline).await {
                    self.add_clamped(&writers, -1).await?;
                    return Err(err);
                }
            }
            Ok(())
        }
        .await;
        self.release_logged(&gate2, &session).await;
        registration?;

        // The actual wait on active readers and writers.
        if let Err(err) = self.coord.acquire(&wgate, &session, deadline).await {
            // Roll the registration back so readers are not locked out by a
            // writer that never arrived.
            let rollback_deadline = self.deadline();
            self.coord.acquire(&gate2, &session, rollback_deadline).await?;
            let remaining = self.add_clamped(&writers, -1).await;
            if let Ok(0) = remaining {
                self.release_logged(&rgate, WRITER_GROUP).await;
            }
            self.release_logged(&gate2, &session).await;
            remaining?;
            return Err(err);
        }

        self.mode = Some(Mode::Write);
        Ok(())
    }

    async fn write_unlock(&mut self) -> LockResult<()> {
        if self.mode != Some(Mode::Write) {
            return Err(LockError::misuse(&self.key, "write_unlock without write_lock"));
        }
        let deadline = self.deadline();
        let gate2 = self.subkey("gate2");
        let writers = self.subkey("writers");
        let rgate = self.subkey("rgate");
        let wgate = self.subkey("wgate");
        let session = self.session.clone();

        self.release_logged(&wgate, &session).await;

        self.coord.acquire(&gate2, &session, deadline).await?;
        let count = self.add_clamped(&writers, -1).await;
        if let Ok(0) = count {
            // No writer pending anymore: reopen the reader gate.
            self.release_logged(&rgate, WRITER_GROUP).await;
        }
        self.release_logged(&gate2, &session).await;

        count?;
        self.mode = None;
        Ok(())
    }

    async fn close(&mut self) -> LockResult<()> {
        self.mode = None;
        self.coord.close().await
    }
}
