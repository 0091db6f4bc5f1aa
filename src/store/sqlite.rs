//! SQLite storage backend
//!
//! One file (or in-memory database for tests) holding challenge and instance
//! records. Timestamps are RFC 3339 text, opaque maps JSON text. Connection
//! access is short and serialized behind a mutex; callers never hold it
//! across a slow operation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use super::{Store, StoreError, StoreResult};
use crate::model::{Challenge, Instance, PoolBounds, UpdateStrategy};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS challenges (
    id TEXT PRIMARY KEY,
    scenario_directory TEXT NOT NULL,
    scenario_hash TEXT NOT NULL,
    until TEXT,
    timeout_secs INTEGER,
    update_strategy TEXT NOT NULL,
    pool_min INTEGER NOT NULL DEFAULT 0,
    pool_max INTEGER NOT NULL DEFAULT 0,
    additional TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS instances (
    challenge_id TEXT NOT NULL,
    identity TEXT NOT NULL,
    source_id TEXT,
    state TEXT,
    scenario_hash TEXT NOT NULL,
    since TEXT NOT NULL,
    last_renew TEXT,
    until TEXT,
    connection_info TEXT NOT NULL DEFAULT '',
    flag TEXT,
    outputs TEXT NOT NULL DEFAULT '{}',
    PRIMARY KEY (challenge_id, identity)
);

CREATE INDEX IF NOT EXISTS idx_instances_source ON instances(challenge_id, source_id);
"#;

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Backend(e.to_string()))?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        info!(path = %path.display(), "sqlite store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store (for testing and single-replica scratch deployments).
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

/// Raw text columns of a challenge row, converted outside the rusqlite
/// closure so parse failures surface as `Corrupt` rather than panics.
struct ChallengeRow {
    id: String,
    scenario_directory: String,
    scenario_hash: String,
    until: Option<String>,
    timeout_secs: Option<u64>,
    update_strategy: String,
    pool_min: u32,
    pool_max: u32,
    additional: String,
    created_at: String,
    updated_at: String,
}

impl ChallengeRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            scenario_directory: row.get(1)?,
            scenario_hash: row.get(2)?,
            until: row.get(3)?,
            timeout_secs: row.get(4)?,
            update_strategy: row.get(5)?,
            pool_min: row.get(6)?,
            pool_max: row.get(7)?,
            additional: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    fn into_challenge(self) -> StoreResult<Challenge> {
        Ok(Challenge {
            id: self.id,
            scenario_directory: PathBuf::from(self.scenario_directory),
            scenario_hash: self.scenario_hash,
            until: self.until.as_deref().map(parse_timestamp).transpose()?,
            timeout_secs: self.timeout_secs,
            update_strategy: parse_strategy(&self.update_strategy)?,
            pool: PoolBounds {
                min: self.pool_min,
                max: self.pool_max,
            },
            additional: parse_map(&self.additional)?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

struct InstanceRow {
    challenge_id: String,
    identity: String,
    source_id: Option<String>,
    state: Option<String>,
    scenario_hash: String,
    since: String,
    last_renew: Option<String>,
    until: Option<String>,
    connection_info: String,
    flag: Option<String>,
    outputs: String,
}

impl InstanceRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            challenge_id: row.get(0)?,
            identity: row.get(1)?,
            source_id: row.get(2)?,
            state: row.get(3)?,
            scenario_hash: row.get(4)?,
            since: row.get(5)?,
            last_renew: row.get(6)?,
            until: row.get(7)?,
            connection_info: row.get(8)?,
            flag: row.get(9)?,
            outputs: row.get(10)?,
        })
    }

    fn into_instance(self) -> StoreResult<Instance> {
        Ok(Instance {
            challenge_id: self.challenge_id,
            identity: self.identity,
            source_id: self.source_id,
            state: self.state,
            scenario_hash: self.scenario_hash,
            since: parse_timestamp(&self.since)?,
            last_renew: self.last_renew.as_deref().map(parse_timestamp).transpose()?,
            until: self.until.as_deref().map(parse_timestamp).transpose()?,
            connection_info: self.connection_info,
            flag: self.flag,
            outputs: parse_map(&self.outputs)?,
        })
    }
}

fn parse_timestamp(text: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {text:?}: {e}")))
}

fn parse_strategy(text: &str) -> StoreResult<UpdateStrategy> {
    serde_json::from_value(serde_json::Value::String(text.to_string()))
        .map_err(|e| StoreError::Corrupt(format!("bad update strategy {text:?}: {e}")))
}

fn strategy_text(strategy: UpdateStrategy) -> StoreResult<String> {
    match serde_json::to_value(strategy)? {
        serde_json::Value::String(s) => Ok(s),
        other => Err(StoreError::Corrupt(format!(
            "update strategy serialized to {other}"
        ))),
    }
}

fn parse_map(text: &str) -> StoreResult<HashMap<String, String>> {
    serde_json::from_str(text).map_err(|e| StoreError::Corrupt(format!("bad map column: {e}")))
}

#[async_trait]
impl Store for SqliteStore {
    async fn load_challenge(&self, id: &str) -> StoreResult<Option<Challenge>> {
        let row = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT id, scenario_directory, scenario_hash, until, timeout_secs,
                        update_strategy, pool_min, pool_max, additional, created_at, updated_at
                 FROM challenges WHERE id = ?1",
                params![id],
                ChallengeRow::from_row,
            )
            .optional()?
        };
        row.map(ChallengeRow::into_challenge).transpose()
    }

    async fn save_challenge(&self, challenge: &Challenge) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO challenges
             (id, scenario_directory, scenario_hash, until, timeout_secs,
              update_strategy, pool_min, pool_max, additional, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                challenge.id,
                challenge.scenario_directory.to_string_lossy(),
                challenge.scenario_hash,
                challenge.until.map(|t| t.to_rfc3339()),
                challenge.timeout_secs,
                strategy_text(challenge.update_strategy)?,
                challenge.pool.min,
                challenge.pool.max,
                serde_json::to_string(&challenge.additional)?,
                challenge.created_at.to_rfc3339(),
                challenge.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    async fn delete_challenge(&self, id: &str) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM challenges WHERE id = ?1", params![id])?;
        Ok(())
    }

    async fn list_challenges(&self) -> StoreResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id FROM challenges ORDER BY id ASC")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    async fn challenge_exists(&self, id: &str) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM challenges WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    async fn load_instance(
        &self,
        challenge_id: &str,
        identity: &str,
    ) -> StoreResult<Option<Instance>> {
        let row = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT challenge_id, identity, source_id, state, scenario_hash,
                        since, last_renew, until, connection_info, flag, outputs
                 FROM instances WHERE challenge_id = ?1 AND identity = ?2",
                params![challenge_id, identity],
                InstanceRow::from_row,
            )
            .optional()?
        };
        row.map(InstanceRow::into_instance).transpose()
    }

    async fn save_instance(&self, instance: &Instance) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO instances
             (challenge_id, identity, source_id, state, scenario_hash,
              since, last_renew, until, connection_info, flag, outputs)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                instance.challenge_id,
                instance.identity,
                instance.source_id,
                instance.state,
                instance.scenario_hash,
                instance.since.to_rfc3339(),
                instance.last_renew.map(|t| t.to_rfc3339()),
                instance.until.map(|t| t.to_rfc3339()),
                instance.connection_info,
                instance.flag,
                serde_json::to_string(&instance.outputs)?,
            ],
        )?;
        Ok(())
    }

    async fn delete_instance(&self, challenge_id: &str, identity: &str) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM instances WHERE challenge_id = ?1 AND identity = ?2",
            params![challenge_id, identity],
        )?;
        Ok(())
    }

    async fn list_instances(&self, challenge_id: &str) -> StoreResult<Vec<Instance>> {
        let rows = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(
                "SELECT challenge_id, identity, source_id, state, scenario_hash,
                        since, last_renew, until, connection_info, flag, outputs
                 FROM instances WHERE challenge_id = ?1 ORDER BY identity ASC",
            )?;
            let rows = stmt
                .query_map(params![challenge_id], InstanceRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        rows.into_iter().map(InstanceRow::into_instance).collect()
    }

    async fn find_instance_by_source(
        &self,
        challenge_id: &str,
        source_id: &str,
    ) -> StoreResult<Option<Instance>> {
        let row = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT challenge_id, identity, source_id, state, scenario_hash,
                        since, last_renew, until, connection_info, flag, outputs
                 FROM instances WHERE challenge_id = ?1 AND source_id = ?2",
                params![challenge_id, source_id],
                InstanceRow::from_row,
            )
            .optional()?
        };
        row.map(InstanceRow::into_instance).transpose()
    }
}
