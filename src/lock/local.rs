//! In-process lock backend
//!
//! One tokio rwlock per logical key, interned in a registry owned by the
//! factory. Tokio's rwlock queues waiters fairly, so a writer that is
//! already waiting is served before readers that arrive after it - the same
//! writer-preference contract the distributed backend provides. Suitable for
//! single-replica deployments and tests.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock as TokioRwLock};

use super::{LockError, LockFactory, LockResult, RwLock};

type Cell = Arc<TokioRwLock<()>>;

/// Factory interning one lock cell per key.
#[derive(Clone, Default)]
pub struct LocalLockFactory {
    cells: Arc<DashMap<String, Cell>>,
}

impl LocalLockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, key: &str) -> Cell {
        self.cells
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(TokioRwLock::new(())))
            .clone()
    }
}

#[async_trait]
impl LockFactory for LocalLockFactory {
    async fn create(&self, key: &str) -> LockResult<Box<dyn RwLock>> {
        Ok(Box::new(LocalRwLock {
            key: key.to_string(),
            cell: self.cell(key),
            read: None,
            write: None,
        }))
    }
}

/// Handle over one interned cell. Guards are owned so the handle can cross
/// await points and tasks like any other value.
pub struct LocalRwLock {
    key: String,
    cell: Cell,
    read: Option<OwnedRwLockReadGuard<()>>,
    write: Option<OwnedRwLockWriteGuard<()>>,
}

impl LocalRwLock {
    fn ensure_unheld(&self) -> LockResult<()> {
        if self.read.is_some() || self.write.is_some() {
            return Err(LockError::misuse(&self.key, "handle already holds the lock"));
        }
        Ok(())
    }
}

#[async_trait]
impl RwLock for LocalRwLock {
    fn key(&self) -> &str {
        &self.key
    }

    async fn read_lock(&mut self) -> LockResult<()> {
        self.ensure_unheld()?;
        self.read = Some(self.cell.clone().read_owned().await);
        Ok(())
    }

    async fn read_unlock(&mut self) -> LockResult<()> {
        self.read
            .take()
            .map(drop)
            .ok_or_else(|| LockError::misuse(&self.key, "read_unlock without read_lock"))
    }

    async fn write_lock(&mut self) -> LockResult<()> {
        self.ensure_unheld()?;
        self.write = Some(self.cell.clone().write_owned().await);
        Ok(())
    }

    async fn write_unlock(&mut self) -> LockResult<()> {
        self.write
            .take()
            .map(drop)
            .ok_or_else(|| LockError::misuse(&self.key, "write_unlock without write_lock"))
    }

    async fn close(&mut self) -> LockResult<()> {
        // No session to release; drop anything still held.
        self.read = None;
        self.write = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_concurrent_readers() {
        let factory = LocalLockFactory::new();
        let mut a = factory.create("k").await.unwrap();
        let mut b = factory.create("k").await.unwrap();

        a.read_lock().await.unwrap();
        timeout(Duration::from_millis(100), b.read_lock())
            .await
            .expect("second reader must not block")
            .unwrap();

        a.read_unlock().await.unwrap();
        b.read_unlock().await.unwrap();
    }

    #[tokio::test]
    async fn test_writer_excludes_readers() {
        let factory = LocalLockFactory::new();
        let mut reader = factory.create("k").await.unwrap();
        let mut writer = factory.create("k").await.unwrap();

        reader.read_lock().await.unwrap();
        assert!(
            timeout(Duration::from_millis(50), writer.write_lock())
                .await
                .is_err(),
            "writer must wait for the outstanding reader"
        );

        reader.read_unlock().await.unwrap();
        timeout(Duration::from_millis(200), writer.write_lock())
            .await
            .expect("writer must proceed once readers drain")
            .unwrap();
        writer.write_unlock().await.unwrap();
    }

    #[tokio::test]
    async fn test_writer_served_before_later_readers() {
        let factory = LocalLockFactory::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut first_reader = factory.create("k").await.unwrap();
        first_reader.read_lock().await.unwrap();

        let writer = {
            let factory = factory.clone();
            let order = order.clone();
            tokio::spawn(async move {
                let mut lock = factory.create("k").await.unwrap();
                lock.write_lock().await.unwrap();
                order.lock().push("writer");
                lock.write_unlock().await.unwrap();
            })
        };
        // Let the writer queue up before the late reader arrives.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let late_reader = {
            let factory = factory.clone();
            let order = order.clone();
            tokio::spawn(async move {
                let mut lock = factory.create("k").await.unwrap();
                lock.read_lock().await.unwrap();
                order.lock().push("late_reader");
                lock.read_unlock().await.unwrap();
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        first_reader.read_unlock().await.unwrap();
        writer.await.unwrap();
        late_reader.await.unwrap();

        assert_eq!(*order.lock(), vec!["writer", "late_reader"]);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let factory = LocalLockFactory::new();
        let mut a = factory.create("a").await.unwrap();
        let mut b = factory.create("b").await.unwrap();

        a.write_lock().await.unwrap();
        timeout(Duration::from_millis(100), b.write_lock())
            .await
            .expect("different keys must not contend")
            .unwrap();

        a.write_unlock().await.unwrap();
        b.write_unlock().await.unwrap();
    }

    #[tokio::test]
    async fn test_unlock_without_lock_is_misuse() {
        let factory = LocalLockFactory::new();
        let mut lock = factory.create("k").await.unwrap();
        assert!(matches!(
            lock.read_unlock().await,
            Err(LockError::Misuse { .. })
        ));
        assert!(matches!(
            lock.write_unlock().await,
            Err(LockError::Misuse { .. })
        ));
    }
}
