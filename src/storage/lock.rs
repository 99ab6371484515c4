//! Process-wide writer locks, one per database identity.
//!
//! SQLite admits a single writer at a time. Every storage pointed at the
//! same connection string shares one writer lock from the registry,
//! so writers in this process queue up here instead of failing with
//! `SQLITE_BUSY`. Entries are created on first use and live for the rest
//! of the process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};

use crate::error::StorageError;

/// Counters kept per database lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockStats {
    pub write_acquired: u64,
    pub write_released: u64,
    pub write_timeouts: u64,
}

impl LockStats {
    /// Whether a writer currently holds the lock.
    pub fn is_write_held(&self) -> bool {
        self.write_acquired > self.write_released
    }
}

/// Reader/writer lock guarding one database.
#[derive(Debug)]
pub struct DatabaseLock {
    database: String,
    lock: Arc<RwLock<()>>,
    write_acquired: AtomicU64,
    write_released: AtomicU64,
    write_timeouts: AtomicU64,
}

impl DatabaseLock {
    fn new(database: &str) -> Self {
        Self {
            database: database.to_string(),
            lock: Arc::new(RwLock::new(())),
            write_acquired: AtomicU64::new(0),
            write_released: AtomicU64::new(0),
            write_timeouts: AtomicU64::new(0),
        }
    }

    /// Database identity this lock guards.
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Wait up to `timeout` for exclusive access.
    ///
    /// The returned guard releases the lock when dropped.
    pub async fn acquire_writer(
        self: &Arc<Self>,
        timeout: Duration,
    ) -> Result<WriterGuard, StorageError> {
        match tokio::time::timeout(timeout, self.lock.clone().write_owned()).await {
            Ok(guard) => {
                self.write_acquired.fetch_add(1, Ordering::SeqCst);
                Ok(WriterGuard {
                    _guard: guard,
                    owner: Arc::clone(self),
                })
            }
            Err(_) => {
                self.write_timeouts.fetch_add(1, Ordering::SeqCst);
                tracing::warn!(
                    database = %self.database,
                    ?timeout,
                    "Timed out waiting for the write lock"
                );
                Err(StorageError::LockTimeout {
                    database: self.database.clone(),
                    timeout,
                })
            }
        }
    }

    /// Snapshot of the acquire/release counters.
    pub fn stats(&self) -> LockStats {
        LockStats {
            write_acquired: self.write_acquired.load(Ordering::SeqCst),
            write_released: self.write_released.load(Ordering::SeqCst),
            write_timeouts: self.write_timeouts.load(Ordering::SeqCst),
        }
    }
}

/// Exclusive hold on a database lock.
#[derive(Debug)]
#[must_use = "the write lock is released as soon as the guard is dropped"]
pub struct WriterGuard {
    _guard: OwnedRwLockWriteGuard<()>,
    owner: Arc<DatabaseLock>,
}

impl WriterGuard {
    /// Release the lock now. Equivalent to dropping the guard.
    pub fn release(self) {}
}

impl Drop for WriterGuard {
    fn drop(&mut self) {
        self.owner.write_released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Map from database identity to its lock.
#[derive(Debug, Default)]
pub struct LockRegistry {
    entries: Mutex<HashMap<String, Arc<DatabaseLock>>>,
}

impl LockRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by every storage in this process.
    pub fn global() -> &'static LockRegistry {
        static REGISTRY: OnceLock<LockRegistry> = OnceLock::new();
        REGISTRY.get_or_init(LockRegistry::new)
    }

    /// Get the lock for `database`, creating it on first use.
    pub fn register(&self, database: &str) -> Arc<DatabaseLock> {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(
            entries
                .entry(database.to_string())
                .or_insert_with(|| Arc::new(DatabaseLock::new(database))),
        )
    }

    /// Acquire the writer lock for `database`.
    pub async fn acquire_writer(
        &self,
        database: &str,
        timeout: Duration,
    ) -> Result<WriterGuard, StorageError> {
        self.register(database).acquire_writer(timeout).await
    }

    /// Counters for `database`, if it was ever registered.
    pub fn stats(&self, database: &str) -> Option<LockStats> {
        let entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.get(database).map(|lock| lock.stats())
    }

    /// Number of registered databases.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_is_idempotent() {
        let registry = LockRegistry::new();
        let a = registry.register("a.db");
        let b = registry.register("a.db");
        assert!(Arc::ptr_eq(&a, &b));

        registry.register("b.db");
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_writer_excludes_second_writer() {
        let registry = LockRegistry::new();
        let first = registry
            .acquire_writer("w.db", Duration::from_secs(1))
            .await
            .unwrap();

        let second = registry
            .acquire_writer("w.db", Duration::from_millis(50))
            .await;
        assert!(matches!(second, Err(StorageError::LockTimeout { .. })));

        first.release();
        let third = registry
            .acquire_writer("w.db", Duration::from_millis(50))
            .await;
        assert!(third.is_ok());
    }

    #[tokio::test]
    async fn test_different_databases_independent() {
        let registry = LockRegistry::new();
        let _a = registry
            .acquire_writer("a.db", Duration::from_secs(1))
            .await
            .unwrap();
        let b = registry
            .acquire_writer("b.db", Duration::from_millis(50))
            .await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_stats_balance() {
        let registry = LockRegistry::new();
        for _ in 0..3 {
            let guard = registry
                .acquire_writer("s.db", Duration::from_secs(1))
                .await
                .unwrap();
            assert!(registry.stats("s.db").unwrap().is_write_held());
            drop(guard);
        }

        let held = registry
            .acquire_writer("s.db", Duration::from_secs(1))
            .await
            .unwrap();
        let _ = registry
            .acquire_writer("s.db", Duration::from_millis(20))
            .await;
        drop(held);

        let stats = registry.stats("s.db").unwrap();
        assert_eq!(stats.write_acquired, 4);
        assert_eq!(stats.write_released, 4);
        assert_eq!(stats.write_timeouts, 1);
        assert!(!stats.is_write_held());
        assert!(registry.stats("unknown.db").is_none());
    }
}
