//! Per-operation connections and transactions.
//!
//! Resources nest as independent scoped guards:
//!
//! 1. writer lock ([`WriterGuard`]) when the operation writes
//! 2. pooled connection, returned to the pool on drop
//! 3. transaction, rolled back on drop unless committed
//!
//! Each guard releases on every exit path, including errors returned by
//! the caller's closure, so a failed operation never leaves the writer
//! lock held.

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, Transaction};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::lock::{DatabaseLock, LockRegistry, LockStats, WriterGuard};
use super::schema::apply_pragmas;
use crate::config::{IsolationLevel, StorageOptions};
use crate::error::{Result, StorageError};

/// A pre-opened connection owned by the caller.
pub type SharedConnection = Arc<Mutex<Connection>>;

/// Where a storage gets its connections from.
#[derive(Clone)]
pub enum ConnectionSource {
    /// Connection string (database path or `file:` URI); one pooled
    /// connection per operation, writers serialized by the lock registry.
    Path(String),
    /// Caller-managed connection, reused for every operation. Writer lock
    /// arbitration is skipped; the caller owns serialization.
    Existing(SharedConnection),
}

impl fmt::Debug for ConnectionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => f.debug_tuple("Path").field(path).finish(),
            Self::Existing(conn) => f
                .debug_tuple("Existing")
                .field(&Arc::as_ptr(conn))
                .finish(),
        }
    }
}

impl From<&str> for ConnectionSource {
    fn from(path: &str) -> Self {
        Self::Path(path.to_string())
    }
}

impl From<String> for ConnectionSource {
    fn from(path: String) -> Self {
        Self::Path(path)
    }
}

impl From<&Path> for ConnectionSource {
    fn from(path: &Path) -> Self {
        Self::Path(path.to_string_lossy().into_owned())
    }
}

impl From<PathBuf> for ConnectionSource {
    fn from(path: PathBuf) -> Self {
        Self::from(path.as_path())
    }
}

impl From<SharedConnection> for ConnectionSource {
    fn from(conn: SharedConnection) -> Self {
        Self::Existing(conn)
    }
}

impl From<Connection> for ConnectionSource {
    fn from(conn: Connection) -> Self {
        Self::Existing(Arc::new(Mutex::new(conn)))
    }
}

enum Backend {
    Pool {
        pool: Pool<SqliteConnectionManager>,
        lock: Arc<DatabaseLock>,
    },
    Existing(SharedConnection),
}

/// Opens connections for operations and arbitrates the writer lock.
pub struct ConnectionManager {
    identity: String,
    backend: Backend,
    lock_timeout: Duration,
    default_isolation: Option<IsolationLevel>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("identity", &self.identity)
            .field("existing", &self.is_existing())
            .finish()
    }
}

impl ConnectionManager {
    /// Build a manager for `source`.
    ///
    /// For a connection string this registers the database identity in the
    /// process-wide [`LockRegistry`] and opens one pooled connection up front
    /// so an unusable path fails here rather than on first use.
    pub fn new(source: ConnectionSource, options: &StorageOptions) -> Result<Self> {
        let (identity, backend) = match source {
            ConnectionSource::Path(path) => {
                if path.is_empty() {
                    return Err(crate::error::ConfigError::EmptyConnectionString.into());
                }
                let manager = SqliteConnectionManager::file(&path);
                let pool = Pool::builder()
                    .max_size(options.pool_size.max(1))
                    .min_idle(Some(1))
                    .connection_customizer(Box::new(PragmaCustomizer {
                        busy_timeout: options.transaction_timeout,
                    }))
                    .build(manager)?;
                let lock = LockRegistry::global().register(&path);
                (path, Backend::Pool { pool, lock })
            }
            ConnectionSource::Existing(conn) => {
                {
                    let guard = conn.lock().map_err(|_| StorageError::Poisoned {
                        operation: "open",
                    })?;
                    apply_pragmas(&guard, options.transaction_timeout)?;
                }
                let identity = format!("existing:{:p}", Arc::as_ptr(&conn));
                (identity, Backend::Existing(conn))
            }
        };

        Ok(Self {
            identity,
            backend,
            lock_timeout: options.lock_timeout,
            default_isolation: options.transaction_isolation_level,
        })
    }

    /// Database identity: the connection string, or the address of the
    /// shared connection.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Whether operations reuse a caller-supplied connection.
    pub fn is_existing(&self) -> bool {
        matches!(self.backend, Backend::Existing(_))
    }

    /// Writer lock counters, `None` for caller-managed connections.
    pub fn lock_stats(&self) -> Option<LockStats> {
        match &self.backend {
            Backend::Pool { lock, .. } => Some(lock.stats()),
            Backend::Existing(_) => None,
        }
    }

    /// Whether two managers point at the same database.
    pub fn same_database(&self, other: &Self) -> bool {
        match (&self.backend, &other.backend) {
            (Backend::Existing(a), Backend::Existing(b)) => Arc::ptr_eq(a, b),
            (Backend::Pool { .. }, Backend::Pool { .. }) => self.identity == other.identity,
            _ => false,
        }
    }

    /// Run `op` with a connection.
    ///
    /// With `write` set, the writer lock for this database is held for the
    /// whole call. The connection goes back to the pool and the lock is
    /// released before this returns, whether `op` succeeded or not.
    pub async fn with_connection<T, F>(&self, write: bool, op: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send,
        T: Send,
    {
        match &self.backend {
            Backend::Existing(shared) => {
                let mut conn = shared.lock().map_err(|_| StorageError::Poisoned {
                    operation: "with_connection",
                })?;
                op(&mut *conn)
            }
            Backend::Pool { pool, lock } => {
                let _writer: Option<WriterGuard> = if write {
                    Some(lock.acquire_writer(self.lock_timeout).await?)
                } else {
                    None
                };
                let mut conn = pool.get()?;
                op(&mut *conn)
            }
        }
    }

    /// Run `op` inside a transaction on a write connection.
    ///
    /// Commits when `op` returns `Ok`; otherwise the transaction is rolled
    /// back and the error propagates. Transactions do not nest: `op` must not
    /// call back into the manager.
    pub async fn with_transaction<T, F>(&self, isolation: Option<IsolationLevel>, op: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T> + Send,
        T: Send,
    {
        let level = isolation.or(self.default_isolation).unwrap_or_default();
        self.with_connection(true, move |conn| {
            conn.pragma_update(None, "read_uncommitted", level.reads_uncommitted())?;
            let tx = conn.transaction_with_behavior(level.behavior())?;
            let value = op(&tx)?;
            tx.commit()?;
            Ok(value)
        })
        .await
    }
}

/// Connection customizer that applies the storage pragmas.
#[derive(Debug)]
struct PragmaCustomizer {
    busy_timeout: Duration,
}

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for PragmaCustomizer {
    fn on_acquire(&self, conn: &mut Connection) -> std::result::Result<(), rusqlite::Error> {
        apply_pragmas(conn, self.busy_timeout)
    }
}
