//! SQLite storage layer for Kiln.
//!
//! Provides:
//! - Process-wide writer lock registry
//! - Per-operation connections and transactions
//! - Schema naming and installation
//! - Job records and auxiliary keyed records
//! - The [`Storage`] facade tying them to the queue and background components

pub mod connection;
pub mod jobs;
pub mod lock;
pub mod schema;

pub use connection::{ConnectionManager, ConnectionSource, SharedConnection};
pub use jobs::{JobRecord, NewJob, StateHistoryEntry, StateRecord};
pub use lock::{LockRegistry, LockStats};
pub use schema::{Schema, SchemaInstaller, SqliteObjectsInstaller};

use rusqlite::{Connection, Transaction};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::components::expiration::ExpirationManager;
use crate::components::{BackgroundComponent, ComponentsHandle};
use crate::config::{IsolationLevel, StorageOptions};
use crate::error::Result;
use crate::monitoring::MonitoringApi;
use crate::now_millis;
use crate::queue::{
    FetchedJob, NotificationBus, QueueProvider, QueueProviders, SqliteJobQueue,
    SqliteJobQueueProvider,
};

struct StorageInner {
    options: StorageOptions,
    schema: Arc<Schema>,
    connections: Arc<ConnectionManager>,
    providers: QueueProviders,
}

/// Entry point: owns configuration and hands out connection, transaction
/// and queue services.
///
/// Cheap to clone. Two storages compare equal when they point at the same
/// database, and they then share one writer lock.
#[derive(Clone)]
pub struct Storage {
    inner: Arc<StorageInner>,
}

/// Builder for a [`Storage`] with a custom installer or queue providers.
pub struct StorageBuilder {
    source: ConnectionSource,
    options: StorageOptions,
    installer: Box<dyn SchemaInstaller>,
    providers: Vec<Arc<dyn QueueProvider>>,
}

impl StorageBuilder {
    pub fn options(mut self, options: StorageOptions) -> Self {
        self.options = options;
        self
    }

    /// Replace the built-in schema installer.
    pub fn installer(mut self, installer: impl SchemaInstaller + 'static) -> Self {
        self.installer = Box::new(installer);
        self
    }

    /// Register a provider for the queues it supports.
    pub fn queue_provider(mut self, provider: Arc<dyn QueueProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Validate options, connect, and install the schema if enabled.
    pub async fn open(self) -> Result<Storage> {
        self.options.validate()?;

        let connections = Arc::new(ConnectionManager::new(self.source, &self.options)?);
        let schema = Arc::new(Schema::new(&self.options.schema_name));

        if self.options.prepare_schema_if_necessary {
            let installer = self.installer;
            let schema = &schema;
            connections
                .with_transaction(None, |tx| {
                    installer.install(tx, schema)?;
                    Ok(())
                })
                .await?;
        }

        let default_queue = SqliteJobQueue::new(
            Arc::clone(&connections),
            Arc::clone(&schema),
            NotificationBus::default(),
            &self.options,
        );
        let mut providers =
            QueueProviders::new(Arc::new(SqliteJobQueueProvider::new(default_queue)));
        for provider in self.providers {
            providers.add(provider);
        }

        info!(
            database = connections.identity(),
            schema = schema.name(),
            "Storage opened"
        );

        Ok(Storage {
            inner: Arc::new(StorageInner {
                options: self.options,
                schema,
                connections,
                providers,
            }),
        })
    }
}

impl Storage {
    /// Open a storage with the built-in installer and queue provider.
    pub async fn open(source: impl Into<ConnectionSource>, options: StorageOptions) -> Result<Self> {
        Self::builder(source).options(options).open().await
    }

    pub fn builder(source: impl Into<ConnectionSource>) -> StorageBuilder {
        StorageBuilder {
            source: source.into(),
            options: StorageOptions::default(),
            installer: Box::new(SqliteObjectsInstaller),
            providers: Vec::new(),
        }
    }

    pub fn options(&self) -> &StorageOptions {
        &self.inner.options
    }

    pub fn schema(&self) -> &Schema {
        &self.inner.schema
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.inner.connections
    }

    pub fn queue_providers(&self) -> &QueueProviders {
        &self.inner.providers
    }

    /// Writer lock counters for this database.
    pub fn lock_stats(&self) -> Option<LockStats> {
        self.inner.connections.lock_stats()
    }

    /// See [`ConnectionManager::with_connection`].
    pub async fn with_connection<T, F>(&self, write: bool, op: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send,
        T: Send,
    {
        self.inner.connections.with_connection(write, op).await
    }

    /// See [`ConnectionManager::with_transaction`].
    pub async fn with_transaction<T, F>(&self, isolation: Option<IsolationLevel>, op: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T> + Send,
        T: Send,
    {
        self.inner.connections.with_transaction(isolation, op).await
    }

    /// Enqueue within a caller's transaction.
    pub fn enqueue_in(&self, tx: &Transaction<'_>, queue: &str, job_id: i64) -> Result<()> {
        self.inner
            .providers
            .resolve(queue)
            .queue()
            .enqueue(tx, queue, job_id)
    }

    /// Enqueue an existing job in its own transaction.
    #[instrument(skip(self))]
    pub async fn enqueue(&self, queue: &str, job_id: i64) -> Result<()> {
        let queue_impl = self.inner.providers.resolve(queue).queue();
        self.with_transaction(None, |tx| queue_impl.enqueue(tx, queue, job_id))
            .await
    }

    /// Create a job, mark it enqueued and put it on `queue`, atomically.
    #[instrument(skip(self, job))]
    pub async fn create_and_enqueue(
        &self,
        queue: &str,
        job: &NewJob,
        expire_in: Option<Duration>,
    ) -> Result<i64> {
        let schema = &self.inner.schema;
        let queue_impl = self.inner.providers.resolve(queue).queue();
        self.with_transaction(None, |tx| {
            let job_id = jobs::create_job(tx, schema, job, now_millis(), expire_in)?;
            jobs::set_job_state(
                tx,
                schema,
                job_id,
                &StateRecord::new(jobs::states::ENQUEUED).with_data("Queue", queue),
            )?;
            queue_impl.enqueue(tx, queue, job_id)?;
            Ok(job_id)
        })
        .await
    }

    /// Claim the next entry from `queues`, waiting until one is available.
    ///
    /// Returns `Ok(None)` once `cancel` fires.
    pub async fn fetch(
        &self,
        queues: &[String],
        cancel: &CancellationToken,
    ) -> Result<Option<FetchedJob>> {
        let queue = self.inner.providers.resolve_all(queues)?.queue();
        queue.fetch(queues, cancel).await
    }

    pub async fn get_job(&self, job_id: i64) -> Result<Option<JobRecord>> {
        let schema = &self.inner.schema;
        self.with_connection(false, |conn| jobs::get_job(conn, schema, job_id))
            .await
    }

    /// Record a state transition for a job.
    pub async fn set_job_state(&self, job_id: i64, state: &StateRecord) -> Result<i64> {
        let schema = &self.inner.schema;
        self.with_transaction(None, |tx| jobs::set_job_state(tx, schema, job_id, state))
            .await
    }

    pub async fn state_history(&self, job_id: i64) -> Result<Vec<StateHistoryEntry>> {
        let schema = &self.inner.schema;
        self.with_connection(false, |conn| jobs::state_history(conn, schema, job_id))
            .await
    }

    pub async fn expire_job(&self, job_id: i64, ttl: Duration) -> Result<()> {
        let schema = &self.inner.schema;
        self.with_transaction(None, |tx| jobs::expire_job(tx, schema, job_id, ttl))
            .await
    }

    pub async fn persist_job(&self, job_id: i64) -> Result<()> {
        let schema = &self.inner.schema;
        self.with_transaction(None, |tx| jobs::persist_job(tx, schema, job_id))
            .await
    }

    /// Read-only statistics over this storage.
    pub fn monitoring(&self) -> MonitoringApi {
        MonitoringApi::new(
            Arc::clone(&self.inner.connections),
            Arc::clone(&self.inner.schema),
            self.inner.options.dashboard_job_list_limit,
        )
    }

    pub fn expiration_manager(&self) -> ExpirationManager {
        ExpirationManager::new(
            Arc::clone(&self.inner.connections),
            Arc::clone(&self.inner.schema),
            self.inner.options.job_expiration_check_interval,
        )
    }

    /// Background components that should run alongside job processing.
    pub fn components(&self) -> Vec<Arc<dyn BackgroundComponent>> {
        vec![Arc::new(self.expiration_manager())]
    }

    /// Start [`components`](Self::components) on the tokio runtime.
    pub fn spawn_components(&self, cancel: CancellationToken) -> ComponentsHandle {
        ComponentsHandle::spawn(self.components(), cancel)
    }
}

impl PartialEq for Storage {
    fn eq(&self, other: &Self) -> bool {
        self.inner
            .connections
            .same_database(&other.inner.connections)
    }
}

impl fmt::Display for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SQLite: {}", self.inner.connections.identity())
    }
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage")
            .field("database", &self.inner.connections.identity())
            .field("schema", &self.inner.schema.name())
            .finish()
    }
}
