//! Job queue protocol and queue provider selection.
//!
//! A queue entry moves through
//! `Waiting -> Fetched -> {Acknowledged | TimedOut -> Waiting}`:
//! enqueue inserts a waiting row, fetch stamps it with a fetch time and
//! token, acknowledge deletes it, and an entry whose invisibility window
//! lapsed without acknowledgment is claimable again.

pub mod fetched;
pub mod notify;
pub mod sqlite;

pub use fetched::FetchedJob;
pub use notify::NotificationBus;
pub use sqlite::{SqliteJobQueue, SqliteJobQueueProvider};

use async_trait::async_trait;
use rusqlite::Transaction;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, StorageError};

/// A persistent FIFO queue of job ids.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Insert a waiting entry for `job_id` on `queue` within the caller's
    /// transaction, so it commits together with the job it refers to.
    fn enqueue(&self, tx: &Transaction<'_>, queue: &str, job_id: i64) -> Result<()>;

    /// Claim the next entry from `queues`, honoring queue order first and
    /// enqueue order within a queue.
    ///
    /// Blocks, re-polling, until an entry is claimed. Returns `Ok(None)` once
    /// `cancel` fires.
    async fn fetch(
        &self,
        queues: &[String],
        cancel: &CancellationToken,
    ) -> Result<Option<FetchedJob>>;
}

/// Supplies the queue implementation for some set of queue names.
pub trait QueueProvider: Send + Sync {
    fn supports(&self, queue: &str) -> bool;
    fn queue(&self) -> Arc<dyn JobQueue>;
}

/// Provider registry consulted by queue name.
///
/// Providers added later take precedence; the default provider serves every
/// queue no other provider claims.
#[derive(Clone)]
pub struct QueueProviders {
    default: Arc<dyn QueueProvider>,
    providers: Vec<Arc<dyn QueueProvider>>,
}

impl fmt::Debug for QueueProviders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueProviders")
            .field("custom", &self.providers.len())
            .finish()
    }
}

impl QueueProviders {
    pub fn new(default: Arc<dyn QueueProvider>) -> Self {
        Self {
            default,
            providers: Vec::new(),
        }
    }

    pub fn add(&mut self, provider: Arc<dyn QueueProvider>) {
        self.providers.push(provider);
    }

    /// Provider responsible for `queue`.
    pub fn resolve(&self, queue: &str) -> &Arc<dyn QueueProvider> {
        self.providers
            .iter()
            .rev()
            .find(|provider| provider.supports(queue))
            .unwrap_or(&self.default)
    }

    /// Single provider serving every queue in `queues`.
    ///
    /// One fetch cannot span queues backed by different providers.
    pub fn resolve_all(&self, queues: &[String]) -> Result<&Arc<dyn QueueProvider>> {
        let (first, rest) = queues
            .split_first()
            .ok_or_else(|| StorageError::InvalidArgument("queue list must not be empty".into()))?;
        let provider = self.resolve(first);
        if let Some(other) = rest
            .iter()
            .find(|queue| !Arc::ptr_eq(self.resolve(queue), provider))
        {
            return Err(StorageError::InvalidArgument(format!(
                "queues {first:?} and {other:?} are served by different providers"
            )));
        }
        Ok(provider)
    }
}
