//! Periodic removal of expired records.
//!
//! Each cycle deletes rows whose `ExpireAt` is at or before the current time
//! from every expirable table. Rows go in bounded batches, one write
//! transaction per batch, so the writer lock is never held for long and
//! enqueue/fetch traffic interleaves with a large sweep.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use super::BackgroundComponent;
use crate::error::Result;
use crate::now_millis;
use crate::storage::connection::ConnectionManager;
use crate::storage::schema::Schema;

/// Rows deleted per transaction.
pub const DEFAULT_BATCH_SIZE: usize = 1_000;

/// Rows removed by one sweep, per table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub removed: BTreeMap<String, usize>,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.removed.values().sum()
    }
}

/// Deletes expired jobs and auxiliary records.
#[derive(Debug, Clone)]
pub struct ExpirationManager {
    connections: Arc<ConnectionManager>,
    schema: Arc<Schema>,
    check_interval: Duration,
    batch_size: usize,
}

impl ExpirationManager {
    pub fn new(
        connections: Arc<ConnectionManager>,
        schema: Arc<Schema>,
        check_interval: Duration,
    ) -> Self {
        Self {
            connections,
            schema,
            check_interval,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    /// Run one sweep over every expirable table, relative to now.
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        self.sweep_at(now_millis()).await
    }

    /// Run one sweep treating `now` (Unix milliseconds) as the current time.
    ///
    /// A table that fails is logged and skipped so the others are still
    /// swept; the first failure is returned once every table was tried.
    #[instrument(skip(self))]
    pub async fn sweep_at(&self, now: i64) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let mut first_error = None;
        for table in self.schema.expirable_tables() {
            match self.sweep_table(table, now).await {
                Ok(removed) => {
                    if removed > 0 {
                        debug!(table, removed, "Removed expired records");
                    }
                    report.removed.insert(table.to_string(), removed);
                }
                Err(error) => {
                    error!(table, %error, "Failed to remove expired records");
                    first_error.get_or_insert(error);
                }
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(report),
        }
    }

    async fn sweep_table(&self, table: &str, now: i64) -> Result<usize> {
        let mut removed = 0;
        loop {
            let batch = self.delete_batch(table, now).await?;
            removed += batch;
            if batch < self.batch_size {
                return Ok(removed);
            }
        }
    }

    async fn delete_batch(&self, table: &str, now: i64) -> Result<usize> {
        let limit = i64::try_from(self.batch_size).unwrap_or(i64::MAX);
        self.connections
            .with_transaction(None, |tx| {
                Ok(tx.execute(
                    &format!(
                        "DELETE FROM {table} WHERE rowid IN (
                            SELECT rowid FROM {table}
                            WHERE ExpireAt IS NOT NULL AND ExpireAt <= ?1
                            LIMIT ?2
                        )"
                    ),
                    rusqlite::params![now, limit],
                )?)
            })
            .await
    }
}

#[async_trait]
impl BackgroundComponent for ExpirationManager {
    fn name(&self) -> &'static str {
        "expiration-manager"
    }

    async fn run(&self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match self.sweep_once().await {
                Ok(report) if report.total() > 0 => {
                    info!(removed = report.total(), "Expiration sweep finished");
                }
                Ok(_) => debug!("Expiration sweep found nothing to remove"),
                Err(error) => {
                    error!(%error, "Expiration sweep failed, retrying next interval");
                }
            }

            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.check_interval) => {}
            }
        }
        debug!("Expiration manager stopped");
    }
}
