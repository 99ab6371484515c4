//! A claimed queue entry and its acknowledgment.

use rusqlite::params;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::error::Result;
use crate::now_millis;
use crate::storage::connection::ConnectionManager;
use crate::storage::schema::Schema;

/// A queue entry claimed by this fetcher.
///
/// Every write made through it is conditional on the fetch token. Once the
/// entry was reclaimed after its invisibility window, or already removed,
/// [`remove_from_queue`](Self::remove_from_queue) and
/// [`requeue`](Self::requeue) update nothing and return `Ok(false)`.
///
/// Under the sliding invisibility policy a heartbeat task keeps the entry
/// invisible until it is removed, requeued or this value is dropped.
pub struct FetchedJob {
    id: i64,
    job_id: i64,
    queue: String,
    token: String,
    fetched_at: i64,
    connections: Arc<ConnectionManager>,
    schema: Arc<Schema>,
    heartbeat: Option<AbortHandle>,
}

impl fmt::Debug for FetchedJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchedJob")
            .field("id", &self.id)
            .field("job_id", &self.job_id)
            .field("queue", &self.queue)
            .field("token", &self.token)
            .field("fetched_at", &self.fetched_at)
            .finish()
    }
}

impl FetchedJob {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: i64,
        job_id: i64,
        queue: String,
        token: String,
        fetched_at: i64,
        connections: Arc<ConnectionManager>,
        schema: Arc<Schema>,
        sliding_timeout: Option<Duration>,
    ) -> Self {
        let heartbeat = sliding_timeout.map(|timeout| {
            tokio::spawn(heartbeat(
                Arc::clone(&connections),
                Arc::clone(&schema),
                id,
                token.clone(),
                timeout / 5,
            ))
            .abort_handle()
        });

        Self {
            id,
            job_id,
            queue,
            token,
            fetched_at,
            connections,
            schema,
            heartbeat,
        }
    }

    /// Id of the queue entry.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Id of the job the entry refers to.
    pub fn job_id(&self) -> i64 {
        self.job_id
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Token stamped on the entry by this claim.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// When the entry was claimed, in Unix milliseconds.
    pub fn fetched_at(&self) -> i64 {
        self.fetched_at
    }

    fn stop_heartbeat(&self) {
        if let Some(handle) = &self.heartbeat {
            handle.abort();
        }
    }

    /// Acknowledge: delete the entry.
    ///
    /// Returns `false` when the entry no longer carries this claim's token.
    pub async fn remove_from_queue(&self) -> Result<bool> {
        self.stop_heartbeat();
        let (schema, id, token) = (&self.schema, self.id, self.token.as_str());
        let removed = self
            .connections
            .with_transaction(None, |tx| {
                Ok(tx.execute(
                    &format!(
                        "DELETE FROM {} WHERE Id = ?1 AND FetchToken = ?2",
                        schema.job_queue
                    ),
                    params![id, token],
                )?)
            })
            .await?;
        if removed == 0 {
            debug!(entry_id = id, "Entry already removed or reclaimed");
        }
        Ok(removed > 0)
    }

    /// Put the entry back so the next fetch can claim it right away.
    ///
    /// Returns `false` when the entry no longer carries this claim's token.
    pub async fn requeue(&self) -> Result<bool> {
        self.stop_heartbeat();
        let (schema, id, token) = (&self.schema, self.id, self.token.as_str());
        let updated = self
            .connections
            .with_transaction(None, |tx| {
                Ok(tx.execute(
                    &format!(
                        "UPDATE {} SET FetchedAt = NULL, FetchToken = NULL
                         WHERE Id = ?1 AND FetchToken = ?2",
                        schema.job_queue
                    ),
                    params![id, token],
                )?)
            })
            .await?;
        Ok(updated > 0)
    }

    /// Refresh the fetch time, extending the invisibility window.
    pub async fn keep_alive(&self) -> Result<bool> {
        touch(&self.connections, &self.schema, self.id, &self.token).await
    }
}

impl Drop for FetchedJob {
    fn drop(&mut self) {
        self.stop_heartbeat();
    }
}

async fn touch(connections: &ConnectionManager, schema: &Schema, id: i64, token: &str) -> Result<bool> {
    let updated = connections
        .with_transaction(None, |tx| {
            let now = now_millis();
            Ok(tx.execute(
                &format!(
                    "UPDATE {} SET FetchedAt = ?1 WHERE Id = ?2 AND FetchToken = ?3",
                    schema.job_queue
                ),
                params![now, id, token],
            )?)
        })
        .await?;
    Ok(updated > 0)
}

async fn heartbeat(
    connections: Arc<ConnectionManager>,
    schema: Arc<Schema>,
    id: i64,
    token: String,
    every: Duration,
) {
    let every = every.max(Duration::from_millis(10));
    loop {
        tokio::time::sleep(every).await;
        match touch(&connections, &schema, id, &token).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(entry_id = id, "Entry gone, stopping heartbeat");
                return;
            }
            Err(error) => warn!(entry_id = id, %error, "Failed to extend invisibility"),
        }
    }
}
