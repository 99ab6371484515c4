//! The built-in queue, stored in the `JobQueue` table.

use async_trait::async_trait;
use rusqlite::types::ToSql;
use rusqlite::{params, OptionalExtension, Transaction};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

use super::fetched::FetchedJob;
use super::notify::{wait_for_queues, NotificationBus};
use super::{JobQueue, QueueProvider};
use crate::config::{InvisibilityPolicy, StorageOptions};
use crate::error::Result;
use crate::storage::connection::ConnectionManager;
use crate::storage::schema::Schema;
use crate::{duration_millis, generate_fetch_token, now_millis};

/// Row picked by a claim attempt.
#[derive(Debug)]
struct Candidate {
    id: i64,
    job_id: i64,
    queue: String,
    /// Fetch time written by the claim.
    fetched_at: i64,
}

/// Outcome of one claim attempt.
#[derive(Debug)]
enum Claim {
    Claimed(Candidate),
    Empty,
    /// The candidate was claimed by someone else between select and update.
    Lost,
}

/// SQLite-backed [`JobQueue`].
pub struct SqliteJobQueue {
    connections: Arc<ConnectionManager>,
    schema: Arc<Schema>,
    notifications: NotificationBus,
    poll_interval: Duration,
    policy: InvisibilityPolicy,
    invisibility_timeout: Duration,
}

impl std::fmt::Debug for SqliteJobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteJobQueue")
            .field("schema", &self.schema.name())
            .field("poll_interval", &self.poll_interval)
            .field("policy", &self.policy)
            .finish()
    }
}

impl SqliteJobQueue {
    pub fn new(
        connections: Arc<ConnectionManager>,
        schema: Arc<Schema>,
        notifications: NotificationBus,
        options: &StorageOptions,
    ) -> Self {
        Self {
            connections,
            schema,
            notifications,
            poll_interval: options.queue_poll_interval,
            policy: options.invisibility_policy,
            invisibility_timeout: options.invisibility_timeout(),
        }
    }

    /// Try once to claim an entry. Does not wait.
    pub async fn try_fetch(&self, queues: &[String]) -> Result<Option<FetchedJob>> {
        let window = duration_millis(self.invisibility_timeout);
        loop {
            let token = generate_fetch_token();
            let schema = &self.schema;

            // The clock is read once the writer lock is held, so a long lock
            // wait cannot leave the claim stamped with a stale time.
            let claim = self
                .connections
                .with_transaction(None, |tx| {
                    let now = now_millis();
                    claim_next(tx, schema, queues, now, now.saturating_sub(window), &token)
                })
                .await?;

            match claim {
                Claim::Claimed(candidate) => {
                    debug!(
                        queue = %candidate.queue,
                        job_id = candidate.job_id,
                        entry_id = candidate.id,
                        "Claimed queue entry"
                    );
                    let heartbeat = match self.policy {
                        InvisibilityPolicy::Sliding => Some(self.invisibility_timeout),
                        InvisibilityPolicy::Fixed => None,
                    };
                    return Ok(Some(FetchedJob::new(
                        candidate.id,
                        candidate.job_id,
                        candidate.queue,
                        token,
                        candidate.fetched_at,
                        Arc::clone(&self.connections),
                        Arc::clone(&self.schema),
                        heartbeat,
                    )));
                }
                Claim::Empty => return Ok(None),
                Claim::Lost => {
                    trace!("Lost a claim race, retrying");
                }
            }
        }
    }
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    fn enqueue(&self, tx: &Transaction<'_>, queue: &str, job_id: i64) -> Result<()> {
        tx.execute(
            &format!(
                "INSERT INTO {} (JobId, Queue) VALUES (?1, ?2)",
                self.schema.job_queue
            ),
            params![job_id, queue],
        )?;
        // Fetchers woken now block on the writer lock until this commits.
        self.notifications.notify(queue);
        Ok(())
    }

    #[instrument(name = "kiln.fetch", skip(self, cancel))]
    async fn fetch(
        &self,
        queues: &[String],
        cancel: &CancellationToken,
    ) -> Result<Option<FetchedJob>> {
        if queues.is_empty() {
            return Err(crate::StorageError::InvalidArgument(
                "queue list must not be empty".into(),
            ));
        }

        // Subscribe before the first attempt so an enqueue racing with it
        // is not missed.
        let mut wakeups = self.notifications.subscribe();
        loop {
            if cancel.is_cancelled() {
                debug!("Fetch cancelled");
                return Ok(None);
            }
            if let Some(job) = self.try_fetch(queues).await? {
                return Ok(Some(job));
            }

            trace!(
                "No claimable entries. Polling again in {:?}",
                self.poll_interval
            );
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("Fetch cancelled");
                    return Ok(None);
                }
                () = tokio::time::sleep(self.poll_interval) => {}
                () = wait_for_queues(&mut wakeups, queues) => {}
            }
        }
    }
}

/// Select the next claimable entry and stamp it with `token`.
///
/// Ordered by position of the queue in `queues`, then by insertion. The
/// update repeats the visibility condition, so a row claimed by someone else
/// in between updates nothing and the attempt reports [`Claim::Lost`].
fn claim_next(
    tx: &Transaction<'_>,
    schema: &Schema,
    queues: &[String],
    now: i64,
    cutoff: i64,
    token: &str,
) -> Result<Claim> {
    let placeholders = (1..=queues.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let priority = (1..=queues.len())
        .map(|i| format!("WHEN ?{i} THEN {i}"))
        .collect::<Vec<_>>()
        .join(" ");
    let cutoff_param = queues.len() + 1;

    let sql = format!(
        "SELECT Id, JobId, Queue FROM {table}
         WHERE Queue IN ({placeholders})
           AND (FetchedAt IS NULL OR FetchedAt < ?{cutoff_param})
         ORDER BY CASE Queue {priority} END, Id ASC
         LIMIT 1",
        table = schema.job_queue,
    );

    let mut values: Vec<&dyn ToSql> = queues.iter().map(|q| q as &dyn ToSql).collect();
    values.push(&cutoff);

    let candidate = tx
        .query_row(&sql, values.as_slice(), |row| {
            Ok(Candidate {
                id: row.get(0)?,
                job_id: row.get(1)?,
                queue: row.get(2)?,
                fetched_at: now,
            })
        })
        .optional()?;

    let Some(candidate) = candidate else {
        return Ok(Claim::Empty);
    };

    let updated = tx.execute(
        &format!(
            "UPDATE {} SET FetchedAt = ?1, FetchToken = ?2
             WHERE Id = ?3 AND (FetchedAt IS NULL OR FetchedAt < ?4)",
            schema.job_queue
        ),
        params![now, token, candidate.id, cutoff],
    )?;

    Ok(if updated == 1 {
        Claim::Claimed(candidate)
    } else {
        Claim::Lost
    })
}

/// Provider serving every queue with a [`SqliteJobQueue`].
#[derive(Debug)]
pub struct SqliteJobQueueProvider {
    queue: Arc<SqliteJobQueue>,
}

impl SqliteJobQueueProvider {
    pub fn new(queue: SqliteJobQueue) -> Self {
        Self {
            queue: Arc::new(queue),
        }
    }
}

impl QueueProvider for SqliteJobQueueProvider {
    fn supports(&self, _queue: &str) -> bool {
        true
    }

    fn queue(&self) -> Arc<dyn JobQueue> {
        self.queue.clone()
    }
}
