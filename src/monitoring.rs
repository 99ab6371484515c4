//! Read-only statistics over the storage tables.
//!
//! Queries go straight to the tables on read connections; they never take
//! the writer lock and never touch the queue protocol.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::Result;
use crate::storage::connection::ConnectionManager;
use crate::storage::jobs::{self, JobRecord, StateHistoryEntry, JOB_COLUMNS};
use crate::storage::schema::Schema;

/// Entry counts of one queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatistics {
    pub queue: String,
    /// Entries never claimed or put back by requeue.
    pub enqueued: i64,
    /// Entries carrying a claim, including lapsed claims not yet reclaimed.
    pub fetched: i64,
}

/// A job with its history and parameters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobDetails {
    pub job: JobRecord,
    pub history: Vec<StateHistoryEntry>,
    pub parameters: BTreeMap<String, String>,
}

/// Dashboard-style read API.
#[derive(Debug, Clone)]
pub struct MonitoringApi {
    connections: Arc<ConnectionManager>,
    schema: Arc<Schema>,
    list_limit: usize,
}

impl MonitoringApi {
    pub(crate) fn new(
        connections: Arc<ConnectionManager>,
        schema: Arc<Schema>,
        list_limit: usize,
    ) -> Self {
        Self {
            connections,
            schema,
            list_limit,
        }
    }

    /// Names of every queue holding entries, sorted.
    pub async fn queues(&self) -> Result<Vec<String>> {
        let schema = &self.schema;
        self.connections
            .with_connection(false, |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT DISTINCT Queue FROM {} ORDER BY Queue ASC",
                    schema.job_queue
                ))?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Waiting and claimed entry counts for `queue`.
    ///
    /// A claim counts as fetched until it is acknowledged or requeued; lapsed
    /// claims are reclaimed lazily by the next fetch.
    pub async fn queue_statistics(&self, queue: &str) -> Result<QueueStatistics> {
        let schema = &self.schema;
        let (enqueued, fetched) = self
            .connections
            .with_connection(false, |conn| {
                Ok(conn.query_row(
                    &format!(
                        "SELECT
                            COALESCE(SUM(CASE WHEN FetchedAt IS NULL THEN 1 ELSE 0 END), 0),
                            COALESCE(SUM(CASE WHEN FetchedAt IS NOT NULL THEN 1 ELSE 0 END), 0)
                         FROM {} WHERE Queue = ?1",
                        schema.job_queue
                    ),
                    [queue],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
                )?)
            })
            .await?;
        Ok(QueueStatistics {
            queue: queue.to_string(),
            enqueued,
            fetched,
        })
    }

    /// Number of jobs per current state name.
    pub async fn state_counts(&self) -> Result<BTreeMap<String, i64>> {
        let schema = &self.schema;
        self.connections
            .with_connection(false, |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT StateName, COUNT(*) FROM {} WHERE StateName IS NOT NULL GROUP BY StateName",
                    schema.job
                ))?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                    .collect::<Result<BTreeMap<_, _>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Jobs currently in `state`, newest first.
    ///
    /// `count` is capped by the dashboard list limit.
    pub async fn jobs_by_state(&self, state: &str, from: usize, count: usize) -> Result<Vec<JobRecord>> {
        let schema = &self.schema;
        let limit = i64::try_from(count.min(self.list_limit)).unwrap_or(i64::MAX);
        let offset = i64::try_from(from).unwrap_or(i64::MAX);
        self.connections
            .with_connection(false, |conn| {
                jobs::query_jobs(
                    conn,
                    &format!(
                        "SELECT {JOB_COLUMNS} FROM {} WHERE StateName = ?1
                         ORDER BY Id DESC LIMIT ?2 OFFSET ?3",
                        schema.job
                    ),
                    rusqlite::params![state, limit, offset],
                )
            })
            .await
    }

    /// Everything known about one job.
    pub async fn job_details(&self, job_id: i64) -> Result<Option<JobDetails>> {
        let schema = &self.schema;
        self.connections
            .with_connection(false, |conn| {
                let Some(job) = jobs::get_job(conn, schema, job_id)? else {
                    return Ok(None);
                };
                Ok(Some(JobDetails {
                    job,
                    history: jobs::state_history(conn, schema, job_id)?,
                    parameters: jobs::job_parameters(conn, schema, job_id)?,
                }))
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::{NewJob, Storage, StateRecord};
    use crate::StorageOptions;
    use serde_json::json;
    use tempfile::TempDir;

    async fn storage(dir: &TempDir, limit: usize) -> Storage {
        let options = StorageOptions {
            dashboard_job_list_limit: limit,
            ..StorageOptions::default()
        };
        Storage::open(dir.path().join("monitor.db"), options)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_queue_statistics() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir, 100).await;
        for n in 0..3 {
            storage
                .create_and_enqueue("default", &NewJob::new(json!(n)), None)
                .await
                .unwrap();
        }
        storage
            .create_and_enqueue("critical", &NewJob::new(json!("c")), None)
            .await
            .unwrap();

        let _claimed = storage
            .fetch(&["default".to_string()], &crate::CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        let monitoring = storage.monitoring();
        assert_eq!(monitoring.queues().await.unwrap(), vec!["critical", "default"]);
        let stats = monitoring.queue_statistics("default").await.unwrap();
        assert_eq!(stats.enqueued, 2);
        assert_eq!(stats.fetched, 1);
    }

    #[tokio::test]
    async fn test_lapsed_claim_counts_as_fetched() {
        let dir = TempDir::new().unwrap();
        let options = StorageOptions::default()
            .with_job_queue_execution_timeout(std::time::Duration::from_millis(10));
        let storage = Storage::open(dir.path().join("lapsed.db"), options)
            .await
            .unwrap();
        storage
            .create_and_enqueue("default", &NewJob::new(json!("a")), None)
            .await
            .unwrap();
        let _claimed = storage
            .fetch(&["default".to_string()], &crate::CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        let stats = storage.monitoring().queue_statistics("default").await.unwrap();
        assert_eq!(stats.enqueued, 0);
        assert_eq!(stats.fetched, 1);
    }

    #[tokio::test]
    async fn test_jobs_by_state_respects_limit() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir, 2).await;
        let mut ids = Vec::new();
        for n in 0..4 {
            ids.push(
                storage
                    .create_and_enqueue("default", &NewJob::new(json!(n)), None)
                    .await
                    .unwrap(),
            );
        }
        storage
            .set_job_state(ids[0], &StateRecord::new("Succeeded"))
            .await
            .unwrap();

        let monitoring = storage.monitoring();
        let enqueued = monitoring.jobs_by_state("Enqueued", 0, 10).await.unwrap();
        assert_eq!(enqueued.len(), 2);
        assert_eq!(enqueued[0].id, ids[3]);

        let counts = monitoring.state_counts().await.unwrap();
        assert_eq!(counts.get("Enqueued"), Some(&3));
        assert_eq!(counts.get("Succeeded"), Some(&1));
    }

    #[tokio::test]
    async fn test_job_details() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir, 10).await;
        let id = storage
            .create_and_enqueue(
                "default",
                &NewJob::new(json!({"k": "v"})).with_parameter("Retries", "0"),
                None,
            )
            .await
            .unwrap();

        let details = storage.monitoring().job_details(id).await.unwrap().unwrap();
        assert_eq!(details.job.payload, json!({"k": "v"}));
        assert_eq!(details.history.len(), 1);
        assert_eq!(details.parameters["Retries"], "0");
        assert!(storage.monitoring().job_details(id + 100).await.unwrap().is_none());
    }
}
