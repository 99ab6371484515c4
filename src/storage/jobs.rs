//! Job records, their state history and auxiliary keyed records.
//!
//! Writers take a `&Connection` so they run inside whatever transaction the
//! caller opened (a `Transaction` derefs to its connection). That is how job
//! creation and `enqueue` commit atomically.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

use super::schema::Schema;
use crate::error::{Result, StorageError};
use crate::{duration_millis, now_millis};

/// Well-known state names.
pub mod states {
    pub const ENQUEUED: &str = "Enqueued";
    pub const SCHEDULED: &str = "Scheduled";
    pub const PROCESSING: &str = "Processing";
    pub const SUCCEEDED: &str = "Succeeded";
    pub const FAILED: &str = "Failed";
    pub const DELETED: &str = "Deleted";
}

/// A job to be created. The payload is opaque to the storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub payload: Value,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl NewJob {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }
}

/// A stored job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
    pub id: i64,
    pub state_name: Option<String>,
    pub payload: Value,
    pub created_at: i64,
    pub expire_at: Option<i64>,
}

/// A state transition to record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    pub name: String,
    pub reason: Option<String>,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl StateRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

/// One entry of a job's state history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateHistoryEntry {
    pub id: i64,
    pub name: String,
    pub reason: Option<String>,
    pub created_at: i64,
    pub data: BTreeMap<String, String>,
}

fn expire_at(now: i64, expire_in: Option<Duration>) -> Option<i64> {
    expire_in.map(|ttl| now.saturating_add(duration_millis(ttl)))
}

/// Insert a job with its parameters, returning the new id.
pub fn create_job(
    conn: &Connection,
    schema: &Schema,
    job: &NewJob,
    created_at: i64,
    expire_in: Option<Duration>,
) -> Result<i64> {
    let payload = serde_json::to_string(&job.payload)?;
    conn.execute(
        &format!(
            "INSERT INTO {} (InvocationData, CreatedAt, ExpireAt) VALUES (?1, ?2, ?3)",
            schema.job
        ),
        params![payload, created_at, expire_at(created_at, expire_in)],
    )?;
    let job_id = conn.last_insert_rowid();

    for (name, value) in &job.parameters {
        set_job_parameter(conn, schema, job_id, name, value)?;
    }

    tracing::trace!(job_id, "Job created");
    Ok(job_id)
}

/// Record a state transition and make it the job's current state.
pub fn set_job_state(
    conn: &Connection,
    schema: &Schema,
    job_id: i64,
    state: &StateRecord,
) -> Result<i64> {
    let data = serde_json::to_string(&state.data)?;
    conn.execute(
        &format!(
            "INSERT INTO {} (JobId, Name, Reason, CreatedAt, Data) VALUES (?1, ?2, ?3, ?4, ?5)",
            schema.state
        ),
        params![job_id, state.name, state.reason, now_millis(), data],
    )
    .map_err(|err| match err {
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY =>
        {
            StorageError::JobNotFound(job_id)
        }
        other => StorageError::Database(other),
    })?;
    let state_id = conn.last_insert_rowid();

    let updated = conn.execute(
        &format!(
            "UPDATE {} SET StateId = ?1, StateName = ?2 WHERE Id = ?3",
            schema.job
        ),
        params![state_id, state.name, job_id],
    )?;
    if updated == 0 {
        return Err(StorageError::JobNotFound(job_id));
    }
    Ok(state_id)
}

/// Schedule the job (and, through cascading deletes, its history and queue
/// entries) for removal after `ttl`.
pub fn expire_job(conn: &Connection, schema: &Schema, job_id: i64, ttl: Duration) -> Result<()> {
    conn.execute(
        &format!("UPDATE {} SET ExpireAt = ?1 WHERE Id = ?2", schema.job),
        params![now_millis().saturating_add(duration_millis(ttl)), job_id],
    )?;
    Ok(())
}

/// Clear the job's expiration.
pub fn persist_job(conn: &Connection, schema: &Schema, job_id: i64) -> Result<()> {
    conn.execute(
        &format!("UPDATE {} SET ExpireAt = NULL WHERE Id = ?1", schema.job),
        [job_id],
    )?;
    Ok(())
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<(i64, Option<String>, String, i64, Option<i64>)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

pub(crate) const JOB_COLUMNS: &str = "Id, StateName, InvocationData, CreatedAt, ExpireAt";

pub(crate) fn decode_job(
    (id, state_name, payload, created_at, expire_at): (i64, Option<String>, String, i64, Option<i64>),
) -> Result<JobRecord> {
    Ok(JobRecord {
        id,
        state_name,
        payload: serde_json::from_str(&payload)?,
        created_at,
        expire_at,
    })
}

pub(crate) fn query_jobs(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<JobRecord>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, job_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(decode_job).collect()
}

/// Load a job by id.
pub fn get_job(conn: &Connection, schema: &Schema, job_id: i64) -> Result<Option<JobRecord>> {
    let row = conn
        .query_row(
            &format!("SELECT {JOB_COLUMNS} FROM {} WHERE Id = ?1", schema.job),
            [job_id],
            job_from_row,
        )
        .optional()?;
    row.map(decode_job).transpose()
}

/// A job's states, oldest first.
pub fn state_history(
    conn: &Connection,
    schema: &Schema,
    job_id: i64,
) -> Result<Vec<StateHistoryEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT Id, Name, Reason, CreatedAt, Data FROM {} WHERE JobId = ?1 ORDER BY Id ASC",
        schema.state
    ))?;
    let rows = stmt
        .query_map([job_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(id, name, reason, created_at, data)| {
            let data = match data {
                Some(json) => serde_json::from_str(&json)?,
                None => BTreeMap::new(),
            };
            Ok(StateHistoryEntry {
                id,
                name,
                reason,
                created_at,
                data,
            })
        })
        .collect()
}

/// Insert or replace a named parameter of a job.
pub fn set_job_parameter(
    conn: &Connection,
    schema: &Schema,
    job_id: i64,
    name: &str,
    value: &str,
) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO {} (JobId, Name, Value) VALUES (?1, ?2, ?3)
             ON CONFLICT (JobId, Name) DO UPDATE SET Value = excluded.Value",
            schema.job_parameter
        ),
        params![job_id, name, value],
    )?;
    Ok(())
}

pub fn get_job_parameter(
    conn: &Connection,
    schema: &Schema,
    job_id: i64,
    name: &str,
) -> Result<Option<String>> {
    let value = conn
        .query_row(
            &format!(
                "SELECT Value FROM {} WHERE JobId = ?1 AND Name = ?2",
                schema.job_parameter
            ),
            params![job_id, name],
            |row| row.get::<_, Option<String>>(0),
        )
        .optional()?;
    Ok(value.flatten())
}

/// Every parameter of a job, by name.
pub fn job_parameters(
    conn: &Connection,
    schema: &Schema,
    job_id: i64,
) -> Result<BTreeMap<String, String>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT Name, Value FROM {} WHERE JobId = ?1",
        schema.job_parameter
    ))?;
    let rows = stmt
        .query_map([job_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows
        .into_iter()
        .map(|(name, value)| (name, value.unwrap_or_default()))
        .collect())
}

/// Append a counter increment; counters are summed on read.
pub fn increment_counter(
    conn: &Connection,
    schema: &Schema,
    key: &str,
    delta: i64,
    expire_in: Option<Duration>,
) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO {} (Key, Value, ExpireAt) VALUES (?1, ?2, ?3)",
            schema.counter
        ),
        params![key, delta, expire_at(now_millis(), expire_in)],
    )?;
    Ok(())
}

/// Current value of a counter, including its aggregated part.
pub fn counter_value(conn: &Connection, schema: &Schema, key: &str) -> Result<i64> {
    let value = conn.query_row(
        &format!(
            "SELECT COALESCE((SELECT SUM(Value) FROM {} WHERE Key = ?1), 0)
                  + COALESCE((SELECT Value FROM {} WHERE Key = ?1), 0)",
            schema.counter, schema.aggregated_counter
        ),
        [key],
        |row| row.get(0),
    )?;
    Ok(value)
}

/// Add `value` to the sorted set `key`, updating its score if present.
pub fn add_to_set(
    conn: &Connection,
    schema: &Schema,
    key: &str,
    value: &str,
    score: f64,
    expire_in: Option<Duration>,
) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO {} (Key, Value, Score, ExpireAt) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (Key, Value) DO UPDATE SET Score = excluded.Score, ExpireAt = excluded.ExpireAt",
            schema.set
        ),
        params![key, value, score, expire_at(now_millis(), expire_in)],
    )?;
    Ok(())
}
