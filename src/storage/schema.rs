//! Schema naming, installation and connection pragmas.
//!
//! Every table lives under the configured schema name, quoted as a single
//! identifier (`"Kiln.Job"`), so several logical schemas can share one
//! database file.

use rusqlite::Connection;
use std::time::Duration;

/// Version recorded in the schema table by the built-in installer.
pub const SCHEMA_VERSION: i64 = 1;

/// Fully qualified, quoted table names for one schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    name: String,
    pub version: String,
    pub job: String,
    pub state: String,
    pub job_parameter: String,
    pub job_queue: String,
    pub counter: String,
    pub aggregated_counter: String,
    pub hash: String,
    pub list: String,
    pub set: String,
}

impl Schema {
    /// Build table names for `name`. The name is assumed to be validated.
    pub fn new(name: &str) -> Self {
        let table = |table: &str| format!("\"{name}.{table}\"");
        Self {
            name: name.to_string(),
            version: table("Schema"),
            job: table("Job"),
            state: table("State"),
            job_parameter: table("JobParameter"),
            job_queue: table("JobQueue"),
            counter: table("Counter"),
            aggregated_counter: table("AggregatedCounter"),
            hash: table("Hash"),
            list: table("List"),
            set: table("Set"),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Quoted index name, unique per schema.
    fn index(&self, suffix: &str) -> String {
        format!("\"IX_{}_{}\"", self.name, suffix)
    }

    /// Tables holding an `ExpireAt` column, in sweep order.
    pub fn expirable_tables(&self) -> [&str; 6] {
        [
            &self.aggregated_counter,
            &self.counter,
            &self.job,
            &self.list,
            &self.set,
            &self.hash,
        ]
    }
}

/// Installs the tables a storage needs.
///
/// Installation runs inside a write transaction when a storage is opened
/// with `prepare_schema_if_necessary`.
pub trait SchemaInstaller: Send + Sync {
    fn install(&self, conn: &Connection, schema: &Schema) -> rusqlite::Result<()>;
}

/// Built-in installer creating every table and index if missing.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteObjectsInstaller;

impl SchemaInstaller for SqliteObjectsInstaller {
    fn install(&self, conn: &Connection, schema: &Schema) -> rusqlite::Result<()> {
        conn.execute_batch(&install_script(schema))?;
        tracing::debug!(schema = schema.name(), "Schema installed");
        Ok(())
    }
}

fn install_script(s: &Schema) -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {version} (
            Version INTEGER NOT NULL PRIMARY KEY
        );
        INSERT OR IGNORE INTO {version} (Version) VALUES ({schema_version});

        CREATE TABLE IF NOT EXISTS {job} (
            Id INTEGER PRIMARY KEY AUTOINCREMENT,
            StateId INTEGER NULL,
            StateName TEXT NULL,
            InvocationData TEXT NOT NULL,
            CreatedAt INTEGER NOT NULL,
            ExpireAt INTEGER NULL
        );
        CREATE INDEX IF NOT EXISTS {ix_job_state} ON {job} (StateName);
        CREATE INDEX IF NOT EXISTS {ix_job_expire} ON {job} (ExpireAt);

        CREATE TABLE IF NOT EXISTS {state} (
            Id INTEGER PRIMARY KEY AUTOINCREMENT,
            JobId INTEGER NOT NULL REFERENCES {job} (Id) ON DELETE CASCADE,
            Name TEXT NOT NULL,
            Reason TEXT NULL,
            CreatedAt INTEGER NOT NULL,
            Data TEXT NULL
        );
        CREATE INDEX IF NOT EXISTS {ix_state_job} ON {state} (JobId);

        CREATE TABLE IF NOT EXISTS {job_parameter} (
            Id INTEGER PRIMARY KEY AUTOINCREMENT,
            JobId INTEGER NOT NULL REFERENCES {job} (Id) ON DELETE CASCADE,
            Name TEXT NOT NULL,
            Value TEXT NULL,
            UNIQUE (JobId, Name)
        );

        CREATE TABLE IF NOT EXISTS {job_queue} (
            Id INTEGER PRIMARY KEY AUTOINCREMENT,
            JobId INTEGER NOT NULL REFERENCES {job} (Id) ON DELETE CASCADE,
            Queue TEXT NOT NULL,
            FetchedAt INTEGER NULL,
            FetchToken TEXT NULL
        );
        CREATE INDEX IF NOT EXISTS {ix_queue} ON {job_queue} (Queue, FetchedAt);
        CREATE INDEX IF NOT EXISTS {ix_queue_job} ON {job_queue} (JobId);

        CREATE TABLE IF NOT EXISTS {counter} (
            Id INTEGER PRIMARY KEY AUTOINCREMENT,
            Key TEXT NOT NULL,
            Value INTEGER NOT NULL,
            ExpireAt INTEGER NULL
        );
        CREATE INDEX IF NOT EXISTS {ix_counter} ON {counter} (Key);

        CREATE TABLE IF NOT EXISTS {aggregated_counter} (
            Key TEXT NOT NULL PRIMARY KEY,
            Value INTEGER NOT NULL,
            ExpireAt INTEGER NULL
        );

        CREATE TABLE IF NOT EXISTS {hash} (
            Id INTEGER PRIMARY KEY AUTOINCREMENT,
            Key TEXT NOT NULL,
            Field TEXT NOT NULL,
            Value TEXT NULL,
            ExpireAt INTEGER NULL,
            UNIQUE (Key, Field)
        );

        CREATE TABLE IF NOT EXISTS {list} (
            Id INTEGER PRIMARY KEY AUTOINCREMENT,
            Key TEXT NOT NULL,
            Value TEXT NULL,
            ExpireAt INTEGER NULL
        );

        CREATE TABLE IF NOT EXISTS {set} (
            Id INTEGER PRIMARY KEY AUTOINCREMENT,
            Key TEXT NOT NULL,
            Value TEXT NOT NULL,
            Score REAL NOT NULL,
            ExpireAt INTEGER NULL,
            UNIQUE (Key, Value)
        );
        "#,
        version = s.version,
        schema_version = SCHEMA_VERSION,
        job = s.job,
        state = s.state,
        job_parameter = s.job_parameter,
        job_queue = s.job_queue,
        counter = s.counter,
        aggregated_counter = s.aggregated_counter,
        hash = s.hash,
        list = s.list,
        set = s.set,
        ix_job_state = s.index("Job_StateName"),
        ix_job_expire = s.index("Job_ExpireAt"),
        ix_state_job = s.index("State_JobId"),
        ix_queue = s.index("JobQueue_QueueAndFetchedAt"),
        ix_queue_job = s.index("JobQueue_JobId"),
        ix_counter = s.index("Counter_Key"),
    )
}

/// Read the installed schema version, if any.
pub fn installed_version(conn: &Connection, schema: &Schema) -> rusqlite::Result<Option<i64>> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
        [format!("{}.Schema", schema.name())],
        |row| row.get(0),
    )?;
    if !exists {
        return Ok(None);
    }
    conn.query_row(
        &format!("SELECT MAX(Version) FROM {}", schema.version),
        [],
        |row| row.get(0),
    )
}

/// Apply the pragmas every connection needs.
///
/// - Busy timeout bounding how long a statement waits on another process
/// - WAL journal so readers never block on the writer
/// - Foreign keys, so deleting a job cascades to its states and queue rows
pub fn apply_pragmas(conn: &Connection, busy_timeout: Duration) -> rusqlite::Result<()> {
    conn.busy_timeout(busy_timeout)?;
    let _mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(())
}
