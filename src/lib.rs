//! Kiln: SQLite persistence and queueing engine for background job processors.
//!
//! Kiln durably stores job records, exposes a FIFO work queue per named
//! channel with At-Least-Once delivery, serializes writers against the
//! single-writer SQLite engine, and sweeps expired records in the background.
//!
//! # Architecture
//!
//! - **Single writer**: a process-wide reader/writer lock per database identity
//! - **Scoped resources**: writer lock, pooled connection and transaction are
//!   nested guards, each released on every exit path
//! - **Invisibility**: fetched queue entries are hidden until acknowledged or
//!   until their invisibility window lapses
//! - **Observable**: structured `tracing` spans and events
//!
//! # Modules
//!
//! - [`config`]: storage options and CLI configuration
//! - [`components`]: background components (expiration sweeper)
//! - [`error`]: error taxonomy
//! - [`monitoring`]: read-only statistics over the same tables
//! - [`observability`]: tracing setup
//! - [`queue`]: job queue protocol and queue providers
//! - [`storage`]: storage facade, lock registry, connections, schema, job records

// Lint configuration
#![warn(clippy::all)]
#![allow(
    clippy::module_name_repetitions,    // storage::StorageError is fine
    clippy::must_use_candidate,         // Not all functions need #[must_use]
    clippy::missing_errors_doc,         // Error docs can be verbose
    clippy::missing_panics_doc,         // Panic docs can be verbose
    clippy::needless_raw_string_hashes, // r#""# is fine for SQL
    clippy::similar_names,              // job_id/jobs_id are fine
    clippy::struct_excessive_bools,     // Config structs may have flags
    clippy::too_many_lines              // Some functions are inherently long
)]

pub mod components;
pub mod config;
pub mod error;
pub mod monitoring;
pub mod observability;
pub mod queue;
pub mod storage;

pub use config::{InvisibilityPolicy, IsolationLevel, StorageOptions};
pub use error::{Result, StorageError};
pub use queue::FetchedJob;
pub use storage::{ConnectionSource, Storage};
pub use tokio_util::sync::CancellationToken;

use uuid::Uuid;

/// Generate a new UUIDv7 (time-sortable) fetcher token.
///
/// Every successful claim of a queue entry stamps the row with a fresh
/// token; acknowledge and requeue only touch rows still carrying it.
///
/// # Example
///
/// ```
/// let token = kiln::generate_fetch_token();
/// assert!(token.len() == 36); // UUID string format
/// ```
#[must_use]
pub fn generate_fetch_token() -> String {
    Uuid::now_v7().to_string()
}

/// Get the current Unix timestamp in milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Convert a duration to whole milliseconds, saturating at `i64::MAX`.
pub(crate) fn duration_millis(duration: std::time::Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
