//! Test utilities shared by the Kiln integration tests.
//!
//! Provides:
//! - Temporary database fixtures
//! - Storage setup with short intervals
//! - Polling helpers

#![allow(dead_code)]

use kiln::queue::FetchedJob;
use kiln::storage::NewJob;
use kiln::{CancellationToken, Storage, StorageOptions};
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

/// Test fixture that manages a temporary database directory.
///
/// The directory is automatically cleaned up when the fixture is dropped.
pub struct TestFixture {
    /// Temporary directory for test database
    pub temp_dir: TempDir,
    /// Path to the database file
    pub db_path: PathBuf,
}

impl TestFixture {
    /// Create a new test fixture with a temporary database directory.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let db_path = temp_dir.path().join("test.db");
        Self { temp_dir, db_path }
    }

    /// Get the database path as a string.
    pub fn db_path_str(&self) -> &str {
        self.db_path.to_str().expect("invalid path")
    }

    /// Open a storage on the fixture database.
    pub async fn storage(&self, options: StorageOptions) -> Storage {
        Storage::open(self.db_path_str(), options)
            .await
            .expect("failed to open storage")
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Options with a poll interval short enough for tests.
pub fn fast_options() -> StorageOptions {
    StorageOptions::default().with_queue_poll_interval(Duration::from_millis(50))
}

/// Create a job whose payload is `label` and enqueue it.
pub async fn enqueue_label(storage: &Storage, queue: &str, label: &str) -> i64 {
    storage
        .create_and_enqueue(queue, &NewJob::new(json!(label)), None)
        .await
        .expect("failed to enqueue")
}

/// Payload label of a job created by [`enqueue_label`].
pub async fn label_of(storage: &Storage, job_id: i64) -> String {
    storage
        .get_job(job_id)
        .await
        .expect("failed to read job")
        .and_then(|job| job.payload.as_str().map(str::to_string))
        .expect("job has no label")
}

/// Fetch from `names`, giving up after `wait`.
pub async fn fetch_within(storage: &Storage, names: &[&str], wait: Duration) -> Option<FetchedJob> {
    let cancel = CancellationToken::new();
    let timer = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(wait).await;
        timer.cancel();
    });
    storage
        .fetch(&queues(names), &cancel)
        .await
        .expect("fetch failed")
}

pub fn queues(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}

/// Wait for a condition to become true with timeout.
///
/// # Arguments
///
/// * `timeout` - Maximum time to wait
/// * `condition` - Closure that returns true when condition is met
///
/// # Returns
///
/// `true` if condition was met, `false` if timeout expired
pub async fn wait_for<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixture_creates_temp_dir() {
        let fixture = TestFixture::new();
        assert!(fixture.temp_dir.path().exists());
        assert!(fixture.db_path_str().contains("test.db"));
    }
}
