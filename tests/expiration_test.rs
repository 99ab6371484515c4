//! Expiration sweep integration tests.
//!
//! Tests:
//! - Inclusive expiry boundary
//! - Cascading removal of queue entries and state history
//! - Bounded batches
//! - A failing table does not block the others
//! - The background loop outlives failed cycles and stops on cancellation

mod common;

use common::{enqueue_label, fast_options, TestFixture};
use kiln::storage::{jobs, SchemaInstaller, SqliteObjectsInstaller};
use kiln::{CancellationToken, Storage, StorageError};
use rusqlite::params;
use std::time::Duration;

async fn set_expire_at(storage: &Storage, job_id: i64, expire_at: i64) {
    let table = storage.schema().job.clone();
    storage
        .with_transaction(None, |tx| {
            tx.execute(
                &format!("UPDATE {table} SET ExpireAt = ?1 WHERE Id = ?2"),
                params![expire_at, job_id],
            )?;
            Ok(())
        })
        .await
        .unwrap();
}

async fn count(storage: &Storage, table: &str, job_id: Option<i64>) -> i64 {
    let sql = match job_id {
        Some(job_id) => format!("SELECT COUNT(*) FROM {table} WHERE JobId = {job_id}"),
        None => format!("SELECT COUNT(*) FROM {table}"),
    };
    storage
        .with_connection(false, |conn| Ok(conn.query_row(&sql, [], |row| row.get(0))?))
        .await
        .unwrap()
}

async fn drop_table(storage: &Storage, table: &str) {
    storage
        .with_transaction(None, |tx| {
            tx.execute(&format!("DROP TABLE {table}"), [])?;
            Ok(())
        })
        .await
        .unwrap();
}

async fn wait_until_gone(storage: &Storage, job_id: i64) -> bool {
    for _ in 0..50 {
        if storage.get_job(job_id).await.unwrap().is_none() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_sweep_boundary_is_inclusive() {
    let fixture = TestFixture::new();
    let storage = fixture.storage(fast_options()).await;
    let t = 1_700_000_000_000_i64;

    let before = enqueue_label(&storage, "default", "t-1").await;
    let at = enqueue_label(&storage, "default", "t").await;
    let after = enqueue_label(&storage, "default", "t+1").await;
    set_expire_at(&storage, before, t - 1).await;
    set_expire_at(&storage, at, t).await;
    set_expire_at(&storage, after, t + 1).await;

    let report = storage.expiration_manager().sweep_at(t).await.unwrap();
    assert_eq!(report.removed[&storage.schema().job], 2);

    assert!(storage.get_job(before).await.unwrap().is_none());
    assert!(storage.get_job(at).await.unwrap().is_none());
    assert!(storage.get_job(after).await.unwrap().is_some());
}

#[tokio::test]
async fn test_jobs_without_expiry_survive() {
    let fixture = TestFixture::new();
    let storage = fixture.storage(fast_options()).await;
    let kept = enqueue_label(&storage, "default", "kept").await;
    let expired = enqueue_label(&storage, "default", "expired").await;
    storage.expire_job(expired, Duration::ZERO).await.unwrap();

    let report = storage.expiration_manager().sweep_once().await.unwrap();
    assert_eq!(report.total(), 1);
    assert!(storage.get_job(kept).await.unwrap().is_some());

    // Persisting clears a pending expiry.
    storage.expire_job(kept, Duration::ZERO).await.unwrap();
    storage.persist_job(kept).await.unwrap();
    let report = storage.expiration_manager().sweep_once().await.unwrap();
    assert_eq!(report.total(), 0);
}

#[tokio::test]
async fn test_expired_job_cascades() {
    let fixture = TestFixture::new();
    let storage = fixture.storage(fast_options()).await;
    let job_id = enqueue_label(&storage, "default", "gone").await;
    assert_eq!(count(&storage, &storage.schema().job_queue, Some(job_id)).await, 1);
    assert_eq!(count(&storage, &storage.schema().state, Some(job_id)).await, 1);

    set_expire_at(&storage, job_id, 1).await;
    storage.expiration_manager().sweep_at(1).await.unwrap();

    assert_eq!(count(&storage, &storage.schema().job_queue, Some(job_id)).await, 0);
    assert_eq!(count(&storage, &storage.schema().state, Some(job_id)).await, 0);
    assert_eq!(count(&storage, &storage.schema().job_parameter, Some(job_id)).await, 0);
}

#[tokio::test]
async fn test_sweep_covers_auxiliary_tables() {
    let fixture = TestFixture::new();
    let storage = fixture.storage(fast_options()).await;
    let schema = storage.schema().clone();
    storage
        .with_transaction(None, |tx| {
            jobs::increment_counter(tx, &schema, "stats:succeeded", 1, Some(Duration::ZERO))?;
            jobs::increment_counter(tx, &schema, "stats:succeeded", 1, None)?;
            jobs::add_to_set(tx, &schema, "recurring", "a", 1.0, Some(Duration::ZERO))?;
            jobs::add_to_set(tx, &schema, "recurring", "b", 2.0, None)?;
            Ok(())
        })
        .await
        .unwrap();

    let report = storage.expiration_manager().sweep_once().await.unwrap();
    assert_eq!(report.removed[&schema.counter], 1);
    assert_eq!(report.removed[&schema.set], 1);
    assert_eq!(report.total(), 2);

    let value = storage
        .with_connection(false, |conn| jobs::counter_value(conn, &schema, "stats:succeeded"))
        .await
        .unwrap();
    assert_eq!(value, 1);
    assert_eq!(count(&storage, &schema.set, None).await, 1);
}

#[tokio::test]
async fn test_sweep_runs_in_batches() {
    let fixture = TestFixture::new();
    let storage = fixture.storage(fast_options()).await;
    for n in 0..7 {
        let job_id = enqueue_label(&storage, "default", &format!("job-{n}")).await;
        set_expire_at(&storage, job_id, 10).await;
    }

    let before = storage.lock_stats().unwrap().write_acquired;
    let report = storage
        .expiration_manager()
        .with_batch_size(3)
        .sweep_at(10)
        .await
        .unwrap();
    assert_eq!(report.removed[&storage.schema().job], 7);

    // Three job batches (3 + 3 + 1), one for each of the five other tables.
    let transactions = storage.lock_stats().unwrap().write_acquired - before;
    assert_eq!(transactions, 3 + 5);
}

#[tokio::test]
async fn test_expiration_loop_stops_on_cancel() {
    let fixture = TestFixture::new();
    let storage = fixture
        .storage(fast_options().with_job_expiration_check_interval(Duration::from_millis(50)))
        .await;
    let job_id = enqueue_label(&storage, "default", "soon").await;
    storage.expire_job(job_id, Duration::ZERO).await.unwrap();

    let cancel = CancellationToken::new();
    let handle = storage.spawn_components(cancel.clone());
    assert_eq!(handle.len(), 1);

    assert!(
        wait_until_gone(&storage, job_id).await,
        "background sweep never removed the job"
    );

    tokio::time::timeout(Duration::from_secs(2), handle.shutdown())
        .await
        .expect("components did not stop");
}

#[tokio::test]
async fn test_sweep_continues_past_failing_table() {
    let fixture = TestFixture::new();
    let storage = fixture.storage(fast_options()).await;
    let job_id = enqueue_label(&storage, "default", "expired").await;
    storage.expire_job(job_id, Duration::ZERO).await.unwrap();

    // Swept before the job table.
    drop_table(&storage, &storage.schema().aggregated_counter).await;

    let result = storage.expiration_manager().sweep_once().await;
    assert!(matches!(result, Err(StorageError::Database(_))));
    assert!(storage.get_job(job_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_expiration_loop_survives_failed_cycles() {
    let fixture = TestFixture::new();
    let storage = fixture
        .storage(fast_options().with_job_expiration_check_interval(Duration::from_millis(50)))
        .await;
    let schema = storage.schema().clone();
    drop_table(&storage, &schema.counter).await;
    assert!(storage.expiration_manager().sweep_once().await.is_err());

    let handle = storage.spawn_components(CancellationToken::new());

    // Several cycles fail while the table is missing.
    tokio::time::sleep(Duration::from_millis(200)).await;
    storage
        .with_transaction(None, |tx| Ok(SqliteObjectsInstaller.install(tx, &schema)?))
        .await
        .unwrap();

    let job_id = enqueue_label(&storage, "default", "later").await;
    storage.expire_job(job_id, Duration::ZERO).await.unwrap();
    assert!(
        wait_until_gone(&storage, job_id).await,
        "loop stopped sweeping after a failed cycle"
    );
    assert!(storage.expiration_manager().sweep_once().await.is_ok());

    tokio::time::timeout(Duration::from_secs(2), handle.shutdown())
        .await
        .expect("components did not stop");
}
