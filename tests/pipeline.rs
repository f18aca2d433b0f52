//! End-to-end migration runs against the in-memory stores.
//!
//! Each test walks the operator's sequence (check, prime, capture, bulk
//! copy, replay) and checks the destination converges to the source.
//!
//! Run with: cargo test --test pipeline

mod common;

use bson::doc;
use changestream_migration::preflight::{check_checkpoint, check_for_docs, status};
use changestream_migration::resilience::RetryConfig;
use changestream_migration::{
    CaptureEngine, CheckpointStore, FileCheckpointStore, MemoryCollection, MemoryStagingLog,
    MemoryStore, MigrationError, Namespace, OperationType, PrimingController, ReplayEngine,
    ReplayStatus, SqliteCheckpointStore, StagingLog,
};
use common::{ns, spawn_capture, wait_for, wait_for_subscriptions, within};
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::watch;

fn priming() -> PrimingController {
    PrimingController::new(ns(), RetryConfig::testing()).with_trigger_delay(Duration::ZERO)
}

fn capture() -> CaptureEngine {
    CaptureEngine::new(ns(), RetryConfig::testing())
}

fn replay() -> ReplayEngine {
    ReplayEngine::new(ns(), RetryConfig::testing())
        .with_idle_backoff(Duration::from_millis(1), Duration::from_millis(5))
}

/// Copy every source document to the destination, as the bulk copy would.
fn bulk_copy(source: &MemoryCollection, destination: &MemoryStore) {
    let target = destination.collection(&ns());
    for doc in source.documents() {
        target.insert_document(doc).unwrap();
    }
}

// =============================================================================
// Full migration
// =============================================================================

#[tokio::test]
async fn migration_converges_after_prime_capture_copy_replay() {
    let dir = tempdir().unwrap();
    let source = MemoryCollection::with_documents(ns(), vec![doc! { "_id": 1, "v": "a" }]);
    let checkpoint = FileCheckpointStore::new(dir.path(), ns());
    let log = MemoryStagingLog::new();
    let destination = MemoryStore::new();

    check_for_docs(&source).await.unwrap();

    let (_tx, rx) = watch::channel(false);
    let primed = priming()
        .prime_and_wait(&source, &source, &checkpoint, rx)
        .await
        .unwrap();
    assert_eq!(check_checkpoint(&checkpoint).await.unwrap(), primed);

    // Bulk copy snapshot taken after priming, before any application write.
    bulk_copy(&source, &destination);

    let running = spawn_capture(capture(), source.clone(), checkpoint.clone(), log.clone());
    wait_for_subscriptions(&source, 2).await;

    source.update_fields(&doc! { "_id": 1 }, doc! { "v": "b" });
    source.insert_document(doc! { "_id": 2, "v": "c" }).unwrap();
    source.delete_document(&doc! { "_id": 1 });
    wait_for("three staged records", || log.len() == 3).await;

    let summary = running.stop().await.unwrap();
    assert_eq!(summary.staged, 3);

    let drained = within(replay().drain(&log, &destination)).await.unwrap();
    assert_eq!(drained.processed(), 3);
    assert_eq!(drained.exceptions, 0);

    assert_eq!(destination.documents(&ns()), vec![doc! { "_id": 2, "v": "c" }]);
    assert_eq!(destination.documents(&ns()), source.documents());

    let records = log.records(&ns()).unwrap();
    assert!(records.iter().all(|r| r.status == Some(ReplayStatus::Done)));

    let report = status(&checkpoint, &log).await.unwrap();
    assert_eq!(report.staging.done, 3);
    assert_eq!(report.staging.pending, 0);
    assert!(report.checkpoint.is_some());
}

#[tokio::test]
async fn priming_events_are_never_staged() {
    let dir = tempdir().unwrap();
    let source = MemoryCollection::with_documents(ns(), vec![doc! { "_id": 1 }]);
    let checkpoint = FileCheckpointStore::new(dir.path(), ns());
    let log = MemoryStagingLog::new();

    let (_tx, rx) = watch::channel(false);
    priming()
        .prime_and_wait(&source, &source, &checkpoint, rx)
        .await
        .unwrap();

    let running = spawn_capture(capture(), source.clone(), checkpoint.clone(), log.clone());
    wait_for_subscriptions(&source, 2).await;
    source.insert_document(doc! { "_id": 2 }).unwrap();
    wait_for("one staged record", || log.len() == 1).await;
    running.stop().await.unwrap();

    let records = log.records(&ns()).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].event.operation, OperationType::Insert);
    assert_eq!(records[0].event.document_key, Some(doc! { "_id": 2 }));
}

#[tokio::test]
async fn split_trigger_and_wait_saves_position() {
    let dir = tempdir().unwrap();
    let source = MemoryCollection::with_documents(ns(), vec![doc! { "_id": 1 }]);
    let checkpoint = FileCheckpointStore::new(dir.path(), ns());

    let (_tx, rx) = watch::channel(false);
    let waiter = {
        let (source, checkpoint) = (source.clone(), checkpoint.clone());
        tokio::spawn(async move { priming().await_trigger(&source, &checkpoint, rx).await })
    };
    wait_for_subscriptions(&source, 1).await;

    let trigger = priming().with_trigger_delay(Duration::from_millis(20));
    trigger.trigger_only(&source).await.unwrap();

    let position = within(waiter).await.unwrap().unwrap();
    assert_eq!(checkpoint.load().await, Some(position));
    assert_eq!(source.documents(), vec![doc! { "_id": 1 }]);
}

// =============================================================================
// Resume across restarts
// =============================================================================

#[tokio::test]
async fn restarted_capture_resumes_without_loss() {
    let dir = tempdir().unwrap();
    let source = MemoryCollection::with_documents(ns(), vec![doc! { "_id": 0 }]);
    let checkpoint = FileCheckpointStore::new(dir.path(), ns());
    let log = MemoryStagingLog::new();

    let (_tx, rx) = watch::channel(false);
    priming()
        .prime_and_wait(&source, &source, &checkpoint, rx)
        .await
        .unwrap();

    let first = spawn_capture(capture(), source.clone(), checkpoint.clone(), log.clone());
    wait_for_subscriptions(&source, 2).await;
    source.insert_document(doc! { "_id": 1 }).unwrap();
    source.insert_document(doc! { "_id": 2 }).unwrap();
    wait_for("first two records", || log.len() == 2).await;
    first.stop().await.unwrap();

    // Writes while capture is down stay in the feed history.
    source.insert_document(doc! { "_id": 3 }).unwrap();
    source.delete_document(&doc! { "_id": 1 });

    let second = spawn_capture(capture(), source.clone(), checkpoint.clone(), log.clone());
    wait_for("all four records", || log.len() == 4).await;
    let summary = second.stop().await.unwrap();
    assert_eq!(summary.staged, 2);

    let records = log.records(&ns()).unwrap();
    let keys: Vec<_> = records
        .iter()
        .map(|r| (r.event.operation.clone(), r.event.document_key.clone()))
        .collect();
    assert_eq!(
        keys,
        vec![
            (OperationType::Insert, Some(doc! { "_id": 1 })),
            (OperationType::Insert, Some(doc! { "_id": 2 })),
            (OperationType::Insert, Some(doc! { "_id": 3 })),
            (OperationType::Delete, Some(doc! { "_id": 1 })),
        ]
    );
    assert!(records.windows(2).all(|w| w[0].sequence < w[1].sequence));
}

#[tokio::test]
async fn sqlite_checkpoint_backend_resumes() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("checkpoints.db");
    let source = MemoryCollection::with_documents(ns(), vec![doc! { "_id": 0 }]);
    let log = MemoryStagingLog::new();

    let checkpoint = SqliteCheckpointStore::open(&db_path, ns()).await.unwrap();
    let (_tx, rx) = watch::channel(false);
    priming()
        .prime_and_wait(&source, &source, &checkpoint, rx)
        .await
        .unwrap();
    checkpoint.close().await;

    source.insert_document(doc! { "_id": 1 }).unwrap();

    let reopened = SqliteCheckpointStore::open(&db_path, ns()).await.unwrap();
    let running = spawn_capture(capture(), source.clone(), reopened, log.clone());
    wait_for("record staged after reopen", || log.len() == 1).await;
    running.stop().await.unwrap();

    let records = log.records(&ns()).unwrap();
    assert_eq!(records[0].event.document_key, Some(doc! { "_id": 1 }));
}

// =============================================================================
// Replay behaviour
// =============================================================================

#[tokio::test]
async fn insert_overlapping_bulk_copy_is_set_aside() {
    let dir = tempdir().unwrap();
    let source = MemoryCollection::with_documents(ns(), vec![doc! { "_id": 1, "v": "a" }]);
    let checkpoint = FileCheckpointStore::new(dir.path(), ns());
    let log = MemoryStagingLog::new();
    let destination = MemoryStore::new();

    let (_tx, rx) = watch::channel(false);
    priming()
        .prime_and_wait(&source, &source, &checkpoint, rx)
        .await
        .unwrap();

    let running = spawn_capture(capture(), source.clone(), checkpoint.clone(), log.clone());
    wait_for_subscriptions(&source, 2).await;
    source.insert_document(doc! { "_id": 2, "v": "x" }).unwrap();
    source.update_fields(&doc! { "_id": 2 }, doc! { "v": "y" });
    wait_for("two records", || log.len() == 2).await;
    running.stop().await.unwrap();

    // Bulk copy ran late and already saw the insert.
    destination
        .collection(&ns())
        .insert_document(doc! { "_id": 2, "v": "x" })
        .unwrap();

    let summary = within(replay().drain(&log, &destination)).await.unwrap();
    assert_eq!(summary.exceptions, 1);
    assert_eq!(summary.applied, 1);

    let records = log.records(&ns()).unwrap();
    assert_eq!(records[0].status, Some(ReplayStatus::Exception));
    assert_eq!(records[0].exception_reason.as_deref(), Some("duplicate key"));
    assert_eq!(records[1].status, Some(ReplayStatus::Done));
    assert_eq!(
        destination.collection(&ns()).find(&doc! { "_id": 2 }),
        Some(doc! { "_id": 2, "v": "y" })
    );
}

#[tokio::test]
async fn replay_running_alongside_capture_keeps_up() {
    let dir = tempdir().unwrap();
    let source = MemoryCollection::new(ns());
    let checkpoint = FileCheckpointStore::new(dir.path(), ns());
    let log = MemoryStagingLog::new();
    let destination = MemoryStore::new();

    let running = spawn_capture(capture(), source.clone(), checkpoint.clone(), log.clone());
    wait_for_subscriptions(&source, 1).await;

    let (replay_tx, replay_rx) = watch::channel(false);
    let replayer = {
        let (log, destination) = (log.clone(), destination.clone());
        tokio::spawn(async move { replay().run(&log, &destination, replay_rx).await })
    };

    for i in 0..20 {
        source.insert_document(doc! { "_id": i, "n": i }).unwrap();
    }
    for i in (0..20).step_by(2) {
        source.delete_document(&doc! { "_id": i });
    }

    wait_for("destination to match source", || {
        destination.documents(&ns()) == source.documents()
    })
    .await;

    running.stop().await.unwrap();
    replay_tx.send(true).unwrap();
    let summary = within(replayer).await.unwrap().unwrap();
    assert_eq!(summary.processed(), 30);
    assert_eq!(summary.exceptions, 0);
}

#[tokio::test]
async fn replay_only_touches_its_namespace() {
    let other = Namespace::new("shop", "customers");
    let log = MemoryStagingLog::new();
    let destination = MemoryStore::new();

    let orders = MemoryCollection::new(ns());
    let customers = MemoryCollection::new(other.clone());
    let dir = tempdir().unwrap();

    let a = spawn_capture(
        capture(),
        orders.clone(),
        FileCheckpointStore::new(dir.path(), ns()),
        log.clone(),
    );
    let b = spawn_capture(
        CaptureEngine::new(other.clone(), RetryConfig::testing()),
        customers.clone(),
        FileCheckpointStore::new(dir.path(), other.clone()),
        log.clone(),
    );
    wait_for_subscriptions(&orders, 1).await;
    wait_for_subscriptions(&customers, 1).await;

    orders.insert_document(doc! { "_id": 1 }).unwrap();
    customers.insert_document(doc! { "_id": 1 }).unwrap();
    customers.insert_document(doc! { "_id": 2 }).unwrap();
    wait_for("three records", || log.len() == 3).await;
    a.stop().await.unwrap();
    b.stop().await.unwrap();

    let summary = within(replay().drain(&log, &destination)).await.unwrap();
    assert_eq!(summary.applied, 1);
    assert_eq!(destination.documents(&ns()), vec![doc! { "_id": 1 }]);
    assert!(destination.documents(&other).is_empty());
    assert_eq!(log.stats(&other).await.unwrap().pending, 2);
}

// =============================================================================
// Pre-flight failures
// =============================================================================

#[tokio::test]
async fn empty_source_cannot_be_primed() {
    let dir = tempdir().unwrap();
    let source = MemoryCollection::new(ns());
    let checkpoint = FileCheckpointStore::new(dir.path(), ns());

    assert!(matches!(
        check_for_docs(&source).await,
        Err(MigrationError::EmptyCollection { .. })
    ));

    let (_tx, rx) = watch::channel(false);
    let err = priming()
        .prime_and_wait(&source, &source, &checkpoint, rx)
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::EmptyCollection { .. }));

    assert!(matches!(
        check_checkpoint(&checkpoint).await,
        Err(MigrationError::MissingCheckpoint { .. })
    ));
    assert_eq!(source.change_count(), 0);
}
