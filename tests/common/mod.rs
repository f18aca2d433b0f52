//! Shared test utilities for the pipeline, chaos and integration suites.
//!
//! This module provides:
//! - MongoDB testcontainer setup (replica set for change streams)
//! - Flaky staging log and destination wrappers
//! - A staging log that records transition order
//! - Helpers to run capture in the background and wait for progress

#![allow(dead_code)]

pub mod containers;
pub mod flaky;
pub mod recording;

pub use containers::*;
pub use flaky::*;
pub use recording::*;

use changestream_migration::{
    CaptureEngine, CaptureSummary, CheckpointStore, MemoryCollection, Namespace, Result,
    StagingLog,
};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub fn ns() -> Namespace {
    Namespace::new("shop", "orders")
}

/// Poll `condition` until it holds, panicking with `what` after 5s.
pub async fn wait_for(what: &str, condition: impl Fn() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

/// Async variant of [`wait_for`] for conditions that query a store.
pub async fn wait_for_async<F, Fut>(what: &str, condition: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let waited = tokio::time::timeout(Duration::from_secs(10), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

/// Wait until `source` has at least `n` subscriptions.
pub async fn wait_for_subscriptions(source: &MemoryCollection, n: usize) {
    wait_for("change feed subscription", || source.subscription_count() >= n).await;
}

/// A capture engine running in a background task.
pub struct RunningCapture {
    stop: watch::Sender<bool>,
    handle: JoinHandle<Result<CaptureSummary>>,
}

impl RunningCapture {
    /// Signal stop and collect the result.
    pub async fn stop(self) -> Result<CaptureSummary> {
        let _ = self.stop.send(true);
        self.join().await
    }

    /// Wait for the engine to exit on its own.
    pub async fn join(self) -> Result<CaptureSummary> {
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("capture did not exit")
            .expect("capture task panicked")
    }
}

/// Spawn `engine` over the given source, checkpoint and staging log.
pub fn spawn_capture<C, L>(
    engine: CaptureEngine,
    source: MemoryCollection,
    checkpoint: C,
    log: L,
) -> RunningCapture
where
    C: CheckpointStore + 'static,
    L: StagingLog + 'static,
{
    let (stop, rx) = watch::channel(false);
    let handle = tokio::spawn(async move { engine.run(&source, &checkpoint, &log, rx).await });
    RunningCapture { stop, handle }
}

/// Run `fut` with a deadline so a hang fails the test instead of stalling it.
pub async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("operation timed out")
}
