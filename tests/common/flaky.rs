// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Failure-injecting wrappers around the in-memory stores.
//!
//! Each wrapper counts calls and fails a configurable number of upcoming
//! calls with a retryable store error, so tests can assert both that the
//! engines retried and that the outcome is unchanged.

use bson::Document;
use changestream_migration::staging::RecordId;
use changestream_migration::store::BoxFuture;
use changestream_migration::{
    DestinationStore, MemoryStagingLog, MemoryStore, MigrationError, Namespace, PendingEntry,
    StagedRecord, StagingLog, StagingStats,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Take one unit from `counter` if it is non-zero.
fn take(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

// =============================================================================
// Staging log
// =============================================================================

/// Staging log whose appends fail on demand.
#[derive(Clone, Default)]
pub struct FlakyStagingLog {
    inner: MemoryStagingLog,
    failing_appends: Arc<AtomicUsize>,
    lost_acks: Arc<AtomicUsize>,
    append_calls: Arc<AtomicUsize>,
}

impl FlakyStagingLog {
    pub fn new(inner: MemoryStagingLog) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }

    /// Fail the next `n` appends before they write anything.
    pub fn fail_next_appends(&self, n: usize) {
        self.failing_appends.fetch_add(n, Ordering::SeqCst);
    }

    /// Write the next `n` appends but report them as failed, like a lost
    /// acknowledgement.
    pub fn lose_next_acks(&self, n: usize) {
        self.lost_acks.fetch_add(n, Ordering::SeqCst);
    }

    pub fn append_calls(&self) -> usize {
        self.append_calls.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &MemoryStagingLog {
        &self.inner
    }
}

impl StagingLog for FlakyStagingLog {
    fn append(&self, record: StagedRecord) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.append_calls.fetch_add(1, Ordering::SeqCst);
            if take(&self.failing_appends) {
                return Err(MigrationError::store_msg("insert_one", "injected append failure"));
            }
            self.inner.append(record).await?;
            if take(&self.lost_acks) {
                return Err(MigrationError::store_msg("insert_one", "injected lost acknowledgement"));
            }
            Ok(())
        })
    }

    fn pending(&self, ns: &Namespace, limit: usize) -> BoxFuture<'_, Vec<PendingEntry>> {
        self.inner.pending(ns, limit)
    }

    fn mark_done(&self, id: RecordId) -> BoxFuture<'_, bool> {
        self.inner.mark_done(id)
    }

    fn mark_exception(&self, id: RecordId, reason: String) -> BoxFuture<'_, bool> {
        self.inner.mark_exception(id, reason)
    }

    fn last_sequence(&self, ns: &Namespace) -> BoxFuture<'_, Option<i64>> {
        self.inner.last_sequence(ns)
    }

    fn stats(&self, ns: &Namespace) -> BoxFuture<'_, StagingStats> {
        self.inner.stats(ns)
    }
}

// =============================================================================
// Destination
// =============================================================================

/// Destination whose writes fail on demand.
#[derive(Clone, Default)]
pub struct FlakyDestination {
    inner: MemoryStore,
    failing_writes: Arc<AtomicUsize>,
    write_calls: Arc<AtomicUsize>,
}

impl FlakyDestination {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }

    /// Fail the next `n` writes of any kind.
    pub fn fail_next_writes(&self, n: usize) {
        self.failing_writes.fetch_add(n, Ordering::SeqCst);
    }

    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    fn check(&self, operation: &str) -> changestream_migration::Result<()> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        if take(&self.failing_writes) {
            return Err(MigrationError::store_msg(operation, "injected write failure"));
        }
        Ok(())
    }
}

impl DestinationStore for FlakyDestination {
    fn insert(&self, ns: &Namespace, doc: Document) -> BoxFuture<'_, ()> {
        let ns = ns.clone();
        Box::pin(async move {
            self.check("insert_one")?;
            self.inner.insert(&ns, doc).await
        })
    }

    fn replace(
        &self,
        ns: &Namespace,
        key: Document,
        doc: Document,
        upsert: bool,
    ) -> BoxFuture<'_, ()> {
        let ns = ns.clone();
        Box::pin(async move {
            self.check("replace_one")?;
            self.inner.replace(&ns, key, doc, upsert).await
        })
    }

    fn delete(&self, ns: &Namespace, key: Document) -> BoxFuture<'_, bool> {
        let ns = ns.clone();
        Box::pin(async move {
            self.check("delete_one")?;
            self.inner.delete(&ns, key).await
        })
    }
}
