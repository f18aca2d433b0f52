// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Staging log wrapper that remembers the order of status transitions.

use changestream_migration::staging::RecordId;
use changestream_migration::store::BoxFuture;
use changestream_migration::{
    MemoryStagingLog, Namespace, PendingEntry, StagedRecord, StagingLog, StagingStats,
};
use std::sync::{Arc, Mutex};

/// Records the id of every transition that took effect, in call order.
#[derive(Clone, Default)]
pub struct RecordingStagingLog {
    inner: MemoryStagingLog,
    transitions: Arc<Mutex<Vec<RecordId>>>,
}

impl RecordingStagingLog {
    pub fn new(inner: MemoryStagingLog) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }

    pub fn transitions(&self) -> Vec<RecordId> {
        self.transitions.lock().unwrap().clone()
    }

    fn remember(&self, id: RecordId, took_effect: bool) {
        if took_effect {
            self.transitions.lock().unwrap().push(id);
        }
    }
}

impl StagingLog for RecordingStagingLog {
    fn append(&self, record: StagedRecord) -> BoxFuture<'_, ()> {
        self.inner.append(record)
    }

    fn pending(&self, ns: &Namespace, limit: usize) -> BoxFuture<'_, Vec<PendingEntry>> {
        self.inner.pending(ns, limit)
    }

    fn mark_done(&self, id: RecordId) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            let done = self.inner.mark_done(id).await?;
            self.remember(id, done);
            Ok(done)
        })
    }

    fn mark_exception(&self, id: RecordId, reason: String) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            let marked = self.inner.mark_exception(id, reason).await?;
            self.remember(id, marked);
            Ok(marked)
        })
    }

    fn last_sequence(&self, ns: &Namespace) -> BoxFuture<'_, Option<i64>> {
        self.inner.last_sequence(ns)
    }

    fn stats(&self, ns: &Namespace) -> BoxFuture<'_, StagingStats> {
        self.inner.stats(ns)
    }
}
