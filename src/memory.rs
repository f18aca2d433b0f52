// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process stores implementing every seam.
//!
//! Used by the test suites. Behaviour follows the document store closely
//! enough to exercise the engines:
//!
//! - [`MemoryCollection`]: documents plus a change log. Every write appends a
//!   raw change document whose `_id` is `{ _data: <index> }`. Subscriptions
//!   replay the log from a resume position and then wait for new entries.
//! - [`MemoryStore`]: a set of collections addressed by namespace, used as
//!   the destination.
//! - [`MemoryStagingLog`]: staged records kept as BSON documents, queried the
//!   same way the `_cdc` collection is.
//!
//! ## Retention
//!
//! [`MemoryCollection::truncate_history`] drops every change recorded so far.
//! Resuming from a dropped position fails with `StalePosition`, like a change
//! stream whose resume point has rolled off the oplog.

use crate::error::{MigrationError, Result};
use crate::event::{ChangeEvent, Namespace, OperationType, ResumePosition};
use crate::staging::{
    is_pending_document, PendingEntry, RecordId, ReplayStatus, StagedRecord, StagingLog,
    StagingStats,
};
use crate::store::{
    BoxFuture, ChangeFeed, ChangeFeedSource, DestinationStore, Pipeline, SourceCollection,
};
use bson::{doc, Bson, Document};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, trace};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn matches_key(doc: &Document, key: &Document) -> bool {
    !key.is_empty() && key.iter().all(|(k, v)| doc.get(k) == Some(v))
}

fn position_doc(index: i64) -> Document {
    doc! { "_data": index }
}

fn position_index(position: &ResumePosition) -> Option<i64> {
    match position.as_document().get("_data") {
        Some(Bson::Int64(i)) => Some(*i),
        Some(Bson::Int32(i)) => Some(i64::from(*i)),
        _ => None,
    }
}

/// Evaluate the `$match` stages of a pipeline against a raw change document.
///
/// Supports top-level equality and `{ field: { $in: [...] } }`. Other stages
/// are accepted and ignored.
fn pipeline_matches(pipeline: &[Document], raw: &Document) -> bool {
    pipeline.iter().all(|stage| match stage.get_document("$match") {
        Ok(criteria) => criteria.iter().all(|(field, expected)| {
            let actual = raw.get(field);
            match expected {
                Bson::Document(op) if op.contains_key("$in") => op
                    .get_array("$in")
                    .map(|values| actual.map_or(false, |a| values.contains(a)))
                    .unwrap_or(false),
                other => actual == Some(other),
            }
        }),
        Err(_) => true,
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// MemoryCollection
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct CollectionState {
    documents: Vec<Document>,
    /// Raw change documents; entry `i` has position `first_index + i`.
    log: Vec<Document>,
    first_index: i64,
    /// One-shot feed failures consumed by the next polls of any subscription.
    pending_feed_failures: usize,
    pending_subscribe_failures: usize,
}

impl CollectionState {
    fn next_index(&self) -> i64 {
        self.first_index + self.log.len() as i64
    }

    fn position(&self, key: &Document) -> Option<usize> {
        self.documents.iter().position(|d| matches_key(d, key))
    }
}

struct CollectionShared {
    namespace: Namespace,
    state: Mutex<CollectionState>,
    notify: watch::Sender<i64>,
    subscriptions: AtomicUsize,
}

/// A collection with a change feed.
///
/// Cloning gives another handle to the same collection.
#[derive(Clone)]
pub struct MemoryCollection {
    shared: Arc<CollectionShared>,
}

impl std::fmt::Debug for MemoryCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCollection")
            .field("namespace", &self.shared.namespace)
            .finish()
    }
}

impl MemoryCollection {
    pub fn new(namespace: Namespace) -> Self {
        let (notify, _) = watch::channel(0);
        Self {
            shared: Arc::new(CollectionShared {
                namespace,
                state: Mutex::new(CollectionState::default()),
                notify,
                subscriptions: AtomicUsize::new(0),
            }),
        }
    }

    /// Build a collection holding `documents` without recording any changes.
    pub fn with_documents(namespace: Namespace, documents: Vec<Document>) -> Self {
        let collection = Self::new(namespace);
        lock(&collection.shared.state).documents = documents;
        collection
    }

    fn record(&self, state: &mut CollectionState, mut change: Document) {
        let index = state.next_index();
        change.insert("_id", position_doc(index));
        change.insert("ns", self.shared.namespace.to_document());
        trace!(namespace = %self.shared.namespace, index, "Change recorded");
        state.log.push(change);
        self.shared.notify.send_replace(index + 1);
    }

    /// Insert a document. Fails with `DuplicateKey` on an existing `_id`.
    pub fn insert_document(&self, doc: Document) -> Result<()> {
        let id = doc
            .get("_id")
            .cloned()
            .ok_or_else(|| MigrationError::Codec("document has no _id".to_string()))?;
        let key = doc! { "_id": id };

        let mut state = lock(&self.shared.state);
        if state.position(&key).is_some() {
            return Err(MigrationError::DuplicateKey {
                namespace: self.shared.namespace.clone(),
                key: key.to_string(),
            });
        }
        state.documents.push(doc.clone());
        self.record(
            &mut state,
            doc! { "operationType": "insert", "documentKey": key, "fullDocument": doc },
        );
        Ok(())
    }

    /// `$set` the fields of `set` on the document matching `key`.
    ///
    /// Returns `false` (and records nothing) when no document matches.
    pub fn update_fields(&self, key: &Document, set: Document) -> bool {
        let mut state = lock(&self.shared.state);
        let Some(pos) = state.position(key) else {
            return false;
        };
        for (field, value) in set.iter() {
            state.documents[pos].insert(field.clone(), value.clone());
        }
        let post_image = state.documents[pos].clone();
        self.record(
            &mut state,
            doc! {
                "operationType": "update",
                "documentKey": key.clone(),
                "fullDocument": post_image,
                "updateDescription": { "updatedFields": set, "removedFields": [] },
            },
        );
        true
    }

    /// `$unset` fields on the document matching `key`.
    pub fn unset_fields(&self, key: &Document, fields: &[&str]) -> bool {
        let mut state = lock(&self.shared.state);
        let Some(pos) = state.position(key) else {
            return false;
        };
        for field in fields {
            state.documents[pos].remove(*field);
        }
        let post_image = state.documents[pos].clone();
        let removed: Vec<Bson> = fields.iter().map(|f| Bson::String(f.to_string())).collect();
        self.record(
            &mut state,
            doc! {
                "operationType": "update",
                "documentKey": key.clone(),
                "fullDocument": post_image,
                "updateDescription": { "updatedFields": {}, "removedFields": removed },
            },
        );
        true
    }

    /// Replace the document matching `key`, optionally inserting it.
    pub fn replace_document(&self, key: &Document, doc: Document, upsert: bool) -> bool {
        let mut state = lock(&self.shared.state);
        let mut replacement = doc;
        if let Some(id) = key.get("_id") {
            replacement.insert("_id", id.clone());
        }
        match state.position(key) {
            Some(pos) => state.documents[pos] = replacement.clone(),
            None if upsert => state.documents.push(replacement.clone()),
            None => return false,
        }
        self.record(
            &mut state,
            doc! {
                "operationType": "replace",
                "documentKey": key.clone(),
                "fullDocument": replacement,
            },
        );
        true
    }

    /// Delete the document matching `key`. Returns whether one was removed.
    pub fn delete_document(&self, key: &Document) -> bool {
        let mut state = lock(&self.shared.state);
        let Some(pos) = state.position(key) else {
            return false;
        };
        state.documents.remove(pos);
        self.record(
            &mut state,
            doc! { "operationType": "delete", "documentKey": key.clone() },
        );
        true
    }

    /// Record a change of a kind the pipeline does not replay.
    pub fn record_operation(&self, operation_type: &str) {
        let mut state = lock(&self.shared.state);
        self.record(&mut state, doc! { "operationType": operation_type });
    }

    /// Snapshot of the documents, in insertion order.
    pub fn documents(&self) -> Vec<Document> {
        lock(&self.shared.state).documents.clone()
    }

    /// Document matching `key`, if any.
    pub fn find(&self, key: &Document) -> Option<Document> {
        let state = lock(&self.shared.state);
        state.position(key).map(|pos| state.documents[pos].clone())
    }

    /// Number of changes currently retained.
    pub fn change_count(&self) -> usize {
        lock(&self.shared.state).log.len()
    }

    /// Number of subscriptions opened so far.
    pub fn subscription_count(&self) -> usize {
        self.shared.subscriptions.load(Ordering::SeqCst)
    }

    /// Drop the change history. Positions recorded so far become stale.
    pub fn truncate_history(&self) {
        let mut state = lock(&self.shared.state);
        state.first_index = state.next_index();
        state.log.clear();
    }

    /// Make the next `n` feed polls fail with a retryable store error.
    pub fn break_feeds(&self, n: usize) {
        lock(&self.shared.state).pending_feed_failures += n;
        self.shared.notify.send_modify(|_| {});
    }

    /// Make the next `n` subscribe calls fail with a retryable store error.
    pub fn fail_subscriptions(&self, n: usize) {
        lock(&self.shared.state).pending_subscribe_failures += n;
    }

    fn start_index(&self, resume_from: Option<&ResumePosition>) -> Result<i64> {
        let mut state = lock(&self.shared.state);
        if state.pending_subscribe_failures > 0 {
            state.pending_subscribe_failures -= 1;
            return Err(MigrationError::store_msg("watch", "injected subscribe failure"));
        }
        let Some(position) = resume_from else {
            return Ok(state.next_index());
        };
        let index = position_index(position).ok_or_else(|| MigrationError::StalePosition {
            namespace: self.shared.namespace.clone(),
            message: format!("resume position {} was not issued by this feed", position),
        })?;
        if index + 1 < state.first_index {
            return Err(MigrationError::StalePosition {
                namespace: self.shared.namespace.clone(),
                message: format!(
                    "resume position {} is older than the retained history (starts at {})",
                    index, state.first_index
                ),
            });
        }
        Ok(index + 1)
    }

    /// Next matching change at or after `index`, or `None` if caught up.
    fn poll_from(&self, index: &mut i64, filter: &[Document]) -> Option<Result<ChangeEvent>> {
        let mut state = lock(&self.shared.state);
        if state.pending_feed_failures > 0 {
            state.pending_feed_failures -= 1;
            return Some(Err(MigrationError::store_msg(
                "change_stream_next",
                "injected feed failure",
            )));
        }
        if *index < state.first_index {
            return Some(Err(MigrationError::StalePosition {
                namespace: self.shared.namespace.clone(),
                message: "history truncated while subscribed".to_string(),
            }));
        }
        while *index < state.next_index() {
            let raw = &state.log[(*index - state.first_index) as usize];
            *index += 1;
            if pipeline_matches(filter, raw) {
                return Some(ChangeEvent::from_raw(raw, &self.shared.namespace));
            }
        }
        None
    }
}

impl ChangeFeedSource for MemoryCollection {
    fn namespace(&self) -> &Namespace {
        &self.shared.namespace
    }

    fn subscribe(
        &self,
        resume_from: Option<ResumePosition>,
        filter: Pipeline,
    ) -> BoxFuture<'_, ChangeFeed> {
        Box::pin(async move {
            let start = self.start_index(resume_from.as_ref())?;
            self.shared.subscriptions.fetch_add(1, Ordering::SeqCst);
            debug!(namespace = %self.shared.namespace, start, "Subscribed to memory change feed");

            let collection = self.clone();
            let rx = self.shared.notify.subscribe();
            let stream = futures::stream::unfold(
                (collection, start, rx, filter),
                |(collection, mut index, mut rx, filter)| async move {
                    loop {
                        rx.borrow_and_update();
                        if let Some(item) = collection.poll_from(&mut index, &filter) {
                            return Some((item, (collection, index, rx, filter)));
                        }
                        if rx.changed().await.is_err() {
                            return None;
                        }
                    }
                },
            );
            Ok(Box::pin(stream) as ChangeFeed)
        })
    }
}

impl SourceCollection for MemoryCollection {
    fn namespace(&self) -> &Namespace {
        &self.shared.namespace
    }

    fn sample_key(&self) -> BoxFuture<'_, Option<Document>> {
        Box::pin(async move {
            let state = lock(&self.shared.state);
            Ok(state
                .documents
                .first()
                .and_then(|d| d.get("_id"))
                .map(|id| doc! { "_id": id.clone() }))
        })
    }

    fn set_field(&self, key: Document, field: &str, value: Bson) -> BoxFuture<'_, ()> {
        let mut set = Document::new();
        set.insert(field, value);
        Box::pin(async move {
            self.update_fields(&key, set);
            Ok(())
        })
    }

    fn unset_field(&self, key: Document, field: &str) -> BoxFuture<'_, ()> {
        let field = field.to_string();
        Box::pin(async move {
            self.unset_fields(&key, &[field.as_str()]);
            Ok(())
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MemoryStore
// ═══════════════════════════════════════════════════════════════════════════════

/// A store of collections addressed by namespace.
#[derive(Clone, Default)]
pub struct MemoryStore {
    collections: Arc<Mutex<HashMap<Namespace, MemoryCollection>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle to the collection at `ns`, created empty on first use.
    pub fn collection(&self, ns: &Namespace) -> MemoryCollection {
        lock(&self.collections)
            .entry(ns.clone())
            .or_insert_with(|| MemoryCollection::new(ns.clone()))
            .clone()
    }

    /// Snapshot of the documents in `ns`.
    pub fn documents(&self, ns: &Namespace) -> Vec<Document> {
        self.collection(ns).documents()
    }
}

impl DestinationStore for MemoryStore {
    fn insert(&self, ns: &Namespace, doc: Document) -> BoxFuture<'_, ()> {
        let collection = self.collection(ns);
        Box::pin(async move { collection.insert_document(doc) })
    }

    fn replace(
        &self,
        ns: &Namespace,
        key: Document,
        doc: Document,
        upsert: bool,
    ) -> BoxFuture<'_, ()> {
        let collection = self.collection(ns);
        Box::pin(async move {
            collection.replace_document(&key, doc, upsert);
            Ok(())
        })
    }

    fn delete(&self, ns: &Namespace, key: Document) -> BoxFuture<'_, bool> {
        let collection = self.collection(ns);
        Box::pin(async move { Ok(collection.delete_document(&key)) })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MemoryStagingLog
// ═══════════════════════════════════════════════════════════════════════════════

/// Staging log holding records as BSON documents.
#[derive(Clone, Default)]
pub struct MemoryStagingLog {
    records: Arc<Mutex<Vec<Document>>>,
}

impl MemoryStagingLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record of `ns`, ascending by sequence, whatever its status.
    pub fn records(&self, ns: &Namespace) -> Result<Vec<StagedRecord>> {
        let docs = lock(&self.records).clone();
        let mut records = docs
            .iter()
            .map(StagedRecord::from_document)
            .filter(|r| r.as_ref().map_or(true, |r| r.namespace() == ns))
            .collect::<Result<Vec<_>>>()?;
        records.sort_by_key(|r| r.sequence);
        Ok(records)
    }

    /// Insert a raw document, bypassing the record codec.
    pub fn insert_raw(&self, doc: Document) {
        lock(&self.records).push(doc);
    }

    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn in_namespace(doc: &Document, ns: &Namespace) -> bool {
        doc.get_document("ns")
            .map(|d| {
                d.get_str("db").ok() == Some(ns.db.as_str())
                    && d.get_str("coll").ok() == Some(ns.coll.as_str())
            })
            .unwrap_or(false)
    }

    fn transition(&self, id: RecordId, status: ReplayStatus, reason: Option<String>) -> bool {
        let mut records = lock(&self.records);
        let Some(doc) = records
            .iter_mut()
            .find(|d| d.get_object_id("_id").ok() == Some(id) && !d.contains_key("status"))
        else {
            return false;
        };
        doc.insert("status", status.as_str());
        if let Some(reason) = reason {
            doc.insert("exceptionReason", reason);
        }
        true
    }
}

impl StagingLog for MemoryStagingLog {
    fn append(&self, record: StagedRecord) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut records = lock(&self.records);
            if records.iter().any(|d| d.get_object_id("_id").ok() == Some(record.id)) {
                debug!(record_id = %record.id, "Record already staged");
                return Ok(());
            }
            records.push(record.to_document());
            Ok(())
        })
    }

    fn pending(&self, ns: &Namespace, limit: usize) -> BoxFuture<'_, Vec<PendingEntry>> {
        let ns = ns.clone();
        Box::pin(async move {
            let mut pending: Vec<(i64, Document)> = lock(&self.records)
                .iter()
                .filter(|d| is_pending_document(d, &ns))
                .map(|d| (d.get_i64("sequence").unwrap_or(i64::MAX), d.clone()))
                .collect();
            pending.sort_by_key(|(seq, _)| *seq);
            Ok(pending
                .into_iter()
                .take(limit)
                .filter_map(|(_, d)| PendingEntry::decode(&d))
                .collect())
        })
    }

    fn mark_done(&self, id: RecordId) -> BoxFuture<'_, bool> {
        Box::pin(async move { Ok(self.transition(id, ReplayStatus::Done, None)) })
    }

    fn mark_exception(&self, id: RecordId, reason: String) -> BoxFuture<'_, bool> {
        Box::pin(async move { Ok(self.transition(id, ReplayStatus::Exception, Some(reason))) })
    }

    fn last_sequence(&self, ns: &Namespace) -> BoxFuture<'_, Option<i64>> {
        let ns = ns.clone();
        Box::pin(async move {
            Ok(lock(&self.records)
                .iter()
                .filter(|d| Self::in_namespace(d, &ns))
                .filter_map(|d| d.get_i64("sequence").ok())
                .max())
        })
    }

    fn stats(&self, ns: &Namespace) -> BoxFuture<'_, StagingStats> {
        let ns = ns.clone();
        Box::pin(async move {
            let mut stats = StagingStats::default();
            for doc in lock(&self.records).iter().filter(|d| Self::in_namespace(d, &ns)) {
                match doc.get_str("status").ok().and_then(ReplayStatus::parse) {
                    None if is_pending_document(doc, &ns) => stats.pending += 1,
                    None => {}
                    Some(ReplayStatus::Done) => stats.done += 1,
                    Some(ReplayStatus::Exception) => stats.exception += 1,
                }
            }
            Ok(stats)
        })
    }
}

/// A raw change event for `ns`, for building fixtures.
pub fn change_event(
    ns: &Namespace,
    operation: OperationType,
    key: Document,
    full_document: Option<Document>,
    position: i64,
) -> ChangeEvent {
    ChangeEvent {
        operation,
        namespace: ns.clone(),
        document_key: Some(key),
        full_document,
        update_description: None,
        source_position: ResumePosition::from_document(position_doc(position)),
    }
}
