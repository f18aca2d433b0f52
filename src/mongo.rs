// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! MongoDB adapters for every seam.
//!
//! # Connection Preconditions
//!
//! [`connect`] pings the deployment and [`check_majority_reads`] issues a
//! `majority` read against the collection. Either failing is a
//! `Configuration` error, reported before any capture or replay begins:
//! change streams need a replica set (or sharded cluster) with majority
//! read concern available. [`connect_checked`] does both, for the source
//! collection as well as for the staging and target collections on the
//! destination.
//!
//! # Change Streams
//!
//! [`MongoSource`] watches one collection with `fullDocument: updateLookup`
//! and resumes with `resumeAfter`. The raw change documents are read as
//! plain documents and parsed with [`ChangeEvent::from_raw`], so the
//! operation types the driver does not model still reach the capture engine.
//!
//! Server errors 286 (`ChangeStreamHistoryLost`) and 280
//! (`ChangeStreamFatalError`) become `StalePosition`, on `watch()` as well
//! as on the first `next()`.
//!
//! # Staging Collection
//!
//! ```text
//! _cdc: { _id: ObjectId, sequence: i64, operationType, ns: { db, coll },
//!         sourcePosition, capturedAt, documentKey?, fullDocument?,
//!         status?, exceptionReason? }
//! index: { ns.db: 1, ns.coll: 1, status: 1, sequence: 1 }
//! ```

use crate::error::{
    MigrationError, Result, CHANGE_STREAM_FATAL_CODE, CHANGE_STREAM_HISTORY_LOST_CODE,
    DUPLICATE_KEY_CODE,
};
use crate::event::{ChangeEvent, Namespace, ResumePosition};
use crate::staging::{
    pending_filter, transition_filter, PendingEntry, RecordId, ReplayStatus, StagedRecord,
    StagingLog, StagingStats,
};
use crate::store::{
    BoxFuture, ChangeFeed, ChangeFeedSource, DestinationStore, Pipeline, SourceCollection,
};
use bson::{doc, Bson, Document};
use futures::{StreamExt, TryStreamExt};
use mongodb::change_stream::event::ResumeToken;
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{
    ChangeStreamOptions, ClientOptions, CollectionOptions, FindOneOptions, FindOptions,
    FullDocumentType, ReadConcern, ReplaceOptions,
};
use mongodb::{Client, Collection, IndexModel};
use std::time::Duration;
use tracing::{debug, info};

const APP_NAME: &str = "changestream-migration";

// ═══════════════════════════════════════════════════════════════════════════════
// Connection
// ═══════════════════════════════════════════════════════════════════════════════

/// Connect and ping. Unreachable deployments are configuration errors.
pub async fn connect(uri: &str, timeout: Duration) -> Result<Client> {
    let mut options = ClientOptions::parse(uri)
        .await
        .map_err(|e| MigrationError::Configuration(format!("invalid connection string: {}", e)))?;
    options.app_name = Some(APP_NAME.to_string());
    options.server_selection_timeout = Some(timeout);
    options.connect_timeout = Some(timeout);
    let hosts: Vec<String> = options.hosts.iter().map(|h| h.to_string()).collect();

    let client = Client::with_options(options)
        .map_err(|e| MigrationError::Configuration(format!("client setup failed: {}", e)))?;

    client
        .database("admin")
        .run_command(doc! { "ping": 1 }, None)
        .await
        .map_err(|e| {
            MigrationError::Configuration(format!(
                "could not reach {}: {}; make sure the deployment is correctly configured",
                hosts.join(","),
                e
            ))
        })?;

    info!(hosts = %hosts.join(","), "Connected");
    Ok(client)
}

/// Connect, then require majority reads on every namespace in `namespaces`.
pub async fn connect_checked(
    uri: &str,
    timeout: Duration,
    namespaces: &[Namespace],
) -> Result<Client> {
    let client = connect(uri, timeout).await?;
    for ns in namespaces {
        check_majority_reads(&client, ns).await?;
    }
    Ok(client)
}

/// Issue a majority read against `ns`.
pub async fn check_majority_reads(client: &Client, ns: &Namespace) -> Result<()> {
    let options = CollectionOptions::builder()
        .read_concern(ReadConcern::majority())
        .build();
    client
        .database(&ns.db)
        .collection_with_options::<Document>(&ns.coll, options)
        .find_one(doc! { "_id": { "$exists": true } }, None)
        .await
        .map_err(|e| {
            MigrationError::Configuration(format!(
                "majority read on {} failed ({}); majority read concern is required for change streams",
                ns, e
            ))
        })?;
    debug!(namespace = %ns, "Majority reads available");
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error classification
// ═══════════════════════════════════════════════════════════════════════════════

fn server_code(e: &mongodb::error::Error) -> Option<i32> {
    match e.kind.as_ref() {
        ErrorKind::Command(ce) => Some(ce.code),
        ErrorKind::Write(WriteFailure::WriteError(we)) => Some(we.code),
        ErrorKind::Write(WriteFailure::WriteConcernError(wce)) => Some(wce.code),
        _ => None,
    }
}

/// True for a duplicate key server error.
pub fn is_duplicate_key(e: &mongodb::error::Error) -> bool {
    server_code(e) == Some(DUPLICATE_KEY_CODE)
}

/// True when a change stream can no longer resume from the requested point.
pub fn is_stale_position(e: &mongodb::error::Error) -> bool {
    matches!(
        server_code(e),
        Some(CHANGE_STREAM_HISTORY_LOST_CODE) | Some(CHANGE_STREAM_FATAL_CODE)
    )
}

fn feed_error(ns: &Namespace, operation: &str, e: mongodb::error::Error) -> MigrationError {
    if is_stale_position(&e) {
        MigrationError::StalePosition {
            namespace: ns.clone(),
            message: e.to_string(),
        }
    } else {
        MigrationError::store(operation, e)
    }
}

fn resume_token(position: ResumePosition) -> Result<ResumeToken> {
    Ok(bson::from_bson(Bson::Document(position.into_document()))?)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Source
// ═══════════════════════════════════════════════════════════════════════════════

/// The source collection: change feed plus the priming mutations.
#[derive(Clone)]
pub struct MongoSource {
    collection: Collection<Document>,
    namespace: Namespace,
    full_document_lookup: bool,
}

impl MongoSource {
    pub fn new(client: &Client, namespace: Namespace) -> Self {
        Self {
            collection: client.database(&namespace.db).collection(&namespace.coll),
            namespace,
            full_document_lookup: true,
        }
    }

    /// Request post-images for updates (`fullDocument: updateLookup`).
    pub fn with_full_document_lookup(mut self, lookup: bool) -> Self {
        self.full_document_lookup = lookup;
        self
    }
}

impl ChangeFeedSource for MongoSource {
    fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    fn subscribe(
        &self,
        resume_from: Option<ResumePosition>,
        filter: Pipeline,
    ) -> BoxFuture<'_, ChangeFeed> {
        Box::pin(async move {
            let resume_after = resume_from.map(resume_token).transpose()?;
            let full_document = self
                .full_document_lookup
                .then_some(FullDocumentType::UpdateLookup);
            let options = ChangeStreamOptions::builder()
                .full_document(full_document)
                .resume_after(resume_after)
                .build();

            let stream = self
                .collection
                .watch(filter, options)
                .await
                .map_err(|e| feed_error(&self.namespace, "watch", e))?;
            debug!(namespace = %self.namespace, "Change stream opened");

            let ns = self.namespace.clone();
            let feed = stream.with_type::<Document>().map(move |item| match item {
                Ok(raw) => ChangeEvent::from_raw(&raw, &ns),
                Err(e) => Err(feed_error(&ns, "change_stream_next", e)),
            });
            Ok(Box::pin(feed) as ChangeFeed)
        })
    }
}

impl SourceCollection for MongoSource {
    fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    fn sample_key(&self) -> BoxFuture<'_, Option<Document>> {
        Box::pin(async move {
            let doc = self
                .collection
                .find_one(None, None)
                .await
                .map_err(|e| MigrationError::store("find_one", e))?;
            Ok(doc.and_then(|d| d.get("_id").cloned()).map(|id| doc! { "_id": id }))
        })
    }

    fn set_field(&self, key: Document, field: &str, value: Bson) -> BoxFuture<'_, ()> {
        let mut set = Document::new();
        set.insert(field, value);
        Box::pin(async move {
            self.collection
                .update_one(key, doc! { "$set": set }, None)
                .await
                .map_err(|e| MigrationError::store("update_one", e))?;
            Ok(())
        })
    }

    fn unset_field(&self, key: Document, field: &str) -> BoxFuture<'_, ()> {
        let mut unset = Document::new();
        unset.insert(field, "");
        Box::pin(async move {
            self.collection
                .update_one(key, doc! { "$unset": unset }, None)
                .await
                .map_err(|e| MigrationError::store("update_one", e))?;
            Ok(())
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Destination
// ═══════════════════════════════════════════════════════════════════════════════

/// Destination deployment; collections are addressed per call.
#[derive(Clone)]
pub struct MongoDestination {
    client: Client,
}

impl MongoDestination {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn collection(&self, ns: &Namespace) -> Collection<Document> {
        self.client.database(&ns.db).collection(&ns.coll)
    }
}

impl DestinationStore for MongoDestination {
    fn insert(&self, ns: &Namespace, doc: Document) -> BoxFuture<'_, ()> {
        let ns = ns.clone();
        Box::pin(async move {
            let key = doc.get("_id").map(|id| id.to_string()).unwrap_or_default();
            match self.collection(&ns).insert_one(doc, None).await {
                Ok(_) => Ok(()),
                Err(e) if is_duplicate_key(&e) => Err(MigrationError::DuplicateKey { namespace: ns, key }),
                Err(e) => Err(MigrationError::store("insert_one", e)),
            }
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
            let options = ReplaceOptions::builder().upsert(upsert).build();
            self.collection(&ns)
                .replace_one(key, doc, options)
                .await
                .map_err(|e| MigrationError::store("replace_one", e))?;
            Ok(())
        })
    }

    fn delete(&self, ns: &Namespace, key: Document) -> BoxFuture<'_, bool> {
        let ns = ns.clone();
        Box::pin(async move {
            let result = self
                .collection(&ns)
                .delete_one(key, None)
                .await
                .map_err(|e| MigrationError::store("delete_one", e))?;
            Ok(result.deleted_count > 0)
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Staging log
// ═══════════════════════════════════════════════════════════════════════════════

/// The shared `_cdc` collection on the destination.
#[derive(Clone)]
pub struct MongoStagingLog {
    collection: Collection<Document>,
}

impl MongoStagingLog {
    pub fn new(client: &Client, database: &str, collection: &str) -> Self {
        Self {
            collection: client.database(database).collection(collection),
        }
    }

    /// Create the pending-query index. Idempotent.
    pub async fn ensure_indexes(&self) -> Result<()> {
        let index = IndexModel::builder()
            .keys(doc! { "ns.db": 1, "ns.coll": 1, "status": 1, "sequence": 1 })
            .build();
        self.collection
            .create_index(index, None)
            .await
            .map_err(|e| MigrationError::store("create_index", e))?;
        Ok(())
    }

    async fn count(&self, filter: Document) -> Result<u64> {
        self.collection
            .count_documents(filter, None)
            .await
            .map_err(|e| MigrationError::store("count_documents", e))
    }

    async fn transition(&self, id: RecordId, set: Document) -> Result<bool> {
        let result = self
            .collection
            .update_one(transition_filter(id), doc! { "$set": set }, None)
            .await
            .map_err(|e| MigrationError::store("update_one", e))?;
        Ok(result.modified_count == 1)
    }
}

fn namespace_filter(ns: &Namespace) -> Document {
    doc! { "ns.db": &ns.db, "ns.coll": &ns.coll }
}

impl StagingLog for MongoStagingLog {
    fn append(&self, record: StagedRecord) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            match self.collection.insert_one(record.to_document(), None).await {
                Ok(_) => Ok(()),
                // Earlier attempt landed before its acknowledgement was lost.
                Err(e) if is_duplicate_key(&e) => {
                    debug!(record_id = %record.id, "Record already staged");
                    Ok(())
                }
                Err(e) => Err(MigrationError::store("insert_one", e)),
            }
        })
    }

    fn pending(&self, ns: &Namespace, limit: usize) -> BoxFuture<'_, Vec<PendingEntry>> {
        let filter = pending_filter(ns);
        Box::pin(async move {
            let options = FindOptions::builder()
                .sort(doc! { "sequence": 1 })
                .limit(i64::try_from(limit).unwrap_or(i64::MAX))
                .build();
            let docs: Vec<Document> = self
                .collection
                .find(filter, options)
                .await
                .map_err(|e| MigrationError::store("find", e))?
                .try_collect()
                .await
                .map_err(|e| MigrationError::store("find", e))?;
            Ok(docs.iter().filter_map(PendingEntry::decode).collect())
        })
    }

    fn mark_done(&self, id: RecordId) -> BoxFuture<'_, bool> {
        Box::pin(self.transition(id, doc! { "status": ReplayStatus::Done.as_str() }))
    }

    fn mark_exception(&self, id: RecordId, reason: String) -> BoxFuture<'_, bool> {
        Box::pin(self.transition(
            id,
            doc! { "status": ReplayStatus::Exception.as_str(), "exceptionReason": reason },
        ))
    }

    fn last_sequence(&self, ns: &Namespace) -> BoxFuture<'_, Option<i64>> {
        let filter = namespace_filter(ns);
        Box::pin(async move {
            let options = FindOneOptions::builder()
                .sort(doc! { "sequence": -1 })
                .projection(doc! { "sequence": 1 })
                .build();
            let doc = self
                .collection
                .find_one(filter, options)
                .await
                .map_err(|e| MigrationError::store("find_one", e))?;
            Ok(doc.and_then(|d| d.get_i64("sequence").ok()))
        })
    }

    fn stats(&self, ns: &Namespace) -> BoxFuture<'_, StagingStats> {
        let ns = ns.clone();
        Box::pin(async move {
            let with_status = |status: ReplayStatus| {
                let mut filter = namespace_filter(&ns);
                filter.insert("status", status.as_str());
                filter
            };
            Ok(StagingStats {
                pending: self.count(pending_filter(&ns)).await?,
                done: self.count(with_status(ReplayStatus::Done)).await?,
                exception: self.count(with_status(ReplayStatus::Exception)).await?,
            })
        })
    }
}
