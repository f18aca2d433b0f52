// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The staging log: captured events waiting to be replayed.
//!
//! A single well-known collection on the destination (`_cdc` by default)
//! shared by every namespace being migrated. The capture engine appends,
//! the replay engine reads and sets a status, nothing deletes.
//!
//! # Record Schema
//!
//! ```text
//! {
//!   _id: ObjectId,                       ← record identity
//!   sequence: i64,                       ← capture order within a namespace
//!   operationType: "insert" | "replace" | "update" | "delete",
//!   ns: { db, coll },
//!   documentKey: { _id: .. },
//!   fullDocument: { .. },                ← absent for delete
//!   sourcePosition: { _data: .. },       ← alternative recovery path
//!   capturedAt: Date,
//!   status: "done" | "exception",        ← absent while pending
//!   exceptionReason: String              ← only with status "exception"
//! }
//! ```
//!
//! # Status Transitions
//!
//! ```text
//! (unset) ──apply ok──────► done
//!    │
//!    └────apply conflict──► exception (+ exceptionReason)
//! ```
//!
//! Transitions are single-record conditional writes on `{ _id, status unset }`.
//! Two replay instances racing on the same record both apply (idempotent) but
//! only one transition wins.

use crate::error::{MigrationError, Result};
use crate::event::{ChangeEvent, Namespace, OperationType, ResumePosition};
use crate::store::BoxFuture;
use bson::oid::ObjectId;
use bson::{doc, Bson, Document};
use std::fmt;

/// Identity of a staged record.
pub type RecordId = ObjectId;

/// Default name of the staging collection.
pub const DEFAULT_STAGING_COLLECTION: &str = "_cdc";

/// Terminal replay status of a staged record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplayStatus {
    Done,
    Exception,
}

impl ReplayStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Exception => "exception",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "done" => Some(Self::Done),
            "exception" => Some(Self::Exception),
            _ => None,
        }
    }
}

impl fmt::Display for ReplayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A captured event plus its staging metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedRecord {
    pub id: RecordId,
    pub sequence: i64,
    pub event: ChangeEvent,
    pub captured_at: bson::DateTime,
    /// `None` while pending.
    pub status: Option<ReplayStatus>,
    pub exception_reason: Option<String>,
}

impl StagedRecord {
    /// New pending record with a fresh identity.
    pub fn new(event: ChangeEvent, sequence: i64) -> Self {
        Self {
            id: ObjectId::new(),
            sequence,
            event,
            captured_at: bson::DateTime::now(),
            status: None,
            exception_reason: None,
        }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.event.namespace
    }

    pub fn is_pending(&self) -> bool {
        self.status.is_none()
    }

    pub fn to_document(&self) -> Document {
        let mut doc = doc! {
            "_id": self.id,
            "sequence": self.sequence,
            "operationType": self.event.operation.as_str(),
            "ns": self.event.namespace.to_document(),
            "sourcePosition": self.event.source_position.as_document().clone(),
            "capturedAt": self.captured_at,
        };
        if let Some(key) = &self.event.document_key {
            doc.insert("documentKey", key.clone());
        }
        if let Some(full) = &self.event.full_document {
            doc.insert("fullDocument", full.clone());
        }
        if let Some(status) = self.status {
            doc.insert("status", status.as_str());
        }
        if let Some(reason) = &self.exception_reason {
            doc.insert("exceptionReason", reason.as_str());
        }
        doc
    }

    pub fn from_document(doc: &Document) -> Result<Self> {
        let id = doc
            .get_object_id("_id")
            .map_err(|e| codec("_id", e))?;
        let sequence = match doc.get("sequence") {
            Some(Bson::Int64(v)) => *v,
            Some(Bson::Int32(v)) => i64::from(*v),
            Some(Bson::Double(v)) if v.fract() == 0.0 => *v as i64,
            other => {
                return Err(MigrationError::Codec(format!(
                    "staged record sequence: unexpected {:?}",
                    other
                )))
            }
        };
        let operation = doc
            .get_str("operationType")
            .map(OperationType::parse)
            .map_err(|e| codec("operationType", e))?;
        let namespace = Namespace::from_document(doc.get_document("ns").map_err(|e| codec("ns", e))?)?;
        let source_position = doc
            .get_document("sourcePosition")
            .map(|p| ResumePosition::from_document(p.clone()))
            .map_err(|e| codec("sourcePosition", e))?;
        let captured_at = doc
            .get_datetime("capturedAt")
            .copied()
            .unwrap_or_else(|_| bson::DateTime::from_millis(0));
        let status = match doc.get("status") {
            None | Some(Bson::Null) => None,
            Some(Bson::String(raw)) => Some(ReplayStatus::parse(raw).ok_or_else(|| {
                MigrationError::Codec(format!("staged record status: unknown {:?}", raw))
            })?),
            Some(other) => {
                return Err(MigrationError::Codec(format!(
                    "staged record status: unexpected {:?}",
                    other
                )))
            }
        };

        Ok(Self {
            id,
            sequence,
            event: ChangeEvent {
                operation,
                namespace,
                document_key: doc.get_document("documentKey").ok().cloned(),
                full_document: doc.get_document("fullDocument").ok().cloned(),
                update_description: None,
                source_position,
            },
            captured_at,
            status,
            exception_reason: doc.get_str("exceptionReason").ok().map(str::to_string),
        })
    }
}

fn codec(field: &str, e: impl fmt::Display) -> MigrationError {
    MigrationError::Codec(format!("staged record {}: {}", field, e))
}

/// A pending document as selected by the pending query.
///
/// Decoded one at a time so that a single malformed record is set aside by
/// its id instead of failing the whole batch.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingEntry {
    Record(StagedRecord),
    Undecodable { id: RecordId, reason: String },
}

impl PendingEntry {
    /// Decode a selected document.
    ///
    /// `None` when `_id` is not a record id: such a document cannot be
    /// transitioned, and [`pending_filter`] never selects one.
    pub fn decode(doc: &Document) -> Option<Self> {
        match StagedRecord::from_document(doc) {
            Ok(record) => Some(Self::Record(record)),
            Err(e) => doc
                .get_object_id("_id")
                .ok()
                .map(|id| Self::Undecodable {
                    id,
                    reason: e.to_string(),
                }),
        }
    }

    pub fn id(&self) -> RecordId {
        match self {
            Self::Record(record) => record.id,
            Self::Undecodable { id, .. } => *id,
        }
    }

    pub fn into_record(self) -> Option<StagedRecord> {
        match self {
            Self::Record(record) => Some(record),
            Self::Undecodable { .. } => None,
        }
    }
}

/// Filter selecting pending records of one namespace.
///
/// Only documents this tool wrote qualify: an `ObjectId` identity and a
/// `sequence`. Anything else sharing the collection (older tooling keyed by
/// resume token) is left alone.
pub fn pending_filter(ns: &Namespace) -> Document {
    doc! {
        "ns.db": &ns.db,
        "ns.coll": &ns.coll,
        "status": { "$exists": false },
        "sequence": { "$exists": true },
        "_id": { "$type": "objectId" },
    }
}

/// In-process evaluation of [`pending_filter`].
pub fn is_pending_document(doc: &Document, ns: &Namespace) -> bool {
    let in_namespace = doc
        .get_document("ns")
        .map(|d| {
            d.get_str("db").ok() == Some(ns.db.as_str())
                && d.get_str("coll").ok() == Some(ns.coll.as_str())
        })
        .unwrap_or(false);
    in_namespace
        && !doc.contains_key("status")
        && doc.contains_key("sequence")
        && doc.get_object_id("_id").is_ok()
}

/// Filter for a conditional status transition.
pub fn transition_filter(id: RecordId) -> Document {
    doc! { "_id": id, "status": { "$exists": false } }
}

/// Per-namespace record counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StagingStats {
    pub pending: u64,
    pub done: u64,
    pub exception: u64,
}

impl StagingStats {
    pub fn total(&self) -> u64 {
        self.pending + self.done + self.exception
    }
}

/// Append-only, queryable log of captured events.
///
/// Must tolerate concurrent appends from capture engines and concurrent
/// namespace-scoped reads/transitions from replay engines without a global
/// lock.
pub trait StagingLog: Send + Sync {
    /// Durably append a pending record.
    ///
    /// Appending a record whose `id` is already present succeeds without
    /// writing, so a retried append after an ambiguous failure is safe.
    fn append(&self, record: StagedRecord) -> BoxFuture<'_, ()>;

    /// Up to `limit` pending records of `ns`, ascending by sequence.
    fn pending(&self, ns: &Namespace, limit: usize) -> BoxFuture<'_, Vec<PendingEntry>>;

    /// Transition a pending record to done. Returns `false` if it was
    /// no longer pending.
    fn mark_done(&self, id: RecordId) -> BoxFuture<'_, bool>;

    /// Transition a pending record to exception with a reason.
    fn mark_exception(&self, id: RecordId, reason: String) -> BoxFuture<'_, bool>;

    /// Highest sequence staged for `ns`, if any.
    fn last_sequence(&self, ns: &Namespace) -> BoxFuture<'_, Option<i64>>;

    /// Record counts by status for `ns`.
    fn stats(&self, ns: &Namespace) -> BoxFuture<'_, StagingStats>;
}

impl<T: StagingLog + ?Sized> StagingLog for std::sync::Arc<T> {
    fn append(&self, record: StagedRecord) -> BoxFuture<'_, ()> {
        (**self).append(record)
    }

    fn pending(&self, ns: &Namespace, limit: usize) -> BoxFuture<'_, Vec<PendingEntry>> {
        (**self).pending(ns, limit)
    }

    fn mark_done(&self, id: RecordId) -> BoxFuture<'_, bool> {
        (**self).mark_done(id)
    }

    fn mark_exception(&self, id: RecordId, reason: String) -> BoxFuture<'_, bool> {
        (**self).mark_exception(id, reason)
    }

    fn last_sequence(&self, ns: &Namespace) -> BoxFuture<'_, Option<i64>> {
        (**self).last_sequence(ns)
    }

    fn stats(&self, ns: &Namespace) -> BoxFuture<'_, StagingStats> {
        (**self).stats(ns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(op: OperationType) -> ChangeEvent {
        ChangeEvent {
            operation: op,
            namespace: Namespace::new("shop", "orders"),
            document_key: Some(doc! { "_id": 1 }),
            full_document: Some(doc! { "_id": 1, "v": "a" }),
            update_description: None,
            source_position: ResumePosition::from_document(doc! { "_data": "01" }),
        }
    }

    #[test]
    fn test_new_record_is_pending() {
        let record = StagedRecord::new(event(OperationType::Insert), 10);
        assert!(record.is_pending());
        assert_eq!(record.sequence, 10);
        assert_eq!(record.namespace(), &Namespace::new("shop", "orders"));
    }

    #[test]
    fn test_document_layout() {
        let record = StagedRecord::new(event(OperationType::Update), 7);
        let doc = record.to_document();

        assert_eq!(doc.get_i64("sequence").unwrap(), 7);
        assert_eq!(doc.get_str("operationType").unwrap(), "update");
        assert_eq!(
            doc.get_document("ns").unwrap(),
            &doc! { "db": "shop", "coll": "orders" }
        );
        assert!(doc.get("status").is_none(), "pending records carry no status");
        assert!(doc.get("exceptionReason").is_none());
    }

    #[test]
    fn test_document_roundtrip_with_exception() {
        let mut record = StagedRecord::new(event(OperationType::Insert), 3);
        record.status = Some(ReplayStatus::Exception);
        record.exception_reason = Some("duplicate key".to_string());

        let decoded = StagedRecord::from_document(&record.to_document()).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_delete_has_no_full_document() {
        let mut ev = event(OperationType::Delete);
        ev.full_document = None;
        let doc = StagedRecord::new(ev, 1).to_document();
        assert!(doc.get("fullDocument").is_none());
        assert!(doc.get("documentKey").is_some());
    }

    #[test]
    fn test_from_document_accepts_legacy_numeric_sequence() {
        let mut doc = StagedRecord::new(event(OperationType::Insert), 0).to_document();
        doc.insert("sequence", 1_700_000_000.0_f64);
        let decoded = StagedRecord::from_document(&doc).unwrap();
        assert_eq!(decoded.sequence, 1_700_000_000);
    }

    #[test]
    fn test_from_document_rejects_unknown_status() {
        let mut doc = StagedRecord::new(event(OperationType::Insert), 0).to_document();
        doc.insert("status", "Done-ish");
        assert!(StagedRecord::from_document(&doc).is_err());
    }

    #[test]
    fn test_from_document_keeps_unrecognized_operation() {
        let mut doc = StagedRecord::new(event(OperationType::Insert), 0).to_document();
        doc.insert("operationType", "drop");
        let decoded = StagedRecord::from_document(&doc).unwrap();
        assert_eq!(
            decoded.event.operation,
            OperationType::Unrecognized("drop".to_string())
        );
    }

    #[test]
    fn test_from_document_requires_identity() {
        let mut doc = StagedRecord::new(event(OperationType::Insert), 0).to_document();
        doc.remove("_id");
        assert!(matches!(
            StagedRecord::from_document(&doc),
            Err(MigrationError::Codec(_))
        ));
    }

    #[test]
    fn test_pending_filter() {
        let filter = pending_filter(&Namespace::new("shop", "orders"));
        assert_eq!(filter.get_str("ns.db").unwrap(), "shop");
        assert_eq!(filter.get_str("ns.coll").unwrap(), "orders");
        assert_eq!(
            filter.get_document("status").unwrap(),
            &doc! { "$exists": false }
        );
        assert_eq!(
            filter.get_document("_id").unwrap(),
            &doc! { "$type": "objectId" }
        );
        assert!(filter.contains_key("sequence"));
    }

    #[test]
    fn test_pending_document_skips_foreign_shapes() {
        let ns = Namespace::new("shop", "orders");
        let record = StagedRecord::new(event(OperationType::Insert), 1).to_document();
        assert!(is_pending_document(&record, &ns));
        assert!(!is_pending_document(&record, &Namespace::new("shop", "users")));

        let token_keyed = doc! {
            "_id": { "_data": "8263" },
            "operationType": "insert",
            "ns": { "db": "shop", "coll": "orders" },
            "fullDocument": { "_id": 9 },
            "clusterTime": 1e9,
        };
        assert!(!is_pending_document(&token_keyed, &ns));

        let mut unsequenced = record.clone();
        unsequenced.remove("sequence");
        assert!(!is_pending_document(&unsequenced, &ns));

        let mut done = record;
        done.insert("status", "done");
        assert!(!is_pending_document(&done, &ns));
    }

    #[test]
    fn test_pending_entry_decodes_valid_record() {
        let record = StagedRecord::new(event(OperationType::Insert), 4);
        let entry = PendingEntry::decode(&record.to_document()).unwrap();
        assert_eq!(entry.id(), record.id);
        assert_eq!(entry.into_record(), Some(record));
    }

    #[test]
    fn test_pending_entry_keeps_id_of_malformed_record() {
        let record = StagedRecord::new(event(OperationType::Insert), 4);
        let mut doc = record.to_document();
        doc.remove("sourcePosition");

        match PendingEntry::decode(&doc) {
            Some(PendingEntry::Undecodable { id, reason }) => {
                assert_eq!(id, record.id);
                assert!(reason.contains("sourcePosition"), "{}", reason);
            }
            other => panic!("expected an undecodable entry, got {:?}", other),
        }

        doc.insert("_id", doc! { "_data": "8263" });
        assert!(PendingEntry::decode(&doc).is_none());
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(ReplayStatus::parse("done"), Some(ReplayStatus::Done));
        assert_eq!(ReplayStatus::parse("exception"), Some(ReplayStatus::Exception));
        assert_eq!(ReplayStatus::parse("Done"), None);
    }

    #[test]
    fn test_stats_total() {
        let stats = StagingStats {
            pending: 2,
            done: 5,
            exception: 1,
        };
        assert_eq!(stats.total(), 8);
    }
}
