// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change events flowing through the pipeline.
//!
//! A [`ChangeEvent`] is produced by a [`ChangeFeedSource`](crate::store::ChangeFeedSource),
//! stamped with a sequence number by the capture engine, staged, and finally
//! applied by the replay engine.
//!
//! # Raw Change Documents
//!
//! The source store delivers change notifications as documents:
//!
//! ```text
//! {
//!   _id: { _data: "8263..." },          ← resume position (opaque)
//!   operationType: "update",
//!   ns: { db: "shop", coll: "orders" },
//!   documentKey: { _id: 1 },
//!   fullDocument: { _id: 1, v: "b" },    ← post-image (update lookup)
//!   updateDescription: { updatedFields: {...}, removedFields: [...] }
//! }
//! ```
//!
//! [`ChangeEvent::from_raw`] turns one into the typed form. Operation types
//! other than insert/replace/update/delete are kept as
//! [`OperationType::Unrecognized`] so the capture engine can log and skip them.

use crate::error::{MigrationError, Result};
use bson::{Bson, Document};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A `(database, collection)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Namespace {
    pub db: String,
    pub coll: String,
}

impl Namespace {
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }

    /// The `{ db, coll }` document stored on staged records.
    pub fn to_document(&self) -> Document {
        bson::doc! { "db": &self.db, "coll": &self.coll }
    }

    pub fn from_document(doc: &Document) -> Result<Self> {
        let db = doc
            .get_str("db")
            .map_err(|e| MigrationError::Codec(format!("namespace db: {}", e)))?;
        let coll = doc
            .get_str("coll")
            .map_err(|e| MigrationError::Codec(format!("namespace coll: {}", e)))?;
        Ok(Self::new(db, coll))
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

/// Operation type of a change event.
///
/// Closed over the four operations the pipeline knows how to replay.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OperationType {
    Insert,
    Replace,
    Update,
    Delete,
    /// Anything else (drop, rename, invalidate, ...). Never staged nor applied.
    Unrecognized(String),
}

impl OperationType {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "insert" => Self::Insert,
            "replace" => Self::Replace,
            "update" => Self::Update,
            "delete" => Self::Delete,
            other => Self::Unrecognized(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Insert => "insert",
            Self::Replace => "replace",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Unrecognized(raw) => raw.as_str(),
        }
    }

    pub fn is_recognized(&self) -> bool {
        !matches!(self, Self::Unrecognized(_))
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque resume marker issued by the change feed.
///
/// Only the [`ChangeFeedSource`](crate::store::ChangeFeedSource) that issued it
/// interprets the contents. Everyone else stores and hands it back.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumePosition(Document);

impl ResumePosition {
    pub fn from_document(doc: Document) -> Self {
        Self(doc)
    }

    pub fn as_document(&self) -> &Document {
        &self.0
    }

    pub fn into_document(self) -> Document {
        self.0
    }

    /// Serialize to a BSON blob for checkpoint persistence.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bson::to_vec(&self.0)?)
    }

    /// Decode a blob written by [`to_bytes`](Self::to_bytes).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let doc: Document = bson::from_slice(bytes)?;
        if doc.is_empty() {
            return Err(MigrationError::Codec("empty resume position".to_string()));
        }
        Ok(Self(doc))
    }
}

impl fmt::Display for ResumePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Field-level description of an update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateDescription {
    pub updated_fields: Document,
    pub removed_fields: Vec<String>,
}

impl UpdateDescription {
    pub fn removes(&self, field: &str) -> bool {
        self.removed_fields.iter().any(|f| f == field)
    }
}

/// One write observed on the source.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub operation: OperationType,
    pub namespace: Namespace,
    /// Primary-key fields of the affected document, e.g. `{ _id: 1 }`.
    pub document_key: Option<Document>,
    /// Post-image for insert/replace/update. `None` when the document was
    /// deleted before the update lookup ran.
    pub full_document: Option<Document>,
    pub update_description: Option<UpdateDescription>,
    pub source_position: ResumePosition,
}

impl ChangeEvent {
    /// Parse a raw change document.
    ///
    /// `watched` is used when the document carries no `ns` (invalidate events).
    pub fn from_raw(raw: &Document, watched: &Namespace) -> Result<Self> {
        let position = raw
            .get_document("_id")
            .map_err(|e| MigrationError::Codec(format!("change event _id: {}", e)))?;

        let operation = raw
            .get_str("operationType")
            .map(OperationType::parse)
            .map_err(|e| MigrationError::Codec(format!("change event operationType: {}", e)))?;

        let namespace = match raw.get_document("ns") {
            Ok(ns) => {
                let db = ns.get_str("db").unwrap_or(watched.db.as_str());
                let coll = ns.get_str("coll").unwrap_or(watched.coll.as_str());
                Namespace::new(db, coll)
            }
            Err(_) => watched.clone(),
        };

        let update_description = raw.get_document("updateDescription").ok().map(|desc| {
            let updated_fields = desc.get_document("updatedFields").cloned().unwrap_or_default();
            let removed_fields = desc
                .get_array("removedFields")
                .map(|fields| {
                    fields
                        .iter()
                        .filter_map(|f| f.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            UpdateDescription {
                updated_fields,
                removed_fields,
            }
        });

        Ok(Self {
            operation,
            namespace,
            document_key: optional_document(raw, "documentKey"),
            full_document: optional_document(raw, "fullDocument"),
            update_description,
            source_position: ResumePosition::from_document(position.clone()),
        })
    }

    /// Display form of the document key for logs and exception reasons.
    pub fn key_display(&self) -> String {
        self.document_key
            .as_ref()
            .map(|k| k.to_string())
            .unwrap_or_else(|| "<none>".to_string())
    }
}

fn optional_document(raw: &Document, field: &str) -> Option<Document> {
    match raw.get(field) {
        Some(Bson::Document(doc)) => Some(doc.clone()),
        _ => None,
    }
}
