// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Store integration traits.
//!
//! The engines never talk to a database driver directly. They go through
//! these seams, which lets the same capture/replay code run against MongoDB
//! ([`crate::mongo`]) and the in-process stores ([`crate::memory`]).
//!
//! | Trait | Used by | Role |
//! |-------|---------|------|
//! | [`ChangeFeedSource`] | capture, priming | Subscribe to the source change feed |
//! | [`SourceCollection`] | priming, pre-flight | Sample a key, set/unset the priming sentinel |
//! | [`DestinationStore`] | replay | Apply insert/replace/delete to the real collection |
//!
//! The staging log and checkpoint seams live in [`crate::staging`] and
//! [`crate::checkpoint`].
//!
//! # Example
//!
//! ```rust,no_run
//! use changestream_migration::event::Namespace;
//! use changestream_migration::store::{BoxFuture, DestinationStore};
//! use bson::Document;
//!
//! struct LoggingDestination;
//!
//! impl DestinationStore for LoggingDestination {
//!     fn insert(&self, _ns: &Namespace, doc: Document) -> BoxFuture<'_, ()> {
//!         Box::pin(async move { println!("insert {}", doc); Ok(()) })
//!     }
//!
//!     fn replace(&self, _ns: &Namespace, key: Document, doc: Document, _upsert: bool) -> BoxFuture<'_, ()> {
//!         Box::pin(async move { println!("replace {} with {}", key, doc); Ok(()) })
//!     }
//!
//!     fn delete(&self, _ns: &Namespace, key: Document) -> BoxFuture<'_, bool> {
//!         Box::pin(async move { println!("delete {}", key); Ok(false) })
//!     }
//! }
//! ```

use crate::error::Result;
use crate::event::{ChangeEvent, Namespace, ResumePosition};
use bson::Document;
use futures::stream::BoxStream;
use std::future::Future;
use std::pin::Pin;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Aggregation stages applied server-side to the change feed.
pub type Pipeline = Vec<Document>;

/// A live, ordered, never-ending sequence of change events.
///
/// Polling suspends until the source delivers the next event. An `Err`
/// item is a subscription failure; the stream should be dropped.
pub type ChangeFeed = BoxStream<'static, Result<ChangeEvent>>;

/// Subscription primitive of the source store.
pub trait ChangeFeedSource: Send + Sync {
    /// The collection this source watches.
    fn namespace(&self) -> &Namespace;

    /// Open a subscription.
    ///
    /// `resume_from = None` starts at the moment of subscription. A position
    /// the source no longer retains fails with
    /// [`StalePosition`](crate::error::MigrationError::StalePosition), either
    /// here or as the first stream item.
    fn subscribe(
        &self,
        resume_from: Option<ResumePosition>,
        filter: Pipeline,
    ) -> BoxFuture<'_, ChangeFeed>;
}

/// The source collection itself, for priming and pre-flight checks.
pub trait SourceCollection: Send + Sync {
    fn namespace(&self) -> &Namespace;

    /// Key (`{ _id: .. }`) of an arbitrary existing document, `None` if empty.
    fn sample_key(&self) -> BoxFuture<'_, Option<Document>>;

    /// `$set` a single field on the document with `key`.
    fn set_field(&self, key: Document, field: &str, value: bson::Bson) -> BoxFuture<'_, ()>;

    /// `$unset` a single field on the document with `key`.
    fn unset_field(&self, key: Document, field: &str) -> BoxFuture<'_, ()>;
}

/// Write side of the destination store.
///
/// All three operations are addressed by namespace so one store handle can
/// serve every collection being replayed.
pub trait DestinationStore: Send + Sync {
    /// Insert a document. A key collision fails with
    /// [`DuplicateKey`](crate::error::MigrationError::DuplicateKey).
    fn insert(&self, ns: &Namespace, doc: Document) -> BoxFuture<'_, ()>;

    /// Replace the document matching `key` with `doc`.
    ///
    /// With `upsert` the document is created when absent; without it a
    /// missing document is a no-op.
    fn replace(&self, ns: &Namespace, key: Document, doc: Document, upsert: bool)
        -> BoxFuture<'_, ()>;

    /// Delete the document matching `key`. Returns whether one was removed;
    /// deleting an absent document is not an error.
    fn delete(&self, ns: &Namespace, key: Document) -> BoxFuture<'_, bool>;
}

impl<T: ChangeFeedSource + ?Sized> ChangeFeedSource for std::sync::Arc<T> {
    fn namespace(&self) -> &Namespace {
        (**self).namespace()
    }

    fn subscribe(
        &self,
        resume_from: Option<ResumePosition>,
        filter: Pipeline,
    ) -> BoxFuture<'_, ChangeFeed> {
        (**self).subscribe(resume_from, filter)
    }
}

impl<T: DestinationStore + ?Sized> DestinationStore for std::sync::Arc<T> {
    fn insert(&self, ns: &Namespace, doc: Document) -> BoxFuture<'_, ()> {
        (**self).insert(ns, doc)
    }

    fn replace(
        &self,
        ns: &Namespace,
        key: Document,
        doc: Document,
        upsert: bool,
    ) -> BoxFuture<'_, ()> {
        (**self).replace(ns, key, doc, upsert)
    }

    fn delete(&self, ns: &Namespace, key: Document) -> BoxFuture<'_, bool> {
        (**self).delete(ns, key)
    }
}
