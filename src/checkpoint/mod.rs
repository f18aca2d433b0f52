// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resume position persistence.
//!
//! One opaque blob per `(database, collection)`, overwritten after every
//! staged event. Two backends:
//!
//! - [`FileCheckpointStore`]: `<dir>/<db>.<coll>.token`, written atomically
//! - [`SqliteCheckpointStore`]: one row per namespace in a shared SQLite file
//!
//! ## Load Semantics
//!
//! `load()` never fails. A missing, empty or undecodable blob is reported as
//! `None` and the capture engine starts from the current feed position. That
//! leaves a capture gap the operator has to notice, which is why the
//! `checkTokenFile` pre-flight exists.
//!
//! ## Save Semantics
//!
//! `save()` is durable when it returns. The capture engine does not move on
//! to the next event until the save completes:
//!
//! ```text
//! event k → append to staging log → save position k → event k+1
//!                                 (crash here = event k staged twice,
//!                                  replay absorbs the duplicate)
//! ```

mod file;
mod sqlite;

pub use file::FileCheckpointStore;
pub use sqlite::SqliteCheckpointStore;

use crate::config::{CheckpointBackend, CheckpointConfig};
use crate::error::Result;
use crate::event::{Namespace, ResumePosition};
use crate::store::BoxFuture;
use std::future::Future;
use std::pin::Pin;

/// Boxed future for the infallible `load`.
pub type LoadFuture<'a> = Pin<Box<dyn Future<Output = Option<ResumePosition>> + Send + 'a>>;

/// Boxed future for `close`.
pub type CloseFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Single-slot store for the resume position of one namespace.
pub trait CheckpointStore: Send + Sync {
    /// The namespace this slot belongs to.
    fn namespace(&self) -> &Namespace;

    /// Last saved position, or `None` when absent or unreadable.
    fn load(&self) -> LoadFuture<'_>;

    /// Overwrite the slot. Durable once the future resolves.
    fn save(&self, position: &ResumePosition) -> BoxFuture<'_, ()>;

    /// Release backend resources before exit. Failures are logged only.
    fn close(&self) -> CloseFuture<'_> {
        Box::pin(async {})
    }
}

impl<T: CheckpointStore + ?Sized> CheckpointStore for Box<T> {
    fn namespace(&self) -> &Namespace {
        (**self).namespace()
    }

    fn load(&self) -> LoadFuture<'_> {
        (**self).load()
    }

    fn save(&self, position: &ResumePosition) -> BoxFuture<'_, ()> {
        (**self).save(position)
    }

    fn close(&self) -> CloseFuture<'_> {
        (**self).close()
    }
}

/// Open the configured checkpoint backend for `namespace`.
pub async fn open(
    config: &CheckpointConfig,
    namespace: &Namespace,
) -> Result<Box<dyn CheckpointStore>> {
    match config.backend {
        CheckpointBackend::File => Ok(Box::new(FileCheckpointStore::new(
            &config.dir,
            namespace.clone(),
        ))),
        CheckpointBackend::Sqlite => Ok(Box::new(
            SqliteCheckpointStore::open(&config.sqlite_path, namespace.clone()).await?,
        )),
    }
}
