// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the migration pipeline.
//!
//! Errors are categorized by how the pipeline reacts to them. Some are fatal
//! before any work starts, some are recovered locally by the engine that hit
//! them, and store communication failures are retried with backoff.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Store` | Yes | Network errors, timeouts, transient server errors |
//! | `Configuration` | No | Unreachable store, missing majority reads, bad config |
//! | `EmptyCollection` | No | Nothing to anchor a resume position to |
//! | `MissingCheckpoint` | No | Pre-flight: no resume position saved yet |
//! | `StalePosition` | No | Resume position expired on the source; re-prime |
//! | `DuplicateKey` | No | Replay insert hit an existing key (recorded, skipped) |
//! | `UnrecognizedOperation` | No | Operation type outside insert/replace/update/delete |
//! | `CheckpointStore` | No | Local SQLite errors (needs operator attention) |
//! | `Io` | No | Local filesystem errors |
//! | `Codec` | No | Malformed change document or staged record |
//! | `FeedClosed` | No | The change feed ended (collection dropped or renamed) |
//! | `Shutdown` | No | Stop signal observed |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Use [`MigrationError::is_retryable()`] to decide whether an operation
//! should go through [`retry_with_backoff`](crate::resilience::retry_with_backoff).
//! Once the retry budget is spent the error surfaces to the operator, who
//! restarts the process. Restarting is always safe: capture resumes from the
//! last checkpoint and replay re-selects only records without a status.

use crate::event::Namespace;
use thiserror::Error;

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrationError>;

/// Server error code for a duplicate key on insert.
pub const DUPLICATE_KEY_CODE: i32 = 11000;

/// Server error code when the oplog no longer holds the resume point.
pub const CHANGE_STREAM_HISTORY_LOST_CODE: i32 = 286;

/// Server error code for a change stream that can never be resumed.
pub const CHANGE_STREAM_FATAL_CODE: i32 = 280;

/// Errors that can occur while migrating a collection.
#[derive(Error, Debug)]
pub enum MigrationError {
    /// A store is unreachable or does not provide the required guarantees.
    ///
    /// Reported before any capture or replay begins.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The source collection has no documents.
    ///
    /// Fatal for priming. Informational for the `checkForDocs` pre-flight.
    #[error("Collection {namespace} is empty, nothing to anchor a resume position to")]
    EmptyCollection { namespace: Namespace },

    /// No checkpoint has been saved for the namespace.
    #[error("No resume position saved for {namespace}; prime the change feed first")]
    MissingCheckpoint { namespace: Namespace },

    /// The resume position has fallen out of the source's retention window.
    ///
    /// Fatal to capture. Silently resuming from "now" would drop changes,
    /// so the operator has to re-prime and redo the bulk copy.
    #[error("Resume position for {namespace} is no longer available: {message}")]
    StalePosition { namespace: Namespace, message: String },

    /// Insert during replay collided with an existing document.
    #[error("Duplicate key in {namespace}: {key}")]
    DuplicateKey { namespace: Namespace, key: String },

    /// Operation type outside insert/replace/update/delete.
    ///
    /// Never fatal: its message becomes the exception reason of the record.
    #[error("unrecognized operation: {0}")]
    UnrecognizedOperation(String),

    /// Document store command failed.
    ///
    /// Network errors, timeouts and transient server errors. Retryable.
    #[error("Store error ({operation}): {message}")]
    Store {
        operation: String,
        message: String,
        #[source]
        source: Option<mongodb::error::Error>,
    },

    /// SQLite error during checkpoint persistence.
    #[error("Checkpoint store error: {0}")]
    CheckpointStore(#[from] sqlx::Error),

    /// Filesystem error during checkpoint persistence.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed change document or staged record.
    #[error("Codec error: {0}")]
    Codec(String),

    /// The change feed ended.
    #[error("Change feed for {namespace} closed")]
    FeedClosed { namespace: Namespace },

    /// Stop signal observed.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MigrationError {
    /// Create a store error from a driver error.
    pub fn store(operation: impl Into<String>, source: mongodb::error::Error) -> Self {
        Self::Store {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a store error without source
    pub fn store_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Store {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store { .. } => true,
            Self::Configuration(_) => false,
            Self::EmptyCollection { .. } => false,
            Self::MissingCheckpoint { .. } => false,
            Self::StalePosition { .. } => false,
            Self::DuplicateKey { .. } => false,
            Self::UnrecognizedOperation(_) => false,
            Self::CheckpointStore(_) => false,
            Self::Io(_) => false,
            Self::Codec(_) => false,
            Self::FeedClosed { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// True for the stale-position condition.
    pub fn is_stale_position(&self) -> bool {
        matches!(self, Self::StalePosition { .. })
    }
}

impl From<bson::ser::Error> for MigrationError {
    fn from(e: bson::ser::Error) -> Self {
        Self::Codec(e.to_string())
    }
}

impl From<bson::de::Error> for MigrationError {
    fn from(e: bson::de::Error) -> Self {
        Self::Codec(e.to_string())
    }
}
