//! Pre-flight checks run by the operator between migration steps.
//!
//! Each check is independent and re-runnable. A failed check is an error so
//! the CLI exits non-zero and a wrapping script can stop.

use crate::checkpoint::CheckpointStore;
use crate::error::{MigrationError, Result};
use crate::event::{Namespace, ResumePosition};
use crate::staging::{StagingLog, StagingStats};
use crate::store::SourceCollection;
use bson::Document;
use std::fmt;
use tracing::info;

/// Verify the source collection holds at least one document.
///
/// Returns the key of a document priming could anchor to.
pub async fn check_for_docs<S>(source: &S) -> Result<Document>
where
    S: SourceCollection + ?Sized,
{
    match source.sample_key().await? {
        Some(key) => {
            info!(namespace = %source.namespace(), key = %key, "Source collection has documents");
            Ok(key)
        }
        None => Err(MigrationError::EmptyCollection {
            namespace: source.namespace().clone(),
        }),
    }
}

/// Verify a resume position has been saved.
///
/// An unreadable checkpoint counts as missing, the same way capture treats it.
pub async fn check_checkpoint<C>(checkpoint: &C) -> Result<ResumePosition>
where
    C: CheckpointStore + ?Sized,
{
    match checkpoint.load().await {
        Some(position) => {
            info!(namespace = %checkpoint.namespace(), position = %position, "Resume position present");
            Ok(position)
        }
        None => Err(MigrationError::MissingCheckpoint {
            namespace: checkpoint.namespace().clone(),
        }),
    }
}

/// Progress of one namespace.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub namespace: Namespace,
    pub checkpoint: Option<ResumePosition>,
    pub staging: StagingStats,
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "namespace:  {}", self.namespace)?;
        match &self.checkpoint {
            Some(p) => writeln!(f, "checkpoint: {}", p)?,
            None => writeln!(f, "checkpoint: <none>")?,
        }
        write!(
            f,
            "staged:     {} (pending {}, done {}, exception {})",
            self.staging.total(),
            self.staging.pending,
            self.staging.done,
            self.staging.exception
        )
    }
}

/// Collect the checkpoint and staging counts for a namespace.
pub async fn status<C, L>(checkpoint: &C, log: &L) -> Result<StatusReport>
where
    C: CheckpointStore + ?Sized,
    L: StagingLog + ?Sized,
{
    let namespace = checkpoint.namespace().clone();
    let staging = log.stats(&namespace).await?;
    Ok(StatusReport {
        checkpoint: checkpoint.load().await,
        namespace,
        staging,
    })
}
