// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replay engine: staging log → destination collection.
//!
//! Repeatedly selects the pending records of one namespace in ascending
//! sequence order and applies them to the destination one at a time:
//!
//! | Operation | Destination call | Outcome |
//! |-----------|------------------|---------|
//! | insert | insert `fullDocument` | done, or exception `"duplicate key"` |
//! | replace / update | replace by `documentKey` (upsert) | done; update without post-image is a no-op |
//! | delete | delete by `documentKey` | done, absent document is a no-op |
//! | anything else | none | exception `"unrecognized operation: <raw>"` |
//!
//! Every outcome ends with a conditional status transition, so a record is
//! never selected again once it is done or set aside. A crash between apply
//! and transition re-applies that one record on restart, which converges
//! because every operation above is idempotent.
//!
//! When a query returns nothing the engine sleeps, doubling the sleep up to
//! a ceiling, and polls again. It runs until the stop signal.

use crate::config::MigrationConfig;
use crate::error::{MigrationError, Result};
use crate::event::{Namespace, OperationType};
use crate::metrics;
use crate::resilience::{
    retry_with_backoff, wait_for_stop, IdleBackoff, RateLimitConfig, RateLimiter, RetryConfig,
};
use crate::staging::{PendingEntry, RecordId, StagedRecord, StagingLog};
use crate::store::DestinationStore;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, info_span, trace, warn, Instrument};

/// Exception reason recorded for an insert that collided on the destination.
pub const DUPLICATE_KEY_REASON: &str = "duplicate key";

/// Result of applying one staged record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The destination was changed.
    Applied,
    /// Nothing to change (document already absent, or no post-image to
    /// write). Still marked done.
    NoOp,
    /// Could not be applied cleanly. Recorded on the staged record.
    Exception {
        reason: String,
        /// Short metric label.
        kind: &'static str,
    },
}

impl ApplyOutcome {
    fn exception(reason: impl Into<String>, kind: &'static str) -> Self {
        Self::Exception {
            reason: reason.into(),
            kind,
        }
    }
}

/// Counts for one replay run or drain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub batches: u64,
    pub applied: u64,
    pub noops: u64,
    pub exceptions: u64,
    /// Transitions that found the record no longer pending (another replay
    /// instance got there first).
    pub lost_transitions: u64,
}

impl ReplaySummary {
    /// Records that reached a final status in this run.
    pub fn processed(&self) -> u64 {
        self.applied + self.noops + self.exceptions
    }
}

/// Applies one namespace's staged records to the destination.
#[derive(Debug, Clone)]
pub struct ReplayEngine {
    namespace: Namespace,
    batch_size: usize,
    upsert_on_replace: bool,
    idle_backoff: Duration,
    max_idle_backoff: Duration,
    retry: RetryConfig,
    rate_limiter: Option<Arc<RateLimiter>>,
}

impl ReplayEngine {
    pub fn new(namespace: Namespace, retry: RetryConfig) -> Self {
        Self {
            namespace,
            batch_size: 100,
            upsert_on_replace: true,
            idle_backoff: Duration::from_millis(250),
            max_idle_backoff: Duration::from_secs(5),
            retry,
            rate_limiter: None,
        }
    }

    pub fn from_config(config: &MigrationConfig) -> Self {
        let replay = &config.replay;
        let mut engine = Self::new(config.namespace(), config.retry.to_retry_config())
            .with_batch_size(replay.batch_size)
            .with_idle_backoff(
                replay.idle_backoff_duration(),
                replay.max_idle_backoff_duration(),
            )
            .with_upsert_on_replace(replay.upsert_on_replace);
        if let Some(rate_limit) = replay.rate_limit_config() {
            engine = engine.with_rate_limit(rate_limit);
        }
        engine
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_idle_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.idle_backoff = initial;
        self.max_idle_backoff = max;
        self
    }

    pub fn with_upsert_on_replace(mut self, upsert: bool) -> Self {
        self.upsert_on_replace = upsert;
        self
    }

    pub fn with_rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limiter = Some(Arc::new(RateLimiter::new(config)));
        self
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Apply a record's operation to the destination without touching its
    /// status.
    pub async fn apply_record<D>(&self, destination: &D, record: &StagedRecord) -> Result<ApplyOutcome>
    where
        D: DestinationStore + ?Sized,
    {
        let event = &record.event;
        let ns = &event.namespace;

        match &event.operation {
            OperationType::Insert => {
                let Some(doc) = &event.full_document else {
                    return Ok(ApplyOutcome::exception(
                        "insert without a full document",
                        "missing_document",
                    ));
                };
                let result = retry_with_backoff(&self.retry, "destination_insert", || {
                    destination.insert(ns, doc.clone())
                })
                .await;
                match result {
                    Ok(()) => Ok(ApplyOutcome::Applied),
                    Err(MigrationError::DuplicateKey { .. }) => {
                        Ok(ApplyOutcome::exception(DUPLICATE_KEY_REASON, "duplicate_key"))
                    }
                    Err(e) => Err(e),
                }
            }
            OperationType::Replace | OperationType::Update => {
                let Some(key) = &event.document_key else {
                    return Ok(ApplyOutcome::exception(
                        format!("{} without a document key", event.operation),
                        "missing_key",
                    ));
                };
                match &event.full_document {
                    Some(doc) => {
                        retry_with_backoff(&self.retry, "destination_replace", || {
                            destination.replace(ns, key.clone(), doc.clone(), self.upsert_on_replace)
                        })
                        .await?;
                        Ok(ApplyOutcome::Applied)
                    }
                    // Deleted before the post-image lookup ran; the delete follows.
                    None if event.operation == OperationType::Update => Ok(ApplyOutcome::NoOp),
                    None => Ok(ApplyOutcome::exception(
                        "replace without a full document",
                        "missing_document",
                    )),
                }
            }
            OperationType::Delete => {
                let Some(key) = &event.document_key else {
                    return Ok(ApplyOutcome::exception(
                        "delete without a document key",
                        "missing_key",
                    ));
                };
                let removed = retry_with_backoff(&self.retry, "destination_delete", || {
                    destination.delete(ns, key.clone())
                })
                .await?;
                Ok(if removed {
                    ApplyOutcome::Applied
                } else {
                    ApplyOutcome::NoOp
                })
            }
            OperationType::Unrecognized(raw) => Ok(ApplyOutcome::exception(
                MigrationError::UnrecognizedOperation(raw.clone()).to_string(),
                "unrecognized_op",
            )),
        }
    }

    /// Apply every pending record, then return.
    pub async fn drain<L, D>(&self, log: &L, destination: &D) -> Result<ReplaySummary>
    where
        L: StagingLog + ?Sized,
        D: DestinationStore + ?Sized,
    {
        let mut summary = ReplaySummary::default();
        loop {
            let batch = self.fetch(log).await?;
            if batch.is_empty() {
                return Ok(summary);
            }
            summary.batches += 1;
            for entry in batch {
                self.process(log, destination, entry, &mut summary).await?;
            }
        }
    }

    /// Poll and apply until the stop signal.
    pub async fn run<L, D>(
        &self,
        log: &L,
        destination: &D,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<ReplaySummary>
    where
        L: StagingLog + ?Sized,
        D: DestinationStore + ?Sized,
    {
        let span = info_span!("replay", namespace = %self.namespace);
        self.run_inner(log, destination, shutdown_rx)
            .instrument(span)
            .await
    }

    async fn run_inner<L, D>(
        &self,
        log: &L,
        destination: &D,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<ReplaySummary>
    where
        L: StagingLog + ?Sized,
        D: DestinationStore + ?Sized,
    {
        info!(
            batch_size = self.batch_size,
            upsert_on_replace = self.upsert_on_replace,
            rate_limited = self.rate_limiter.is_some(),
            "Replay started"
        );
        let mut summary = ReplaySummary::default();
        let mut idle = IdleBackoff::new(self.idle_backoff, self.max_idle_backoff);

        'poll: loop {
            let batch = tokio::select! {
                biased;
                _ = wait_for_stop(&mut shutdown_rx) => break 'poll,
                batch = self.fetch(log) => batch?,
            };

            if batch.is_empty() {
                let delay = idle.next_delay();
                trace!(delay_ms = delay.as_millis() as u64, "No pending records, idling");
                tokio::select! {
                    biased;
                    _ = wait_for_stop(&mut shutdown_rx) => break 'poll,
                    _ = tokio::time::sleep(delay) => continue 'poll,
                }
            }

            idle.reset();
            summary.batches += 1;
            let backlog = self.report_backlog(log).await;
            debug!(records = batch.len(), backlog = ?backlog, "Applying batch");

            for entry in batch {
                if *shutdown_rx.borrow() {
                    break 'poll;
                }
                self.process(log, destination, entry, &mut summary).await?;
            }
        }

        info!(
            applied = summary.applied,
            noops = summary.noops,
            exceptions = summary.exceptions,
            "Stop signal received, replay exiting"
        );
        Ok(summary)
    }

    /// Publish the namespace's pending count. A failed count only skips
    /// the gauge update.
    async fn report_backlog<L>(&self, log: &L) -> Option<u64>
    where
        L: StagingLog + ?Sized,
    {
        match log.stats(&self.namespace).await {
            Ok(stats) => {
                metrics::set_replay_backlog(&self.namespace, stats.pending);
                Some(stats.pending)
            }
            Err(e) => {
                debug!(error = %e, "Backlog count failed");
                None
            }
        }
    }

    async fn fetch<L>(&self, log: &L) -> Result<Vec<PendingEntry>>
    where
        L: StagingLog + ?Sized,
    {
        retry_with_backoff(&self.retry, "staging_pending", || {
            log.pending(&self.namespace, self.batch_size)
        })
        .await
    }

    async fn process<L, D>(
        &self,
        log: &L,
        destination: &D,
        entry: PendingEntry,
        summary: &mut ReplaySummary,
    ) -> Result<()>
    where
        L: StagingLog + ?Sized,
        D: DestinationStore + ?Sized,
    {
        let record = match entry {
            PendingEntry::Record(record) => record,
            PendingEntry::Undecodable { id, reason } => {
                return self.set_aside_undecodable(log, id, reason, summary).await;
            }
        };

        if let Some(limiter) = &self.rate_limiter {
            limiter.acquire().await;
        }

        let started = Instant::now();
        let outcome = self.apply_record(destination, &record).await?;
        let op = record.event.operation.as_str();

        let transitioned = match &outcome {
            ApplyOutcome::Applied | ApplyOutcome::NoOp => {
                let done = retry_with_backoff(&self.retry, "staging_mark_done", || {
                    log.mark_done(record.id)
                })
                .await?;
                metrics::record_apply(&self.namespace, op, started.elapsed());
                if outcome == ApplyOutcome::Applied {
                    summary.applied += 1;
                } else {
                    summary.noops += 1;
                }
                trace!(sequence = record.sequence, op, key = %record.event.key_display(), outcome = ?outcome, "Record applied");
                done
            }
            ApplyOutcome::Exception { reason, kind } => {
                warn!(
                    sequence = record.sequence,
                    record_id = %record.id,
                    op,
                    key = %record.event.key_display(),
                    reason = %reason,
                    "Record set aside as exception"
                );
                let marked = retry_with_backoff(&self.retry, "staging_mark_exception", || {
                    log.mark_exception(record.id, reason.clone())
                })
                .await?;
                metrics::record_exception(&self.namespace, kind);
                summary.exceptions += 1;
                marked
            }
        };

        if !transitioned {
            debug!(record_id = %record.id, "Record was no longer pending");
            summary.lost_transitions += 1;
        }
        Ok(())
    }

    async fn set_aside_undecodable<L>(
        &self,
        log: &L,
        id: RecordId,
        reason: String,
        summary: &mut ReplaySummary,
    ) -> Result<()>
    where
        L: StagingLog + ?Sized,
    {
        warn!(record_id = %id, reason = %reason, "Staged record does not decode, set aside as exception");
        let marked = retry_with_backoff(&self.retry, "staging_mark_exception", || {
            log.mark_exception(id, reason.clone())
        })
        .await?;
        metrics::record_exception(&self.namespace, "undecodable");
        summary.exceptions += 1;
        if !marked {
            summary.lost_transitions += 1;
        }
        Ok(())
    }
}
