// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Capture engine: change feed → staging log.
//!
//! Tails the source change feed from the saved checkpoint, stamps every
//! event with a synthetic sequence number, appends it to the staging log and
//! then saves the event's position.
//!
//! # Per-event protocol
//!
//! ```text
//! ┌──────────────┐   ┌─────────────────┐   ┌──────────────┐   ┌─────────────────┐
//! │ feed.next()  │──►│ sequence = n+1  │──►│ log.append() │──►│ checkpoint.save │
//! └──────────────┘   └─────────────────┘   └──────────────┘   └─────────────────┘
//!                     unrecognized op:         retried with        durable before
//!                     skipped, no sequence     backoff             the next event
//! ```
//!
//! A crash between append and save stages the same event again on restart.
//! Each append carries a fresh record id, so the duplicate lands as a second
//! record with a higher sequence; replaying it is idempotent.
//!
//! # Failure handling
//!
//! - Retryable feed errors: resubscribe from the last saved position with
//!   backoff. Consecutive failures beyond the retry budget are fatal.
//! - `StalePosition`: fatal. Resuming from "now" would silently drop changes.
//! - Feed ends: fatal (`FeedClosed`). A change feed never ends on its own.
//! - Stop signal: returns `Ok` with a summary after the in-flight event is
//!   fully staged and checkpointed.

use crate::checkpoint::CheckpointStore;
use crate::config::MigrationConfig;
use crate::error::{MigrationError, Result};
use crate::event::{ChangeEvent, Namespace, ResumePosition};
use crate::metrics;
use crate::resilience::{retry_with_backoff, wait_for_stop, RetryConfig};
use crate::staging::{StagedRecord, StagingLog};
use crate::store::{ChangeFeed, ChangeFeedSource, Pipeline};
use futures::StreamExt;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Process-local sequence counter for one namespace.
///
/// Seeded from the wall clock in microseconds, but never below the last
/// sequence already staged, so a restarted engine keeps sequences strictly
/// increasing. Values order events within a namespace; they are not
/// comparable across namespaces.
#[derive(Debug, Clone)]
pub struct SequenceClock {
    next: i64,
}

impl SequenceClock {
    /// Seed from `max(now_micros, last_staged + 1)`.
    pub fn seeded(last_staged: Option<i64>) -> Self {
        let now = chrono::Utc::now().timestamp_micros();
        let floor = last_staged.map_or(i64::MIN, |last| last.saturating_add(1));
        Self {
            next: now.max(floor),
        }
    }

    pub fn starting_at(next: i64) -> Self {
        Self { next }
    }

    /// Take the next value.
    pub fn next_sequence(&mut self) -> i64 {
        let value = self.next;
        self.next = self.next.saturating_add(1);
        value
    }

    pub fn peek(&self) -> i64 {
        self.next
    }
}

/// What one capture run did before it stopped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CaptureSummary {
    /// Events appended to the staging log.
    pub staged: u64,
    /// Unrecognized events logged and skipped.
    pub skipped: u64,
    /// Subscriptions reopened after transient feed failures.
    pub resubscribes: u64,
    pub first_sequence: Option<i64>,
    pub last_sequence: Option<i64>,
    /// Last position saved to the checkpoint store.
    pub last_position: Option<ResumePosition>,
}

/// Drains one collection's change feed into the staging log.
#[derive(Debug, Clone)]
pub struct CaptureEngine {
    namespace: Namespace,
    filter: Pipeline,
    retry: RetryConfig,
}

impl CaptureEngine {
    pub fn new(namespace: Namespace, retry: RetryConfig) -> Self {
        Self {
            namespace,
            filter: Vec::new(),
            retry,
        }
    }

    pub fn from_config(config: &MigrationConfig) -> Result<Self> {
        Ok(Self::new(config.namespace(), config.retry.to_retry_config())
            .with_filter(config.capture.pipeline_documents()?))
    }

    /// Server-side pipeline applied to the feed.
    pub fn with_filter(mut self, filter: Pipeline) -> Self {
        self.filter = filter;
        self
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Run until the stop signal, a fatal error, or the feed ending.
    pub async fn run<S, C, L>(
        &self,
        source: &S,
        checkpoint: &C,
        sink: &L,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<CaptureSummary>
    where
        S: ChangeFeedSource + ?Sized,
        C: CheckpointStore + ?Sized,
        L: StagingLog + ?Sized,
    {
        let span = info_span!("capture", namespace = %self.namespace);
        self.run_inner(source, checkpoint, sink, shutdown_rx)
            .instrument(span)
            .await
    }

    async fn run_inner<S, C, L>(
        &self,
        source: &S,
        checkpoint: &C,
        sink: &L,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<CaptureSummary>
    where
        S: ChangeFeedSource + ?Sized,
        C: CheckpointStore + ?Sized,
        L: StagingLog + ?Sized,
    {
        let mut summary = CaptureSummary::default();
        let mut position = checkpoint.load().await;
        match &position {
            Some(p) => info!(position = %p, "Resuming capture from checkpoint"),
            None => warn!("No checkpoint found, capturing from the current feed position"),
        }

        let last_staged = retry_with_backoff(&self.retry, "staging_last_sequence", || {
            sink.last_sequence(&self.namespace)
        })
        .await?;
        let mut clock = SequenceClock::seeded(last_staged);
        debug!(last_staged = ?last_staged, next_sequence = clock.peek(), "Sequence clock seeded");

        let mut feed = self.subscribe(source, position.clone()).await?;
        let mut consecutive_failures = 0usize;

        loop {
            let item = tokio::select! {
                biased;

                _ = wait_for_stop(&mut shutdown_rx) => {
                    info!(staged = summary.staged, skipped = summary.skipped, "Stop signal received, capture exiting");
                    break;
                }

                item = feed.next() => item,
            };

            let event = match item {
                Some(Ok(event)) => {
                    consecutive_failures = 0;
                    event
                }
                Some(Err(e)) if e.is_retryable() => {
                    consecutive_failures += 1;
                    if consecutive_failures >= self.retry.max_attempts {
                        error!(error = %e, failures = consecutive_failures, "Change feed keeps failing, giving up");
                        return Err(e);
                    }
                    let delay = self.retry.delay_for_attempt(consecutive_failures);
                    warn!(
                        error = %e,
                        failures = consecutive_failures,
                        delay_ms = delay.as_millis() as u64,
                        "Change feed failed, resubscribing from last saved position"
                    );
                    tokio::select! {
                        biased;
                        _ = wait_for_stop(&mut shutdown_rx) => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    metrics::record_feed_resubscribe(&self.namespace);
                    summary.resubscribes += 1;
                    feed = self.subscribe(source, position.clone()).await?;
                    continue;
                }
                Some(Err(e)) => {
                    if e.is_stale_position() {
                        error!(error = %e, "Resume position expired on the source, re-prime required");
                    }
                    return Err(e);
                }
                None => {
                    error!("Change feed ended unexpectedly");
                    return Err(MigrationError::FeedClosed {
                        namespace: self.namespace.clone(),
                    });
                }
            };

            let event_position = event.source_position.clone();
            if event.operation.is_recognized() {
                let sequence = clock.next_sequence();
                self.stage(sink, event, sequence).await?;
                summary.staged += 1;
                summary.first_sequence.get_or_insert(sequence);
                summary.last_sequence = Some(sequence);
            } else {
                warn!(
                    op = %event.operation,
                    key = %event.key_display(),
                    "Unrecognized operation, not staged"
                );
                metrics::record_event_skipped(&self.namespace, event.operation.as_str());
                summary.skipped += 1;
            }

            checkpoint.save(&event_position).await?;
            summary.last_position = Some(event_position.clone());
            position = Some(event_position);
        }

        Ok(summary)
    }

    async fn subscribe<S>(&self, source: &S, from: Option<ResumePosition>) -> Result<ChangeFeed>
    where
        S: ChangeFeedSource + ?Sized,
    {
        retry_with_backoff(&self.retry, "change_feed_subscribe", || {
            source.subscribe(from.clone(), self.filter.clone())
        })
        .await
    }

    async fn stage<L>(&self, sink: &L, event: ChangeEvent, sequence: i64) -> Result<()>
    where
        L: StagingLog + ?Sized,
    {
        let op = event.operation.as_str().to_string();
        let key = event.key_display();
        let record = StagedRecord::new(event, sequence);
        let started = Instant::now();

        let mut attempts = 0usize;
        retry_with_backoff(&self.retry, "staging_append", || {
            attempts += 1;
            if attempts > 1 {
                metrics::record_capture_retry(&self.namespace, "staging_append");
            }
            sink.append(record.clone())
        })
        .await?;

        metrics::record_append_latency(&self.namespace, started.elapsed());
        metrics::record_event_captured(&self.namespace, &op, sequence);
        debug!(sequence, op = %op, key = %key, record_id = %record.id, "Event staged");
        Ok(())
    }
}
