// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Priming: force a resume position into existence before the bulk copy.
//!
//! A change feed only hands out positions alongside events, and a quiet
//! collection may produce none for hours. Priming makes a reversible no-op
//! mutation on an existing document (set a sentinel field, then unset it)
//! and waits for it to surface on the feed:
//!
//! ```text
//! subscribe(now) ──► $set _tempfield_ ──► $unset _tempfield_
//!                                               │
//!        feed: update(set) … update(unset) ◄────┘
//!                                 │
//!                    checkpoint.save(position)
//! ```
//!
//! The saved position is that of the unset event, so capture starts with
//! the first real change after priming and never stages the priming
//! mutation itself.
//!
//! Two modes:
//! - [`PrimingController::prime_and_wait`]: subscribe, mutate and wait in
//!   one process.
//! - [`PrimingController::trigger_only`] + [`PrimingController::await_trigger`]:
//!   the mutation and the wait run in separate processes, possibly over
//!   different network paths. The trigger pauses first so the waiter has
//!   time to subscribe.

use crate::checkpoint::CheckpointStore;
use crate::config::MigrationConfig;
use crate::error::{MigrationError, Result};
use crate::event::{Namespace, OperationType, ResumePosition};
use crate::resilience::{retry_with_backoff, wait_for_stop, RetryConfig};
use crate::store::{ChangeFeed, ChangeFeedSource, SourceCollection};
use bson::{Bson, Document};
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, info_span, Instrument};

/// Field set and then unset on the anchor document.
pub const SENTINEL_FIELD: &str = "_tempfield_";

/// Runs the priming protocol for one namespace.
#[derive(Debug, Clone)]
pub struct PrimingController {
    namespace: Namespace,
    sentinel_field: String,
    trigger_delay: Duration,
    retry: RetryConfig,
}

impl PrimingController {
    pub fn new(namespace: Namespace, retry: RetryConfig) -> Self {
        Self {
            namespace,
            sentinel_field: SENTINEL_FIELD.to_string(),
            trigger_delay: Duration::from_secs(2),
            retry,
        }
    }

    pub fn from_config(config: &MigrationConfig) -> Self {
        Self::new(config.namespace(), config.retry.to_retry_config())
            .with_trigger_delay(config.priming.trigger_delay_duration())
    }

    pub fn with_trigger_delay(mut self, delay: Duration) -> Self {
        self.trigger_delay = delay;
        self
    }

    pub fn with_sentinel_field(mut self, field: impl Into<String>) -> Self {
        self.sentinel_field = field.into();
        self
    }

    pub fn sentinel_field(&self) -> &str {
        &self.sentinel_field
    }

    /// Mutate, wait for the mutation on a fresh feed, save its position.
    ///
    /// Fails with `EmptyCollection`, without mutating or subscribing, when
    /// the source has no documents.
    pub async fn prime_and_wait<S, F, C>(
        &self,
        source: &S,
        feed: &F,
        checkpoint: &C,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<ResumePosition>
    where
        S: SourceCollection + ?Sized,
        F: ChangeFeedSource + ?Sized,
        C: CheckpointStore + ?Sized,
    {
        let span = info_span!("prime", namespace = %self.namespace);
        async move {
            let key = self.anchor_key(source).await?;

            let subscription = self.subscribe(feed).await?;
            self.mutate(source, &key).await?;

            let position = self
                .wait_for_sentinel(subscription, Some(&key), shutdown_rx)
                .await?;
            checkpoint.save(&position).await?;
            info!(position = %position, "Resume position primed");
            Ok(position)
        }
        .instrument(span)
        .await
    }

    /// The mutation half, for a waiter running elsewhere.
    pub async fn trigger_only<S>(&self, source: &S) -> Result<()>
    where
        S: SourceCollection + ?Sized,
    {
        let span = info_span!("trigger", namespace = %self.namespace);
        async move {
            debug!(delay_ms = self.trigger_delay.as_millis() as u64, "Pausing before trigger");
            tokio::time::sleep(self.trigger_delay).await;

            let key = self.anchor_key(source).await?;
            self.mutate(source, &key).await?;
            info!(key = %key, "Priming mutation triggered");
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// The waiting half: subscribe, wait for a sentinel removal on any
    /// document, save its position.
    pub async fn await_trigger<F, C>(
        &self,
        feed: &F,
        checkpoint: &C,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<ResumePosition>
    where
        F: ChangeFeedSource + ?Sized,
        C: CheckpointStore + ?Sized,
    {
        let span = info_span!("await_prime", namespace = %self.namespace);
        async move {
            let subscription = self.subscribe(feed).await?;
            info!(sentinel = %self.sentinel_field, "Waiting for priming mutation");

            let position = self.wait_for_sentinel(subscription, None, shutdown_rx).await?;
            checkpoint.save(&position).await?;
            info!(position = %position, "Resume position primed");
            Ok(position)
        }
        .instrument(span)
        .await
    }

    async fn anchor_key<S>(&self, source: &S) -> Result<Document>
    where
        S: SourceCollection + ?Sized,
    {
        retry_with_backoff(&self.retry, "source_sample_key", || source.sample_key())
            .await?
            .ok_or_else(|| MigrationError::EmptyCollection {
                namespace: self.namespace.clone(),
            })
    }

    async fn subscribe<F>(&self, feed: &F) -> Result<ChangeFeed>
    where
        F: ChangeFeedSource + ?Sized,
    {
        retry_with_backoff(&self.retry, "change_feed_subscribe", || {
            feed.subscribe(None, Vec::new())
        })
        .await
    }

    async fn mutate<S>(&self, source: &S, key: &Document) -> Result<()>
    where
        S: SourceCollection + ?Sized,
    {
        let field = self.sentinel_field.as_str();
        retry_with_backoff(&self.retry, "source_set_sentinel", || {
            source.set_field(key.clone(), field, Bson::Int32(1))
        })
        .await?;
        retry_with_backoff(&self.retry, "source_unset_sentinel", || {
            source.unset_field(key.clone(), field)
        })
        .await?;
        debug!(key = %key, field, "Sentinel set and removed");
        Ok(())
    }

    async fn wait_for_sentinel(
        &self,
        mut subscription: ChangeFeed,
        key: Option<&Document>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<ResumePosition> {
        loop {
            let item = tokio::select! {
                biased;
                _ = wait_for_stop(&mut shutdown_rx) => return Err(MigrationError::Shutdown),
                item = subscription.next() => item,
            };

            let event = match item {
                Some(Ok(event)) => event,
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(MigrationError::FeedClosed {
                        namespace: self.namespace.clone(),
                    })
                }
            };

            let removes_sentinel = event.operation == OperationType::Update
                && event
                    .update_description
                    .as_ref()
                    .map_or(false, |d| d.removes(&self.sentinel_field));
            let same_document = match key {
                Some(key) => event.document_key.as_ref() == Some(key),
                None => true,
            };

            if removes_sentinel && same_document {
                return Ok(event.source_position);
            }
            debug!(op = %event.operation, key = %event.key_display(), "Ignoring event while priming");
        }
    }
}
