//! Queue processor: fetch, extract, and idempotently index one work item.
//!
//! [`QueueProcessor::process`] is the per-item pipeline:
//!
//! ```text
//! fetch ─▶ resolve content type ─▶ extract segments ─▶ build IndexRecord
//!       ─▶ get(id) ─▶ same content_hash? ─yes─▶ Unchanged (no write)
//!                                       ─no──▶ conditional upsert
//! ```
//!
//! [`QueueProcessor::handle_delivery`] wraps one attempt with a deadline
//! and turns its result into a [`Disposition`] using the [`RetryPolicy`].
//! Dead letters are written here; acknowledging or delaying the message is
//! left to the runtime that owns the queue (pull worker or push server).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use docrelay_core::error::{ExtractError, PipelineError};
use docrelay_core::extract::{resolve_content_type, ExtractorRegistry};
use docrelay_core::models::{DeadLetter, Delivery, ExtractedDocument, IndexRecord, SourceLocator, WorkItem};
use docrelay_core::retry::{Disposition, RetryPolicy};
use docrelay_core::traits::{DeadLetterSink, ObjectStore, SearchIndex, UpsertOutcome};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::stats::{Counter, PipelineStats};

/// Successful result of processing one work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProcessOutcome {
    /// The record was created or replaced.
    Indexed { record_id: String },
    /// The stored record already has identical content; nothing was written.
    Unchanged { record_id: String },
    /// A newer record is already stored; this write was discarded.
    Superseded { record_id: String },
}

impl ProcessOutcome {
    pub fn record_id(&self) -> &str {
        match self {
            ProcessOutcome::Indexed { record_id }
            | ProcessOutcome::Unchanged { record_id }
            | ProcessOutcome::Superseded { record_id } => record_id,
        }
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    pub message_id: String,
    pub source_locator: Option<SourceLocator>,
    pub result: Result<ProcessOutcome, PipelineError>,
    pub disposition: Disposition,
}

/// Reports for a batch, in delivery order.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub reports: Vec<DeliveryReport>,
}

impl BatchReport {
    /// Message ids that should be redelivered. Acked and dead-lettered
    /// deliveries are done and never appear here.
    pub fn retry_ids(&self) -> Vec<&str> {
        self.reports
            .iter()
            .filter(|r| matches!(r.disposition, Disposition::Retry { .. }))
            .map(|r| r.message_id.as_str())
            .collect()
    }
}

pub struct QueueProcessor {
    store: Arc<dyn ObjectStore>,
    extractors: ExtractorRegistry,
    index: Arc<dyn SearchIndex>,
    dead_letters: Arc<dyn DeadLetterSink>,
    policy: RetryPolicy,
    attempt_timeout: Duration,
    max_object_bytes: u64,
    stats: Arc<PipelineStats>,
}

impl QueueProcessor {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        extractors: ExtractorRegistry,
        index: Arc<dyn SearchIndex>,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Self {
        Self {
            store,
            extractors,
            index,
            dead_letters,
            policy: RetryPolicy::default(),
            attempt_timeout: Duration::from_secs(120),
            max_object_bytes: u64::MAX,
            stats: Arc::new(PipelineStats::new()),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_max_object_bytes(mut self, max: u64) -> Self {
        self.max_object_bytes = max;
        self
    }

    pub fn with_stats(mut self, stats: Arc<PipelineStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }

    /// Fetch, extract, and index one work item.
    ///
    /// The record's `indexed_at` is the moment the object bytes were read,
    /// so an attempt holding older bytes can never overwrite a record built
    /// from newer ones.
    pub async fn process(&self, item: &WorkItem) -> Result<ProcessOutcome, PipelineError> {
        let locator = &item.source_locator;
        let object = self.store.fetch(locator).await?;
        let fetched_at = Utc::now();

        let content_type = resolve_content_type(object.content_type.as_deref(), &locator.key);
        if object.bytes.len() as u64 > self.max_object_bytes {
            return Err(ExtractError::Corrupt {
                content_type,
                message: format!(
                    "object is {} bytes, limit is {}",
                    object.bytes.len(),
                    self.max_object_bytes
                ),
            }
            .into());
        }

        let segments = self.extractors.extract(&object.bytes, &content_type).await?;
        let doc = ExtractedDocument {
            source_locator: locator.clone(),
            content_type,
            text_segments: segments,
            extracted_at: Utc::now(),
        };
        debug!(
            source_locator = %locator,
            content_type = %doc.content_type,
            segments = doc.text_segments.len(),
            "extracted"
        );

        self.index_document(&doc, fetched_at).await
    }

    async fn index_document(
        &self,
        doc: &ExtractedDocument,
        indexed_at: DateTime<Utc>,
    ) -> Result<ProcessOutcome, PipelineError> {
        let record = IndexRecord::from_extracted(doc, indexed_at);
        let record_id = record.id.clone();

        let existing = self
            .index
            .get(&record.id)
            .await
            .map_err(PipelineError::IndexRead)?;
        if let Some(existing) = existing {
            if existing.content_hash == record.content_hash {
                return Ok(ProcessOutcome::Unchanged { record_id });
            }
        }

        match self
            .index
            .upsert(&record)
            .await
            .map_err(PipelineError::IndexWrite)?
        {
            UpsertOutcome::Written => Ok(ProcessOutcome::Indexed { record_id }),
            UpsertOutcome::Stale => Ok(ProcessOutcome::Superseded { record_id }),
        }
    }

    /// Run one attempt for a delivery under the attempt deadline.
    async fn attempt(&self, delivery: &Delivery) -> (Option<SourceLocator>, Result<ProcessOutcome, PipelineError>) {
        let item = match delivery.work_item() {
            Ok(item) => item,
            Err(e) => return (None, Err(e)),
        };
        let result = match tokio::time::timeout(self.attempt_timeout, self.process(&item)).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::Timeout(self.attempt_timeout)),
        };
        (Some(item.source_locator), result)
    }

    /// Process one delivery and decide its fate. Dead letters are written
    /// before returning; if that write fails the delivery is retried
    /// instead so the message is never dropped.
    pub async fn handle_delivery(&self, delivery: &Delivery) -> DeliveryReport {
        let (source_locator, result) = self.attempt(delivery).await;
        let mut disposition = self.policy.disposition(&result, delivery.receive_count);

        let locator_field = source_locator
            .as_ref()
            .map(|l| l.to_string())
            .unwrap_or_default();
        self.stats.incr(Counter::Processed);

        match (&result, &disposition) {
            (Ok(outcome), _) => {
                let counter = match outcome {
                    ProcessOutcome::Indexed { .. } => Counter::Indexed,
                    ProcessOutcome::Unchanged { .. } => Counter::Unchanged,
                    ProcessOutcome::Superseded { .. } => Counter::Superseded,
                };
                self.stats.incr(counter);
                info!(
                    message_id = %delivery.message_id,
                    source_locator = %locator_field,
                    record_id = %outcome.record_id(),
                    attempt = delivery.receive_count,
                    outcome = ?counter,
                    "processed"
                );
            }
            (Err(e), Disposition::Retry { delay }) => {
                self.stats.incr(Counter::Retried);
                warn!(
                    message_id = %delivery.message_id,
                    source_locator = %locator_field,
                    attempt = delivery.receive_count,
                    error_kind = %e.kind(),
                    error = %e,
                    retry_in_secs = delay.as_secs(),
                    "attempt failed, will retry"
                );
            }
            (Err(e), Disposition::DeadLetter { kind, reason }) => {
                let letter = DeadLetter {
                    message_id: delivery.message_id.clone(),
                    payload: delivery.body.clone(),
                    source_locator: source_locator.clone(),
                    error_kind: *kind,
                    reason: reason.clone(),
                    attempts: delivery.receive_count,
                    failed_at: Utc::now(),
                };
                match self.dead_letters.send(&letter).await {
                    Ok(()) => {
                        self.stats.incr(Counter::DeadLettered);
                        error!(
                            message_id = %delivery.message_id,
                            source_locator = %locator_field,
                            attempt = delivery.receive_count,
                            error_kind = %kind,
                            error = %e,
                            "dead-lettered"
                        );
                    }
                    Err(sink_err) => {
                        let delay = self.policy.backoff(delivery.receive_count);
                        self.stats.incr(Counter::Retried);
                        error!(
                            message_id = %delivery.message_id,
                            source_locator = %locator_field,
                            error_kind = %kind,
                            error = %sink_err,
                            "dead-letter write failed, leaving message for redelivery"
                        );
                        disposition = Disposition::Retry { delay };
                    }
                }
            }
            (Err(_), Disposition::Ack) => {}
        }

        DeliveryReport {
            message_id: delivery.message_id.clone(),
            source_locator,
            result,
            disposition,
        }
    }

    /// Handle each delivery independently, in order.
    pub async fn handle_batch(&self, deliveries: &[Delivery]) -> BatchReport {
        let mut reports = Vec::with_capacity(deliveries.len());
        for delivery in deliveries {
            reports.push(self.handle_delivery(delivery).await);
        }
        BatchReport { reports }
    }
}
