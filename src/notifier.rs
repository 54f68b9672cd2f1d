//! Ingest notifier: storage events in, work items out.
//!
//! For every `Created` event whose key passes the configured glob filter the
//! notifier sends exactly one [`WorkItem`] to the work queue. It never
//! fetches, extracts, or indexes anything, and it never retries a failed
//! send itself: the failure is returned so the caller can fail the
//! invocation and let the notification source redeliver.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use docrelay_core::error::PipelineError;
use docrelay_core::event::parse_notification;
use docrelay_core::models::{EventType, StorageEvent, WorkItem};
use docrelay_core::traits::WorkQueue;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::NotifierConfig;
use crate::stats::{Counter, PipelineStats};

/// Include/exclude glob patterns applied to object keys.
pub struct KeyFilter {
    include: GlobSet,
    exclude: GlobSet,
}

impl KeyFilter {
    pub fn new(include_globs: &[String], exclude_globs: &[String]) -> Result<Self> {
        Ok(Self {
            include: build_globset(include_globs)?,
            exclude: build_globset(exclude_globs)?,
        })
    }

    pub fn from_config(config: &NotifierConfig) -> Result<Self> {
        Self::new(&config.include_globs, &config.exclude_globs)
    }

    /// Accepts every key except directory markers.
    pub fn allow_all() -> Self {
        Self {
            include: build_globset(&["**".to_string()]).unwrap_or_else(|_| GlobSet::empty()),
            exclude: GlobSet::empty(),
        }
    }

    /// Why `key` is rejected, or `None` if it qualifies.
    pub fn rejection(&self, key: &str) -> Option<String> {
        if key.ends_with('/') {
            return Some("directory marker".to_string());
        }
        if self.exclude.is_match(key) {
            return Some("matched exclude_globs".to_string());
        }
        if !self.include.is_match(key) {
            return Some("did not match include_globs".to_string());
        }
        None
    }

    pub fn accepts(&self, key: &str) -> bool {
        self.rejection(key).is_none()
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// What happened to one storage event.
#[derive(Debug, Clone, PartialEq)]
pub enum NotifyOutcome {
    Enqueued(WorkItem),
    Ignored(String),
}

/// Result of one notification document.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NotifySummary {
    pub enqueued: usize,
    pub ignored: usize,
}

pub struct IngestNotifier {
    queue: Arc<dyn WorkQueue>,
    filter: KeyFilter,
    stats: Arc<PipelineStats>,
}

impl IngestNotifier {
    pub fn new(queue: Arc<dyn WorkQueue>, filter: KeyFilter) -> Self {
        Self {
            queue,
            filter,
            stats: Arc::new(PipelineStats::new()),
        }
    }

    pub fn with_stats(mut self, stats: Arc<PipelineStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn filter(&self) -> &KeyFilter {
        &self.filter
    }

    /// Turn one storage event into at most one queued work item.
    pub async fn handle_event(&self, event: &StorageEvent) -> Result<NotifyOutcome, PipelineError> {
        if event.event_type != EventType::Created {
            debug!(
                container = %event.container_name,
                key = %event.object_key,
                event_type = ?event.event_type,
                "ignoring non-create event"
            );
            self.stats.incr(Counter::Ignored);
            return Ok(NotifyOutcome::Ignored(format!(
                "event type {:?} does not qualify",
                event.event_type
            )));
        }
        if let Some(reason) = self.filter.rejection(&event.object_key) {
            debug!(key = %event.object_key, %reason, "ignoring key");
            self.stats.incr(Counter::Ignored);
            return Ok(NotifyOutcome::Ignored(reason));
        }

        let item = WorkItem::new(event.locator(), Utc::now());
        match self.queue.send(&item).await {
            Ok(()) => {
                info!(source_locator = %item.source_locator, "enqueued work item");
                self.stats.incr(Counter::Enqueued);
                Ok(NotifyOutcome::Enqueued(item))
            }
            Err(e) => {
                warn!(source_locator = %item.source_locator, error = %e, "enqueue failed");
                Err(PipelineError::Enqueue(e))
            }
        }
    }

    /// Parse an object-storage notification and handle each record in
    /// order, stopping at the first enqueue failure. Items already sent
    /// before the failure become harmless duplicates on redelivery.
    pub async fn handle_notification(&self, payload: &str) -> Result<NotifySummary, PipelineError> {
        let events = parse_notification(payload)?;
        let mut summary = NotifySummary::default();
        for event in &events {
            match self.handle_event(event).await? {
                NotifyOutcome::Enqueued(_) => summary.enqueued += 1,
                NotifyOutcome::Ignored(_) => summary.ignored += 1,
            }
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docrelay_core::memory::MemoryQueue;

    fn notifier(queue: Arc<MemoryQueue>, include: &[&str], exclude: &[&str]) -> IngestNotifier {
        let include: Vec<String> = include.iter().map(|s| s.to_string()).collect();
        let exclude: Vec<String> = exclude.iter().map(|s| s.to_string()).collect();
        IngestNotifier::new(queue, KeyFilter::new(&include, &exclude).unwrap())
    }

    #[tokio::test]
    async fn created_event_enqueues_exactly_one_item() {
        let queue = Arc::new(MemoryQueue::default());
        let n = notifier(queue.clone(), &["**"], &[]);
        let outcome = n
            .handle_event(&StorageEvent::created("docs", "a.pdf"))
            .await
            .unwrap();
        match outcome {
            NotifyOutcome::Enqueued(item) => {
                assert_eq!(item.source_locator.to_string(), "docs/a.pdf");
                assert_eq!(item.attempt_count, 0);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(queue.send_calls(), 1);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn other_events_and_filtered_keys_are_ignored() {
        let queue = Arc::new(MemoryQueue::default());
        let n = notifier(queue.clone(), &["**/*.pdf", "*.pdf"], &["tmp/**"]);

        let removed = StorageEvent {
            container_name: "docs".into(),
            object_key: "a.pdf".into(),
            event_type: EventType::Removed,
        };
        assert!(matches!(n.handle_event(&removed).await.unwrap(), NotifyOutcome::Ignored(_)));
        for key in ["notes.txt", "tmp/a.pdf", "folder/"] {
            let outcome = n.handle_event(&StorageEvent::created("docs", key)).await.unwrap();
            assert!(matches!(outcome, NotifyOutcome::Ignored(_)), "{}", key);
        }
        assert_eq!(queue.send_calls(), 0);
    }

    #[tokio::test]
    async fn enqueue_failure_is_reported_without_retry() {
        let queue = Arc::new(MemoryQueue::default());
        queue.set_fail_sends(true);
        let n = notifier(queue.clone(), &["**"], &[]);
        let err = n
            .handle_event(&StorageEvent::created("docs", "a.pdf"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Enqueue(_)));
        assert!(err.is_retryable());
        assert_eq!(queue.send_calls(), 1);
    }

    #[tokio::test]
    async fn notification_document_is_handled_record_by_record() {
        let queue = Arc::new(MemoryQueue::default());
        let n = notifier(queue.clone(), &["**"], &[]);
        let payload = r#"{"Records":[
            {"eventName":"ObjectCreated:Put","s3":{"bucket":{"name":"docs"},"object":{"key":"reports/q1+summary.pdf"}}},
            {"eventName":"ObjectRemoved:Delete","s3":{"bucket":{"name":"docs"},"object":{"key":"old.pdf"}}}
        ]}"#;
        let summary = n.handle_notification(payload).await.unwrap();
        assert_eq!(summary.enqueued, 1);
        assert_eq!(summary.ignored, 1);
        let body = &queue.bodies()[0];
        assert!(body.contains("docs/reports/q1 summary.pdf"));
    }
}
