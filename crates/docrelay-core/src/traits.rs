//! Collaborator traits the pipeline is written against.
//!
//! The notifier and processor never construct clients themselves: every
//! backend is built once per process and injected as an `Arc<dyn _>`.
//! Production implementations (S3, SQS, OpenSearch, SQLite) live in the
//! `docrelay` crate; [`crate::memory`] provides in-memory ones for tests.
//!
//! | Trait | Backed by |
//! |-------|-----------|
//! | [`ObjectStore`] | S3, local filesystem |
//! | [`WorkQueue`] | SQS, SQLite |
//! | [`SearchIndex`] | OpenSearch, SQLite |
//! | [`DeadLetterSink`] | SQS, SQLite |

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{IndexError, QueueError, StoreError};
use crate::models::{DeadLetter, Delivery, IndexRecord, SourceLocator, WorkItem};

/// Bytes of one stored object plus the content type the store reported.
#[derive(Debug, Clone)]
pub struct FetchedObject {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// Read access to object storage.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch the object referenced by `locator`.
    async fn fetch(&self, locator: &SourceLocator) -> Result<FetchedObject, StoreError>;

    /// List object keys in `container` that start with `prefix`, sorted.
    async fn list(&self, container: &str, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// A durable at-least-once queue of [`WorkItem`]s.
///
/// Claimed messages stay invisible to other consumers until acknowledged or
/// until their visibility timeout lapses, after which they are redelivered
/// with an incremented receive count.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn send(&self, item: &WorkItem) -> Result<(), QueueError>;

    /// Claim up to `max` messages, waiting at most `wait` for the first one.
    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<Delivery>, QueueError>;

    /// Delete a claimed message.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Keep a claimed message hidden for `delay` before it is redelivered.
    async fn delay(&self, delivery: &Delivery, delay: Duration) -> Result<(), QueueError>;

    /// Approximate number of messages waiting, if the backend can tell.
    async fn depth(&self) -> Result<Option<u64>, QueueError>;
}

/// Result of a conditional upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The record was created or overwritten.
    Written,
    /// A record with a newer `indexed_at` is already stored; nothing changed.
    Stale,
}

/// The search index the processor writes to.
///
/// `upsert` is keyed by [`IndexRecord::id`] and conditional on
/// `indexed_at`: a write older than the stored record is reported as
/// [`UpsertOutcome::Stale`] rather than applied.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<IndexRecord>, IndexError>;

    async fn upsert(&self, record: &IndexRecord) -> Result<UpsertOutcome, IndexError>;

    async fn count(&self) -> Result<u64, IndexError>;
}

/// Holding area for messages that hit a permanent error or ran out of
/// attempts.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn send(&self, letter: &DeadLetter) -> Result<(), QueueError>;

    /// Most recent dead letters, newest first.
    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
        let _ = limit;
        Err(QueueError::Unsupported("list dead letters"))
    }

    /// Remove a dead letter after it has been redriven.
    async fn remove(&self, message_id: &str) -> Result<(), QueueError> {
        let _ = message_id;
        Err(QueueError::Unsupported("remove dead letter"))
    }

    async fn count(&self) -> Result<Option<u64>, QueueError> {
        Ok(None)
    }
}
