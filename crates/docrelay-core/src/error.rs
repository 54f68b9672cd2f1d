//! Error taxonomy for the pipeline.
//!
//! Each collaborator has its own error type; [`PipelineError`] is what a
//! processing attempt reports, and [`PipelineError::is_retryable`] is the
//! single place that decides between redelivery and the dead-letter
//! destination.

use thiserror::Error;

use crate::models::ErrorKind;

/// The object is missing or cannot be read. Permanent.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("access denied: {0}")]
    AccessDenied(String),
}

/// Object-store failure as seen by callers of [`ObjectStore`](crate::traits::ObjectStore).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    /// Transport failure or server-side error; the object may well exist.
    #[error("object store unavailable: {0}")]
    Unavailable(String),
}

/// Content could not be turned into text. Permanent, except for
/// [`ExtractError::TimedOut`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExtractError {
    #[error("unsupported content-type: {0}")]
    UnsupportedContentType(String),
    #[error("corrupt {content_type} content: {message}")]
    Corrupt {
        content_type: String,
        message: String,
    },
    #[error("OCR failed: {0}")]
    Ocr(String),
    /// An external extraction step ran past its own deadline.
    #[error("{extractor} did not finish within {timeout:?}")]
    TimedOut {
        extractor: String,
        timeout: std::time::Duration,
    },
}

impl ExtractError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExtractError::TimedOut { .. })
    }
}

/// Search index failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IndexError {
    #[error("search index unavailable: {0}")]
    Unavailable(String),
    #[error("search index rejected request: {0}")]
    Rejected(String),
}

/// Queue or dead-letter destination failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Unavailable(String),
    #[error("queue rejected request: {0}")]
    Rejected(String),
    #[error("operation not supported by this queue backend: {0}")]
    Unsupported(&'static str),
}

/// Error reported by one notifier invocation or one processing attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
    /// The event or message could not be parsed into typed data.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error(transparent)]
    Fetch(FetchError),
    #[error("object store unavailable: {0}")]
    StorageUnavailable(String),
    #[error(transparent)]
    Extraction(#[from] ExtractError),
    #[error("index read failed: {0}")]
    IndexRead(IndexError),
    #[error("index write failed: {0}")]
    IndexWrite(IndexError),
    #[error("enqueue failed: {0}")]
    Enqueue(QueueError),
    #[error("processing attempt exceeded its deadline of {0:?}")]
    Timeout(std::time::Duration),
}

impl PipelineError {
    /// Whether redelivering the same work item could succeed.
    ///
    /// Missing or unreadable objects, unparseable messages, and content that
    /// cannot be extracted fail the same way every time. Deadlines, including
    /// an extractor's own, are transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::MalformedPayload(_) | PipelineError::Fetch(_) => false,
            PipelineError::Extraction(e) => e.is_retryable(),
            PipelineError::StorageUnavailable(_)
            | PipelineError::IndexRead(_)
            | PipelineError::IndexWrite(_)
            | PipelineError::Enqueue(_)
            | PipelineError::Timeout(_) => true,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::MalformedPayload(_) => ErrorKind::MalformedPayload,
            PipelineError::Fetch(_) => ErrorKind::Fetch,
            PipelineError::StorageUnavailable(_) => ErrorKind::StorageUnavailable,
            PipelineError::Extraction(ExtractError::TimedOut { .. }) => ErrorKind::Timeout,
            PipelineError::Extraction(_) => ErrorKind::Extraction,
            PipelineError::IndexRead(_) => ErrorKind::IndexRead,
            PipelineError::IndexWrite(_) => ErrorKind::IndexWrite,
            PipelineError::Enqueue(_) => ErrorKind::Enqueue,
            PipelineError::Timeout(_) => ErrorKind::Timeout,
        }
    }
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Fetch(e) => PipelineError::Fetch(e),
            StoreError::Unavailable(msg) => PipelineError::StorageUnavailable(msg),
        }
    }
}
