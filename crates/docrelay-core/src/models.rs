//! Core data models used throughout docrelay.
//!
//! These types represent the work items, extracted documents, and index
//! records that flow from a storage notification through the queue into the
//! search index.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::PipelineError;

/// Opaque reference to a stored object: a container (bucket) plus an
/// object key.
///
/// The canonical string form is `"{container}/{key}"`, e.g. `docs/a.pdf`.
/// Keys may contain further `/` separators; the container never does.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SourceLocator {
    pub container: String,
    pub key: String,
}

impl SourceLocator {
    pub fn new(container: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            key: key.into(),
        }
    }

    /// Deterministic [`IndexRecord`] id for this locator.
    pub fn record_id(&self) -> String {
        record_id(self)
    }
}

impl fmt::Display for SourceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.container, self.key)
    }
}

impl FromStr for SourceLocator {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((container, key)) if !container.is_empty() && !key.is_empty() => {
                Ok(Self::new(container, key))
            }
            _ => Err(PipelineError::MalformedPayload(format!(
                "invalid source locator '{}': expected <container>/<key>",
                s
            ))),
        }
    }
}

impl TryFrom<String> for SourceLocator {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SourceLocator> for String {
    fn from(value: SourceLocator) -> Self {
        value.to_string()
    }
}

/// Derive the index record id for a locator: hex SHA-256 of its canonical
/// string form. Stable across processes and releases.
pub fn record_id(locator: &SourceLocator) -> String {
    hex_sha256(locator.to_string().as_bytes())
}

/// Hex SHA-256 of extracted content, used for the no-op skip.
pub fn content_hash(content: &str) -> String {
    hex_sha256(content.as_bytes())
}

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Kind of object-storage event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventType {
    Created,
    Removed,
    Other(String),
}

/// A normalized new-object (or other) notification from object storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub container_name: String,
    pub object_key: String,
    pub event_type: EventType,
}

impl StorageEvent {
    pub fn created(container_name: impl Into<String>, object_key: impl Into<String>) -> Self {
        Self {
            container_name: container_name.into(),
            object_key: object_key.into(),
            event_type: EventType::Created,
        }
    }

    pub fn locator(&self) -> SourceLocator {
        SourceLocator::new(&self.container_name, &self.object_key)
    }
}

/// One file requiring processing, as carried on the queue.
///
/// Serialized as `{"sourceLocator", "receivedAt", "attemptCount"}`.
/// Unknown fields are ignored so newer producers can add to the message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    pub source_locator: SourceLocator,
    pub received_at: DateTime<Utc>,
    #[serde(default)]
    pub attempt_count: u32,
}

impl WorkItem {
    pub fn new(source_locator: SourceLocator, received_at: DateTime<Utc>) -> Self {
        Self {
            source_locator,
            received_at,
            attempt_count: 0,
        }
    }

    pub fn to_json(&self) -> String {
        // Serializing a struct of strings and integers cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(body: &str) -> Result<Self, PipelineError> {
        serde_json::from_str(body)
            .map_err(|e| PipelineError::MalformedPayload(format!("invalid work item: {}", e)))
    }
}

/// Result of content extraction for one processing attempt. Never persisted.
#[derive(Debug, Clone)]
pub struct ExtractedDocument {
    pub source_locator: SourceLocator,
    pub content_type: String,
    pub text_segments: Vec<String>,
    pub extracted_at: DateTime<Utc>,
}

impl ExtractedDocument {
    /// Segments joined by a blank line. Zero segments yield `""`.
    pub fn content(&self) -> String {
        self.text_segments.join("\n\n")
    }
}

/// The durable, deterministically keyed search-index entry for a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexRecord {
    pub id: String,
    pub source_locator: SourceLocator,
    pub content: String,
    pub content_hash: String,
    pub content_type: String,
    pub indexed_at: DateTime<Utc>,
}

impl IndexRecord {
    pub fn from_extracted(doc: &ExtractedDocument, indexed_at: DateTime<Utc>) -> Self {
        let content = doc.content();
        Self {
            id: record_id(&doc.source_locator),
            source_locator: doc.source_locator.clone(),
            content_hash: content_hash(&content),
            content,
            content_type: doc.content_type.clone(),
            indexed_at,
        }
    }
}

/// A claimed queue message.
///
/// `receipt` identifies this particular claim (SQS receipt handle); it is
/// what acknowledgement and visibility changes are keyed on.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub message_id: String,
    pub receipt: String,
    pub body: String,
    /// How many times the queue has handed this message out, including this
    /// delivery. Always >= 1.
    pub receive_count: u32,
}

impl Delivery {
    /// Parse the body into a [`WorkItem`] whose `attempt_count` reflects the
    /// number of earlier deliveries.
    pub fn work_item(&self) -> Result<WorkItem, PipelineError> {
        let mut item = WorkItem::from_json(&self.body)?;
        item.attempt_count = self.receive_count.saturating_sub(1);
        Ok(item)
    }
}

/// Machine-readable reason a message was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MalformedPayload,
    Fetch,
    StorageUnavailable,
    Extraction,
    IndexRead,
    IndexWrite,
    Enqueue,
    Timeout,
    RetriesExhausted,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MalformedPayload => "malformed_payload",
            ErrorKind::Fetch => "fetch",
            ErrorKind::StorageUnavailable => "storage_unavailable",
            ErrorKind::Extraction => "extraction",
            ErrorKind::IndexRead => "index_read",
            ErrorKind::IndexWrite => "index_write",
            ErrorKind::Enqueue => "enqueue",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RetriesExhausted => "retries_exhausted",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| format!("unknown error kind: {}", s))
    }
}

/// A message parked for manual inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub message_id: String,
    /// The original message body, verbatim.
    pub payload: String,
    pub source_locator: Option<SourceLocator>,
    pub error_kind: ErrorKind,
    pub reason: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    /// Recover the work item for a redrive, with a fresh attempt count.
    pub fn work_item(&self) -> Option<WorkItem> {
        let mut item = WorkItem::from_json(&self.payload).ok()?;
        item.attempt_count = 0;
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locator_round_trips_through_its_string_form() {
        let loc: SourceLocator = "docs/reports/2024/q1.pdf".parse().unwrap();
        assert_eq!(loc.container, "docs");
        assert_eq!(loc.key, "reports/2024/q1.pdf");
        assert_eq!(loc.to_string(), "docs/reports/2024/q1.pdf");
    }

    #[test]
    fn locator_rejects_missing_parts() {
        assert!("docs".parse::<SourceLocator>().is_err());
        assert!("/a.pdf".parse::<SourceLocator>().is_err());
        assert!("docs/".parse::<SourceLocator>().is_err());
    }

    #[test]
    fn record_id_is_sha256_of_locator() {
        let loc = SourceLocator::new("docs", "a.pdf");
        let mut hasher = Sha256::new();
        hasher.update(b"docs/a.pdf");
        assert_eq!(loc.record_id(), hex::encode(hasher.finalize()));
        assert_eq!(loc.record_id(), SourceLocator::new("docs", "a.pdf").record_id());
        assert_ne!(loc.record_id(), SourceLocator::new("docs", "b.pdf").record_id());
    }

    #[test]
    fn work_item_wire_format() {
        let item = WorkItem::new(
            SourceLocator::new("docs", "a.pdf"),
            DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        );
        let json: serde_json::Value = serde_json::from_str(&item.to_json()).unwrap();
        assert_eq!(json["sourceLocator"], "docs/a.pdf");
        assert_eq!(json["attemptCount"], 0);
        assert!(json["receivedAt"].as_str().unwrap().starts_with("2024-05-01T10:00:00"));
    }

    #[test]
    fn work_item_tolerates_unknown_fields_and_missing_attempts() {
        let item = WorkItem::from_json(
            r#"{"sourceLocator":"docs/a.pdf","receivedAt":"2024-05-01T10:00:00Z","producer":"v2","priority":3}"#,
        )
        .unwrap();
        assert_eq!(item.source_locator, SourceLocator::new("docs", "a.pdf"));
        assert_eq!(item.attempt_count, 0);
    }

    #[test]
    fn work_item_rejects_bad_locator() {
        let err = WorkItem::from_json(r#"{"sourceLocator":"nokey","receivedAt":"2024-05-01T10:00:00Z"}"#)
            .unwrap_err();
        assert!(matches!(err, PipelineError::MalformedPayload(_)));
    }

    #[test]
    fn delivery_derives_attempt_count_from_receive_count() {
        let delivery = Delivery {
            message_id: "m1".into(),
            receipt: "r1".into(),
            body: r#"{"sourceLocator":"docs/a.pdf","receivedAt":"2024-05-01T10:00:00Z","attemptCount":0}"#.into(),
            receive_count: 3,
        };
        assert_eq!(delivery.work_item().unwrap().attempt_count, 2);
    }

    #[test]
    fn empty_document_has_empty_content() {
        let doc = ExtractedDocument {
            source_locator: SourceLocator::new("docs", "blank.png"),
            content_type: "image/png".into(),
            text_segments: vec![],
            extracted_at: Utc::now(),
        };
        let record = IndexRecord::from_extracted(&doc, Utc::now());
        assert_eq!(record.content, "");
        assert_eq!(record.content_hash, content_hash(""));
    }

    #[test]
    fn error_kind_parses_from_snake_case() {
        assert_eq!("retries_exhausted".parse::<ErrorKind>().unwrap(), ErrorKind::RetriesExhausted);
        assert!("nope".parse::<ErrorKind>().is_err());
    }
}
