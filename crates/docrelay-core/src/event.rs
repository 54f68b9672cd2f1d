//! Parsing of object-storage notifications into [`StorageEvent`]s.
//!
//! Two payload shapes are accepted:
//!
//! - S3 event notifications: `{"Records": [{"eventName": "ObjectCreated:Put",
//!   "s3": {"bucket": {"name": ..}, "object": {"key": ..}}}]}`. Keys arrive
//!   URL-encoded with `+` for spaces and are decoded here. The one-off
//!   `s3:TestEvent` sent when a notification is configured yields no events.
//! - A single normalized event: `{"containerName", "objectKey", "eventType"}`.
//!
//! Anything else is a [`PipelineError::MalformedPayload`]; untyped data never
//! travels further into the pipeline.

use serde::Deserialize;

use crate::error::PipelineError;
use crate::models::{EventType, StorageEvent};

#[derive(Deserialize)]
#[serde(untagged)]
enum Notification {
    S3(S3Notification),
    Test(S3TestEvent),
    Normalized(NormalizedEvent),
}

#[derive(Deserialize)]
struct S3Notification {
    #[serde(rename = "Records")]
    records: Vec<S3Record>,
}

#[derive(Deserialize)]
struct S3TestEvent {
    #[serde(rename = "Event")]
    event: String,
}

#[derive(Deserialize)]
struct S3Record {
    #[serde(rename = "eventName")]
    event_name: String,
    s3: S3Entity,
}

#[derive(Deserialize)]
struct S3Entity {
    bucket: S3Bucket,
    object: S3Object,
}

#[derive(Deserialize)]
struct S3Bucket {
    name: String,
}

#[derive(Deserialize)]
struct S3Object {
    key: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NormalizedEvent {
    container_name: String,
    object_key: String,
    event_type: String,
}

/// Parse a notification payload into zero or more storage events.
pub fn parse_notification(payload: &str) -> Result<Vec<StorageEvent>, PipelineError> {
    let notification: Notification = serde_json::from_str(payload).map_err(|e| {
        PipelineError::MalformedPayload(format!("unrecognized storage notification: {}", e))
    })?;

    match notification {
        Notification::S3(n) => n
            .records
            .into_iter()
            .map(|r| {
                if r.s3.bucket.name.is_empty() || r.s3.object.key.is_empty() {
                    return Err(PipelineError::MalformedPayload(
                        "S3 record missing bucket name or object key".to_string(),
                    ));
                }
                Ok(StorageEvent {
                    container_name: r.s3.bucket.name,
                    object_key: decode_object_key(&r.s3.object.key)?,
                    event_type: s3_event_type(&r.event_name),
                })
            })
            .collect(),
        Notification::Test(t) if t.event == "s3:TestEvent" => Ok(Vec::new()),
        Notification::Test(t) => Err(PipelineError::MalformedPayload(format!(
            "unrecognized S3 service event: {}",
            t.event
        ))),
        Notification::Normalized(e) => {
            if e.container_name.is_empty() || e.object_key.is_empty() {
                return Err(PipelineError::MalformedPayload(
                    "event missing containerName or objectKey".to_string(),
                ));
            }
            Ok(vec![StorageEvent {
                container_name: e.container_name,
                object_key: e.object_key,
                event_type: parse_event_type(&e.event_type),
            }])
        }
    }
}

/// Map an S3 `eventName` (`ObjectCreated:Put`, `ObjectRemoved:Delete`, ...).
fn s3_event_type(event_name: &str) -> EventType {
    let name = event_name.trim_start_matches("s3:");
    if name.starts_with("ObjectCreated:") {
        EventType::Created
    } else if name.starts_with("ObjectRemoved:") {
        EventType::Removed
    } else {
        EventType::Other(event_name.to_string())
    }
}

/// Map a normalized event type name, case-insensitively.
pub fn parse_event_type(name: &str) -> EventType {
    match name.to_ascii_lowercase().as_str() {
        "created" => EventType::Created,
        "removed" | "deleted" => EventType::Removed,
        _ => EventType::Other(name.to_string()),
    }
}

/// Decode an S3 notification object key (form-style URL encoding).
fn decode_object_key(raw: &str) -> Result<String, PipelineError> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                let byte = match (hex_digit(bytes[i + 1]), hex_digit(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => hi << 4 | lo,
                    _ => {
                        return Err(PipelineError::MalformedPayload(format!(
                            "invalid escape in object key: {}",
                            raw
                        )))
                    }
                };
                out.push(byte);
                i += 3;
            }
            b'%' => {
                return Err(PipelineError::MalformedPayload(format!(
                    "truncated escape in object key: {}",
                    raw
                )))
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out)
        .map_err(|_| PipelineError::MalformedPayload(format!("object key is not UTF-8: {}", raw)))
}

fn hex_digit(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|d| d as u8)
}
