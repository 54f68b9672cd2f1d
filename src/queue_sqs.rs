//! Amazon SQS work queue and dead-letter destination.
//!
//! Speaks the SQS JSON protocol directly over `reqwest`: every call is a
//! signed `POST /` with `X-Amz-Target: AmazonSQS.<Action>` and an
//! `application/x-amz-json-1.0` body. Requests are signed with SigV4 for the
//! `sqs` service ([`crate::aws`]).
//!
//! # Configuration
//!
//! ```toml
//! [queue]
//! backend = "sqs"
//! url = "https://sqs.us-east-1.amazonaws.com/123456789012/docrelay-work"
//! dead_letter_url = "https://sqs.us-east-1.amazonaws.com/123456789012/docrelay-dlq"
//! region = "us-east-1"
//! # endpoint_url = "http://localhost:4566"   # LocalStack
//! ```
//!
//! Backoff is expressed with `ChangeMessageVisibility`; SQS caps a message's
//! visibility timeout at 12 hours.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use docrelay_core::error::QueueError;
use docrelay_core::models::{DeadLetter, Delivery, WorkItem};
use docrelay_core::traits::{DeadLetterSink, WorkQueue};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::aws::{split_endpoint, AwsCredentials, SignableRequest, SigV4Signer};
use crate::config::QueueConfig;

/// Longest visibility timeout SQS accepts.
const MAX_VISIBILITY_SECS: u64 = 43_200;
const MAX_RECEIVE_BATCH: usize = 10;
const MAX_WAIT_SECS: u64 = 20;

/// Signed client for one SQS endpoint.
pub struct SqsClient {
    http: reqwest::Client,
    signer: SigV4Signer,
    scheme: String,
    host: String,
}

impl SqsClient {
    /// `endpoint` is either a custom endpoint URL or any queue URL on the
    /// target endpoint; only its scheme and host are used.
    pub fn new(endpoint: &str, region: &str, credentials: AwsCredentials) -> Self {
        let origin = endpoint
            .split_once("://")
            .map(|(scheme, rest)| {
                let host = rest.split('/').next().unwrap_or(rest);
                format!("{}://{}", scheme, host)
            })
            .unwrap_or_else(|| endpoint.to_string());
        let (scheme, host) = split_endpoint(&origin);
        Self {
            http: reqwest::Client::new(),
            signer: SigV4Signer::new(credentials, region, "sqs"),
            scheme: scheme.to_string(),
            host: host.to_string(),
        }
    }

    /// Invoke one SQS action and return the decoded JSON response.
    pub async fn call(&self, action: &str, body: &Value) -> Result<Value, QueueError> {
        let payload = body.to_string();
        let target = format!("AmazonSQS.{}", action);
        let extra = [
            (
                "content-type".to_string(),
                "application/x-amz-json-1.0".to_string(),
            ),
            ("x-amz-target".to_string(), target.clone()),
        ];
        let signed = self.signer.sign(&SignableRequest {
            method: "POST",
            host: &self.host,
            path: "/",
            query: &[],
            headers: &extra,
            payload: payload.as_bytes(),
        });

        let url = format!("{}://{}/", self.scheme, self.host);
        let mut req = self.http.post(&url).body(payload);
        for (name, value) in extra.iter().chain(signed.iter()) {
            req = req.header(name.as_str(), value.as_str());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| QueueError::Unavailable(format!("{}: {}", action, e)))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| QueueError::Unavailable(format!("{}: {}", action, e)))?;

        if !status.is_success() {
            return Err(classify_error(action, status.as_u16(), &text));
        }
        if text.trim().is_empty() {
            return Ok(Value::Object(Default::default()));
        }
        serde_json::from_str(&text)
            .map_err(|e| QueueError::Unavailable(format!("{}: invalid response: {}", action, e)))
    }

    async fn send_body(&self, queue_url: &str, body: String) -> Result<(), QueueError> {
        self.call(
            "SendMessage",
            &json!({ "QueueUrl": queue_url, "MessageBody": body }),
        )
        .await?;
        Ok(())
    }

    async fn approximate_depth(&self, queue_url: &str) -> Result<Option<u64>, QueueError> {
        let resp = self
            .call(
                "GetQueueAttributes",
                &json!({
                    "QueueUrl": queue_url,
                    "AttributeNames": ["ApproximateNumberOfMessages"],
                }),
            )
            .await?;
        Ok(resp
            .pointer("/Attributes/ApproximateNumberOfMessages")
            .and_then(Value::as_str)
            .and_then(|n| n.parse().ok()))
    }
}

/// Throttling and server faults are worth retrying; anything else the
/// service rejected will be rejected again.
fn classify_error(action: &str, status: u16, body: &str) -> QueueError {
    let parsed: Value = serde_json::from_str(body).unwrap_or(Value::Null);
    let code = parsed
        .get("__type")
        .and_then(Value::as_str)
        .map(|t| t.rsplit('#').next().unwrap_or(t))
        .unwrap_or("Unknown");
    let message = parsed
        .get("message")
        .or_else(|| parsed.get("Message"))
        .and_then(Value::as_str)
        .unwrap_or(body);
    let detail = format!("{} failed (HTTP {} {}): {}", action, status, code, message);

    if status >= 500 || status == 429 || code.contains("Throttl") || code == "RequestThrottled" {
        QueueError::Unavailable(detail)
    } else {
        QueueError::Rejected(detail)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ReceiveResponse {
    #[serde(default)]
    messages: Vec<SqsMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SqsMessage {
    message_id: String,
    receipt_handle: String,
    body: String,
    #[serde(default)]
    attributes: std::collections::HashMap<String, String>,
}

impl SqsMessage {
    fn into_delivery(self) -> Delivery {
        let receive_count = self
            .attributes
            .get("ApproximateReceiveCount")
            .and_then(|n| n.parse().ok())
            .unwrap_or(1);
        Delivery {
            message_id: self.message_id,
            receipt: self.receipt_handle,
            body: self.body,
            receive_count,
        }
    }
}

/// The work queue.
pub struct SqsQueue {
    client: std::sync::Arc<SqsClient>,
    queue_url: String,
    visibility_timeout: Option<Duration>,
}

impl SqsQueue {
    pub fn new(client: std::sync::Arc<SqsClient>, queue_url: impl Into<String>) -> Self {
        Self {
            client,
            queue_url: queue_url.into(),
            visibility_timeout: None,
        }
    }

    /// Claim received messages for this long instead of the queue's
    /// configured default.
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = Some(timeout);
        self
    }

    fn receive_request(&self, max: usize, wait: Duration) -> Value {
        let mut request = json!({
            "QueueUrl": self.queue_url,
            "MaxNumberOfMessages": max.clamp(1, MAX_RECEIVE_BATCH),
            "WaitTimeSeconds": wait.as_secs().min(MAX_WAIT_SECS),
            "AttributeNames": ["ApproximateReceiveCount"],
        });
        if let Some(timeout) = self.visibility_timeout {
            request["VisibilityTimeout"] = json!(timeout.as_secs().min(MAX_VISIBILITY_SECS));
        }
        request
    }
}

#[async_trait]
impl WorkQueue for SqsQueue {
    async fn send(&self, item: &WorkItem) -> Result<(), QueueError> {
        self.client.send_body(&self.queue_url, item.to_json()).await
    }

    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<Delivery>, QueueError> {
        let resp = self
            .client
            .call("ReceiveMessage", &self.receive_request(max, wait))
            .await?;
        let parsed: ReceiveResponse = serde_json::from_value(resp)
            .map_err(|e| QueueError::Unavailable(format!("ReceiveMessage: invalid response: {}", e)))?;
        Ok(parsed
            .messages
            .into_iter()
            .map(SqsMessage::into_delivery)
            .collect())
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.client
            .call(
                "DeleteMessage",
                &json!({ "QueueUrl": self.queue_url, "ReceiptHandle": delivery.receipt }),
            )
            .await?;
        Ok(())
    }

    async fn delay(&self, delivery: &Delivery, delay: Duration) -> Result<(), QueueError> {
        self.client
            .call(
                "ChangeMessageVisibility",
                &json!({
                    "QueueUrl": self.queue_url,
                    "ReceiptHandle": delivery.receipt,
                    "VisibilityTimeout": delay.as_secs().min(MAX_VISIBILITY_SECS),
                }),
            )
            .await?;
        Ok(())
    }

    async fn depth(&self) -> Result<Option<u64>, QueueError> {
        self.client.approximate_depth(&self.queue_url).await
    }
}

/// Dead-letter destination backed by a second SQS queue. Each message body
/// is the JSON-serialized [`DeadLetter`], which embeds the original payload.
pub struct SqsDeadLetters {
    client: std::sync::Arc<SqsClient>,
    queue_url: String,
}

impl SqsDeadLetters {
    pub fn new(client: std::sync::Arc<SqsClient>, queue_url: impl Into<String>) -> Self {
        Self {
            client,
            queue_url: queue_url.into(),
        }
    }
}

#[async_trait]
impl DeadLetterSink for SqsDeadLetters {
    async fn send(&self, letter: &DeadLetter) -> Result<(), QueueError> {
        let body = serde_json::to_string(letter)
            .map_err(|e| QueueError::Rejected(format!("serializing dead letter: {}", e)))?;
        self.client.send_body(&self.queue_url, body).await
    }

    async fn count(&self) -> Result<Option<u64>, QueueError> {
        self.client.approximate_depth(&self.queue_url).await
    }
}

/// Build the work queue and dead-letter destination from `[queue]`.
pub fn from_config(config: &QueueConfig) -> Result<(SqsQueue, SqsDeadLetters)> {
    let queue_url = config.url.clone().context("queue.url is required for sqs")?;
    let dlq_url = config
        .dead_letter_url
        .clone()
        .context("queue.dead_letter_url is required for sqs")?;
    let credentials = AwsCredentials::from_env()?;
    let endpoint = config.endpoint_url.as_deref().unwrap_or(&queue_url);
    let client = std::sync::Arc::new(SqsClient::new(endpoint, &config.region, credentials));
    Ok((
        SqsQueue::new(client.clone(), queue_url)
            .with_visibility_timeout(Duration::from_secs(config.visibility_timeout_secs)),
        SqsDeadLetters::new(client, dlq_url),
    ))
}
