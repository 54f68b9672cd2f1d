//! OpenSearch search index.
//!
//! Documents are stored under their deterministic record id in the
//! configured index, with the [`IndexRecord`] fields as the `_source`.
//!
//! # Conditional writes
//!
//! With `conditional_writes = true` (the default) every write carries
//! `version=<indexed_at in ms>&version_type=external_gte`, so OpenSearch
//! refuses a write older than the stored document with `409 Conflict`,
//! which is reported as [`UpsertOutcome::Stale`]. OpenSearch Serverless
//! (`service = "aoss"`) does not support external versioning; disable the
//! flag there and writes become last-writer-wins.
//!
//! # Authentication
//!
//! | `auth` | Mechanism |
//! |--------|-----------|
//! | `none` | No credentials (local clusters) |
//! | `basic` | `username` + password from the env var named by `password_env` |
//! | `sigv4` | AWS SigV4 for `service` (`es` or `aoss`), credentials from the environment |
//!
//! The index itself is expected to exist; creating it and its mappings is
//! part of provisioning.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use docrelay_core::error::IndexError;
use docrelay_core::models::IndexRecord;
use docrelay_core::traits::{SearchIndex, UpsertOutcome};
use reqwest::{Method, StatusCode};
use serde::Deserialize;

use crate::aws::{canonical_query, split_endpoint, uri_encode, AwsCredentials, SignableRequest, SigV4Signer};
use crate::config::IndexConfig;

enum Auth {
    None,
    Basic { username: String, password: String },
    SigV4(SigV4Signer),
}

pub struct OpenSearchIndex {
    client: reqwest::Client,
    scheme: String,
    host: String,
    index_name: String,
    auth: Auth,
    conditional_writes: bool,
}

#[derive(Debug, Deserialize)]
struct GetResponse {
    #[serde(default)]
    found: bool,
    #[serde(rename = "_source")]
    source: Option<IndexRecord>,
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    count: u64,
}

impl OpenSearchIndex {
    pub fn from_config(config: &IndexConfig) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .context("index.url is required for opensearch")?;
        let auth = match config.auth.as_str() {
            "basic" => {
                let username = config
                    .username
                    .clone()
                    .context("index.username is required for basic auth")?;
                let var = config
                    .password_env
                    .as_deref()
                    .context("index.password_env is required for basic auth")?;
                let password = std::env::var(var)
                    .with_context(|| format!("{} environment variable not set", var))?;
                Auth::Basic { username, password }
            }
            "sigv4" => Auth::SigV4(SigV4Signer::new(
                AwsCredentials::from_env()?,
                &config.region,
                &config.service,
            )),
            _ => Auth::None,
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self::with_auth(client, url, config, auth))
    }

    fn with_auth(client: reqwest::Client, url: &str, config: &IndexConfig, auth: Auth) -> Self {
        let (scheme, host) = split_endpoint(url);
        Self {
            client,
            scheme: scheme.to_string(),
            host: host.to_string(),
            index_name: config.index_name.clone(),
            auth,
            conditional_writes: config.conditional_writes,
        }
    }

    fn doc_path(&self, id: &str) -> String {
        format!("/{}/_doc/{}", uri_encode(&self.index_name), uri_encode(id))
    }

    fn upsert_query(&self, record: &IndexRecord) -> Vec<(String, String)> {
        if !self.conditional_writes {
            return Vec::new();
        }
        vec![
            (
                "version".to_string(),
                record.indexed_at.timestamp_millis().to_string(),
            ),
            ("version_type".to_string(), "external_gte".to_string()),
        ]
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Option<Vec<u8>>,
    ) -> Result<(StatusCode, String), IndexError> {
        let mut url = format!("{}://{}{}", self.scheme, self.host, path);
        if !query.is_empty() {
            url.push('?');
            url.push_str(&canonical_query(query));
        }

        let mut req = self.client.request(method.clone(), &url);
        let mut extra = Vec::new();
        if body.is_some() {
            extra.push(("content-type".to_string(), "application/json".to_string()));
        }
        for (name, value) in &extra {
            req = req.header(name.as_str(), value.as_str());
        }

        match self.auth {
            Auth::None => {}
            Auth::Basic {
                ref username,
                ref password,
            } => {
                req = req.basic_auth(username, Some(password));
            }
            Auth::SigV4(ref signer) => {
                let payload = body.as_deref().unwrap_or_default();
                for (name, value) in signer.sign(&SignableRequest {
                    method: method.as_str(),
                    host: &self.host,
                    path,
                    query,
                    headers: &extra,
                    payload,
                }) {
                    req = req.header(name, value);
                }
            }
        }
        if let Some(body) = body {
            req = req.body(body);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| IndexError::Unavailable(format!("{} {}: {}", method, path, e)))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| IndexError::Unavailable(format!("{} {}: {}", method, path, e)))?;
        Ok((status, text))
    }
}

fn classify(status: StatusCode, body: &str) -> IndexError {
    let detail = format!(
        "HTTP {}: {}",
        status,
        body.chars().take(500).collect::<String>()
    );
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        IndexError::Unavailable(detail)
    } else {
        IndexError::Rejected(detail)
    }
}

#[async_trait]
impl SearchIndex for OpenSearchIndex {
    async fn get(&self, id: &str) -> Result<Option<IndexRecord>, IndexError> {
        let (status, body) = self.send(Method::GET, &self.doc_path(id), &[], None).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(classify(status, &body));
        }
        let parsed: GetResponse = serde_json::from_str(&body)
            .map_err(|e| IndexError::Rejected(format!("unexpected document shape: {}", e)))?;
        Ok(if parsed.found { parsed.source } else { None })
    }

    async fn upsert(&self, record: &IndexRecord) -> Result<UpsertOutcome, IndexError> {
        let body = serde_json::to_vec(record)
            .map_err(|e| IndexError::Rejected(format!("serializing record: {}", e)))?;
        let query = self.upsert_query(record);
        let (status, text) = self
            .send(Method::PUT, &self.doc_path(&record.id), &query, Some(body))
            .await?;
        match status {
            s if s.is_success() => Ok(UpsertOutcome::Written),
            StatusCode::CONFLICT if self.conditional_writes => Ok(UpsertOutcome::Stale),
            s => Err(classify(s, &text)),
        }
    }

    async fn count(&self) -> Result<u64, IndexError> {
        let path = format!("/{}/_count", uri_encode(&self.index_name));
        let (status, body) = self.send(Method::GET, &path, &[], None).await?;
        if !status.is_success() {
            return Err(classify(status, &body));
        }
        let parsed: CountResponse = serde_json::from_str(&body)
            .map_err(|e| IndexError::Rejected(format!("unexpected count shape: {}", e)))?;
        Ok(parsed.count)
    }
}
