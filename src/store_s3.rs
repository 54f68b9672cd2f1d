//! Amazon S3 object store.
//!
//! Fetches and lists objects using the S3 REST API with AWS Signature V4
//! authentication ([`crate::aws`]). Supports custom endpoints for
//! S3-compatible services (MinIO, LocalStack).
//!
//! # Configuration
//!
//! ```toml
//! [storage]
//! backend = "s3"
//! region = "us-east-1"
//! # endpoint_url = "http://localhost:9000"   # MinIO
//! ```
//!
//! # Addressing
//!
//! On AWS, requests use virtual-hosted style
//! (`https://<bucket>.s3.<region>.amazonaws.com/<key>`). With a custom
//! `endpoint_url` they switch to path style (`<endpoint>/<bucket>/<key>`),
//! which is what MinIO and LocalStack expect.
//!
//! # Error Mapping
//!
//! | Response | Error |
//! |----------|-------|
//! | 404 | [`FetchError::NotFound`] (permanent) |
//! | 403 | [`FetchError::AccessDenied`] (permanent) |
//! | other status, transport failure | [`StoreError::Unavailable`] (retryable) |

use anyhow::Result;
use async_trait::async_trait;
use docrelay_core::error::{FetchError, StoreError};
use docrelay_core::models::SourceLocator;
use docrelay_core::traits::{FetchedObject, ObjectStore};
use quick_xml::events::Event;
use reqwest::StatusCode;

use crate::aws::{canonical_query, encode_path, split_endpoint, AwsCredentials, SignableRequest, SigV4Signer};
use crate::config::StorageConfig;

pub struct S3ObjectStore {
    client: reqwest::Client,
    signer: SigV4Signer,
    endpoint_url: Option<String>,
}

/// Where a request for one bucket goes.
#[derive(Debug, PartialEq, Eq)]
struct Target {
    scheme: String,
    host: String,
    /// Path prefix before the key: `""` (virtual-hosted) or `/<bucket>`.
    base_path: String,
}

impl S3ObjectStore {
    /// Build a store using credentials from the environment.
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        let credentials = AwsCredentials::from_env()?;
        Ok(Self::new(config, credentials))
    }

    pub fn new(config: &StorageConfig, credentials: AwsCredentials) -> Self {
        Self {
            client: reqwest::Client::new(),
            signer: SigV4Signer::new(credentials, &config.region, "s3"),
            endpoint_url: config.endpoint_url.clone(),
        }
    }

    fn target(&self, bucket: &str) -> Target {
        match self.endpoint_url {
            Some(ref endpoint) => {
                let (scheme, host) = split_endpoint(endpoint);
                Target {
                    scheme: scheme.to_string(),
                    host: host.to_string(),
                    base_path: format!("/{}", crate::aws::uri_encode(bucket)),
                }
            }
            None => Target {
                scheme: "https".to_string(),
                host: format!("{}.s3.{}.amazonaws.com", bucket, self.signer.region),
                base_path: String::new(),
            },
        }
    }

    async fn signed_get(
        &self,
        target: &Target,
        path: &str,
        query: &[(String, String)],
    ) -> Result<reqwest::Response, StoreError> {
        let headers = self.signer.sign(&SignableRequest {
            method: "GET",
            host: &target.host,
            path,
            query,
            headers: &[],
            payload: b"",
        });

        let mut url = format!("{}://{}{}", target.scheme, target.host, path);
        if !query.is_empty() {
            url.push('?');
            url.push_str(&canonical_query(query));
        }

        let mut req = self.client.get(&url);
        for (name, value) in &headers {
            req = req.header(name.as_str(), value.as_str());
        }
        req.send()
            .await
            .map_err(|e| StoreError::Unavailable(format!("GET {}: {}", url, e)))
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn fetch(&self, locator: &SourceLocator) -> Result<FetchedObject, StoreError> {
        let target = self.target(&locator.container);
        let path = format!("{}/{}", target.base_path, encode_path(&locator.key));
        let resp = self.signed_get(&target, &path, &[]).await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(classify_status(status, locator));
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| StoreError::Unavailable(format!("reading s3://{}: {}", locator, e)))?;

        Ok(FetchedObject {
            bytes: bytes.to_vec(),
            content_type,
        })
    }

    /// `ListObjectsV2`, following continuation tokens until the listing is
    /// complete.
    async fn list(&self, container: &str, prefix: &str) -> Result<Vec<String>, StoreError> {
        let target = self.target(container);
        let path = if target.base_path.is_empty() {
            "/".to_string()
        } else {
            target.base_path.clone()
        };

        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;
        loop {
            let mut query = vec![
                ("list-type".to_string(), "2".to_string()),
                ("max-keys".to_string(), "1000".to_string()),
            ];
            if !prefix.is_empty() {
                query.push(("prefix".to_string(), prefix.to_string()));
            }
            if let Some(ref token) = continuation_token {
                query.push(("continuation-token".to_string(), token.clone()));
            }

            let resp = self.signed_get(&target, &path, &query).await?;
            let status = resp.status();
            let body = resp.text().await.map_err(|e| {
                StoreError::Unavailable(format!("reading ListObjectsV2 response: {}", e))
            })?;
            if !status.is_success() {
                let locator = SourceLocator::new(container, prefix);
                return Err(match status {
                    StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
                        classify_status(status, &locator)
                    }
                    _ => StoreError::Unavailable(format!(
                        "S3 ListObjectsV2 failed (HTTP {}): {}",
                        status,
                        body.chars().take(500).collect::<String>()
                    )),
                });
            }

            let page = parse_list_objects_response(&body)?;
            keys.extend(page.keys);
            match page.next_token {
                Some(token) => continuation_token = Some(token),
                None => break,
            }
        }

        keys.sort();
        Ok(keys)
    }
}

fn classify_status(status: StatusCode, locator: &SourceLocator) -> StoreError {
    match status {
        StatusCode::NOT_FOUND => FetchError::NotFound(locator.to_string()).into(),
        StatusCode::FORBIDDEN => FetchError::AccessDenied(locator.to_string()).into(),
        other => StoreError::Unavailable(format!("S3 returned HTTP {} for {}", other, locator)),
    }
}

/// One page of a `ListObjectsV2` listing.
#[derive(Debug, Default, PartialEq)]
struct ListPage {
    keys: Vec<String>,
    /// Set only when the listing is truncated.
    next_token: Option<String>,
}

/// Parse a `ListObjectsV2` XML response. "Directory" placeholder keys
/// ending in `/` are skipped.
fn parse_list_objects_response(xml: &str) -> Result<ListPage, StoreError> {
    let mut reader = quick_xml::Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut page = ListPage::default();
    let mut truncated = false;
    let mut in_contents = false;
    let mut current: Vec<u8> = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = e.local_name();
                if name.as_ref() == b"Contents" {
                    in_contents = true;
                }
                current = name.as_ref().to_vec();
            }
            Ok(Event::End(e)) => {
                if e.local_name().as_ref() == b"Contents" {
                    in_contents = false;
                }
                current.clear();
            }
            Ok(Event::Text(te)) => {
                let text = te
                    .unescape()
                    .map_err(|e| StoreError::Unavailable(format!("bad ListObjectsV2 XML: {}", e)))?;
                match current.as_slice() {
                    b"Key" if in_contents => {
                        if !text.ends_with('/') {
                            page.keys.push(text.into_owned());
                        }
                    }
                    b"IsTruncated" => truncated = text.as_ref() == "true",
                    b"NextContinuationToken" => page.next_token = Some(text.into_owned()),
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(StoreError::Unavailable(format!(
                    "bad ListObjectsV2 XML: {}",
                    e
                )))
            }
            _ => {}
        }
    }

    if !truncated {
        page.next_token = None;
    }
    Ok(page)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(endpoint: Option<&str>) -> S3ObjectStore {
        let config = StorageConfig {
            backend: "s3".into(),
            root: None,
            region: "eu-west-1".into(),
            endpoint_url: endpoint.map(str::to_string),
        };
        S3ObjectStore::new(
            &config,
            AwsCredentials {
                access_key_id: "AKID".into(),
                secret_access_key: "secret".into(),
                session_token: None,
            },
        )
    }

    #[test]
    fn aws_uses_virtual_hosted_style() {
        let t = store(None).target("docs");
        assert_eq!(t.scheme, "https");
        assert_eq!(t.host, "docs.s3.eu-west-1.amazonaws.com");
        assert_eq!(t.base_path, "");
    }

    #[test]
    fn custom_endpoint_uses_path_style_and_keeps_scheme() {
        let t = store(Some("http://localhost:9000/")).target("docs");
        assert_eq!(t.scheme, "http");
        assert_eq!(t.host, "localhost:9000");
        assert_eq!(t.base_path, "/docs");
    }

    #[test]
    fn status_codes_map_to_error_classes() {
        let loc = SourceLocator::new("docs", "a.pdf");
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND, &loc),
            StoreError::Fetch(FetchError::NotFound("docs/a.pdf".into()))
        );
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN, &loc),
            StoreError::Fetch(FetchError::AccessDenied("docs/a.pdf".into()))
        );
        assert!(matches!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE, &loc),
            StoreError::Unavailable(_)
        ));
    }

    #[test]
    fn parses_truncated_listing() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Name>docs</Name>
  <IsTruncated>true</IsTruncated>
  <Contents><Key>reports/</Key><Size>0</Size></Contents>
  <Contents><Key>reports/q1 &amp; q2.pdf</Key><Size>1024</Size></Contents>
  <Contents><Key>scans/001.png</Key><Size>2048</Size></Contents>
  <NextContinuationToken>abc==</NextContinuationToken>
</ListBucketResult>"#;
        let page = parse_list_objects_response(xml).unwrap();
        assert_eq!(page.keys, vec!["reports/q1 & q2.pdf", "scans/001.png"]);
        assert_eq!(page.next_token.as_deref(), Some("abc=="));
    }

    #[test]
    fn final_page_has_no_token() {
        let xml = r#"<ListBucketResult><IsTruncated>false</IsTruncated>
<Contents><Key>a.txt</Key></Contents></ListBucketResult>"#;
        let page = parse_list_objects_response(xml).unwrap();
        assert_eq!(page.keys, vec!["a.txt"]);
        assert_eq!(page.next_token, None);
    }
}
