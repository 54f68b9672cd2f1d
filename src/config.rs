//! Configuration parsing and validation.
//!
//! docrelay is configured via a TOML file (default `./config/docrelay.toml`).
//! Every section except `[storage]` has defaults, so a minimal sqlite-backed
//! setup only needs:
//!
//! ```toml
//! [db]
//! path = "./data/docrelay.sqlite"
//!
//! [storage]
//! backend = "filesystem"
//! root = "./objects"
//! ```
//!
//! Backends are chosen by string: `storage.backend` is `s3` or
//! `filesystem`, `queue.backend` is `sqs` or `sqlite`, `index.backend` is
//! `opensearch` or `sqlite`. Backend-specific fields are checked in
//! [`load_config`].

use anyhow::{Context, Result};
use docrelay_core::retry::RetryPolicy;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
    #[serde(default)]
    pub processor: ProcessorConfig,
    #[serde(default)]
    pub ocr: OcrConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// SQLite database shared by the sqlite queue, dead letters, and index.
#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/docrelay.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub backend: String,
    /// Root directory for the filesystem backend; containers are its
    /// subdirectories.
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom S3-compatible endpoint (MinIO, LocalStack). Switches to
    /// path-style addressing.
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(default = "default_sqlite_backend")]
    pub backend: String,
    /// SQS queue URL (required for `sqs`).
    #[serde(default)]
    pub url: Option<String>,
    /// SQS dead-letter queue URL (required for `sqs`).
    #[serde(default)]
    pub dead_letter_url: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_wait_secs")]
    pub wait_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: default_sqlite_backend(),
            url: None,
            dead_letter_url: None,
            region: default_region(),
            endpoint_url: None,
            visibility_timeout_secs: default_visibility_timeout_secs(),
            max_attempts: default_max_attempts(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_max_secs: default_backoff_max_secs(),
            batch_size: default_batch_size(),
            wait_secs: default_wait_secs(),
        }
    }
}

impl QueueConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_secs(self.backoff_base_secs),
            max_delay: Duration::from_secs(self.backoff_max_secs),
        }
    }
}

fn default_sqlite_backend() -> String {
    "sqlite".to_string()
}
fn default_visibility_timeout_secs() -> u64 {
    900
}
fn default_max_attempts() -> u32 {
    5
}
fn default_backoff_base_secs() -> u64 {
    30
}
fn default_backoff_max_secs() -> u64 {
    900
}
fn default_batch_size() -> usize {
    10
}
fn default_wait_secs() -> u64 {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_sqlite_backend")]
    pub backend: String,
    /// OpenSearch endpoint, e.g. `https://search-docs.eu-west-1.es.amazonaws.com`.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_index_name")]
    pub index_name: String,
    /// `none`, `basic`, or `sigv4`.
    #[serde(default = "default_auth")]
    pub auth: String,
    #[serde(default)]
    pub username: Option<String>,
    /// Name of the environment variable holding the basic-auth password.
    #[serde(default)]
    pub password_env: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    /// SigV4 service name: `es` for managed domains, `aoss` for serverless.
    #[serde(default = "default_service")]
    pub service: String,
    /// Use external versioning so older writes cannot overwrite newer ones.
    /// OpenSearch Serverless does not support it.
    #[serde(default = "default_true")]
    pub conditional_writes: bool,
    #[serde(default = "default_request_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            backend: default_sqlite_backend(),
            url: None,
            index_name: default_index_name(),
            auth: default_auth(),
            username: None,
            password_env: None,
            region: default_region(),
            service: default_service(),
            conditional_writes: true,
            timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_index_name() -> String {
    "documents".to_string()
}
fn default_auth() -> String {
    "none".to_string()
}
fn default_service() -> String {
    "es".to_string()
}
fn default_true() -> bool {
    true
}
fn default_request_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct NotifierConfig {
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
        }
    }
}

fn default_include_globs() -> Vec<String> {
    vec!["**".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProcessorConfig {
    /// Deadline for one processing attempt. A whole batch runs on one claim,
    /// so `attempt_timeout_secs * batch_size` must stay below
    /// `queue.visibility_timeout_secs`.
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
    /// Objects larger than this are rejected as corrupt.
    #[serde(default = "default_max_object_bytes")]
    pub max_object_bytes: u64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            attempt_timeout_secs: default_attempt_timeout_secs(),
            max_object_bytes: default_max_object_bytes(),
        }
    }
}

fn default_attempt_timeout_secs() -> u64 {
    60
}
fn default_max_object_bytes() -> u64 {
    50 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct OcrConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_ocr_command")]
    pub command: String,
    /// Arguments; `{language}` is replaced with [`OcrConfig::language`].
    /// Image bytes are written to stdin and text is read from stdout.
    #[serde(default = "default_ocr_args")]
    pub args: Vec<String>,
    #[serde(default = "default_ocr_language")]
    pub language: String,
    #[serde(default = "default_ocr_timeout_secs")]
    pub timeout_secs: u64,
    /// OCR PDFs whose text layer is empty (scanned documents).
    #[serde(default = "default_true")]
    pub pdf_fallback: bool,
    /// Command for scanned PDFs: PDF bytes on stdin, text on stdout.
    /// `{language}` is substituted in `pdf_args` as well.
    #[serde(default = "default_ocr_pdf_command")]
    pub pdf_command: String,
    #[serde(default = "default_ocr_pdf_args")]
    pub pdf_args: Vec<String>,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: default_ocr_command(),
            args: default_ocr_args(),
            language: default_ocr_language(),
            timeout_secs: default_ocr_timeout_secs(),
            pdf_fallback: true,
            pdf_command: default_ocr_pdf_command(),
            pdf_args: default_ocr_pdf_args(),
        }
    }
}

fn default_ocr_command() -> String {
    "tesseract".to_string()
}
fn default_ocr_args() -> Vec<String> {
    ["stdin", "stdout", "-l", "{language}"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_ocr_language() -> String {
    "eng".to_string()
}
fn default_ocr_timeout_secs() -> u64 {
    45
}
fn default_ocr_pdf_command() -> String {
    "sh".to_string()
}
/// Rasterize every page with poppler's `pdftoppm`, then OCR each page.
fn default_ocr_pdf_args() -> Vec<String> {
    vec![
        "-c".to_string(),
        concat!(
            "set -e; d=$(mktemp -d); trap 'rm -rf \"$d\"' EXIT; ",
            "cat > \"$d/in.pdf\"; pdftoppm -r 300 -png \"$d/in.pdf\" \"$d/page\"; ",
            "for p in \"$d\"/page*.png; do tesseract \"$p\" stdout -l {language}; printf '\\n\\n'; done"
        )
        .to_string(),
    ]
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Default filter directive when neither `DOCRELAY_LOG` nor `RUST_LOG`
    /// is set.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `text` or `json`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    // Validate storage
    match config.storage.backend.as_str() {
        "filesystem" => {
            if config.storage.root.is_none() {
                anyhow::bail!("storage.root is required when storage.backend is 'filesystem'");
            }
        }
        "s3" => {}
        other => anyhow::bail!(
            "Unknown storage backend: '{}'. Must be s3 or filesystem.",
            other
        ),
    }

    // Validate queue
    match config.queue.backend.as_str() {
        "sqs" => {
            if config.queue.url.is_none() {
                anyhow::bail!("queue.url is required when queue.backend is 'sqs'");
            }
            if config.queue.dead_letter_url.is_none() {
                anyhow::bail!("queue.dead_letter_url is required when queue.backend is 'sqs'");
            }
        }
        "sqlite" => {}
        other => anyhow::bail!("Unknown queue backend: '{}'. Must be sqs or sqlite.", other),
    }
    if config.queue.max_attempts == 0 {
        anyhow::bail!("queue.max_attempts must be >= 1");
    }
    if config.queue.batch_size == 0 || config.queue.batch_size > 10 {
        anyhow::bail!("queue.batch_size must be in [1, 10]");
    }
    if config.queue.wait_secs > 20 {
        anyhow::bail!("queue.wait_secs must be <= 20");
    }
    if config.queue.backoff_base_secs > config.queue.backoff_max_secs {
        anyhow::bail!("queue.backoff_base_secs must be <= queue.backoff_max_secs");
    }

    // Validate index
    match config.index.backend.as_str() {
        "opensearch" => {
            if config.index.url.is_none() {
                anyhow::bail!("index.url is required when index.backend is 'opensearch'");
            }
        }
        "sqlite" => {}
        other => anyhow::bail!(
            "Unknown index backend: '{}'. Must be opensearch or sqlite.",
            other
        ),
    }
    match config.index.auth.as_str() {
        "none" | "sigv4" => {}
        "basic" => {
            if config.index.username.is_none() || config.index.password_env.is_none() {
                anyhow::bail!("index.username and index.password_env are required for basic auth");
            }
        }
        other => anyhow::bail!(
            "Unknown index auth: '{}'. Must be none, basic, or sigv4.",
            other
        ),
    }

    // Validate processor
    if config.processor.attempt_timeout_secs == 0 {
        anyhow::bail!("processor.attempt_timeout_secs must be > 0");
    }
    // Every delivery in a batch must be settled before its claim lapses.
    let batch_secs = config
        .processor
        .attempt_timeout_secs
        .saturating_mul(config.queue.batch_size as u64);
    if batch_secs >= config.queue.visibility_timeout_secs {
        anyhow::bail!(
            "processor.attempt_timeout_secs ({}) x queue.batch_size ({}) must be below \
             queue.visibility_timeout_secs ({})",
            config.processor.attempt_timeout_secs,
            config.queue.batch_size,
            config.queue.visibility_timeout_secs
        );
    }

    match config.logging.format.as_str() {
        "text" | "json" => {}
        other => anyhow::bail!("Unknown logging format: '{}'. Must be text or json.", other),
    }

    Ok(config)
}
