//! Backend wiring.
//!
//! Every command builds one [`Pipeline`] from the config: one object store,
//! one work queue, one dead-letter sink, one search index, and the extractor
//! registry. The notifier and processor receive `Arc`s of these, so clients
//! and connection pools are created once per process and shared.
//!
//! | Concern | `sqlite` / `filesystem` | AWS |
//! |---------|-------------------------|-----|
//! | store | [`FsObjectStore`] | [`S3ObjectStore`] |
//! | queue + dead letters | [`SqliteQueue`], [`SqliteDeadLetters`] | [`SqsQueue`], [`SqsDeadLetters`] |
//! | index | [`SqliteIndex`] | [`OpenSearchIndex`] |

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use docrelay_core::extract::{ExtractorRegistry, ScannedPdfFallback, TextExtractor};
use docrelay_core::traits::{DeadLetterSink, ObjectStore, SearchIndex, WorkQueue};
use sqlx::SqlitePool;

use crate::config::Config;
use crate::extract::{DocumentExtractor, PlainTextExtractor};
use crate::extract_ocr::OcrExtractor;
use crate::index_opensearch::OpenSearchIndex;
use crate::index_sqlite::SqliteIndex;
use crate::notifier::{IngestNotifier, KeyFilter};
use crate::processor::QueueProcessor;
use crate::queue_sqlite::{SqliteDeadLetters, SqliteQueue};
use crate::queue_sqs::{self, SqsQueue};
use crate::stats::PipelineStats;
use crate::store_fs::FsObjectStore;
use crate::store_s3::S3ObjectStore;
use crate::{db, migrate};

#[derive(Clone)]
pub struct Pipeline {
    pub store: Arc<dyn ObjectStore>,
    pub queue: Arc<dyn WorkQueue>,
    pub dead_letters: Arc<dyn DeadLetterSink>,
    pub index: Arc<dyn SearchIndex>,
    pub extractors: ExtractorRegistry,
    pub stats: Arc<PipelineStats>,
}

impl Pipeline {
    /// Build every backend named in `config`. The sqlite database is
    /// opened (and migrated) only when some backend needs it.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let needs_db = config.queue.backend == "sqlite" || config.index.backend == "sqlite";
        let pool = if needs_db {
            let pool = db::connect(config).await?;
            migrate::migrate(&pool).await?;
            Some(pool)
        } else {
            None
        };

        let store = build_store(config)?;
        let (queue, dead_letters) = build_queue(config, pool.as_ref())?;
        let index = build_index(config, pool.as_ref())?;

        Ok(Self {
            store,
            queue,
            dead_letters,
            index,
            extractors: build_extractors(config),
            stats: Arc::new(PipelineStats::new()),
        })
    }

    pub fn notifier(&self, config: &Config) -> Result<IngestNotifier> {
        let filter = KeyFilter::from_config(&config.notifier)
            .context("invalid notifier glob pattern")?;
        Ok(IngestNotifier::new(self.queue.clone(), filter).with_stats(self.stats.clone()))
    }

    pub fn processor(&self, config: &Config) -> QueueProcessor {
        QueueProcessor::new(
            self.store.clone(),
            self.extractors.clone(),
            self.index.clone(),
            self.dead_letters.clone(),
        )
        .with_policy(config.queue.retry_policy())
        .with_attempt_timeout(Duration::from_secs(config.processor.attempt_timeout_secs))
        .with_max_object_bytes(config.processor.max_object_bytes)
        .with_stats(self.stats.clone())
    }
}

fn build_store(config: &Config) -> Result<Arc<dyn ObjectStore>> {
    match config.storage.backend.as_str() {
        "filesystem" => {
            let root = config
                .storage
                .root
                .clone()
                .context("storage.root is required for the filesystem backend")?;
            Ok(Arc::new(FsObjectStore::new(root)))
        }
        "s3" => Ok(Arc::new(S3ObjectStore::from_config(&config.storage)?)),
        other => bail!("unknown storage backend '{}'", other),
    }
}

fn build_queue(
    config: &Config,
    pool: Option<&SqlitePool>,
) -> Result<(Arc<dyn WorkQueue>, Arc<dyn DeadLetterSink>)> {
    match config.queue.backend.as_str() {
        "sqlite" => {
            let pool = pool.context("sqlite queue requires a database")?;
            let visibility = Duration::from_secs(config.queue.visibility_timeout_secs);
            Ok((
                Arc::new(SqliteQueue::new(pool.clone(), visibility)),
                Arc::new(SqliteDeadLetters::new(pool.clone())),
            ))
        }
        "sqs" => {
            let (queue, dead_letters): (SqsQueue, _) = queue_sqs::from_config(&config.queue)?;
            Ok((Arc::new(queue), Arc::new(dead_letters)))
        }
        other => bail!("unknown queue backend '{}'", other),
    }
}

fn build_index(config: &Config, pool: Option<&SqlitePool>) -> Result<Arc<dyn SearchIndex>> {
    match config.index.backend.as_str() {
        "sqlite" => {
            let pool = pool.context("sqlite index requires a database")?;
            Ok(Arc::new(SqliteIndex::new(pool.clone())))
        }
        "opensearch" => Ok(Arc::new(OpenSearchIndex::from_config(&config.index)?)),
        other => bail!("unknown index backend '{}'", other),
    }
}

/// Plain text first, then office documents, then OCR for images. With OCR
/// enabled, PDFs without a text layer are OCR'd as well.
pub fn build_extractors(config: &Config) -> ExtractorRegistry {
    let registry = ExtractorRegistry::new().with(Arc::new(PlainTextExtractor));
    if !config.ocr.enabled {
        return registry.with(Arc::new(DocumentExtractor));
    }

    let ocr: Arc<dyn TextExtractor> = Arc::new(OcrExtractor::from_config(&config.ocr));
    let documents: Arc<dyn TextExtractor> = if config.ocr.pdf_fallback {
        Arc::new(ScannedPdfFallback::new(Arc::new(DocumentExtractor), ocr.clone()))
    } else {
        Arc::new(DocumentExtractor)
    };
    registry.with(documents).with(ocr)
}
