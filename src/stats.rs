//! Pipeline counters and the `docrelay status` overview.
//!
//! [`PipelineStats`] is shared by the notifier entry points, the processor,
//! and the HTTP server; `GET /stats` serves a snapshot. [`run_status`]
//! queries the configured backends for queue depth, dead-letter count, and
//! index size.

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use serde::Serialize;

use crate::config::Config;
use crate::pipeline::Pipeline;

/// In-process counters, one per pipeline decision.
#[derive(Debug, Default)]
pub struct PipelineStats {
    enqueued: AtomicU64,
    ignored: AtomicU64,
    processed: AtomicU64,
    indexed: AtomicU64,
    unchanged: AtomicU64,
    superseded: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub enqueued: u64,
    pub ignored: u64,
    pub processed: u64,
    pub indexed: u64,
    pub unchanged: u64,
    pub superseded: u64,
    pub retried: u64,
    pub dead_lettered: u64,
}

/// Which counter to bump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Enqueued,
    Ignored,
    Processed,
    Indexed,
    Unchanged,
    Superseded,
    Retried,
    DeadLettered,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: Counter, n: u64) {
        let cell = match counter {
            Counter::Enqueued => &self.enqueued,
            Counter::Ignored => &self.ignored,
            Counter::Processed => &self.processed,
            Counter::Indexed => &self.indexed,
            Counter::Unchanged => &self.unchanged,
            Counter::Superseded => &self.superseded,
            Counter::Retried => &self.retried,
            Counter::DeadLettered => &self.dead_lettered,
        };
        cell.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            indexed: self.indexed.load(Ordering::Relaxed),
            unchanged: self.unchanged.load(Ordering::Relaxed),
            superseded: self.superseded.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

/// Backend-level counts for `docrelay status`.
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub queue_depth: Option<u64>,
    pub dead_letters: Option<u64>,
    pub index_records: u64,
}

pub async fn backend_status(pipeline: &Pipeline) -> Result<BackendStatus> {
    Ok(BackendStatus {
        queue_depth: pipeline.queue.depth().await?,
        dead_letters: pipeline.dead_letters.count().await?,
        index_records: pipeline.index.count().await?,
    })
}

/// Run the status command: query the backends and print a summary.
pub async fn run_status(config: &Config, pipeline: &Pipeline) -> Result<()> {
    let status = backend_status(pipeline).await?;

    println!("docrelay status");
    println!("===============");
    println!();
    println!("  Storage:       {}", config.storage.backend);
    println!(
        "  Queue:         {} (depth {})",
        config.queue.backend,
        format_opt(status.queue_depth)
    );
    println!("  Dead letters:  {}", format_opt(status.dead_letters));
    println!(
        "  Index:         {} ({} records)",
        config.index.backend, status.index_records
    );
    println!("  Extractors:    {}", pipeline.extractors.names().join(", "));
    println!();

    Ok(())
}

fn format_opt(n: Option<u64>) -> String {
    n.map(|n| n.to_string()).unwrap_or_else(|| "unknown".to_string())
}
