//! Dead-letter inspection and redrive.
//!
//! `docrelay dead-letters list` prints the most recent dead letters.
//! `docrelay dead-letters redrive` sends each recoverable one back to the
//! work queue with a fresh attempt count and then removes it. Letters whose
//! payload cannot be parsed into a work item stay where they are.
//!
//! Both operations need a sink that supports listing (the sqlite backend);
//! on SQS use the console or a redrive policy instead.

use anyhow::Result;
use docrelay_core::models::DeadLetter;
use docrelay_core::traits::{DeadLetterSink, WorkQueue};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RedriveSummary {
    pub redriven: usize,
    pub skipped: usize,
}

pub async fn list_dead_letters(sink: &dyn DeadLetterSink, limit: usize) -> Result<Vec<DeadLetter>> {
    Ok(sink.list(limit).await?)
}

/// Re-enqueue up to `limit` dead letters. A letter is removed only after
/// its work item has been sent.
pub async fn redrive(
    sink: &dyn DeadLetterSink,
    queue: &dyn WorkQueue,
    limit: usize,
) -> Result<RedriveSummary> {
    let letters = sink.list(limit).await?;
    let mut summary = RedriveSummary::default();

    for letter in &letters {
        let Some(item) = letter.work_item() else {
            warn!(message_id = %letter.message_id, "payload is not a work item, leaving in place");
            summary.skipped += 1;
            continue;
        };
        queue.send(&item).await?;
        sink.remove(&letter.message_id).await?;
        info!(
            message_id = %letter.message_id,
            source_locator = %item.source_locator,
            "redriven"
        );
        summary.redriven += 1;
    }
    Ok(summary)
}

pub async fn run_list(sink: &dyn DeadLetterSink, limit: usize) -> Result<()> {
    let letters = list_dead_letters(sink, limit).await?;
    if letters.is_empty() {
        println!("No dead letters.");
        return Ok(());
    }

    println!("{} dead letter(s):", letters.len());
    println!();
    for letter in &letters {
        let locator = letter
            .source_locator
            .as_ref()
            .map(|l| l.to_string())
            .unwrap_or_else(|| "(unparseable payload)".to_string());
        println!("{}  {}", letter.failed_at.format("%Y-%m-%d %H:%M:%S"), locator);
        println!("    message_id: {}", letter.message_id);
        println!("    error:      {} after {} attempt(s)", letter.error_kind, letter.attempts);
        println!("    reason:     {}", letter.reason);
    }
    Ok(())
}

pub async fn run_redrive(sink: &dyn DeadLetterSink, queue: &dyn WorkQueue, limit: usize) -> Result<()> {
    let summary = redrive(sink, queue, limit).await?;
    println!(
        "Redrive complete: {} re-enqueued, {} skipped",
        summary.redriven, summary.skipped
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use docrelay_core::memory::{MemoryDeadLetters, MemoryQueue};
    use docrelay_core::models::{ErrorKind, SourceLocator, WorkItem};

    fn letter(id: &str, payload: String) -> DeadLetter {
        DeadLetter {
            message_id: id.into(),
            payload,
            source_locator: None,
            error_kind: ErrorKind::Fetch,
            reason: "object not found".into(),
            attempts: 1,
            failed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn redrive_requeues_with_fresh_attempts_and_skips_garbage() {
        let sink = MemoryDeadLetters::new();
        let queue = MemoryQueue::default();
        let mut item = WorkItem::new(SourceLocator::new("docs", "a.pdf"), Utc::now());
        item.attempt_count = 4;
        sink.send(&letter("m1", item.to_json())).await.unwrap();
        sink.send(&letter("m2", "not json".into())).await.unwrap();

        let summary = redrive(&sink, &queue, 10).await.unwrap();
        assert_eq!(summary, RedriveSummary { redriven: 1, skipped: 1 });

        let bodies = queue.bodies();
        assert_eq!(bodies.len(), 1);
        let requeued = WorkItem::from_json(&bodies[0]).unwrap();
        assert_eq!(requeued.attempt_count, 0);
        assert_eq!(requeued.source_locator.to_string(), "docs/a.pdf");

        let remaining = sink.letters();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].message_id, "m2");
    }

    #[tokio::test]
    async fn failed_send_keeps_the_letter() {
        let sink = MemoryDeadLetters::new();
        let queue = MemoryQueue::default();
        queue.set_fail_sends(true);
        let item = WorkItem::new(SourceLocator::new("docs", "a.pdf"), Utc::now());
        sink.send(&letter("m1", item.to_json())).await.unwrap();

        assert!(redrive(&sink, &queue, 10).await.is_err());
        assert_eq!(sink.letters().len(), 1);
    }
}
