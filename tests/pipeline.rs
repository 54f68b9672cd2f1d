//! End-to-end pipeline behaviour against the in-memory backends.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use docrelay::extract::PlainTextExtractor;
use docrelay::notifier::{IngestNotifier, KeyFilter};
use docrelay::processor::{ProcessOutcome, QueueProcessor};
use docrelay::worker::Worker;
use docrelay_core::error::{ExtractError, PipelineError};
use docrelay_core::extract::{ExtractorRegistry, ScannedPdfFallback, TextExtractor};
use docrelay_core::memory::{MemoryDeadLetters, MemoryIndex, MemoryObjectStore, MemoryQueue};
use docrelay_core::models::{
    record_id, Delivery, ErrorKind, ExtractedDocument, IndexRecord, SourceLocator, StorageEvent,
    WorkItem,
};
use docrelay_core::retry::{Disposition, RetryPolicy};
use docrelay_core::traits::{SearchIndex, WorkQueue};

/// Stands in for PDF parsing: every PDF reads as the bytes' text.
struct FakePdf;

#[async_trait]
impl TextExtractor for FakePdf {
    fn name(&self) -> &str {
        "fake-pdf"
    }

    fn supports(&self, content_type: &str) -> bool {
        content_type == "application/pdf"
    }

    async fn extract(&self, bytes: &[u8], _content_type: &str) -> Result<Vec<String>, ExtractError> {
        let text = String::from_utf8_lossy(bytes);
        if text.starts_with("CORRUPT") {
            return Err(ExtractError::Corrupt {
                content_type: "application/pdf".into(),
                message: "bad xref table".into(),
            });
        }
        Ok(docrelay_core::extract::segment_text(&text))
    }
}

/// Never finishes within any reasonable attempt deadline.
struct Stalls;

#[async_trait]
impl TextExtractor for Stalls {
    fn name(&self) -> &str {
        "stalls"
    }

    fn supports(&self, content_type: &str) -> bool {
        content_type == "image/png"
    }

    async fn extract(&self, _bytes: &[u8], _content_type: &str) -> Result<Vec<String>, ExtractError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(vec![])
    }
}

/// Recognizes the same line in anything it is shown.
struct FakeOcr;

#[async_trait]
impl TextExtractor for FakeOcr {
    fn name(&self) -> &str {
        "fake-ocr"
    }

    fn supports(&self, content_type: &str) -> bool {
        content_type.starts_with("image/")
    }

    async fn extract(&self, _bytes: &[u8], _content_type: &str) -> Result<Vec<String>, ExtractError> {
        Ok(vec!["Scanned page text".to_string()])
    }
}

struct Env {
    store: Arc<MemoryObjectStore>,
    queue: Arc<MemoryQueue>,
    index: Arc<MemoryIndex>,
    dlq: Arc<MemoryDeadLetters>,
    notifier: IngestNotifier,
    processor: Arc<QueueProcessor>,
}

fn policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_secs(10),
        max_delay: Duration::from_secs(60),
    }
}

fn env() -> Env {
    let store = Arc::new(MemoryObjectStore::new());
    let queue = Arc::new(MemoryQueue::new(Duration::from_secs(300)));
    let index = Arc::new(MemoryIndex::new());
    let dlq = Arc::new(MemoryDeadLetters::new());
    let extractors = ExtractorRegistry::new()
        .with(Arc::new(PlainTextExtractor))
        .with(Arc::new(FakePdf))
        .with(Arc::new(Stalls));
    let processor = QueueProcessor::new(store.clone(), extractors, index.clone(), dlq.clone())
        .with_policy(policy())
        .with_attempt_timeout(Duration::from_millis(200));
    Env {
        notifier: IngestNotifier::new(queue.clone(), KeyFilter::allow_all()),
        processor: Arc::new(processor),
        store,
        queue,
        index,
        dlq,
    }
}

impl Env {
    fn worker(&self) -> Worker {
        Worker::new(self.queue.clone(), self.processor.clone(), 10, Duration::ZERO)
    }
}

fn item(container: &str, key: &str) -> WorkItem {
    WorkItem::new(SourceLocator::new(container, key), Utc::now())
}

fn delivery(id: &str, item: &WorkItem, receive_count: u32) -> Delivery {
    Delivery {
        message_id: id.into(),
        receipt: format!("receipt-{}", id),
        body: item.to_json(),
        receive_count,
    }
}

#[tokio::test]
async fn created_notification_flows_to_exactly_one_upsert() {
    let e = env();
    let loc = SourceLocator::new("docs", "a.pdf");
    e.store.put(loc.clone(), "Hello world");

    e.notifier
        .handle_event(&StorageEvent::created("docs", "a.pdf"))
        .await
        .unwrap();
    assert_eq!(e.queue.send_calls(), 1);
    let body = &e.queue.bodies()[0];
    assert_eq!(WorkItem::from_json(body).unwrap().source_locator, loc);

    let summary = e.worker().drain().await.unwrap();
    assert_eq!(summary.acked, 1);

    assert_eq!(e.store.fetch_calls(), 1);
    assert_eq!(e.index.get_calls(), 1);
    assert_eq!(e.index.upsert_calls(), 1);
    let records = e.index.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, record_id(&loc));
    assert_eq!(records[0].content, "Hello world");
    assert_eq!(records[0].source_locator.to_string(), "docs/a.pdf");
    assert_eq!(records[0].content_type, "application/pdf");
}

#[tokio::test]
async fn duplicate_delivery_never_creates_a_second_record() {
    let e = env();
    e.store.put(SourceLocator::new("docs", "a.pdf"), "Hello world");
    let event = StorageEvent::created("docs", "a.pdf");
    e.notifier.handle_event(&event).await.unwrap();
    e.notifier.handle_event(&event).await.unwrap();

    e.worker().drain().await.unwrap();

    let records = e.index.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, record_id(&SourceLocator::new("docs", "a.pdf")));
    assert!(e.index.upsert_calls() <= 2);
    assert!(e.queue.is_empty());
}

#[tokio::test]
async fn concurrent_processing_of_one_item_yields_one_record() {
    let e = env();
    e.store.put(SourceLocator::new("docs", "a.txt"), "same text");
    let w = item("docs", "a.txt");

    let (a, b) = tokio::join!(e.processor.process(&w), e.processor.process(&w));
    assert!(a.is_ok() && b.is_ok());
    assert_eq!(e.index.len(), 1);
}

#[tokio::test]
async fn unchanged_content_skips_the_write() {
    let e = env();
    e.store.put(SourceLocator::new("docs", "a.txt"), "stable");
    let w = item("docs", "a.txt");

    assert!(matches!(e.processor.process(&w).await.unwrap(), ProcessOutcome::Indexed { .. }));
    assert!(matches!(e.processor.process(&w).await.unwrap(), ProcessOutcome::Unchanged { .. }));
    assert_eq!(e.index.upsert_calls(), 1);
    assert_eq!(e.index.get_calls(), 2);

    e.store.put(SourceLocator::new("docs", "a.txt"), "edited");
    assert!(matches!(e.processor.process(&w).await.unwrap(), ProcessOutcome::Indexed { .. }));
    assert_eq!(e.index.upsert_calls(), 2);
    assert_eq!(e.index.records()[0].content, "edited");
}

#[tokio::test]
async fn empty_content_still_produces_a_record() {
    let e = env();
    let loc = SourceLocator::new("docs", "blank.txt");
    e.store.put(loc.clone(), "  \n\n ");
    assert!(e.index.get(&record_id(&loc)).await.unwrap().is_none());

    e.processor.process(&item("docs", "blank.txt")).await.unwrap();

    let record = e.index.get(&record_id(&loc)).await.unwrap().unwrap();
    assert_eq!(record.content, "");
}

#[tokio::test]
async fn index_write_failures_are_retried_then_dead_lettered() {
    let e = env();
    e.store.put(SourceLocator::new("docs", "a.txt"), "text");
    e.index.set_fail_upserts(true);
    e.queue.send(&item("docs", "a.txt")).await.unwrap();

    let worker = e.worker();
    for attempt in 1..=3u32 {
        let summary = worker.run_once().await.unwrap();
        assert_eq!(summary.received, 1, "attempt {}", attempt);
        if attempt < 3 {
            assert_eq!(summary.retried, 1);
            e.queue.advance(Duration::from_secs(60));
        } else {
            assert_eq!(summary.dead_lettered, 1);
        }
    }

    assert_eq!(e.index.upsert_calls(), 3);
    assert!(e.queue.is_empty());
    let letters = e.dlq.letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].error_kind, ErrorKind::RetriesExhausted);
    assert_eq!(letters[0].attempts, 3);
}

#[tokio::test]
async fn backoff_grows_between_attempts() {
    let e = env();
    e.index.set_fail_upserts(true);
    e.store.put(SourceLocator::new("docs", "a.txt"), "text");
    let w = item("docs", "a.txt");

    let first = e.processor.handle_delivery(&delivery("m1", &w, 1)).await;
    let second = e.processor.handle_delivery(&delivery("m1", &w, 2)).await;
    assert_eq!(first.disposition, Disposition::Retry { delay: Duration::from_secs(10) });
    assert_eq!(second.disposition, Disposition::Retry { delay: Duration::from_secs(20) });
}

#[tokio::test]
async fn permanent_failures_are_dead_lettered_on_first_attempt() {
    let e = env();
    e.store.put(SourceLocator::new("docs", "broken.pdf"), "CORRUPT");
    e.store.deny(SourceLocator::new("docs", "secret.txt"));

    let cases = [
        ("missing.txt", ErrorKind::Fetch),
        ("secret.txt", ErrorKind::Fetch),
        ("broken.pdf", ErrorKind::Extraction),
        ("gone.bin", ErrorKind::Fetch),
    ];
    for (i, (key, kind)) in cases.iter().enumerate() {
        let w = item("docs", key);
        let report = e
            .processor
            .handle_delivery(&delivery(&format!("m{}", i), &w, 1))
            .await;
        match &report.disposition {
            Disposition::DeadLetter { kind: got, .. } => assert_eq!(got, kind, "{}", key),
            other => panic!("{}: expected dead letter, got {:?}", key, other),
        }
    }
    assert_eq!(e.dlq.letters().len(), 4);
    assert_eq!(e.index.upsert_calls(), 0);
}

#[tokio::test]
async fn unsupported_content_type_is_permanent() {
    let e = env();
    e.store.put(SourceLocator::new("docs", "blob.bin"), vec![0u8, 159, 146, 150]);
    let err = e.processor.process(&item("docs", "blob.bin")).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Extraction(ExtractError::UnsupportedContentType(_))
    ));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn malformed_payload_is_dead_lettered_without_a_locator() {
    let e = env();
    let bad = Delivery {
        message_id: "m1".into(),
        receipt: "r1".into(),
        body: r#"{"sourceLocator":"no-slash"}"#.into(),
        receive_count: 1,
    };
    let report = e.processor.handle_delivery(&bad).await;
    assert!(matches!(
        report.disposition,
        Disposition::DeadLetter { kind: ErrorKind::MalformedPayload, .. }
    ));
    let letter = &e.dlq.letters()[0];
    assert_eq!(letter.payload, bad.body);
    assert!(letter.source_locator.is_none());
    assert_eq!(e.store.fetch_calls(), 0);
}

#[tokio::test]
async fn storage_outage_is_retryable() {
    let e = env();
    e.store.set_unavailable(true);
    let report = e
        .processor
        .handle_delivery(&delivery("m1", &item("docs", "a.txt"), 1))
        .await;
    assert!(matches!(report.disposition, Disposition::Retry { .. }));
    assert!(e.dlq.letters().is_empty());
}

#[tokio::test]
async fn slow_extraction_times_out_and_is_retried() {
    let e = env();
    e.store.put(SourceLocator::new("docs", "scan.png"), vec![0x89, b'P', b'N', b'G']);
    let report = e
        .processor
        .handle_delivery(&delivery("m1", &item("docs", "scan.png"), 1))
        .await;
    assert!(matches!(report.result, Err(PipelineError::Timeout(_))));
    assert!(matches!(report.disposition, Disposition::Retry { .. }));
}

#[tokio::test]
async fn older_extraction_never_overwrites_newer_record() {
    let e = env();
    let loc = SourceLocator::new("docs", "a.txt");
    let newer = IndexRecord::from_extracted(
        &ExtractedDocument {
            source_locator: loc.clone(),
            content_type: "text/plain".into(),
            text_segments: vec!["version two".into()],
            extracted_at: Utc::now(),
        },
        Utc::now() + chrono::Duration::hours(1),
    );
    e.index.upsert(&newer).await.unwrap();

    e.store.put(loc.clone(), "version one");
    let outcome = e.processor.process(&item("docs", "a.txt")).await.unwrap();
    assert!(matches!(outcome, ProcessOutcome::Superseded { .. }));
    assert_eq!(e.index.records()[0].content, "version two");
}

#[tokio::test]
async fn one_failing_item_does_not_affect_the_batch() {
    let e = env();
    e.store.put(SourceLocator::new("docs", "a.txt"), "alpha");
    e.store.put(SourceLocator::new("docs", "c.txt"), "gamma");
    let deliveries = vec![
        delivery("m1", &item("docs", "a.txt"), 1),
        delivery("m2", &item("docs", "missing.txt"), 1),
        delivery("m3", &item("docs", "c.txt"), 1),
    ];

    let batch = e.processor.handle_batch(&deliveries).await;
    let dispositions: Vec<_> = batch.reports.iter().map(|r| r.disposition.clone()).collect();
    assert_eq!(dispositions[0], Disposition::Ack);
    assert!(matches!(dispositions[1], Disposition::DeadLetter { .. }));
    assert_eq!(dispositions[2], Disposition::Ack);
    assert!(batch.retry_ids().is_empty());
    assert_eq!(e.index.len(), 2);
}

#[tokio::test]
async fn processor_counters_track_outcomes() {
    let e = env();
    e.store.put(SourceLocator::new("docs", "a.txt"), "alpha");
    let w = item("docs", "a.txt");
    e.processor.handle_delivery(&delivery("m1", &w, 1)).await;
    e.processor.handle_delivery(&delivery("m2", &w, 1)).await;
    e.processor
        .handle_delivery(&delivery("m3", &item("docs", "gone.txt"), 1))
        .await;

    let snap = e.processor.stats().snapshot();
    assert_eq!(snap.processed, 3);
    assert_eq!(snap.indexed, 1);
    assert_eq!(snap.unchanged, 1);
    assert_eq!(snap.dead_lettered, 1);
}

#[tokio::test]
async fn scanned_pdf_is_indexed_with_ocr_text() {
    let store = Arc::new(MemoryObjectStore::new());
    let index = Arc::new(MemoryIndex::new());
    let loc = SourceLocator::new("docs", "scan.pdf");
    // Parses, but has no text layer.
    store.put(loc.clone(), "   ");

    let ocr: Arc<dyn TextExtractor> = Arc::new(FakeOcr);
    let extractors = ExtractorRegistry::new()
        .with(Arc::new(ScannedPdfFallback::new(Arc::new(FakePdf), ocr.clone())))
        .with(ocr);
    let processor = QueueProcessor::new(
        store,
        extractors,
        index.clone(),
        Arc::new(MemoryDeadLetters::new()),
    );

    let outcome = processor
        .process(&WorkItem::new(loc.clone(), Utc::now()))
        .await
        .unwrap();
    assert!(matches!(outcome, ProcessOutcome::Indexed { .. }));
    let record = index.get(&loc.record_id()).await.unwrap().unwrap();
    assert_eq!(record.content, "Scanned page text");
}

/// OCR that always runs past its own deadline.
struct OcrDeadline;

#[async_trait]
impl TextExtractor for OcrDeadline {
    fn name(&self) -> &str {
        "ocr-deadline"
    }

    fn supports(&self, content_type: &str) -> bool {
        content_type == "image/tiff"
    }

    async fn extract(&self, _bytes: &[u8], _content_type: &str) -> Result<Vec<String>, ExtractError> {
        Err(ExtractError::TimedOut {
            extractor: "ocr".into(),
            timeout: Duration::from_secs(45),
        })
    }
}

#[tokio::test]
async fn ocr_deadline_is_retried_not_dead_lettered() {
    let store = Arc::new(MemoryObjectStore::new());
    store.put(SourceLocator::new("docs", "slow.tiff"), "II*");
    let dlq = Arc::new(MemoryDeadLetters::new());
    let processor = QueueProcessor::new(
        store,
        ExtractorRegistry::new().with(Arc::new(OcrDeadline)),
        Arc::new(MemoryIndex::new()),
        dlq.clone(),
    )
    .with_policy(policy());

    let w = item("docs", "slow.tiff");
    let first = processor.handle_delivery(&delivery("m1", &w, 1)).await;
    assert_eq!(
        first.disposition,
        Disposition::Retry {
            delay: Duration::from_secs(10)
        }
    );
    assert!(dlq.letters().is_empty());

    let last = processor.handle_delivery(&delivery("m1", &w, 3)).await;
    match last.disposition {
        Disposition::DeadLetter { kind, .. } => assert_eq!(kind, ErrorKind::RetriesExhausted),
        other => panic!("unexpected {:?}", other),
    }
}
