//! Pull-mode runtime: receive from the work queue, process, settle.
//!
//! Each worker loops `receive → handle_batch → settle` until the shutdown
//! signal flips. Settling maps a [`Disposition`] onto the queue:
//!
//! | Disposition | Queue call |
//! |-------------|------------|
//! | `Ack` | `ack` |
//! | `DeadLetter` | `ack` (the dead letter is already written) |
//! | `Retry { delay }` | `delay` |
//!
//! A failed settle is logged and otherwise ignored; the message simply
//! becomes visible again when its visibility timeout lapses.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use docrelay_core::models::Delivery;
use docrelay_core::retry::Disposition;
use docrelay_core::traits::WorkQueue;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::processor::{DeliveryReport, QueueProcessor};

/// Counts from one or more receive rounds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkSummary {
    pub received: usize,
    pub acked: usize,
    pub retried: usize,
    pub dead_lettered: usize,
}

impl WorkSummary {
    fn record(&mut self, report: &DeliveryReport) {
        self.received += 1;
        match report.disposition {
            Disposition::Ack => self.acked += 1,
            Disposition::Retry { .. } => self.retried += 1,
            Disposition::DeadLetter { .. } => self.dead_lettered += 1,
        }
    }

    fn merge(&mut self, other: WorkSummary) {
        self.received += other.received;
        self.acked += other.acked;
        self.retried += other.retried;
        self.dead_lettered += other.dead_lettered;
    }
}

pub struct Worker {
    queue: Arc<dyn WorkQueue>,
    processor: Arc<QueueProcessor>,
    batch_size: usize,
    wait: Duration,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        processor: Arc<QueueProcessor>,
        batch_size: usize,
        wait: Duration,
    ) -> Self {
        Self {
            queue,
            processor,
            batch_size,
            wait,
        }
    }

    /// One receive round. Returns an empty summary if the queue was empty.
    pub async fn run_once(&self) -> Result<WorkSummary> {
        let deliveries = self.queue.receive(self.batch_size, self.wait).await?;
        Ok(self.process(&deliveries).await)
    }

    /// Process and settle every delivery of a claimed batch.
    async fn process(&self, deliveries: &[Delivery]) -> WorkSummary {
        let mut summary = WorkSummary::default();
        if deliveries.is_empty() {
            return summary;
        }
        debug!(count = deliveries.len(), "received batch");

        let batch = self.processor.handle_batch(deliveries).await;
        for (delivery, report) in deliveries.iter().zip(&batch.reports) {
            self.settle(delivery, report).await;
            summary.record(report);
        }
        summary
    }

    /// Receive rounds until the queue yields nothing.
    pub async fn drain(&self) -> Result<WorkSummary> {
        let mut total = WorkSummary::default();
        loop {
            let round = self.run_once().await?;
            if round.received == 0 {
                return Ok(total);
            }
            total.merge(round);
        }
    }

    /// Receive rounds until `shutdown` becomes true. Receive errors are
    /// logged and retried after a short pause.
    ///
    /// Shutdown only interrupts the receive wait. A batch that has been
    /// claimed is always processed and settled before the loop exits.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> WorkSummary {
        let mut total = WorkSummary::default();
        while !*shutdown.borrow() {
            let received = tokio::select! {
                received = self.queue.receive(self.batch_size, self.wait) => received,
                _ = shutdown.changed() => break,
            };
            match received {
                Ok(deliveries) => total.merge(self.process(&deliveries).await),
                Err(e) => {
                    warn!(error = %e, "receive failed");
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
        total
    }

    async fn settle(&self, delivery: &Delivery, report: &DeliveryReport) {
        let result = match &report.disposition {
            Disposition::Ack | Disposition::DeadLetter { .. } => self.queue.ack(delivery).await,
            Disposition::Retry { delay } => self.queue.delay(delivery, *delay).await,
        };
        if let Err(e) = result {
            warn!(
                message_id = %delivery.message_id,
                error = %e,
                "failed to settle message, it will be redelivered"
            );
        }
    }
}

/// Run `workers` concurrent workers until ctrl-c (or until the queue is
/// empty when `once` is set).
pub async fn run_workers(
    queue: Arc<dyn WorkQueue>,
    processor: Arc<QueueProcessor>,
    workers: usize,
    batch_size: usize,
    wait: Duration,
    once: bool,
) -> Result<WorkSummary> {
    let workers = workers.max(1);
    if once {
        let worker = Worker::new(queue, processor, batch_size, Duration::ZERO);
        return worker.drain().await;
    }

    let (tx, rx) = watch::channel(false);
    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let worker = Worker::new(queue.clone(), processor.clone(), batch_size, wait);
        let rx = rx.clone();
        handles.push(tokio::spawn(async move { worker.run(rx).await }));
    }
    info!(workers, "workers started");

    tokio::signal::ctrl_c().await?;
    info!("shutting down, finishing in-flight batches");
    let _ = tx.send(true);

    let mut total = WorkSummary::default();
    for handle in handles {
        total.merge(handle.await?);
    }
    Ok(total)
}
