use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::QueueError;
use crate::models::{DeadLetter, Delivery, WorkItem};
use crate::traits::{DeadLetterSink, WorkQueue};

struct Message {
    id: String,
    body: String,
    receive_count: u32,
    /// Virtual time at which the message becomes receivable again.
    visible_at: Duration,
    receipt: Option<String>,
}

/// In-memory queue with SQS-like visibility semantics.
///
/// Time is virtual: it only moves when [`advance`](MemoryQueue::advance) is
/// called, so redelivery in tests is deterministic.
pub struct MemoryQueue {
    messages: Mutex<Vec<Message>>,
    now: Mutex<Duration>,
    visibility_timeout: Duration,
    fail_sends: AtomicBool,
    send_calls: AtomicUsize,
}

impl MemoryQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            now: Mutex::new(Duration::ZERO),
            visibility_timeout,
            fail_sends: AtomicBool::new(false),
            send_calls: AtomicUsize::new(0),
        }
    }

    /// Move virtual time forward.
    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn send_calls(&self) -> usize {
        self.send_calls.load(Ordering::SeqCst)
    }

    /// All messages still on the queue, visible or not.
    pub fn len(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bodies of all messages still on the queue, oldest first.
    pub fn bodies(&self) -> Vec<String> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.body.clone())
            .collect()
    }

    fn now(&self) -> Duration {
        *self.now.lock().unwrap()
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn send(&self, item: &WorkItem) -> Result<(), QueueError> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable("memory queue rejecting sends".to_string()));
        }
        let now = self.now();
        self.messages.lock().unwrap().push(Message {
            id: Uuid::new_v4().to_string(),
            body: item.to_json(),
            receive_count: 0,
            visible_at: now,
            receipt: None,
        });
        Ok(())
    }

    async fn receive(&self, max: usize, _wait: Duration) -> Result<Vec<Delivery>, QueueError> {
        let now = self.now();
        let mut messages = self.messages.lock().unwrap();
        let mut out = Vec::new();
        for msg in messages.iter_mut().filter(|m| m.visible_at <= now).take(max) {
            let receipt = Uuid::new_v4().to_string();
            msg.receive_count += 1;
            msg.visible_at = now + self.visibility_timeout;
            msg.receipt = Some(receipt.clone());
            out.push(Delivery {
                message_id: msg.id.clone(),
                receipt,
                body: msg.body.clone(),
                receive_count: msg.receive_count,
            });
        }
        Ok(out)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut messages = self.messages.lock().unwrap();
        let before = messages.len();
        messages.retain(|m| m.receipt.as_deref() != Some(delivery.receipt.as_str()));
        if messages.len() == before {
            return Err(QueueError::Rejected(format!(
                "receipt {} is no longer valid",
                delivery.receipt
            )));
        }
        Ok(())
    }

    async fn delay(&self, delivery: &Delivery, delay: Duration) -> Result<(), QueueError> {
        let now = self.now();
        let mut messages = self.messages.lock().unwrap();
        let msg = messages
            .iter_mut()
            .find(|m| m.receipt.as_deref() == Some(delivery.receipt.as_str()))
            .ok_or_else(|| {
                QueueError::Rejected(format!("receipt {} is no longer valid", delivery.receipt))
            })?;
        msg.visible_at = now + delay;
        Ok(())
    }

    async fn depth(&self) -> Result<Option<u64>, QueueError> {
        Ok(Some(self.len() as u64))
    }
}

/// In-memory dead-letter destination.
#[derive(Default)]
pub struct MemoryDeadLetters {
    letters: Mutex<Vec<DeadLetter>>,
    fail_sends: AtomicBool,
}

impl MemoryDeadLetters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// All dead letters, oldest first.
    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetters {
    async fn send(&self, letter: &DeadLetter) -> Result<(), QueueError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable("dead-letter sink offline".to_string()));
        }
        self.letters.lock().unwrap().push(letter.clone());
        Ok(())
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
        Ok(self
            .letters
            .lock()
            .unwrap()
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn remove(&self, message_id: &str) -> Result<(), QueueError> {
        self.letters
            .lock()
            .unwrap()
            .retain(|l| l.message_id != message_id);
        Ok(())
    }

    async fn count(&self) -> Result<Option<u64>, QueueError> {
        Ok(Some(self.letters.lock().unwrap().len() as u64))
    }
}
