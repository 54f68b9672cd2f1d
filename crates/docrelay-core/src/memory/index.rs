use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::IndexError;
use crate::models::IndexRecord;
use crate::traits::{SearchIndex, UpsertOutcome};

/// In-memory search index with call counters.
#[derive(Default)]
pub struct MemoryIndex {
    records: RwLock<HashMap<String, IndexRecord>>,
    fail_upserts: AtomicBool,
    fail_gets: AtomicBool,
    upsert_calls: AtomicUsize,
    get_calls: AtomicUsize,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every upsert fail as if the index were unreachable.
    pub fn set_fail_upserts(&self, fail: bool) {
        self.fail_upserts.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_gets(&self, fail: bool) {
        self.fail_gets.store(fail, Ordering::SeqCst);
    }

    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn records(&self) -> Vec<IndexRecord> {
        let mut all: Vec<IndexRecord> = self.records.read().unwrap().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SearchIndex for MemoryIndex {
    async fn get(&self, id: &str) -> Result<Option<IndexRecord>, IndexError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_gets.load(Ordering::SeqCst) {
            return Err(IndexError::Unavailable("memory index offline".to_string()));
        }
        Ok(self.records.read().unwrap().get(id).cloned())
    }

    async fn upsert(&self, record: &IndexRecord) -> Result<UpsertOutcome, IndexError> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_upserts.load(Ordering::SeqCst) {
            return Err(IndexError::Unavailable("memory index offline".to_string()));
        }
        let mut records = self.records.write().unwrap();
        if let Some(existing) = records.get(&record.id) {
            if existing.indexed_at > record.indexed_at {
                return Ok(UpsertOutcome::Stale);
            }
        }
        records.insert(record.id.clone(), record.clone());
        Ok(UpsertOutcome::Written)
    }

    async fn count(&self) -> Result<u64, IndexError> {
        Ok(self.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{content_hash, SourceLocator};
    use chrono::{Duration, Utc};

    fn record(content: &str, at: chrono::DateTime<Utc>) -> IndexRecord {
        let loc = SourceLocator::new("docs", "a.txt");
        IndexRecord {
            id: loc.record_id(),
            source_locator: loc,
            content: content.to_string(),
            content_hash: content_hash(content),
            content_type: "text/plain".into(),
            indexed_at: at,
        }
    }

    #[tokio::test]
    async fn upsert_overwrites_by_id() {
        let index = MemoryIndex::new();
        let t0 = Utc::now();
        index.upsert(&record("v1", t0)).await.unwrap();
        index.upsert(&record("v2", t0 + Duration::seconds(1))).await.unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index.records()[0].content, "v2");
    }

    #[tokio::test]
    async fn older_write_is_stale() {
        let index = MemoryIndex::new();
        let t0 = Utc::now();
        index.upsert(&record("new", t0)).await.unwrap();
        let outcome = index.upsert(&record("old", t0 - Duration::seconds(5))).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Stale);
        assert_eq!(index.records()[0].content, "new");
        assert_eq!(index.upsert_calls(), 2);
    }
}
