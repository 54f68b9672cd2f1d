use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::{FetchError, StoreError};
use crate::models::SourceLocator;
use crate::traits::{FetchedObject, ObjectStore};

/// In-memory object store keyed by [`SourceLocator`].
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<BTreeMap<SourceLocator, FetchedObject>>,
    denied: RwLock<HashSet<SourceLocator>>,
    unavailable: AtomicBool,
    fetch_calls: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an object; the content type is left for detection by key.
    pub fn put(&self, locator: SourceLocator, bytes: impl Into<Vec<u8>>) {
        self.put_with_type(locator, bytes, None);
    }

    pub fn put_with_type(
        &self,
        locator: SourceLocator,
        bytes: impl Into<Vec<u8>>,
        content_type: Option<&str>,
    ) {
        self.objects.write().unwrap().insert(
            locator,
            FetchedObject {
                bytes: bytes.into(),
                content_type: content_type.map(str::to_string),
            },
        );
    }

    pub fn remove(&self, locator: &SourceLocator) {
        self.objects.write().unwrap().remove(locator);
    }

    /// Make fetches of `locator` fail with access denied.
    pub fn deny(&self, locator: SourceLocator) {
        self.denied.write().unwrap().insert(locator);
    }

    /// Make every operation fail as if the store were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn fetch(&self, locator: &SourceLocator) -> Result<FetchedObject, StoreError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        if self.denied.read().unwrap().contains(locator) {
            return Err(FetchError::AccessDenied(locator.to_string()).into());
        }
        self.objects
            .read()
            .unwrap()
            .get(locator)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(locator.to_string()).into())
    }

    async fn list(&self, container: &str, prefix: &str) -> Result<Vec<String>, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(self
            .objects
            .read()
            .unwrap()
            .keys()
            .filter(|loc| loc.container == container && loc.key.starts_with(prefix))
            .map(|loc| loc.key.clone())
            .collect())
    }
}
