//! Local filesystem object store.
//!
//! Containers are subdirectories of the configured root, and keys are
//! `/`-separated paths inside them: `docs/reports/a.pdf` is read from
//! `<root>/docs/reports/a.pdf`. Used for local development and tests in
//! place of S3.

use std::io::ErrorKind as IoErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use docrelay_core::error::{FetchError, StoreError};
use docrelay_core::models::SourceLocator;
use docrelay_core::traits::{FetchedObject, ObjectStore};
use walkdir::WalkDir;

pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a locator to a path under the root. Keys that would escape
    /// the container (`..`, absolute paths) resolve to nothing.
    fn resolve(&self, locator: &SourceLocator) -> Option<PathBuf> {
        let mut path = self.root.join(safe_component(&locator.container)?);
        for part in locator.key.split('/') {
            if part.is_empty() {
                continue;
            }
            path.push(safe_component(part)?);
        }
        Some(path)
    }
}

fn safe_component(part: &str) -> Option<&Path> {
    let path = Path::new(part);
    let mut components = path.components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Some(path),
        _ => None,
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn fetch(&self, locator: &SourceLocator) -> Result<FetchedObject, StoreError> {
        let path = self
            .resolve(locator)
            .ok_or_else(|| FetchError::AccessDenied(locator.to_string()))?;

        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(FetchedObject {
                bytes,
                content_type: None,
            }),
            Err(e) => Err(match e.kind() {
                IoErrorKind::NotFound => FetchError::NotFound(locator.to_string()).into(),
                IoErrorKind::PermissionDenied => {
                    FetchError::AccessDenied(locator.to_string()).into()
                }
                // Reading a directory fails with an OS-specific kind.
                _ if path.is_dir() => FetchError::NotFound(locator.to_string()).into(),
                _ => StoreError::Unavailable(format!("reading {}: {}", path.display(), e)),
            }),
        }
    }

    async fn list(&self, container: &str, prefix: &str) -> Result<Vec<String>, StoreError> {
        let base = match safe_component(container) {
            Some(c) => self.root.join(c),
            None => return Ok(Vec::new()),
        };
        let prefix = prefix.to_string();

        tokio::task::spawn_blocking(move || {
            if !base.is_dir() {
                return Ok(Vec::new());
            }
            let mut keys = Vec::new();
            for entry in WalkDir::new(&base) {
                let entry =
                    entry.map_err(|e| StoreError::Unavailable(format!("listing: {}", e)))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let relative = entry.path().strip_prefix(&base).unwrap_or(entry.path());
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(&prefix) {
                    keys.push(key);
                }
            }
            // Sort for deterministic ordering
            keys.sort();
            Ok(keys)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("listing task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, FsObjectStore) {
        let tmp = TempDir::new().unwrap();
        let docs = tmp.path().join("docs");
        std::fs::create_dir_all(docs.join("reports/2024")).unwrap();
        std::fs::write(docs.join("a.txt"), "Hello world").unwrap();
        std::fs::write(docs.join("reports/2024/q1.md"), "# Q1").unwrap();
        let store = FsObjectStore::new(tmp.path());
        (tmp, store)
    }

    #[tokio::test]
    async fn fetches_by_container_and_key() {
        let (_tmp, store) = setup();
        let obj = store
            .fetch(&SourceLocator::new("docs", "reports/2024/q1.md"))
            .await
            .unwrap();
        assert_eq!(obj.bytes, b"# Q1");
        assert_eq!(obj.content_type, None);
    }

    #[tokio::test]
    async fn missing_objects_are_not_found() {
        let (_tmp, store) = setup();
        let err = store
            .fetch(&SourceLocator::new("docs", "missing.pdf"))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::Fetch(FetchError::NotFound("docs/missing.pdf".into())));
    }

    #[tokio::test]
    async fn traversal_is_denied() {
        let (_tmp, store) = setup();
        let err = store
            .fetch(&SourceLocator::new("docs", "../../etc/passwd"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Fetch(FetchError::AccessDenied(_))));
    }

    #[tokio::test]
    async fn lists_keys_with_forward_slashes() {
        let (_tmp, store) = setup();
        assert_eq!(
            store.list("docs", "").await.unwrap(),
            vec!["a.txt", "reports/2024/q1.md"]
        );
        assert_eq!(store.list("docs", "reports/").await.unwrap(), vec!["reports/2024/q1.md"]);
        assert!(store.list("nope", "").await.unwrap().is_empty());
    }
}
