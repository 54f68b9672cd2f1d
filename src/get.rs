//! Record retrieval by id or source locator.
//!
//! Used by both the `docrelay get` CLI command and `GET /records/{id}`.
//! A target containing `/` is read as a `container/key` locator and hashed
//! to its record id; anything else is taken as the id itself.

use anyhow::{bail, Result};
use docrelay_core::models::{IndexRecord, SourceLocator};
use docrelay_core::traits::SearchIndex;

/// Resolve `target` to a record id.
pub fn resolve_record_id(target: &str) -> Result<String> {
    if target.contains('/') {
        let locator: SourceLocator = target.parse()?;
        Ok(locator.record_id())
    } else if target.is_empty() {
        bail!("record id must not be empty")
    } else {
        Ok(target.to_string())
    }
}

/// Core get function returning the stored record (used by CLI and server).
pub async fn get_record(index: &dyn SearchIndex, target: &str) -> Result<Option<IndexRecord>> {
    let id = resolve_record_id(target)?;
    Ok(index.get(&id).await?)
}

/// CLI entry point: prints the record to stdout.
pub async fn run_get(index: &dyn SearchIndex, target: &str) -> Result<()> {
    let record = match get_record(index, target).await? {
        Some(r) => r,
        None => bail!("record not found: {}", target),
    };

    println!("--- Record ---");
    println!("id:             {}", record.id);
    println!("source_locator: {}", record.source_locator);
    println!("content_type:   {}", record.content_type);
    println!("content_hash:   {}", record.content_hash);
    println!(
        "indexed_at:     {}",
        record.indexed_at.format("%Y-%m-%dT%H:%M:%S%.3fZ")
    );
    println!();

    println!("--- Content ({} chars) ---", record.content.chars().count());
    println!("{}", record.content);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use docrelay_core::memory::MemoryIndex;
    use docrelay_core::models::ExtractedDocument;

    #[test]
    fn locators_resolve_to_their_record_id() {
        let loc = SourceLocator::new("docs", "reports/q1.pdf");
        assert_eq!(resolve_record_id("docs/reports/q1.pdf").unwrap(), loc.record_id());
        assert_eq!(resolve_record_id("abc123").unwrap(), "abc123");
        assert!(resolve_record_id("").is_err());
    }

    #[tokio::test]
    async fn get_by_locator_and_id() {
        let index = MemoryIndex::new();
        let doc = ExtractedDocument {
            source_locator: SourceLocator::new("docs", "a.txt"),
            content_type: "text/plain".into(),
            text_segments: vec!["hello".into()],
            extracted_at: Utc::now(),
        };
        let record = IndexRecord::from_extracted(&doc, Utc::now());
        index.upsert(&record).await.unwrap();

        let by_locator = get_record(&index, "docs/a.txt").await.unwrap().unwrap();
        assert_eq!(by_locator.content, "hello");
        let by_id = get_record(&index, &record.id).await.unwrap().unwrap();
        assert_eq!(by_id.id, record.id);
        assert!(get_record(&index, "docs/missing.txt").await.unwrap().is_none());
    }
}
