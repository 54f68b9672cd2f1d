//! SQLite-backed search index.
//!
//! Stores one row per [`IndexRecord`] in `index_records`. The upsert is a
//! single statement whose conflict clause only overwrites when the incoming
//! `indexed_at` is not older than the stored one, so concurrent writers for
//! the same locator converge on the newest extraction.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use docrelay_core::error::IndexError;
use docrelay_core::models::IndexRecord;
use docrelay_core::traits::{SearchIndex, UpsertOutcome};
use sqlx::{Row, SqlitePool};

pub struct SqliteIndex {
    pool: SqlitePool,
}

impl SqliteIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn db_err(e: sqlx::Error) -> IndexError {
    IndexError::Unavailable(format!("sqlite: {}", e))
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<IndexRecord, IndexError> {
    let locator: String = row.get("source_locator");
    let indexed_at: String = row.get("indexed_at");
    Ok(IndexRecord {
        id: row.get("id"),
        source_locator: locator
            .parse()
            .map_err(|e| IndexError::Rejected(format!("stored locator: {}", e)))?,
        content: row.get("content"),
        content_hash: row.get("content_hash"),
        content_type: row.get("content_type"),
        indexed_at: DateTime::parse_from_rfc3339(&indexed_at)
            .map_err(|e| IndexError::Rejected(format!("stored indexed_at: {}", e)))?
            .with_timezone(&Utc),
    })
}

#[async_trait]
impl SearchIndex for SqliteIndex {
    async fn get(&self, id: &str) -> Result<Option<IndexRecord>, IndexError> {
        let row = sqlx::query(
            "SELECT id, source_locator, content, content_hash, content_type, indexed_at FROM index_records WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn upsert(&self, record: &IndexRecord) -> Result<UpsertOutcome, IndexError> {
        let result = sqlx::query(
            r#"
            INSERT INTO index_records
                (id, source_locator, content, content_hash, content_type, indexed_at, indexed_at_ms)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                content = excluded.content,
                content_hash = excluded.content_hash,
                content_type = excluded.content_type,
                indexed_at = excluded.indexed_at,
                indexed_at_ms = excluded.indexed_at_ms
            WHERE excluded.indexed_at_ms >= index_records.indexed_at_ms
            "#,
        )
        .bind(&record.id)
        .bind(record.source_locator.to_string())
        .bind(&record.content)
        .bind(&record.content_hash)
        .bind(&record.content_type)
        .bind(record.indexed_at.to_rfc3339_opts(SecondsFormat::Micros, true))
        .bind(record.indexed_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            Ok(UpsertOutcome::Stale)
        } else {
            Ok(UpsertOutcome::Written)
        }
    }

    async fn count(&self) -> Result<u64, IndexError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM index_records")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(count as u64)
    }
}
