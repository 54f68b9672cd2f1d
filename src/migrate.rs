use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create the sqlite queue, dead-letter, and index tables. Idempotent.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    // Work queue. `receipt` is rotated on every claim so a stale claim
    // cannot delete or delay a redelivered message.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS queue_messages (
            id TEXT PRIMARY KEY,
            body TEXT NOT NULL,
            receive_count INTEGER NOT NULL DEFAULT 0,
            visible_at INTEGER NOT NULL,
            receipt TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dead_letters (
            message_id TEXT PRIMARY KEY,
            payload TEXT NOT NULL,
            source_locator TEXT,
            error_kind TEXT NOT NULL,
            reason TEXT NOT NULL,
            attempts INTEGER NOT NULL,
            failed_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Search index. `indexed_at_ms` orders conditional upserts.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_records (
            id TEXT PRIMARY KEY,
            source_locator TEXT NOT NULL UNIQUE,
            content TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            content_type TEXT NOT NULL,
            indexed_at TEXT NOT NULL,
            indexed_at_ms INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_queue_messages_visible_at ON queue_messages(visible_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_dead_letters_failed_at ON dead_letters(failed_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
