//! SQLite-backed work queue and dead-letter table.
//!
//! Gives a single-machine deployment the same at-least-once semantics as
//! SQS: a claimed message becomes invisible until it is acknowledged or its
//! visibility timeout lapses, every claim increments `receive_count`, and
//! each claim gets a fresh receipt so that a consumer whose claim expired
//! cannot delete or delay a message someone else now holds.
//!
//! Tables are created by [`crate::migrate`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use docrelay_core::error::QueueError;
use docrelay_core::models::{DeadLetter, Delivery, ErrorKind, SourceLocator, WorkItem};
use docrelay_core::traits::{DeadLetterSink, WorkQueue};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// How often an empty long poll re-checks the table.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

fn db_err(e: sqlx::Error) -> QueueError {
    QueueError::Unavailable(format!("sqlite: {}", e))
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub struct SqliteQueue {
    pool: SqlitePool,
    visibility_timeout: Duration,
}

impl SqliteQueue {
    pub fn new(pool: SqlitePool, visibility_timeout: Duration) -> Self {
        Self {
            pool,
            visibility_timeout,
        }
    }

    /// Claim up to `max` currently visible messages without waiting.
    async fn claim(&self, max: usize) -> Result<Vec<Delivery>, QueueError> {
        let now = now_ms();
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM queue_messages WHERE visible_at <= ? ORDER BY visible_at ASC, created_at ASC LIMIT ?",
        )
        .bind(now)
        .bind(max as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let hidden_until = now + self.visibility_timeout.as_millis() as i64;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let receipt = Uuid::new_v4().to_string();
            // The visible_at guard loses the race cleanly if another
            // consumer claimed the row in between.
            let row = sqlx::query(
                r#"
                UPDATE queue_messages
                SET receipt = ?, receive_count = receive_count + 1, visible_at = ?
                WHERE id = ? AND visible_at <= ?
                RETURNING body, receive_count
                "#,
            )
            .bind(&receipt)
            .bind(hidden_until)
            .bind(&id)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

            if let Some(row) = row {
                let receive_count: i64 = row.get("receive_count");
                out.push(Delivery {
                    message_id: id,
                    receipt,
                    body: row.get("body"),
                    receive_count: receive_count as u32,
                });
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl WorkQueue for SqliteQueue {
    async fn send(&self, item: &WorkItem) -> Result<(), QueueError> {
        let now = now_ms();
        sqlx::query(
            "INSERT INTO queue_messages (id, body, receive_count, visible_at, receipt, created_at) VALUES (?, ?, 0, ?, NULL, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(item.to_json())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<Delivery>, QueueError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let claimed = self.claim(max.max(1)).await?;
            let now = tokio::time::Instant::now();
            if !claimed.is_empty() || now >= deadline {
                return Ok(claimed);
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let result = sqlx::query("DELETE FROM queue_messages WHERE id = ? AND receipt = ?")
            .bind(&delivery.message_id)
            .bind(&delivery.receipt)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(QueueError::Rejected(format!(
                "receipt for message {} is no longer valid",
                delivery.message_id
            )));
        }
        Ok(())
    }

    async fn delay(&self, delivery: &Delivery, delay: Duration) -> Result<(), QueueError> {
        let visible_at = now_ms() + delay.as_millis() as i64;
        let result =
            sqlx::query("UPDATE queue_messages SET visible_at = ? WHERE id = ? AND receipt = ?")
                .bind(visible_at)
                .bind(&delivery.message_id)
                .bind(&delivery.receipt)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(QueueError::Rejected(format!(
                "receipt for message {} is no longer valid",
                delivery.message_id
            )));
        }
        Ok(())
    }

    async fn depth(&self) -> Result<Option<u64>, QueueError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue_messages")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(Some(count as u64))
    }
}

/// Dead letters kept in the `dead_letters` table, keyed by message id.
pub struct SqliteDeadLetters {
    pool: SqlitePool,
}

impl SqliteDeadLetters {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn row_to_dead_letter(row: &sqlx::sqlite::SqliteRow) -> Result<DeadLetter, QueueError> {
    let kind: String = row.get("error_kind");
    let error_kind: ErrorKind = kind.parse().map_err(QueueError::Rejected)?;
    let failed_at: String = row.get("failed_at");
    let failed_at = DateTime::parse_from_rfc3339(&failed_at)
        .map_err(|e| QueueError::Rejected(format!("bad failed_at '{}': {}", failed_at, e)))?
        .with_timezone(&Utc);
    let locator: Option<String> = row.get("source_locator");
    let attempts: i64 = row.get("attempts");

    Ok(DeadLetter {
        message_id: row.get("message_id"),
        payload: row.get("payload"),
        source_locator: locator.and_then(|l| l.parse::<SourceLocator>().ok()),
        error_kind,
        reason: row.get("reason"),
        attempts: attempts as u32,
        failed_at,
    })
}

#[async_trait]
impl DeadLetterSink for SqliteDeadLetters {
    async fn send(&self, letter: &DeadLetter) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO dead_letters
                (message_id, payload, source_locator, error_kind, reason, attempts, failed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&letter.message_id)
        .bind(&letter.payload)
        .bind(letter.source_locator.as_ref().map(|l| l.to_string()))
        .bind(letter.error_kind.as_str())
        .bind(&letter.reason)
        .bind(letter.attempts as i64)
        .bind(letter.failed_at.to_rfc3339_opts(SecondsFormat::Micros, true))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
        let rows = sqlx::query(
            "SELECT message_id, payload, source_locator, error_kind, reason, attempts, failed_at FROM dead_letters ORDER BY failed_at DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_dead_letter).collect()
    }

    async fn remove(&self, message_id: &str) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM dead_letters WHERE message_id = ?")
            .bind(message_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn count(&self) -> Result<Option<u64>, QueueError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(Some(count as u64))
    }
}
