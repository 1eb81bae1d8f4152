//! Durable frame queue on SQLite
//!
//! `frame_tasks` holds submitted tasks until a worker acknowledges them.
//! A claim is a lease: a claimed row whose lease expired is handed out
//! again with its delivery counter incremented. `frame_outcomes` is the
//! reply table, addressed by gateway instance id.

use crate::error::{Error, Result};
use crate::models::{FrameTask, RecognitionOutcome};
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

/// Serialized task as stored in `frame_tasks.payload`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    /// Gateway instance that expects the outcome
    pub reply_to: String,
    pub task: QueuedTask,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedTask {
    pub observer_id: String,
    pub frame_id: String,
    pub captured_at: DateTime<Utc>,
    /// Base64 image bytes
    pub image: String,
}

impl QueueMessage {
    pub fn new(reply_to: &str, task: &FrameTask) -> Self {
        Self {
            reply_to: reply_to.to_string(),
            task: QueuedTask {
                observer_id: task.observer_id.clone(),
                frame_id: task.frame_id.clone(),
                captured_at: task.captured_at,
                image: base64::engine::general_purpose::STANDARD.encode(&task.image),
            },
        }
    }

    pub fn into_task(self) -> Result<FrameTask> {
        let image = base64::engine::general_purpose::STANDARD
            .decode(self.task.image.as_bytes())
            .map_err(|e| Error::Validation(format!("Queued image is not base64: {}", e)))?;
        Ok(FrameTask {
            observer_id: self.task.observer_id,
            frame_id: self.task.frame_id,
            captured_at: self.task.captured_at,
            image,
        })
    }
}

/// Task handed to a worker
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub id: i64,
    /// 1 on first delivery
    pub deliveries: i64,
    pub payload: String,
}

impl ClaimedTask {
    pub fn decode(&self) -> Result<QueueMessage> {
        Ok(serde_json::from_str(&self.payload)?)
    }
}

/// Outcome read back by the submitting gateway
#[derive(Debug, Clone)]
pub struct QueuedReply {
    pub observer_id: String,
    pub outcome: RecognitionOutcome,
}

/// FrameQueue instance
#[derive(Clone)]
pub struct FrameQueue {
    pool: SqlitePool,
    lease: Duration,
}

impl FrameQueue {
    /// Open (creating if needed) the queue database
    pub async fn connect(url: &str, lease: Duration) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(2))
            .connect_with(options)
            .await?;

        let queue = Self { pool, lease };
        queue.migrate().await?;

        tracing::info!(url = %url, lease_sec = lease.as_secs(), "Frame queue connected");
        Ok(queue)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS frame_tasks (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                payload     TEXT    NOT NULL,
                enqueued_at INTEGER NOT NULL,
                claimed_at  INTEGER,
                claimed_by  TEXT,
                deliveries  INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS frame_outcomes (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                reply_to    TEXT    NOT NULL,
                observer_id TEXT    NOT NULL,
                payload     TEXT    NOT NULL,
                created_at  INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_frame_outcomes_reply_to ON frame_outcomes (reply_to, id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Enqueue a message; it stays until acknowledged. Returns the row id.
    pub async fn enqueue(&self, message: &QueueMessage) -> Result<i64> {
        let payload = serde_json::to_string(message)?;
        let result = sqlx::query("INSERT INTO frame_tasks (payload, enqueued_at) VALUES (?, ?)")
        .bind(payload)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Claim the oldest available task
    pub async fn claim(&self, worker_id: &str) -> Result<Option<ClaimedTask>> {
        let now = Utc::now().timestamp_millis();
        let expired_before = now - self.lease.as_millis() as i64;

        let row: Option<(i64, i64, String)> = sqlx::query_as(
            r#"
            UPDATE frame_tasks
               SET claimed_at = ?, claimed_by = ?, deliveries = deliveries + 1
             WHERE id = (
                   SELECT id FROM frame_tasks
                    WHERE claimed_at IS NULL OR claimed_at <= ?
                    ORDER BY id
                    LIMIT 1)
            RETURNING id, deliveries, payload
            "#,
        )
        .bind(now)
        .bind(worker_id)
        .bind(expired_before)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id, deliveries, payload)| ClaimedTask {
            id,
            deliveries,
            payload,
        }))
    }

    /// Acknowledge a task and publish its outcome atomically
    pub async fn complete(
        &self,
        task_id: i64,
        reply_to: &str,
        observer_id: &str,
        outcome: &RecognitionOutcome,
    ) -> Result<()> {
        let payload = serde_json::to_string(outcome)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM frame_tasks WHERE id = ?")
            .bind(task_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT INTO frame_outcomes (reply_to, observer_id, payload, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(reply_to)
        .bind(observer_id)
        .bind(payload)
        .bind(Utc::now().timestamp_millis())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Drop an undecodable task
    pub async fn discard(&self, task_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM frame_tasks WHERE id = ?")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Take up to `limit` replies addressed to `reply_to`, oldest first
    pub async fn take_replies(&self, reply_to: &str, limit: i64) -> Result<Vec<QueuedReply>> {
        let mut tx = self.pool.begin().await?;

        let rows: Vec<(i64, String, String)> = sqlx::query_as(
            "SELECT id, observer_id, payload FROM frame_outcomes WHERE reply_to = ? ORDER BY id LIMIT ?",
        )
        .bind(reply_to)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        let Some(last_id) = rows.last().map(|(id, _, _)| *id) else {
            tx.commit().await?;
            return Ok(Vec::new());
        };

        sqlx::query("DELETE FROM frame_outcomes WHERE reply_to = ? AND id <= ?")
            .bind(reply_to)
            .bind(last_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        let mut replies = Vec::with_capacity(rows.len());
        for (id, observer_id, payload) in rows {
            match serde_json::from_str::<RecognitionOutcome>(&payload) {
                Ok(outcome) => replies.push(QueuedReply {
                    observer_id,
                    outcome,
                }),
                Err(e) => {
                    tracing::warn!(reply_id = id, error = %e, "Discarding unreadable reply");
                }
            }
        }
        Ok(replies)
    }

    /// Remove replies nobody collected (gateway instance gone)
    pub async fn purge_replies_older_than(&self, age: Duration) -> Result<u64> {
        let cutoff = Utc::now().timestamp_millis() - age.as_millis() as i64;
        let result = sqlx::query("DELETE FROM frame_outcomes WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Tasks waiting or claimed
    pub async fn depth(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM frame_tasks")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
