//! Queued dispatch: enqueue on submit, collect replies with a pump

use super::{DispatchMode, Dispatcher, FrameQueue, QueueMessage, TaskCompletion};
use crate::correlator::ResultCorrelator;
use crate::models::{FailureKind, FrameTask, RecognitionOutcome};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Upper bound on one enqueue round-trip
const ENQUEUE_TIMEOUT: Duration = Duration::from_secs(2);

/// Replies older than this belong to a gateway instance that is gone
const STALE_REPLY_AGE: Duration = Duration::from_secs(3600);

/// Queued dispatcher
pub struct QueuedDispatcher {
    queue: Arc<FrameQueue>,
    /// Reply address of this gateway instance
    reply_to: String,
    completion: Arc<TaskCompletion>,
}

impl QueuedDispatcher {
    pub fn new(queue: Arc<FrameQueue>, reply_to: String, completion: Arc<TaskCompletion>) -> Self {
        Self {
            queue,
            reply_to,
            completion,
        }
    }

    pub fn reply_to(&self) -> &str {
        &self.reply_to
    }
}

#[async_trait]
impl Dispatcher for QueuedDispatcher {
    async fn submit(&self, task: FrameTask) {
        let message = QueueMessage::new(&self.reply_to, &task);

        let failure = match tokio::time::timeout(ENQUEUE_TIMEOUT, self.queue.enqueue(&message)).await
        {
            Ok(Ok(id)) => {
                tracing::debug!(
                    observer_id = %task.observer_id,
                    frame_id = %task.frame_id,
                    queue_id = id,
                    "Frame enqueued"
                );
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("Enqueue timed out after {}ms", ENQUEUE_TIMEOUT.as_millis()),
        };

        tracing::warn!(
            observer_id = %task.observer_id,
            frame_id = %task.frame_id,
            error = %failure,
            "Queue unreachable, failing task"
        );

        let outcome =
            RecognitionOutcome::failed(task.frame_id, FailureKind::DispatchUnavailable, failure);
        if let Err(e) = self
            .completion
            .finish(&task.observer_id, task.captured_at, outcome)
            .await
        {
            tracing::error!(
                observer_id = %task.observer_id,
                error = %e,
                "Dispatch failure not audited"
            );
        }
    }

    fn mode(&self) -> DispatchMode {
        DispatchMode::Queued
    }

    async fn queue_depth(&self) -> Option<i64> {
        match self.queue.depth().await {
            Ok(depth) => Some(depth),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read queue depth");
                None
            }
        }
    }
}

/// Moves worker replies for this gateway instance into the correlator
pub struct ReplyPump {
    queue: Arc<FrameQueue>,
    reply_to: String,
    correlator: Arc<ResultCorrelator>,
    poll_interval: Duration,
    running: Arc<RwLock<bool>>,
}

impl ReplyPump {
    pub fn new(
        queue: Arc<FrameQueue>,
        reply_to: String,
        correlator: Arc<ResultCorrelator>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            queue,
            reply_to,
            correlator,
            poll_interval,
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Start the pump loop
    pub async fn start(&self) {
        {
            let mut running = self.running.write().await;
            if *running {
                tracing::warn!("Reply pump already running");
                return;
            }
            *running = true;
        }

        tracing::info!(reply_to = %self.reply_to, "Starting reply pump");

        let queue = self.queue.clone();
        let reply_to = self.reply_to.clone();
        let correlator = self.correlator.clone();
        let poll_interval = self.poll_interval;
        let running = self.running.clone();

        tokio::spawn(async move {
            let mut last_purge = Instant::now();

            loop {
                {
                    let is_running = running.read().await;
                    if !*is_running {
                        break;
                    }
                }

                let replies = match queue.take_replies(&reply_to, 64).await {
                    Ok(replies) => replies,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to read replies");
                        Vec::new()
                    }
                };

                let idle = replies.is_empty();
                for reply in replies {
                    correlator.deliver(&reply.observer_id, &reply.outcome).await;
                }

                if last_purge.elapsed() >= STALE_REPLY_AGE / 60 {
                    match queue.purge_replies_older_than(STALE_REPLY_AGE).await {
                        Ok(0) => {}
                        Ok(n) => tracing::info!(purged = n, "Purged stale replies"),
                        Err(e) => tracing::warn!(error = %e, "Failed to purge replies"),
                    }
                    last_purge = Instant::now();
                }

                if idle {
                    tokio::time::sleep(poll_interval).await;
                }
            }

            tracing::info!("Reply pump stopped");
        });
    }

    /// Stop the pump loop
    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit_ledger::{AuditLedger, AuditStatus};
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_submit_enqueues_and_pump_delivers() {
        let dir = tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("queue.db").display());
        let queue = Arc::new(FrameQueue::connect(&url, Duration::from_secs(60)).await.unwrap());
        let ledger = Arc::new(AuditLedger::open(dir.path().join("r.csv")).await.unwrap());
        let correlator = Arc::new(ResultCorrelator::new());
        let completion = Arc::new(TaskCompletion::new(ledger.clone(), correlator.clone()));
        let dispatcher = QueuedDispatcher::new(queue.clone(), "gw-test".to_string(), completion);

        let (conn, mut rx) = correlator.register_connection().await;
        correlator.register_pending("obs1", "f1", conn, json!(1)).await;
        dispatcher
            .submit(FrameTask {
                observer_id: "obs1".to_string(),
                frame_id: "f1".to_string(),
                captured_at: chrono::Utc::now(),
                image: vec![1, 2, 3],
            })
            .await;
        assert_eq!(dispatcher.queue_depth().await, Some(1));

        // stand in for a worker
        let claimed = queue.claim("w1").await.unwrap().unwrap();
        let outcome = RecognitionOutcome::no_match("f1", None);
        queue.complete(claimed.id, "gw-test", "obs1", &outcome).await.unwrap();

        let pump = ReplyPump::new(
            queue.clone(),
            "gw-test".to_string(),
            correlator.clone(),
            Duration::from_millis(20),
        );
        pump.start().await;

        let delivery = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.frame_id, "f1");
        pump.stop().await;

        // gateway side never writes the ledger in queued mode
        assert!(ledger.read_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_queue_fails_task() {
        let dir = tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("queue.db").display());
        let queue = FrameQueue::connect(&url, Duration::from_secs(60)).await.unwrap();
        let ledger = Arc::new(AuditLedger::open(dir.path().join("r.csv")).await.unwrap());
        let correlator = Arc::new(ResultCorrelator::new());
        let completion = Arc::new(TaskCompletion::new(ledger.clone(), correlator.clone()));

        // break the queue under the dispatcher
        let pool = sqlx::SqlitePool::connect(&url).await.unwrap();
        sqlx::query("DROP TABLE frame_tasks").execute(&pool).await.unwrap();

        let dispatcher = QueuedDispatcher::new(Arc::new(queue), "gw".to_string(), completion);
        let (conn, mut rx) = correlator.register_connection().await;
        correlator.register_pending("obs1", "f1", conn, json!(1)).await;
        dispatcher
            .submit(FrameTask {
                observer_id: "obs1".to_string(),
                frame_id: "f1".to_string(),
                captured_at: chrono::Utc::now(),
                image: vec![1],
            })
            .await;

        let delivery = rx.try_recv().unwrap();
        let envelope: serde_json::Value = serde_json::from_str(&delivery.envelope).unwrap();
        assert_eq!(envelope["error"], "Dispatch unavailable");

        let records = ledger.read_all().await.unwrap();
        assert_eq!(
            records[0].status,
            AuditStatus::Error("Dispatch unavailable".to_string())
        );
    }
}
