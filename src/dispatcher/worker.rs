//! Queue workers
//!
//! Each worker processes one task at a time: claim, recognize, append the
//! ledger row, then acknowledge and publish the reply in one transaction.
//! A failed ledger append leaves the claim unacknowledged so the lease
//! expires and the task is redelivered.

use super::{recognize_isolated, FrameQueue};
use crate::audit_ledger::{AuditLedger, AuditRecord};
use crate::error::Result;
use crate::recognition_engine::Recognizer;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// One consumer of the frame queue
pub struct Worker {
    id: String,
    queue: Arc<FrameQueue>,
    recognizer: Arc<dyn Recognizer>,
    ledger: Arc<AuditLedger>,
}

impl Worker {
    pub fn new(
        id: String,
        queue: Arc<FrameQueue>,
        recognizer: Arc<dyn Recognizer>,
        ledger: Arc<AuditLedger>,
    ) -> Self {
        Self {
            id,
            queue,
            recognizer,
            ledger,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Process at most one task. Returns false when the queue was empty.
    pub async fn process_one(&self) -> Result<bool> {
        let Some(claimed) = self.queue.claim(&self.id).await? else {
            return Ok(false);
        };

        if claimed.deliveries > 1 {
            tracing::warn!(
                worker_id = %self.id,
                queue_id = claimed.id,
                deliveries = claimed.deliveries,
                "Redelivered task"
            );
        }

        let message = match claimed.decode() {
            Ok(message) => message,
            Err(e) => {
                tracing::error!(
                    worker_id = %self.id,
                    queue_id = claimed.id,
                    error = %e,
                    "Undecodable queue message, discarding"
                );
                self.queue.discard(claimed.id).await?;
                return Ok(true);
            }
        };

        let reply_to = message.reply_to.clone();
        let task = match message.into_task() {
            Ok(task) => task,
            Err(e) => {
                tracing::error!(
                    worker_id = %self.id,
                    queue_id = claimed.id,
                    error = %e,
                    "Invalid queued task, discarding"
                );
                self.queue.discard(claimed.id).await?;
                return Ok(true);
            }
        };

        let observer_id = task.observer_id.clone();
        let captured_at = task.captured_at;

        let outcome = recognize_isolated(self.recognizer.clone(), task).await;

        let record = AuditRecord::new(&observer_id, &outcome.frame_id, captured_at, &outcome);
        self.ledger.append(&record).await?;

        self.queue
            .complete(claimed.id, &reply_to, &observer_id, &outcome)
            .await?;

        tracing::info!(
            worker_id = %self.id,
            queue_id = claimed.id,
            observer_id = %observer_id,
            frame_id = %outcome.frame_id,
            status = %record.status,
            "Queued task completed"
        );

        Ok(true)
    }
}

/// Fixed-size set of worker loops
pub struct WorkerPool {
    workers: Vec<Arc<Worker>>,
    poll_interval: Duration,
    running: Arc<RwLock<bool>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        size: usize,
        queue: Arc<FrameQueue>,
        recognizer: Arc<dyn Recognizer>,
        ledger: Arc<AuditLedger>,
        poll_interval: Duration,
    ) -> Self {
        let prefix = Uuid::new_v4().simple().to_string();
        let workers = (0..size.max(1))
            .map(|i| {
                Arc::new(Worker::new(
                    format!("worker-{}-{}", &prefix[..8], i),
                    queue.clone(),
                    recognizer.clone(),
                    ledger.clone(),
                ))
            })
            .collect();

        Self {
            workers,
            poll_interval,
            running: Arc::new(RwLock::new(false)),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Start all worker loops
    pub async fn start(&self) {
        {
            let mut running = self.running.write().await;
            if *running {
                tracing::warn!("Worker pool already running");
                return;
            }
            *running = true;
        }

        tracing::info!(workers = self.workers.len(), "Starting worker pool");

        let mut handles = self.handles.lock().await;
        for worker in &self.workers {
            let worker = worker.clone();
            let running = self.running.clone();
            let poll_interval = self.poll_interval;

            handles.push(tokio::spawn(async move {
                loop {
                    {
                        let is_running = running.read().await;
                        if !*is_running {
                            break;
                        }
                    }

                    match worker.process_one().await {
                        Ok(true) => {}
                        Ok(false) => tokio::time::sleep(poll_interval).await,
                        Err(e) => {
                            tracing::error!(worker_id = %worker.id(), error = %e, "Worker iteration failed");
                            tokio::time::sleep(poll_interval).await;
                        }
                    }
                }
                tracing::info!(worker_id = %worker.id(), "Worker stopped");
            }));
        }
    }

    /// Ask loops to stop after their current task
    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
    }

    /// Wait for stopped loops to exit
    pub async fn join(&self) {
        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Worker loop aborted");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit_ledger::AuditStatus;
    use crate::dispatcher::testing::FakeRecognizer;
    use crate::dispatcher::QueueMessage;
    use crate::models::FrameTask;
    use chrono::Utc;
    use tempfile::{tempdir, TempDir};

    async fn setup(dir: &TempDir, lease: Duration) -> (Arc<FrameQueue>, Arc<AuditLedger>) {
        let url = format!("sqlite://{}", dir.path().join("queue.db").display());
        let queue = Arc::new(FrameQueue::connect(&url, lease).await.unwrap());
        let ledger = Arc::new(AuditLedger::open(dir.path().join("r.csv")).await.unwrap());
        (queue, ledger)
    }

    fn task(frame: &str) -> FrameTask {
        FrameTask {
            observer_id: "obs1".to_string(),
            frame_id: frame.to_string(),
            captured_at: Utc::now(),
            image: vec![9, 9],
        }
    }

    #[tokio::test]
    async fn test_process_one_audits_acks_and_replies() {
        let dir = tempdir().unwrap();
        let (queue, ledger) = setup(&dir, Duration::from_secs(60)).await;
        queue.enqueue(&QueueMessage::new("gw-1", &task("f1"))).await.unwrap();

        let worker = Worker::new(
            "w1".to_string(),
            queue.clone(),
            Arc::new(FakeRecognizer::new(Duration::ZERO)),
            ledger.clone(),
        );

        assert!(worker.process_one().await.unwrap());
        assert!(!worker.process_one().await.unwrap());

        assert_eq!(queue.depth().await.unwrap(), 0);
        let records = ledger.read_all().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, AuditStatus::MatchFound);

        let replies = queue.take_replies("gw-1", 10).await.unwrap();
        assert_eq!(replies[0].outcome.frame_id, "f1");
    }

    #[tokio::test]
    async fn test_garbage_message_is_discarded() {
        let dir = tempdir().unwrap();
        let (queue, ledger) = setup(&dir, Duration::from_secs(60)).await;

        let mut message = QueueMessage::new("gw-1", &task("f1"));
        message.task.image = "%%%".to_string();
        queue.enqueue(&message).await.unwrap();

        let worker = Worker::new(
            "w1".to_string(),
            queue.clone(),
            Arc::new(FakeRecognizer::new(Duration::ZERO)),
            ledger.clone(),
        );
        assert!(worker.process_one().await.unwrap());
        assert_eq!(queue.depth().await.unwrap(), 0);
        assert!(ledger.read_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pool_drains_queue() {
        let dir = tempdir().unwrap();
        let (queue, ledger) = setup(&dir, Duration::from_secs(60)).await;
        for i in 0..5 {
            queue
                .enqueue(&QueueMessage::new("gw-1", &task(&format!("f{}", i))))
                .await
                .unwrap();
        }

        let pool = WorkerPool::new(
            2,
            queue.clone(),
            Arc::new(FakeRecognizer::new(Duration::from_millis(5))),
            ledger.clone(),
            Duration::from_millis(10),
        );
        pool.start().await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while queue.depth().await.unwrap() > 0 {
            assert!(tokio::time::Instant::now() < deadline, "queue not drained");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        pool.stop().await;
        pool.join().await;

        assert_eq!(ledger.read_all().await.unwrap().len(), 5);
        assert_eq!(queue.take_replies("gw-1", 10).await.unwrap().len(), 5);
    }
}
