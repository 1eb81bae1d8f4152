//! WorkDispatcher - Recognition Capacity
//!
//! ## Responsibilities
//!
//! - Hand accepted frames to recognition capacity
//! - Guarantee one outcome and one ledger row per submitted task
//!
//! ## Modes
//!
//! - Direct: in-process tasks bounded by a pool semaphore
//! - Queued: durable SQLite queue consumed by worker loops, replies routed
//!   back to the submitting gateway instance

mod direct;
mod queue;
mod queued;
mod worker;

pub use direct::DirectDispatcher;
pub use queue::{ClaimedTask, FrameQueue, QueueMessage, QueuedReply, QueuedTask};
pub use queued::{QueuedDispatcher, ReplyPump};
pub use worker::{Worker, WorkerPool};

use crate::audit_ledger::{AuditLedger, AuditRecord};
use crate::correlator::ResultCorrelator;
use crate::error::{Error, Result};
use crate::models::{FailureKind, FrameTask, RecognitionOutcome};
use crate::recognition_engine::Recognizer;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Dispatch mode selected by `DISPATCH_MODE`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    Direct,
    Queued,
}

impl DispatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchMode::Direct => "direct",
            DispatchMode::Queued => "queued",
        }
    }
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DispatchMode {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(DispatchMode::Direct),
            "queued" | "queue" => Ok(DispatchMode::Queued),
            other => Err(Error::Config(format!("Unknown dispatch mode '{}'", other))),
        }
    }
}

/// Submission side of the pipeline
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Hand a task over. Every submitted task eventually reaches
    /// [`TaskCompletion::finish`] exactly once (per delivery in queued mode).
    async fn submit(&self, task: FrameTask);

    fn mode(&self) -> DispatchMode;

    /// Tasks waiting in the durable queue, if any
    async fn queue_depth(&self) -> Option<i64> {
        None
    }
}

/// Attempts for one ledger append before the task is given up
const LEDGER_APPEND_ATTEMPTS: u32 = 3;

/// Delay before the second attempt, doubled for each further one
const LEDGER_APPEND_BACKOFF: Duration = Duration::from_millis(100);

/// Ledger-then-deliver continuation shared by both modes
pub struct TaskCompletion {
    ledger: Arc<AuditLedger>,
    correlator: Arc<ResultCorrelator>,
    append_attempts: u32,
    append_backoff: Duration,
}

impl TaskCompletion {
    pub fn new(ledger: Arc<AuditLedger>, correlator: Arc<ResultCorrelator>) -> Self {
        Self {
            ledger,
            correlator,
            append_attempts: LEDGER_APPEND_ATTEMPTS,
            append_backoff: LEDGER_APPEND_BACKOFF,
        }
    }

    pub fn with_append_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.append_attempts = attempts.max(1);
        self.append_backoff = backoff;
        self
    }

    /// Append the ledger row, then deliver to the originating connection.
    ///
    /// The outcome is only delivered once its row is durable. When the append
    /// keeps failing the connection gets a failure envelope instead, so its
    /// in-flight frame is released without reporting an unrecorded result,
    /// and the ledger error is returned.
    pub async fn finish(
        &self,
        observer_id: &str,
        captured_at: DateTime<Utc>,
        outcome: RecognitionOutcome,
    ) -> Result<()> {
        let record = AuditRecord::new(observer_id, &outcome.frame_id, captured_at, &outcome);

        if let Err(e) = self.append_with_retry(&record).await {
            tracing::error!(
                observer_id = %observer_id,
                frame_id = %outcome.frame_id,
                error = %e,
                "Audit record not written, outcome withheld"
            );
            let withheld = RecognitionOutcome::failed(
                outcome.frame_id,
                FailureKind::ProcessFailure,
                format!("Audit record not written: {}", e),
            );
            self.correlator.deliver(observer_id, &withheld).await;
            return Err(e);
        }

        self.correlator.deliver(observer_id, &outcome).await;
        Ok(())
    }

    async fn append_with_retry(&self, record: &AuditRecord) -> Result<()> {
        let mut delay = self.append_backoff;
        let mut attempt = 1;
        loop {
            match self.ledger.append(record).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.append_attempts => {
                    tracing::warn!(
                        frame_id = %record.frame_id,
                        attempt = attempt,
                        error = %e,
                        "Ledger append failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Run recognition in its own task so a panic becomes a failed outcome
pub async fn recognize_isolated(
    recognizer: Arc<dyn Recognizer>,
    task: FrameTask,
) -> RecognitionOutcome {
    let frame_id = task.frame_id.clone();
    let handle = tokio::spawn(async move { recognizer.recognize(&task).await });

    match handle.await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(frame_id = %frame_id, error = %e, "Recognition task aborted");
            RecognitionOutcome::failed(
                frame_id,
                FailureKind::ProcessFailure,
                format!("Recognition task aborted: {}", e),
            )
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::models::{Person, PersonId};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Recognizer returning a fixed verdict after an optional delay
    pub struct FakeRecognizer {
        pub delay: Duration,
        pub panic: bool,
        pub calls: AtomicUsize,
        pub active: AtomicUsize,
        pub max_active: AtomicUsize,
    }

    impl FakeRecognizer {
        pub fn new(delay: Duration) -> Self {
            Self {
                delay,
                panic: false,
                calls: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
            }
        }

        pub fn panicking() -> Self {
            Self {
                panic: true,
                ..Self::new(Duration::ZERO)
            }
        }
    }

    #[async_trait]
    impl Recognizer for FakeRecognizer {
        async fn recognize(&self, task: &FrameTask) -> RecognitionOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);

            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            if self.panic {
                panic!("engine crashed");
            }

            RecognitionOutcome::matched(
                task.frame_id.clone(),
                Person {
                    id: PersonId::Number(7),
                    name: "Alice".to_string(),
                },
                0.92,
            )
        }
    }
}
