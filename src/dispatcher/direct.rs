//! In-process dispatch bounded by a pool semaphore

use super::{recognize_isolated, DispatchMode, Dispatcher, TaskCompletion};
use crate::models::{FailureKind, FrameTask, RecognitionOutcome};
use crate::recognition_engine::Recognizer;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Direct dispatcher
pub struct DirectDispatcher {
    recognizer: Arc<dyn Recognizer>,
    permits: Arc<Semaphore>,
    completion: Arc<TaskCompletion>,
}

impl DirectDispatcher {
    /// `permits` is the recognition pool; share it with any other caller of
    /// the recognizer so the pool size stays the only concurrency ceiling.
    pub fn new(
        recognizer: Arc<dyn Recognizer>,
        permits: Arc<Semaphore>,
        completion: Arc<TaskCompletion>,
    ) -> Self {
        Self {
            recognizer,
            permits,
            completion,
        }
    }
}

#[async_trait]
impl Dispatcher for DirectDispatcher {
    async fn submit(&self, task: FrameTask) {
        let recognizer = self.recognizer.clone();
        let permits = self.permits.clone();
        let completion = self.completion.clone();

        tokio::spawn(async move {
            let observer_id = task.observer_id.clone();
            let captured_at = task.captured_at;

            let outcome = match permits.acquire_owned().await {
                Ok(_permit) => recognize_isolated(recognizer, task).await,
                Err(_) => RecognitionOutcome::failed(
                    task.frame_id,
                    FailureKind::ProcessFailure,
                    "Recognition pool closed",
                ),
            };

            let frame_id = outcome.frame_id.clone();
            if let Err(e) = completion.finish(&observer_id, captured_at, outcome).await {
                tracing::error!(
                    observer_id = %observer_id,
                    frame_id = %frame_id,
                    error = %e,
                    "Direct task finished without audit record"
                );
            }
        });
    }

    fn mode(&self) -> DispatchMode {
        DispatchMode::Direct
    }
}
