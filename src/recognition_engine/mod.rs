//! RecognitionEngine - External Recognition Process Adapter
//!
//! ## Responsibilities
//!
//! - Materialize the frame image to a transient file
//! - Run the engine process once per frame with a hard timeout
//! - Translate exit status / stdout into a RecognitionOutcome
//! - Resolve matched persons against the person directory (optional)
//!
//! ## Engine contract
//!
//! `<program> <args...> <image path>` prints a JSON verdict
//! `{"found": bool, "person": {"id", "name"}, "confidence": number}` on stdout
//! and exits 0. Anything else is a per-task failure; the adapter never retries.

mod output;
mod transient;

pub use output::{normalize_confidence, parse_output, EngineVerdict};
pub use transient::TransientImage;

use crate::models::{FailureKind, FrameTask, Person, RecognitionOutcome};
use crate::person_directory::PersonDirectory;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

/// Placeholder in engine args replaced by the image path
pub const IMAGE_PLACEHOLDER: &str = "{image}";

/// Message used when the directory does not know the matched id
pub const PERSON_NOT_IN_DIRECTORY: &str = "Person data not found in database";

/// Per-task engine failure
#[derive(Debug, thiserror::Error)]
pub enum RecognitionError {
    #[error("Timeout exceeded ({}ms)", .0.as_millis())]
    Timeout(Duration),

    #[error("Process failure: {0}")]
    ProcessFailure(String),

    #[error("Malformed output: {0}")]
    MalformedOutput(String),
}

impl RecognitionError {
    pub fn kind(&self) -> FailureKind {
        match self {
            RecognitionError::Timeout(_) => FailureKind::Timeout,
            RecognitionError::ProcessFailure(_) => FailureKind::ProcessFailure,
            RecognitionError::MalformedOutput(_) => FailureKind::MalformedOutput,
        }
    }

    pub fn into_outcome(self, frame_id: &str) -> RecognitionOutcome {
        let kind = self.kind();
        let detail = match self {
            RecognitionError::Timeout(limit) => {
                format!("Recognition did not finish within {}ms", limit.as_millis())
            }
            RecognitionError::ProcessFailure(stderr) => stderr,
            RecognitionError::MalformedOutput(raw) => raw,
        };
        RecognitionOutcome::failed(frame_id, kind, detail)
    }
}

/// Anything that turns a frame into exactly one outcome
#[async_trait]
pub trait Recognizer: Send + Sync {
    async fn recognize(&self, task: &FrameTask) -> RecognitionOutcome;
}

/// Engine invocation settings
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
    /// Directory for transient frame images
    pub frames_dir: PathBuf,
}

/// RecognitionEngine instance
pub struct RecognitionEngine {
    config: EngineConfig,
    directory: Option<Arc<dyn PersonDirectory>>,
}

impl RecognitionEngine {
    /// Create engine adapter, creating the frames directory if needed
    pub async fn new(config: EngineConfig) -> crate::Result<Self> {
        tokio::fs::create_dir_all(&config.frames_dir).await?;
        Ok(Self {
            config,
            directory: None,
        })
    }

    /// Resolve matches against a person directory
    pub fn with_directory(mut self, directory: Arc<dyn PersonDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    /// Run the engine for one task and parse its verdict.
    ///
    /// The transient image lives exactly as long as this call.
    pub async fn run(&self, task: &FrameTask) -> Result<EngineVerdict, RecognitionError> {
        let image = TransientImage::write(&self.config.frames_dir, &task.frame_id, &task.image)
            .await
            .map_err(|e| {
                RecognitionError::ProcessFailure(format!("Failed to write frame image: {}", e))
            })?;

        let stdout = self.invoke(image.path()).await?;
        parse_output(&stdout)
    }

    fn command_args(&self, image_path: &Path) -> Vec<String> {
        let path = image_path.to_string_lossy();
        let mut substituted = false;
        let mut args: Vec<String> = self
            .config
            .args
            .iter()
            .map(|arg| {
                if arg.contains(IMAGE_PLACEHOLDER) {
                    substituted = true;
                    arg.replace(IMAGE_PLACEHOLDER, &path)
                } else {
                    arg.clone()
                }
            })
            .collect();
        if !substituted {
            args.push(path.into_owned());
        }
        args
    }

    /// Spawn the engine and collect its output.
    ///
    /// On timeout the child is killed and reaped before returning, so no
    /// engine process outlives the call. kill_on_drop covers cancellation.
    async fn invoke(&self, image_path: &Path) -> Result<String, RecognitionError> {
        let mut child = Command::new(&self.config.program)
            .args(self.command_args(image_path))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                RecognitionError::ProcessFailure(format!(
                    "Failed to spawn {}: {}",
                    self.config.program, e
                ))
            })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            RecognitionError::ProcessFailure("Engine stdout not captured".to_string())
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            RecognitionError::ProcessFailure("Engine stderr not captured".to_string())
        })?;

        let collected = tokio::time::timeout(self.config.timeout, async {
            let (status, out, err) =
                tokio::join!(child.wait(), read_pipe(stdout), read_pipe(stderr));
            Ok::<_, std::io::Error>((status?, out?, err?))
        })
        .await;

        match collected {
            Ok(Ok((status, out, err))) => {
                if !status.success() {
                    let stderr = String::from_utf8_lossy(&err).trim().to_string();
                    let detail = if stderr.is_empty() {
                        format!("Engine exited with {}", status)
                    } else {
                        stderr
                    };
                    return Err(RecognitionError::ProcessFailure(detail));
                }
                Ok(String::from_utf8_lossy(&out).into_owned())
            }
            Ok(Err(e)) => Err(RecognitionError::ProcessFailure(format!(
                "Engine I/O failed: {}",
                e
            ))),
            Err(_) => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "Failed to kill timed out engine");
                }
                tracing::warn!(
                    timeout_ms = self.config.timeout.as_millis() as u64,
                    program = %self.config.program,
                    "Recognition engine timeout, process killed"
                );
                Err(RecognitionError::Timeout(self.config.timeout))
            }
        }
    }

    /// Turn a verdict into an outcome, consulting the directory for matches
    async fn resolve(&self, frame_id: &str, verdict: EngineVerdict) -> RecognitionOutcome {
        let (person_id, name, confidence) = match verdict {
            EngineVerdict::NoMatch { message } => {
                return RecognitionOutcome::no_match(frame_id, message);
            }
            EngineVerdict::Match {
                person_id,
                name,
                confidence,
            } => (person_id, name, confidence),
        };

        if let Some(directory) = &self.directory {
            match directory.find_person(&person_id).await {
                Ok(Some(person)) => {
                    return RecognitionOutcome::matched(frame_id, person, confidence);
                }
                Ok(None) => {
                    tracing::info!(
                        frame_id = %frame_id,
                        person_id = %person_id,
                        "Matched person missing from directory"
                    );
                    return RecognitionOutcome::no_match(
                        frame_id,
                        Some(PERSON_NOT_IN_DIRECTORY.to_string()),
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        frame_id = %frame_id,
                        person_id = %person_id,
                        error = %e,
                        "Person directory lookup failed, using engine data"
                    );
                }
            }
        }

        match name {
            Some(name) => RecognitionOutcome::matched(
                frame_id,
                Person {
                    id: person_id,
                    name,
                },
                confidence,
            ),
            None => RecognitionOutcome::failed(
                frame_id,
                FailureKind::MalformedOutput,
                format!("Match for person {} reported without a name", person_id),
            ),
        }
    }
}

#[async_trait]
impl Recognizer for RecognitionEngine {
    async fn recognize(&self, task: &FrameTask) -> RecognitionOutcome {
        let started = Instant::now();

        let outcome = match self.run(task).await {
            Ok(verdict) => self.resolve(&task.frame_id, verdict).await,
            Err(e) => {
                tracing::warn!(
                    observer_id = %task.observer_id,
                    frame_id = %task.frame_id,
                    error = %e,
                    "Recognition failed"
                );
                e.into_outcome(&task.frame_id)
            }
        };

        tracing::info!(
            observer_id = %task.observer_id,
            frame_id = %task.frame_id,
            found = outcome.found,
            failed = outcome.is_error(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Recognition finished"
        );

        outcome
    }
}

async fn read_pipe<R: AsyncRead + Unpin>(mut pipe: R) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    pipe.read_to_end(&mut buf).await?;
    Ok(buf)
}
