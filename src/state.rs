//! Application state
//!
//! Holds configuration and the shared pipeline components

use crate::audit_ledger::AuditLedger;
use crate::correlator::ResultCorrelator;
use crate::dispatcher::{
    DirectDispatcher, DispatchMode, Dispatcher, FrameQueue, QueuedDispatcher, ReplyPump,
    TaskCompletion, WorkerPool,
};
use crate::gateway::AdmissionPolicy;
use crate::person_directory::SqlitePersonDirectory;
use crate::recognition_engine::{EngineConfig, RecognitionEngine, Recognizer};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// direct | queued
    pub dispatch_mode: DispatchMode,
    /// Queue database URL (queued mode)
    pub queue_url: String,
    /// Concurrent recognitions per process
    pub worker_pool_size: usize,
    /// Run queue workers inside the gateway process (queued mode)
    pub embedded_workers: bool,
    /// Audit ledger CSV
    pub ledger_path: PathBuf,
    /// Transient frame images
    pub frames_dir: PathBuf,
    /// Recognition engine program
    pub recognizer_program: String,
    /// Engine arguments; `{image}` is replaced by the image path
    pub recognizer_args: Vec<String>,
    pub recognizer_timeout: Duration,
    pub min_frame_interval: Duration,
    pub queue_poll_interval: Duration,
    pub queue_lease: Duration,
    /// Person directory database (optional)
    pub people_db_url: Option<String>,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_millis(key: &str, default: u64) -> Duration {
    Duration::from_millis(env_or(key, default))
}

impl Default for AppConfig {
    fn default() -> Self {
        let recognizer_timeout = env_millis("RECOGNIZER_TIMEOUT_MS", 10_000);
        let dispatch_mode = match std::env::var("DISPATCH_MODE") {
            Ok(raw) => raw.parse().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Falling back to direct dispatch");
                DispatchMode::Direct
            }),
            Err(_) => DispatchMode::Direct,
        };

        Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_or("PORT", 3000),
            dispatch_mode,
            queue_url: std::env::var("QUEUE_URL")
                .unwrap_or_else(|_| "sqlite://data/queue.db".to_string()),
            worker_pool_size: env_or("WORKER_POOL_SIZE", 1usize).max(1),
            embedded_workers: env_or("EMBEDDED_WORKERS", true),
            ledger_path: std::env::var("LEDGER_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/results.csv")),
            frames_dir: std::env::var("FRAMES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/frames")),
            recognizer_program: std::env::var("RECOGNIZER_PROGRAM")
                .unwrap_or_else(|_| "python3".to_string()),
            recognizer_args: std::env::var("RECOGNIZER_ARGS")
                .unwrap_or_else(|_| "detector.py --test -m hog -f".to_string())
                .split_whitespace()
                .map(String::from)
                .collect(),
            recognizer_timeout,
            min_frame_interval: env_millis("MIN_FRAME_INTERVAL_MS", 500),
            queue_poll_interval: env_millis("QUEUE_POLL_MS", 200),
            queue_lease: Duration::from_secs(env_or("QUEUE_LEASE_SEC", 60)),
            people_db_url: std::env::var("PEOPLE_DB_URL").ok().filter(|s| !s.is_empty()),
        }
    }
}

impl AppConfig {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            program: self.recognizer_program.clone(),
            args: self.recognizer_args.clone(),
            timeout: self.recognizer_timeout,
            frames_dir: self.frames_dir.clone(),
        }
    }

    pub fn admission_policy(&self) -> AdmissionPolicy {
        AdmissionPolicy {
            min_interval: self.min_frame_interval,
        }
    }
}

/// Build the recognition engine, wired to the person directory if configured
pub async fn build_recognizer(config: &AppConfig) -> crate::Result<Arc<dyn Recognizer>> {
    let mut engine = RecognitionEngine::new(config.engine_config()).await?;
    if let Some(url) = &config.people_db_url {
        let directory = SqlitePersonDirectory::connect(url).await?;
        engine = engine.with_directory(Arc::new(directory));
    }
    Ok(Arc::new(engine))
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Application config
    pub config: AppConfig,
    /// AuditLedger (CSV)
    pub ledger: Arc<AuditLedger>,
    /// ResultCorrelator
    pub correlator: Arc<ResultCorrelator>,
    /// Work dispatcher (direct or queued)
    pub dispatcher: Arc<dyn Dispatcher>,
    /// Recognition engine adapter
    pub recognizer: Arc<dyn Recognizer>,
    /// Recognition pool shared by the dispatcher and one-shot requests
    pub recognize_permits: Arc<Semaphore>,
    pub started_at: Instant,
}

/// Loops running beside the HTTP server in queued mode
#[derive(Default)]
pub struct BackgroundTasks {
    pub workers: Option<Arc<WorkerPool>>,
    pub reply_pump: Option<Arc<ReplyPump>>,
}

impl BackgroundTasks {
    pub async fn start(&self) {
        if let Some(workers) = &self.workers {
            workers.start().await;
        }
        if let Some(pump) = &self.reply_pump {
            pump.start().await;
        }
    }

    pub async fn stop(&self) {
        if let Some(pump) = &self.reply_pump {
            pump.stop().await;
        }
        if let Some(workers) = &self.workers {
            workers.stop().await;
            workers.join().await;
        }
    }
}

impl AppState {
    /// Wire every component for the configured dispatch mode
    pub async fn initialize(config: AppConfig) -> crate::Result<(Self, BackgroundTasks)> {
        let ledger = Arc::new(AuditLedger::open(&config.ledger_path).await?);
        let recognizer = build_recognizer(&config).await?;
        Self::with_recognizer(config, ledger, recognizer).await
    }

    /// Same as [`AppState::initialize`] with a caller supplied recognizer
    pub async fn with_recognizer(
        config: AppConfig,
        ledger: Arc<AuditLedger>,
        recognizer: Arc<dyn Recognizer>,
    ) -> crate::Result<(Self, BackgroundTasks)> {
        let correlator = Arc::new(ResultCorrelator::new());
        let completion = Arc::new(TaskCompletion::new(ledger.clone(), correlator.clone()));
        let permits = Arc::new(Semaphore::new(config.worker_pool_size));
        let mut background = BackgroundTasks::default();

        let dispatcher: Arc<dyn Dispatcher> = match config.dispatch_mode {
            DispatchMode::Direct => Arc::new(DirectDispatcher::new(
                recognizer.clone(),
                permits.clone(),
                completion,
            )),
            DispatchMode::Queued => {
                let queue =
                    Arc::new(FrameQueue::connect(&config.queue_url, config.queue_lease).await?);
                let reply_to = format!("gateway-{}", uuid::Uuid::new_v4());

                background.reply_pump = Some(Arc::new(ReplyPump::new(
                    queue.clone(),
                    reply_to.clone(),
                    correlator.clone(),
                    config.queue_poll_interval,
                )));
                if config.embedded_workers {
                    background.workers = Some(Arc::new(WorkerPool::new(
                        config.worker_pool_size,
                        queue.clone(),
                        recognizer.clone(),
                        ledger.clone(),
                        config.queue_poll_interval,
                    )));
                }

                Arc::new(QueuedDispatcher::new(queue, reply_to, completion))
            }
        };

        let state = Self {
            config,
            ledger,
            correlator,
            dispatcher,
            recognizer,
            recognize_permits: permits,
            started_at: Instant::now(),
        };

        Ok((state, background))
    }
}
