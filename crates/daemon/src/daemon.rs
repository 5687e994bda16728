//! Daemon assembly and lifecycle.
//!
//! Wires configuration, queue store, worker pool, queue processor and
//! control endpoint together, and runs them until a shutdown request
//! arrives. Crash recovery happens here, before processing can start: any
//! job persisted as Running is reset to Pending with its attempt counted.

use crate::pool::{derive_workers, WorkerPool};
use crate::processor::{Processor, ProcessorHandle, ProcessorParts, RetryPolicy};
use crate::server::{run_control_server, AppState, ServerError};
use crate::startup::{run_startup_checks, StartupError};
use crate::status::{new_shared_status, SharedStatus};
use crate::store::{QueueStore, StoreError, StoreLock, DEFAULT_QUEUE};
use crate::transcode::{FfmpegTagEditor, FfmpegTranscoder, Profile};
use portage_config::{Config, ConfigError};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::info;

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// Queue store error (including a lock held by another daemon)
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Control server error
    #[error("Server error: {0}")]
    Server(#[from] ServerError),
}

/// A fully wired daemon, ready to run.
pub struct Daemon {
    /// Configuration loaded from file and environment
    pub config: Config,
    handle: ProcessorHandle,
    status: SharedStatus,
    processor: Option<Processor>,
    // Held for the daemon's lifetime; released on drop.
    _lock: StoreLock,
}

impl Daemon {
    /// Initialize the daemon with configuration from file.
    ///
    /// This performs the full startup sequence:
    /// 1. Load config from file and apply environment overrides
    /// 2. Run startup checks (ffmpeg)
    /// 3. Acquire the store lock and recover interrupted jobs
    /// 4. Wire the worker pool, processor and control endpoint
    pub async fn new<P: AsRef<Path>>(config_path: P) -> Result<Self, DaemonError> {
        let config = Config::load(config_path)?;
        run_startup_checks()?;
        Self::build(config)
    }

    /// Initialize the daemon with an existing configuration.
    pub async fn with_config(config: Config) -> Result<Self, DaemonError> {
        run_startup_checks()?;
        Self::build(config)
    }

    /// Initialize the daemon without running startup checks.
    ///
    /// Useful for testing when ffmpeg is not available.
    pub fn new_without_checks(config: Config) -> Result<Self, DaemonError> {
        Self::build(config)
    }

    fn build(config: Config) -> Result<Self, DaemonError> {
        let state_dir = config.state_dir();
        let lock = StoreLock::acquire(&state_dir)?;
        let store = QueueStore::open(&state_dir)?;

        let mut queue = store.load_or_create(DEFAULT_QUEUE)?;
        let recovered = queue.recover_running();
        if recovered > 0 {
            info!(recovered, "reset interrupted jobs to pending");
        }
        store.persist_checkpoint(&queue)?;

        let profiles: Vec<Profile> = config
            .effective_profiles()
            .iter()
            .map(Profile::from_config)
            .collect();
        let workers = derive_workers(config.workers.convert_workers);
        let policy = RetryPolicy {
            max_attempts: config.workers.max_write_retries.max(1),
            pause_after_transient: config.workers.pause_after_transient_failures,
        };

        let (intent_tx, intent_rx) = mpsc::channel(64);
        let (results_tx, results_rx) = mpsc::channel(64);
        let (cancel_tx, cancel_rx) = watch::channel(0u64);

        let transcoder = Arc::new(FfmpegTranscoder::new(profiles.clone()));
        let pool = WorkerPool::new(
            workers,
            transcoder,
            config.temp_dir(),
            results_tx,
            cancel_rx,
        );
        let status = new_shared_status();

        let processor = Processor::new(ProcessorParts {
            store,
            queue,
            pool,
            results_rx,
            intents: intent_rx,
            tag_editor: Arc::new(FfmpegTagEditor),
            profiles,
            status: status.clone(),
            cancel_tx,
            policy,
        });

        info!(
            workers,
            state_dir = %state_dir.display(),
            "daemon initialized"
        );

        Ok(Self {
            config,
            handle: ProcessorHandle::new(intent_tx),
            status,
            processor: Some(processor),
            _lock: lock,
        })
    }

    /// Get a handle for sending control intents.
    pub fn handle(&self) -> ProcessorHandle {
        self.handle.clone()
    }

    /// Get the shared status snapshot.
    pub fn status(&self) -> SharedStatus {
        self.status.clone()
    }

    /// Run the processor and the control endpoint until shutdown.
    ///
    /// The control server shuts down gracefully once the processor exits
    /// (which it does after a shutdown intent, having flushed a final
    /// checkpoint).
    pub async fn run(mut self) -> Result<(), DaemonError> {
        let Some(processor) = self.processor.take() else {
            return Ok(());
        };

        let processor_task = tokio::spawn(processor.run());
        let (done_tx, done_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let _ = processor_task.await;
            let _ = done_tx.send(());
        });

        run_control_server(
            AppState {
                handle: self.handle.clone(),
                status: self.status.clone(),
            },
            self.config.daemon.port,
            async move {
                let _ = done_rx.await;
            },
        )
        .await?;

        info!("daemon shut down");
        Ok(())
    }
}
