//! Queue processor: the daemon core.
//!
//! A single task owns the focused queue and drives jobs from cursor to tail:
//! evaluate conditions, fan transcodes out to the worker pool, and commit
//! results strictly in queue order through the write serializer. Because the
//! processor is the only owner of the in-memory queue and the only caller of
//! the serializer, destination writes and checkpoint writes are serialized
//! by construction.
//!
//! The control endpoint never mutates state directly; it sends intents over
//! a channel and reads the shared status snapshot the processor publishes
//! after every checkpoint.
//!
//! Transcodes may finish out of order. Their results are parked keyed by job
//! id and only committed when their job reaches the head of the queue, so
//! the persisted cursor never advances past an unfinished job.

use crate::conditions::{evaluate, Decision, EffectiveOp};
use crate::job::{Conditions, Job, JobStatus, Operation};
use crate::place::{classify, FailureClass, PlaceError, PlaceRequest, WriteSerializer};
use crate::pool::{PoolResult, WorkerPool};
use crate::status::{ProcessingMode, ProgressCounts, SharedStatus};
use crate::store::{valid_queue_name, JobSeed, Queue, QueueStore, StoreError};
use crate::transcode::{Profile, TagEditor, TranscodeError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Delay before re-attempting a transiently failed placement.
const RETRY_BACKOFF_MS: u64 = 250;

/// Error type for processor requests
#[derive(Debug, Error)]
pub enum ProcessorError {
    /// Store-level failure (not found, corrupt snapshot, io).
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Malformed request; daemon state was not touched.
    #[error("invalid request: {0}")]
    Invalid(String),

    /// The processor is gone (daemon shutting down).
    #[error("daemon is shutting down")]
    Disconnected,
}

/// What `flush` should clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushScope {
    /// Remove jobs that have not started.
    Pending,
    /// Reset failed jobs to pending with a fresh retry budget.
    Failed,
    /// Remove every job and rewind the cursor.
    All,
}

/// Result of a flush request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlushOutcome {
    pub removed: usize,
    pub reset: usize,
}

/// An enqueue request, as accepted from the control endpoint.
#[derive(Debug, Clone)]
pub struct EnqueueSpec {
    /// Target queue; None means the focused queue.
    pub queue: Option<String>,
    /// Replace the target queue instead of appending.
    pub reset: bool,
    pub operation: Operation,
    /// Absolute source file paths.
    pub sources: Vec<PathBuf>,
    /// Absolute destination directory.
    pub destination: PathBuf,
    pub conditions: Conditions,
}

/// Control intents sent from the endpoint to the processor.
pub enum Intent {
    Start,
    Pause,
    Stop,
    SelectQueue {
        name: String,
        reply: oneshot::Sender<Result<(), ProcessorError>>,
    },
    Enqueue {
        spec: EnqueueSpec,
        reply: oneshot::Sender<Result<Vec<u64>, ProcessorError>>,
    },
    Flush {
        queue: Option<String>,
        scope: FlushScope,
        reply: oneshot::Sender<Result<FlushOutcome, ProcessorError>>,
    },
    ListQueues {
        reply: oneshot::Sender<Result<Vec<String>, ProcessorError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable sender half used by the control endpoint and the daemon.
#[derive(Clone)]
pub struct ProcessorHandle {
    tx: mpsc::Sender<Intent>,
}

impl ProcessorHandle {
    pub fn new(tx: mpsc::Sender<Intent>) -> Self {
        Self { tx }
    }

    pub async fn start(&self) -> Result<(), ProcessorError> {
        self.tx
            .send(Intent::Start)
            .await
            .map_err(|_| ProcessorError::Disconnected)
    }

    pub async fn pause(&self) -> Result<(), ProcessorError> {
        self.tx
            .send(Intent::Pause)
            .await
            .map_err(|_| ProcessorError::Disconnected)
    }

    pub async fn stop(&self) -> Result<(), ProcessorError> {
        self.tx
            .send(Intent::Stop)
            .await
            .map_err(|_| ProcessorError::Disconnected)
    }

    pub async fn select_queue(&self, name: String) -> Result<(), ProcessorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Intent::SelectQueue { name, reply })
            .await
            .map_err(|_| ProcessorError::Disconnected)?;
        rx.await.map_err(|_| ProcessorError::Disconnected)?
    }

    pub async fn enqueue(&self, spec: EnqueueSpec) -> Result<Vec<u64>, ProcessorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Intent::Enqueue { spec, reply })
            .await
            .map_err(|_| ProcessorError::Disconnected)?;
        rx.await.map_err(|_| ProcessorError::Disconnected)?
    }

    pub async fn flush(
        &self,
        queue: Option<String>,
        scope: FlushScope,
    ) -> Result<FlushOutcome, ProcessorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Intent::Flush {
                queue,
                scope,
                reply,
            })
            .await
            .map_err(|_| ProcessorError::Disconnected)?;
        rx.await.map_err(|_| ProcessorError::Disconnected)?
    }

    pub async fn list_queues(&self) -> Result<Vec<String>, ProcessorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Intent::ListQueues { reply })
            .await
            .map_err(|_| ProcessorError::Disconnected)?;
        rx.await.map_err(|_| ProcessorError::Disconnected)?
    }

    pub async fn shutdown(&self) -> Result<(), ProcessorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Intent::Shutdown { reply })
            .await
            .map_err(|_| ProcessorError::Disconnected)?;
        rx.await.map_err(|_| ProcessorError::Disconnected)
    }
}

/// Retry policy for transient placement failures. Both knobs come from
/// configuration rather than being hardcoded.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts per job before a transient failure escalates to Failed.
    pub max_attempts: u32,
    /// Consecutive transient failures before processing auto-pauses
    /// (0 disables auto-pause).
    pub pause_after_transient: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            pause_after_transient: 5,
        }
    }
}

/// What to do with a failed placement attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Put the job back to Pending without advancing the cursor.
    RetryInPlace,
    /// Mark the job Failed and move on.
    Escalate,
}

impl RetryPolicy {
    /// Decide for an attempt that just failed. `attempt_count` includes the
    /// failed attempt.
    pub fn decide(&self, attempt_count: u32, class: FailureClass) -> RetryDecision {
        match class {
            FailureClass::Fatal => RetryDecision::Escalate,
            FailureClass::Transient if attempt_count >= self.max_attempts => {
                RetryDecision::Escalate
            }
            FailureClass::Transient => RetryDecision::RetryInPlace,
        }
    }
}

/// Everything the processor needs, wired up by the daemon.
pub struct ProcessorParts {
    pub store: QueueStore,
    pub queue: Queue,
    pub pool: WorkerPool,
    pub results_rx: mpsc::Receiver<PoolResult>,
    pub intents: mpsc::Receiver<Intent>,
    pub tag_editor: Arc<dyn TagEditor>,
    pub profiles: Vec<Profile>,
    pub status: SharedStatus,
    pub cancel_tx: watch::Sender<u64>,
    pub policy: RetryPolicy,
}

#[derive(Debug, PartialEq)]
enum Flow {
    Continue,
    Exit,
}

#[derive(Debug, PartialEq)]
enum StepOutcome {
    /// Something committed or advanced; run another iteration right away.
    Progressed,
    /// Nothing to do until an intent or a pool result arrives.
    Wait,
}

/// The daemon core. Owns the focused queue; see module docs.
pub struct Processor {
    store: QueueStore,
    queue: Queue,
    mode: ProcessingMode,
    intents: mpsc::Receiver<Intent>,
    pool: WorkerPool,
    results_rx: mpsc::Receiver<PoolResult>,
    tag_editor: Arc<dyn TagEditor>,
    profiles: Vec<Profile>,
    default_profile: String,
    status: SharedStatus,
    cancel_tx: watch::Sender<u64>,
    policy: RetryPolicy,
    consecutive_transient: u32,
    /// Convert jobs handed to the pool and not yet committed.
    dispatched: HashSet<u64>,
    /// Finished transcodes waiting for their turn at the head.
    ready: HashMap<u64, Result<PathBuf, TranscodeError>>,
}

impl Processor {
    pub fn new(parts: ProcessorParts) -> Self {
        let default_profile = parts
            .profiles
            .first()
            .map(|p| p.name.clone())
            .unwrap_or_else(|| "mp3-v0".to_string());
        Self {
            store: parts.store,
            queue: parts.queue,
            mode: ProcessingMode::Stopped,
            intents: parts.intents,
            pool: parts.pool,
            results_rx: parts.results_rx,
            tag_editor: parts.tag_editor,
            profiles: parts.profiles,
            default_profile,
            status: parts.status,
            cancel_tx: parts.cancel_tx,
            policy: parts.policy,
            consecutive_transient: 0,
            dispatched: HashSet::new(),
            ready: HashMap::new(),
        }
    }

    /// Drive the queue until shutdown.
    pub async fn run(mut self) {
        self.publish_status().await;

        loop {
            // Keep control responsive: drain whatever is already waiting
            // before touching the queue again.
            loop {
                match self.intents.try_recv() {
                    Ok(intent) => {
                        if self.handle_intent(intent).await == Flow::Exit {
                            return;
                        }
                    }
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => return,
                }
            }
            while let Ok(result) = self.results_rx.try_recv() {
                self.accept_result(result);
            }

            if self.mode == ProcessingMode::Running {
                self.fill_pool().await;
                match self.step().await {
                    StepOutcome::Progressed => continue,
                    StepOutcome::Wait => {
                        if self.wait_for_event().await == Flow::Exit {
                            return;
                        }
                    }
                }
            } else if self.wait_for_event().await == Flow::Exit {
                return;
            }
        }
    }

    /// Block until an intent or a pool result arrives.
    async fn wait_for_event(&mut self) -> Flow {
        tokio::select! {
            maybe_intent = self.intents.recv() => match maybe_intent {
                Some(intent) => self.handle_intent(intent).await,
                None => Flow::Exit,
            },
            maybe_result = self.results_rx.recv() => {
                if let Some(result) = maybe_result {
                    self.accept_result(result);
                }
                Flow::Continue
            }
        }
    }

    fn accept_result(&mut self, result: PoolResult) {
        let current_generation = *self.cancel_tx.borrow();
        if result.generation != current_generation || !self.dispatched.contains(&result.job_id) {
            // A result from before a stop or queue switch; its job was
            // reset, so the output must not be promoted.
            if let Ok(path) = &result.outcome {
                let _ = std::fs::remove_file(path);
            }
            debug!(job_id = result.job_id, "discarding stale transcode result");
            return;
        }
        self.ready.insert(result.job_id, result.outcome);
    }

    /// Dispatch pending transcodes from the cursor forward, up to the pool
    /// bound. Copy/move jobs and skips are left for head-of-line handling.
    async fn fill_pool(&mut self) {
        let capacity = self.pool.workers() as usize;
        let mut in_flight = self
            .dispatched
            .iter()
            .filter(|id| !self.ready.contains_key(id))
            .count();
        let mut marked = false;

        for idx in self.queue.cursor..self.queue.jobs.len() {
            if in_flight >= capacity {
                break;
            }
            let (id, eligible) = {
                let job = &self.queue.jobs[idx];
                let eligible = job.status == JobStatus::Pending
                    && !self.dispatched.contains(&job.id)
                    && !self.ready.contains_key(&job.id)
                    && evaluate(job) == Decision::Run(EffectiveOp::Transcode);
                (job.id, eligible)
            };
            if !eligible {
                continue;
            }

            let profile = self.profile_name(&self.queue.jobs[idx]);
            let (src, remove_art) = {
                let job = &mut self.queue.jobs[idx];
                job.mark_running();
                (job.source_path.clone(), job.conditions.remove_art)
            };
            debug!(job_id = id, profile = %profile, "dispatching transcode");
            self.dispatched.insert(id);
            self.pool.submit(id, src, profile, remove_art);
            in_flight += 1;
            marked = true;
        }

        if marked {
            self.checkpoint().await;
            self.publish_status().await;
        }
    }

    /// Process the job at the cursor.
    async fn step(&mut self) -> StepOutcome {
        if self.queue.cursor >= self.queue.jobs.len() {
            return StepOutcome::Wait;
        }

        let idx = self.queue.cursor;
        let (id, status) = {
            let job = &self.queue.jobs[idx];
            (job.id, job.status)
        };

        if matches!(
            status,
            JobStatus::Done | JobStatus::Skipped | JobStatus::Failed
        ) {
            self.queue.cursor += 1;
            self.checkpoint().await;
            return StepOutcome::Progressed;
        }

        match evaluate(&self.queue.jobs[idx]) {
            Decision::Skip => {
                debug!(job_id = id, "skipped by conditions");
                self.queue.jobs[idx].mark_skipped();
                self.queue.cursor += 1;
                self.checkpoint().await;
                self.publish_status().await;
                StepOutcome::Progressed
            }
            Decision::Run(EffectiveOp::Transcode) => {
                if let Some(outcome) = self.ready.remove(&id) {
                    self.commit_transcoded(idx, outcome).await;
                    StepOutcome::Progressed
                } else {
                    // Computing in the pool, or waiting for a slot.
                    StepOutcome::Wait
                }
            }
            Decision::Run(EffectiveOp::Copy) => {
                let (src, dst) = {
                    let job = &self.queue.jobs[idx];
                    (job.source_path.clone(), job.destination_path.clone())
                };
                self.commit_placement(idx, PlaceRequest::Copy { src, dst })
                    .await;
                StepOutcome::Progressed
            }
            Decision::Run(EffectiveOp::Move) => {
                let (src, dst) = {
                    let job = &self.queue.jobs[idx];
                    (job.source_path.clone(), job.destination_path.clone())
                };
                self.commit_placement(idx, PlaceRequest::Move { src, dst })
                    .await;
                StepOutcome::Progressed
            }
        }
    }

    /// Hand a finished transcode to the serializer, swapping the destination
    /// extension to the profile's format.
    async fn commit_transcoded(
        &mut self,
        idx: usize,
        outcome: Result<PathBuf, TranscodeError>,
    ) {
        match outcome {
            Ok(temp) => {
                let dst = {
                    let job = &self.queue.jobs[idx];
                    job.destination_path
                        .with_extension(self.profile_extension(job))
                };
                self.commit_placement(idx, PlaceRequest::Promote { temp, dst })
                    .await;
            }
            Err(e) => {
                // External tool failure: fatal for this job, queue continues.
                let msg = format!("transcode failed: {}", e);
                self.fail_job(idx, &msg).await;
            }
        }
    }

    /// Run one serialized placement for the head job and commit the outcome.
    async fn commit_placement(&mut self, idx: usize, request: PlaceRequest) {
        let id = {
            let job = &mut self.queue.jobs[idx];
            job.mark_running();
            job.id
        };
        self.checkpoint().await;
        self.publish_status().await;

        let req = request.clone();
        let result = tokio::task::spawn_blocking(move || WriteSerializer.place(&req))
            .await
            .unwrap_or_else(|e| Err(PlaceError::Io(std::io::Error::other(e))));

        match result {
            Ok(()) => {
                if let Err(e) = self.post_process(idx, &request).await {
                    let msg = format!("tag edit failed: {}", e);
                    self.fail_job(idx, &msg).await;
                    return;
                }
                let job = &mut self.queue.jobs[idx];
                job.mark_done();
                info!(job_id = id, "job done");
                self.dispatched.remove(&id);
                self.queue.cursor += 1;
                self.consecutive_transient = 0;
                self.checkpoint().await;
                self.publish_status().await;
            }
            Err(err) => {
                let class = classify(&err);
                let attempts = {
                    let job = &mut self.queue.jobs[idx];
                    job.attempt_count += 1;
                    job.attempt_count
                };
                match self.policy.decide(attempts, class) {
                    RetryDecision::RetryInPlace => {
                        warn!(job_id = id, attempts, error = %err, "transient failure, retrying in place");
                        self.queue.jobs[idx].reset_pending();
                        // A finished transcode survives the retry; only the
                        // placement is redone.
                        if let PlaceRequest::Promote { temp, .. } = &request {
                            if temp.exists() {
                                self.ready.insert(id, Ok(temp.clone()));
                            }
                        }
                        self.consecutive_transient += 1;
                        self.checkpoint().await;
                        self.set_last_error(Some(err.to_string())).await;
                        self.publish_status().await;

                        let limit = self.policy.pause_after_transient;
                        if limit > 0 && self.consecutive_transient >= limit {
                            warn!(limit, "auto-pausing after consecutive transient failures");
                            self.mode = ProcessingMode::Paused;
                            self.set_last_error(Some(format!(
                                "auto-paused after {} consecutive transient failures: {}",
                                limit, err
                            )))
                            .await;
                            self.publish_status().await;
                        } else {
                            tokio::time::sleep(Duration::from_millis(RETRY_BACKOFF_MS)).await;
                        }
                    }
                    RetryDecision::Escalate => {
                        let msg = err.to_string();
                        self.fail_job(idx, &msg).await;
                    }
                }
            }
        }
    }

    /// Apply the orthogonal remove-art flag to the placed file.
    async fn post_process(
        &mut self,
        idx: usize,
        request: &PlaceRequest,
    ) -> Result<(), TranscodeError> {
        if !self.queue.jobs[idx].conditions.remove_art {
            return Ok(());
        }
        let dst = match request {
            PlaceRequest::Copy { dst, .. }
            | PlaceRequest::Move { dst, .. }
            | PlaceRequest::Promote { dst, .. } => dst.clone(),
        };
        let editor = self.tag_editor.clone();
        tokio::task::spawn_blocking(move || editor.strip_art(&dst))
            .await
            .unwrap_or_else(|e| Err(TranscodeError::Io(std::io::Error::other(e))))
    }

    /// Mark the head job failed and move past it; one bad job never blocks
    /// the rest of the queue.
    async fn fail_job(&mut self, idx: usize, msg: &str) {
        let id = self.queue.jobs[idx].id;
        error!(job_id = id, error = msg, "job failed");
        self.queue.jobs[idx].mark_failed(msg);
        self.dispatched.remove(&id);
        self.queue.cursor += 1;
        self.consecutive_transient = 0;
        self.checkpoint().await;
        self.set_last_error(Some(msg.to_string())).await;
        self.publish_status().await;
    }

    async fn handle_intent(&mut self, intent: Intent) -> Flow {
        match intent {
            Intent::Start => {
                if self.mode != ProcessingMode::Running {
                    info!(queue = %self.queue.name, "start processing");
                    self.mode = ProcessingMode::Running;
                    self.consecutive_transient = 0;
                    self.set_last_error(None).await;
                    self.publish_status().await;
                }
                Flow::Continue
            }
            Intent::Pause => {
                if self.mode == ProcessingMode::Running {
                    info!("pause processing");
                    self.mode = ProcessingMode::Paused;
                    self.publish_status().await;
                }
                Flow::Continue
            }
            Intent::Stop => {
                self.stop_processing().await;
                Flow::Continue
            }
            Intent::SelectQueue { name, reply } => {
                let result = self.select_queue(&name).await;
                let _ = reply.send(result);
                Flow::Continue
            }
            Intent::Enqueue { spec, reply } => {
                let result = self.enqueue(spec).await;
                let _ = reply.send(result);
                Flow::Continue
            }
            Intent::Flush {
                queue,
                scope,
                reply,
            } => {
                let result = self.flush(queue, scope).await;
                let _ = reply.send(result);
                Flow::Continue
            }
            Intent::ListQueues { reply } => {
                let _ = reply.send(self.list_queues());
                Flow::Continue
            }
            Intent::Shutdown { reply } => {
                info!("shutdown requested");
                self.stop_processing().await;
                let _ = reply.send(());
                Flow::Exit
            }
        }
    }

    /// Cooperative stop: cancel in-flight transcodes, discard their temp
    /// output, reset Running jobs and checkpoint a resumable snapshot.
    async fn stop_processing(&mut self) {
        info!("stop processing");
        self.mode = ProcessingMode::Stopped;
        self.cancel_in_flight();
        self.checkpoint().await;
        self.publish_status().await;
    }

    fn cancel_in_flight(&mut self) {
        if !self.dispatched.is_empty() || !self.ready.is_empty() {
            // Bumping the generation makes every submitted task discard its
            // work at the next safe boundary.
            self.cancel_tx.send_modify(|generation| *generation += 1);
            for (_, outcome) in self.ready.drain() {
                if let Ok(path) = outcome {
                    let _ = std::fs::remove_file(&path);
                }
            }
            self.dispatched.clear();
        }
        for job in &mut self.queue.jobs {
            if job.status == JobStatus::Running {
                // Not a failure and not a crash, so the attempt count stays.
                job.reset_pending();
            }
        }
        self.queue.normalize_cursor();
    }

    async fn select_queue(&mut self, name: &str) -> Result<(), ProcessorError> {
        if !valid_queue_name(name) {
            return Err(ProcessorError::Invalid(format!(
                "invalid queue name '{}'",
                name
            )));
        }
        if name == self.queue.name {
            return Ok(());
        }

        self.cancel_in_flight();
        self.checkpoint().await;

        let mut queue = self.store.load_or_create(name)?;
        let recovered = queue.recover_running();
        if recovered > 0 {
            self.store.persist_checkpoint(&queue)?;
        }
        info!(queue = name, "selected queue");
        self.queue = queue;
        self.publish_status().await;
        Ok(())
    }

    async fn enqueue(&mut self, spec: EnqueueSpec) -> Result<Vec<u64>, ProcessorError> {
        if spec.sources.is_empty() {
            return Err(ProcessorError::Invalid("no sources given".to_string()));
        }
        if !spec.destination.is_absolute() {
            return Err(ProcessorError::Invalid(format!(
                "destination must be absolute: {}",
                spec.destination.display()
            )));
        }
        if let Some(profile) = &spec.conditions.profile {
            if !self.profiles.iter().any(|p| &p.name == profile) {
                return Err(ProcessorError::Invalid(format!(
                    "unknown transcode profile '{}'",
                    profile
                )));
            }
        }
        let target = spec
            .queue
            .clone()
            .unwrap_or_else(|| self.queue.name.clone());
        if !valid_queue_name(&target) {
            return Err(ProcessorError::Invalid(format!(
                "invalid queue name '{}'",
                target
            )));
        }

        let mut seeds = Vec::with_capacity(spec.sources.len());
        for src in &spec.sources {
            if !src.is_absolute() {
                return Err(ProcessorError::Invalid(format!(
                    "source path must be absolute: {}",
                    src.display()
                )));
            }
            let file_name = src.file_name().ok_or_else(|| {
                ProcessorError::Invalid(format!("source has no file name: {}", src.display()))
            })?;
            let size_bytes = std::fs::metadata(src).map(|m| m.len()).unwrap_or(0);
            seeds.push(JobSeed {
                operation: spec.operation,
                source_path: src.clone(),
                destination_path: spec.destination.join(file_name),
                conditions: spec.conditions.clone(),
                size_bytes,
            });
        }

        if target == self.queue.name {
            if spec.reset {
                info!(queue = %target, "replacing queue before enqueue");
                self.cancel_in_flight();
                self.queue = Queue::new(&target);
            }
            let ids = self.queue.append_seeds(seeds);
            debug!(queue = %target, count = ids.len(), "enqueued jobs");
            self.checkpoint().await;
            self.publish_status().await;
            Ok(ids)
        } else if spec.reset {
            let mut queue = Queue::new(&target);
            let ids = queue.append_seeds(seeds);
            self.store.persist_checkpoint(&queue)?;
            Ok(ids)
        } else {
            Ok(self.store.append(&target, seeds)?)
        }
    }

    async fn flush(
        &mut self,
        queue: Option<String>,
        scope: FlushScope,
    ) -> Result<FlushOutcome, ProcessorError> {
        let target = queue.unwrap_or_else(|| self.queue.name.clone());

        if target == self.queue.name {
            if scope == FlushScope::All {
                self.cancel_in_flight();
            }
            let outcome = apply_flush(&mut self.queue, scope);
            self.checkpoint().await;
            self.set_last_error(None).await;
            self.publish_status().await;
            Ok(outcome)
        } else {
            let mut other = self.store.load(&target)?;
            let outcome = apply_flush(&mut other, scope);
            self.store.persist_checkpoint(&other)?;
            Ok(outcome)
        }
    }

    fn list_queues(&self) -> Result<Vec<String>, ProcessorError> {
        let mut names = self.store.list_names()?;
        if !names.contains(&self.queue.name) {
            names.push(self.queue.name.clone());
            names.sort();
        }
        Ok(names)
    }

    fn profile_name(&self, job: &Job) -> String {
        job.conditions
            .profile
            .clone()
            .unwrap_or_else(|| self.default_profile.clone())
    }

    fn profile_extension(&self, job: &Job) -> String {
        let name = self.profile_name(job);
        self.profiles
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.format.clone())
            .unwrap_or(name)
    }

    async fn checkpoint(&mut self) {
        if let Err(e) = self.store.persist_checkpoint(&self.queue) {
            // Progress cannot be persisted; pause instead of spinning
            // against a broken store.
            error!(error = %e, "checkpoint failed, pausing");
            self.mode = ProcessingMode::Paused;
            self.set_last_error(Some(format!("checkpoint failed: {}", e)))
                .await;
        }
    }

    async fn set_last_error(&self, msg: Option<String>) {
        self.status.write().await.last_error = msg;
    }

    async fn publish_status(&self) {
        let counts = ProgressCounts::from_jobs(&self.queue.jobs);
        let current_job_id = self
            .queue
            .jobs
            .get(self.queue.cursor)
            .filter(|j| j.status == JobStatus::Running)
            .map(|j| j.id);

        let mut snapshot = self.status.write().await;
        snapshot.mode = self.mode;
        snapshot.queue = self.queue.name.clone();
        snapshot.current_job_id = current_job_id;
        snapshot.counts = counts;
    }
}

fn apply_flush(queue: &mut Queue, scope: FlushScope) -> FlushOutcome {
    match scope {
        FlushScope::All => {
            let removed = queue.jobs.len();
            queue.jobs.clear();
            queue.cursor = 0;
            FlushOutcome { removed, reset: 0 }
        }
        FlushScope::Pending => {
            let before = queue.jobs.len();
            queue.jobs.retain(|j| j.status != JobStatus::Pending);
            queue.normalize_cursor();
            FlushOutcome {
                removed: before - queue.jobs.len(),
                reset: 0,
            }
        }
        FlushScope::Failed => {
            let mut reset = 0;
            for job in &mut queue.jobs {
                if job.status == JobStatus::Failed {
                    job.reset_for_retry();
                    reset += 1;
                }
            }
            queue.normalize_cursor();
            FlushOutcome { removed: 0, reset }
        }
    }
}
