//! Job records for the transfer queue.
//!
//! A job is one durable file operation (copy, move or convert) together with
//! its filter conditions and lifecycle status. Jobs are persisted as part of
//! a queue snapshot and only ever move forward through their status machine.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// The file operation a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Copy the source file to the destination.
    Copy,
    /// Move the source file to the destination.
    Move,
    /// Transcode the source file, then place the result at the destination.
    Convert,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Copy => write!(f, "copy"),
            Operation::Move => write!(f, "move"),
            Operation::Convert => write!(f, "convert"),
        }
    }
}

/// Lifecycle status of a job.
///
/// Transitions only move forward: Pending -> Running -> {Done, Skipped,
/// Failed}. The two sanctioned ways back to Pending are crash recovery
/// (a Running job found on daemon start) and retry-in-place after a
/// transient write failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job is waiting to be processed.
    Pending,
    /// Job is currently being executed.
    Running,
    /// Job completed successfully.
    Done,
    /// Job was rejected by its conditions.
    Skipped,
    /// Job failed; `error` holds the reason.
    Failed,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Done => write!(f, "done"),
            JobStatus::Skipped => write!(f, "skipped"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Filter conditions attached to a job. All fields default to unrestricted.
///
/// Extensions are stored lowercased without the leading dot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conditions {
    /// Only files with these extensions are accepted (empty = all).
    #[serde(default)]
    pub include: BTreeSet<String>,
    /// Files with these extensions are skipped.
    #[serde(default)]
    pub exclude: BTreeSet<String>,
    /// For Convert jobs: only these extensions are transcoded, the rest
    /// pass through as plain copies.
    #[serde(default)]
    pub convert_only: BTreeSet<String>,
    /// Strip embedded album art from the placed file.
    #[serde(default)]
    pub remove_art: bool,
    /// Transcode profile name; None selects the daemon's default profile.
    #[serde(default)]
    pub profile: Option<String>,
}

impl Conditions {
    /// True when no filter or flag is set.
    pub fn is_unrestricted(&self) -> bool {
        self.include.is_empty()
            && self.exclude.is_empty()
            && self.convert_only.is_empty()
            && !self.remove_art
            && self.profile.is_none()
    }
}

/// A durable unit of work in a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Queue-unique id, strictly increasing in enqueue order.
    pub id: u64,
    /// The operation to perform. Never changes after creation.
    pub operation: Operation,
    /// Absolute path of the source file.
    pub source_path: PathBuf,
    /// Absolute path of the destination file.
    pub destination_path: PathBuf,
    /// Current lifecycle status.
    #[serde(default)]
    pub status: JobStatus,
    /// Filter conditions evaluated at execution time.
    #[serde(default)]
    pub conditions: Conditions,
    /// Source size captured at enqueue time (0 if unknown).
    #[serde(default)]
    pub size_bytes: u64,
    /// Number of failed or recovered execution attempts.
    #[serde(default)]
    pub attempt_count: u32,
    /// Last failure description, present only for Failed jobs.
    #[serde(default)]
    pub error: Option<String>,
    /// Unix timestamp (milliseconds) when the job was enqueued.
    pub created_at: i64,
    /// Unix timestamp (milliseconds) of the first execution attempt.
    #[serde(default)]
    pub started_at: Option<i64>,
    /// Unix timestamp (milliseconds) when the job reached a terminal status.
    #[serde(default)]
    pub finished_at: Option<i64>,
}

impl Job {
    /// Create a new pending job.
    pub fn new(
        id: u64,
        operation: Operation,
        source_path: PathBuf,
        destination_path: PathBuf,
        conditions: Conditions,
        size_bytes: u64,
    ) -> Self {
        Self {
            id,
            operation,
            source_path,
            destination_path,
            status: JobStatus::Pending,
            conditions,
            size_bytes,
            attempt_count: 0,
            error: None,
            created_at: current_timestamp_ms(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Lowercased extension of the source file, without the dot.
    pub fn source_extension(&self) -> Option<String> {
        self.source_path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
    }

    /// Mark the job as running. `started_at` is set on the first attempt only.
    pub fn mark_running(&mut self) {
        self.status = JobStatus::Running;
        if self.started_at.is_none() {
            self.started_at = Some(current_timestamp_ms());
        }
    }

    /// Mark the job as successfully completed.
    pub fn mark_done(&mut self) {
        self.status = JobStatus::Done;
        self.error = None;
        self.finished_at = Some(current_timestamp_ms());
    }

    /// Mark the job as skipped by its conditions.
    pub fn mark_skipped(&mut self) {
        self.status = JobStatus::Skipped;
        self.finished_at = Some(current_timestamp_ms());
    }

    /// Mark the job as failed with a reason.
    pub fn mark_failed(&mut self, reason: &str) {
        self.status = JobStatus::Failed;
        self.error = Some(reason.to_string());
        self.finished_at = Some(current_timestamp_ms());
    }

    /// Put the job back to Pending for retry-in-place or cooperative stop.
    /// Attempt accounting is the caller's responsibility.
    pub fn reset_pending(&mut self) {
        self.status = JobStatus::Pending;
    }

    /// Clear failure state so the job can run again after `flush failed`.
    pub fn reset_for_retry(&mut self) {
        self.status = JobStatus::Pending;
        self.attempt_count = 0;
        self.error = None;
        self.finished_at = None;
    }

    /// Check if the job is in a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            JobStatus::Done | JobStatus::Skipped | JobStatus::Failed
        )
    }

    /// Check if the job still needs processing.
    pub fn is_active(&self) -> bool {
        matches!(self.status, JobStatus::Pending | JobStatus::Running)
    }
}

/// Get current timestamp in milliseconds since Unix epoch.
pub(crate) fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
