//! Shared daemon status for the control endpoint.
//!
//! The queue processor owns the truth and publishes a snapshot after every
//! checkpoint; the control endpoint only ever reads it. Status therefore
//! always reflects the last successfully checkpointed state.

use crate::job::{Job, JobStatus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Processing mode of the queue processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMode {
    /// Not processing; the initial state.
    Stopped,
    /// Draining the focused queue.
    Running,
    /// Processing suspended; in-flight work drains without committing.
    Paused,
}

impl Default for ProcessingMode {
    fn default() -> Self {
        Self::Stopped
    }
}

impl std::fmt::Display for ProcessingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessingMode::Stopped => write!(f, "stopped"),
            ProcessingMode::Running => write!(f, "running"),
            ProcessingMode::Paused => write!(f, "paused"),
        }
    }
}

/// Per-status job tallies plus bytes-equivalent progress.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressCounts {
    pub pending: usize,
    pub running: usize,
    pub done: usize,
    pub skipped: usize,
    pub failed: usize,
    pub total: usize,
    pub bytes_done: u64,
    pub bytes_total: u64,
}

impl ProgressCounts {
    /// Tally a job list. Skipped jobs count toward `total` but not toward
    /// the bytes that need moving.
    pub fn from_jobs(jobs: &[Job]) -> Self {
        let mut counts = Self::default();
        for job in jobs {
            counts.total += 1;
            match job.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Running => counts.running += 1,
                JobStatus::Done => counts.done += 1,
                JobStatus::Skipped => counts.skipped += 1,
                JobStatus::Failed => counts.failed += 1,
            }
            if job.status != JobStatus::Skipped {
                counts.bytes_total += job.size_bytes;
            }
            if job.status == JobStatus::Done {
                counts.bytes_done += job.size_bytes;
            }
        }
        counts
    }

    /// Fraction of non-skipped jobs completed, in percent. An empty (or
    /// fully skipped) queue reads as 100.
    pub fn percent(&self) -> f64 {
        let denominator = self.total - self.skipped;
        if denominator == 0 {
            100.0
        } else {
            self.done as f64 / denominator as f64 * 100.0
        }
    }
}

/// Snapshot of daemon runtime state as of the last checkpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub mode: ProcessingMode,
    pub queue: String,
    pub current_job_id: Option<u64>,
    pub last_error: Option<String>,
    pub counts: ProgressCounts,
}

/// Shared handle to the status snapshot.
pub type SharedStatus = Arc<RwLock<StatusSnapshot>>;

/// Create a fresh shared status snapshot.
pub fn new_shared_status() -> SharedStatus {
    Arc::new(RwLock::new(StatusSnapshot::default()))
}
