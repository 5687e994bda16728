//! Queue store: crash-safe persistence for named queues.
//!
//! Every queue is one JSON document under `<state_dir>/queues/<name>.json`
//! holding the cursor and the ordered job list. Checkpoints are written to a
//! temp file and renamed into place, so a snapshot either fully lands or not
//! at all. The schema is stable and plain enough that a shell script can
//! construct a valid queue without going through the daemon.
//!
//! A pid lockfile in the state directory ensures a single daemon owns the
//! store at a time.

use crate::job::{Conditions, Job, JobStatus, Operation};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Name of the queue targeted when the caller does not pick one.
pub const DEFAULT_QUEUE: &str = "last";

/// On-disk schema version. Bumped only on breaking changes within a major
/// release, which the loader rejects.
pub const FORMAT_VERSION: u32 = 1;

const QUEUES_DIR: &str = "queues";
const LOCK_FILE: &str = "daemon.lock";

/// Error type for queue store operations
#[derive(Debug, Error)]
pub enum StoreError {
    /// The named queue has no snapshot on disk.
    #[error("queue '{0}' not found")]
    NotFound(String),

    /// Queue names are restricted to a filesystem-safe alphabet.
    #[error("invalid queue name '{0}'")]
    InvalidName(String),

    /// The snapshot exists but cannot be parsed. Fatal for this queue only.
    #[error("queue '{name}' state is corrupt: {reason}")]
    Corrupt { name: String, reason: String },

    /// Another live daemon owns this store.
    #[error("queue store is locked by running process {pid}")]
    Locked { pid: u32 },

    /// IO error accessing the store.
    #[error("store io error: {0}")]
    Io(#[from] io::Error),
}

/// Everything needed to build a job except its id, which the target queue
/// assigns at append time.
#[derive(Debug, Clone)]
pub struct JobSeed {
    pub operation: Operation,
    pub source_path: PathBuf,
    pub destination_path: PathBuf,
    pub conditions: Conditions,
    pub size_bytes: u64,
}

/// A named, ordered, persisted sequence of jobs plus a resume cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Queue {
    pub version: u32,
    pub name: String,
    /// Index of the next job to attempt. Never advances past an unfinished job.
    pub cursor: usize,
    /// Next id handed out by `assign_id`; ids are strictly increasing.
    pub next_job_id: u64,
    pub jobs: Vec<Job>,
}

impl Queue {
    /// Create an empty queue with the given name.
    pub fn new(name: &str) -> Self {
        Self {
            version: FORMAT_VERSION,
            name: name.to_string(),
            cursor: 0,
            next_job_id: 1,
            jobs: Vec::new(),
        }
    }

    /// Hand out the next job id.
    pub fn assign_id(&mut self) -> u64 {
        let id = self.next_job_id;
        self.next_job_id += 1;
        id
    }

    /// Append jobs built from seeds at the tail, assigning ids in order.
    pub fn append_seeds(&mut self, seeds: Vec<JobSeed>) -> Vec<u64> {
        let mut ids = Vec::with_capacity(seeds.len());
        for seed in seeds {
            let id = self.assign_id();
            self.jobs.push(Job::new(
                id,
                seed.operation,
                seed.source_path,
                seed.destination_path,
                seed.conditions,
                seed.size_bytes,
            ));
            ids.push(id);
        }
        ids
    }

    /// Reset any Running job to Pending and count the attempt.
    ///
    /// A Running record in a loaded snapshot means a previous daemon died
    /// mid-job; the work is never assumed complete. Returns the number of
    /// recovered jobs.
    pub fn recover_running(&mut self) -> usize {
        let mut recovered = 0;
        for job in &mut self.jobs {
            if job.status == JobStatus::Running {
                job.reset_pending();
                job.attempt_count += 1;
                recovered += 1;
            }
        }
        if recovered > 0 {
            self.normalize_cursor();
        }
        recovered
    }

    /// Point the cursor at the first job that still needs processing.
    pub fn normalize_cursor(&mut self) {
        self.cursor = self
            .jobs
            .iter()
            .position(|j| j.is_active())
            .unwrap_or(self.jobs.len());
    }
}

/// Persistence layer mapping queue names to snapshots on disk.
pub struct QueueStore {
    root: PathBuf,
}

impl QueueStore {
    /// Open (and create if needed) the store rooted at `state_dir`.
    pub fn open(state_dir: &Path) -> Result<Self, StoreError> {
        let root = state_dir.to_path_buf();
        fs::create_dir_all(root.join(QUEUES_DIR))?;
        Ok(Self { root })
    }

    /// The directory queue snapshots live in.
    pub fn queues_dir(&self) -> PathBuf {
        self.root.join(QUEUES_DIR)
    }

    fn queue_path(&self, name: &str) -> Result<PathBuf, StoreError> {
        if !valid_queue_name(name) {
            return Err(StoreError::InvalidName(name.to_string()));
        }
        Ok(self.queues_dir().join(format!("{}.json", name)))
    }

    /// Load a queue snapshot. Fails with `NotFound` if no snapshot exists.
    pub fn load(&self, name: &str) -> Result<Queue, StoreError> {
        let path = self.queue_path(name)?;
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let queue: Queue = serde_json::from_str(&content).map_err(|e| StoreError::Corrupt {
            name: name.to_string(),
            reason: e.to_string(),
        })?;

        if queue.version != FORMAT_VERSION {
            return Err(StoreError::Corrupt {
                name: name.to_string(),
                reason: format!("unsupported snapshot version {}", queue.version),
            });
        }

        Ok(queue)
    }

    /// Load a queue, creating an empty one for a brand-new name.
    pub fn load_or_create(&self, name: &str) -> Result<Queue, StoreError> {
        match self.load(name) {
            Ok(queue) => Ok(queue),
            Err(StoreError::NotFound(_)) => {
                info!(queue = name, "initializing new queue");
                Ok(Queue::new(name))
            }
            Err(e) => Err(e),
        }
    }

    /// Atomically persist a queue snapshot: write to a temp sibling, then
    /// rename over the target. A crash mid-write leaves the previous
    /// snapshot intact.
    pub fn persist_checkpoint(&self, queue: &Queue) -> Result<(), StoreError> {
        let path = self.queue_path(&queue.name)?;
        let tmp = path.with_extension("json.tmp");

        let json = serde_json::to_string_pretty(queue).map_err(|e| StoreError::Corrupt {
            name: queue.name.clone(),
            reason: e.to_string(),
        })?;

        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;
        debug!(queue = %queue.name, cursor = queue.cursor, jobs = queue.jobs.len(), "checkpoint");
        Ok(())
    }

    /// Append jobs to a named queue on disk and checkpoint, returning the
    /// assigned ids.
    pub fn append(&self, name: &str, seeds: Vec<JobSeed>) -> Result<Vec<u64>, StoreError> {
        let mut queue = self.load_or_create(name)?;
        let ids = queue.append_seeds(seeds);
        self.persist_checkpoint(&queue)?;
        Ok(ids)
    }

    /// Names of all queues with a snapshot on disk, sorted.
    pub fn list_names(&self) -> Result<Vec<String>, StoreError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(self.queues_dir())? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Queue names double as file names; keep them to a safe alphabet.
pub fn valid_queue_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Exclusive ownership of a queue store, backed by a pid lockfile.
///
/// A lockfile whose pid no longer exists under /proc is stale (the previous
/// daemon crashed) and is taken over. The lock is released on drop.
pub struct StoreLock {
    path: PathBuf,
}

impl StoreLock {
    /// Acquire the store lock, failing if another live daemon holds it.
    pub fn acquire(state_dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(state_dir)?;
        let path = state_dir.join(LOCK_FILE);

        if let Ok(contents) = fs::read_to_string(&path) {
            if let Ok(pid) = contents.trim().parse::<u32>() {
                if Path::new("/proc").join(pid.to_string()).exists() {
                    return Err(StoreError::Locked { pid });
                }
                warn!(stale_pid = pid, "taking over stale daemon lock");
            }
        }

        fs::write(&path, std::process::id().to_string())?;
        Ok(Self { path })
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seed(src: &str, dst: &str) -> JobSeed {
        JobSeed {
            operation: Operation::Copy,
            source_path: PathBuf::from(src),
            destination_path: PathBuf::from(dst),
            conditions: Conditions::default(),
            size_bytes: 0,
        }
    }

    #[test]
    fn test_load_missing_queue_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = QueueStore::open(dir.path()).unwrap();

        match store.load("nope") {
            Err(StoreError::NotFound(name)) => assert_eq!(name, "nope"),
            other => panic!("expected NotFound, got {:?}", other.map(|q| q.name)),
        }
    }

    #[test]
    fn test_load_or_create_returns_empty_queue() {
        let dir = TempDir::new().unwrap();
        let store = QueueStore::open(dir.path()).unwrap();

        let queue = store.load_or_create("fresh").unwrap();
        assert_eq!(queue.name, "fresh");
        assert_eq!(queue.cursor, 0);
        assert_eq!(queue.next_job_id, 1);
        assert!(queue.jobs.is_empty());
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = QueueStore::open(dir.path()).unwrap();

        let mut queue = Queue::new("trip");
        queue.append_seeds(vec![seed("/music/a.mp3", "/mnt/a.mp3")]);
        queue.jobs[0].mark_running();
        queue.jobs[0].mark_done();
        queue.cursor = 1;

        store.persist_checkpoint(&queue).unwrap();
        let loaded = store.load("trip").unwrap();
        assert_eq!(loaded, queue);
    }

    #[test]
    fn test_checkpoint_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let store = QueueStore::open(dir.path()).unwrap();

        let queue = Queue::new("clean");
        store.persist_checkpoint(&queue).unwrap();

        let leftovers: Vec<_> = fs::read_dir(store.queues_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_ids_strictly_increase_across_appends() {
        let dir = TempDir::new().unwrap();
        let store = QueueStore::open(dir.path()).unwrap();

        let first = store
            .append("ids", vec![seed("/a", "/x/a"), seed("/b", "/x/b")])
            .unwrap();
        let second = store.append("ids", vec![seed("/c", "/x/c")]).unwrap();

        assert_eq!(first, vec![1, 2]);
        assert_eq!(second, vec![3]);

        let queue = store.load("ids").unwrap();
        let ids: Vec<u64> = queue.jobs.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_corrupt_snapshot_reported_per_queue() {
        let dir = TempDir::new().unwrap();
        let store = QueueStore::open(dir.path()).unwrap();

        fs::write(store.queues_dir().join("broken.json"), "{not json").unwrap();

        match store.load("broken") {
            Err(StoreError::Corrupt { name, .. }) => assert_eq!(name, "broken"),
            other => panic!("expected Corrupt, got {:?}", other.map(|q| q.name)),
        }

        // Other queues keep working.
        assert!(store.load_or_create("fine").is_ok());
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let dir = TempDir::new().unwrap();
        let store = QueueStore::open(dir.path()).unwrap();

        let mut queue = Queue::new("versioned");
        queue.version = 99;
        let json = serde_json::to_string(&queue).unwrap();
        fs::write(store.queues_dir().join("versioned.json"), json).unwrap();

        assert!(matches!(
            store.load("versioned"),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_externally_written_snapshot_loads() {
        // The documented schema must stay constructible without the daemon.
        let dir = TempDir::new().unwrap();
        let store = QueueStore::open(dir.path()).unwrap();

        let json = r#"{
            "version": 1,
            "name": "handmade",
            "cursor": 0,
            "next_job_id": 2,
            "jobs": [
                {
                    "id": 1,
                    "operation": "copy",
                    "source_path": "/music/a.mp3",
                    "destination_path": "/mnt/player/a.mp3",
                    "created_at": 1722950000000
                }
            ]
        }"#;
        fs::write(store.queues_dir().join("handmade.json"), json).unwrap();

        let queue = store.load("handmade").unwrap();
        assert_eq!(queue.jobs.len(), 1);
        assert_eq!(queue.jobs[0].status, JobStatus::Pending);
        assert_eq!(queue.jobs[0].attempt_count, 0);
        assert!(queue.jobs[0].conditions.is_unrestricted());
    }

    #[test]
    fn test_list_names() {
        let dir = TempDir::new().unwrap();
        let store = QueueStore::open(dir.path()).unwrap();

        store.append("beta", vec![seed("/a", "/x/a")]).unwrap();
        store.append("alpha", vec![seed("/b", "/x/b")]).unwrap();

        assert_eq!(store.list_names().unwrap(), vec!["alpha", "beta"]);
    }

    #[test]
    fn test_invalid_names_rejected() {
        let dir = TempDir::new().unwrap();
        let store = QueueStore::open(dir.path()).unwrap();

        for name in ["", "../evil", "a/b", ".hidden", "name with space"] {
            assert!(
                matches!(store.load(name), Err(StoreError::InvalidName(_))),
                "name {:?} should be invalid",
                name
            );
        }
    }

    #[test]
    fn test_recover_running_resets_and_counts_attempt() {
        let mut queue = Queue::new("recover");
        queue.append_seeds(vec![
            seed("/a", "/x/a"),
            seed("/b", "/x/b"),
            seed("/c", "/x/c"),
        ]);
        queue.jobs[0].mark_running();
        queue.jobs[0].mark_done();
        queue.jobs[1].mark_running();
        queue.cursor = 1;

        let recovered = queue.recover_running();

        assert_eq!(recovered, 1);
        assert_eq!(queue.jobs[0].status, JobStatus::Done);
        assert_eq!(queue.jobs[1].status, JobStatus::Pending);
        assert_eq!(queue.jobs[1].attempt_count, 1);
        assert_eq!(queue.jobs[2].status, JobStatus::Pending);
        assert_eq!(queue.cursor, 1);
    }

    #[test]
    fn test_normalize_cursor_skips_terminal_prefix() {
        let mut queue = Queue::new("norm");
        queue.append_seeds(vec![seed("/a", "/x/a"), seed("/b", "/x/b")]);
        queue.jobs[0].mark_running();
        queue.jobs[0].mark_done();
        queue.jobs[1].mark_skipped();

        queue.normalize_cursor();
        assert_eq!(queue.cursor, 2);
    }

    #[test]
    fn test_lock_blocks_live_pid() {
        let dir = TempDir::new().unwrap();

        // Simulate a different live daemon: pid 1 always exists.
        fs::write(dir.path().join("daemon.lock"), "1").unwrap();

        match StoreLock::acquire(dir.path()) {
            Err(StoreError::Locked { pid }) => assert_eq!(pid, 1),
            _ => panic!("expected Locked"),
        }
    }

    #[test]
    fn test_lock_takes_over_stale_pid() {
        let dir = TempDir::new().unwrap();

        // Far beyond any real pid_max; /proc/<pid> cannot exist.
        fs::write(dir.path().join("daemon.lock"), "4000000000").unwrap();

        let lock = StoreLock::acquire(dir.path()).unwrap();
        let written = fs::read_to_string(dir.path().join("daemon.lock")).unwrap();
        assert_eq!(written, std::process::id().to_string());

        drop(lock);
        assert!(!dir.path().join("daemon.lock").exists());
    }
}
