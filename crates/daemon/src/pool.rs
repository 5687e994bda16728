//! Bounded worker pool for the CPU-bound transcode stage.
//!
//! Conversions run concurrently up to the configured worker count, enforced
//! by a semaphore inside the pool rather than by callers. Completions are
//! reported over a channel keyed by job id and may arrive out of queue
//! order; committing them in order is the queue processor's business.
//!
//! Cancellation is cooperative via a generation counter: a task captures the
//! generation at submit time and checks it before starting and again before
//! reporting, discarding its temp output if a stop happened in between. A
//! cancelled transcode therefore never promotes partial work.

use crate::transcode::{TranscodeError, Transcoder};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Result of one transcode submission.
#[derive(Debug)]
pub struct PoolResult {
    pub job_id: u64,
    /// Cancellation generation the work was submitted under; the processor
    /// drops results from an older generation.
    pub generation: u64,
    pub outcome: Result<PathBuf, TranscodeError>,
}

/// Bounded set of concurrent transcode executors.
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    workers: u32,
    transcoder: Arc<dyn Transcoder>,
    temp_dir: PathBuf,
    results_tx: mpsc::Sender<PoolResult>,
    cancel_rx: watch::Receiver<u64>,
}

impl WorkerPool {
    pub fn new(
        workers: u32,
        transcoder: Arc<dyn Transcoder>,
        temp_dir: PathBuf,
        results_tx: mpsc::Sender<PoolResult>,
        cancel_rx: watch::Receiver<u64>,
    ) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(workers as usize)),
            workers,
            transcoder,
            temp_dir,
            results_tx,
            cancel_rx,
        }
    }

    /// Configured worker count.
    pub fn workers(&self) -> u32 {
        self.workers
    }

    /// Free transcode slots right now.
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Submit one conversion. Waits for a free slot inside the spawned task,
    /// so callers never block; the result arrives on the pool's channel.
    pub fn submit(
        &self,
        job_id: u64,
        src: PathBuf,
        profile: String,
        remove_art: bool,
    ) -> JoinHandle<()> {
        let semaphore = self.semaphore.clone();
        let transcoder = self.transcoder.clone();
        let temp_dir = self.temp_dir.clone();
        let results_tx = self.results_tx.clone();
        let cancel_rx = self.cancel_rx.clone();
        let generation = *cancel_rx.borrow();

        tokio::spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(p) => p,
                Err(_) => return,
            };

            if *cancel_rx.borrow() != generation {
                debug!(job_id, "transcode cancelled before start");
                return;
            }

            let outcome = tokio::task::spawn_blocking(move || {
                transcoder.convert(&src, &profile, remove_art, &temp_dir)
            })
            .await
            .unwrap_or_else(|e| Err(TranscodeError::Io(std::io::Error::other(e))));

            if *cancel_rx.borrow() != generation {
                if let Ok(path) = &outcome {
                    let _ = std::fs::remove_file(path);
                }
                debug!(job_id, "transcode cancelled, temp output discarded");
                return;
            }

            let result = PoolResult {
                job_id,
                generation,
                outcome,
            };
            if results_tx.send(result).await.is_err() {
                warn!(job_id, "result channel closed, dropping transcode result");
            }
        })
    }
}

/// Worker count for the transcode stage: the configured value, or
/// `cores - 1` (at least 1) when left at 0.
pub fn derive_workers(configured: u32) -> u32 {
    if configured > 0 {
        configured
    } else {
        num_cpus::get().saturating_sub(1).max(1) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Fake transcoder that tracks how many conversions run at once.
    struct CountingTranscoder {
        active: AtomicUsize,
        max_seen: AtomicUsize,
        calls: AtomicUsize,
    }

    impl CountingTranscoder {
        fn new() -> Self {
            Self {
                active: AtomicUsize::new(0),
                max_seen: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl Transcoder for CountingTranscoder {
        fn convert(
            &self,
            _src: &Path,
            _profile: &str,
            _remove_art: bool,
            temp_dir: &Path,
        ) -> Result<PathBuf, TranscodeError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(30));
            self.active.fetch_sub(1, Ordering::SeqCst);

            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            std::fs::create_dir_all(temp_dir)?;
            let out = temp_dir.join(format!("fake-{}.mp3", n));
            std::fs::write(&out, b"transcoded")?;
            Ok(out)
        }
    }

    /// Fake transcoder that writes its output, then blocks until released.
    struct GatedTranscoder {
        gate: Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl Transcoder for GatedTranscoder {
        fn convert(
            &self,
            _src: &Path,
            _profile: &str,
            _remove_art: bool,
            temp_dir: &Path,
        ) -> Result<PathBuf, TranscodeError> {
            std::fs::create_dir_all(temp_dir)?;
            let out = temp_dir.join("gated.mp3");
            std::fs::write(&out, b"partial")?;
            let _ = self.gate.lock().unwrap().recv();
            Ok(out)
        }
    }

    #[tokio::test]
    async fn test_at_most_k_conversions_run_simultaneously() {
        let temp = TempDir::new().unwrap();
        let transcoder = Arc::new(CountingTranscoder::new());
        let (results_tx, mut results_rx) = mpsc::channel(16);
        let (_cancel_tx, cancel_rx) = watch::channel(0u64);

        let pool = WorkerPool::new(
            2,
            transcoder.clone(),
            temp.path().to_path_buf(),
            results_tx,
            cancel_rx,
        );

        let handles: Vec<_> = (1..=6)
            .map(|id| {
                pool.submit(
                    id,
                    PathBuf::from(format!("/music/{}.flac", id)),
                    "mp3-v0".to_string(),
                    false,
                )
            })
            .collect();

        let mut got = Vec::new();
        for _ in 0..6 {
            let res = tokio::time::timeout(Duration::from_secs(5), results_rx.recv())
                .await
                .expect("result within timeout")
                .expect("channel open");
            assert!(res.outcome.is_ok());
            got.push(res.job_id);
        }
        for h in handles {
            h.await.unwrap();
        }

        got.sort();
        assert_eq!(got, vec![1, 2, 3, 4, 5, 6]);
        assert!(
            transcoder.max_seen.load(Ordering::SeqCst) <= 2,
            "pool bound exceeded: {} concurrent conversions",
            transcoder.max_seen.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn test_cancelled_work_reports_nothing_and_discards_output() {
        let temp = TempDir::new().unwrap();
        let (gate_tx, gate_rx) = std::sync::mpsc::channel();
        let transcoder = Arc::new(GatedTranscoder {
            gate: Mutex::new(gate_rx),
        });
        let (results_tx, mut results_rx) = mpsc::channel(16);
        let (cancel_tx, cancel_rx) = watch::channel(0u64);

        let pool = WorkerPool::new(
            1,
            transcoder,
            temp.path().to_path_buf(),
            results_tx,
            cancel_rx,
        );

        // First job enters the transcoder and blocks on the gate; second
        // waits for the only permit.
        let h1 = pool.submit(1, PathBuf::from("/music/a.flac"), "mp3-v0".into(), false);
        let h2 = pool.submit(2, PathBuf::from("/music/b.flac"), "mp3-v0".into(), false);

        // Let the first job reach the gate, then stop everything.
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel_tx.send(1).unwrap();
        gate_tx.send(()).unwrap();
        gate_tx.send(()).unwrap();

        h1.await.unwrap();
        h2.await.unwrap();

        // Neither job reports a result, and the finished temp output of the
        // first job was deleted rather than kept for promotion.
        assert!(results_rx.try_recv().is_err());
        assert!(!temp.path().join("gated.mp3").exists());
    }

    #[test]
    fn test_derive_workers_explicit_wins() {
        assert_eq!(derive_workers(4), 4);
        assert_eq!(derive_workers(1), 1);
    }

    #[test]
    fn test_derive_workers_auto_is_at_least_one() {
        assert!(derive_workers(0) >= 1);
    }
}
