//! portage daemon
//!
//! Background service that drains persistent queues of file-transfer jobs:
//! parallel transcoding, strictly serialized destination writes, and a
//! crash-safe resume cursor per queue.

pub mod conditions;
pub mod daemon;
pub mod job;
pub mod place;
pub mod pool;
pub mod processor;
pub mod server;
pub mod startup;
pub mod status;
pub mod store;
pub mod transcode;

pub use portage_config as config;
pub use portage_config::Config;

pub use conditions::{evaluate, Decision, EffectiveOp};
pub use daemon::{Daemon, DaemonError};
pub use job::{Conditions, Job, JobStatus, Operation};
pub use place::{
    classify, classify_io_error, FailureClass, PlaceError, PlaceRequest, WriteSerializer,
};
pub use pool::{derive_workers, PoolResult, WorkerPool};
pub use processor::{
    EnqueueSpec, FlushOutcome, FlushScope, Intent, Processor, ProcessorError, ProcessorHandle,
    ProcessorParts, RetryDecision, RetryPolicy,
};
pub use server::{
    create_router, run_control_server, AppState, EnqueueRequest, EnqueueResponse, ErrorResponse,
    FlushRequest, OkResponse, ProgressResponse, QueuesResponse, SelectRequest, ServerError,
    StatusResponse,
};
pub use startup::{check_ffmpeg_available, run_startup_checks, StartupError};
pub use status::{
    new_shared_status, ProcessingMode, ProgressCounts, SharedStatus, StatusSnapshot,
};
pub use store::{
    valid_queue_name, JobSeed, Queue, QueueStore, StoreError, StoreLock, DEFAULT_QUEUE,
    FORMAT_VERSION,
};
pub use transcode::{
    FfmpegTagEditor, FfmpegTranscoder, Profile, TagEditor, TranscodeError, Transcoder,
};
