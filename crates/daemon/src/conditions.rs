//! Condition evaluation for queued jobs.
//!
//! The evaluator is a pure function from a job to a decision: skip the file,
//! or run it with an effective operation. It never touches the filesystem;
//! everything it needs is already on the job record.
//!
//! Convert jobs get special treatment: a source whose extension is outside
//! the `convert_only` set is not skipped but reclassified as a plain copy,
//! so already-lossy files pass through untouched while lossless ones are
//! transcoded.

use crate::job::{Job, Operation};

/// The operation a job resolves to after condition evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectiveOp {
    /// Place the source at the destination by copying.
    Copy,
    /// Place the source at the destination by moving.
    Move,
    /// Transcode first, then place the produced file.
    Transcode,
}

/// Outcome of evaluating a job against its conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The file does not match the filters and is skipped.
    Skip,
    /// The file is processed with the given effective operation.
    Run(EffectiveOp),
}

/// Evaluate a job's conditions against its source file.
pub fn evaluate(job: &Job) -> Decision {
    let ext = job.source_extension();
    let conditions = &job.conditions;

    if !conditions.include.is_empty() {
        match &ext {
            Some(e) if conditions.include.contains(e) => {}
            _ => return Decision::Skip,
        }
    }

    if let Some(e) = &ext {
        if conditions.exclude.contains(e) {
            return Decision::Skip;
        }
    }

    match job.operation {
        Operation::Copy => Decision::Run(EffectiveOp::Copy),
        Operation::Move => Decision::Run(EffectiveOp::Move),
        Operation::Convert => {
            if conditions.convert_only.is_empty() {
                return Decision::Run(EffectiveOp::Transcode);
            }
            match &ext {
                Some(e) if conditions.convert_only.contains(e) => {
                    Decision::Run(EffectiveOp::Transcode)
                }
                _ => Decision::Run(EffectiveOp::Copy),
            }
        }
    }
}
