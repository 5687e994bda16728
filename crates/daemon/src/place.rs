//! Write serializer: the single stage that mutates destination devices.
//!
//! Exactly one placement runs at a time regardless of how many transcodes
//! finish upstream. The serializer itself is stateless; serialization is
//! guaranteed by ownership — only the queue processor task calls `place`,
//! one operation at a time. Slow target devices therefore never see two
//! concurrent writers.
//!
//! Placement follows temp-then-promote: data is written to a hidden `.part`
//! sibling and renamed over the destination, so the destination file either
//! exists complete or not at all.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Error type for placement operations
#[derive(Debug, Error)]
pub enum PlaceError {
    /// The source file disappeared between enqueue and execution.
    #[error("source file vanished: {0}")]
    SourceMissing(PathBuf),

    /// IO error against the destination (or while removing a moved source).
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Whether a failure is worth retrying in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Expected to resolve on retry (device briefly unavailable, disk full).
    Transient,
    /// Retrying cannot help; the job fails.
    Fatal,
}

/// Classify a placement failure for the retry policy.
pub fn classify(err: &PlaceError) -> FailureClass {
    match err {
        PlaceError::SourceMissing(_) => FailureClass::Fatal,
        PlaceError::Io(e) => classify_io_error(e),
    }
}

/// Destination-side io errors default to transient: an unplugged device or a
/// full disk surfaces in several kinds, and retry-then-escalate handles them
/// all. Only kinds that retrying provably cannot fix are fatal.
pub fn classify_io_error(e: &io::Error) -> FailureClass {
    use io::ErrorKind::*;
    match e.kind() {
        PermissionDenied | InvalidInput | InvalidData | AlreadyExists | Unsupported => {
            FailureClass::Fatal
        }
        _ => FailureClass::Transient,
    }
}

/// One destination mutation.
#[derive(Debug, Clone)]
pub enum PlaceRequest {
    /// Copy the source to the destination.
    Copy { src: PathBuf, dst: PathBuf },
    /// Move the source to the destination.
    Move { src: PathBuf, dst: PathBuf },
    /// Promote a finished transcode temp file to the destination.
    Promote { temp: PathBuf, dst: PathBuf },
}

/// Performs final filesystem placement. Must only be driven by a single
/// owner; see module docs.
pub struct WriteSerializer;

impl WriteSerializer {
    /// Execute one placement.
    pub fn place(&self, request: &PlaceRequest) -> Result<(), PlaceError> {
        match request {
            PlaceRequest::Copy { src, dst } => {
                debug!(src = %src.display(), dst = %dst.display(), "copy into place");
                copy_into_place(src, dst)
            }
            PlaceRequest::Move { src, dst } => {
                debug!(src = %src.display(), dst = %dst.display(), "move into place");
                move_into_place(src, dst)
            }
            PlaceRequest::Promote { temp, dst } => {
                debug!(temp = %temp.display(), dst = %dst.display(), "promote transcode output");
                move_into_place(temp, dst)
            }
        }
    }
}

fn partial_path(dst: &Path) -> Result<PathBuf, PlaceError> {
    let file_name = dst
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "destination has no file name"))?;
    Ok(dst.with_file_name(format!(".{}.part", file_name)))
}

fn copy_into_place(src: &Path, dst: &Path) -> Result<(), PlaceError> {
    if !src.exists() {
        return Err(PlaceError::SourceMissing(src.to_path_buf()));
    }
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }

    let part = partial_path(dst)?;
    if let Err(e) = fs::copy(src, &part) {
        let _ = fs::remove_file(&part);
        return Err(e.into());
    }
    fs::rename(&part, dst)?;
    Ok(())
}

fn move_into_place(src: &Path, dst: &Path) -> Result<(), PlaceError> {
    if !src.exists() {
        return Err(PlaceError::SourceMissing(src.to_path_buf()));
    }
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }

    // Rename first (cheap, same filesystem); fall back to copy-and-delete
    // across devices.
    if fs::rename(src, dst).is_ok() {
        return Ok(());
    }
    copy_into_place(src, dst)?;
    fs::remove_file(src)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_file(path: &Path, content: &[u8]) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_copy_creates_parents_and_leaves_no_part_file() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src/a.mp3");
        let dst = dir.path().join("player/music/a.mp3");
        write_file(&src, b"audio");

        WriteSerializer
            .place(&PlaceRequest::Copy {
                src: src.clone(),
                dst: dst.clone(),
            })
            .unwrap();

        assert_eq!(fs::read(&dst).unwrap(), b"audio");
        assert!(src.exists(), "copy keeps the source");

        let leftovers: Vec<_> = fs::read_dir(dst.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().to_string_lossy().contains(".part"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_move_removes_source() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src/b.mp3");
        let dst = dir.path().join("player/b.mp3");
        write_file(&src, b"audio");

        WriteSerializer
            .place(&PlaceRequest::Move {
                src: src.clone(),
                dst: dst.clone(),
            })
            .unwrap();

        assert_eq!(fs::read(&dst).unwrap(), b"audio");
        assert!(!src.exists());
    }

    #[test]
    fn test_promote_moves_temp_output() {
        let dir = TempDir::new().unwrap();
        let temp = dir.path().join("scratch/abc123.mp3");
        let dst = dir.path().join("player/fugue.mp3");
        write_file(&temp, b"transcoded");

        WriteSerializer
            .place(&PlaceRequest::Promote {
                temp: temp.clone(),
                dst: dst.clone(),
            })
            .unwrap();

        assert_eq!(fs::read(&dst).unwrap(), b"transcoded");
        assert!(!temp.exists());
    }

    #[test]
    fn test_missing_source_is_fatal() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("gone.mp3");
        let dst = dir.path().join("player/gone.mp3");

        let err = WriteSerializer
            .place(&PlaceRequest::Copy { src, dst })
            .unwrap_err();

        assert!(matches!(err, PlaceError::SourceMissing(_)));
        assert_eq!(classify(&err), FailureClass::Fatal);
    }

    #[test]
    fn test_failed_copy_leaves_no_destination_file() {
        let dir = TempDir::new().unwrap();
        // Source is a directory: fs::copy fails after the parent exists.
        let src = dir.path().join("srcdir");
        fs::create_dir_all(&src).unwrap();
        let dst = dir.path().join("player/out.mp3");

        let result = WriteSerializer.place(&PlaceRequest::Copy {
            src,
            dst: dst.clone(),
        });

        assert!(result.is_err());
        assert!(!dst.exists(), "no partial destination may survive");
    }

    #[test]
    fn test_classification_table() {
        use io::ErrorKind::*;

        for kind in [PermissionDenied, InvalidInput, InvalidData, AlreadyExists, Unsupported] {
            let e = io::Error::new(kind, "boom");
            assert_eq!(classify_io_error(&e), FailureClass::Fatal, "{:?}", kind);
        }
        for kind in [TimedOut, Interrupted, WouldBlock, BrokenPipe, NotFound, Other] {
            let e = io::Error::new(kind, "blip");
            assert_eq!(classify_io_error(&e), FailureClass::Transient, "{:?}", kind);
        }
    }
}
