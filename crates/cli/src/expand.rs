//! Source expansion for enqueue commands.
//!
//! Directories are walked recursively and each file keeps its layout
//! relative to the scanned root, so `portage copy ~/music /mnt/player`
//! recreates the album structure under the destination. Extension filtering
//! stays on the daemon side; the client only expands paths.

use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// One file to enqueue: its absolute source path and the destination
/// directory it belongs in.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpandedSource {
    pub path: PathBuf,
    pub dest_dir: PathBuf,
}

/// Expand files and directories into a flat, ordered list of sources.
pub fn expand_sources(
    sources: &[PathBuf],
    destination: &Path,
) -> io::Result<Vec<ExpandedSource>> {
    let mut expanded = Vec::new();

    for source in sources {
        let source = source.canonicalize()?;

        if source.is_dir() {
            // Keep the scanned directory itself in the destination layout:
            // `music/album/x.mp3` lands in `<dest>/music/album/`.
            let root_parent = source.parent().unwrap_or(&source).to_path_buf();
            for entry in WalkDir::new(&source).sort_by_file_name() {
                let entry = entry.map_err(io::Error::other)?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel_parent = entry
                    .path()
                    .parent()
                    .and_then(|p| p.strip_prefix(&root_parent).ok())
                    .unwrap_or_else(|| Path::new(""));
                expanded.push(ExpandedSource {
                    path: entry.path().to_path_buf(),
                    dest_dir: destination.join(rel_parent),
                });
            }
        } else {
            expanded.push(ExpandedSource {
                path: source,
                dest_dir: destination.to_path_buf(),
            });
        }
    }

    Ok(expanded)
}

/// Batch consecutive entries sharing a destination directory, preserving
/// enqueue order across batches.
pub fn group_consecutive(expanded: Vec<ExpandedSource>) -> Vec<(PathBuf, Vec<PathBuf>)> {
    let mut batches: Vec<(PathBuf, Vec<PathBuf>)> = Vec::new();
    for item in expanded {
        match batches.last_mut() {
            Some((dest, files)) if *dest == item.dest_dir => files.push(item.path),
            _ => batches.push((item.dest_dir, vec![item.path])),
        }
    }
    batches
}
