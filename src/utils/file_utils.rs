//! File system utilities

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use walkdir::WalkDir;

/// A file discovered in the download directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundFile {
    pub path: PathBuf,
    pub size: u64,
}

/// Ensure directory exists
pub fn ensure_dir_exists(path: &Path) -> std::io::Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

/// Display title for an output file: its name without extension
pub fn title_from_path(path: &str) -> Option<String> {
    Path::new(path.trim())
        .file_stem()
        .and_then(|stem| stem.to_str())
        .map(str::to_string)
        .filter(|stem| !stem.is_empty())
}

/// Files directly inside `dir` modified within `window` of `now`.
///
/// This is a heuristic: a concurrent unrelated download into the same
/// directory is indistinguishable from the job's own output.
pub fn recent_files(dir: &Path, window: Duration, now: SystemTime) -> Vec<FoundFile> {
    let mut found = Vec::new();

    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let Ok(modified) = metadata.modified() else {
            continue;
        };
        // A timestamp slightly in the future still counts as recent
        let age = now.duration_since(modified).unwrap_or_default();
        if age <= window {
            found.push(FoundFile {
                path: entry.into_path(),
                size: metadata.len(),
            });
        }
    }

    found.sort_by(|a, b| a.path.cmp(&b.path));
    found
}

/// Size of the given files, skipping any that vanished
pub fn existing_files(paths: &[String]) -> Vec<FoundFile> {
    paths
        .iter()
        .filter_map(|p| {
            std::fs::metadata(p).ok().filter(|m| m.is_file()).map(|m| FoundFile {
                path: PathBuf::from(p),
                size: m.len(),
            })
        })
        .collect()
}
