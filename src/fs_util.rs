//! Directory creation helpers

use std::io;
use std::path::{Path, PathBuf};

use crate::error::TaskError;

/// Missing segments of `path`, root first.
fn missing_segments(path: &Path) -> Vec<PathBuf> {
    let mut missing: Vec<PathBuf> = path
        .ancestors()
        .filter(|p| !p.as_os_str().is_empty())
        .take_while(|p| !p.is_dir())
        .map(Path::to_path_buf)
        .collect();
    missing.reverse();
    missing
}

fn tolerate_existing(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        other => other,
    }
}

/// Creates every missing directory of `path`, root to leaf.
///
/// Existing segments are left alone. Stops at the first failure; segments
/// created before it stay in place.
pub fn create_dir_chain(path: &Path) -> io::Result<()> {
    for segment in missing_segments(path) {
        tolerate_existing(std::fs::create_dir(&segment))?;
    }
    Ok(())
}

pub fn ensure_dir_sync(path: &Path) -> Result<(), TaskError> {
    create_dir_chain(path).map_err(|e| TaskError::io(path, e))
}

pub async fn ensure_dir(path: &Path) -> Result<(), TaskError> {
    for segment in missing_segments(path) {
        tolerate_existing(tokio::fs::create_dir(&segment).await).map_err(|e| TaskError::io(&segment, e))?;
    }
    Ok(())
}
