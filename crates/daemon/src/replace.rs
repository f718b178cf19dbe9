//! Swapping an encoded scratch file in place of its source.
//!
//! The source path always holds either the complete original or the complete
//! encoded file. The swap is a rename; when the scratch directory lives on a
//! different filesystem the encoded file is first copied next to the source and
//! then renamed over it.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Errors that can occur during file replacement.
#[derive(Debug, Error)]
pub enum ReplaceError {
    /// The encoded file is missing or unreadable.
    #[error("Encoded file {path} is not available: {source}")]
    ScratchMissing {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to keep a copy of the original file.
    #[error("Failed to create backup: {0}")]
    BackupFailed(std::io::Error),

    /// Failed to copy the encoded file next to the source.
    #[error("Failed to copy encoded file: {0}")]
    CopyFailed(std::io::Error),

    /// Failed to move the encoded file over the source.
    #[error("Failed to rename over source: {0}")]
    RenameFailed(std::io::Error),
}

/// Backup path for the original file: `<name>.orig.<unix secs>`.
pub fn backup_path(original: &Path) -> PathBuf {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let mut backup = original.as_os_str().to_owned();
    backup.push(format!(".orig.{}", timestamp));
    PathBuf::from(backup)
}

/// Temporary sibling used for cross-filesystem copies: `<name>.<uuid>.partial`.
pub fn partial_path(original: &Path) -> PathBuf {
    let mut partial = original.as_os_str().to_owned();
    partial.push(format!(".{}.partial", Uuid::new_v4().simple()));
    PathBuf::from(partial)
}

/// Replace `source` with `scratch`.
///
/// With `keep_original`, the source is first hard-linked (or copied) to
/// [`backup_path`]. On failure the source is left as it was and the scratch
/// file is not removed; the caller decides what to do with it.
pub fn atomic_replace(source: &Path, scratch: &Path, keep_original: bool) -> Result<(), ReplaceError> {
    fs::metadata(scratch).map_err(|e| ReplaceError::ScratchMissing {
        path: scratch.to_path_buf(),
        source: e,
    })?;

    if keep_original {
        let backup = backup_path(source);
        if fs::hard_link(source, &backup).is_err() {
            fs::copy(source, &backup).map_err(ReplaceError::BackupFailed)?;
        }
        debug!(backup = %backup.display(), "Kept original");
    }

    match fs::rename(scratch, source) {
        Ok(()) => Ok(()),
        Err(e) => {
            debug!(error = %e, "Rename failed, copying across filesystems");
            replace_by_copy(source, scratch)
        }
    }
}

/// Copy `from` to `to` and flush the copy to disk.
fn copy_synced(from: &Path, to: &Path) -> std::io::Result<()> {
    fs::copy(from, to)?;
    fs::OpenOptions::new().write(true).open(to)?.sync_all()
}

fn replace_by_copy(source: &Path, scratch: &Path) -> Result<(), ReplaceError> {
    let partial = partial_path(source);
    if let Err(e) = copy_synced(scratch, &partial) {
        let _ = fs::remove_file(&partial);
        return Err(ReplaceError::CopyFailed(e));
    }
    if let Err(e) = fs::rename(&partial, source) {
        let _ = fs::remove_file(&partial);
        return Err(ReplaceError::RenameFailed(e));
    }
    if let Err(e) = fs::remove_file(scratch) {
        warn!(scratch = %scratch.display(), error = %e, "Could not remove scratch file after copy");
    }
    Ok(())
}
