//! Discovery engine: walks a library root, probes video files and records them.
//!
//! Per-file failures are counted, logged and skipped; a scan never aborts
//! because one file could not be read or probed.

use crate::classify::classify_path;
use crate::events::{DaemonEvent, EventBus};
use crate::media::NewMedia;
use crate::probe::{MediaProbe, ProbeError};
use crate::store::{JobStore, StoreError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Video file extensions recognised by discovery (case-insensitive matching).
pub const VIDEO_EXTENSIONS: &[&str] = &[
    ".mkv", ".mp4", ".avi", ".mov", ".m4v", ".ts", ".m2ts", ".wmv", ".flv", ".webm", ".mpg",
    ".mpeg",
];

/// Error type for discovery operations.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("scan root {0} does not exist or is not a directory")]
    RootNotFound(PathBuf),

    #[error("probe failed: {0}")]
    Probe(#[from] ProbeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("directory walk failed: {0}")]
    Walk(String),
}

/// Totals reported at the end of a scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSummary {
    /// Video files examined.
    pub scanned: usize,
    /// Records created or changed.
    pub added: usize,
    /// Examined files whose record needs transcoding.
    pub needs_transcode: usize,
    /// Files or directories that could not be read or probed.
    pub errors: usize,
}

/// What happened to one file handed to discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Record written (new or changed).
    Recorded {
        media_id: i64,
        created: bool,
        needs_transcode: bool,
    },
    /// Stored record already matches the file's size; not re-probed.
    Unchanged { media_id: i64, needs_transcode: bool },
    /// The file has no video stream.
    NoVideo,
}

/// Checks if a file has a video extension (case-insensitive).
pub fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext_lower = format!(".{}", ext.to_lowercase());
            VIDEO_EXTENSIONS.contains(&ext_lower.as_str())
        })
        .unwrap_or(false)
}

/// A video file found by the directory walk.
#[derive(Debug, Clone)]
struct Candidate {
    path: PathBuf,
    size_bytes: u64,
}

/// Walk every entry below `root` for video files.
///
/// Returns the candidates and the number of entries that could not be read.
fn collect_candidates(root: &Path) -> (Vec<Candidate>, usize) {
    let mut candidates = Vec::new();
    let mut errors = 0;

    for entry in WalkDir::new(root) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "Failed to read library entry");
                errors += 1;
                continue;
            }
        };
        if !entry.file_type().is_file() || !is_video_file(entry.path()) {
            continue;
        }
        match entry.metadata() {
            Ok(metadata) => candidates.push(Candidate {
                path: entry.path().to_path_buf(),
                size_bytes: metadata.len(),
            }),
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "Failed to stat file");
                errors += 1;
            }
        }
    }

    (candidates, errors)
}

/// Scans library roots and ingests individual files into the store.
pub struct Discovery {
    store: Arc<dyn JobStore>,
    probe: Arc<dyn MediaProbe>,
    events: EventBus,
}

impl Discovery {
    pub fn new(store: Arc<dyn JobStore>, probe: Arc<dyn MediaProbe>, events: EventBus) -> Self {
        Self {
            store,
            probe,
            events,
        }
    }

    /// Walk `root` and record every video file under it.
    pub async fn scan(&self, root: &Path) -> Result<ScanSummary, DiscoveryError> {
        let is_dir = tokio::fs::metadata(root)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return Err(DiscoveryError::RootNotFound(root.to_path_buf()));
        }

        info!(root = %root.display(), "Scanning library");
        let walk_root = root.to_path_buf();
        let (candidates, walk_errors) =
            tokio::task::spawn_blocking(move || collect_candidates(&walk_root))
                .await
                .map_err(|e| DiscoveryError::Walk(e.to_string()))?;

        let mut summary = ScanSummary {
            errors: walk_errors,
            ..Default::default()
        };

        for candidate in candidates {
            summary.scanned += 1;
            match self.process(&candidate.path, candidate.size_bytes, false).await {
                Ok(IngestOutcome::Recorded {
                    needs_transcode, ..
                }) => {
                    summary.added += 1;
                    if needs_transcode {
                        summary.needs_transcode += 1;
                    }
                }
                Ok(IngestOutcome::Unchanged {
                    needs_transcode, ..
                }) => {
                    if needs_transcode {
                        summary.needs_transcode += 1;
                    }
                }
                Ok(IngestOutcome::NoVideo) => {
                    debug!(path = %candidate.path.display(), "Skipping file without video stream");
                }
                Err(e) => {
                    warn!(path = %candidate.path.display(), error = %e, "Failed to ingest file");
                    summary.errors += 1;
                }
            }

            self.events.emit(DaemonEvent::ScanProgress {
                current_file: candidate.path.clone(),
                total_scanned: summary.scanned,
                added: summary.added,
            });
        }

        info!(
            root = %root.display(),
            scanned = summary.scanned,
            added = summary.added,
            needs_transcode = summary.needs_transcode,
            errors = summary.errors,
            "Scan finished"
        );
        Ok(summary)
    }

    /// Probe and record a single file, regardless of any stored record.
    pub async fn ingest_file(&self, path: &Path) -> Result<IngestOutcome, DiscoveryError> {
        let size = tokio::fs::metadata(path).await?.len();
        self.process(path, size, true).await
    }

    async fn process(
        &self,
        path: &Path,
        size_bytes: u64,
        force_probe: bool,
    ) -> Result<IngestOutcome, DiscoveryError> {
        if !force_probe {
            if let Some(existing) = self.store.find_media_by_path(path)? {
                if existing.size_bytes == size_bytes {
                    return Ok(IngestOutcome::Unchanged {
                        media_id: existing.id,
                        needs_transcode: existing.needs_transcode,
                    });
                }
            }
        }

        let probe = self.probe.probe(path).await?;
        let Some(codec) = probe.primary_video_codec() else {
            return Ok(IngestOutcome::NoVideo);
        };

        let classification = classify_path(path);
        let media = NewMedia {
            path: path.to_path_buf(),
            title: classification.title,
            episode: classification.episode,
            directory: path.parent().map(Path::to_path_buf).unwrap_or_default(),
            size_bytes,
            codec: codec.to_string(),
            category: classification.category,
            duration_secs: probe.format.duration_secs,
        };

        let upsert = self.store.upsert_media(media)?;
        let needs_transcode = self
            .store
            .get_media(upsert.id)?
            .map(|m| m.needs_transcode)
            .unwrap_or(false);

        debug!(
            path = %path.display(),
            media_id = upsert.id,
            codec,
            needs_transcode,
            "Recorded media file"
        );
        Ok(IngestOutcome::Recorded {
            media_id: upsert.id,
            created: upsert.created,
            needs_transcode,
        })
    }
}
