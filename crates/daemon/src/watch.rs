//! Library watcher
//!
//! Follows filesystem changes under the library root. New files are recorded
//! and admitted once they stop growing; modified files are re-recorded only.

use crate::admission::AdmissionPolicy;
use crate::scan::{is_video_file, Discovery, IngestOutcome};
use crate::stability::{wait_until_stable, StabilityOutcome};
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("watch root {0} is not a directory")]
    RootNotFound(PathBuf),

    #[error("filesystem watcher error: {0}")]
    Notify(#[from] notify::Error),
}

/// What to do with a path once it has settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Intent {
    /// Record the file, then run admission.
    Admit,
    /// Record the file only.
    Refresh,
}

impl Intent {
    fn from_kind(kind: &EventKind) -> Option<Self> {
        match kind {
            EventKind::Create(_) => Some(Intent::Admit),
            // A file renamed into the library is new to us.
            EventKind::Modify(ModifyKind::Name(RenameMode::To | RenameMode::Both)) => {
                Some(Intent::Admit)
            }
            EventKind::Modify(_) => Some(Intent::Refresh),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchSettings {
    pub stability_wait: Duration,
    pub max_checks: u32,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            stability_wait: Duration::from_secs(10),
            max_checks: 30,
        }
    }
}

struct ActiveWatch {
    root: PathBuf,
    _watcher: RecommendedWatcher,
    pump: JoinHandle<()>,
}

impl Drop for ActiveWatch {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct LibraryWatcher {
    discovery: Arc<Discovery>,
    admission: Arc<AdmissionPolicy>,
    settings: WatchSettings,
    active: Mutex<Option<ActiveWatch>>,
    pending: Mutex<HashMap<PathBuf, Intent>>,
}

impl LibraryWatcher {
    pub fn new(
        discovery: Arc<Discovery>,
        admission: Arc<AdmissionPolicy>,
        settings: WatchSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            discovery,
            admission,
            settings,
            active: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Watch `root` recursively, replacing any watch on a different root.
    pub fn watch(self: &Arc<Self>, root: &Path) -> Result<(), WatchError> {
        if !root.is_dir() {
            return Err(WatchError::RootNotFound(root.to_path_buf()));
        }

        let mut active = lock(&self.active);
        if active.as_ref().map_or(false, |w| w.root == root) {
            debug!(root = %root.display(), "Already watching root");
            return Ok(());
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let _ = tx.send(res);
        })?;
        watcher.watch(root, RecursiveMode::Recursive)?;

        let this: Weak<Self> = Arc::downgrade(self);
        let pump = tokio::spawn(async move {
            while let Some(res) = rx.recv().await {
                let Some(watcher) = this.upgrade() else { break };
                match res {
                    Ok(event) => watcher.handle_event(event),
                    Err(e) => warn!(error = %e, "Filesystem watcher error"),
                }
            }
        });

        if let Some(previous) = active.take() {
            info!(root = %previous.root.display(), "Stopped watching root");
        }
        *active = Some(ActiveWatch {
            root: root.to_path_buf(),
            _watcher: watcher,
            pump,
        });
        info!(root = %root.display(), "Watching library root");
        Ok(())
    }

    pub fn unwatch(&self) {
        if let Some(previous) = lock(&self.active).take() {
            info!(root = %previous.root.display(), "Stopped watching root");
        }
    }

    pub fn watched_root(&self) -> Option<PathBuf> {
        lock(&self.active).as_ref().map(|w| w.root.clone())
    }

    fn handle_event(self: &Arc<Self>, event: notify::Event) {
        let Some(intent) = Intent::from_kind(&event.kind) else {
            return;
        };
        for path in event.paths.into_iter().filter(|p| is_video_file(p)) {
            let mut pending = lock(&self.pending);
            if let Some(existing) = pending.get_mut(&path) {
                if intent == Intent::Admit {
                    *existing = Intent::Admit;
                }
                continue;
            }
            pending.insert(path.clone(), intent);
            drop(pending);

            debug!(path = %path.display(), ?intent, "Waiting for file to settle");
            let watcher = self.clone();
            tokio::spawn(async move { watcher.settle(path).await });
        }
    }

    async fn settle(self: Arc<Self>, path: PathBuf) {
        let outcome = wait_until_stable(
            &path,
            self.settings.stability_wait,
            self.settings.max_checks,
        )
        .await;
        let intent = lock(&self.pending).remove(&path).unwrap_or(Intent::Refresh);

        match outcome {
            Ok(StabilityOutcome::Stable(_)) => {}
            Ok(StabilityOutcome::StillChanging { last_size, checks }) => {
                info!(path = %path.display(), last_size, checks, "File still changing, giving up for now");
                return;
            }
            Err(e) => {
                debug!(path = %path.display(), error = %e, "File disappeared before settling");
                return;
            }
        }

        match self.discovery.ingest_file(&path).await {
            Ok(IngestOutcome::NoVideo) => {
                debug!(path = %path.display(), "No video stream, ignoring");
                return;
            }
            Ok(outcome) => debug!(path = %path.display(), ?outcome, "Recorded watched file"),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to record watched file");
                return;
            }
        }

        if intent == Intent::Admit {
            if let Err(e) = self.admission.admit_pending().await {
                warn!(error = %e, "Admission after watch event failed");
            }
        }
    }

    #[cfg(test)]
    fn pending_intent(&self, path: &Path) -> Option<Intent> {
        lock(&self.pending).get(path).copied()
    }
}
