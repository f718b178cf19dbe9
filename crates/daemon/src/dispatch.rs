//! Dispatch engine
//!
//! Runs queued encoding jobs on a bounded pool of worker slots. A single polling
//! loop starts jobs in priority order; each job runs as its own task and always
//! gives its slot back when it ends, however it ends.

use crate::config::Config;
use crate::encode::{EncodeError, EncodeProgress, EncodeRequest, Encoder};
use crate::events::{DaemonEvent, EventBus};
use crate::jobs::{reduction_percent, EncodingJob, JobStatus, JobUpdate};
use crate::probe::MediaProbe;
use crate::replace::{atomic_replace, ReplaceError};
use crate::store::{JobStore, StoreError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Notify};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Completed jobs included in a queue snapshot.
const SNAPSHOT_COMPLETED: usize = 10;

/// Row limit meaning "all rows".
const UNBOUNDED: usize = i64::MAX as usize;

/// Maximum rows returned by a job search.
const SEARCH_LIMIT: usize = 200;

/// Pause and concurrency control used by the window scheduler.
pub trait DispatchControl: Send + Sync {
    fn pause(&self);
    fn resume(&self);
    /// Set the number of worker slots, floored at 1. Running jobs are never interrupted.
    fn set_concurrency_limit(&self, limit: usize);
}

/// Errors returned to callers of the control operations.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("job {0} not found")]
    NotFound(i64),

    #[error("job {id} is {status}, only failed jobs can be restarted")]
    InvalidState { id: i64, status: JobStatus },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Reasons a single job fails. The message becomes the job's error text.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("media record {0} no longer exists")]
    MediaMissing(i64),

    #[error("failed to prepare scratch directory: {0}")]
    Scratch(std::io::Error),

    #[error("encode failed: {0}")]
    Encode(#[from] EncodeError),

    #[error("encode timed out after {0} seconds")]
    Timeout(u64),

    #[error("encoded output is unreadable: {0}")]
    Output(std::io::Error),

    #[error("encoded output is empty")]
    EmptyOutput,

    #[error("replacement failed: {0}")]
    Replace(#[from] ReplaceError),

    #[error("job task panicked: {0}")]
    Panicked(String),

    #[error("job task was cancelled")]
    Cancelled,
}

/// Dispatch settings taken from the `[dispatch]` and `[encoder]` sections.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchSettings {
    pub concurrency_limit: usize,
    pub poll_interval: Duration,
    pub scratch_dir: PathBuf,
    /// `None` disables the watchdog.
    pub job_timeout: Option<Duration>,
    pub keep_original: bool,
    /// Codec recorded when the replaced file cannot be probed.
    pub target_codec: String,
}

impl DispatchSettings {
    pub fn from_config(config: &Config) -> Self {
        let timeout = config.dispatch.job_timeout_secs;
        Self {
            concurrency_limit: config.effective_concurrency_limit(),
            poll_interval: Duration::from_millis(config.dispatch.poll_interval_ms.max(1)),
            scratch_dir: config.dispatch.scratch_dir.clone(),
            job_timeout: (timeout > 0).then(|| Duration::from_secs(timeout)),
            keep_original: config.dispatch.keep_original,
            target_codec: config.encoder.target_codec.clone(),
        }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DispatchState {
    limit: usize,
    active: usize,
    paused: bool,
}

struct RunningJob {
    abort: AbortHandle,
    started_at: DateTime<Utc>,
}

/// Jobs grouped by status, as returned to the control surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueSnapshot {
    pub processing: Vec<EncodingJob>,
    pub queued: Vec<EncodingJob>,
    pub completed: Vec<EncodingJob>,
    pub failed: Vec<EncodingJob>,
    pub paused: bool,
    pub concurrency_limit: usize,
    pub active_count: usize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct DispatchEngine {
    store: Arc<dyn JobStore>,
    encoder: Arc<dyn Encoder>,
    probe: Arc<dyn MediaProbe>,
    events: EventBus,
    settings: DispatchSettings,
    state: Mutex<DispatchState>,
    registry: Mutex<HashMap<i64, RunningJob>>,
    poll_lock: tokio::sync::Mutex<()>,
    wake: Arc<Notify>,
}

impl DispatchEngine {
    pub fn new(
        store: Arc<dyn JobStore>,
        encoder: Arc<dyn Encoder>,
        probe: Arc<dyn MediaProbe>,
        events: EventBus,
        settings: DispatchSettings,
    ) -> Arc<Self> {
        let limit = settings.concurrency_limit.max(1);
        Arc::new(Self {
            store,
            encoder,
            probe,
            events,
            settings,
            state: Mutex::new(DispatchState {
                limit,
                active: 0,
                paused: false,
            }),
            registry: Mutex::new(HashMap::new()),
            poll_lock: tokio::sync::Mutex::new(()),
            wake: Arc::new(Notify::new()),
        })
    }

    /// Signal that wakes the polling loop for an immediate pass.
    pub fn waker(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Polling loop. Returns after `shutdown` fires, with running jobs aborted.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            concurrency_limit = self.concurrency_limit(),
            poll_interval_ms = self.settings.poll_interval.as_millis() as u64,
            "Dispatch loop started"
        );
        loop {
            if let Err(e) = self.poll_once().await {
                warn!(error = %e, "Dispatch pass failed");
            }
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                _ = shutdown.recv() => break,
            }
        }
        self.shutdown();
        info!("Dispatch loop stopped");
    }

    /// Start as many queued jobs as there are free slots.
    ///
    /// Returns the number of jobs started.
    pub async fn poll_once(self: &Arc<Self>) -> Result<usize, StoreError> {
        let _pass = self.poll_lock.lock().await;

        let free = {
            let state = lock(&self.state);
            if state.paused {
                0
            } else {
                state.limit.saturating_sub(state.active)
            }
        };
        if free == 0 {
            return Ok(0);
        }

        let mut started = 0;
        for job in self.store.list_jobs_by_status(JobStatus::Queued, free)? {
            if !self.reserve_slot() {
                break;
            }
            match self.start_job(job) {
                Ok(()) => started += 1,
                Err(StoreError::Conflict { id, actual, .. }) => {
                    debug!(job_id = id, status = %actual, "Job left the queue before it could start");
                    self.release_slot();
                }
                Err(e) => {
                    self.release_slot();
                    return Err(e);
                }
            }
        }
        Ok(started)
    }

    fn reserve_slot(&self) -> bool {
        let mut state = lock(&self.state);
        if state.paused || state.active >= state.limit {
            return false;
        }
        state.active += 1;
        true
    }

    fn release_slot(&self) {
        let mut state = lock(&self.state);
        state.active = state.active.saturating_sub(1);
    }

    fn scratch_path_for(&self, job: &EncodingJob) -> PathBuf {
        let ext = job
            .file_path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("mkv");
        self.settings
            .scratch_dir
            .join(format!("{}-{}.{}", job.id, Uuid::new_v4().simple(), ext))
    }

    /// Move a queued job to `processing` and spawn its execution.
    ///
    /// The caller has already reserved a slot for it.
    fn start_job(self: &Arc<Self>, job: EncodingJob) -> Result<(), StoreError> {
        let scratch = self.scratch_path_for(&job);
        let started_at = Utc::now();
        self.store.update_job(
            job.id,
            JobStatus::Processing,
            JobUpdate::new()
                .expect(JobStatus::Queued)
                .started_at(started_at)
                .scratch_path(scratch.clone()),
        )?;
        info!(job_id = job.id, path = %job.file_path.display(), priority = job.priority, "Starting job");
        self.events.job_status(job.id, JobStatus::Processing, None);

        let slot = SlotGuard {
            engine: self.clone(),
            job_id: job.id,
        };
        let engine = self.clone();
        let job_id = job.id;

        // The registry lock is held across the spawn so the entry exists before
        // the task can finish and remove it.
        let mut registry = lock(&self.registry);
        let handle = tokio::spawn(async move {
            let _slot = slot;
            engine.supervise(job, scratch).await;
        });
        registry.insert(
            job_id,
            RunningJob {
                abort: handle.abort_handle(),
                started_at,
            },
        );
        Ok(())
    }

    async fn supervise(self: Arc<Self>, job: EncodingJob, scratch: PathBuf) {
        let job_id = job.id;
        let inner = AbortOnDrop(tokio::spawn({
            let engine = self.clone();
            let scratch = scratch.clone();
            async move { engine.execute(&job, &scratch).await }
        }));

        let result = match inner.join().await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(JobError::Panicked(panic_message(e))),
            Err(_) => Err(JobError::Cancelled),
        };

        if let Err(e) = result {
            self.fail_job(job_id, &scratch, &e).await;
        }
    }

    async fn execute(&self, job: &EncodingJob, scratch: &Path) -> Result<(), JobError> {
        if let Some(dir) = scratch.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(JobError::Scratch)?;
        }
        let media = self
            .store
            .get_media(job.media_id)?
            .ok_or(JobError::MediaMissing(job.media_id))?;

        let request = EncodeRequest {
            input_path: media.path.clone(),
            output_path: scratch.to_path_buf(),
            duration_secs: media.duration_secs,
        };

        let events = self.events.clone();
        let job_id = job.id;
        let on_progress = move |p: EncodeProgress| {
            events.emit(DaemonEvent::JobProgress {
                job_id,
                progress: p.percent,
                elapsed_secs: p.elapsed_secs,
            });
        };

        let encode = self.encoder.encode(&request, &on_progress);
        match self.settings.job_timeout {
            Some(limit) => tokio::time::timeout(limit, encode)
                .await
                .map_err(|_| JobError::Timeout(limit.as_secs()))??,
            None => encode.await?,
        }

        let new_size = tokio::fs::metadata(scratch)
            .await
            .map_err(JobError::Output)?
            .len();
        if new_size == 0 {
            return Err(JobError::EmptyOutput);
        }
        let reduction = reduction_percent(job.original_size, new_size);

        self.store.update_job(
            job.id,
            JobStatus::ReplacingFile,
            JobUpdate::new()
                .expect(JobStatus::Processing)
                .sizes(new_size, reduction),
        )?;
        self.events.job_status(job.id, JobStatus::ReplacingFile, None);

        let source = media.path.clone();
        let encoded = scratch.to_path_buf();
        let keep_original = self.settings.keep_original;
        tokio::task::spawn_blocking(move || atomic_replace(&source, &encoded, keep_original))
            .await
            .map_err(|e| JobError::Panicked(e.to_string()))??;

        let codec = match self.probe.probe(&media.path).await {
            Ok(result) => result
                .primary_video_codec()
                .map(str::to_string)
                .unwrap_or_else(|| self.settings.target_codec.clone()),
            Err(e) => {
                warn!(job_id = job.id, path = %media.path.display(), error = %e, "Re-probe after replace failed");
                self.settings.target_codec.clone()
            }
        };
        self.store.mark_media_transcoded(media.id, &codec, new_size)?;

        self.store.update_job(
            job.id,
            JobStatus::Completed,
            JobUpdate::new()
                .expect(JobStatus::ReplacingFile)
                .completed_at(Utc::now()),
        )?;
        info!(
            job_id = job.id,
            path = %media.path.display(),
            original_size = job.original_size,
            new_size,
            reduction_percent = reduction,
            "Job completed"
        );
        self.events.job_status(job.id, JobStatus::Completed, None);
        Ok(())
    }

    async fn fail_job(&self, job_id: i64, scratch: &Path, err: &JobError) {
        let message = err.to_string();
        error!(job_id, error = %message, "Job failed");

        match tokio::fs::remove_file(scratch).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(job_id, scratch = %scratch.display(), error = %e, "Could not remove scratch file"),
        }

        let update = JobUpdate::new().error(message.clone()).completed_at(Utc::now());
        if let Err(e) = self.store.update_job(job_id, JobStatus::Failed, update) {
            error!(job_id, error = %e, "Could not record job failure");
        }
        self.events.job_status(job_id, JobStatus::Failed, Some(message));
    }

    /// Runs when a job task ends, including when it is aborted.
    fn finish(&self, job_id: i64) {
        self.release_slot();
        lock(&self.registry).remove(&job_id);
        self.wake.notify_one();
    }

    /// Mark jobs left mid-flight by a previous process as failed.
    pub fn recover_interrupted(&self) -> Result<usize, StoreError> {
        let mut recovered = 0;
        for status in [JobStatus::Processing, JobStatus::ReplacingFile] {
            for job in self.store.list_jobs_by_status(status, UNBOUNDED)? {
                if let Some(scratch) = &job.scratch_path {
                    let _ = std::fs::remove_file(scratch);
                }
                self.store.update_job(
                    job.id,
                    JobStatus::Failed,
                    JobUpdate::new()
                        .expect(status)
                        .error("interrupted by daemon restart")
                        .completed_at(Utc::now()),
                )?;
                warn!(job_id = job.id, path = %job.file_path.display(), "Marked interrupted job as failed");
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    /// Abort every running job. Their encoder processes are killed as the tasks drop.
    pub fn shutdown(&self) {
        let running: Vec<(i64, RunningJob)> = lock(&self.registry).drain().collect();
        for (job_id, job) in running {
            let ran_for = Utc::now().signed_duration_since(job.started_at);
            info!(job_id, ran_secs = ran_for.num_seconds(), "Aborting running job");
            job.abort.abort();
        }
    }

    /// Requeue a failed job, counting the retry.
    pub fn restart_job(&self, id: i64) -> Result<(), DispatchError> {
        let job = self.store.get_job(id)?.ok_or(DispatchError::NotFound(id))?;
        if job.status != JobStatus::Failed {
            return Err(DispatchError::InvalidState {
                id,
                status: job.status,
            });
        }

        let update = JobUpdate::new()
            .expect(JobStatus::Failed)
            .retry_count(job.retry_count + 1)
            .clear_error();
        match self.store.update_job(id, JobStatus::Queued, update) {
            Ok(()) => {}
            Err(StoreError::Conflict { actual, .. }) => {
                return Err(DispatchError::InvalidState { id, status: actual })
            }
            Err(StoreError::NotFound(_)) => return Err(DispatchError::NotFound(id)),
            Err(e) => return Err(e.into()),
        }

        info!(job_id = id, retry_count = job.retry_count + 1, "Job restarted");
        self.events.job_status(id, JobStatus::Queued, None);
        self.wake.notify_one();
        Ok(())
    }

    pub fn queue_snapshot(&self) -> Result<QueueSnapshot, StoreError> {
        let mut processing = self.store.list_jobs_by_status(JobStatus::Processing, UNBOUNDED)?;
        processing.extend(self.store.list_jobs_by_status(JobStatus::ReplacingFile, UNBOUNDED)?);
        let state = *lock(&self.state);
        Ok(QueueSnapshot {
            processing,
            queued: self.store.list_jobs_by_status(JobStatus::Queued, UNBOUNDED)?,
            completed: self
                .store
                .list_jobs_by_status(JobStatus::Completed, SNAPSHOT_COMPLETED)?,
            failed: self.store.list_jobs_by_status(JobStatus::Failed, UNBOUNDED)?,
            paused: state.paused,
            concurrency_limit: state.limit,
            active_count: state.active,
        })
    }

    pub fn get_job(&self, id: i64) -> Result<Option<EncodingJob>, StoreError> {
        self.store.get_job(id)
    }

    pub fn search_jobs(&self, text: &str) -> Result<Vec<EncodingJob>, StoreError> {
        self.store.search_jobs(text, SEARCH_LIMIT)
    }

    pub fn is_paused(&self) -> bool {
        lock(&self.state).paused
    }

    pub fn concurrency_limit(&self) -> usize {
        lock(&self.state).limit
    }

    pub fn active_count(&self) -> usize {
        lock(&self.state).active
    }

    /// Apply `change` to the state and report it when something moved.
    fn update_state(&self, change: impl FnOnce(&mut DispatchState)) {
        let (before, after) = {
            let mut state = lock(&self.state);
            let before = *state;
            change(&mut state);
            (before, *state)
        };
        if before.paused != after.paused || before.limit != after.limit {
            info!(paused = after.paused, concurrency_limit = after.limit, "Queue state changed");
            self.events.emit(DaemonEvent::QueueStateChanged {
                paused: after.paused,
                concurrency_limit: after.limit,
                active_count: after.active,
            });
        }
    }
}

impl DispatchControl for DispatchEngine {
    fn pause(&self) {
        self.update_state(|s| s.paused = true);
    }

    fn resume(&self) {
        self.update_state(|s| s.paused = false);
        self.wake.notify_one();
    }

    fn set_concurrency_limit(&self, limit: usize) {
        self.update_state(|s| s.limit = limit.max(1));
        self.wake.notify_one();
    }
}

/// Gives the slot back when a job task ends or is dropped.
struct SlotGuard {
    engine: Arc<DispatchEngine>,
    job_id: i64,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.engine.finish(self.job_id);
    }
}

/// Aborts the inner execution task when the supervising task is aborted.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> AbortOnDrop<T> {
    async fn join(mut self) -> Result<T, tokio::task::JoinError> {
        (&mut self.0).await
    }
}

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
