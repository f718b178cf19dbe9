//! Encoding job model.
//!
//! Jobs are persisted by the [`JobStore`](crate::store::JobStore) and are never deleted.
//! Each job references one media record; at most one non-terminal job exists per media.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Bytes per priority step: a job's priority is its source size in 100 MiB units.
pub const PRIORITY_UNIT_BYTES: u64 = 100 * 1024 * 1024;

/// Status of an encoding job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a free worker slot.
    Queued,
    /// Encoder process is running.
    Processing,
    /// Encoded output is being moved over the source.
    ReplacingFile,
    /// Source has been replaced by the re-encoded file.
    Completed,
    /// Job failed; the source is untouched.
    Failed,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::Queued
    }
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Processing,
        JobStatus::ReplacingFile,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::ReplacingFile => "replacing_file",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == s)
    }

    /// Completed and failed jobs never change again on their own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Statuses that hold a worker slot.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Processing | JobStatus::ReplacingFile)
    }

    /// Whether moving from `self` to `next` is a legal lifecycle step.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Processing)
                | (Processing, ReplacingFile)
                | (ReplacingFile, Completed)
                | (Processing, Failed)
                | (ReplacingFile, Failed)
                | (Failed, Queued)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An encoding job joined with the path and title of its media record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodingJob {
    pub id: i64,
    pub media_id: i64,
    pub status: JobStatus,
    pub priority: i64,
    /// Where the encoder writes its output; set when the job starts.
    pub scratch_path: Option<PathBuf>,
    pub original_size: u64,
    pub new_size: Option<u64>,
    pub reduction_percent: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub file_path: PathBuf,
    pub title: String,
}

impl EncodingJob {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

/// Optional field changes applied together with a status change.
///
/// Unset fields are left as stored. `expect_status` turns the update into a
/// compare-and-set: it lands only if the row currently has that status.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub expect_status: Option<JobStatus>,
    pub scratch_path: Option<PathBuf>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub new_size: Option<u64>,
    pub reduction_percent: Option<f64>,
    pub error: Option<String>,
    pub clear_error: bool,
    pub retry_count: Option<u32>,
}

impl JobUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expect(mut self, status: JobStatus) -> Self {
        self.expect_status = Some(status);
        self
    }

    pub fn scratch_path(mut self, path: PathBuf) -> Self {
        self.scratch_path = Some(path);
        self
    }

    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }

    pub fn sizes(mut self, new_size: u64, reduction_percent: f64) -> Self {
        self.new_size = Some(new_size);
        self.reduction_percent = Some(reduction_percent);
        self
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(message.into());
        self.clear_error = false;
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.error = None;
        self.clear_error = true;
        self
    }

    pub fn retry_count(mut self, count: u32) -> Self {
        self.retry_count = Some(count);
        self
    }
}

/// Admission priority for a source of `size_bytes`: larger files go first.
pub fn priority_for_size(size_bytes: u64) -> i64 {
    (size_bytes / PRIORITY_UNIT_BYTES) as i64
}

/// Percentage saved by re-encoding. Negative when the output grew.
pub fn reduction_percent(original_size: u64, new_size: u64) -> f64 {
    if original_size == 0 {
        return 0.0;
    }
    (original_size as f64 - new_size as f64) / original_size as f64 * 100.0
}
