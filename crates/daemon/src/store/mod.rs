//! Job store: narrow record access for media, encoding jobs and schedule rules.
//!
//! Every operation is synchronous and atomic on its own. Implementations must be
//! safe to call from many tasks at once.

mod sqlite;

pub use sqlite::SqliteJobStore;

use crate::jobs::{EncodingJob, JobStatus, JobUpdate};
use crate::media::{MediaRecord, MediaUpsert, NewMedia};
use crate::schedule::{ScheduleRule, ScheduleRuleInput};
use std::path::Path;
use thiserror::Error;

/// Errors returned by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("{0} not found")]
    NotFound(String),

    /// A conditional update found the row in a different status.
    #[error("job {id} is {actual}, expected {expected}")]
    Conflict {
        id: i64,
        expected: JobStatus,
        actual: JobStatus,
    },

    /// The media already has a queued or running job.
    #[error("media {media_id} already has open job {job_id}")]
    OpenJobExists { media_id: i64, job_id: i64 },

    #[error("store lock poisoned")]
    Poisoned,
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Record access used by discovery, admission, dispatch and the scheduler.
pub trait JobStore: Send + Sync {
    /// Insert or update the media record for `media.path`.
    ///
    /// `needs_transcode` is recomputed from the store's codec policy.
    fn upsert_media(&self, media: NewMedia) -> Result<MediaUpsert, StoreError>;

    fn get_media(&self, id: i64) -> Result<Option<MediaRecord>, StoreError>;

    fn find_media_by_path(&self, path: &Path) -> Result<Option<MediaRecord>, StoreError>;

    /// Media needing transcode, largest first, excluding media whose most recent
    /// job is in any of `exclude_statuses`.
    fn find_media_needing_transcode(
        &self,
        limit: usize,
        exclude_statuses: &[JobStatus],
    ) -> Result<Vec<MediaRecord>, StoreError>;

    /// Record a successful re-encode: new codec and size, `previously_transcoded` set.
    fn mark_media_transcoded(
        &self,
        media_id: i64,
        new_codec: &str,
        new_size: u64,
    ) -> Result<(), StoreError>;

    /// Create a `queued` job and return its id.
    fn create_job(&self, media_id: i64, priority: i64, original_size: u64)
        -> Result<i64, StoreError>;

    /// Set the job's status and apply the optional field changes in `update`.
    fn update_job(&self, id: i64, status: JobStatus, update: JobUpdate)
        -> Result<(), StoreError>;

    fn get_job(&self, id: i64) -> Result<Option<EncodingJob>, StoreError>;

    /// Most recently created job for a media record.
    fn latest_job_for_media(&self, media_id: i64) -> Result<Option<EncodingJob>, StoreError>;

    /// Jobs in `status`, priority descending then id ascending.
    /// Completed jobs come back most recently completed first.
    fn list_jobs_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<EncodingJob>, StoreError>;

    /// Case-insensitive substring match over media title and path.
    fn search_jobs(&self, text: &str, limit: usize) -> Result<Vec<EncodingJob>, StoreError>;

    /// Rules in ascending id order.
    fn list_schedule_rules(&self) -> Result<Vec<ScheduleRule>, StoreError>;

    fn get_schedule_rule(&self, id: i64) -> Result<Option<ScheduleRule>, StoreError>;

    fn create_schedule_rule(&self, rule: &ScheduleRuleInput) -> Result<ScheduleRule, StoreError>;

    fn update_schedule_rule(
        &self,
        id: i64,
        rule: &ScheduleRuleInput,
    ) -> Result<ScheduleRule, StoreError>;

    fn delete_schedule_rule(&self, id: i64) -> Result<(), StoreError>;
}
