//! Admission policy: turns media records that need transcoding into queued jobs.
//!
//! Passes are serialized so two concurrent passes cannot both admit the same
//! media. Media whose most recent job failed stay out until restarted by hand.

use crate::jobs::{priority_for_size, JobStatus};
use crate::store::{JobStore, StoreError};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info};

/// Statuses whose presence as the latest job keeps a media record out of admission.
const BLOCKING_STATUSES: [JobStatus; 4] = [
    JobStatus::Queued,
    JobStatus::Processing,
    JobStatus::ReplacingFile,
    JobStatus::Failed,
];

pub struct AdmissionPolicy {
    store: Arc<dyn JobStore>,
    batch: usize,
    pass_lock: Mutex<()>,
    wake: Arc<Notify>,
}

impl AdmissionPolicy {
    /// `wake` is notified whenever a pass admits at least one job.
    pub fn new(store: Arc<dyn JobStore>, batch: usize, wake: Arc<Notify>) -> Self {
        Self {
            store,
            batch: batch.max(1),
            pass_lock: Mutex::new(()),
            wake,
        }
    }

    /// Queue a job for up to `batch` media needing transcode, largest first.
    ///
    /// Returns the number of jobs created.
    pub async fn admit_pending(&self) -> Result<usize, StoreError> {
        let _pass = self.pass_lock.lock().await;

        let candidates = self
            .store
            .find_media_needing_transcode(self.batch, &BLOCKING_STATUSES)?;

        let mut admitted = 0;
        for media in candidates {
            if let Some(latest) = self.store.latest_job_for_media(media.id)? {
                if !latest.is_terminal() || latest.status == JobStatus::Failed {
                    debug!(media_id = media.id, job_id = latest.id, status = %latest.status, "Skipping media with blocking job");
                    continue;
                }
            }

            let priority = priority_for_size(media.size_bytes);
            match self.store.create_job(media.id, priority, media.size_bytes) {
                Ok(job_id) => {
                    debug!(job_id, media_id = media.id, priority, path = %media.path.display(), "Admitted job");
                    admitted += 1;
                }
                Err(StoreError::OpenJobExists { job_id, .. }) => {
                    debug!(media_id = media.id, job_id, "Media already has an open job");
                }
                Err(e) => return Err(e),
            }
        }

        if admitted > 0 {
            info!(admitted, "Admitted encoding jobs");
            self.wake.notify_one();
        }
        Ok(admitted)
    }
}
