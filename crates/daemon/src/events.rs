//! Daemon notification channel.
//!
//! Events are fire-and-forget: a lagging or absent subscriber never blocks the
//! component that emits them.

use crate::jobs::JobStatus;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::broadcast;

/// Default number of events buffered per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Events emitted by discovery, dispatch and the window scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonEvent {
    /// A job moved to a new status.
    JobStatusChanged {
        job_id: i64,
        status: JobStatus,
        error: Option<String>,
    },
    /// Encoder progress for a running job.
    JobProgress {
        job_id: i64,
        /// Percent complete (0.0 - 100.0), when the source duration is known.
        progress: Option<f64>,
        /// Seconds of output written so far.
        elapsed_secs: f64,
    },
    /// One file processed by a scan.
    ScanProgress {
        current_file: PathBuf,
        total_scanned: usize,
        added: usize,
    },
    /// A schedule rule's window opened or closed.
    ScheduleActivityChanged { rule_id: i64, active: bool },
    /// Pause state or concurrency limit changed.
    QueueStateChanged {
        paused: bool,
        concurrency_limit: usize,
        active_count: usize,
    },
}

/// Cloneable handle on the broadcast channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DaemonEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn emit(&self, event: DaemonEvent) {
        // No receivers is not an error.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DaemonEvent> {
        self.sender.subscribe()
    }

    pub fn job_status(&self, job_id: i64, status: JobStatus, error: Option<String>) {
        self.emit(DaemonEvent::JobStatusChanged {
            job_id,
            status,
            error,
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers_does_not_fail() {
        let bus = EventBus::default();
        bus.emit(DaemonEvent::ScheduleActivityChanged {
            rule_id: 1,
            active: true,
        });
    }

    #[tokio::test]
    async fn test_subscriber_receives_events_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.job_status(1, JobStatus::Processing, None);
        bus.job_status(1, JobStatus::Failed, Some("boom".into()));

        assert_eq!(
            rx.recv().await.unwrap(),
            DaemonEvent::JobStatusChanged {
                job_id: 1,
                status: JobStatus::Processing,
                error: None
            }
        );
        match rx.recv().await.unwrap() {
            DaemonEvent::JobStatusChanged { status, error, .. } => {
                assert_eq!(status, JobStatus::Failed);
                assert_eq!(error.as_deref(), Some("boom"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_lagging_subscriber_does_not_block_sender() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for i in 0..10 {
            bus.emit(DaemonEvent::JobProgress {
                job_id: 1,
                progress: Some(i as f64),
                elapsed_secs: i as f64,
            });
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }

    #[test]
    fn test_event_json_is_tagged() {
        let json = serde_json::to_value(DaemonEvent::QueueStateChanged {
            paused: true,
            concurrency_limit: 2,
            active_count: 0,
        })
        .unwrap();
        assert_eq!(json["type"], "queue_state_changed");
        assert_eq!(json["paused"], true);
    }
}
