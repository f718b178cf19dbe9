//! Re-encode daemon
//!
//! Background service that finds media files in codecs outside the accepted
//! set, queues them, re-encodes them to HEVC with ffmpeg and swaps the result
//! in place of the source.

pub mod admission;
pub mod classify;
pub mod control_server;
pub mod daemon;
pub mod dispatch;
pub mod encode;
pub mod events;
pub mod jobs;
pub mod media;
pub mod probe;
pub mod replace;
pub mod scan;
pub mod schedule;
pub mod stability;
pub mod startup;
pub mod store;
pub mod watch;

pub use reencode_daemon_config as config;
pub use reencode_daemon_config::Config;
pub use admission::AdmissionPolicy;
pub use control_server::{create_control_router, ControlState, ServerError};
pub use daemon::{Daemon, DaemonError, Library};
pub use dispatch::{DispatchControl, DispatchEngine, DispatchError, DispatchSettings, QueueSnapshot};
pub use encode::{EncodeError, EncodeRequest, Encoder, EncoderProfile, FfmpegEncoder};
pub use events::{DaemonEvent, EventBus};
pub use jobs::{EncodingJob, JobStatus};
pub use media::{CodecPolicy, MediaCategory, MediaRecord, NewMedia};
pub use probe::{FfprobeProbe, MediaProbe, ProbeError, ProbeResult};
pub use scan::{Discovery, DiscoveryError, ScanSummary};
pub use schedule::{ScheduleError, ScheduleRule, ScheduleRuleInput, WindowScheduler};
pub use startup::{run_startup_checks, StartupError};
pub use store::{JobStore, SqliteJobStore, StoreError};
pub use watch::{LibraryWatcher, WatchError};
