//! Encoding modules for the re-encode daemon

pub mod ffmpeg;
pub mod progress;

pub use ffmpeg::{
    build_ffmpeg_command, detect_hardware_flag, parse_hardware_encoders, EncoderProfile,
    EncoderSettings, FfmpegEncoder,
};
pub use progress::{parse_progress_time, EncodeProgress, ProgressTracker};

use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;

/// Error type for encoding operations
#[derive(Debug, Error)]
pub enum EncodeError {
    /// ffmpeg exited with a non-zero status
    #[error("ffmpeg failed with exit code {code}: {detail}")]
    FfmpegFailed { code: i32, detail: String },

    /// ffmpeg was terminated by a signal
    #[error("ffmpeg was terminated by signal: {detail}")]
    FfmpegTerminated { detail: String },

    /// Hardware encoder selected while hardware encoding is disallowed
    #[error("Hardware encoding flag '{flag}' found in '{arg}', but hardware encoding is disabled")]
    HardwareEncodingDetected { flag: &'static str, arg: String },

    /// IO error while starting or talking to ffmpeg
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Input and output of one encode.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeRequest {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    /// Source duration, used to turn elapsed output time into a percentage.
    pub duration_secs: Option<f64>,
}

/// Runs one encode to completion.
///
/// Dropping the returned future must stop the underlying process.
#[async_trait]
pub trait Encoder: Send + Sync {
    /// Profile the next encode will use.
    async fn profile(&self) -> EncoderProfile;

    /// Encode `request.input_path` into `request.output_path`, reporting progress.
    async fn encode(
        &self,
        request: &EncodeRequest,
        progress: &(dyn Fn(EncodeProgress) + Send + Sync),
    ) -> Result<(), EncodeError>;
}
