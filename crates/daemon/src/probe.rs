//! Media probing via ffprobe.
//!
//! Discovery only needs the primary video codec and the duration, but the full
//! stream list is kept so callers can tell "no video" apart from "unknown codec".

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe exited unsuccessfully.
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// Failed to parse ffprobe JSON output.
    #[error("Failed to parse ffprobe output: {0}")]
    ParseError(String),

    /// ffprobe could not be started.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Information about a video stream from ffprobe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoStream {
    /// Codec name (e.g., "hevc", "h264", "av1").
    pub codec_name: String,
    pub width: u32,
    pub height: u32,
}

/// Information about an audio stream from ffprobe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioStream {
    pub codec_name: String,
    pub channels: u32,
}

/// Format information from ffprobe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FormatInfo {
    /// Duration in seconds, when the container reports one.
    pub duration_secs: Option<f64>,
    /// File size in bytes.
    pub size_bytes: u64,
}

/// Result of probing a media file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeResult {
    pub video_streams: Vec<VideoStream>,
    pub audio_streams: Vec<AudioStream>,
    pub format: FormatInfo,
}

impl ProbeResult {
    /// Codec of the first video stream, or `None` for audio-only/data files.
    pub fn primary_video_codec(&self) -> Option<&str> {
        self.video_streams.first().map(|v| v.codec_name.as_str())
    }
}

/// Something that can inspect a media file.
#[async_trait]
pub trait MediaProbe: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<ProbeResult, ProbeError>;
}

/// Probe backed by the `ffprobe` binary.
#[derive(Debug, Clone)]
pub struct FfprobeProbe {
    ffprobe_path: PathBuf,
}

impl FfprobeProbe {
    pub fn new(ffprobe_path: impl Into<PathBuf>) -> Self {
        Self {
            ffprobe_path: ffprobe_path.into(),
        }
    }
}

impl Default for FfprobeProbe {
    fn default() -> Self {
        Self::new("ffprobe")
    }
}

#[async_trait]
impl MediaProbe for FfprobeProbe {
    /// Runs `ffprobe -v quiet -print_format json -show_streams -show_format <path>`
    /// and parses the JSON output.
    async fn probe(&self, path: &Path) -> Result<ProbeResult, ProbeError> {
        let output = Command::new(&self.ffprobe_path)
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_streams",
                "-show_format",
            ])
            .arg(path)
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProbeError::FfprobeFailed(format!(
                "ffprobe exited with status {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_ffprobe_output(&stdout)
    }
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub codec_name: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
        pub channels: Option<u32>,
        /// Cover art and thumbnails show up as single-frame video streams.
        pub disposition: Option<Disposition>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Disposition {
        #[serde(default)]
        pub attached_pic: u8,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
        pub size: Option<String>,
    }
}

/// Parses ffprobe JSON output into a ProbeResult.
pub fn parse_ffprobe_output(json_str: &str) -> Result<ProbeResult, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let streams = ffprobe.streams.unwrap_or_default();
    let format = ffprobe.format.ok_or_else(|| {
        ProbeError::ParseError("Missing format information in ffprobe output".to_string())
    })?;

    let mut video_streams = Vec::new();
    let mut audio_streams = Vec::new();

    for stream in streams {
        let codec_name = stream.codec_name.clone().unwrap_or_default();
        match stream.codec_type.as_deref().unwrap_or("") {
            "video" => {
                let attached_pic = stream
                    .disposition
                    .as_ref()
                    .map_or(false, |d| d.attached_pic != 0);
                if attached_pic {
                    continue;
                }
                video_streams.push(VideoStream {
                    codec_name,
                    width: stream.width.unwrap_or(0),
                    height: stream.height.unwrap_or(0),
                });
            }
            "audio" => audio_streams.push(AudioStream {
                codec_name,
                channels: stream.channels.unwrap_or(0),
            }),
            _ => {}
        }
    }

    let duration_secs = format
        .duration
        .as_ref()
        .and_then(|d| d.parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0);

    let size_bytes = format
        .size
        .as_ref()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);

    Ok(ProbeResult {
        video_streams,
        audio_streams,
        format: FormatInfo {
            duration_secs,
            size_bytes,
        },
    })
}
