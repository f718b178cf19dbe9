//! ffmpeg encoder
//!
//! Re-encodes the video stream to HEVC at a fixed quality while copying every
//! audio and subtitle stream. A hardware encoder is used when ffmpeg offers one
//! that actually works on this host, unless hardware encoding is disallowed.

use super::progress::{is_progress_line, EncodeProgress, ProgressTracker, StderrTail};
use super::{EncodeError, EncodeRequest, Encoder};
use crate::config::{EncoderConfig, EncoderSafetyConfig};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Substrings that identify hardware encoders or hardware acceleration flags
const FORBIDDEN_HW_FLAGS: &[&str] = &[
    "nvenc", "qsv", "vaapi", "cuda", "amf", "vce", "videotoolbox", "hwaccel",
];

/// Number of ffmpeg log lines kept for error reports
const STDERR_TAIL_LINES: usize = 20;

/// Containers that need the `hvc1` tag for HEVC to play back on Apple devices
const HVC1_CONTAINERS: &[&str] = &["mp4", "mov", "m4v"];

/// Which HEVC encoder implementation ffmpeg is asked to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderProfile {
    /// libx265 on the CPU.
    Software,
    VideoToolbox,
    Nvenc,
    Qsv,
}

impl EncoderProfile {
    /// Hardware profiles in order of preference.
    pub const HARDWARE: [EncoderProfile; 3] = [
        EncoderProfile::VideoToolbox,
        EncoderProfile::Nvenc,
        EncoderProfile::Qsv,
    ];

    /// ffmpeg encoder name passed to `-c:v`.
    pub fn video_encoder(&self) -> &'static str {
        match self {
            EncoderProfile::Software => "libx265",
            EncoderProfile::VideoToolbox => "hevc_videotoolbox",
            EncoderProfile::Nvenc => "hevc_nvenc",
            EncoderProfile::Qsv => "hevc_qsv",
        }
    }

    pub fn is_hardware(&self) -> bool {
        !matches!(self, EncoderProfile::Software)
    }
}

impl std::fmt::Display for EncoderProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.video_encoder())
    }
}

/// Encoder settings taken from the `[encoder]` and `[encoder_safety]` sections.
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderSettings {
    pub ffmpeg_path: PathBuf,
    pub crf: u8,
    pub preset: String,
    pub disallow_hardware_encoding: bool,
}

impl EncoderSettings {
    pub fn from_config(encoder: &EncoderConfig, safety: &EncoderSafetyConfig) -> Self {
        Self {
            ffmpeg_path: encoder.ffmpeg_path.clone(),
            crf: encoder.crf,
            preset: encoder.preset.clone(),
            disallow_hardware_encoding: safety.disallow_hardware_encoding,
        }
    }
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self::from_config(&EncoderConfig::default(), &EncoderSafetyConfig::default())
    }
}

/// Check if a string contains any forbidden hardware encoder flags
///
/// Returns the first detected forbidden flag, or None if clean.
pub fn detect_hardware_flag(s: &str) -> Option<&'static str> {
    let lower = s.to_lowercase();
    FORBIDDEN_HW_FLAGS
        .iter()
        .find(|&&flag| lower.contains(flag))
        .copied()
}

/// Hardware profiles listed in `ffmpeg -encoders` output, in preference order.
pub fn parse_hardware_encoders(encoders_output: &str) -> Vec<EncoderProfile> {
    let listed: Vec<&str> = encoders_output
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .collect();
    EncoderProfile::HARDWARE
        .into_iter()
        .filter(|p| listed.contains(&p.video_encoder()))
        .collect()
}

fn needs_hvc1_tag(output: &Path) -> bool {
    output
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| HVC1_CONTAINERS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Build the ffmpeg command for one encode
///
/// - all streams mapped (`-map 0`)
/// - video re-encoded to HEVC, 10-bit, fixed quality
/// - audio and subtitles copied untouched
/// - machine-readable progress on stderr (`-progress pipe:2`)
pub fn build_ffmpeg_command(
    settings: &EncoderSettings,
    profile: EncoderProfile,
    request: &EncodeRequest,
) -> Command {
    let mut cmd = Command::new(&settings.ffmpeg_path);
    cmd.args(["-hide_banner", "-nostdin", "-y"]);
    cmd.arg("-i").arg(&request.input_path);
    cmd.args(["-map", "0"]);
    cmd.arg("-c:v").arg(profile.video_encoder());

    let quality = settings.crf.to_string();
    match profile {
        EncoderProfile::Software => {
            cmd.arg("-crf").arg(&quality);
            cmd.arg("-preset").arg(&settings.preset);
            cmd.args(["-pix_fmt", "yuv420p10le"]);
        }
        EncoderProfile::Nvenc => {
            cmd.args(["-rc", "vbr"]).arg("-cq").arg(&quality);
            cmd.args(["-pix_fmt", "p010le"]);
        }
        EncoderProfile::Qsv => {
            cmd.arg("-global_quality").arg(&quality);
            cmd.args(["-pix_fmt", "p010le"]);
        }
        EncoderProfile::VideoToolbox => {
            // VideoToolbox quality runs 1-100, higher is better.
            let q = 100u32.saturating_sub(settings.crf as u32 * 2).max(1);
            cmd.arg("-q:v").arg(q.to_string());
            cmd.args(["-pix_fmt", "p010le"]);
        }
    }

    if needs_hvc1_tag(&request.output_path) {
        cmd.args(["-tag:v", "hvc1"]);
    }
    cmd.args(["-c:a", "copy", "-c:s", "copy"]);
    cmd.args(["-nostats", "-progress", "pipe:2"]);
    cmd.arg(&request.output_path);
    cmd
}

/// Reject a command that would use hardware encoding.
///
/// Input and output paths are not inspected.
fn check_software_only(cmd: &Command, request: &EncodeRequest) -> Result<(), EncodeError> {
    let paths: [&OsStr; 2] = [
        request.input_path.as_os_str(),
        request.output_path.as_os_str(),
    ];
    for arg in cmd.get_args().filter(|a| !paths.contains(a)) {
        let arg = arg.to_string_lossy();
        if let Some(flag) = detect_hardware_flag(&arg) {
            return Err(EncodeError::HardwareEncodingDetected {
                flag,
                arg: arg.into_owned(),
            });
        }
    }
    Ok(())
}

/// Encoder backed by the ffmpeg binary
pub struct FfmpegEncoder {
    settings: EncoderSettings,
    profile: OnceCell<EncoderProfile>,
}

impl FfmpegEncoder {
    pub fn new(settings: EncoderSettings) -> Self {
        Self {
            settings,
            profile: OnceCell::new(),
        }
    }

    pub fn settings(&self) -> &EncoderSettings {
        &self.settings
    }

    async fn select_profile(&self) -> EncoderProfile {
        if self.settings.disallow_hardware_encoding {
            info!("Hardware encoding disallowed; using libx265");
            return EncoderProfile::Software;
        }

        let output = tokio::process::Command::new(&self.settings.ffmpeg_path)
            .args(["-hide_banner", "-encoders"])
            .kill_on_drop(true)
            .output()
            .await;
        let listing = match output {
            Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout).into_owned(),
            Ok(out) => {
                warn!(status = %out.status, "ffmpeg -encoders failed; using libx265");
                return EncoderProfile::Software;
            }
            Err(e) => {
                warn!(error = %e, "Could not list ffmpeg encoders; using libx265");
                return EncoderProfile::Software;
            }
        };

        for profile in parse_hardware_encoders(&listing) {
            if self.trial_encode(profile).await {
                info!(encoder = %profile, "Using hardware encoder");
                return profile;
            }
            debug!(encoder = %profile, "Hardware encoder listed but not usable");
        }
        info!("No usable hardware encoder; using libx265");
        EncoderProfile::Software
    }

    /// Encode a single synthetic frame to check the encoder works on this host.
    async fn trial_encode(&self, profile: EncoderProfile) -> bool {
        tokio::process::Command::new(&self.settings.ffmpeg_path)
            .args(["-hide_banner", "-loglevel", "error", "-f", "lavfi", "-i"])
            .arg("color=c=black:s=256x256:d=0.1")
            .args(["-frames:v", "1", "-c:v", profile.video_encoder(), "-f", "null", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    async fn profile(&self) -> EncoderProfile {
        *self
            .profile
            .get_or_init(|| async { self.select_profile().await })
            .await
    }

    async fn encode(
        &self,
        request: &EncodeRequest,
        progress: &(dyn Fn(EncodeProgress) + Send + Sync),
    ) -> Result<(), EncodeError> {
        let profile = self.profile().await;
        let std_cmd = build_ffmpeg_command(&self.settings, profile, request);
        if self.settings.disallow_hardware_encoding {
            check_software_only(&std_cmd, request)?;
        }

        let mut cmd = tokio::process::Command::from(std_cmd);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(input = %request.input_path.display(), encoder = %profile, "Spawning ffmpeg");
        let mut child = cmd.spawn()?;
        let stderr = child.stderr.take().ok_or_else(|| {
            EncodeError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "ffmpeg stderr was not captured",
            ))
        })?;

        // ffmpeg echoes container metadata verbatim, so lines are not always UTF-8.
        let mut reader = BufReader::new(stderr);
        let mut buf = Vec::new();
        let mut tracker = ProgressTracker::new(request.duration_secs);
        let mut tail = StderrTail::new(STDERR_TAIL_LINES);

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "Failed to read ffmpeg output");
                    break;
                }
            }
            let text = String::from_utf8_lossy(&buf);
            let line = text.trim_end_matches(&['\r', '\n'][..]);
            if let Some(sample) = tracker.observe(line) {
                progress(sample);
            } else if !is_progress_line(line) {
                tail.push(line);
            }
        }
        drop(reader);

        let status = child.wait().await?;
        if status.success() {
            return Ok(());
        }
        let detail = tail.text();
        match status.code() {
            Some(code) => Err(EncodeError::FfmpegFailed { code, detail }),
            None => Err(EncodeError::FfmpegTerminated { detail }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Helper to convert Command args to a Vec of strings for easier testing
    fn get_command_args(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    fn request(output: &str) -> EncodeRequest {
        EncodeRequest {
            input_path: PathBuf::from("/media/in.mkv"),
            output_path: PathBuf::from(output),
            duration_secs: Some(100.0),
        }
    }

    fn has_pair(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[test]
    fn test_software_command() {
        let cmd = build_ffmpeg_command(
            &EncoderSettings::default(),
            EncoderProfile::Software,
            &request("/scratch/1-abc.mkv"),
        );
        let args = get_command_args(&cmd);

        assert_eq!(cmd.get_program(), "ffmpeg");
        assert!(has_pair(&args, "-i", "/media/in.mkv"));
        assert!(has_pair(&args, "-map", "0"));
        assert!(has_pair(&args, "-c:v", "libx265"));
        assert!(has_pair(&args, "-crf", "23"));
        assert!(has_pair(&args, "-preset", "medium"));
        assert!(has_pair(&args, "-pix_fmt", "yuv420p10le"));
        assert!(has_pair(&args, "-c:a", "copy"));
        assert!(has_pair(&args, "-c:s", "copy"));
        assert!(has_pair(&args, "-progress", "pipe:2"));
        assert!(!args.contains(&"hvc1".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("/scratch/1-abc.mkv"));
    }

    #[test]
    fn test_mp4_output_gets_hvc1_tag() {
        let cmd = build_ffmpeg_command(
            &EncoderSettings::default(),
            EncoderProfile::Software,
            &request("/scratch/1-abc.MP4"),
        );
        assert!(has_pair(&get_command_args(&cmd), "-tag:v", "hvc1"));
    }

    #[test]
    fn test_hardware_profiles_use_10bit_surface() {
        for profile in EncoderProfile::HARDWARE {
            let cmd = build_ffmpeg_command(&EncoderSettings::default(), profile, &request("/s/o.mkv"));
            let args = get_command_args(&cmd);
            assert!(has_pair(&args, "-c:v", profile.video_encoder()));
            assert!(has_pair(&args, "-pix_fmt", "p010le"));
        }
    }

    #[test]
    fn test_parse_hardware_encoders() {
        let listing = "Encoders:\n V....D = Video\n ------\n V....D libx265              libx265 H.265 / HEVC (codec hevc)\n V....D hevc_qsv             HEVC (Intel Quick Sync Video acceleration) (codec hevc)\n V....D hevc_nvenc           NVIDIA NVENC hevc encoder (codec hevc)\n";
        assert_eq!(
            parse_hardware_encoders(listing),
            vec![EncoderProfile::Nvenc, EncoderProfile::Qsv]
        );
        assert!(parse_hardware_encoders(" V....D libx265 x").is_empty());
    }

    #[test]
    fn test_software_only_ignores_paths() {
        let req = EncodeRequest {
            input_path: PathBuf::from("/media/cuda tutorial.mkv"),
            output_path: PathBuf::from("/scratch/amf.mkv"),
            duration_secs: None,
        };
        let cmd = build_ffmpeg_command(&EncoderSettings::default(), EncoderProfile::Software, &req);
        assert!(check_software_only(&cmd, &req).is_ok());

        let cmd = build_ffmpeg_command(&EncoderSettings::default(), EncoderProfile::Nvenc, &req);
        assert!(matches!(
            check_software_only(&cmd, &req),
            Err(EncodeError::HardwareEncodingDetected { flag: "nvenc", .. })
        ));
    }

    #[tokio::test]
    async fn test_disallowed_hardware_forces_software_profile() {
        let settings = EncoderSettings {
            ffmpeg_path: PathBuf::from("/nonexistent/ffmpeg"),
            disallow_hardware_encoding: true,
            ..EncoderSettings::default()
        };
        let encoder = FfmpegEncoder::new(settings);
        assert_eq!(encoder.profile().await, EncoderProfile::Software);
    }

    #[tokio::test]
    async fn test_missing_ffmpeg_falls_back_to_software_and_fails_encode() {
        let encoder = FfmpegEncoder::new(EncoderSettings {
            ffmpeg_path: PathBuf::from("/nonexistent/ffmpeg"),
            ..EncoderSettings::default()
        });
        assert_eq!(encoder.profile().await, EncoderProfile::Software);
        let err = encoder
            .encode(&request("/tmp/out.mkv"), &|_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, EncodeError::Io(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_reported() {
        let encoder = FfmpegEncoder::new(EncoderSettings {
            ffmpeg_path: PathBuf::from("/bin/false"),
            disallow_hardware_encoding: true,
            ..EncoderSettings::default()
        });
        let err = encoder
            .encode(&request("/tmp/out.mkv"), &|_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, EncodeError::FfmpegFailed { code: 1, .. }));
    }

    /// Writes an executable shell script standing in for ffmpeg.
    #[cfg(unix)]
    fn fake_ffmpeg(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("ffmpeg");
        std::fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_utf8_log_lines_do_not_fail_encode() {
        let dir = tempfile::TempDir::new().unwrap();
        let ffmpeg = fake_ffmpeg(
            dir.path(),
            "for last; do :; done\n\
             printf 'title : Am\\351lie\\n' >&2\n\
             printf 'out_time_us=50000000\\n' >&2\n\
             printf 'hevc' > \"$last\"\n\
             exit 0\n",
        );
        let encoder = FfmpegEncoder::new(EncoderSettings {
            ffmpeg_path: ffmpeg,
            disallow_hardware_encoding: true,
            ..EncoderSettings::default()
        });
        let output = dir.path().join("out.mkv");
        let samples = std::sync::Mutex::new(Vec::new());

        encoder
            .encode(&request(output.to_str().unwrap()), &|p| {
                samples.lock().unwrap().push(p.elapsed_secs)
            })
            .await
            .unwrap();

        assert_eq!(std::fs::read_to_string(&output).unwrap(), "hevc");
        assert_eq!(*samples.lock().unwrap(), vec![50.0]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_utf8_log_lines_kept_in_failure_detail() {
        let dir = tempfile::TempDir::new().unwrap();
        let ffmpeg = fake_ffmpeg(
            dir.path(),
            "printf 'Invalid data in Am\\351lie\\n' >&2\nexit 3\n",
        );
        let encoder = FfmpegEncoder::new(EncoderSettings {
            ffmpeg_path: ffmpeg,
            disallow_hardware_encoding: true,
            ..EncoderSettings::default()
        });

        let err = encoder
            .encode(&request("/tmp/out.mkv"), &|_| {})
            .await
            .unwrap_err();
        match err {
            EncodeError::FfmpegFailed { code, detail } => {
                assert_eq!(code, 3);
                assert!(detail.contains("Invalid data in Am\u{FFFD}lie"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_hardware_flag_detection(
            prefix in "[a-z0-9_-]{0,10}",
            suffix in "[a-z0-9_-]{0,10}",
            flag_idx in 0usize..FORBIDDEN_HW_FLAGS.len(),
        ) {
            let flag = FORBIDDEN_HW_FLAGS[flag_idx];
            let test_string = format!("{}{}{}", prefix, flag.to_uppercase(), suffix);
            let detected = detect_hardware_flag(&test_string);
            prop_assert!(detected.is_some());
            prop_assert!(FORBIDDEN_HW_FLAGS.contains(&detected.unwrap()));
        }

        // Quality and preset land in the software command exactly as configured.
        #[test]
        fn prop_software_command_carries_settings(crf in 0u8..52, preset in "[a-z]{4,9}") {
            let settings = EncoderSettings { crf, preset: preset.clone(), ..EncoderSettings::default() };
            let cmd = build_ffmpeg_command(&settings, EncoderProfile::Software, &request("/s/o.mkv"));
            let args = get_command_args(&cmd);
            prop_assert!(has_pair(&args, "-crf", &crf.to_string()));
            prop_assert!(has_pair(&args, "-preset", &preset));
        }
    }
}
