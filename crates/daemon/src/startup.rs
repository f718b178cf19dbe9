//! Startup checks for the re-encode daemon
//!
//! Verifies before anything is scheduled that:
//! - ffmpeg runs and is recent enough
//! - ffprobe runs
//! - an HEVC encoder the configuration allows is compiled in

use crate::config::Config;
use crate::encode::{detect_hardware_flag, parse_hardware_encoders};
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tracing::{info, warn};

/// Oldest ffmpeg major version with `-progress pipe:` and 10-bit libx265 output.
pub const MIN_FFMPEG_MAJOR: u32 = 4;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("ffmpeg not available: {0}")]
    FfmpegUnavailable(String),

    #[error("FFmpeg version requirement not met: {0}")]
    FfmpegVersion(String),

    #[error("ffprobe not available: {0}")]
    FfprobeUnavailable(String),

    #[error("No usable HEVC encoder: {0}")]
    NoHevcEncoder(String),

    #[error("Hardware encoding detected: {0}")]
    HardwareEncodingDetected(String),
}

/// Reject configuration values naming a hardware encoder when hardware
/// encoding is disallowed.
pub fn assert_software_only(cfg: &Config) -> Result<(), StartupError> {
    if !cfg.encoder_safety.disallow_hardware_encoding {
        return Ok(());
    }
    let preset = cfg.encoder.preset.as_str();
    if let Some(flag) = detect_hardware_flag(preset) {
        return Err(StartupError::HardwareEncodingDetected(format!(
            "Hardware encoding flag '{}' found in preset '{}', but hardware encoding is disabled",
            flag, preset
        )));
    }
    Ok(())
}

/// Parse FFmpeg version string and extract major version number
///
/// Handles both `ffmpeg version 6.1.1 ...` and `ffmpeg version n6.1-...`.
/// Git snapshot builds (`N-113000-g...`) carry no release number and yield `None`.
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let version_part = version_line
        .to_lowercase()
        .split("ffmpeg version")
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    let version_str = version_part.trim_start_matches('n');
    let major_str = version_str.split(|c| c == '.' || c == '-').next()?;
    major_str.parse().ok()
}

fn run_version(binary: &Path) -> Result<String, String> {
    let output = Command::new(binary)
        .arg("-version")
        .output()
        .map_err(|e| format!("failed to run {} -version: {}", binary.display(), e))?;
    if !output.status.success() {
        return Err(format!("{} -version exited with {}", binary.display(), output.status));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Check ffmpeg runs and, when its version is known, that it is new enough.
///
/// Returns the parsed major version.
pub fn check_ffmpeg(ffmpeg: &Path) -> Result<Option<u32>, StartupError> {
    let output = run_version(ffmpeg).map_err(StartupError::FfmpegUnavailable)?;
    match parse_ffmpeg_version(&output) {
        Some(major) if major < MIN_FFMPEG_MAJOR => Err(StartupError::FfmpegVersion(format!(
            "FFmpeg {}.x or newer required, got: {}",
            MIN_FFMPEG_MAJOR, major
        ))),
        Some(major) => Ok(Some(major)),
        None => {
            warn!(
                version = output.lines().next().unwrap_or("(empty)"),
                "Could not parse FFmpeg version; assuming a recent build"
            );
            Ok(None)
        }
    }
}

pub fn check_ffprobe(ffprobe: &Path) -> Result<(), StartupError> {
    run_version(ffprobe)
        .map(|_| ())
        .map_err(StartupError::FfprobeUnavailable)
}

/// Whether `ffmpeg -encoders` output offers an HEVC encoder the configuration may use.
pub fn has_usable_hevc_encoder(encoders_output: &str, disallow_hardware: bool) -> bool {
    let software = encoders_output
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|name| name == "libx265");
    software || (!disallow_hardware && !parse_hardware_encoders(encoders_output).is_empty())
}

pub fn check_hevc_encoder(ffmpeg: &Path, disallow_hardware: bool) -> Result<(), StartupError> {
    let output = Command::new(ffmpeg)
        .args(["-hide_banner", "-encoders"])
        .output()
        .map_err(|e| StartupError::FfmpegUnavailable(e.to_string()))?;
    let listing = String::from_utf8_lossy(&output.stdout);
    if has_usable_hevc_encoder(&listing, disallow_hardware) {
        return Ok(());
    }
    Err(StartupError::NoHevcEncoder(if disallow_hardware {
        "ffmpeg was built without libx265 and hardware encoding is disabled".to_string()
    } else {
        "ffmpeg lists neither libx265 nor a hardware HEVC encoder".to_string()
    }))
}

pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    assert_software_only(cfg)?;
    let major = check_ffmpeg(&cfg.encoder.ffmpeg_path)?;
    check_ffprobe(&cfg.encoder.ffprobe_path)?;
    check_hevc_encoder(
        &cfg.encoder.ffmpeg_path,
        cfg.encoder_safety.disallow_hardware_encoding,
    )?;
    info!(ffmpeg_major = ?major, "Startup checks passed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::path::PathBuf;

    const LISTING: &str = " V....D libx264              libx264 H.264 / AVC\n V....D hevc_nvenc           NVIDIA NVENC hevc encoder (codec hevc)\n";

    #[test]
    fn test_git_snapshot_version_is_unknown() {
        assert_eq!(
            parse_ffmpeg_version("ffmpeg version N-113000-g1234567 Copyright (c) 2000-2024"),
            None
        );
        assert_eq!(parse_ffmpeg_version("not ffmpeg output"), None);
    }

    #[test]
    fn test_hevc_encoder_availability() {
        assert!(has_usable_hevc_encoder(LISTING, false));
        assert!(!has_usable_hevc_encoder(LISTING, true));
        let with_x265 = format!("{} V....D libx265              libx265 H.265\n", LISTING);
        assert!(has_usable_hevc_encoder(&with_x265, true));
    }

    #[test]
    fn test_hardware_preset_rejected_only_when_disallowed() {
        let mut cfg = Config::default();
        cfg.encoder.preset = "p7_nvenc".to_string();
        assert!(assert_software_only(&cfg).is_ok());

        cfg.encoder_safety.disallow_hardware_encoding = true;
        assert!(matches!(
            assert_software_only(&cfg),
            Err(StartupError::HardwareEncodingDetected(_))
        ));

        cfg.encoder.preset = "slow".to_string();
        assert!(assert_software_only(&cfg).is_ok());
    }

    #[test]
    fn test_missing_binaries_fail_checks() {
        let missing = PathBuf::from("/nonexistent/ffmpeg");
        assert!(matches!(
            check_ffmpeg(&missing),
            Err(StartupError::FfmpegUnavailable(_))
        ));
        assert!(matches!(
            check_ffprobe(&missing),
            Err(StartupError::FfprobeUnavailable(_))
        ));

        let mut cfg = Config::default();
        cfg.encoder.ffmpeg_path = missing;
        assert!(run_startup_checks(&cfg).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_ffmpeg_version_parsing_standard(
            major in 1u32..20,
            minor in 0u32..10,
            patch in 0u32..10,
        ) {
            let version_output = format!(
                "ffmpeg version {}.{}.{} Copyright (c) 2000-2024 the FFmpeg developers",
                major, minor, patch
            );
            prop_assert_eq!(parse_ffmpeg_version(&version_output), Some(major));
        }

        #[test]
        fn prop_ffmpeg_version_parsing_n_prefixed(
            major in 1u32..20,
            minor in 0u32..10,
            git_hash in "[a-f0-9]{7}",
        ) {
            let version_output = format!(
                "ffmpeg version n{}.{}-123-g{} Copyright (c) 2000-2024",
                major, minor, git_hash
            );
            prop_assert_eq!(parse_ffmpeg_version(&version_output), Some(major));
        }

        #[test]
        fn prop_ffmpeg_version_parsing_multiline(
            major in 1u32..20,
            minor in 0u32..10,
        ) {
            let version_output = format!(
                "ffmpeg version {}.{} Copyright (c) 2000-2024\nbuilt with gcc 12.2.0\nconfiguration: --enable-libx265",
                major, minor
            );
            prop_assert_eq!(parse_ffmpeg_version(&version_output), Some(major));
        }
    }
}
