//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Media library configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct LibraryConfig {
    /// Root directory scanned and watched at startup (optional)
    #[serde(default)]
    pub root: Option<PathBuf>,
}

/// Persistent store configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseConfig {
    /// Path of the SQLite database file
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("reencode.db")
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchConfig {
    /// Jobs allowed to run at once until a schedule rule says otherwise (floor 1)
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: u32,
    /// Interval between queue polls when nothing wakes the loop earlier
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Directory receiving in-progress encoder output
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
    /// Kill an encoder that runs longer than this (0 = no limit)
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
    /// Keep a `.orig.<timestamp>` copy of each replaced source
    #[serde(default)]
    pub keep_original: bool,
}

fn default_concurrency_limit() -> u32 {
    2
}

fn default_poll_interval_ms() -> u64 {
    5000
}

fn default_scratch_dir() -> PathBuf {
    PathBuf::from("/tmp/reencode-daemon")
}

fn default_job_timeout_secs() -> u64 {
    12 * 60 * 60
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: default_concurrency_limit(),
            poll_interval_ms: default_poll_interval_ms(),
            scratch_dir: default_scratch_dir(),
            job_timeout_secs: default_job_timeout_secs(),
            keep_original: false,
        }
    }
}

/// Encoder binary and output configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: PathBuf,
    /// Codec tag recorded for replaced files when re-probing fails
    #[serde(default = "default_target_codec")]
    pub target_codec: String,
    /// Codec tags that never need transcoding
    #[serde(default = "default_accepted_codecs")]
    pub accepted_codecs: Vec<String>,
    #[serde(default = "default_crf")]
    pub crf: u8,
    #[serde(default = "default_preset")]
    pub preset: String,
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe_path() -> PathBuf {
    PathBuf::from("ffprobe")
}

fn default_target_codec() -> String {
    "hevc".to_string()
}

fn default_accepted_codecs() -> Vec<String> {
    vec!["hevc".to_string(), "av1".to_string()]
}

fn default_crf() -> u8 {
    23
}

fn default_preset() -> String {
    "medium".to_string()
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
            target_codec: default_target_codec(),
            accepted_codecs: default_accepted_codecs(),
            crf: default_crf(),
            preset: default_preset(),
        }
    }
}

/// Encoder safety configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct EncoderSafetyConfig {
    /// Never select a hardware-accelerated encoder profile (default false)
    #[serde(default)]
    pub disallow_hardware_encoding: bool,
}

/// File discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoveryConfig {
    /// Seconds a watched file must keep the same size before it is probed
    #[serde(default = "default_stability_wait_secs")]
    pub stability_wait_secs: u64,
    /// Give up on a watched file that is still growing after this many checks
    #[serde(default = "default_stability_max_checks")]
    pub stability_max_checks: u32,
    /// Maximum media records admitted per admission pass
    #[serde(default = "default_admission_batch")]
    pub admission_batch: usize,
}

fn default_stability_wait_secs() -> u64 {
    10
}

fn default_stability_max_checks() -> u32 {
    30
}

fn default_admission_batch() -> usize {
    500
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            stability_wait_secs: default_stability_wait_secs(),
            stability_max_checks: default_stability_max_checks(),
            admission_batch: default_admission_batch(),
        }
    }
}

/// Control HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:7878".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub library: LibraryConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub encoder_safety: EncoderSafetyConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Missing sections and fields fall back to their defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - REENCODE_LIBRARY_ROOT -> library.root
    /// - REENCODE_DATABASE_PATH -> database.path
    /// - REENCODE_CONCURRENCY_LIMIT -> dispatch.concurrency_limit
    /// - REENCODE_SCRATCH_DIR -> dispatch.scratch_dir
    /// - REENCODE_JOB_TIMEOUT_SECS -> dispatch.job_timeout_secs
    /// - FFMPEG_PATH -> encoder.ffmpeg_path
    /// - FFPROBE_PATH -> encoder.ffprobe_path
    /// - ENCODER_DISALLOW_HARDWARE_ENCODING -> encoder_safety.disallow_hardware_encoding
    /// - REENCODE_SERVER_BIND -> server.bind
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("REENCODE_LIBRARY_ROOT") {
            if !val.is_empty() {
                self.library.root = Some(PathBuf::from(val));
            }
        }

        if let Ok(val) = env::var("REENCODE_DATABASE_PATH") {
            if !val.is_empty() {
                self.database.path = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("REENCODE_CONCURRENCY_LIMIT") {
            if let Ok(limit) = val.parse::<u32>() {
                self.dispatch.concurrency_limit = limit;
            }
        }

        if let Ok(val) = env::var("REENCODE_SCRATCH_DIR") {
            if !val.is_empty() {
                self.dispatch.scratch_dir = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("REENCODE_JOB_TIMEOUT_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.dispatch.job_timeout_secs = secs;
            }
        }

        if let Ok(val) = env::var("FFMPEG_PATH") {
            if !val.is_empty() {
                self.encoder.ffmpeg_path = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("FFPROBE_PATH") {
            if !val.is_empty() {
                self.encoder.ffprobe_path = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("ENCODER_DISALLOW_HARDWARE_ENCODING") {
            // Accept "true", "1", "yes" as true; "false", "0", "no" as false
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.encoder_safety.disallow_hardware_encoding = true,
                "false" | "0" | "no" => self.encoder_safety.disallow_hardware_encoding = false,
                _ => {} // Invalid value, keep existing
            }
        }

        if let Ok(val) = env::var("REENCODE_SERVER_BIND") {
            if !val.is_empty() {
                self.server.bind = val;
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        if !path.as_ref().exists() {
            let mut config = Self::default();
            config.apply_env_overrides();
            return Ok(config);
        }
        Self::load(path)
    }

    /// Effective concurrency limit, never below one
    pub fn effective_concurrency_limit(&self) -> usize {
        self.dispatch.concurrency_limit.max(1) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const ENV_VARS: &[&str] = &[
        "REENCODE_LIBRARY_ROOT",
        "REENCODE_DATABASE_PATH",
        "REENCODE_CONCURRENCY_LIMIT",
        "REENCODE_SCRATCH_DIR",
        "REENCODE_JOB_TIMEOUT_SECS",
        "FFMPEG_PATH",
        "FFPROBE_PATH",
        "ENCODER_DISALLOW_HARDWARE_ENCODING",
        "REENCODE_SERVER_BIND",
    ];

    fn clear_env_vars() {
        for var in ENV_VARS {
            env::remove_var(var);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        // Every section round-trips from TOML with the values written into it.
        #[test]
        fn prop_config_parses_all_sections(
            limit in 0u32..64,
            poll in 1u64..100_000,
            timeout in 0u64..1_000_000,
            keep_original in proptest::bool::ANY,
            crf in 0u8..52,
            disallow_hw in proptest::bool::ANY,
            stability in 0u64..600,
            batch in 1usize..10_000,
        ) {
            let toml_str = format!(
                r#"
[library]
root = "/media/library"

[database]
path = "/var/lib/reencode/state.db"

[dispatch]
concurrency_limit = {}
poll_interval_ms = {}
scratch_dir = "/scratch"
job_timeout_secs = {}
keep_original = {}

[encoder]
crf = {}
accepted_codecs = ["hevc"]

[encoder_safety]
disallow_hardware_encoding = {}

[discovery]
stability_wait_secs = {}
admission_batch = {}

[server]
bind = "0.0.0.0:9000"
"#,
                limit, poll, timeout, keep_original, crf, disallow_hw, stability, batch
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(&config.library.root, &Some(PathBuf::from("/media/library")));
            prop_assert_eq!(&config.database.path, &PathBuf::from("/var/lib/reencode/state.db"));
            prop_assert_eq!(config.dispatch.concurrency_limit, limit);
            prop_assert_eq!(config.dispatch.poll_interval_ms, poll);
            prop_assert_eq!(&config.dispatch.scratch_dir, &PathBuf::from("/scratch"));
            prop_assert_eq!(config.dispatch.job_timeout_secs, timeout);
            prop_assert_eq!(config.dispatch.keep_original, keep_original);
            prop_assert_eq!(config.encoder.crf, crf);
            prop_assert_eq!(&config.encoder.accepted_codecs, &vec!["hevc".to_string()]);
            prop_assert_eq!(config.encoder_safety.disallow_hardware_encoding, disallow_hw);
            prop_assert_eq!(config.discovery.stability_wait_secs, stability);
            prop_assert_eq!(config.discovery.admission_batch, batch);
            prop_assert_eq!(config.server.bind.as_str(), "0.0.0.0:9000");
            prop_assert!(config.effective_concurrency_limit() >= 1);
        }

        #[test]
        fn prop_env_overrides_concurrency_limit(
            initial in 1u32..16,
            override_limit in 0u32..64,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[dispatch]\nconcurrency_limit = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("REENCODE_CONCURRENCY_LIMIT", override_limit.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.dispatch.concurrency_limit, override_limit);
            prop_assert_eq!(config.effective_concurrency_limit(), override_limit.max(1) as usize);
        }

        #[test]
        fn prop_env_overrides_disallow_hardware_encoding(
            initial_disallow in proptest::bool::ANY,
            override_disallow in proptest::bool::ANY,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!(
                "[encoder_safety]\ndisallow_hardware_encoding = {}\n",
                initial_disallow
            );
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("ENCODER_DISALLOW_HARDWARE_ENCODING", override_disallow.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.encoder_safety.disallow_hardware_encoding, override_disallow);
        }
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config.library.root, None);
        assert_eq!(config.database.path, PathBuf::from("reencode.db"));
        assert_eq!(config.dispatch.concurrency_limit, 2);
        assert_eq!(config.dispatch.poll_interval_ms, 5000);
        assert_eq!(config.dispatch.job_timeout_secs, 43200);
        assert!(!config.dispatch.keep_original);
        assert_eq!(config.encoder.accepted_codecs, vec!["hevc", "av1"]);
        assert_eq!(config.encoder.target_codec, "hevc");
        assert!(!config.encoder_safety.disallow_hardware_encoding);
        assert_eq!(config.discovery.stability_wait_secs, 10);
        assert_eq!(config.server.bind, "127.0.0.1:7878");
    }

    #[test]
    fn test_zero_concurrency_limit_is_floored() {
        let config = Config::parse_toml("[dispatch]\nconcurrency_limit = 0\n").unwrap();
        assert_eq!(config.effective_concurrency_limit(), 1);
    }

    #[test]
    fn test_path_overrides() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("REENCODE_LIBRARY_ROOT", "/srv/media");
        env::set_var("FFMPEG_PATH", "/opt/ffmpeg/bin/ffmpeg");
        env::set_var("REENCODE_SCRATCH_DIR", "/fast/scratch");
        env::set_var("REENCODE_JOB_TIMEOUT_SECS", "not-a-number");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.library.root, Some(PathBuf::from("/srv/media")));
        assert_eq!(config.encoder.ffmpeg_path, PathBuf::from("/opt/ffmpeg/bin/ffmpeg"));
        assert_eq!(config.dispatch.scratch_dir, PathBuf::from("/fast/scratch"));
        // invalid number keeps the default
        assert_eq!(config.dispatch.job_timeout_secs, 43200);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let config = Config::load_or_default("/nonexistent/reencode/config.toml")
            .expect("missing file should fall back to defaults");
        assert_eq!(config, Config::default());
    }
}
