//! Media records: one row per discovered video file.
//!
//! A record is keyed by its absolute path. The `needs_transcode` flag is never
//! supplied by callers; the store derives it from the [`CodecPolicy`] on every write.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How a file was grouped by the filename classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaCategory {
    /// Part of a series; title is the containing directory name.
    Series,
    /// Standalone file; title is the file stem.
    Single,
}

impl MediaCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaCategory::Series => "series",
            MediaCategory::Single => "single",
        }
    }

    /// Parse the stored representation. Unknown values read as `Single`.
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "series" => MediaCategory::Series,
            _ => MediaCategory::Single,
        }
    }
}

impl std::fmt::Display for MediaCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of codec tags that do not need transcoding (compared case-insensitively).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecPolicy {
    accepted: Vec<String>,
}

impl CodecPolicy {
    pub fn new<I, S>(accepted: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let accepted = accepted
            .into_iter()
            .map(|c| c.as_ref().trim().to_ascii_lowercase())
            .filter(|c| !c.is_empty())
            .collect();
        Self { accepted }
    }

    /// Whether a file carrying `codec` must be re-encoded.
    pub fn needs_transcode(&self, codec: &str) -> bool {
        let codec = codec.trim().to_ascii_lowercase();
        !self.accepted.iter().any(|c| *c == codec)
    }

    pub fn accepted(&self) -> &[String] {
        &self.accepted
    }
}

impl Default for CodecPolicy {
    fn default() -> Self {
        Self::new(["hevc", "av1"])
    }
}

/// Attributes of a discovered file as handed to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMedia {
    pub path: PathBuf,
    pub title: String,
    pub episode: Option<String>,
    pub directory: PathBuf,
    pub size_bytes: u64,
    pub codec: String,
    pub category: MediaCategory,
    pub duration_secs: Option<f64>,
}

/// A stored media record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRecord {
    pub id: i64,
    pub path: PathBuf,
    pub title: String,
    pub episode: Option<String>,
    pub directory: PathBuf,
    pub size_bytes: u64,
    pub codec: String,
    pub category: MediaCategory,
    pub duration_secs: Option<f64>,
    pub needs_transcode: bool,
    pub previously_transcoded: bool,
    pub updated_at: DateTime<Utc>,
}

/// Result of an upsert keyed by path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaUpsert {
    pub id: i64,
    /// True when no record existed for the path before this call.
    pub created: bool,
}
