//! Filename classifier for grouping media into series and single files.
//!
//! Files whose name carries an episode marker (`S01E02` or `1x02`) are grouped
//! under their containing directory; everything else stands on its own.

use crate::media::MediaCategory;
use regex_lite::Regex;
use std::path::Path;
use std::sync::OnceLock;

/// Episode marker: `S<n>E<n>` or `<n>x<n>`, case-insensitive.
const EPISODE_PATTERN: &str = r"(?i)S\d+E\d+|\d+x\d+";

fn episode_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(EPISODE_PATTERN).expect("episode pattern is valid"))
}

/// Outcome of classifying a file path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub category: MediaCategory,
    /// Series: the parent directory name. Single: the file stem.
    pub title: String,
    /// Series only: the file name.
    pub episode: Option<String>,
}

/// Whether a file name carries an episode marker.
pub fn has_episode_marker(file_name: &str) -> bool {
    episode_regex().is_match(file_name)
}

/// Classify a media file by its name.
///
/// A series file in the library root (no parent name) falls back to the file stem
/// as its title.
pub fn classify_path(path: &Path) -> Classification {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_name.clone());

    if has_episode_marker(&file_name) {
        let title = path
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or(stem);
        Classification {
            category: MediaCategory::Series,
            title,
            episode: Some(file_name),
        }
    } else {
        Classification {
            category: MediaCategory::Single,
            title: stem,
            episode: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_series_uses_parent_directory_as_title() {
        let c = classify_path(Path::new("/library/Show Name/Show.Name.S01E02.mkv"));
        assert_eq!(c.category, MediaCategory::Series);
        assert_eq!(c.title, "Show Name");
        assert_eq!(c.episode.as_deref(), Some("Show.Name.S01E02.mkv"));
    }

    #[test]
    fn test_alternate_episode_marker() {
        let c = classify_path(Path::new("/library/Cartoon/cartoon 3x14 finale.avi"));
        assert_eq!(c.category, MediaCategory::Series);
        assert_eq!(c.title, "Cartoon");
    }

    #[test]
    fn test_marker_is_case_insensitive() {
        assert!(has_episode_marker("show.s10e100.mp4"));
        assert!(has_episode_marker("SHOW.S1E1.MP4"));
        assert!(has_episode_marker("show.3X04.mkv"));
    }

    #[test]
    fn test_single_uses_file_stem() {
        let c = classify_path(Path::new("/library/movies/Heat (1995).mkv"));
        assert_eq!(c.category, MediaCategory::Single);
        assert_eq!(c.title, "Heat (1995)");
        assert_eq!(c.episode, None);
    }

    #[test]
    fn test_plain_names_are_single() {
        assert!(!has_episode_marker("Movie.2019.1080p.mkv"));
        assert!(!has_episode_marker("Season finale.mkv"));
    }

    proptest! {
        // Any name containing S<n>E<n> is a series; the episode is the full file name.
        #[test]
        fn prop_episode_marker_makes_series(
            prefix in "[A-Za-z ]{0,12}",
            season in 0u32..100,
            episode in 0u32..1000,
            lower in proptest::bool::ANY,
        ) {
            let marker = if lower {
                format!("s{:02}e{:02}", season, episode)
            } else {
                format!("S{:02}E{:02}", season, episode)
            };
            let name = format!("{}{}.mkv", prefix, marker);
            let path = Path::new("/lib/Series Dir").join(&name);

            let c = classify_path(&path);
            prop_assert_eq!(c.category, MediaCategory::Series);
            prop_assert_eq!(c.title, "Series Dir");
            prop_assert_eq!(c.episode, Some(name));
        }

        // Names made only of letters and spaces never look like episodes.
        #[test]
        fn prop_letters_only_are_single(stem in "[A-Za-z ]{1,20}") {
            let path = Path::new("/lib/dir").join(format!("{}.mkv", stem));
            let c = classify_path(&path);
            prop_assert_eq!(c.category, MediaCategory::Single);
            prop_assert_eq!(c.title, stem);
        }
    }
}
