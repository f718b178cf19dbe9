//! Stability checking for files that may still be written to.
//!
//! A watched file is only probed once its size stays the same across a full
//! wait window. Files that keep growing are given up on after a bounded number
//! of windows; a later modify event will bring them back.

use std::path::Path;
use std::time::Duration;
use tokio::time::sleep;

/// Result of comparing a file's size across one wait window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StabilityResult {
    /// File size remained unchanged during the window.
    Stable,
    /// File size changed during the window.
    Unstable {
        initial_size: u64,
        current_size: u64,
    },
}

/// Outcome of waiting for a file to settle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StabilityOutcome {
    /// Size held across one window; carries the settled size.
    Stable(u64),
    /// Still changing after every allowed window.
    StillChanging { last_size: u64, checks: u32 },
}

/// Check whether a file kept `initial_size` over one `wait` window.
///
/// Returns `Err` if the file cannot be stat'ed after waiting (e.g. it was removed).
pub async fn check_stability(
    path: &Path,
    initial_size: u64,
    wait: Duration,
) -> Result<StabilityResult, std::io::Error> {
    sleep(wait).await;
    let current_size = tokio::fs::metadata(path).await?.len();
    Ok(compare_sizes(initial_size, current_size))
}

/// Wait until the file's size is unchanged across one `wait` window, checking at
/// most `max_checks` windows.
pub async fn wait_until_stable(
    path: &Path,
    wait: Duration,
    max_checks: u32,
) -> Result<StabilityOutcome, std::io::Error> {
    let mut size = tokio::fs::metadata(path).await?.len();
    let checks = max_checks.max(1);

    for _ in 0..checks {
        match check_stability(path, size, wait).await? {
            StabilityResult::Stable => return Ok(StabilityOutcome::Stable(size)),
            StabilityResult::Unstable { current_size, .. } => size = current_size,
        }
    }

    Ok(StabilityOutcome::StillChanging {
        last_size: size,
        checks,
    })
}

/// Compare two file sizes and return the appropriate StabilityResult.
#[inline]
pub fn compare_sizes(initial_size: u64, current_size: u64) -> StabilityResult {
    if initial_size == current_size {
        StabilityResult::Stable
    } else {
        StabilityResult::Unstable {
            initial_size,
            current_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;
    use tempfile::TempDir;

    proptest! {
        #[test]
        fn prop_stability_size_comparison(initial_size: u64, current_size: u64) {
            let result = compare_sizes(initial_size, current_size);

            if initial_size == current_size {
                prop_assert_eq!(result, StabilityResult::Stable);
            } else {
                prop_assert_eq!(
                    result,
                    StabilityResult::Unstable { initial_size, current_size }
                );
            }
        }
    }

    #[tokio::test]
    async fn test_settled_file_is_stable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("done.mkv");
        std::fs::write(&path, vec![0u8; 2048]).unwrap();

        let outcome = wait_until_stable(&path, Duration::from_millis(10), 3)
            .await
            .unwrap();
        assert_eq!(outcome, StabilityOutcome::Stable(2048));
    }

    #[tokio::test]
    async fn test_growing_file_gives_up() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("growing.mkv");
        std::fs::write(&path, b"start").unwrap();

        let writer_path = path.clone();
        let writer = tokio::spawn(async move {
            for _ in 0..40 {
                let mut f = std::fs::OpenOptions::new()
                    .append(true)
                    .open(&writer_path)
                    .unwrap();
                f.write_all(&[1u8; 512]).unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        let outcome = wait_until_stable(&path, Duration::from_millis(20), 2)
            .await
            .unwrap();
        writer.abort();
        assert!(matches!(
            outcome,
            StabilityOutcome::StillChanging { checks: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_removed_file_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gone.mkv");
        assert!(wait_until_stable(&path, Duration::from_millis(1), 1)
            .await
            .is_err());
    }
}
