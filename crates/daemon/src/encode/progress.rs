//! Parsing of ffmpeg progress output.
//!
//! With `-progress pipe:2` ffmpeg writes `key=value` blocks to stderr
//! (`out_time_us=…`, `out_time=HH:MM:SS.micro`, `progress=continue`). Older
//! builds and plain stats lines carry `time=HH:MM:SS.xx` instead. Both are accepted.

use regex_lite::Regex;
use std::collections::VecDeque;
use std::sync::OnceLock;

/// One progress sample for a running encode.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncodeProgress {
    /// Seconds of output written so far.
    pub elapsed_secs: f64,
    /// Percent complete (0.0 - 100.0), when the source duration is known.
    pub percent: Option<f64>,
}

fn clock_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:^|\s)(?:out_)?time=(\d+):(\d{2}):(\d{2}(?:\.\d+)?)")
            .expect("time pattern is valid")
    })
}

fn micros_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // out_time_ms is reported in microseconds despite its name.
    RE.get_or_init(|| Regex::new(r"^out_time_(?:us|ms)=(\d+)$").expect("micros pattern is valid"))
}

fn kv_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9_]+=\S*$").expect("key/value pattern is valid"))
}

/// Extract the elapsed output time in seconds from one line of ffmpeg stderr.
pub fn parse_progress_time(line: &str) -> Option<f64> {
    let line = line.trim();

    if let Some(caps) = micros_regex().captures(line) {
        let micros: f64 = caps.get(1)?.as_str().parse().ok()?;
        return Some(micros / 1_000_000.0);
    }

    let caps = clock_regex().captures(line)?;
    let hours: f64 = caps.get(1)?.as_str().parse().ok()?;
    let minutes: f64 = caps.get(2)?.as_str().parse().ok()?;
    let seconds: f64 = caps.get(3)?.as_str().parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Whether a line belongs to a `-progress` block rather than to ffmpeg's log.
pub fn is_progress_line(line: &str) -> bool {
    kv_regex().is_match(line.trim())
}

/// Turns progress lines into samples, dropping repeats.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    duration_secs: Option<f64>,
    last_elapsed: Option<f64>,
}

impl ProgressTracker {
    pub fn new(duration_secs: Option<f64>) -> Self {
        Self {
            duration_secs: duration_secs.filter(|d| *d > 0.0),
            last_elapsed: None,
        }
    }

    /// Feed one stderr line; returns a sample when the elapsed time moved forward.
    pub fn observe(&mut self, line: &str) -> Option<EncodeProgress> {
        let elapsed = parse_progress_time(line)?;
        if self.last_elapsed.map_or(false, |last| elapsed <= last) {
            return None;
        }
        self.last_elapsed = Some(elapsed);
        Some(EncodeProgress {
            elapsed_secs: elapsed,
            percent: self
                .duration_secs
                .map(|d| (elapsed / d * 100.0).clamp(0.0, 100.0)),
        })
    }
}

/// Keeps the last few log lines of a process for error reports.
#[derive(Debug, Clone)]
pub struct StderrTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl StderrTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.to_string());
    }

    pub fn text(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parses_progress_block_keys() {
        assert_eq!(parse_progress_time("out_time_us=62500000"), Some(62.5));
        assert_eq!(parse_progress_time("out_time_ms=1000000"), Some(1.0));
        assert_eq!(parse_progress_time("out_time=00:01:02.500000"), Some(62.5));
        assert_eq!(parse_progress_time("out_time=N/A"), None);
        assert_eq!(parse_progress_time("progress=continue"), None);
    }

    #[test]
    fn test_parses_stats_line() {
        let line = "frame= 1200 fps= 48 q=28.0 size=   10240kB time=01:00:05.25 bitrate=1000.0kbits/s speed=1.9x";
        assert_eq!(parse_progress_time(line), Some(3605.25));
    }

    #[test]
    fn test_progress_line_detection() {
        assert!(is_progress_line("bitrate=1000.0kbits/s"));
        assert!(is_progress_line("progress=end"));
        assert!(!is_progress_line("Error while decoding stream #0:0: Invalid data"));
        assert!(!is_progress_line("[hevc @ 0x5581] something"));
    }

    #[test]
    fn test_tracker_percent_and_repeats() {
        let mut tracker = ProgressTracker::new(Some(200.0));
        let p = tracker.observe("out_time_us=50000000").unwrap();
        assert_eq!(p.elapsed_secs, 50.0);
        assert_eq!(p.percent, Some(25.0));

        assert!(tracker.observe("out_time=00:00:50.000000").is_none());
        assert!(tracker.observe("speed=2x").is_none());

        let p = tracker.observe("out_time_us=400000000").unwrap();
        assert_eq!(p.percent, Some(100.0));
    }

    #[test]
    fn test_tracker_without_duration() {
        let mut tracker = ProgressTracker::new(None);
        let p = tracker.observe("out_time_us=1000000").unwrap();
        assert_eq!(p.percent, None);
    }

    #[test]
    fn test_stderr_tail_keeps_last_lines() {
        let mut tail = StderrTail::new(2);
        tail.push("one");
        tail.push("");
        tail.push("two");
        tail.push("three");
        assert_eq!(tail.text(), "two\nthree");
    }

    proptest! {
        #[test]
        fn prop_clock_and_micros_agree(h in 0u64..100, m in 0u64..60, s in 0u64..60, frac in 0u64..1_000_000) {
            let clock = format!("out_time={:02}:{:02}:{:02}.{:06}", h, m, s, frac);
            let micros = ((h * 3600 + m * 60 + s) * 1_000_000) + frac;
            let from_clock = parse_progress_time(&clock).unwrap();
            let from_micros = parse_progress_time(&format!("out_time_us={}", micros)).unwrap();
            prop_assert!((from_clock - from_micros).abs() < 1e-3);
        }
    }
}
