//! Weekday/time window rules and their evaluation.
//!
//! A rule is active when the current weekday is in its set and the current
//! `HH:MM` lies within `[start, end]`. A window with `start > end` wraps past
//! midnight; the weekday test always applies to the current day.

mod scheduler;

pub use scheduler::{Clock, WindowScheduler};

use crate::store::StoreError;
use chrono::{Datelike, Duration, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned by schedule operations.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid schedule rule: {0}")]
    Invalid(String),

    #[error("schedule rule {0} not found")]
    NotFound(i64),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A stored window rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleRule {
    pub id: i64,
    /// Days the window applies to, 0 = Sunday through 6 = Saturday.
    pub weekdays: Vec<u8>,
    /// Window start, `HH:MM`.
    pub start: String,
    /// Window end, `HH:MM`, inclusive.
    pub end: String,
    pub concurrency_limit: u32,
    /// Disabled rules are never evaluated.
    pub active: bool,
}

/// Client-supplied rule fields for create and update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleRuleInput {
    pub weekdays: Vec<u8>,
    pub start: String,
    pub end: String,
    pub concurrency_limit: u32,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl ScheduleRuleInput {
    /// Check weekdays, time format and limit.
    pub fn validate(&self) -> Result<(), ScheduleError> {
        if self.weekdays.is_empty() {
            return Err(ScheduleError::Invalid("weekdays must not be empty".into()));
        }
        if let Some(day) = self.weekdays.iter().find(|d| **d > 6) {
            return Err(ScheduleError::Invalid(format!(
                "weekday {} out of range 0-6",
                day
            )));
        }
        if parse_hhmm(&self.start).is_none() {
            return Err(ScheduleError::Invalid(format!(
                "start '{}' is not HH:MM",
                self.start
            )));
        }
        if parse_hhmm(&self.end).is_none() {
            return Err(ScheduleError::Invalid(format!(
                "end '{}' is not HH:MM",
                self.end
            )));
        }
        if self.concurrency_limit < 1 {
            return Err(ScheduleError::Invalid(
                "concurrency_limit must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Parse a zero-padded 24-hour `HH:MM`.
pub fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    let bytes = s.as_bytes();
    if bytes.len() != 5 || bytes[2] != b':' {
        return None;
    }
    if !bytes[..2].iter().chain(&bytes[3..]).all(u8::is_ascii_digit) {
        return None;
    }
    let hours: u32 = s[..2].parse().ok()?;
    let minutes: u32 = s[3..].parse().ok()?;
    NaiveTime::from_hms_opt(hours, minutes, 0)
}

fn format_hhmm(at: NaiveDateTime) -> String {
    format!("{:02}:{:02}", at.hour(), at.minute())
}

/// Weekday number with 0 = Sunday.
pub fn weekday_number(at: NaiveDateTime) -> u8 {
    at.weekday().num_days_from_sunday() as u8
}

impl ScheduleRule {
    /// Whether the window is open at `now`.
    pub fn is_active_at(&self, now: NaiveDateTime) -> bool {
        if !self.weekdays.contains(&weekday_number(now)) {
            return false;
        }
        let current = format_hhmm(now);
        let (start, end) = (self.start.as_str(), self.end.as_str());
        if start <= end {
            start <= current.as_str() && current.as_str() <= end
        } else {
            current.as_str() >= start || current.as_str() <= end
        }
    }

    pub fn wraps_midnight(&self) -> bool {
        self.start > self.end
    }

    /// The first instant strictly after `after` at which the rule's activity may change.
    ///
    /// Boundaries are the window start and the minute after the window end on each
    /// listed weekday, plus midnight for windows that wrap past it.
    pub fn next_boundary(&self, after: NaiveDateTime) -> Option<NaiveDateTime> {
        let start = parse_hhmm(&self.start)?;
        let end = parse_hhmm(&self.end)?;
        let today = after.date();

        let mut best: Option<NaiveDateTime> = None;
        // Eight days covers a full weekly cycle from any starting point.
        for offset in 0..=8 {
            let date = today + Duration::days(offset);
            let day = date.weekday().num_days_from_sunday() as u8;

            let mut candidates = Vec::with_capacity(3);
            if self.weekdays.contains(&day) {
                candidates.push(date.and_time(start));
                candidates.push(date.and_time(end) + Duration::minutes(1));
            }
            if self.wraps_midnight() {
                candidates.push(date.and_time(NaiveTime::MIN));
            }

            for candidate in candidates {
                if candidate > after && best.map_or(true, |b| candidate < b) {
                    best = Some(candidate);
                }
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use proptest::prelude::*;

    fn rule(weekdays: Vec<u8>, start: &str, end: &str) -> ScheduleRule {
        ScheduleRule {
            id: 1,
            weekdays,
            start: start.to_string(),
            end: end.to_string(),
            concurrency_limit: 2,
            active: true,
        }
    }

    fn input(weekdays: Vec<u8>, start: &str, end: &str, limit: u32) -> ScheduleRuleInput {
        ScheduleRuleInput {
            weekdays,
            start: start.to_string(),
            end: end.to_string(),
            concurrency_limit: limit,
            active: true,
        }
    }

    // 2026-10-19 is a Monday.
    fn at(day: u32, hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, day)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    #[test]
    fn test_weekday_numbering_starts_on_sunday() {
        assert_eq!(weekday_number(at(18, 12, 0)), 0);
        assert_eq!(weekday_number(at(19, 12, 0)), 1);
        assert_eq!(weekday_number(at(24, 12, 0)), 6);
    }

    #[test]
    fn test_window_boundaries_are_inclusive() {
        let r = rule(vec![1], "09:00", "17:00");
        assert!(!r.is_active_at(at(19, 8, 59)));
        assert!(r.is_active_at(at(19, 9, 0)));
        assert!(r.is_active_at(at(19, 17, 0)));
        assert!(r.is_active_at(at(19, 17, 0) + Duration::seconds(59)));
        assert!(!r.is_active_at(at(19, 17, 1)));
        // Tuesday not listed.
        assert!(!r.is_active_at(at(20, 12, 0)));
    }

    #[test]
    fn test_overnight_window_wraps_midnight() {
        let r = rule(vec![1, 2], "22:00", "06:00");
        assert!(r.is_active_at(at(19, 23, 30)));
        assert!(r.is_active_at(at(20, 3, 0)));
        assert!(!r.is_active_at(at(20, 12, 0)));
        // Weekday test uses the current day: Sunday early morning is excluded.
        assert!(!r.is_active_at(at(18, 3, 0)));
    }

    #[test]
    fn test_validation() {
        assert!(input(vec![1, 2], "00:00", "23:59", 1).validate().is_ok());
        assert!(matches!(
            input(vec![], "00:00", "01:00", 1).validate(),
            Err(ScheduleError::Invalid(_))
        ));
        assert!(input(vec![7], "00:00", "01:00", 1).validate().is_err());
        assert!(input(vec![1], "24:00", "01:00", 1).validate().is_err());
        assert!(input(vec![1], "9:00", "10:00", 1).validate().is_err());
        assert!(input(vec![1], "09:60", "10:00", 1).validate().is_err());
        assert!(input(vec![1], "09:00", "10:00", 0).validate().is_err());
        assert!(input(vec![1], "+9:00", "10:00", 1).validate().is_err());
    }

    #[test]
    fn test_input_active_defaults_to_true() {
        let parsed: ScheduleRuleInput = serde_json::from_str(
            r#"{"weekdays":[1],"start":"01:00","end":"02:00","concurrency_limit":3}"#,
        )
        .unwrap();
        assert!(parsed.active);
    }

    #[test]
    fn test_next_boundary_same_day() {
        let r = rule(vec![1], "09:00", "17:00");
        assert_eq!(r.next_boundary(at(19, 8, 0)), Some(at(19, 9, 0)));
        assert_eq!(r.next_boundary(at(19, 9, 0)), Some(at(19, 17, 1)));
        // Next Monday.
        assert_eq!(r.next_boundary(at(19, 17, 1)), Some(at(26, 9, 0)));
    }

    #[test]
    fn test_next_boundary_end_of_day_rolls_over() {
        let r = rule(vec![6], "20:00", "23:59");
        assert_eq!(r.next_boundary(at(24, 21, 0)), Some(at(25, 0, 0)));
    }

    #[test]
    fn test_next_boundary_overnight_includes_midnight() {
        let r = rule(vec![1], "22:00", "06:00");
        // Sunday evening: Monday midnight opens the early-morning part.
        assert_eq!(r.next_boundary(at(18, 20, 0)), Some(at(19, 0, 0)));
        assert_eq!(r.next_boundary(at(19, 0, 0)), Some(at(19, 6, 1)));
        assert_eq!(r.next_boundary(at(19, 6, 1)), Some(at(19, 22, 0)));
    }

    proptest! {
        // Activity never changes strictly between `now` and the next boundary.
        #[test]
        fn prop_activity_constant_until_next_boundary(
            days in proptest::collection::btree_set(0u8..7, 1..7),
            start_min in 0u32..1440,
            end_min in 0u32..1440,
            now_min in 0u32..(7 * 1440),
            probe in 0u32..600,
        ) {
            let hhmm = |m: u32| format!("{:02}:{:02}", m / 60, m % 60);
            let r = rule(days.into_iter().collect(), &hhmm(start_min), &hhmm(end_min));
            let now = at(18, 0, 0) + Duration::minutes(now_min as i64);

            let next = r.next_boundary(now).expect("rule with weekdays has a boundary");
            prop_assert!(next > now);
            prop_assert!(next - now <= Duration::days(8));

            let sample = now + Duration::minutes(probe as i64);
            if sample < next {
                prop_assert_eq!(r.is_active_at(now), r.is_active_at(sample));
            }
        }
    }
}
