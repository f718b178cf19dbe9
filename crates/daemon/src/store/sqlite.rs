//! SQLite-backed job store.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, ToSql};
use tracing::info;

use super::{JobStore, StoreError};
use crate::jobs::{EncodingJob, JobStatus, JobUpdate};
use crate::media::{CodecPolicy, MediaCategory, MediaRecord, MediaUpsert, NewMedia};
use crate::schedule::{ScheduleRule, ScheduleRuleInput};

const MEDIA_COLUMNS: &str = "id, path, title, episode, directory, size_bytes, codec, category, \
     duration_secs, needs_transcode, previously_transcoded, updated_at";

const JOB_SELECT: &str = "SELECT j.id, j.media_id, j.status, j.priority, j.scratch_path, \
     j.original_size, j.new_size, j.reduction_percent, j.created_at, j.started_at, \
     j.completed_at, j.error, j.retry_count, m.path, m.title \
     FROM encoding_jobs j LEFT JOIN media m ON m.id = j.media_id";

const RULE_COLUMNS: &str = "id, weekdays, start_time, end_time, concurrency_limit, active";

/// SQLite-backed store. One connection, serialized behind a mutex.
pub struct SqliteJobStore {
    conn: Mutex<Connection>,
    policy: CodecPolicy,
}

impl SqliteJobStore {
    /// Open (or create) the database at `path` and make sure the tables exist.
    pub fn new(path: &Path, policy: CodecPolicy) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn, policy)
    }

    /// In-memory store for tests.
    pub fn in_memory(policy: CodecPolicy) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, policy)
    }

    fn from_connection(conn: Connection, policy: CodecPolicy) -> Result<Self, StoreError> {
        Self::initialize_schema(&conn)?;
        let updated = Self::reapply_policy(&conn, &policy)?;
        if updated > 0 {
            info!(updated, "Recomputed needs_transcode for the accepted codec set");
        }
        Ok(Self {
            conn: Mutex::new(conn),
            policy,
        })
    }

    pub fn policy(&self) -> &CodecPolicy {
        &self.policy
    }

    /// Rewrite `needs_transcode` on rows whose stored flag disagrees with `policy`.
    ///
    /// Returns the number of rows changed.
    fn reapply_policy(conn: &Connection, policy: &CodecPolicy) -> Result<usize, StoreError> {
        let stale: Vec<(i64, bool)> = {
            let mut stmt = conn.prepare("SELECT id, codec, needs_transcode FROM media")?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, bool>(2)?,
                ))
            })?;
            let mut stale = Vec::new();
            for row in rows {
                let (id, codec, stored) = row?;
                let wanted = policy.needs_transcode(&codec);
                if wanted != stored {
                    stale.push((id, wanted));
                }
            }
            stale
        };

        for (id, wanted) in &stale {
            conn.execute(
                "UPDATE media SET needs_transcode = ? WHERE id = ?",
                params![wanted, id],
            )?;
        }
        Ok(stale.len())
    }

    fn initialize_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS media (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                path TEXT NOT NULL UNIQUE,
                title TEXT NOT NULL,
                episode TEXT,
                directory TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                codec TEXT NOT NULL,
                category TEXT NOT NULL,
                duration_secs REAL,
                needs_transcode INTEGER NOT NULL,
                previously_transcoded INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_media_needs ON media(needs_transcode, size_bytes DESC);

            CREATE TABLE IF NOT EXISTS encoding_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                media_id INTEGER NOT NULL,
                status TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                scratch_path TEXT,
                original_size INTEGER NOT NULL,
                new_size INTEGER,
                reduction_percent REAL,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                error TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_status ON encoding_jobs(status, priority DESC);
            CREATE INDEX IF NOT EXISTS idx_jobs_media ON encoding_jobs(media_id);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_one_open_per_media
                ON encoding_jobs(media_id)
                WHERE status IN ('queued', 'processing', 'replacing_file');

            CREATE TABLE IF NOT EXISTS schedule_rules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                weekdays TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT NOT NULL,
                concurrency_limit INTEGER NOT NULL,
                active INTEGER NOT NULL DEFAULT 1
            );
            "#,
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn row_to_media(row: &rusqlite::Row) -> rusqlite::Result<MediaRecord> {
        let path: String = row.get(1)?;
        let directory: String = row.get(4)?;
        let size: i64 = row.get(5)?;
        let category: String = row.get(7)?;
        let updated_at: String = row.get(11)?;

        Ok(MediaRecord {
            id: row.get(0)?,
            path: PathBuf::from(path),
            title: row.get(2)?,
            episode: row.get(3)?,
            directory: PathBuf::from(directory),
            size_bytes: size.max(0) as u64,
            codec: row.get(6)?,
            category: MediaCategory::from_str_lossy(&category),
            duration_secs: row.get(8)?,
            needs_transcode: row.get(9)?,
            previously_transcoded: row.get(10)?,
            updated_at: parse_timestamp(11, &updated_at)?,
        })
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<EncodingJob> {
        let status: String = row.get(2)?;
        let status = JobStatus::parse(&status)
            .ok_or_else(|| conversion_error(2, format!("unknown job status '{}'", status)))?;
        let scratch_path: Option<String> = row.get(4)?;
        let original_size: i64 = row.get(5)?;
        let new_size: Option<i64> = row.get(6)?;
        let created_at: String = row.get(8)?;
        let started_at: Option<String> = row.get(9)?;
        let completed_at: Option<String> = row.get(10)?;
        let retry_count: i64 = row.get(12)?;
        let file_path: Option<String> = row.get(13)?;
        let title: Option<String> = row.get(14)?;

        Ok(EncodingJob {
            id: row.get(0)?,
            media_id: row.get(1)?,
            status,
            priority: row.get(3)?,
            scratch_path: scratch_path.map(PathBuf::from),
            original_size: original_size.max(0) as u64,
            new_size: new_size.map(|n| n.max(0) as u64),
            reduction_percent: row.get(7)?,
            created_at: parse_timestamp(8, &created_at)?,
            started_at: started_at
                .map(|s| parse_timestamp(9, &s))
                .transpose()?,
            completed_at: completed_at
                .map(|s| parse_timestamp(10, &s))
                .transpose()?,
            error: row.get(11)?,
            retry_count: retry_count.max(0) as u32,
            file_path: file_path.map(PathBuf::from).unwrap_or_default(),
            title: title.unwrap_or_default(),
        })
    }

    fn row_to_rule(row: &rusqlite::Row) -> rusqlite::Result<ScheduleRule> {
        let weekdays_json: String = row.get(1)?;
        let weekdays: Vec<u8> = serde_json::from_str(&weekdays_json)
            .map_err(|e| conversion_error(1, format!("invalid weekdays: {}", e)))?;
        let limit: i64 = row.get(4)?;

        Ok(ScheduleRule {
            id: row.get(0)?,
            weekdays,
            start: row.get(2)?,
            end: row.get(3)?,
            concurrency_limit: limit.max(0) as u32,
            active: row.get(5)?,
        })
    }

    fn query_jobs(
        conn: &Connection,
        sql: &str,
        values: &[&dyn ToSql],
    ) -> Result<Vec<EncodingJob>, StoreError> {
        let mut stmt = conn.prepare(sql)?;
        let jobs = stmt
            .query_map(values, Self::row_to_job)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    fn load_rule(conn: &Connection, id: i64) -> Result<Option<ScheduleRule>, StoreError> {
        let rule = conn
            .query_row(
                &format!("SELECT {} FROM schedule_rules WHERE id = ?", RULE_COLUMNS),
                params![id],
                Self::row_to_rule,
            )
            .optional()?;
        Ok(rule)
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    // Fixed-width so lexical order matches chronological order.
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, format!("invalid timestamp '{}': {}", s, e)))
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(StoreError::Database(message)))
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Escape LIKE wildcards so user text matches literally.
fn like_pattern(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len() + 2);
    escaped.push('%');
    for c in text.to_lowercase().chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

fn weekdays_json(rule: &ScheduleRuleInput) -> Result<String, StoreError> {
    serde_json::to_string(&rule.weekdays).map_err(|e| StoreError::Database(e.to_string()))
}

impl JobStore for SqliteJobStore {
    fn upsert_media(&self, media: NewMedia) -> Result<MediaUpsert, StoreError> {
        let conn = self.lock()?;
        let path = path_text(&media.path);
        let needs_transcode = self.policy.needs_transcode(&media.codec);
        let now = timestamp(Utc::now());

        let existing: Option<i64> = conn
            .query_row("SELECT id FROM media WHERE path = ?", params![path], |row| {
                row.get(0)
            })
            .optional()?;

        match existing {
            Some(id) => {
                conn.execute(
                    "UPDATE media SET title = ?, episode = ?, directory = ?, size_bytes = ?, \
                     codec = ?, category = ?, duration_secs = ?, needs_transcode = ?, \
                     updated_at = ? WHERE id = ?",
                    params![
                        media.title,
                        media.episode,
                        path_text(&media.directory),
                        media.size_bytes as i64,
                        media.codec,
                        media.category.as_str(),
                        media.duration_secs,
                        needs_transcode,
                        now,
                        id,
                    ],
                )?;
                Ok(MediaUpsert { id, created: false })
            }
            None => {
                conn.execute(
                    "INSERT INTO media (path, title, episode, directory, size_bytes, codec, \
                     category, duration_secs, needs_transcode, previously_transcoded, updated_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?)",
                    params![
                        path,
                        media.title,
                        media.episode,
                        path_text(&media.directory),
                        media.size_bytes as i64,
                        media.codec,
                        media.category.as_str(),
                        media.duration_secs,
                        needs_transcode,
                        now,
                    ],
                )?;
                Ok(MediaUpsert {
                    id: conn.last_insert_rowid(),
                    created: true,
                })
            }
        }
    }

    fn get_media(&self, id: i64) -> Result<Option<MediaRecord>, StoreError> {
        let conn = self.lock()?;
        let media = conn
            .query_row(
                &format!("SELECT {} FROM media WHERE id = ?", MEDIA_COLUMNS),
                params![id],
                Self::row_to_media,
            )
            .optional()?;
        Ok(media)
    }

    fn find_media_by_path(&self, path: &Path) -> Result<Option<MediaRecord>, StoreError> {
        let conn = self.lock()?;
        let media = conn
            .query_row(
                &format!("SELECT {} FROM media WHERE path = ?", MEDIA_COLUMNS),
                params![path_text(path)],
                Self::row_to_media,
            )
            .optional()?;
        Ok(media)
    }

    fn find_media_needing_transcode(
        &self,
        limit: usize,
        exclude_statuses: &[JobStatus],
    ) -> Result<Vec<MediaRecord>, StoreError> {
        let conn = self.lock()?;

        let mut values: Vec<Box<dyn ToSql>> = Vec::new();
        let exclusion = if exclude_statuses.is_empty() {
            String::new()
        } else {
            let placeholders = vec!["?"; exclude_statuses.len()].join(", ");
            for status in exclude_statuses {
                values.push(Box::new(status.as_str()));
            }
            format!(
                "AND COALESCE((SELECT j.status FROM encoding_jobs j WHERE j.media_id = media.id \
                 ORDER BY j.id DESC LIMIT 1), '') NOT IN ({})",
                placeholders
            )
        };
        values.push(Box::new(limit as i64));

        let sql = format!(
            "SELECT {} FROM media WHERE needs_transcode = 1 {} \
             ORDER BY size_bytes DESC, id ASC LIMIT ?",
            MEDIA_COLUMNS, exclusion
        );
        let mut stmt = conn.prepare(&sql)?;
        let media = stmt
            .query_map(params_from_iter(values.iter()), Self::row_to_media)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(media)
    }

    fn mark_media_transcoded(
        &self,
        media_id: i64,
        new_codec: &str,
        new_size: u64,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE media SET codec = ?, size_bytes = ?, needs_transcode = ?, \
             previously_transcoded = 1, updated_at = ? WHERE id = ?",
            params![
                new_codec,
                new_size as i64,
                self.policy.needs_transcode(new_codec),
                timestamp(Utc::now()),
                media_id,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("media {}", media_id)));
        }
        Ok(())
    }

    fn create_job(
        &self,
        media_id: i64,
        priority: i64,
        original_size: u64,
    ) -> Result<i64, StoreError> {
        let conn = self.lock()?;

        let open: Option<i64> = conn
            .query_row(
                "SELECT id FROM encoding_jobs WHERE media_id = ? \
                 AND status IN ('queued', 'processing', 'replacing_file') LIMIT 1",
                params![media_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(job_id) = open {
            return Err(StoreError::OpenJobExists { media_id, job_id });
        }

        conn.execute(
            "INSERT INTO encoding_jobs (media_id, status, priority, original_size, created_at, \
             retry_count) VALUES (?, ?, ?, ?, ?, 0)",
            params![
                media_id,
                JobStatus::Queued.as_str(),
                priority,
                original_size as i64,
                timestamp(Utc::now()),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn update_job(&self, id: i64, status: JobStatus, update: JobUpdate) -> Result<(), StoreError> {
        let conn = self.lock()?;

        let current: Option<String> = conn
            .query_row(
                "SELECT status FROM encoding_jobs WHERE id = ?",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        let current = current.ok_or_else(|| StoreError::NotFound(format!("job {}", id)))?;
        let current = JobStatus::parse(&current)
            .ok_or_else(|| StoreError::Database(format!("unknown job status '{}'", current)))?;

        if let Some(expected) = update.expect_status {
            if current != expected {
                return Err(StoreError::Conflict {
                    id,
                    expected,
                    actual: current,
                });
            }
        }

        let mut sets = vec!["status = ?"];
        let mut values: Vec<Box<dyn ToSql>> = vec![Box::new(status.as_str())];

        if let Some(path) = update.scratch_path {
            sets.push("scratch_path = ?");
            values.push(Box::new(path_text(&path)));
        }
        if let Some(at) = update.started_at {
            sets.push("started_at = ?");
            values.push(Box::new(timestamp(at)));
        }
        if let Some(at) = update.completed_at {
            sets.push("completed_at = ?");
            values.push(Box::new(timestamp(at)));
        }
        if let Some(size) = update.new_size {
            sets.push("new_size = ?");
            values.push(Box::new(size as i64));
        }
        if let Some(percent) = update.reduction_percent {
            sets.push("reduction_percent = ?");
            values.push(Box::new(percent));
        }
        if let Some(error) = update.error {
            sets.push("error = ?");
            values.push(Box::new(error));
        } else if update.clear_error {
            sets.push("error = NULL");
        }
        if let Some(count) = update.retry_count {
            sets.push("retry_count = ?");
            values.push(Box::new(count as i64));
        }

        // Status re-checked in the WHERE clause so the update stays a compare-and-set.
        values.push(Box::new(id));
        values.push(Box::new(current.as_str()));
        let sql = format!(
            "UPDATE encoding_jobs SET {} WHERE id = ? AND status = ?",
            sets.join(", ")
        );
        conn.execute(&sql, params_from_iter(values.iter()))?;
        Ok(())
    }

    fn get_job(&self, id: i64) -> Result<Option<EncodingJob>, StoreError> {
        let conn = self.lock()?;
        let job = conn
            .query_row(
                &format!("{} WHERE j.id = ?", JOB_SELECT),
                params![id],
                Self::row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    fn latest_job_for_media(&self, media_id: i64) -> Result<Option<EncodingJob>, StoreError> {
        let conn = self.lock()?;
        let job = conn
            .query_row(
                &format!("{} WHERE j.media_id = ? ORDER BY j.id DESC LIMIT 1", JOB_SELECT),
                params![media_id],
                Self::row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    fn list_jobs_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<EncodingJob>, StoreError> {
        let conn = self.lock()?;
        let order = match status {
            JobStatus::Completed => "j.completed_at DESC, j.id DESC",
            _ => "j.priority DESC, j.id ASC",
        };
        let sql = format!("{} WHERE j.status = ? ORDER BY {} LIMIT ?", JOB_SELECT, order);
        Self::query_jobs(&conn, &sql, &[&status.as_str(), &(limit as i64)])
    }

    fn search_jobs(&self, text: &str, limit: usize) -> Result<Vec<EncodingJob>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "{} WHERE lower(m.title) LIKE ?1 ESCAPE '\\' OR lower(m.path) LIKE ?1 ESCAPE '\\' \
             ORDER BY j.id DESC LIMIT ?2",
            JOB_SELECT
        );
        Self::query_jobs(&conn, &sql, &[&like_pattern(text.trim()), &(limit as i64)])
    }

    fn list_schedule_rules(&self) -> Result<Vec<ScheduleRule>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM schedule_rules ORDER BY id ASC",
            RULE_COLUMNS
        ))?;
        let rules = stmt
            .query_map([], Self::row_to_rule)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rules)
    }

    fn get_schedule_rule(&self, id: i64) -> Result<Option<ScheduleRule>, StoreError> {
        let conn = self.lock()?;
        Self::load_rule(&conn, id)
    }

    fn create_schedule_rule(&self, rule: &ScheduleRuleInput) -> Result<ScheduleRule, StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO schedule_rules (weekdays, start_time, end_time, concurrency_limit, active) \
             VALUES (?, ?, ?, ?, ?)",
            params![
                weekdays_json(rule)?,
                rule.start,
                rule.end,
                rule.concurrency_limit as i64,
                rule.active,
            ],
        )?;
        let id = conn.last_insert_rowid();
        Self::load_rule(&conn, id)?
            .ok_or_else(|| StoreError::NotFound(format!("schedule rule {}", id)))
    }

    fn update_schedule_rule(
        &self,
        id: i64,
        rule: &ScheduleRuleInput,
    ) -> Result<ScheduleRule, StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE schedule_rules SET weekdays = ?, start_time = ?, end_time = ?, \
             concurrency_limit = ?, active = ? WHERE id = ?",
            params![
                weekdays_json(rule)?,
                rule.start,
                rule.end,
                rule.concurrency_limit as i64,
                rule.active,
                id,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("schedule rule {}", id)));
        }
        Self::load_rule(&conn, id)?
            .ok_or_else(|| StoreError::NotFound(format!("schedule rule {}", id)))
    }

    fn delete_schedule_rule(&self, id: i64) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute("DELETE FROM schedule_rules WHERE id = ?", params![id])?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("schedule rule {}", id)));
        }
        Ok(())
    }
}
