//! # Job Execution
//!
//! Three cooperating services:
//!
//! - [`ThreadService`] - bounded pool of named coarse-grained work units
//!   with advisory priorities and join/terminate.
//! - [`Scheduler`] - interval (`30s|5m|1h|1d|1w`) and cron triggers firing
//!   callbacks on scheduler-owned tasks.
//! - [`JobQueue`] - durable job queue persisted to an embedded SQLite store
//!   with atomic claim, retry/backoff, and cancellation of pending jobs.
//!
//! Shared here: duration parsing/formatting and the reconnect-style
//! geometric backoff helper.

mod queue;
mod scheduler;
mod threads;

pub use queue::{DispatchOptions, JobHandler, JobQueue, JobRecord, JobStats, JobStatus};
pub use scheduler::{ScheduleCallback, ScheduleSnapshot, Scheduler, Trigger};
pub use threads::{ThreadBody, ThreadInfo, ThreadOptions, ThreadService, ThreadStatus};

use std::time::Duration;
use thiserror::Error;

/// Job subsystem failure.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("invalid duration '{0}'")]
    InvalidDuration(String),

    #[error("invalid cron expression '{0}': {1}")]
    InvalidCron(String, String),

    #[error("unknown job handler '{0}'")]
    UnknownHandler(String),

    #[error("unknown thread '{0}'")]
    UnknownThread(String),

    #[error("thread '{0}' timed out")]
    JoinTimeout(String),

    #[error("job store error: {0}")]
    Store(String),
}

impl From<rusqlite::Error> for JobError {
    fn from(e: rusqlite::Error) -> Self {
        JobError::Store(e.to_string())
    }
}

const UNITS: &[(&str, u64)] = &[("w", 604_800), ("d", 86_400), ("h", 3_600), ("m", 60), ("s", 1)];

/// Parse a duration string into seconds.
///
/// Accepts single terms (`30s`, `5m`, `1h`, `1d`, `1w`, bare `30` meaning
/// seconds, case-insensitive, surrounding whitespace ignored) and
/// space-separated multi-unit strings (`1h 30m`).
pub fn parse_duration(text: &str) -> Result<u64, JobError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(JobError::InvalidDuration(text.to_string()));
    }

    let mut total = 0u64;
    for term in trimmed.split_whitespace() {
        total += parse_duration_term(term)
            .ok_or_else(|| JobError::InvalidDuration(text.to_string()))?;
    }
    Ok(total)
}

fn parse_duration_term(term: &str) -> Option<u64> {
    let lower = term.to_ascii_lowercase();
    let (digits, suffix) = match lower.find(|c: char| !c.is_ascii_digit()) {
        Some(split) => lower.split_at(split),
        None => (lower.as_str(), ""),
    };
    if digits.is_empty() {
        return None;
    }
    let count: u64 = digits.parse().ok()?;
    let factor = match suffix {
        "" => 1,
        unit => UNITS.iter().find(|(name, _)| *name == unit)?.1,
    };
    Some(count * factor)
}

/// Format seconds as up to two units, largest first (`"1h 30m"`, `"30s"`).
pub fn format_duration(seconds: u64) -> String {
    if seconds == 0 {
        return "0s".to_string();
    }

    let mut remaining = seconds;
    let mut parts = Vec::new();
    for (name, factor) in UNITS {
        if remaining >= *factor {
            let count = remaining / factor;
            remaining %= factor;
            parts.push(format!("{}{}", count, name));
            if parts.len() == 2 {
                break;
            }
        }
    }
    parts.join(" ")
}

/// Parse a duration into a [`std::time::Duration`].
pub fn parse_std_duration(text: &str) -> Result<Duration, JobError> {
    parse_duration(text).map(Duration::from_secs)
}

/// Reconnect-style retry backoff: grows ×1.5 per attempt, capped at 30 s.
pub fn reconnect_backoff(attempt: u32) -> Duration {
    let base = 1.0f64;
    let factor = 1.5f64.powi(attempt.saturating_sub(1) as i32);
    Duration::from_secs_f64((base * factor).min(30.0))
}
