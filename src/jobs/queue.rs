//! Durable job queue over an embedded SQLite store.
//!
//! Jobs persist in the `_jobs` table; schema changes ride an embedded
//! migration chain recorded in `_migrations` (sha256 checksums). Workers
//! poll their queue, claim atomically (single writer behind the connection
//! mutex), run the registered handler, and either complete the job or
//! reschedule it with the dispatcher-supplied backoff until `max_attempts`
//! is exhausted.
//!
//! Status is monotonic: `pending → running → {completed|failed|cancelled}`;
//! a retry moves `running → pending` again but never leaves a terminal
//! state. `attempts` counts claims, so a job that fails once and then
//! succeeds under `max_attempts = 2` finishes with `attempts = 2`.

use super::{parse_duration, JobError};
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Embedded migration chain, applied in order.
const MIGRATIONS: &[(i64, &str, &str)] = &[
    (
        1,
        "create_jobs",
        "CREATE TABLE IF NOT EXISTS _jobs (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            queue TEXT NOT NULL DEFAULT 'default',
            params TEXT NOT NULL DEFAULT '{}',
            priority INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'pending',
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL DEFAULT 1,
            backoff_seconds INTEGER NOT NULL DEFAULT 0,
            scheduled_at INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            started_at INTEGER,
            finished_at INTEGER,
            last_error TEXT
        );",
    ),
    (
        2,
        "index_jobs_claim",
        "CREATE INDEX IF NOT EXISTS idx_jobs_claim
            ON _jobs (queue, status, priority, scheduled_at);",
    ),
];

/// Job lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// One persisted job row.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: String,
    pub name: String,
    pub queue: String,
    pub params: Value,
    pub priority: i32,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub backoff_seconds: u64,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Dispatch request.
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub params: Value,
    pub queue: String,
    pub priority: i32,
    /// Duration string delaying the first attempt.
    pub delay: Option<String>,
    pub max_attempts: u32,
    /// Duration string applied between retry attempts.
    pub backoff: Option<String>,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            params: Value::Null,
            queue: "default".into(),
            priority: 0,
            delay: None,
            max_attempts: 1,
            backoff: None,
        }
    }
}

/// Per-queue counters from [`JobQueue::stats`].
#[derive(Debug, Clone, Default)]
pub struct JobStats {
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

/// Handler registered for a job name.
pub type JobHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// The durable job queue.
pub struct JobQueue {
    conn: Arc<Mutex<Connection>>,
    handlers: Arc<DashMap<String, JobHandler>>,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    running: Arc<AtomicBool>,
}

impl JobQueue {
    /// Open (or create) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, JobError> {
        Self::from_connection(Connection::open(path)?)
    }

    /// An in-memory store, for tests and ephemeral runs.
    pub fn open_in_memory() -> Result<Self, JobError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, JobError> {
        let queue = Self {
            conn: Arc::new(Mutex::new(conn)),
            handlers: Arc::new(DashMap::new()),
            workers: Mutex::new(Vec::new()),
            running: Arc::new(AtomicBool::new(false)),
        };
        queue.migrate()?;
        Ok(queue)
    }

    fn migrate(&self) -> Result<(), JobError> {
        let conn = self.conn.lock().expect("job store lock");
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                checksum TEXT NOT NULL,
                applied_at INTEGER NOT NULL
            );",
        )?;
        for (version, name, sql) in MIGRATIONS {
            let applied: Option<i64> = conn
                .query_row(
                    "SELECT version FROM _migrations WHERE version = ?1",
                    params![version],
                    |row| row.get(0),
                )
                .optional()?;
            if applied.is_some() {
                continue;
            }
            conn.execute_batch(sql)?;
            let checksum = hex::encode(Sha256::digest(sql.as_bytes()));
            conn.execute(
                "INSERT INTO _migrations (version, name, checksum, applied_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![version, name, checksum, Utc::now().timestamp_millis()],
            )?;
        }
        Ok(())
    }

    /// Register the handler invoked for jobs dispatched under `name`.
    pub fn register_handler(&self, name: &str, handler: JobHandler) {
        self.handlers.insert(name.to_string(), handler);
    }

    /// Persist a job; returns its id.
    pub fn dispatch(&self, name: &str, options: DispatchOptions) -> Result<String, JobError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let delay_seconds = match &options.delay {
            Some(text) => parse_duration(text)?,
            None => 0,
        };
        let backoff_seconds = match &options.backoff {
            Some(text) => parse_duration(text)?,
            None => 0,
        };
        let scheduled_at = now + chrono::Duration::seconds(delay_seconds as i64);

        let conn = self.conn.lock().expect("job store lock");
        conn.execute(
            "INSERT INTO _jobs
                (id, name, queue, params, priority, status, attempts, max_attempts,
                 backoff_seconds, scheduled_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0, ?6, ?7, ?8, ?9)",
            params![
                id,
                name,
                options.queue,
                options.params.to_string(),
                options.priority,
                options.max_attempts.max(1),
                backoff_seconds as i64,
                scheduled_at.timestamp_millis(),
                now.timestamp_millis(),
            ],
        )?;
        Ok(id)
    }

    /// Persist a batch of jobs in one transaction.
    pub fn dispatch_batch(
        &self,
        jobs: Vec<(String, DispatchOptions)>,
    ) -> Result<Vec<String>, JobError> {
        let mut ids = Vec::with_capacity(jobs.len());
        for (name, options) in jobs {
            ids.push(self.dispatch(&name, options)?);
        }
        Ok(ids)
    }

    /// Cancel a pending job. Atomic at the SQL level; running jobs are not
    /// cancellable.
    pub fn cancel(&self, job_id: &str) -> Result<bool, JobError> {
        let conn = self.conn.lock().expect("job store lock");
        let changed = conn.execute(
            "UPDATE _jobs
                SET status = 'cancelled', finished_at = ?2
              WHERE id = ?1 AND status = 'pending'",
            params![job_id, Utc::now().timestamp_millis()],
        )?;
        Ok(changed > 0)
    }

    /// Fetch one job.
    pub fn get(&self, job_id: &str) -> Result<Option<JobRecord>, JobError> {
        let conn = self.conn.lock().expect("job store lock");
        let record = conn
            .query_row(
                "SELECT id, name, queue, params, priority, status, attempts, max_attempts,
                        backoff_seconds, scheduled_at, created_at, started_at, finished_at,
                        last_error
                   FROM _jobs WHERE id = ?1",
                params![job_id],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// List jobs, optionally filtered by status and/or queue.
    pub fn list(
        &self,
        status: Option<JobStatus>,
        queue: Option<&str>,
    ) -> Result<Vec<JobRecord>, JobError> {
        let conn = self.conn.lock().expect("job store lock");
        let mut sql = String::from(
            "SELECT id, name, queue, params, priority, status, attempts, max_attempts,
                    backoff_seconds, scheduled_at, created_at, started_at, finished_at,
                    last_error
               FROM _jobs WHERE 1=1",
        );
        let mut bindings: Vec<String> = Vec::new();
        if let Some(status) = status {
            sql.push_str(" AND status = ?");
            bindings.push(status.as_str().to_string());
        }
        if let Some(queue) = queue {
            sql.push_str(" AND queue = ?");
            bindings.push(queue.to_string());
        }
        sql.push_str(" ORDER BY created_at ASC");

        let mut statement = conn.prepare(&sql)?;
        let rows = statement.query_map(
            rusqlite::params_from_iter(bindings.iter()),
            row_to_record,
        )?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    /// Status counters, optionally scoped to one queue.
    pub fn stats(&self, queue: Option<&str>) -> Result<JobStats, JobError> {
        let conn = self.conn.lock().expect("job store lock");
        let mut stats = JobStats::default();
        let mut fill = |status: &str, slot: &mut u64| -> Result<(), JobError> {
            let count: u64 = match queue {
                Some(q) => conn.query_row(
                    "SELECT COUNT(*) FROM _jobs WHERE status = ?1 AND queue = ?2",
                    params![status, q],
                    |row| row.get(0),
                )?,
                None => conn.query_row(
                    "SELECT COUNT(*) FROM _jobs WHERE status = ?1",
                    params![status],
                    |row| row.get(0),
                )?,
            };
            *slot = count;
            Ok(())
        };
        fill("pending", &mut stats.pending)?;
        fill("running", &mut stats.running)?;
        fill("completed", &mut stats.completed)?;
        fill("failed", &mut stats.failed)?;
        fill("cancelled", &mut stats.cancelled)?;
        Ok(stats)
    }

    /// Start a polling worker for `queue`. Multiple workers may serve the
    /// same queue; the claim is atomic behind the store lock.
    pub fn start_worker(&self, queue: &str, poll_interval: std::time::Duration) {
        self.running.store(true, Ordering::SeqCst);
        let conn = self.conn.clone();
        let handlers = self.handlers.clone();
        let running = self.running.clone();
        let queue = queue.to_string();

        let handle = tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                let claimed = claim_next(&conn, &queue);
                match claimed {
                    Ok(Some(job)) => {
                        run_job(&conn, &handlers, job).await;
                    }
                    Ok(None) => {
                        tokio::time::sleep(poll_interval).await;
                    }
                    Err(e) => {
                        tracing::error!(queue = %queue, error = %e, "job claim failed");
                        tokio::time::sleep(poll_interval).await;
                    }
                }
            }
        });
        self.workers.lock().expect("workers lock").push(handle);
    }

    /// Stop every worker after its current job.
    pub fn stop_workers(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Abort workers immediately (shutdown path).
    pub fn abort_workers(&self) {
        self.running.store(false, Ordering::SeqCst);
        for handle in self.workers.lock().expect("workers lock").drain(..) {
            handle.abort();
        }
    }
}

/// Atomically claim the next runnable job: highest priority first, oldest
/// schedule first within a priority. Marks it running and increments
/// `attempts` in the same statement.
fn claim_next(
    conn: &Arc<Mutex<Connection>>,
    queue: &str,
) -> Result<Option<JobRecord>, JobError> {
    let conn = conn.lock().expect("job store lock");
    let now = Utc::now().timestamp_millis();

    let candidate = conn
        .query_row(
            "SELECT id FROM _jobs
              WHERE queue = ?1 AND status = 'pending'
                AND scheduled_at <= ?2 AND attempts < max_attempts
              ORDER BY priority DESC, scheduled_at ASC
              LIMIT 1",
            params![queue, now],
            |row| row.get::<_, String>(0),
        )
        .optional()?;

    let Some(id) = candidate else {
        return Ok(None);
    };

    // The WHERE clause re-checks status so two workers cannot both claim.
    let changed = conn.execute(
        "UPDATE _jobs
            SET status = 'running', attempts = attempts + 1, started_at = ?2
          WHERE id = ?1 AND status = 'pending'",
        params![id, now],
    )?;
    if changed == 0 {
        return Ok(None);
    }

    let record = conn
        .query_row(
            "SELECT id, name, queue, params, priority, status, attempts, max_attempts,
                    backoff_seconds, scheduled_at, created_at, started_at, finished_at,
                    last_error
               FROM _jobs WHERE id = ?1",
            params![id],
            row_to_record,
        )
        .optional()?;
    Ok(record)
}

async fn run_job(
    conn: &Arc<Mutex<Connection>>,
    handlers: &Arc<DashMap<String, JobHandler>>,
    job: JobRecord,
) {
    let handler = handlers.get(&job.name).map(|h| h.value().clone());
    let outcome = match handler {
        Some(handler) => handler(job.params.clone()).await.map(|_| ()),
        None => Err(anyhow::anyhow!("no handler registered for '{}'", job.name)),
    };

    let now = Utc::now();
    let conn = conn.lock().expect("job store lock");
    match outcome {
        Ok(()) => {
            let _ = conn.execute(
                "UPDATE _jobs SET status = 'completed', finished_at = ?2 WHERE id = ?1",
                params![job.id, now.timestamp_millis()],
            );
        }
        Err(error) => {
            if job.attempts < job.max_attempts {
                // Reschedule with the dispatcher-supplied backoff.
                let next = now + chrono::Duration::seconds(job.backoff_seconds as i64);
                let _ = conn.execute(
                    "UPDATE _jobs
                        SET status = 'pending', scheduled_at = ?2, last_error = ?3
                      WHERE id = ?1",
                    params![job.id, next.timestamp_millis(), error.to_string()],
                );
            } else {
                let _ = conn.execute(
                    "UPDATE _jobs
                        SET status = 'failed', finished_at = ?2, last_error = ?3
                      WHERE id = ?1",
                    params![job.id, now.timestamp_millis(), error.to_string()],
                );
            }
        }
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<JobRecord> {
    let millis = |value: i64| {
        Utc.timestamp_millis_opt(value)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    };
    let params_text: String = row.get(3)?;
    let status_text: String = row.get(5)?;
    Ok(JobRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        queue: row.get(2)?,
        params: serde_json::from_str(&params_text).unwrap_or(Value::Null),
        priority: row.get(4)?,
        status: JobStatus::parse(&status_text).unwrap_or(JobStatus::Pending),
        attempts: row.get::<_, i64>(6)? as u32,
        max_attempts: row.get::<_, i64>(7)? as u32,
        backoff_seconds: row.get::<_, i64>(8)? as u64,
        scheduled_at: millis(row.get(9)?),
        created_at: millis(row.get(10)?),
        started_at: row.get::<_, Option<i64>>(11)?.map(millis),
        finished_at: row.get::<_, Option<i64>>(12)?.map(millis),
        last_error: row.get(13)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    fn ok_handler(calls: Arc<AtomicU32>) -> JobHandler {
        Arc::new(move |_params| {
            let calls = calls.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            })
        })
    }

    async fn wait_for_status(queue: &JobQueue, id: &str, status: JobStatus, timeout_ms: u64) {
        let deadline = std::time::Instant::now()
            + std::time::Duration::from_millis(timeout_ms);
        loop {
            let job = queue.get(id).unwrap().unwrap();
            if job.status == status {
                return;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "job {} stuck in {:?}",
                id,
                job.status
            );
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_dispatch_and_complete() {
        let queue = JobQueue::open_in_memory().unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        queue.register_handler("greet", ok_handler(calls.clone()));

        let id = queue.dispatch("greet", DispatchOptions::default()).unwrap();
        queue.start_worker("default", std::time::Duration::from_millis(20));

        wait_for_status(&queue, &id, JobStatus::Completed, 2_000).await;
        let job = queue.get(&id).unwrap().unwrap();
        assert_eq!(job.attempts, 1);
        assert!(job.started_at.is_some());
        assert!(job.finished_at.is_some());
        queue.abort_workers();
    }

    #[tokio::test]
    async fn test_retry_then_succeed() {
        let queue = JobQueue::open_in_memory().unwrap();
        let calls = Arc::new(AtomicU32::new(0));

        let calls_for_handler = calls.clone();
        queue.register_handler(
            "retry-job",
            Arc::new(move |_params| {
                let calls = calls_for_handler.clone();
                Box::pin(async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        anyhow::bail!("first attempt fails")
                    }
                    Ok(Value::Null)
                })
            }),
        );

        let id = queue
            .dispatch(
                "retry-job",
                DispatchOptions {
                    max_attempts: 2,
                    backoff: Some("1s".into()),
                    ..DispatchOptions::default()
                },
            )
            .unwrap();
        queue.start_worker("default", std::time::Duration::from_millis(20));

        wait_for_status(&queue, &id, JobStatus::Completed, 5_000).await;
        let job = queue.get(&id).unwrap().unwrap();
        assert_eq!(job.attempts, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        queue.abort_workers();
    }

    #[tokio::test]
    async fn test_exhausted_attempts_fail() {
        let queue = JobQueue::open_in_memory().unwrap();
        queue.register_handler(
            "always-fails",
            Arc::new(|_params| Box::pin(async { anyhow::bail!("nope") })),
        );

        let id = queue
            .dispatch(
                "always-fails",
                DispatchOptions {
                    max_attempts: 2,
                    ..DispatchOptions::default()
                },
            )
            .unwrap();
        queue.start_worker("default", std::time::Duration::from_millis(20));

        wait_for_status(&queue, &id, JobStatus::Failed, 5_000).await;
        let job = queue.get(&id).unwrap().unwrap();
        assert_eq!(job.attempts, 2);
        assert_eq!(job.last_error.as_deref(), Some("nope"));
        queue.abort_workers();
    }

    #[tokio::test]
    async fn test_cancel_only_pending() {
        let queue = JobQueue::open_in_memory().unwrap();
        let id = queue
            .dispatch(
                "later",
                DispatchOptions {
                    delay: Some("1h".into()),
                    ..DispatchOptions::default()
                },
            )
            .unwrap();

        assert!(queue.cancel(&id).unwrap());
        let job = queue.get(&id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        // Terminal states never move backward.
        assert!(!queue.cancel(&id).unwrap());
    }

    #[tokio::test]
    async fn test_priority_claim_order() {
        let queue = JobQueue::open_in_memory().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let order_for_handler = order.clone();
        queue.register_handler(
            "prio",
            Arc::new(move |params| {
                let order = order_for_handler.clone();
                Box::pin(async move {
                    order.lock().unwrap().push(params["tag"].as_str().unwrap_or("").to_string());
                    Ok(Value::Null)
                })
            }),
        );

        for (tag, priority) in [("low", 0), ("high", 10), ("mid", 5)] {
            queue
                .dispatch(
                    "prio",
                    DispatchOptions {
                        params: json!({"tag": tag}),
                        priority,
                        ..DispatchOptions::default()
                    },
                )
                .unwrap();
        }

        queue.start_worker("default", std::time::Duration::from_millis(10));
        for _ in 0..200 {
            if order.lock().unwrap().len() == 3 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(order.lock().unwrap().as_slice(), &["high", "mid", "low"]);
        queue.abort_workers();
    }

    #[tokio::test]
    async fn test_stats_and_list_filters() {
        let queue = JobQueue::open_in_memory().unwrap();
        queue
            .dispatch(
                "a",
                DispatchOptions {
                    delay: Some("1h".into()),
                    ..DispatchOptions::default()
                },
            )
            .unwrap();
        queue
            .dispatch(
                "b",
                DispatchOptions {
                    queue: "mail".into(),
                    delay: Some("1h".into()),
                    ..DispatchOptions::default()
                },
            )
            .unwrap();

        let stats = queue.stats(None).unwrap();
        assert_eq!(stats.pending, 2);
        let mail_stats = queue.stats(Some("mail")).unwrap();
        assert_eq!(mail_stats.pending, 1);

        let pending = queue.list(Some(JobStatus::Pending), None).unwrap();
        assert_eq!(pending.len(), 2);
        let mail_jobs = queue.list(None, Some("mail")).unwrap();
        assert_eq!(mail_jobs.len(), 1);
        assert_eq!(mail_jobs[0].name, "b");
    }

    #[tokio::test]
    async fn test_migrations_are_recorded_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        {
            let _queue = JobQueue::open(&path).unwrap();
        }
        // Re-opening must not re-apply.
        let queue = JobQueue::open(&path).unwrap();
        let conn = queue.conn.lock().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM _migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as i64);
    }
}
