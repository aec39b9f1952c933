//! Interval and cron scheduler.
//!
//! Each entry owns a tokio task that sleeps until the next fire time and
//! runs the callback on its own task, so a slow callback never delays the
//! schedule. Cron expressions use the six-field form with seconds
//! (`0 0 3 * * *` fires daily at 03:00:00 UTC).

use super::{parse_std_duration, JobError};
use chrono::{DateTime, Utc};
use cron::Schedule;
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Fired on the scheduler's worker tasks.
pub type ScheduleCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// What drives an entry.
#[derive(Clone)]
pub enum Trigger {
    Interval(std::time::Duration),
    Cron(Box<Schedule>),
}

impl std::fmt::Debug for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trigger::Interval(d) => write!(f, "Interval({:?})", d),
            Trigger::Cron(_) => write!(f, "Cron"),
        }
    }
}

struct EntryState {
    name: String,
    trigger: Trigger,
    enabled: AtomicBool,
    last_fire_at: Mutex<Option<DateTime<Utc>>>,
    next_fire_at: Mutex<Option<DateTime<Utc>>>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Snapshot returned by [`Scheduler::list`].
#[derive(Debug, Clone)]
pub struct ScheduleSnapshot {
    pub name: String,
    pub trigger: Trigger,
    pub enabled: bool,
    pub last_fire_at: Option<DateTime<Utc>>,
    pub next_fire_at: Option<DateTime<Utc>>,
}

/// Owns every schedule entry and its worker task.
#[derive(Default)]
pub struct Scheduler {
    entries: DashMap<String, Arc<EntryState>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an interval entry. The interval accepts duration strings
    /// (`30s`, `5m`, `1h`, plain seconds).
    pub fn add_interval(
        &self,
        name: &str,
        interval: &str,
        callback: ScheduleCallback,
    ) -> Result<(), JobError> {
        let duration = parse_std_duration(interval)?;
        self.install(name, Trigger::Interval(duration), callback)
    }

    /// Add a cron entry (six-field expression with seconds).
    pub fn add_cron(
        &self,
        name: &str,
        expression: &str,
        callback: ScheduleCallback,
    ) -> Result<(), JobError> {
        let schedule = Schedule::from_str(expression)
            .map_err(|e| JobError::InvalidCron(expression.to_string(), e.to_string()))?;
        self.install(name, Trigger::Cron(Box::new(schedule)), callback)
    }

    fn install(
        &self,
        name: &str,
        trigger: Trigger,
        callback: ScheduleCallback,
    ) -> Result<(), JobError> {
        // Replacing an entry stops its old task first.
        self.remove(name);

        let state = Arc::new(EntryState {
            name: name.to_string(),
            trigger: trigger.clone(),
            enabled: AtomicBool::new(true),
            last_fire_at: Mutex::new(None),
            next_fire_at: Mutex::new(None),
            handle: Mutex::new(None),
        });

        let task_state = state.clone();
        let handle = tokio::spawn(async move {
            fire_loop(task_state, callback).await;
        });
        *state.handle.lock().expect("schedule handle lock") = Some(handle);

        self.entries.insert(name.to_string(), state);
        Ok(())
    }

    /// Stop firing without removing the entry.
    pub fn pause(&self, name: &str) -> bool {
        match self.entries.get(name) {
            Some(entry) => {
                entry.enabled.store(false, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Resume a paused entry.
    pub fn resume(&self, name: &str) -> bool {
        match self.entries.get(name) {
            Some(entry) => {
                entry.enabled.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Remove an entry and stop its task.
    pub fn remove(&self, name: &str) -> bool {
        match self.entries.remove(name) {
            Some((_, entry)) => {
                if let Some(handle) = entry.handle.lock().expect("schedule handle lock").take()
                {
                    handle.abort();
                }
                true
            }
            None => false,
        }
    }

    /// Snapshots of every entry, name-ordered.
    pub fn list(&self) -> Vec<ScheduleSnapshot> {
        let mut all: Vec<ScheduleSnapshot> = self
            .entries
            .iter()
            .map(|entry| ScheduleSnapshot {
                name: entry.name.clone(),
                trigger: entry.trigger.clone(),
                enabled: entry.enabled.load(Ordering::SeqCst),
                last_fire_at: *entry.last_fire_at.lock().expect("schedule lock"),
                next_fire_at: *entry.next_fire_at.lock().expect("schedule lock"),
            })
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Stop every entry.
    pub fn shutdown(&self) {
        let names: Vec<String> = self.entries.iter().map(|e| e.name.clone()).collect();
        for name in names {
            self.remove(&name);
        }
    }
}

async fn fire_loop(state: Arc<EntryState>, callback: ScheduleCallback) {
    loop {
        let sleep_for = match &state.trigger {
            Trigger::Interval(duration) => {
                *state.next_fire_at.lock().expect("schedule lock") = Some(
                    Utc::now()
                        + chrono::Duration::from_std(*duration)
                            .unwrap_or_else(|_| chrono::Duration::seconds(0)),
                );
                *duration
            }
            Trigger::Cron(schedule) => {
                let Some(next) = schedule.upcoming(Utc).next() else {
                    tracing::warn!(schedule = %state.name, "cron schedule has no future fire times");
                    return;
                };
                *state.next_fire_at.lock().expect("schedule lock") = Some(next);
                (next - Utc::now())
                    .to_std()
                    .unwrap_or(std::time::Duration::ZERO)
            }
        };

        tokio::time::sleep(sleep_for).await;

        if !state.enabled.load(Ordering::SeqCst) {
            continue;
        }

        *state.last_fire_at.lock().expect("schedule lock") = Some(Utc::now());
        // Callbacks run on their own task so a slow one cannot skew the
        // schedule.
        let fired = callback.clone();
        tokio::spawn(async move {
            fired().await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn counter_callback(counter: Arc<AtomicU32>) -> ScheduleCallback {
        Arc::new(move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_fires_repeatedly() {
        let scheduler = Scheduler::new();
        let fires = Arc::new(AtomicU32::new(0));
        scheduler
            .add_interval("tick", "1s", counter_callback(fires.clone()))
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(3_500)).await;
        let count = fires.load(Ordering::SeqCst);
        assert!((2..=4).contains(&count), "fired {} times", count);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_and_resume() {
        let scheduler = Scheduler::new();
        let fires = Arc::new(AtomicU32::new(0));
        scheduler
            .add_interval("tick", "1s", counter_callback(fires.clone()))
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(1_500)).await;
        scheduler.pause("tick");
        let at_pause = fires.load(Ordering::SeqCst);

        tokio::time::sleep(std::time::Duration::from_millis(3_000)).await;
        assert_eq!(fires.load(Ordering::SeqCst), at_pause);

        scheduler.resume("tick");
        tokio::time::sleep(std::time::Duration::from_millis(2_500)).await;
        assert!(fires.load(Ordering::SeqCst) > at_pause);
    }

    #[tokio::test]
    async fn test_remove_stops_entry() {
        let scheduler = Scheduler::new();
        let fires = Arc::new(AtomicU32::new(0));
        scheduler
            .add_interval("tick", "1s", counter_callback(fires.clone()))
            .unwrap();
        assert!(scheduler.remove("tick"));
        assert!(scheduler.list().is_empty());
        assert!(!scheduler.remove("tick"));
    }

    #[tokio::test]
    async fn test_invalid_cron_rejected() {
        let scheduler = Scheduler::new();
        let err = scheduler
            .add_cron("bad", "not a cron", counter_callback(Arc::new(AtomicU32::new(0))))
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidCron(_, _)));
    }

    #[tokio::test]
    async fn test_list_reports_next_fire() {
        let scheduler = Scheduler::new();
        scheduler
            .add_cron(
                "nightly",
                "0 0 3 * * *",
                counter_callback(Arc::new(AtomicU32::new(0))),
            )
            .unwrap();
        // Give the task a beat to compute its first fire time.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let entries = scheduler.list();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].next_fire_at.is_some());
        assert!(entries[0].enabled);
    }
}
