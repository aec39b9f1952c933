//! Thread service: a bounded pool of coarse-grained named work units.
//!
//! Units are tokio tasks, not OS threads; the pool bound is a semaphore.
//! Priorities are advisory - when workers are free, higher-priority pending
//! units start first. `terminate` aborts best-effort.

use super::JobError;
use crate::ast::ThreadPriority;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Notify, Semaphore};

/// Lifecycle of one work unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Terminated,
}

/// Snapshot of a named work unit.
#[derive(Debug, Clone)]
pub struct ThreadInfo {
    pub name: String,
    pub status: ThreadStatus,
    pub priority: ThreadPriority,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

/// Completion callbacks.
#[derive(Default, Clone)]
pub struct ThreadOptions {
    pub priority: ThreadPriority,
    pub on_complete: Option<Arc<dyn Fn(Value) + Send + Sync>>,
    pub on_error: Option<Arc<dyn Fn(String) + Send + Sync>>,
}

/// The work a unit runs.
pub type ThreadBody = BoxFuture<'static, Result<Value, String>>;

struct PendingUnit {
    priority: ThreadPriority,
    sequence: u64,
    name: String,
    body: ThreadBody,
    options: ThreadOptions,
}

impl PartialEq for PendingUnit {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}
impl Eq for PendingUnit {}
impl PartialOrd for PendingUnit {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for PendingUnit {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: higher priority first, then FIFO within a priority.
        self.priority
            .cmp(&other.priority)
            .then(other.sequence.cmp(&self.sequence))
    }
}

struct Shared {
    threads: DashMap<String, ThreadInfo>,
    handles: DashMap<String, tokio::task::JoinHandle<()>>,
    watchers: DashMap<String, watch::Receiver<bool>>,
    pending: Mutex<BinaryHeap<PendingUnit>>,
    semaphore: Arc<Semaphore>,
    notify: Notify,
    sequence: AtomicU64,
}

/// Bounded named-work-unit pool.
pub struct ThreadService {
    shared: Arc<Shared>,
    _dispatcher: tokio::task::JoinHandle<()>,
}

impl ThreadService {
    /// Create a service with `max_workers` concurrent units.
    pub fn new(max_workers: usize) -> Self {
        let shared = Arc::new(Shared {
            threads: DashMap::new(),
            handles: DashMap::new(),
            watchers: DashMap::new(),
            pending: Mutex::new(BinaryHeap::new()),
            semaphore: Arc::new(Semaphore::new(max_workers.max(1))),
            notify: Notify::new(),
            sequence: AtomicU64::new(0),
        });

        let dispatcher_shared = shared.clone();
        let dispatcher = tokio::spawn(async move {
            dispatch_loop(dispatcher_shared).await;
        });

        Self {
            shared,
            _dispatcher: dispatcher,
        }
    }

    /// Queue a named work unit. Replaces any finished unit with the same
    /// name; a live unit with the same name is an error.
    pub fn run(
        &self,
        name: &str,
        body: ThreadBody,
        options: ThreadOptions,
    ) -> Result<ThreadInfo, JobError> {
        if let Some(existing) = self.shared.threads.get(name) {
            if matches!(existing.status, ThreadStatus::Pending | ThreadStatus::Running) {
                return Err(JobError::Store(format!(
                    "thread '{}' is already running",
                    name
                )));
            }
        }

        let info = ThreadInfo {
            name: name.to_string(),
            status: ThreadStatus::Pending,
            priority: options.priority,
            start_time: None,
            end_time: None,
            result: None,
            error: None,
        };
        self.shared.threads.insert(name.to_string(), info.clone());

        // The watch sender travels with the body; completion (or abort,
        // which drops it) releases joiners either way.
        let (sender, receiver) = watch::channel(false);
        self.shared.watchers.insert(name.to_string(), receiver);
        let unit = PendingUnit {
            priority: options.priority,
            sequence: self.shared.sequence.fetch_add(1, Ordering::SeqCst),
            name: name.to_string(),
            body: wrap_body(body, sender),
            options,
        };

        self.shared.pending.lock().expect("pending lock").push(unit);
        self.shared.notify.notify_one();
        Ok(info)
    }

    /// Wait for a unit to finish; returns its final snapshot.
    pub async fn join(
        &self,
        name: &str,
        timeout: Option<std::time::Duration>,
    ) -> Result<ThreadInfo, JobError> {
        let receiver = self
            .shared
            .watchers
            .get(name)
            .map(|r| r.value().clone())
            .ok_or_else(|| JobError::UnknownThread(name.to_string()))?;

        let wait = async {
            let mut receiver = receiver;
            // Already done?
            if !*receiver.borrow() {
                let _ = receiver.wait_for(|done| *done).await;
            }
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| JobError::JoinTimeout(name.to_string()))?,
            None => wait.await,
        }

        self.get(name)
            .ok_or_else(|| JobError::UnknownThread(name.to_string()))
    }

    /// Best-effort cancellation: aborts a running unit, drops a pending one.
    pub fn terminate(&self, name: &str) -> Result<(), JobError> {
        let mut found = false;
        if let Some(mut info) = self.shared.threads.get_mut(name) {
            if matches!(info.status, ThreadStatus::Pending | ThreadStatus::Running) {
                info.status = ThreadStatus::Terminated;
                info.end_time = Some(Utc::now());
            }
            found = true;
        }
        if !found {
            return Err(JobError::UnknownThread(name.to_string()));
        }
        if let Some((_, handle)) = self.shared.handles.remove(name) {
            handle.abort();
        }
        // Wake the dispatcher so a still-pending unit gets drained (its
        // dropped watch sender releases any joiner).
        self.shared.notify.notify_one();
        Ok(())
    }

    /// Snapshot of one unit.
    pub fn get(&self, name: &str) -> Option<ThreadInfo> {
        self.shared.threads.get(name).map(|i| i.clone())
    }

    /// Snapshots of every known unit.
    pub fn list(&self) -> Vec<ThreadInfo> {
        let mut all: Vec<ThreadInfo> = self.shared.threads.iter().map(|i| i.clone()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}

fn wrap_body(body: ThreadBody, sender: watch::Sender<bool>) -> ThreadBody {
    Box::pin(async move {
        let result = body.await;
        let _ = sender.send(true);
        result
    })
}

async fn dispatch_loop(shared: Arc<Shared>) {
    loop {
        let permit = shared
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore is never closed");

        // Pull the highest-priority pending unit, skipping terminated ones.
        let unit = loop {
            let candidate = shared.pending.lock().expect("pending lock").pop();
            match candidate {
                None => break None,
                Some(unit) => {
                    let terminated = shared
                        .threads
                        .get(&unit.name)
                        .map(|i| i.status == ThreadStatus::Terminated)
                        .unwrap_or(false);
                    if terminated {
                        continue;
                    }
                    break Some(unit);
                }
            }
        };

        let Some(unit) = unit else {
            drop(permit);
            shared.notify.notified().await;
            continue;
        };

        if let Some(mut info) = shared.threads.get_mut(&unit.name) {
            info.status = ThreadStatus::Running;
            info.start_time = Some(Utc::now());
        }

        let name = unit.name.clone();
        let options = unit.options;
        let body = unit.body;
        let task_shared = shared.clone();
        let handle = tokio::spawn(async move {
            let outcome = body.await;
            if let Some(mut info) = task_shared.threads.get_mut(&name) {
                // A terminate() that raced the finish wins.
                if info.status == ThreadStatus::Running {
                    info.end_time = Some(Utc::now());
                    match &outcome {
                        Ok(value) => {
                            info.status = ThreadStatus::Completed;
                            info.result = Some(value.clone());
                        }
                        Err(error) => {
                            info.status = ThreadStatus::Failed;
                            info.error = Some(error.clone());
                        }
                    }
                }
            }
            match outcome {
                Ok(value) => {
                    if let Some(on_complete) = options.on_complete {
                        on_complete(value);
                    }
                }
                Err(error) => {
                    if let Some(on_error) = options.on_error {
                        on_error(error);
                    }
                }
            }
            task_shared.handles.remove(&name);
            drop(permit);
        });
        shared.handles.insert(unit.name, handle);
    }
}
