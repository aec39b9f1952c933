//! Job execution integration: retry/backoff through the durable queue,
//! document-level handler registration and dispatch, duration invariants.

use quill::jobs::{format_duration, parse_duration, DispatchOptions, JobQueue, JobStatus};
use quill::{ExecutionContext, QuillParser, Renderer, Runtime};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Honors `RUST_LOG` when a test needs worker tracing.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn wait_for_status(queue: &JobQueue, id: &str, status: JobStatus, timeout_ms: u64) {
    let deadline = std::time::Instant::now() + std::time::Duration::from_millis(timeout_ms);
    loop {
        let job = queue.get(id).unwrap().unwrap();
        if job.status == status {
            return;
        }
        assert!(
            job.status != JobStatus::Failed || status == JobStatus::Failed,
            "job failed unexpectedly: {:?}",
            job.last_error
        );
        assert!(
            std::time::Instant::now() < deadline,
            "job stuck in {:?}",
            job.status
        );
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn retry_job_completes_on_second_attempt() {
    init_tracing();
    let queue = JobQueue::open_in_memory().unwrap();
    let calls = Arc::new(AtomicU32::new(0));

    let calls_for_handler = calls.clone();
    queue.register_handler(
        "retry-job",
        Arc::new(move |_params| {
            let calls = calls_for_handler.clone();
            Box::pin(async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("transient failure")
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
    let started = std::time::Instant::now();
    queue.start_worker("default", std::time::Duration::from_millis(20));

    wait_for_status(&queue, &id, JobStatus::Completed, 6_000).await;
    let job = queue.get(&id).unwrap().unwrap();
    assert_eq!(job.attempts, 2);
    // The retry waited for the 1s backoff.
    assert!(started.elapsed() >= std::time::Duration::from_secs(1));
    queue.abort_workers();
}

#[tokio::test]
async fn status_never_leaves_terminal_states() {
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
    assert_eq!(queue.get(&id).unwrap().unwrap().status, JobStatus::Cancelled);

    // A second cancel (or a worker claim) cannot move it again.
    assert!(!queue.cancel(&id).unwrap());
    queue.start_worker("default", std::time::Duration::from_millis(20));
    tokio::time::sleep(std::time::Duration::from_millis(150)).await;
    assert_eq!(queue.get(&id).unwrap().unwrap().status, JobStatus::Cancelled);
    queue.abort_workers();
}

#[tokio::test]
async fn document_registers_handler_and_dispatches() {
    let runtime = Runtime::builder().build();
    let renderer = Renderer::new(runtime.clone());

    // First render registers the handler (q:job with a body); the handler
    // sends to an observable queue through the broker.
    let register = QuillParser::new()
        .parse(
            r#"<q:component name="worker">
                <q:job name="notify">
                    <q:message type="send" queue="sent">{params.user}</q:message>
                </q:job>
            </q:component>"#,
        )
        .unwrap();
    let mut ctx = ExecutionContext::new();
    renderer.render_document(&register, &mut ctx).await;

    // Second render dispatches with parameters.
    let dispatch = QuillParser::new()
        .parse(
            r#"<q:component name="caller">
                <q:job name="notify" result="job">
                    <q:param name="user" value="ada" />
                </q:job>
                <p>{job.success}</p>
            </q:component>"#,
        )
        .unwrap();
    let mut ctx = ExecutionContext::new();
    let output = renderer.render_document(&dispatch, &mut ctx).await;
    assert_eq!(output.trim(), "<p>true</p>");

    runtime
        .jobs
        .start_worker("default", std::time::Duration::from_millis(20));

    let mut delivered = 0;
    for _ in 0..300 {
        delivered = runtime
            .messages
            .queue_info("sent")
            .await
            .data
            .and_then(|d| d["message_count"].as_u64())
            .unwrap_or(0);
        if delivered == 1 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(delivered, 1);
    runtime.jobs.abort_workers();
}

#[tokio::test]
async fn stats_reflect_lifecycle() {
    let queue = JobQueue::open_in_memory().unwrap();
    queue.register_handler(
        "quick",
        Arc::new(|_params| Box::pin(async { Ok(json!("done")) })),
    );

    for _ in 0..3 {
        queue.dispatch("quick", DispatchOptions::default()).unwrap();
    }
    assert_eq!(queue.stats(None).unwrap().pending, 3);

    queue.start_worker("default", std::time::Duration::from_millis(10));
    for _ in 0..300 {
        if queue.stats(None).unwrap().completed == 3 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    let stats = queue.stats(None).unwrap();
    assert_eq!(stats.completed, 3);
    assert_eq!(stats.pending, 0);
    queue.abort_workers();
}

#[test]
fn duration_round_trip_invariant() {
    assert_eq!(format_duration(parse_duration("1h 30m").unwrap()), "1h 30m");
    let documented = [("s", 1u64), ("m", 60), ("h", 3_600), ("d", 86_400), ("w", 604_800)];
    for (suffix, seconds) in documented {
        assert_eq!(parse_duration(&format!("1{}", suffix)).unwrap(), seconds);
    }
}

#[tokio::test]
async fn scheduler_interval_fires_and_pauses() {
    let runtime = Runtime::builder().build();
    let fires = Arc::new(AtomicU32::new(0));

    let fires_for_callback = fires.clone();
    runtime
        .scheduler
        .add_interval(
            "tick",
            "1s",
            Arc::new(move || {
                let fires = fires_for_callback.clone();
                Box::pin(async move {
                    fires.fetch_add(1, Ordering::SeqCst);
                })
            }),
        )
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(2_300)).await;
    let count = fires.load(Ordering::SeqCst);
    assert!(count >= 1, "interval never fired");

    runtime.scheduler.pause("tick");
    tokio::time::sleep(std::time::Duration::from_millis(1_200)).await;
    assert_eq!(fires.load(Ordering::SeqCst), count);
    runtime.scheduler.shutdown();
}
