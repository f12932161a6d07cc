use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::time::Duration;

use serde_json::json;

use crate::batch::{BatchEvent, BatchOptions, BatchQueue};
use crate::credentials::{CredentialCache, CredentialOptions};
use crate::duplex::{StreamDriver, StreamOptions};
use crate::ledger::MemoryLedger;
use crate::orchestrator::{BatchItemOutput, JobOrchestrator, JobRequest, OrchestratorOptions};
use crate::poll::{PollOptions, PollingReconciler};
use crate::provider::{
    Frame, IssuedToken, JobHandle, STREAM_CHANNEL_CAPACITY, StatusReport, StreamPeer, TokenSource,
    stream_pair,
};
use crate::store::{MemoryTaskStore, TaskStore};
use crate::types::{CoreError, ErrorInfo, NewTask, TaskPatch, TaskState};

fn request(principal: i64, estimate: i64) -> JobRequest {
    JobRequest {
        principal_id: principal,
        app_id: "test-app".to_owned(),
        params: json!({ "input": "hello" }),
        cost_estimate: estimate,
    }
}

fn orchestrator(
    store: &Arc<MemoryTaskStore>,
    ledger: &Arc<MemoryLedger>,
) -> JobOrchestrator<MemoryTaskStore, MemoryLedger> {
    JobOrchestrator::new(
        Arc::clone(store),
        Arc::clone(ledger),
        OrchestratorOptions {
            poll: PollOptions {
                interval: Duration::from_millis(10),
                max_retries: 10,
            },
            batch: BatchOptions {
                concurrency: 2,
                max_retries: 2,
                backoff_base: Duration::from_millis(10),
            },
            ..Default::default()
        },
    )
}

/// Poll a record until it leaves `Processing`, bounded by a wall-clock guard.
async fn wait_terminal(store: &MemoryTaskStore, task_id: i64) -> crate::types::TaskRecord {
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let record = store
                .get_task(task_id)
                .await
                .expect("store read should succeed")
                .expect("record should exist");
            if record.state.is_terminal() {
                break record;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("record should reach a terminal state")
}

// ── Store invariants ──────────────────────────────────────────────────────────

#[tokio::test]
async fn terminal_records_accept_no_further_mutation() {
    let store = MemoryTaskStore::new();
    let record = store
        .create_task(NewTask {
            principal_id: 1,
            app_id: "app".to_owned(),
            start_time: chrono::Utc::now(),
        })
        .await
        .expect("create should succeed");
    assert_eq!(record.state, TaskState::Processing);

    store
        .update_task(
            record.id,
            TaskPatch {
                state: Some(TaskState::Success),
                used_points: Some(5),
                ..Default::default()
            },
        )
        .await
        .expect("transition to terminal should succeed");

    // Any later patch is silently dropped, including a state change.
    store
        .update_task(
            record.id,
            TaskPatch {
                state: Some(TaskState::Failed),
                used_points: Some(99),
                error_infos: Some(vec![ErrorInfo::new("late failure")]),
                ..Default::default()
            },
        )
        .await
        .expect("update on terminal record is a no-op, not an error");

    let current = store.get_task(record.id).await.unwrap().unwrap();
    assert_eq!(current.state, TaskState::Success);
    assert_eq!(current.used_points, 5);
    assert!(current.error_infos.is_empty());
}

// ── PollingReconciler ─────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn polling_stops_at_retry_budget_with_timeout_failure() {
    let store = Arc::new(MemoryTaskStore::new());
    let record = store
        .create_task(NewTask {
            principal_id: 1,
            app_id: "app".to_owned(),
            start_time: chrono::Utc::now(),
        })
        .await
        .unwrap();

    let queries = Arc::new(AtomicU32::new(0));
    let queries_in_loop = Arc::clone(&queries);
    let deducted = Arc::new(AtomicBool::new(false));
    let deducted_flag = Arc::clone(&deducted);

    let reconciler = PollingReconciler::new(
        Arc::clone(&store),
        PollOptions {
            interval: Duration::from_millis(100),
            max_retries: 7,
        },
    );
    reconciler
        .reconcile(
            record.id,
            JobHandle("job-1".to_owned()),
            10,
            move |_| {
                queries_in_loop.fetch_add(1, Ordering::SeqCst);
                async { Ok(StatusReport::running()) }
            },
            move |_| async move {
                deducted_flag.store(true, Ordering::SeqCst);
            },
        )
        .await;

    // Exactly max_retries queries, then a forced timeout failure.
    assert_eq!(queries.load(Ordering::SeqCst), 7);
    assert!(!deducted.load(Ordering::SeqCst), "failure must not deduct");

    let current = store.get_task(record.id).await.unwrap().unwrap();
    assert_eq!(current.state, TaskState::Failed);
    assert_eq!(current.use_time_ms, 7 * 100);
    assert!(current.error_infos[0].message.contains("timed out"));
}

#[tokio::test(start_paused = true)]
async fn polling_query_error_is_a_terminal_failure() {
    let store = Arc::new(MemoryTaskStore::new());
    let record = store
        .create_task(NewTask {
            principal_id: 1,
            app_id: "app".to_owned(),
            start_time: chrono::Utc::now(),
        })
        .await
        .unwrap();

    let reconciler = PollingReconciler::new(Arc::clone(&store), PollOptions::default());
    reconciler
        .reconcile(
            record.id,
            JobHandle("job-2".to_owned()),
            10,
            |_| async { Err(CoreError::Transport("connection reset".to_owned())) },
            |_| async { panic!("failure path must not deduct") },
        )
        .await;

    let current = store.get_task(record.id).await.unwrap().unwrap();
    assert_eq!(current.state, TaskState::Failed);
    assert!(current.error_infos[0].message.contains("connection reset"));
}

// ── DuplexStreamProtocol ──────────────────────────────────────────────────────

/// Drive the provider side of a two-phase stream: ack the run frame, emit
/// binary chunks, then finish after the engine's `finish` arrives.
async fn scripted_peer(mut peer: StreamPeer, chunks: Vec<&'static [u8]>, units: i64) {
    // run frame
    let run = peer.incoming.recv().await.expect("run frame");
    match run {
        Frame::Control(v) => assert_eq!(v["command"], "run"),
        Frame::Binary(_) => panic!("expected control frame first"),
    }
    peer.outgoing
        .send(Frame::Control(json!({ "event": "task-started" })))
        .await
        .unwrap();

    for chunk in chunks {
        peer.outgoing
            .send(Frame::Binary(bytes::Bytes::from_static(chunk)))
            .await
            .unwrap();
    }

    // continue + finish from the engine's two-phase drive
    for expected in ["continue", "finish"] {
        match peer.incoming.recv().await.expect("control frame") {
            Frame::Control(v) => assert_eq!(v["command"], expected),
            Frame::Binary(_) => panic!("unexpected binary frame from engine"),
        }
    }

    peer.outgoing
        .send(Frame::Control(
            json!({ "event": "task-finished", "units": units, "payload": { "chars": units } }),
        ))
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn stream_preserves_binary_frame_order() {
    let (conn, peer) = stream_pair(STREAM_CHANNEL_CAPACITY);
    tokio::spawn(scripted_peer(peer, vec![b"b1", b"b2", b"b3"], 6));

    let driver = StreamDriver::new(StreamOptions::default());
    let outcome = driver
        .run(json!({ "text": "abc" }), conn)
        .await
        .expect("stream should finish");

    assert_eq!(&outcome.data[..], &b"b1b2b3"[..]);
    assert_eq!(outcome.billed_units, Some(6));
}

#[tokio::test(start_paused = true)]
async fn stream_failure_event_carries_provider_error() {
    let (conn, mut peer) = stream_pair(STREAM_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let _run = peer.incoming.recv().await;
        peer.outgoing
            .send(Frame::Control(
                json!({ "event": "task-failed", "code": "E42", "message": "bad voice id" }),
            ))
            .await
            .unwrap();
    });

    let driver = StreamDriver::new(StreamOptions::default());
    let err = driver.run(json!({}), conn).await.unwrap_err();
    match err {
        CoreError::Provider { code, message } => {
            assert_eq!(code.as_deref(), Some("E42"));
            assert_eq!(message, "bad voice id");
        }
        other => panic!("expected provider error, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn zzz_probe_close() {
    let (conn, mut peer) = stream_pair(STREAM_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let _run = peer.incoming.recv().await;
        // Drop the peer without any terminal event.
    });
    let driver = StreamDriver::new(StreamOptions::default());
    let err = driver.run(json!({}), conn).await.unwrap_err();
    eprintln!("PROBE_ERR={err:?}");
}

#[tokio::test(start_paused = true)]
async fn stream_channel_close_before_terminal_event_fails() {
    let (conn, mut peer) = stream_pair(STREAM_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let _run = peer.incoming.recv().await;
        // Drop the peer without any terminal event.
    });

    let driver = StreamDriver::new(StreamOptions::default());
    let err = driver.run(json!({}), conn).await.unwrap_err();
    assert!(matches!(err, CoreError::StreamClosed));
}

#[tokio::test(start_paused = true)]
async fn stream_hard_timeout_fires_without_activity() {
    let (conn, peer) = stream_pair(STREAM_CHANNEL_CAPACITY);
    // Keep the peer alive but silent so the channel never closes.
    let driver = StreamDriver::new(StreamOptions {
        run_timeout: Duration::from_secs(2),
        ..Default::default()
    });
    let err = driver.run(json!({}), conn).await.unwrap_err();
    assert!(matches!(err, CoreError::Timeout));
    drop(peer);
}

#[test]
fn frame_classification_sniffs_json_objects_once() {
    match Frame::classify(bytes::Bytes::from_static(b"  {\"event\":\"task-started\"}")) {
        Frame::Control(v) => assert_eq!(v["event"], "task-started"),
        Frame::Binary(_) => panic!("JSON object should classify as control"),
    }
    // JSON arrays and non-JSON bytes are raw output.
    assert!(matches!(
        Frame::classify(bytes::Bytes::from_static(b"[1,2,3]")),
        Frame::Binary(_)
    ));
    assert!(matches!(
        Frame::classify(bytes::Bytes::from_static(&[0x00, 0x7b, 0xff])),
        Frame::Binary(_)
    ));
}

// ── BatchQueue ────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn batch_concurrency_never_exceeds_limit() {
    let running = Arc::new(AtomicI32::new(0));
    let peak = Arc::new(AtomicI32::new(0));
    let running_in_runner = Arc::clone(&running);
    let peak_in_runner = Arc::clone(&peak);

    let (queue, mut events) = BatchQueue::new(
        1,
        BatchOptions {
            concurrency: 2,
            max_retries: 0,
            backoff_base: Duration::from_millis(10),
        },
        move |_item: serde_json::Value| {
            let running = Arc::clone(&running_in_runner);
            let peak = Arc::clone(&peak_in_runner);
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(1i64)
            }
        },
    );

    for i in 0..5 {
        queue.add(json!({ "item": i }));
    }
    queue.wait_for_idle().await;

    assert!(peak.load(Ordering::SeqCst) <= 2, "more than 2 items ran at once");

    let mut settled = 0;
    while let Ok(event) = events.try_recv() {
        assert!(matches!(event, BatchEvent::Completed { .. }));
        settled += 1;
    }
    assert_eq!(settled, 5);
}

#[tokio::test(start_paused = true)]
async fn batch_retries_transport_errors_with_backoff() {
    let attempts = Arc::new(AtomicU32::new(0));
    let attempts_in_runner = Arc::clone(&attempts);

    let (queue, mut events) = BatchQueue::new(
        1,
        BatchOptions {
            concurrency: 1,
            max_retries: 3,
            backoff_base: Duration::from_millis(10),
        },
        move |_item: serde_json::Value| {
            let attempts = Arc::clone(&attempts_in_runner);
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(CoreError::Transport("rate limited".to_owned()))
                } else {
                    Ok(7i64)
                }
            }
        },
    );

    queue.add(json!({}));
    queue.wait_for_idle().await;

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    match events.try_recv().expect("one settled item") {
        BatchEvent::Completed { output, retries, .. } => {
            assert_eq!(output, 7);
            assert_eq!(retries, 2);
        }
        BatchEvent::Failed { error, .. } => panic!("item should settle completed: {error}"),
    }
}

#[tokio::test(start_paused = true)]
async fn batch_does_not_retry_provider_failures() {
    let attempts = Arc::new(AtomicU32::new(0));
    let attempts_in_runner = Arc::clone(&attempts);

    let (queue, mut events) = BatchQueue::new(
        1,
        BatchOptions::default(),
        move |_item: serde_json::Value| {
            let attempts = Arc::clone(&attempts_in_runner);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<i64, _>(CoreError::Provider {
                    code: None,
                    message: "invalid input".to_owned(),
                })
            }
        },
    );

    queue.add(json!({}));
    queue.wait_for_idle().await;

    assert_eq!(attempts.load(Ordering::SeqCst), 1, "provider failures are terminal");
    assert!(matches!(
        events.try_recv().expect("one settled item"),
        BatchEvent::Failed { .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn batch_wait_for_idle_releases_every_waiter() {
    let (queue, _events) = BatchQueue::new(
        1,
        BatchOptions {
            concurrency: 2,
            max_retries: 0,
            backoff_base: Duration::from_millis(10),
        },
        |_item: serde_json::Value| async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(())
        },
    );
    for _ in 0..3 {
        queue.add(json!({}));
    }

    let queue = Arc::new(queue);
    let mut waiters = Vec::new();
    for _ in 0..4 {
        let q = Arc::clone(&queue);
        waiters.push(tokio::spawn(async move { q.wait_for_idle().await }));
    }
    for waiter in waiters {
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter should be released")
            .expect("waiter should not panic");
    }
}

// ── CredentialCache ───────────────────────────────────────────────────────────

struct CountingSource {
    fetches: AtomicU32,
    /// Attempts `0..fail_first` fail (cold-start failures).
    fail_first: u32,
    /// Attempts `fail_after..` fail (endpoint goes down later).
    fail_after: u32,
    delay: Duration,
    ttl: Duration,
}

impl CountingSource {
    fn new(ttl: Duration) -> Self {
        Self {
            fetches: AtomicU32::new(0),
            fail_first: 0,
            fail_after: u32::MAX,
            delay: Duration::from_millis(20),
            ttl,
        }
    }
}

impl TokenSource for CountingSource {
    async fn fetch(&self, principal: i64, scope: &str) -> Result<IssuedToken, CoreError> {
        let n = self.fetches.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if n < self.fail_first || n >= self.fail_after {
            return Err(CoreError::Transport("token endpoint unavailable".to_owned()));
        }
        Ok(IssuedToken {
            token: format!("tok-{principal}-{scope}-{n}"),
            ttl: self.ttl,
        })
    }
}

fn cache_opts() -> CredentialOptions {
    CredentialOptions {
        refresh_threshold: Duration::from_secs(30),
        max_retries: 3,
        retry_delay: Duration::from_millis(10),
        sweep_interval: Duration::from_secs(300),
    }
}

#[tokio::test(start_paused = true)]
async fn concurrent_gets_share_one_refresh() {
    let source = Arc::new(CountingSource::new(Duration::from_secs(3600)));
    let cache = CredentialCache::new(Arc::clone(&source), cache_opts());

    let a = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.get(1, "tts").await })
    };
    let b = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.get(1, "tts").await })
    };

    let token_a = a.await.unwrap().expect("first caller gets a token");
    let token_b = b.await.unwrap().expect("second caller gets a token");

    assert_eq!(token_a, token_b, "both callers observe the same token");
    assert_eq!(source.fetches.load(Ordering::SeqCst), 1, "exactly one refresh");
}

#[tokio::test(start_paused = true)]
async fn fresh_token_is_served_without_network_call() {
    let source = Arc::new(CountingSource::new(Duration::from_secs(3600)));
    let cache = CredentialCache::new(Arc::clone(&source), cache_opts());

    let first = cache.get(1, "tts").await.unwrap();
    let second = cache.get(1, "tts").await.unwrap();

    assert_eq!(first, second);
    assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn distinct_scopes_refresh_independently() {
    let source = Arc::new(CountingSource::new(Duration::from_secs(3600)));
    let cache = CredentialCache::new(Arc::clone(&source), cache_opts());

    let tts = cache.get(1, "tts").await.unwrap();
    let asr = cache.get(1, "asr").await.unwrap();

    assert_ne!(tts, asr);
    assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn refresh_retries_then_succeeds() {
    let source = Arc::new(CountingSource {
        fail_first: 2,
        ..CountingSource::new(Duration::from_secs(3600))
    });
    let cache = CredentialCache::new(Arc::clone(&source), cache_opts());

    let token = cache.get(1, "tts").await.expect("third attempt succeeds");
    assert!(token.starts_with("tok-1-tts-"));
    assert_eq!(source.fetches.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn exhausted_refresh_surfaces_error_and_keeps_stale_entry() {
    // Short TTL so the first token is already below the refresh threshold on
    // the second get; the endpoint goes down after issuing it.
    let source = Arc::new(CountingSource {
        fail_after: 1,
        ..CountingSource::new(Duration::from_secs(5))
    });
    let cache = CredentialCache::new(Arc::clone(&source), cache_opts());

    cache.get(1, "tts").await.expect("initial token");
    assert_eq!(cache.len().await, 1);

    cache.get(1, "tts").await.expect_err("refresh should fail");
    assert_eq!(source.fetches.load(Ordering::SeqCst), 5, "initial fetch + 1 try + 3 retries");
    assert_eq!(cache.len().await, 1, "failed refresh keeps the stale entry");
}

#[tokio::test(start_paused = true)]
async fn sweep_evicts_only_expired_entries() {
    let source = Arc::new(CountingSource::new(Duration::from_secs(60)));
    let cache = CredentialCache::new(Arc::clone(&source), cache_opts());

    cache.get(1, "tts").await.unwrap();
    cache.get(2, "tts").await.unwrap();
    assert_eq!(cache.len().await, 2);

    cache.sweep_expired().await;
    assert_eq!(cache.len().await, 2, "unexpired entries survive the sweep");

    tokio::time::advance(Duration::from_secs(120)).await;
    cache.sweep_expired().await;
    assert_eq!(cache.len().await, 0);
}

// ── Orchestrator end-to-end ───────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn polled_job_bills_actual_cost_not_estimate() {
    let store = Arc::new(MemoryTaskStore::new());
    let ledger = Arc::new(MemoryLedger::new());
    ledger.credit(1, 100).await;
    let orch = orchestrator(&store, &ledger);

    let polls = Arc::new(AtomicU32::new(0));
    let polls_in_query = Arc::clone(&polls);

    let task_id = orch
        .submit_polled_job(
            request(1, 10),
            |_params| async { Ok(JobHandle("ext-1".to_owned())) },
            move |_handle| {
                let n = polls_in_query.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Ok(StatusReport::running())
                    } else {
                        Ok(StatusReport::succeeded(
                            Some(json!({ "url": "https://cdn/out.mp4" })),
                            Some(7),
                        ))
                    }
                }
            },
        )
        .await
        .expect("submission should be admitted");

    let record = wait_terminal(&store, task_id).await;
    assert_eq!(record.state, TaskState::Success);
    assert_eq!(record.used_points, 7);
    assert_eq!(record.result[0]["url"], "https://cdn/out.mp4");
    // Deducted by the provider-reported 7, not the 10-point estimate.
    assert_eq!(ledger.balance(1).await, 93);
}

#[tokio::test]
async fn failed_precheck_creates_no_record_and_never_submits() {
    let store = Arc::new(MemoryTaskStore::new());
    let ledger = Arc::new(MemoryLedger::new());
    let orch = orchestrator(&store, &ledger);

    let submitted = Arc::new(AtomicBool::new(false));
    let submitted_flag = Arc::clone(&submitted);

    let err = orch
        .submit_polled_job(
            request(1, 5),
            move |_params| {
                submitted_flag.store(true, Ordering::SeqCst);
                async { Ok(JobHandle("never".to_owned())) }
            },
            |_handle| async { Ok(StatusReport::running()) },
        )
        .await
        .expect_err("zero balance cannot afford 5 points");

    assert!(matches!(
        err,
        CoreError::InsufficientPoints {
            required: 5,
            balance: 0
        }
    ));
    assert!(!submitted.load(Ordering::SeqCst), "provider must not be called");
    assert!(store.is_empty().await, "no record reaches Processing");
}

#[tokio::test(start_paused = true)]
async fn provider_failure_deducts_nothing() {
    let store = Arc::new(MemoryTaskStore::new());
    let ledger = Arc::new(MemoryLedger::new());
    ledger.credit(1, 100).await;
    let orch = orchestrator(&store, &ledger);

    let task_id = orch
        .submit_polled_job(
            request(1, 10),
            |_params| async { Ok(JobHandle("ext-2".to_owned())) },
            |_handle| async {
                Ok(StatusReport::failed(ErrorInfo::with_details(
                    "render rejected",
                    "provider code 1102",
                )))
            },
        )
        .await
        .unwrap();

    let record = wait_terminal(&store, task_id).await;
    assert_eq!(record.state, TaskState::Failed);
    assert_eq!(record.error_infos[0].message, "render rejected");
    assert_eq!(ledger.balance(1).await, 100, "failures never bill");
}

#[tokio::test(start_paused = true)]
async fn submission_error_fails_the_record() {
    let store = Arc::new(MemoryTaskStore::new());
    let ledger = Arc::new(MemoryLedger::new());
    ledger.credit(1, 100).await;
    let orch = orchestrator(&store, &ledger);

    let task_id = orch
        .submit_polled_job(
            request(1, 10),
            |_params| async { Err(CoreError::Transport("dns failure".to_owned())) },
            |_handle| async { Ok(StatusReport::running()) },
        )
        .await
        .unwrap();

    let record = wait_terminal(&store, task_id).await;
    assert_eq!(record.state, TaskState::Failed);
    assert!(record.error_infos[0].message.contains("dns failure"));
    assert_eq!(ledger.balance(1).await, 100);
}

#[tokio::test(start_paused = true)]
async fn streaming_job_completes_and_bills_reported_units() {
    let store = Arc::new(MemoryTaskStore::new());
    let ledger = Arc::new(MemoryLedger::new());
    ledger.credit(1, 50).await;
    let orch = orchestrator(&store, &ledger);

    let (conn, peer) = stream_pair(STREAM_CHANNEL_CAPACITY);
    tokio::spawn(scripted_peer(peer, vec![b"audio-1", b"audio-2"], 14));

    let task_id = orch
        .submit_streaming_job(
            request(1, 20),
            move || async move { Ok(conn) },
            |outcome| async move {
                Ok(vec![json!({ "bytes": outcome.data.len() })])
            },
        )
        .await
        .unwrap();

    let record = wait_terminal(&store, task_id).await;
    assert_eq!(record.state, TaskState::Completed);
    assert_eq!(record.used_points, 14);
    assert_eq!(record.result[0]["bytes"], 14); // "audio-1audio-2"
    assert_eq!(ledger.balance(1).await, 36);
}

#[tokio::test(start_paused = true)]
async fn batch_bills_only_successful_items() {
    let store = Arc::new(MemoryTaskStore::new());
    let ledger = Arc::new(MemoryLedger::new());
    ledger.credit(1, 100).await;
    let orch = orchestrator(&store, &ledger);

    let task_id = orch
        .submit_batch(
            request(1, 30),
            vec![
                json!({ "text": "one", "fail": false }),
                json!({ "text": "two", "fail": true }),
                json!({ "text": "three", "fail": false }),
            ],
            |item| async move {
                if item["fail"].as_bool() == Some(true) {
                    Err(CoreError::Provider {
                        code: None,
                        message: "unsupported voice".to_owned(),
                    })
                } else {
                    Ok(BatchItemOutput {
                        units: item["text"].as_str().map_or(0, |s| s.len() as i64),
                        payload: Some(json!({ "ok": true })),
                    })
                }
            },
        )
        .await
        .unwrap();

    let record = wait_terminal(&store, task_id).await;
    assert_eq!(record.state, TaskState::Completed, "partial failure still completes");
    assert_eq!(record.used_points, 8); // "one" + "three"
    assert_eq!(record.result.len(), 3);
    assert_eq!(record.result[1]["ok"], false);
    assert_eq!(record.error_infos.len(), 1);
    assert_eq!(ledger.balance(1).await, 92, "failed item is never charged");
}

#[tokio::test(start_paused = true)]
async fn batch_fails_only_when_every_item_fails() {
    let store = Arc::new(MemoryTaskStore::new());
    let ledger = Arc::new(MemoryLedger::new());
    ledger.credit(1, 100).await;
    let orch = orchestrator(&store, &ledger);

    let task_id = orch
        .submit_batch(
            request(1, 10),
            vec![json!({}), json!({})],
            |_item| async {
                Err::<BatchItemOutput, _>(CoreError::Provider {
                    code: Some("1001".to_owned()),
                    message: "invalid input".to_owned(),
                })
            },
        )
        .await
        .unwrap();

    let record = wait_terminal(&store, task_id).await;
    assert_eq!(record.state, TaskState::Failed);
    assert_eq!(record.error_infos.len(), 2);
    assert_eq!(ledger.balance(1).await, 100);
}

#[tokio::test]
async fn empty_batch_is_rejected_as_input_error() {
    let store = Arc::new(MemoryTaskStore::new());
    let ledger = Arc::new(MemoryLedger::new());
    let orch = orchestrator(&store, &ledger);

    let err = orch
        .submit_batch(request(1, 0), Vec::new(), |_item| async {
            Ok(BatchItemOutput {
                units: 0,
                payload: None,
            })
        })
        .await
        .expect_err("empty batch");
    assert!(matches!(err, CoreError::Input(_)));
    assert!(store.is_empty().await);
}
