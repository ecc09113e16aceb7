use std::sync::Arc;
use std::time::Duration;

use taskhub::providers::fs::FsHistoryStore;
use taskhub::providers::in_memory::InMemoryHistoryStore;
use taskhub::providers::{HistoryStore, QueueKind, StoreError, WorkItem};
use taskhub::runtime::registry::{ActivityRegistry, ActivityRegistryBuilder};
use taskhub::runtime::{self, RuntimeStatus};
use taskhub::{run_turn, Action, Event, LogLevel, OrchestrationContext, OrchestrationRegistry};

mod common;

// 1) Single-turn emission: exactly one action per scheduled future and a
// matching schedule event recorded.
#[test]
fn action_emission_single_turn() {
    let orchestrator = |ctx: OrchestrationContext| async move {
        let _ = ctx.schedule_activity("A", "1").into_activity().await;
        unreachable!()
    };

    let history: Vec<Event> = Vec::new();
    let (hist_after, actions, _logs, out) = run_turn::<String, _>(history, orchestrator);
    assert!(out.is_none(), "must not complete in first turn");
    assert_eq!(actions.len(), 1, "exactly one action expected");
    match &actions[0] {
        Action::CallActivity { name, input, .. } => {
            assert_eq!(name, "A");
            assert_eq!(input, "1");
        }
        _ => panic!("unexpected action kind"),
    }
    assert!(matches!(hist_after[0], Event::TaskScheduled { .. }));
}

// 2) Correlation: out-of-order completion in history still resolves the
// correct future by id.
#[test]
fn correlation_out_of_order_completion() {
    let history = vec![
        Event::TaskScheduled {
            id: 1,
            name: "A".into(),
            input: "1".into(),
        },
        Event::TimerCreated { id: 42, fire_at_ms: 0 },
        Event::TaskCompleted {
            id: 1,
            result: "ok".into(),
        },
    ];

    let orchestrator = |ctx: OrchestrationContext| async move { ctx.schedule_activity("A", "1").into_activity().await };

    let (_hist_after, actions, _logs, out) = run_turn(history, orchestrator);
    assert!(
        actions.is_empty(),
        "should resolve from existing completion, no new actions"
    );
    assert_eq!(out.unwrap(), Ok("ok".to_string()));
}

// 3) Deterministic replay on a tiny flow (activity only)
#[tokio::test]
async fn deterministic_replay_activity_only() {
    let orchestrator = |ctx: OrchestrationContext| async move {
        let a = ctx.schedule_activity("A", "2").into_activity().await.unwrap();
        format!("a={a}")
    };

    let activity_registry = ActivityRegistry::builder()
        .register("A", |input: String| async move {
            Ok(input.parse::<i32>().unwrap_or(0).saturating_add(1).to_string())
        })
        .build();

    let orchestration_registry = OrchestrationRegistry::builder()
        .register("TestOrchestration", move |ctx, _input| async move {
            Ok(orchestrator(ctx).await)
        })
        .build();

    let store = Arc::new(InMemoryHistoryStore::default()) as Arc<dyn HistoryStore>;
    let rt = runtime::Runtime::start_with_store(store.clone(), Arc::new(activity_registry), orchestration_registry)
        .await;
    rt.start_orchestration("inst-unit-1", "TestOrchestration", "")
        .await
        .unwrap();
    let status = rt
        .wait_for_orchestration("inst-unit-1", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(status.output.as_deref(), Some("a=3"));

    // Replay must produce the same output and no new actions
    let final_history = store.read("inst-unit-1").await;
    let (_h2, acts2, _logs2, out2) = run_turn(final_history, orchestrator);
    assert!(acts2.is_empty());
    assert_eq!(out2.unwrap(), "a=3");
    rt.shutdown().await;
}

// 4) HistoryStore admin APIs (filesystem)
#[tokio::test]
async fn history_store_admin_apis() {
    let tmp = tempfile::tempdir().unwrap();
    let store = FsHistoryStore::new(tmp.path(), true);
    store.create_instance("i1").await.unwrap();
    store.create_instance("i2").await.unwrap();
    store
        .append("i1", vec![Event::TimerCreated { id: 1, fire_at_ms: 10 }], 0)
        .await
        .unwrap();
    store
        .append(
            "i2",
            vec![Event::EventSubscribed {
                id: 1,
                name: "Go".into(),
            }],
            0,
        )
        .await
        .unwrap();
    let instances = store.list_instances().await;
    assert!(instances.contains(&"i1".into()) && instances.contains(&"i2".into()));
    let dump = store.dump_all_pretty().await;
    assert!(dump.contains("i1") && dump.contains("i2"));
    store.reset().await;
    assert!(store.list_instances().await.is_empty());
}

#[tokio::test]
async fn providers_create_remove_and_duplicate_checks() {
    let mem = InMemoryHistoryStore::default();
    mem.create_instance("dup").await.unwrap();
    assert!(matches!(
        mem.create_instance("dup").await,
        Err(StoreError::InstanceAlreadyExists(_))
    ));
    assert!(mem.append("missing", vec![], 0).await.is_err());
    mem.remove_instance("dup").await.unwrap();
    assert!(matches!(
        mem.remove_instance("dup").await,
        Err(StoreError::InstanceNotFound(_))
    ));

    let tmp = tempfile::tempdir().unwrap();
    let fs = FsHistoryStore::new(tmp.path(), true);
    fs.create_instance("i1").await.unwrap();
    assert!(matches!(
        fs.create_instance("i1").await,
        Err(StoreError::InstanceAlreadyExists(_))
    ));
    assert!(fs.append("missing", vec![], 0).await.is_err());
    fs.remove_instance("i1").await.unwrap();
    assert!(fs.remove_instance("i1").await.is_err());
}

// Conditional append: a writer holding a stale version must lose.
#[tokio::test]
async fn append_with_stale_version_conflicts() {
    let mem = InMemoryHistoryStore::default();
    mem.create_instance("occ").await.unwrap();

    let (hist, version) = mem.read_with_version("occ").await;
    assert!(hist.is_empty());
    assert_eq!(version, 0);

    // First writer wins
    let v1 = mem
        .append(
            "occ",
            vec![Event::ExecutionStarted {
                name: "O".into(),
                input: "".into(),
                parent_instance: None,
                parent_id: None,
            }],
            version,
        )
        .await
        .unwrap();
    assert_eq!(v1, 1);

    // Second writer with the same (now stale) version must conflict
    let err = mem
        .append(
            "occ",
            vec![Event::TimerCreated { id: 1, fire_at_ms: 5 }],
            version,
        )
        .await
        .unwrap_err();
    match err {
        StoreError::VersionConflict { expected, actual } => {
            assert_eq!(expected, 0);
            assert_eq!(actual, 1);
        }
        other => panic!("expected VersionConflict, got {other}"),
    }
    assert!(err.is_retryable());

    // Re-read and retry with the fresh version succeeds
    let (_hist, v) = mem.read_with_version("occ").await;
    let v2 = mem
        .append("occ", vec![Event::TimerCreated { id: 1, fire_at_ms: 5 }], v)
        .await
        .unwrap();
    assert_eq!(v2, 2);
}

// Two writers racing on the filesystem provider with the same stale
// version: exactly one append may land, the other must conflict.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fs_concurrent_appends_admit_exactly_one_writer() {
    let tmp = tempfile::tempdir().unwrap();
    let store = FsHistoryStore::new(tmp.path(), true);
    store.create_instance("occ-fs").await.unwrap();

    let (_hist, version) = store.read_with_version("occ-fs").await;
    let a = store.clone();
    let b = store.clone();
    let (ra, rb) = tokio::join!(
        a.append("occ-fs", vec![Event::TimerCreated { id: 1, fire_at_ms: 5 }], version),
        b.append("occ-fs", vec![Event::TimerCreated { id: 2, fire_at_ms: 9 }], version),
    );

    let oks = [&ra, &rb].iter().filter(|r| r.is_ok()).count();
    assert_eq!(oks, 1, "one writer wins: {ra:?} / {rb:?}");
    let loser = if ra.is_err() { ra.unwrap_err() } else { rb.unwrap_err() };
    assert!(matches!(
        loser,
        StoreError::VersionConflict { expected: 0, actual: 1 }
    ));
    let hist = store.read("occ-fs").await;
    assert_eq!(hist.len(), 1);
}

// Concurrent enqueues rewrite the same queue file; none may be lost.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fs_concurrent_enqueues_lose_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let store = FsHistoryStore::new(tmp.path(), true);
    let mut handles = Vec::new();
    for i in 0..16u64 {
        let s = store.clone();
        handles.push(tokio::spawn(async move {
            s.enqueue_work(
                QueueKind::Timer,
                WorkItem::TimerFired {
                    instance: format!("i-{i}"),
                    execution_id: 1,
                    id: i,
                    fire_at_ms: 0,
                },
            )
            .await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    let mut seen = 0;
    while let Some((_, token)) = store.dequeue_peek_lock(QueueKind::Timer).await {
        store.ack(QueueKind::Timer, &token).await.unwrap();
        seen += 1;
    }
    assert_eq!(seen, 16);
}

#[tokio::test]
async fn orchestration_status_apis() {
    let activity_registry = ActivityRegistry::builder().build();
    let orchestration_registry = OrchestrationRegistry::builder()
        .register("ShortTimer", |ctx, _| async move {
            ctx.schedule_timer(10).into_timer().await;
            Ok("ok".to_string())
        })
        .register("AlwaysFails", |_ctx, _| async move { Err("boom".to_string()) })
        .build();

    let rt = runtime::Runtime::start(Arc::new(activity_registry), orchestration_registry).await;

    // Unknown instance has no status
    assert!(rt.get_status("no-such").await.is_none());

    let inst_running = "inst-status-running";
    rt.start_orchestration(inst_running, "ShortTimer", "").await.unwrap();
    let s1 = rt.get_status(inst_running).await.unwrap();
    assert!(!s1.runtime_status.is_terminal());

    let s2 = rt
        .wait_for_orchestration(inst_running, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(s2.runtime_status, RuntimeStatus::Completed);
    assert_eq!(s2.output.as_deref(), Some("ok"));
    assert_eq!(s2.orchestration, "ShortTimer");

    let inst_fail = "inst-status-fail";
    rt.start_orchestration(inst_fail, "AlwaysFails", "").await.unwrap();
    let s3 = rt
        .wait_for_orchestration(inst_fail, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(s3.runtime_status, RuntimeStatus::Failed);
    assert_eq!(s3.error.as_deref(), Some("boom"));

    rt.shutdown().await;
}

// Providers: filesystem multi-execution persistence and latest read() contract
#[tokio::test]
async fn providers_fs_multi_execution_persistence_and_latest_read() {
    let tmp = tempfile::tempdir().unwrap();
    let fs = FsHistoryStore::new(tmp.path(), true);

    fs.create_instance("pfs").await.unwrap();
    fs.append(
        "pfs",
        vec![
            Event::ExecutionStarted {
                name: "O".into(),
                input: "0".into(),
                parent_instance: None,
                parent_id: None,
            },
            Event::ContinuedAsNew { input: "1".into() },
        ],
        0,
    )
    .await
    .unwrap();
    let e1_before = fs.read_with_execution("pfs", 1).await;

    let eid2 = fs.start_new_execution("pfs", "O", "1", None, None).await.unwrap();
    assert_eq!(eid2, 2);
    let (_h, v2) = fs.read_with_version("pfs").await;
    fs.append("pfs", vec![Event::ExecutionCompleted { output: "ok".into() }], v2)
        .await
        .unwrap();

    let execs = fs.list_executions("pfs").await;
    assert_eq!(execs, vec![1, 2]);
    assert_eq!(fs.latest_execution_id("pfs").await, Some(2));

    // Older execution history remains unchanged
    let e1_after = fs.read_with_execution("pfs", 1).await;
    assert_eq!(e1_before, e1_after);

    // Latest read() equals latest execution history
    let latest_hist = fs.read_with_execution("pfs", 2).await;
    let current_hist = fs.read("pfs").await;
    assert_eq!(current_hist, latest_hist);
    assert!(matches!(current_hist[0], Event::ExecutionStarted { .. }));
}

// Providers: in-memory multi-execution persistence and latest read() contract
#[tokio::test]
async fn providers_inmem_multi_execution_persistence_and_latest_read() {
    let mem = InMemoryHistoryStore::default();

    mem.create_instance("pmem").await.unwrap();
    mem.append(
        "pmem",
        vec![
            Event::ExecutionStarted {
                name: "O".into(),
                input: "0".into(),
                parent_instance: None,
                parent_id: None,
            },
            Event::ContinuedAsNew { input: "1".into() },
        ],
        0,
    )
    .await
    .unwrap();
    let e1_before = mem.read_with_execution("pmem", 1).await;

    let eid2 = mem.start_new_execution("pmem", "O", "1", None, None).await.unwrap();
    assert_eq!(eid2, 2);
    let (_h, v2) = mem.read_with_version("pmem").await;
    mem.append("pmem", vec![Event::ExecutionCompleted { output: "ok".into() }], v2)
        .await
        .unwrap();

    let execs = mem.list_executions("pmem").await;
    assert_eq!(execs, vec![1, 2]);

    let e1_after = mem.read_with_execution("pmem", 1).await;
    assert_eq!(e1_before, e1_after);

    let latest_hist = mem.read_with_execution("pmem", 2).await;
    let current_hist = mem.read("pmem").await;
    assert_eq!(current_hist, latest_hist);
}

// Queue contract: peek-lock hides an item until ack/abandon or expiry.
#[tokio::test]
async fn queue_peek_lock_ack_and_abandon() {
    use taskhub::providers::{QueueKind, WorkItem};

    let mem = InMemoryHistoryStore::default();
    let item = WorkItem::ExternalRaised {
        instance: "q1".into(),
        name: "Go".into(),
        payload: "p".into(),
    };
    mem.enqueue_work(QueueKind::Orchestrator, item.clone()).await.unwrap();

    let (got, token) = mem.dequeue_peek_lock(QueueKind::Orchestrator).await.unwrap();
    assert_eq!(got, item);
    // Locked: nothing else visible
    assert!(mem.dequeue_peek_lock(QueueKind::Orchestrator).await.is_none());

    // Abandon returns it to the queue
    mem.abandon(QueueKind::Orchestrator, &token).await.unwrap();
    let (got2, token2) = mem.dequeue_peek_lock(QueueKind::Orchestrator).await.unwrap();
    assert_eq!(got2, item);

    // Ack removes it permanently
    mem.ack(QueueKind::Orchestrator, &token2).await.unwrap();
    assert!(mem.dequeue_peek_lock(QueueKind::Orchestrator).await.is_none());
}

// Delayed visibility: enqueue_work_at hides the item until its deadline.
#[tokio::test]
async fn queue_delayed_visibility() {
    use taskhub::providers::{QueueKind, WorkItem};

    let mem = InMemoryHistoryStore::default();
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64;
    let item = WorkItem::TimerFired {
        instance: "t1".into(),
        execution_id: 1,
        id: 1,
        fire_at_ms: now + 40,
    };
    mem.enqueue_work_at(QueueKind::Timer, item.clone(), now + 40).await.unwrap();

    assert!(mem.dequeue_peek_lock(QueueKind::Timer).await.is_none());
    tokio::time::sleep(Duration::from_millis(60)).await;
    let (got, _token) = mem.dequeue_peek_lock(QueueKind::Timer).await.unwrap();
    assert_eq!(got, item);
}

// Registration is validated at build time: duplicate names are rejected,
// and an existing registry can be extended under the same rules.
#[test]
fn registry_builders_validate_duplicates_and_extend() {
    let base = ActivityRegistry::builder()
        .register("A", |input: String| async move { Ok(input) })
        .build();
    assert!(base.list_activity_names().contains(&"A".to_string()));

    let dup = ActivityRegistryBuilder::from_registry(&base)
        .register("A", |input: String| async move { Ok(input) })
        .build_result();
    assert!(dup.is_err(), "duplicate activity name must fail at build");

    let extended = ActivityRegistryBuilder::from_registry(&base)
        .register("B", |input: String| async move { Ok(input) })
        .build_result()
        .unwrap();
    assert!(extended.get("A").is_some());
    assert!(extended.get("B").is_some());

    let orch_dup = OrchestrationRegistry::builder()
        .register("O", |_ctx: OrchestrationContext, _input: String| async move {
            Ok(String::new())
        })
        .register("O", |_ctx: OrchestrationContext, _input: String| async move {
            Ok(String::new())
        })
        .build_result();
    assert!(orch_dup.is_err(), "duplicate orchestration name must fail at build");

    let named = OrchestrationRegistry::builder()
        .register("O", |_ctx: OrchestrationContext, _input: String| async move {
            Ok(String::new())
        })
        .build();
    assert_eq!(named.list_orchestration_names(), vec!["O".to_string()]);
}

// Buffered orchestrator logs come back with the turn result, and the
// replay-gated macros stay silent until the pass makes fresh progress.
#[test]
fn turn_logs_are_buffered_per_pass() {
    let orchestrator = |ctx: OrchestrationContext| async move {
        // Gated off: no decision recorded yet on this poll
        taskhub::durable_info!(ctx, "pre-decision line");
        ctx.push_log(LogLevel::Info, "scheduling A".to_string());
        let _ = ctx.schedule_activity("A", "1").into_activity().await;
        unreachable!("suspends on A")
    };

    let (_hist, actions, logs, out) = run_turn::<String, _>(Vec::new(), orchestrator);
    assert!(out.is_none());
    assert_eq!(actions.len(), 1);
    assert_eq!(logs, vec![(LogLevel::Info, "scheduling A".to_string())]);
}
