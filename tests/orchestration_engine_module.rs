use runcast::orchestration::{
    CancelOutcome, EngineConfig, EventBody, EventHub, EventKind, HistoryKind, HubConfig, NewRun,
    OrchestratorError, RunEngine, RunErrorKind, RunRecord, RunStatus, RunStore, SpecStepExecutor,
    StepDescriptor, StepExecutor, StepOutcome, StepReporter, Subscription, SubscriptionFilter,
};
use runcast::shared::SequentialIds;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn test_config() -> EngineConfig {
    EngineConfig {
        max_run_duration: None,
        repository_retry_budget: 2,
        retry_backoff: Duration::from_millis(5),
        approval_poll: Duration::from_millis(10),
    }
}

fn engine_with(executor: Arc<dyn StepExecutor>, config: EngineConfig) -> RunEngine {
    let store = Arc::new(RunStore::open_in_memory().expect("open store"));
    RunEngine::new(store, EventHub::new(HubConfig::default()), executor)
        .with_ids(Arc::new(SequentialIds::new()))
        .with_config(config)
}

fn engine() -> RunEngine {
    engine_with(Arc::new(SpecStepExecutor), test_config())
}

fn create(engine: &RunEngine, id: &str, spec: Value) -> RunRecord {
    engine
        .store()
        .create_run(
            NewRun {
                id: id.to_string(),
                tag: None,
                spec,
                profile_id: None,
            },
            1,
        )
        .expect("create run")
}

fn wait_terminal(engine: &RunEngine, run_id: &str) -> RunRecord {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let run = engine.store().get_run(run_id).expect("get run");
        if run.status.is_terminal() {
            engine.join_worker(run_id);
            return run;
        }
        assert!(Instant::now() < deadline, "run {run_id} did not finish: {run:?}");
        thread::sleep(Duration::from_millis(10));
    }
}

fn wait_for_event(
    subscription: &Subscription,
    mut matches: impl FnMut(&EventBody) -> bool,
) -> EventBody {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if let Ok(event) = subscription.recv_timeout(Duration::from_millis(50)) {
            if matches(&event.body) {
                return event.body.clone();
            }
        }
    }
    panic!("expected event was not published");
}

fn history_kinds(run: &RunRecord) -> Vec<(HistoryKind, String)> {
    run.history
        .iter()
        .map(|entry| {
            let detail = match entry.kind {
                HistoryKind::Status => entry.payload["status"].as_str().unwrap_or("").to_string(),
                HistoryKind::StepCompleted => {
                    entry.payload["step_id"].as_str().unwrap_or("").to_string()
                }
                HistoryKind::Progress => entry.payload["percent"].to_string(),
                HistoryKind::Log => entry.payload["message"].as_str().unwrap_or("").to_string(),
            };
            (entry.kind, detail)
        })
        .collect()
}

/// Delegates planning to `SpecStepExecutor` and records every step it runs.
struct RecordingExecutor {
    executed: Mutex<Vec<String>>,
}

impl RecordingExecutor {
    fn new() -> Self {
        Self {
            executed: Mutex::new(Vec::new()),
        }
    }

    fn executed(&self) -> Vec<String> {
        self.executed.lock().expect("executed lock").clone()
    }
}

impl StepExecutor for RecordingExecutor {
    fn plan(&self, spec: &Value) -> Result<Vec<StepDescriptor>, String> {
        SpecStepExecutor.plan(spec)
    }

    fn run_step(&self, step: &StepDescriptor, reporter: &dyn StepReporter) -> StepOutcome {
        self.executed
            .lock()
            .expect("executed lock")
            .push(step.id.to_string());
        SpecStepExecutor.run_step(step, reporter)
    }
}

#[test]
fn happy_path_completes_with_ordered_history() {
    let engine = engine();
    create(
        &engine,
        "run-1",
        json!({"steps": [{"id": "stepA"}, {"id": "stepB", "percent": 25}]}),
    );

    let started = engine.start("run-1", Some("alice")).expect("start");
    assert_eq!(started.status, RunStatus::Running);
    assert_eq!(started.run_attempt_id.as_deref(), Some("att-1"));

    let run = wait_terminal(&engine, "run-1");
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.percent_complete, 100);
    assert_eq!(run.completed_steps, vec!["stepA", "stepB"]);
    assert!(run.error.is_none());
    assert_eq!(
        history_kinds(&run),
        vec![
            (HistoryKind::Status, "running".to_string()),
            (HistoryKind::StepCompleted, "stepA".to_string()),
            (HistoryKind::Progress, "25".to_string()),
            (HistoryKind::StepCompleted, "stepB".to_string()),
            (HistoryKind::Status, "completed".to_string()),
        ]
    );
}

#[test]
fn run_events_carry_contiguous_sequences_and_end_with_terminal() {
    let engine = engine();
    create(&engine, "run-1", json!({"steps": ["a", {"id": "b", "percent": 50}]}));
    let subscription = engine
        .hub()
        .register(SubscriptionFilter::runs(["run-1"]))
        .expect("subscribe");

    engine.start("run-1", None).expect("start");
    let mut events = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        let Ok(event) = subscription.recv_timeout(Duration::from_millis(50)) else {
            continue;
        };
        if event.kind() == EventKind::Connected {
            continue;
        }
        let terminal = event.kind() == EventKind::Terminal;
        events.push(event);
        if terminal {
            break;
        }
    }
    wait_terminal(&engine, "run-1");

    let sequences = events.iter().map(|event| event.sequence).collect::<Vec<_>>();
    assert_eq!(sequences, (1..=events.len() as u64).collect::<Vec<_>>());
    let kinds = events.iter().map(|event| event.kind()).collect::<Vec<_>>();
    assert_eq!(
        kinds,
        vec![
            EventKind::Status,
            EventKind::StepCompleted,
            EventKind::Progress,
            EventKind::StepCompleted,
            EventKind::Status,
            EventKind::Terminal,
        ]
    );
    match &events[events.len() - 1].body {
        EventBody::Terminal { status, error } => {
            assert_eq!(*status, RunStatus::Completed);
            assert!(error.is_none());
        }
        other => panic!("unexpected terminal body: {other:?}"),
    }
}

#[test]
fn cancel_during_a_step_stops_before_the_next_completion() {
    let engine = engine();
    create(
        &engine,
        "run-1",
        json!({"steps": [{"id": "s1", "sleep_ms": 100}, {"id": "s2", "sleep_ms": 1000}]}),
    );
    let subscription = engine
        .hub()
        .register(SubscriptionFilter::runs(["run-1"]))
        .expect("subscribe");

    engine.start("run-1", None).expect("start");
    wait_for_event(&subscription, |body| {
        matches!(body, EventBody::StepCompleted { step_id, .. } if step_id == "s1")
    });
    let outcome = engine
        .cancel("run-1", "user", Some("alice"))
        .expect("cancel");
    assert_eq!(outcome, CancelOutcome::Stopping);
    assert!(matches!(
        engine.cancel("run-1", "again", None).expect("second cancel"),
        CancelOutcome::AlreadyStopping | CancelOutcome::AlreadyTerminal
    ));

    let run = wait_terminal(&engine, "run-1");
    assert_eq!(run.status, RunStatus::Cancelled);
    let error = run.error.as_ref().expect("cancel error");
    assert_eq!(error.kind, RunErrorKind::Cancelled);
    assert_eq!(error.message, "user");
    assert_eq!(run.completed_steps, vec!["s1"]);
    assert!(!history_kinds(&run).contains(&(HistoryKind::StepCompleted, "s2".to_string())));
    assert_eq!(
        engine.cancel("run-1", "late", None).expect("terminal cancel"),
        CancelOutcome::AlreadyTerminal
    );
}

#[test]
fn cancel_of_pending_run_finalises_immediately() {
    let engine = engine();
    create(&engine, "run-1", json!({"steps": ["a"]}));
    assert_eq!(
        engine.cancel("run-1", "not needed", None).expect("cancel"),
        CancelOutcome::Cancelled
    );
    let run = engine.store().get_run("run-1").expect("get");
    assert_eq!(run.status, RunStatus::Cancelled);
    assert_eq!(run.cancel_reason.as_deref(), Some("not needed"));

    let err = engine.start("run-1", None).expect_err("terminal start");
    assert!(matches!(err, OrchestratorError::Terminal { .. }));
}

#[test]
fn approval_gate_waits_for_decision() {
    let engine = engine();
    create(
        &engine,
        "run-1",
        json!({"steps": [{"id": "review", "approval": true}, "publish"]}),
    );
    let subscription = engine
        .hub()
        .register(SubscriptionFilter::runs(["run-1"]))
        .expect("subscribe");

    let early = engine.approve("run-1", None).expect_err("pending run");
    assert!(matches!(
        early,
        OrchestratorError::InvalidState {
            status: RunStatus::Pending,
            operation: "approve",
            ..
        }
    ));

    engine.start("run-1", None).expect("start");
    let gate = wait_for_event(&subscription, |body| {
        matches!(body, EventBody::AwaitingApproval { .. })
    });
    assert_eq!(
        gate,
        EventBody::AwaitingApproval {
            step_id: "review".to_string()
        }
    );
    assert_eq!(
        engine.store().get_run("run-1").expect("get").status,
        RunStatus::AwaitingApproval
    );

    engine.approve("run-1", Some("bob")).expect("approve");
    let run = wait_terminal(&engine, "run-1");
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.completed_steps, vec!["review", "publish"]);

    let late = engine.approve("run-1", None).expect_err("completed run");
    assert!(matches!(late, OrchestratorError::InvalidState { .. }));
}

#[test]
fn rejection_ends_run_as_rejected() {
    let engine = engine();
    create(
        &engine,
        "run-1",
        json!({"steps": [{"id": "review", "approval": true}, "publish"]}),
    );
    let subscription = engine
        .hub()
        .register(SubscriptionFilter::runs(["run-1"]))
        .expect("subscribe");
    engine.start("run-1", None).expect("start");
    wait_for_event(&subscription, |body| {
        matches!(body, EventBody::AwaitingApproval { .. })
    });

    let rejected = engine
        .reject("run-1", "not today", Some("bob"))
        .expect("reject");
    assert_eq!(rejected.status, RunStatus::Rejected);
    let run = wait_terminal(&engine, "run-1");
    assert_eq!(run.status, RunStatus::Rejected);
    let error = run.error.expect("reject error");
    assert_eq!(error.kind, RunErrorKind::Rejected);
    assert_eq!(error.message, "not today");
    assert_eq!(run.completed_steps, vec!["review"]);
}

#[test]
fn failed_and_fatal_steps_fail_the_run_with_step_context() {
    let engine = engine();
    create(&engine, "run-1", json!({"steps": ["a", {"id": "b", "fail": "disk full"}, "c"]}));
    create(&engine, "run-2", json!({"steps": [{"id": "x", "fatal": "bad input"}]}));
    create(
        &engine,
        "run-3",
        json!({"steps": [{"id": "y", "outcome": "maybe"}]}),
    );
    engine.start("run-1", None).expect("start 1");
    engine.start("run-2", None).expect("start 2");
    engine.start("run-3", None).expect("start 3");

    let failed = wait_terminal(&engine, "run-1");
    assert_eq!(failed.status, RunStatus::Failed);
    let error = failed.error.expect("error");
    assert_eq!(error.kind, RunErrorKind::StepFailed);
    assert_eq!(error.step_id.as_deref(), Some("b"));
    assert_eq!(error.message, "disk full");
    assert_eq!(failed.completed_steps, vec!["a"]);

    let fatal = wait_terminal(&engine, "run-2");
    assert_eq!(fatal.error.expect("error").kind, RunErrorKind::Fatal);

    let unknown = wait_terminal(&engine, "run-3");
    let error = unknown.error.expect("error");
    assert_eq!(error.kind, RunErrorKind::StepFailed);
    assert!(error.message.contains("maybe"));
}

#[test]
fn invalid_spec_fails_without_running_steps() {
    let recorder = Arc::new(RecordingExecutor::new());
    let engine = engine_with(recorder.clone(), test_config());
    create(&engine, "run-1", json!({"steps": ["a", "a"]}));
    engine.start("run-1", None).expect("start");

    let run = wait_terminal(&engine, "run-1");
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error.expect("error").kind, RunErrorKind::Fatal);
    assert!(recorder.executed().is_empty());
}

#[test]
fn restart_after_recovery_reruns_steps_under_a_new_attempt() {
    let recorder = Arc::new(RecordingExecutor::new());
    let engine = engine_with(recorder.clone(), test_config());
    create(&engine, "run-1", json!({"steps": ["s1", "s2", "s3"]}));

    let store = engine.store();
    store
        .start_run("run-1", "att-old", None, 2)
        .expect("crashed attempt");
    store
        .mark_step_completed("run-1", "att-old", "s1", 3)
        .expect("mark s1");
    let recovered = store.recover_interrupted(4).expect("recover");
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].to, RunStatus::Pending);

    let restarted = engine.start("run-1", None).expect("restart");
    assert_ne!(restarted.run_attempt_id.as_deref(), Some("att-old"));
    assert!(restarted.completed_steps.is_empty());

    let run = wait_terminal(&engine, "run-1");
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(recorder.executed(), vec!["s1", "s2", "s3"]);
    assert_eq!(run.completed_steps, vec!["s1", "s2", "s3"]);
}

#[test]
fn run_exceeding_max_duration_is_cancelled_with_timeout() {
    let engine = engine_with(
        Arc::new(SpecStepExecutor),
        EngineConfig {
            max_run_duration: Some(Duration::from_millis(100)),
            ..test_config()
        },
    );
    create(
        &engine,
        "run-1",
        json!({"steps": [{"id": "review", "approval": true}]}),
    );
    engine.start("run-1", None).expect("start");

    let run = wait_terminal(&engine, "run-1");
    assert_eq!(run.status, RunStatus::Cancelled);
    let error = run.error.expect("timeout error");
    assert_eq!(error.kind, RunErrorKind::Cancelled);
    assert_eq!(error.message, "timeout");
}

#[test]
fn progress_regression_is_logged_and_not_applied() {
    let engine = engine();
    create(
        &engine,
        "run-1",
        json!({"steps": [{"id": "a", "percent": 60}, {"id": "b", "percent": 30}]}),
    );
    engine.start("run-1", None).expect("start");
    let run = wait_terminal(&engine, "run-1");

    let progress = run
        .history
        .iter()
        .filter(|entry| entry.kind == HistoryKind::Progress)
        .map(|entry| entry.payload["percent"].as_i64().unwrap_or(-1))
        .collect::<Vec<_>>();
    assert_eq!(progress, vec![60, 60]);
    assert!(run.history.iter().any(|entry| entry.kind == HistoryKind::Log
        && entry.payload["message"]
            .as_str()
            .is_some_and(|message| message.contains("regressed"))));
}

#[test]
fn concurrent_starts_admit_exactly_one_attempt() {
    let engine = engine();
    create(
        &engine,
        "run-1",
        json!({"steps": [{"id": "a", "sleep_ms": 50}]}),
    );
    let handles = (0..8)
        .map(|_| {
            let engine = engine.clone();
            thread::spawn(move || engine.start("run-1", None))
        })
        .collect::<Vec<_>>();
    let results = handles
        .into_iter()
        .map(|handle| handle.join().expect("join"))
        .collect::<Vec<_>>();

    let started = results.iter().filter(|result| result.is_ok()).count();
    assert_eq!(started, 1);
    assert!(results.iter().all(|result| match result {
        Ok(_) => true,
        Err(err) => matches!(
            err,
            OrchestratorError::AlreadyRunning { .. } | OrchestratorError::Terminal { .. }
        ),
    }));
    assert_eq!(wait_terminal(&engine, "run-1").status, RunStatus::Completed);
}

#[test]
fn abandoned_attempt_releases_its_worker_and_event_numbering() {
    let engine = engine();
    create(
        &engine,
        "run-1",
        json!({"steps": [{"id": "a", "sleep_ms": 200}, "b"]}),
    );
    engine.start("run-1", None).expect("start");
    // another process recovers the run while this worker is mid-step
    engine.store().recover_interrupted(5).expect("recover");

    let deadline = Instant::now() + Duration::from_secs(10);
    while !engine.active_run_ids().is_empty() {
        assert!(Instant::now() < deadline, "worker did not abandon the run");
        thread::sleep(Duration::from_millis(10));
    }
    assert!(!engine.join_worker("run-1"));
    assert_eq!(
        engine.store().get_run("run-1").expect("get").status,
        RunStatus::Pending
    );

    let subscription = engine
        .hub()
        .register(SubscriptionFilter::runs(["run-1"]))
        .expect("subscribe");
    engine
        .emitter()
        .emit(
            "run-1",
            EventBody::Log {
                level: "info".to_string(),
                message: "after abandon".to_string(),
            },
        )
        .expect("emit");
    let event = loop {
        let event = subscription
            .recv_timeout(Duration::from_secs(5))
            .expect("event");
        if event.kind() != EventKind::Connected {
            break event;
        }
    };
    assert_eq!(event.sequence, 1);
}

#[test]
fn cancel_racing_a_start_is_announced_after_running() {
    let engine = engine();
    let subscription = engine
        .hub()
        .register(SubscriptionFilter::all())
        .expect("subscribe");

    for index in 0..20 {
        let run_id = format!("run-{index}");
        create(&engine, &run_id, json!({"steps": [{"id": "a", "sleep_ms": 20}]}));
        let canceller = {
            let engine = engine.clone();
            let run_id = run_id.clone();
            thread::spawn(move || {
                while engine
                    .store()
                    .get_run(&run_id)
                    .is_ok_and(|run| run.status == RunStatus::Pending)
                {}
                engine.cancel(&run_id, "race", None).expect("cancel");
            })
        };
        engine.start(&run_id, None).expect("start");
        canceller.join().expect("canceller");
        wait_terminal(&engine, &run_id);
    }

    let mut expected = std::collections::HashMap::new();
    while let Ok(Some(event)) = subscription.try_recv() {
        let (Some(run_id), EventBody::Status { status, previous, .. }) =
            (event.run_id.clone(), &event.body)
        else {
            continue;
        };
        let last = expected.entry(run_id.clone()).or_insert(RunStatus::Pending);
        assert_eq!(*previous, Some(*last), "{run_id} announced {status:?} out of order");
        *last = *status;
    }
    assert_eq!(expected.len(), 20);
}
