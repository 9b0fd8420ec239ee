use runcast::orchestration::run::{HistoryKind, RunError, RunErrorKind, RunFilter, RunStatus};
use runcast::orchestration::{NewRun, OrchestratorError, RunStore, TransitionDetails};
use serde_json::json;
use tempfile::tempdir;

fn new_run(id: &str, tag: Option<&str>) -> NewRun {
    NewRun {
        id: id.to_string(),
        tag: tag.map(str::to_string),
        spec: json!({"steps": ["a", "b"]}),
        profile_id: None,
    }
}

fn open_store() -> RunStore {
    RunStore::open_in_memory().expect("open store")
}

#[test]
fn created_run_reads_back_as_pending_with_empty_attempt_state() {
    let store = open_store();
    let created = store
        .create_run(new_run("run-1", Some("nightly")), 1_000)
        .expect("create");
    let loaded = store.get_run("run-1").expect("get");

    assert_eq!(created, loaded);
    assert_eq!(loaded.status, RunStatus::Pending);
    assert_eq!(loaded.run_attempt_id, None);
    assert!(loaded.completed_steps.is_empty());
    assert!(loaded.history.is_empty());
    assert_eq!(loaded.percent_complete, 0);
    assert_eq!(loaded.spec, json!({"steps": ["a", "b"]}));
    assert_eq!(loaded.created_at, 1_000);
    assert_eq!(store.get_by_tag("nightly").expect("by tag").id, "run-1");
}

#[test]
fn unknown_run_is_not_found() {
    let store = open_store();
    let err = store.get_run("missing").expect_err("missing run");
    assert!(matches!(err, OrchestratorError::UnknownRun { .. }));
}

#[test]
fn duplicate_id_is_reported_as_existing_run() {
    let store = open_store();
    store.create_run(new_run("run-1", None), 1).expect("create");
    let err = store
        .create_run(new_run("run-1", None), 2)
        .expect_err("duplicate");
    assert!(matches!(err, OrchestratorError::RunExists { .. }));
}

#[test]
fn tag_is_unique_among_non_terminal_runs_and_reusable_after_terminal() {
    let store = open_store();
    store
        .create_run(new_run("run-1", Some("deploy")), 1)
        .expect("create first");
    let err = store
        .create_run(new_run("run-2", Some("deploy")), 2)
        .expect_err("tag conflict");
    assert!(matches!(err, OrchestratorError::TagConflict { ref tag } if tag == "deploy"));

    store
        .transition(
            "run-1",
            RunStatus::Pending,
            RunStatus::Cancelled,
            TransitionDetails::reason("user"),
            3,
        )
        .expect("cancel");
    store
        .create_run(new_run("run-3", Some("deploy")), 4)
        .expect("tag reusable");
    assert_eq!(store.get_by_tag("deploy").expect("by tag").id, "run-3");
}

#[test]
fn start_run_issues_attempt_and_guards_active_and_terminal_runs() {
    let store = open_store();
    store.create_run(new_run("run-1", None), 1).expect("create");

    let started = store
        .start_run("run-1", "att-1", Some("alice"), 10)
        .expect("start");
    assert_eq!(started.status, RunStatus::Running);
    assert_eq!(started.run_attempt_id.as_deref(), Some("att-1"));
    assert_eq!(started.started_at, Some(10));
    assert_eq!(started.history.len(), 1);
    assert_eq!(started.history[0].kind, HistoryKind::Status);
    assert_eq!(started.history[0].payload["status"], "running");
    assert_eq!(started.history[0].payload["actor"], "alice");

    let again = store
        .start_run("run-1", "att-2", None, 11)
        .expect_err("already running");
    assert!(matches!(
        again,
        OrchestratorError::AlreadyRunning {
            status: RunStatus::Running,
            ..
        }
    ));
    assert_eq!(
        store.get_run("run-1").expect("get").run_attempt_id.as_deref(),
        Some("att-1")
    );

    store
        .transition(
            "run-1",
            RunStatus::Running,
            RunStatus::Completed,
            TransitionDetails::default(),
            12,
        )
        .expect("complete");
    let terminal = store
        .start_run("run-1", "att-3", None, 13)
        .expect_err("terminal");
    assert!(matches!(
        terminal,
        OrchestratorError::Terminal {
            status: RunStatus::Completed,
            ..
        }
    ));
}

#[test]
fn mark_step_completed_is_idempotent_and_scoped_to_current_attempt() {
    let store = open_store();
    store.create_run(new_run("run-1", None), 1).expect("create");
    store.start_run("run-1", "att-1", None, 2).expect("start");

    assert!(store
        .mark_step_completed("run-1", "att-1", "a", 3)
        .expect("first mark"));
    assert!(!store
        .mark_step_completed("run-1", "att-1", "a", 4)
        .expect("second mark"));
    assert_eq!(
        store.get_completed_steps("run-1").expect("steps"),
        vec!["a".to_string()]
    );

    let stale = store
        .mark_step_completed("run-1", "att-old", "b", 5)
        .expect_err("stale attempt");
    assert!(matches!(stale, OrchestratorError::StaleAttempt { .. }));

    let step_entries = store
        .get_history("run-1")
        .expect("history")
        .into_iter()
        .filter(|entry| entry.kind == HistoryKind::StepCompleted)
        .collect::<Vec<_>>();
    assert_eq!(step_entries.len(), 1);
    assert_eq!(step_entries[0].payload["step_id"], "a");
    assert_eq!(step_entries[0].payload["attempt_id"], "att-1");
}

#[test]
fn transition_rejects_invalid_edges_and_concurrent_changes() {
    let store = open_store();
    store.create_run(new_run("run-1", None), 1).expect("create");

    let invalid = store
        .transition(
            "run-1",
            RunStatus::Pending,
            RunStatus::Completed,
            TransitionDetails::default(),
            2,
        )
        .expect_err("pending cannot complete");
    assert!(matches!(
        invalid,
        OrchestratorError::InvalidRunTransition {
            from: RunStatus::Pending,
            to: RunStatus::Completed
        }
    ));

    let raced = store
        .transition(
            "run-1",
            RunStatus::Running,
            RunStatus::Stopping,
            TransitionDetails::default(),
            3,
        )
        .expect_err("status is pending");
    assert!(matches!(
        raced,
        OrchestratorError::StatusChanged {
            expected: RunStatus::Running,
            actual: RunStatus::Pending,
            ..
        }
    ));
    assert_eq!(store.get_run("run-1").expect("get").status, RunStatus::Pending);
}

#[test]
fn terminal_transition_records_error_and_completion_time() {
    let store = open_store();
    store.create_run(new_run("run-1", None), 1).expect("create");
    store.start_run("run-1", "att-1", None, 2).expect("start");
    let failed = store
        .transition(
            "run-1",
            RunStatus::Running,
            RunStatus::Failed,
            TransitionDetails::reason("boom")
                .with_error(RunError::new(RunErrorKind::StepFailed, "boom").at_step("b")),
            7,
        )
        .expect("fail");

    assert_eq!(failed.status, RunStatus::Failed);
    assert_eq!(failed.completed_at, Some(7));
    let error = failed.error.expect("error recorded");
    assert_eq!(error.kind, RunErrorKind::StepFailed);
    assert_eq!(error.step_id.as_deref(), Some("b"));
    assert_eq!(error.message, "boom");
}

#[test]
fn set_status_follows_current_status() {
    let store = open_store();
    store.create_run(new_run("run-1", None), 1).expect("create");
    store.start_run("run-1", "att-1", None, 2).expect("start");
    let stopping = store
        .set_status(
            "run-1",
            RunStatus::Stopping,
            TransitionDetails::reason("user").with_cancel_reason("user"),
            3,
        )
        .expect("stopping");
    assert_eq!(stopping.status, RunStatus::Stopping);
    assert_eq!(stopping.cancel_reason.as_deref(), Some("user"));

    let err = store
        .set_status("run-1", RunStatus::Running, TransitionDetails::default(), 4)
        .expect_err("stopping cannot resume");
    assert!(matches!(err, OrchestratorError::InvalidRunTransition { .. }));
}

#[test]
fn progress_is_clamped_monotonic_and_completion_sets_full_percent() {
    let store = open_store();
    store.create_run(new_run("run-1", None), 1).expect("create");
    store.start_run("run-1", "att-1", None, 2).expect("start");

    let first = store
        .update_progress("run-1", "att-1", "build", 40, "compiling", 3)
        .expect("progress 40");
    assert_eq!(first.percent_complete, 40);
    assert!(!first.regressed);

    let lower = store
        .update_progress("run-1", "att-1", "build", 10, "linking", 4)
        .expect("progress 10");
    assert_eq!(lower.percent_complete, 40);
    assert!(lower.regressed);

    let high = store
        .update_progress("run-1", "att-1", "build", 250, "almost", 5)
        .expect("progress 250");
    assert_eq!(high.percent_complete, 99);

    let run = store.get_run("run-1").expect("get");
    assert_eq!(run.percent_complete, 99);
    assert_eq!(run.phase, "build");
    assert_eq!(run.current_action, "almost");

    let stale = store
        .update_progress("run-1", "att-old", "build", 50, "x", 6)
        .expect_err("stale attempt");
    assert!(matches!(stale, OrchestratorError::StaleAttempt { .. }));

    let completed = store
        .transition(
            "run-1",
            RunStatus::Running,
            RunStatus::Completed,
            TransitionDetails::default(),
            7,
        )
        .expect("complete");
    assert_eq!(completed.percent_complete, 100);
}

#[test]
fn recovery_returns_running_to_pending_and_finishes_stopping_runs() {
    let store = open_store();
    for id in ["run-a", "run-b", "run-c", "run-d"] {
        store.create_run(new_run(id, None), 1).expect("create");
    }
    store.start_run("run-a", "att-a", None, 2).expect("start a");
    store
        .mark_step_completed("run-a", "att-a", "a", 3)
        .expect("mark a");
    store.start_run("run-b", "att-b", None, 2).expect("start b");
    store
        .transition(
            "run-b",
            RunStatus::Running,
            RunStatus::Stopping,
            TransitionDetails::reason("user").with_cancel_reason("user"),
            3,
        )
        .expect("stopping b");
    store.start_run("run-c", "att-c", None, 2).expect("start c");
    store
        .transition(
            "run-c",
            RunStatus::Running,
            RunStatus::AwaitingApproval,
            TransitionDetails::default(),
            3,
        )
        .expect("awaiting c");

    let mut recovered = store.recover_interrupted(10).expect("recover");
    recovered.sort_by(|left, right| left.run_id.cmp(&right.run_id));
    let summary = recovered
        .iter()
        .map(|run| (run.run_id.as_str(), run.from, run.to))
        .collect::<Vec<_>>();
    assert_eq!(
        summary,
        vec![
            ("run-a", RunStatus::Running, RunStatus::Pending),
            ("run-b", RunStatus::Stopping, RunStatus::Cancelled),
            ("run-c", RunStatus::AwaitingApproval, RunStatus::Pending),
        ]
    );

    let cancelled = store.get_run("run-b").expect("get b");
    assert_eq!(cancelled.error.expect("error").kind, RunErrorKind::Cancelled);
    assert_eq!(store.get_run("run-d").expect("get d").status, RunStatus::Pending);
    assert!(store.recover_interrupted(11).expect("second pass").is_empty());

    let restarted = store
        .start_run("run-a", "att-a2", None, 12)
        .expect("restart");
    assert!(restarted.completed_steps.is_empty());
}

#[test]
fn list_runs_is_newest_first_and_filters() {
    let store = open_store();
    store.create_run(new_run("run-1", Some("x")), 1).expect("create 1");
    store.create_run(new_run("run-2", None), 2).expect("create 2");
    store.create_run(new_run("run-3", None), 3).expect("create 3");
    store
        .transition(
            "run-2",
            RunStatus::Pending,
            RunStatus::Cancelled,
            TransitionDetails::default(),
            4,
        )
        .expect("cancel 2");

    let ids = |filter: &RunFilter| {
        store
            .list_runs(filter)
            .expect("list")
            .into_iter()
            .map(|run| run.id)
            .collect::<Vec<_>>()
    };
    assert_eq!(ids(&RunFilter::default()), vec!["run-3", "run-2", "run-1"]);
    assert_eq!(ids(&RunFilter::non_terminal()), vec!["run-3", "run-1"]);
    assert_eq!(
        ids(&RunFilter::with_status(RunStatus::Cancelled)),
        vec!["run-2"]
    );
    assert_eq!(
        ids(&RunFilter {
            tag: Some("x".to_string()),
            ..RunFilter::default()
        }),
        vec!["run-1"]
    );
    assert_eq!(
        ids(&RunFilter {
            limit: Some(1),
            ..RunFilter::default()
        }),
        vec!["run-3"]
    );
}

#[test]
fn store_persists_across_reopen() {
    let dir = tempdir().expect("tempdir");
    let db_path = dir.path().join("state/runs.db");
    {
        let store = RunStore::open(&db_path).expect("open");
        store.create_run(new_run("run-1", None), 1).expect("create");
        store.start_run("run-1", "att-1", None, 2).expect("start");
    }
    let reopened = RunStore::open(&db_path).expect("reopen");
    let run = reopened.get_run("run-1").expect("get");
    assert_eq!(run.status, RunStatus::Running);
    assert_eq!(run.run_attempt_id.as_deref(), Some("att-1"));
}
