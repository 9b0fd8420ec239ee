use crate::config::EngineSettings;
use crate::orchestration::error::OrchestratorError;
use crate::orchestration::events::{EventBody, RunEventEmitter};
use crate::orchestration::executor::{StepDescriptor, StepExecutor, StepOutcome, StepReporter};
use crate::orchestration::hub::EventHub;
use crate::orchestration::run::{
    HistoryEntry, HistoryKind, RunError, RunErrorKind, RunRecord, RunStatus,
};
use crate::orchestration::run_store::{RunStore, TransitionDetails};
use crate::shared::clock::{Clock, SystemClock};
use crate::shared::errors::ErrorKind;
use crate::shared::ids::{IdGenerator, RandomIds};
use crate::shared::logging::{LogLevel, Logger};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const MAX_CAS_RETRIES: usize = 5;
const ENGINE_ACTOR: &str = "engine";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub max_run_duration: Option<Duration>,
    pub repository_retry_budget: u32,
    pub retry_backoff: Duration,
    pub approval_poll: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&EngineSettings::default())
    }
}

impl From<&EngineSettings> for EngineConfig {
    fn from(settings: &EngineSettings) -> Self {
        Self {
            max_run_duration: settings.max_run_duration(),
            repository_retry_budget: settings.repository_retry_budget,
            retry_backoff: Duration::from_millis(settings.retry_backoff_ms),
            approval_poll: Duration::from_millis(settings.approval_poll_ms.max(1)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// A pending run was finalised immediately.
    Cancelled,
    /// The run is now stopping; its worker finalises it.
    Stopping,
    AlreadyStopping,
    AlreadyTerminal,
}

#[derive(Default)]
struct SignalState {
    cancel: Option<String>,
    generation: u64,
}

/// Wake-up channel between control calls and one attempt's worker.
#[derive(Default)]
struct RunSignal {
    state: Mutex<SignalState>,
    wake: Condvar,
}

impl RunSignal {
    fn lock(&self) -> MutexGuard<'_, SignalState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn request_cancel(&self, reason: &str) {
        let mut state = self.lock();
        if state.cancel.is_none() {
            state.cancel = Some(reason.to_string());
        }
        state.generation += 1;
        self.wake.notify_all();
    }

    fn notify(&self) {
        self.lock().generation += 1;
        self.wake.notify_all();
    }

    fn cancel_reason(&self) -> Option<String> {
        self.lock().cancel.clone()
    }

    fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Waits until notified after `seen` or until `timeout` elapses.
    fn wait_since(&self, seen: u64, timeout: Duration) {
        let guard = self.lock();
        let _ = self
            .wake
            .wait_timeout_while(guard, timeout, |state| {
                state.generation == seen && state.cancel.is_none()
            })
            .unwrap_or_else(|poisoned| poisoned.into_inner());
    }
}

enum Boundary {
    Continue,
    Stop(String),
    /// Another attempt or a control call owns the run now.
    Abandon,
}

enum Gate {
    Approved,
    Stop(String),
    Abandon,
}

/// Drives runs from pending to a terminal status on worker threads.
#[derive(Clone)]
pub struct RunEngine {
    store: Arc<RunStore>,
    emitter: RunEventEmitter,
    executor: Arc<dyn StepExecutor>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    logger: Logger,
    config: EngineConfig,
    signals: Arc<Mutex<HashMap<String, Arc<RunSignal>>>>,
    workers: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
    /// Held from a status commit until its events are published, so local
    /// subscribers see transitions in commit order.
    transitions: Arc<Mutex<()>>,
}

impl std::fmt::Debug for RunEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunEngine")
            .field("store", &self.store)
            .field("config", &self.config)
            .finish()
    }
}

impl RunEngine {
    pub fn new(store: Arc<RunStore>, hub: EventHub, executor: Arc<dyn StepExecutor>) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self {
            store,
            emitter: RunEventEmitter::new(hub, Arc::clone(&clock)),
            executor,
            clock,
            ids: Arc::new(RandomIds),
            logger: Logger::disabled(),
            config: EngineConfig::default(),
            signals: Arc::new(Mutex::new(HashMap::new())),
            workers: Arc::new(Mutex::new(HashMap::new())),
            transitions: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.emitter = RunEventEmitter::new(self.emitter.hub().clone(), Arc::clone(&clock));
        self.clock = clock;
        self
    }

    pub fn with_ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(&self) -> &Arc<RunStore> {
        &self.store
    }

    pub fn hub(&self) -> &EventHub {
        self.emitter.hub()
    }

    pub fn emitter(&self) -> &RunEventEmitter {
        &self.emitter
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn ids(&self) -> &Arc<dyn IdGenerator> {
        &self.ids
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    /// Moves a pending run to running under a fresh attempt and spawns its
    /// worker. Returns once the worker is spawned.
    pub fn start(&self, run_id: &str, actor: Option<&str>) -> Result<RunRecord, OrchestratorError> {
        let attempt_id = self
            .ids
            .next_id("att")
            .map_err(OrchestratorError::Internal)?;
        let signal = Arc::new(RunSignal::default());
        let run = {
            let _order = self.lock_transitions();
            let run = self.persist(|| {
                self.store
                    .start_run(run_id, &attempt_id, actor, self.clock.now_millis())
            })?;
            self.lock_signals()
                .insert(run_id.to_string(), Arc::clone(&signal));
            self.emit(
                run_id,
                EventBody::Status {
                    status: RunStatus::Running,
                    previous: Some(RunStatus::Pending),
                    reason: None,
                },
            );
            run
        };
        self.logger.info(
            "engine.attempt.started",
            format!("run={run_id} attempt={attempt_id}"),
        );

        let engine = self.clone();
        let worker_run_id = run_id.to_string();
        let worker_attempt_id = attempt_id.clone();
        let spawned = thread::Builder::new()
            .name(format!("runcast-run-{run_id}"))
            .spawn(move || engine.run_attempt(&worker_run_id, &worker_attempt_id, signal));
        match spawned {
            Ok(handle) => {
                let mut workers = self.lock_workers();
                workers.retain(|_, handle| !handle.is_finished());
                workers.insert(run_id.to_string(), handle);
                Ok(run)
            }
            Err(source) => {
                let ctx = self.attempt_context(run_id, &attempt_id, Arc::new(RunSignal::default()));
                self.finish_failed(
                    &ctx,
                    RunError::new(RunErrorKind::EngineError, format!("worker spawn failed: {source}")),
                );
                Err(OrchestratorError::WorkerSpawn {
                    run_id: run_id.to_string(),
                    source,
                })
            }
        }
    }

    /// Requests cancellation. Idempotent on stopping and terminal runs.
    pub fn cancel(
        &self,
        run_id: &str,
        reason: &str,
        actor: Option<&str>,
    ) -> Result<CancelOutcome, OrchestratorError> {
        for _ in 0..MAX_CAS_RETRIES {
            let run = self.store.get_run(run_id)?;
            let details = TransitionDetails::reason(reason).with_cancel_reason(reason);
            let details = match actor {
                Some(actor) => details.with_actor(actor),
                None => details,
            };
            match run.status {
                status if status.is_terminal() => return Ok(CancelOutcome::AlreadyTerminal),
                RunStatus::Stopping => return Ok(CancelOutcome::AlreadyStopping),
                RunStatus::Pending => {
                    let error = RunError::new(RunErrorKind::Cancelled, reason);
                    let _order = self.lock_transitions();
                    let moved = self.store.transition(
                        run_id,
                        RunStatus::Pending,
                        RunStatus::Cancelled,
                        details.with_error(error.clone()),
                        self.clock.now_millis(),
                    );
                    match moved {
                        Ok(_) => {
                            self.emit_terminal(run_id, RunStatus::Pending, RunStatus::Cancelled, Some(reason), Some(error));
                            self.logger
                                .info("engine.run.cancelled", format!("run={run_id} reason={reason}"));
                            return Ok(CancelOutcome::Cancelled);
                        }
                        Err(OrchestratorError::StatusChanged { .. }) => continue,
                        Err(err) => return Err(err),
                    }
                }
                from => {
                    let _order = self.lock_transitions();
                    let moved = self.store.transition(
                        run_id,
                        from,
                        RunStatus::Stopping,
                        details,
                        self.clock.now_millis(),
                    );
                    match moved {
                        Ok(_) => {
                            self.emit(
                                run_id,
                                EventBody::Status {
                                    status: RunStatus::Stopping,
                                    previous: Some(from),
                                    reason: Some(reason.to_string()),
                                },
                            );
                            if let Some(signal) = self.signal_for(run_id) {
                                signal.request_cancel(reason);
                            }
                            self.logger
                                .info("engine.run.stopping", format!("run={run_id} reason={reason}"));
                            return Ok(CancelOutcome::Stopping);
                        }
                        Err(OrchestratorError::StatusChanged { .. }) => continue,
                        Err(err) => return Err(err),
                    }
                }
            }
        }
        Err(OrchestratorError::Internal(format!(
            "cancel of `{run_id}` did not converge"
        )))
    }

    pub fn approve(&self, run_id: &str, actor: Option<&str>) -> Result<RunRecord, OrchestratorError> {
        let mut details = TransitionDetails::reason("approved");
        if let Some(actor) = actor {
            details = details.with_actor(actor);
        }
        let run = {
            let _order = self.lock_transitions();
            let run = self.decide(run_id, RunStatus::Running, details, "approve")?;
            self.emit(
                run_id,
                EventBody::Status {
                    status: RunStatus::Running,
                    previous: Some(RunStatus::AwaitingApproval),
                    reason: Some("approved".to_string()),
                },
            );
            run
        };
        if let Some(signal) = self.signal_for(run_id) {
            signal.notify();
        }
        self.logger.info("engine.run.approved", format!("run={run_id}"));
        Ok(run)
    }

    pub fn reject(
        &self,
        run_id: &str,
        reason: &str,
        actor: Option<&str>,
    ) -> Result<RunRecord, OrchestratorError> {
        let error = RunError::new(RunErrorKind::Rejected, reason);
        let mut details = TransitionDetails::reason(reason).with_error(error.clone());
        if let Some(actor) = actor {
            details = details.with_actor(actor);
        }
        let run = {
            let _order = self.lock_transitions();
            let run = self.decide(run_id, RunStatus::Rejected, details, "reject")?;
            self.emit_terminal(
                run_id,
                RunStatus::AwaitingApproval,
                RunStatus::Rejected,
                Some(reason),
                Some(error),
            );
            run
        };
        if let Some(signal) = self.signal_for(run_id) {
            signal.notify();
        }
        self.logger
            .info("engine.run.rejected", format!("run={run_id} reason={reason}"));
        Ok(run)
    }

    /// Waits for the local worker of `run_id` to exit. Returns `false` when no
    /// worker was spawned by this engine or its finished handle was already
    /// pruned.
    pub fn join_worker(&self, run_id: &str) -> bool {
        let handle = self.lock_workers().remove(run_id);
        match handle {
            Some(handle) => {
                let _ = handle.join();
                true
            }
            None => false,
        }
    }

    pub fn join_all(&self) {
        let handles = self.lock_workers().drain().collect::<Vec<_>>();
        for (_, handle) in handles {
            let _ = handle.join();
        }
    }

    pub fn active_workers(&self) -> usize {
        self.active_run_ids().len()
    }

    /// Runs whose worker thread in this process has not exited yet.
    pub fn active_run_ids(&self) -> Vec<String> {
        let mut workers = self.lock_workers();
        workers.retain(|_, handle| !handle.is_finished());
        let mut ids = workers.keys().cloned().collect::<Vec<_>>();
        drop(workers);
        ids.sort();
        ids
    }

    fn decide(
        &self,
        run_id: &str,
        to: RunStatus,
        details: TransitionDetails,
        operation: &'static str,
    ) -> Result<RunRecord, OrchestratorError> {
        let run = self.store.get_run(run_id)?;
        if run.status != RunStatus::AwaitingApproval {
            return Err(OrchestratorError::InvalidState {
                run_id: run_id.to_string(),
                status: run.status,
                operation,
            });
        }
        match self.store.transition(
            run_id,
            RunStatus::AwaitingApproval,
            to,
            details,
            self.clock.now_millis(),
        ) {
            Err(OrchestratorError::StatusChanged { actual, .. }) => {
                Err(OrchestratorError::InvalidState {
                    run_id: run_id.to_string(),
                    status: actual,
                    operation,
                })
            }
            other => other,
        }
    }

    fn run_attempt(&self, run_id: &str, attempt_id: &str, signal: Arc<RunSignal>) {
        let ctx = self.attempt_context(run_id, attempt_id, Arc::clone(&signal));
        if let Err(err) = self.drive_attempt(&ctx) {
            self.logger.error(
                "engine.attempt.error",
                format!("run={run_id} attempt={attempt_id} error={err}"),
            );
            self.finish_failed(&ctx, RunError::new(RunErrorKind::EngineError, err.to_string()));
        }

        let mut signals = self.lock_signals();
        if signals
            .get(run_id)
            .is_some_and(|current| Arc::ptr_eq(current, &signal))
        {
            signals.remove(run_id);
        }
        // finished or abandoned; a newer local attempt keeps the numbering
        if !signals.contains_key(run_id) {
            self.emitter.forget(run_id);
        }
        drop(signals);
        self.logger.info(
            "engine.attempt.finished",
            format!("run={run_id} attempt={attempt_id}"),
        );
    }

    fn attempt_context(&self, run_id: &str, attempt_id: &str, signal: Arc<RunSignal>) -> AttemptContext {
        let deadline = self.config.max_run_duration.map(|limit| {
            self.clock
                .now_millis()
                .saturating_add(i64::try_from(limit.as_millis()).unwrap_or(i64::MAX))
        });
        AttemptContext {
            engine: self.clone(),
            run_id: run_id.to_string(),
            attempt_id: attempt_id.to_string(),
            signal,
            deadline,
            fault: Mutex::new(None),
        }
    }

    fn drive_attempt(&self, ctx: &AttemptContext) -> Result<(), OrchestratorError> {
        let run = self.persist(|| self.store.get_run(&ctx.run_id))?;
        if run.run_attempt_id.as_deref() != Some(ctx.attempt_id.as_str()) {
            self.logger.warn(
                "engine.attempt.superseded",
                format!("run={} attempt={}", ctx.run_id, ctx.attempt_id),
            );
            return Ok(());
        }

        let steps = match self.executor.plan(&run.spec) {
            Ok(steps) => steps,
            Err(message) => {
                self.finish_failed(
                    ctx,
                    RunError::new(RunErrorKind::Fatal, format!("invalid run spec: {message}")),
                );
                return Ok(());
            }
        };
        if let Some(duplicate) = first_duplicate(&steps) {
            self.finish_failed(
                ctx,
                RunError::new(RunErrorKind::Fatal, format!("duplicate step id `{duplicate}`"))
                    .at_step(duplicate),
            );
            return Ok(());
        }

        let completed = self
            .persist(|| self.store.get_completed_steps(&ctx.run_id))?
            .into_iter()
            .collect::<HashSet<_>>();

        for step in &steps {
            match self.boundary(ctx)? {
                Boundary::Continue => {}
                Boundary::Stop(reason) => return self.settle_cancelled(ctx, &reason),
                Boundary::Abandon => return Ok(()),
            }
            if completed.contains(step.id.as_str()) {
                continue;
            }

            self.logger.debug(
                "engine.step.started",
                format!("run={} step={}", ctx.run_id, step.id),
            );
            let outcome = self.executor.run_step(step, ctx);
            if let Some(fault) = ctx.take_fault() {
                return Err(fault);
            }

            match outcome {
                StepOutcome::Ok | StepOutcome::OkWithApprovalRequired => {
                    match self.persist(|| {
                        self.store.mark_step_completed(
                            &ctx.run_id,
                            &ctx.attempt_id,
                            step.id.as_str(),
                            self.clock.now_millis(),
                        )
                    }) {
                        Ok(true) => self.emit(
                            &ctx.run_id,
                            EventBody::StepCompleted {
                                step_id: step.id.to_string(),
                                attempt_id: ctx.attempt_id.clone(),
                            },
                        ),
                        Ok(false) => {}
                        Err(OrchestratorError::StaleAttempt { .. }) => return Ok(()),
                        Err(err) => return Err(err),
                    }
                    if outcome == StepOutcome::OkWithApprovalRequired {
                        match self.await_approval(ctx, step)? {
                            Gate::Approved => {}
                            Gate::Stop(reason) => return self.settle_cancelled(ctx, &reason),
                            Gate::Abandon => return Ok(()),
                        }
                    }
                }
                StepOutcome::Failed(message) => {
                    return self.handle_step_failure(ctx, step, message, false)
                }
                StepOutcome::Fatal(message) => {
                    return self.handle_step_failure(ctx, step, message, true)
                }
            }
        }

        match self.boundary(ctx)? {
            Boundary::Continue => self.finish_completed(ctx),
            Boundary::Stop(reason) => self.settle_cancelled(ctx, &reason),
            Boundary::Abandon => Ok(()),
        }
    }

    fn handle_step_failure(
        &self,
        ctx: &AttemptContext,
        step: &StepDescriptor,
        message: String,
        fatal: bool,
    ) -> Result<(), OrchestratorError> {
        match self.boundary(ctx)? {
            Boundary::Stop(reason) => return self.settle_cancelled(ctx, &reason),
            Boundary::Abandon => return Ok(()),
            Boundary::Continue => {}
        }
        let kind = if fatal {
            RunErrorKind::Fatal
        } else {
            RunErrorKind::StepFailed
        };
        self.logger.warn(
            "engine.step.failed",
            format!("run={} step={} error={message}", ctx.run_id, step.id),
        );
        self.finish_failed(ctx, RunError::new(kind, message).at_step(step.id.as_str()));
        Ok(())
    }

    /// Cooperative suspension point between steps.
    fn boundary(&self, ctx: &AttemptContext) -> Result<Boundary, OrchestratorError> {
        if let Some(reason) = ctx.signal.cancel_reason() {
            return Ok(Boundary::Stop(reason));
        }
        if ctx.deadline_passed() {
            return self.expire(ctx);
        }
        let run = self.persist(|| self.store.get_run(&ctx.run_id))?;
        if run.run_attempt_id.as_deref() != Some(ctx.attempt_id.as_str()) {
            return Ok(Boundary::Abandon);
        }
        Ok(match run.status {
            RunStatus::Running => Boundary::Continue,
            RunStatus::Stopping => Boundary::Stop(
                run.cancel_reason
                    .unwrap_or_else(|| "cancelled".to_string()),
            ),
            _ => Boundary::Abandon,
        })
    }

    fn expire(&self, ctx: &AttemptContext) -> Result<Boundary, OrchestratorError> {
        self.logger.warn(
            "engine.run.timeout",
            format!("run={} attempt={}", ctx.run_id, ctx.attempt_id),
        );
        match self.cancel(&ctx.run_id, "timeout", Some(ENGINE_ACTOR))? {
            CancelOutcome::AlreadyTerminal => Ok(Boundary::Abandon),
            _ => {
                let reason = self
                    .store
                    .get_run(&ctx.run_id)?
                    .cancel_reason
                    .unwrap_or_else(|| "timeout".to_string());
                Ok(Boundary::Stop(reason))
            }
        }
    }

    fn await_approval(
        &self,
        ctx: &AttemptContext,
        step: &StepDescriptor,
    ) -> Result<Gate, OrchestratorError> {
        let details = TransitionDetails::reason(format!("approval required after `{}`", step.id))
            .with_actor(ENGINE_ACTOR);
        {
            let _order = self.lock_transitions();
            match self.persist(|| {
                self.store.transition(
                    &ctx.run_id,
                    RunStatus::Running,
                    RunStatus::AwaitingApproval,
                    details.clone(),
                    self.clock.now_millis(),
                )
            }) {
                Ok(_) => {}
                Err(OrchestratorError::StatusChanged { actual, .. }) => {
                    return Ok(match actual {
                        RunStatus::Stopping => Gate::Stop(self.stored_cancel_reason(ctx)?),
                        _ => Gate::Abandon,
                    });
                }
                Err(err) => return Err(err),
            }
            self.emit(
                &ctx.run_id,
                EventBody::Status {
                    status: RunStatus::AwaitingApproval,
                    previous: Some(RunStatus::Running),
                    reason: None,
                },
            );
            self.emit(
                &ctx.run_id,
                EventBody::AwaitingApproval {
                    step_id: step.id.to_string(),
                },
            );
        }
        self.logger.info(
            "engine.approval.waiting",
            format!("run={} step={}", ctx.run_id, step.id),
        );

        loop {
            if let Some(reason) = ctx.signal.cancel_reason() {
                return Ok(Gate::Stop(reason));
            }
            let seen = ctx.signal.generation();
            let run = self.persist(|| self.store.get_run(&ctx.run_id))?;
            if run.run_attempt_id.as_deref() != Some(ctx.attempt_id.as_str()) {
                return Ok(Gate::Abandon);
            }
            match run.status {
                RunStatus::Running => return Ok(Gate::Approved),
                RunStatus::AwaitingApproval => {}
                RunStatus::Stopping => {
                    return Ok(Gate::Stop(
                        run.cancel_reason
                            .unwrap_or_else(|| "cancelled".to_string()),
                    ))
                }
                _ => return Ok(Gate::Abandon),
            }
            if ctx.deadline_passed() {
                return Ok(match self.expire(ctx)? {
                    Boundary::Stop(reason) => Gate::Stop(reason),
                    _ => Gate::Abandon,
                });
            }
            ctx.signal.wait_since(seen, self.config.approval_poll);
        }
    }

    fn stored_cancel_reason(&self, ctx: &AttemptContext) -> Result<String, OrchestratorError> {
        Ok(self
            .store
            .get_run(&ctx.run_id)?
            .cancel_reason
            .unwrap_or_else(|| "cancelled".to_string()))
    }

    fn finish_completed(&self, ctx: &AttemptContext) -> Result<(), OrchestratorError> {
        let moved = {
            let _order = self.lock_transitions();
            let moved = self.persist(|| {
                self.store.transition(
                    &ctx.run_id,
                    RunStatus::Running,
                    RunStatus::Completed,
                    TransitionDetails::default().with_actor(ENGINE_ACTOR),
                    self.clock.now_millis(),
                )
            });
            if moved.is_ok() {
                self.emit_terminal(&ctx.run_id, RunStatus::Running, RunStatus::Completed, None, None);
            }
            moved
        };
        match moved {
            Ok(_) => {
                self.logger
                    .info("engine.run.completed", format!("run={}", ctx.run_id));
                Ok(())
            }
            Err(OrchestratorError::StatusChanged {
                actual: RunStatus::Stopping,
                ..
            }) => {
                let reason = self.stored_cancel_reason(ctx)?;
                self.settle_cancelled(ctx, &reason)
            }
            Err(OrchestratorError::StatusChanged { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Finalises a stopping run as cancelled, moving it to stopping first if a
    /// local signal or deadline got ahead of the stored status.
    fn settle_cancelled(&self, ctx: &AttemptContext, reason: &str) -> Result<(), OrchestratorError> {
        let error = RunError::new(RunErrorKind::Cancelled, reason);
        for _ in 0..MAX_CAS_RETRIES {
            let run = self.persist(|| self.store.get_run(&ctx.run_id))?;
            if run.run_attempt_id.as_deref() != Some(ctx.attempt_id.as_str()) {
                return Ok(());
            }
            match run.status {
                RunStatus::Stopping => {
                    let details = TransitionDetails::reason(reason)
                        .with_actor(ENGINE_ACTOR)
                        .with_error(error.clone());
                    let _order = self.lock_transitions();
                    match self.store.transition(
                        &ctx.run_id,
                        RunStatus::Stopping,
                        RunStatus::Cancelled,
                        details,
                        self.clock.now_millis(),
                    ) {
                        Ok(_) => {
                            self.emit_terminal(
                                &ctx.run_id,
                                RunStatus::Stopping,
                                RunStatus::Cancelled,
                                Some(reason),
                                Some(error),
                            );
                            self.logger.info(
                                "engine.run.cancelled",
                                format!("run={} reason={reason}", ctx.run_id),
                            );
                            return Ok(());
                        }
                        Err(OrchestratorError::StatusChanged { .. }) => continue,
                        Err(err) => return Err(err),
                    }
                }
                RunStatus::Running | RunStatus::AwaitingApproval => {
                    self.cancel(&ctx.run_id, reason, Some(ENGINE_ACTOR))?;
                }
                _ => return Ok(()),
            }
        }
        Err(OrchestratorError::Internal(format!(
            "cancellation of `{}` did not settle",
            ctx.run_id
        )))
    }

    /// Best-effort terminal failure; never returns an error because it is the
    /// last resort of the attempt.
    fn finish_failed(&self, ctx: &AttemptContext, error: RunError) {
        for _ in 0..MAX_CAS_RETRIES {
            let run = match self.persist(|| self.store.get_run(&ctx.run_id)) {
                Ok(run) => run,
                Err(err) => {
                    self.logger.error(
                        "engine.run.fail_unrecorded",
                        format!("run={} error={err}", ctx.run_id),
                    );
                    return;
                }
            };
            if run.run_attempt_id.as_deref() != Some(ctx.attempt_id.as_str()) {
                return;
            }
            let from = match run.status {
                RunStatus::Running | RunStatus::Stopping => run.status,
                RunStatus::AwaitingApproval => {
                    let _order = self.lock_transitions();
                    if self
                        .store
                        .transition(
                            &ctx.run_id,
                            RunStatus::AwaitingApproval,
                            RunStatus::Stopping,
                            TransitionDetails::reason(error.message.clone())
                                .with_actor(ENGINE_ACTOR),
                            self.clock.now_millis(),
                        )
                        .is_ok()
                    {
                        self.emit(
                            &ctx.run_id,
                            EventBody::Status {
                                status: RunStatus::Stopping,
                                previous: Some(RunStatus::AwaitingApproval),
                                reason: Some(error.message.clone()),
                            },
                        );
                    }
                    continue;
                }
                _ => return,
            };
            let details = TransitionDetails::reason(error.message.clone())
                .with_actor(ENGINE_ACTOR)
                .with_error(error.clone());
            let _order = self.lock_transitions();
            match self.store.transition(
                &ctx.run_id,
                from,
                RunStatus::Failed,
                details,
                self.clock.now_millis(),
            ) {
                Ok(_) => {
                    self.emit_terminal(
                        &ctx.run_id,
                        from,
                        RunStatus::Failed,
                        Some(error.message.as_str()),
                        Some(error.clone()),
                    );
                    self.logger.warn(
                        "engine.run.failed",
                        format!(
                            "run={} kind={} error={}",
                            ctx.run_id,
                            error.kind.as_str(),
                            error.message
                        ),
                    );
                    return;
                }
                Err(OrchestratorError::StatusChanged { .. }) => continue,
                Err(err) => {
                    self.logger.error(
                        "engine.run.fail_unrecorded",
                        format!("run={} error={err}", ctx.run_id),
                    );
                    return;
                }
            }
        }
    }

    /// Bounded retry of repository writes; only transient errors are retried.
    fn persist<T>(
        &self,
        mut op: impl FnMut() -> Result<T, OrchestratorError>,
    ) -> Result<T, OrchestratorError> {
        let mut attempt = 0;
        loop {
            match op() {
                Err(err)
                    if err.kind() == ErrorKind::Transient
                        && attempt < self.config.repository_retry_budget =>
                {
                    attempt += 1;
                    self.logger.warn(
                        "engine.repository.retry",
                        format!("attempt={attempt} error={err}"),
                    );
                    thread::sleep(self.config.retry_backoff * attempt);
                }
                other => return other,
            }
        }
    }

    fn emit(&self, run_id: &str, body: EventBody) {
        if let Err(err) = self.emitter.emit(run_id, body) {
            self.logger
                .debug("engine.event.dropped", format!("run={run_id} error={err}"));
        }
    }

    fn emit_terminal(
        &self,
        run_id: &str,
        previous: RunStatus,
        status: RunStatus,
        reason: Option<&str>,
        error: Option<RunError>,
    ) {
        self.emit(
            run_id,
            EventBody::Status {
                status,
                previous: Some(previous),
                reason: reason.map(str::to_string),
            },
        );
        self.emit(run_id, EventBody::Terminal { status, error });
        if self.signal_for(run_id).is_none() {
            self.emitter.forget(run_id);
        }
    }

    fn signal_for(&self, run_id: &str) -> Option<Arc<RunSignal>> {
        self.lock_signals().get(run_id).cloned()
    }

    fn lock_signals(&self) -> MutexGuard<'_, HashMap<String, Arc<RunSignal>>> {
        self.signals
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_transitions(&self) -> MutexGuard<'_, ()> {
        self.transitions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_workers(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn first_duplicate(steps: &[StepDescriptor]) -> Option<String> {
    let mut seen = HashSet::new();
    steps
        .iter()
        .find(|step| !seen.insert(step.id.as_str()))
        .map(|step| step.id.to_string())
}

/// Per-attempt state handed to the executor as its `StepReporter`.
struct AttemptContext {
    engine: RunEngine,
    run_id: String,
    attempt_id: String,
    signal: Arc<RunSignal>,
    deadline: Option<i64>,
    fault: Mutex<Option<OrchestratorError>>,
}

impl AttemptContext {
    fn deadline_passed(&self) -> bool {
        self.deadline
            .is_some_and(|deadline| self.engine.clock.now_millis() >= deadline)
    }

    fn interrupted(&self) -> bool {
        self.signal.cancel_reason().is_some() || self.deadline_passed()
    }

    fn stored_stopping(&self) -> bool {
        self.engine
            .store
            .get_run(&self.run_id)
            .is_ok_and(|run| run.status == RunStatus::Stopping)
    }

    fn record_fault(&self, err: OrchestratorError) {
        let mut fault = self
            .fault
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if fault.is_none() {
            *fault = Some(err);
        }
    }

    fn take_fault(&self) -> Option<OrchestratorError> {
        self.fault
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

impl StepReporter for AttemptContext {
    fn run_id(&self) -> &str {
        &self.run_id
    }

    fn attempt_id(&self) -> &str {
        &self.attempt_id
    }

    fn report_progress(&self, phase: &str, percent: i64, current_action: &str) {
        let engine = &self.engine;
        let update = engine.persist(|| {
            engine.store.update_progress(
                &self.run_id,
                &self.attempt_id,
                phase,
                percent,
                current_action,
                engine.clock.now_millis(),
            )
        });
        match update {
            Ok(update) => {
                if update.regressed {
                    let message = format!(
                        "progress regressed to {percent}, holding at {}",
                        update.percent_complete
                    );
                    engine.logger.warn(
                        "engine.progress.regressed",
                        format!("run={} {message}", self.run_id),
                    );
                    let entry = HistoryEntry::new(
                        engine.clock.now_millis(),
                        HistoryKind::Log,
                        json!({ "level": "warn", "message": message }),
                    );
                    if let Err(err) = engine.persist(|| engine.store.append_history(&self.run_id, &entry)) {
                        self.record_fault(err);
                    }
                }
                engine.emit(
                    &self.run_id,
                    EventBody::Progress {
                        phase: phase.to_string(),
                        percent: update.percent_complete,
                        current_action: current_action.to_string(),
                    },
                );
            }
            Err(OrchestratorError::StaleAttempt { .. }) => {}
            Err(err) => self.record_fault(err),
        }
    }

    fn report_transient(&self, message: &str) {
        let engine = &self.engine;
        let entry = HistoryEntry::new(
            engine.clock.now_millis(),
            HistoryKind::Log,
            json!({ "level": "warn", "message": message, "transient": true }),
        );
        if let Err(err) = engine.persist(|| engine.store.append_history(&self.run_id, &entry)) {
            self.record_fault(err);
            return;
        }
        engine.logger.warn(
            "engine.step.transient",
            format!("run={} {message}", self.run_id),
        );
        engine.emit(
            &self.run_id,
            EventBody::Log {
                level: LogLevel::Warn.as_str().to_string(),
                message: message.to_string(),
            },
        );
    }

    fn log(&self, level: LogLevel, message: &str) {
        self.engine.logger.log(
            level,
            "engine.step.log",
            &format!("run={} {message}", self.run_id),
        );
        self.engine.emit(
            &self.run_id,
            EventBody::Log {
                level: level.as_str().to_string(),
                message: message.to_string(),
            },
        );
    }

    fn is_cancelled(&self) -> bool {
        self.interrupted()
    }

    fn sleep(&self, duration: Duration) -> bool {
        let end = Instant::now() + duration;
        let poll = self.engine.config.approval_poll;
        loop {
            if self.interrupted() || self.stored_stopping() {
                return false;
            }
            let now = Instant::now();
            if now >= end {
                return true;
            }
            let seen = self.signal.generation();
            self.signal.wait_since(seen, (end - now).min(poll));
        }
    }
}
