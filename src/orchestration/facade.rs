use crate::orchestration::engine::{CancelOutcome, RunEngine};
use crate::orchestration::error::OrchestratorError;
use crate::orchestration::events::EventBody;
use crate::orchestration::hub::{EventHub, HubError, Subscription, SubscriptionFilter};
use crate::orchestration::requests::{
    validate_reason, CreateRunRequest, RejectRunRequest, RequestContext, StopRunRequest,
};
use crate::orchestration::run::{HistoryEntry, RunFilter, RunRecord};
use crate::orchestration::run_store::{NewRun, RecoveredRun};
use crate::profiles::{ProfileError, ProfileStore};
use crate::runtime::recovery::recover_interrupted_runs;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const CREATE_ID_ATTEMPTS: usize = 5;
const WAIT_POLL: Duration = Duration::from_millis(20);

/// Entry point for callers: every request goes through the engine, the
/// repository or the hub from here.
#[derive(Clone, Debug)]
pub struct Orchestrator {
    engine: RunEngine,
    profiles: Option<Arc<ProfileStore>>,
}

impl Orchestrator {
    pub fn new(engine: RunEngine) -> Self {
        Self {
            engine,
            profiles: None,
        }
    }

    pub fn with_profiles(mut self, profiles: Arc<ProfileStore>) -> Self {
        self.profiles = Some(profiles);
        self
    }

    pub fn engine(&self) -> &RunEngine {
        &self.engine
    }

    pub fn hub(&self) -> &EventHub {
        self.engine.hub()
    }

    pub fn profiles(&self) -> Option<&Arc<ProfileStore>> {
        self.profiles.as_ref()
    }

    /// Persists a pending run. The caller decides when to start it.
    pub fn create_run(
        &self,
        ctx: &RequestContext,
        request: CreateRunRequest,
    ) -> Result<RunRecord, OrchestratorError> {
        request.validate()?;
        let profile_id = match request.profile_id.as_ref() {
            Some(profile_id) => {
                self.require_profile(profile_id.as_str())?;
                Some(profile_id.to_string())
            }
            None => None,
        };

        let store = self.engine.store();
        let mut last_error = None;
        for _ in 0..CREATE_ID_ATTEMPTS {
            let run_id = self
                .engine
                .ids()
                .next_id("run")
                .map_err(OrchestratorError::Internal)?;
            let created = store.create_run(
                NewRun {
                    id: run_id,
                    tag: request.tag.clone(),
                    spec: request.spec.clone(),
                    profile_id: profile_id.clone(),
                },
                self.engine.clock().now_millis(),
            );
            match created {
                Ok(run) => {
                    self.engine.logger().info(
                        "facade.run.created",
                        format!(
                            "run={} actor={} request={}",
                            run.id,
                            ctx.actor(),
                            ctx.request_id
                        ),
                    );
                    return Ok(run);
                }
                Err(err @ OrchestratorError::RunExists { .. }) => last_error = Some(err),
                Err(err) => return Err(err),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            OrchestratorError::Internal("could not allocate a run id".to_string())
        }))
    }

    pub fn start(&self, ctx: &RequestContext, run_id: &str) -> Result<RunRecord, OrchestratorError> {
        let run = self.engine.start(run_id, Some(ctx.actor()))?;
        if let (Some(profiles), Some(profile_id)) = (self.profiles.as_ref(), run.profile_id.as_ref()) {
            if let Err(err) = profiles.touch(profile_id) {
                self.engine.logger().warn(
                    "facade.profile.touch_failed",
                    format!("run={run_id} profile={profile_id} error={err}"),
                );
            }
        }
        Ok(run)
    }

    pub fn stop(
        &self,
        ctx: &RequestContext,
        run_id: &str,
        reason: &str,
    ) -> Result<CancelOutcome, OrchestratorError> {
        validate_reason(reason)?;
        self.engine.cancel(run_id, reason, Some(ctx.actor()))
    }

    pub fn stop_request(
        &self,
        ctx: &RequestContext,
        request: &StopRunRequest,
    ) -> Result<CancelOutcome, OrchestratorError> {
        self.stop(ctx, &request.run_id, &request.reason)
    }

    /// Cancels every non-terminal run. Runs that finish concurrently are
    /// reported as already terminal.
    pub fn stop_all(
        &self,
        ctx: &RequestContext,
        reason: &str,
    ) -> Result<Vec<(String, CancelOutcome)>, OrchestratorError> {
        validate_reason(reason)?;
        let runs = self.engine.store().list_runs(&RunFilter::non_terminal())?;
        let mut outcomes = Vec::with_capacity(runs.len());
        for run in runs {
            match self.engine.cancel(&run.id, reason, Some(ctx.actor())) {
                Ok(outcome) => outcomes.push((run.id, outcome)),
                Err(OrchestratorError::UnknownRun { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(outcomes)
    }

    pub fn approve(&self, ctx: &RequestContext, run_id: &str) -> Result<RunRecord, OrchestratorError> {
        self.engine.approve(run_id, Some(ctx.actor()))
    }

    pub fn reject(
        &self,
        ctx: &RequestContext,
        run_id: &str,
        reason: &str,
    ) -> Result<RunRecord, OrchestratorError> {
        validate_reason(reason)?;
        self.engine.reject(run_id, reason, Some(ctx.actor()))
    }

    pub fn reject_request(
        &self,
        ctx: &RequestContext,
        request: &RejectRunRequest,
    ) -> Result<RunRecord, OrchestratorError> {
        self.reject(ctx, &request.run_id, &request.reason)
    }

    pub fn subscribe(&self, filter: SubscriptionFilter) -> Result<Subscription, HubError> {
        self.engine.hub().register(filter)
    }

    pub fn get_run(&self, run_id: &str) -> Result<RunRecord, OrchestratorError> {
        self.engine.store().get_run(run_id)
    }

    pub fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunRecord>, OrchestratorError> {
        self.engine.store().list_runs(filter)
    }

    pub fn get_history(&self, run_id: &str) -> Result<Vec<HistoryEntry>, OrchestratorError> {
        self.engine.store().get_history(run_id)
    }

    pub fn get_run_by_tag(&self, tag: &str) -> Result<RunRecord, OrchestratorError> {
        self.engine.store().get_by_tag(tag)
    }

    /// Startup recovery; publishes a status event per recovered run.
    pub fn recover_interrupted_runs(
        &self,
        ctx: &RequestContext,
    ) -> Result<Vec<RecoveredRun>, OrchestratorError> {
        let recovered = recover_interrupted_runs(
            self.engine.store(),
            self.engine.clock().as_ref(),
            self.engine.logger(),
        )?;
        for run in &recovered {
            let _ = self.engine.emitter().emit(
                &run.run_id,
                EventBody::Status {
                    status: run.to,
                    previous: Some(run.from),
                    reason: Some(format!("recovered by {}", ctx.actor())),
                },
            );
            if run.to.is_terminal() {
                self.engine.emitter().forget(&run.run_id);
            }
        }
        Ok(recovered)
    }

    /// Blocks until the run is terminal or `timeout` elapses, returning the
    /// latest record either way.
    pub fn wait_for_run(&self, run_id: &str, timeout: Duration) -> Result<RunRecord, OrchestratorError> {
        let deadline = Instant::now() + timeout;
        loop {
            let run = self.get_run(run_id)?;
            if run.status.is_terminal() || Instant::now() >= deadline {
                return Ok(run);
            }
            thread::sleep(WAIT_POLL);
        }
    }

    pub fn join_worker(&self, run_id: &str) -> bool {
        self.engine.join_worker(run_id)
    }

    fn require_profile(&self, profile_id: &str) -> Result<(), OrchestratorError> {
        let Some(profiles) = self.profiles.as_ref() else {
            return Ok(());
        };
        match profiles.get(profile_id) {
            Ok(_) => Ok(()),
            Err(ProfileError::NotFound { .. }) => Err(OrchestratorError::UnknownProfile {
                profile_id: profile_id.to_string(),
            }),
            Err(err) => Err(err.into()),
        }
    }
}
