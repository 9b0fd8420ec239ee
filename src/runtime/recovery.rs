use crate::orchestration::error::OrchestratorError;
use crate::orchestration::run_store::{RecoveredRun, RunStore};
use crate::shared::clock::Clock;
use crate::shared::logging::Logger;

/// Returns runs stranded by a dead process to a restartable state.
///
/// Must run before any worker is started in this process: every run found in
/// an active status is assumed to have lost its worker.
pub fn recover_interrupted_runs(
    store: &RunStore,
    clock: &dyn Clock,
    logger: &Logger,
) -> Result<Vec<RecoveredRun>, OrchestratorError> {
    let recovered = store.recover_interrupted(clock.now_millis())?;
    for run in &recovered {
        logger.warn(
            "runtime.recovery.run",
            format!("run={} from={} to={}", run.run_id, run.from, run.to),
        );
    }
    if !recovered.is_empty() {
        logger.info(
            "runtime.recovery.completed",
            format!("recovered={}", recovered.len()),
        );
    }
    Ok(recovered)
}
