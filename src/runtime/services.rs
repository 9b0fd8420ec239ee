use super::{bootstrap_state_root, RuntimeError, StatePaths};
use crate::config::Settings;
use crate::orchestration::{
    EngineConfig, EventHub, HubConfig, Orchestrator, RunEngine, RunStore, SpecStepExecutor,
};
use crate::profiles::ProfileStore;
use crate::shared::clock::{Clock, SystemClock};
use crate::shared::logging::Logger;
use std::sync::Arc;

/// Wires the repository, hub, engine and profile registry for one process.
pub fn open_orchestrator(
    paths: &StatePaths,
    settings: &Settings,
) -> Result<Orchestrator, RuntimeError> {
    bootstrap_state_root(paths)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let logger = Logger::to_file(paths.runtime_log_path()).with_clock(Arc::clone(&clock));

    let store = RunStore::open(&paths.runs_db_path())?;
    let hub = EventHub::with_parts(
        HubConfig::from(&settings.hub),
        Arc::clone(&clock),
        logger.clone(),
    );
    let engine = RunEngine::new(Arc::new(store), hub, Arc::new(SpecStepExecutor))
        .with_clock(Arc::clone(&clock))
        .with_logger(logger.clone())
        .with_config(EngineConfig::from(&settings.engine));
    let profiles = ProfileStore::new(paths.profiles_dir())
        .with_clock(clock)
        .with_logger(logger);

    Ok(Orchestrator::new(engine).with_profiles(Arc::new(profiles)))
}
