pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod facade;
pub mod hub;
pub mod requests;
pub mod run;
pub mod run_store;

pub use engine::{CancelOutcome, EngineConfig, RunEngine};
pub use error::OrchestratorError;
pub use events::{decode_frame, encode_frame, ControlMessage, EventBody, EventKind, RunEvent};
pub use executor::{SpecStepExecutor, StepDescriptor, StepExecutor, StepOutcome, StepReporter};
pub use facade::Orchestrator;
pub use hub::{
    EventHub, EvictionReason, HubConfig, HubError, Subscription, SubscriptionError,
    SubscriptionFilter, SubscriptionHandle,
};
pub use requests::{
    CreateRunRequest, Principal, RejectRunRequest, RequestContext, StopRunRequest,
};
pub use run::{HistoryEntry, HistoryKind, RunError, RunErrorKind, RunFilter, RunRecord, RunStatus};
pub use run_store::{NewRun, RecoveredRun, RunStore, TransitionDetails};
