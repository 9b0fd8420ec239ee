pub mod daemon;
pub mod error;
pub mod event_client;
pub mod event_server;
pub mod recovery;
pub mod services;
pub mod start_requests;
pub mod state_paths;
pub(crate) mod worker_primitives;

pub use daemon::{load_daemon_state, save_daemon_state, serve, signal_stop, DaemonState};
pub use error::RuntimeError;
pub use event_client::{watch_events, WatchOptions};
pub use event_server::EventServer;
pub use recovery::recover_interrupted_runs;
pub use services::open_orchestrator;
pub use start_requests::{drain_start_requests, enqueue_start_request, StartRequest};
pub use state_paths::{bootstrap_state_root, StatePaths};
