pub mod handlers;
pub mod identity;
pub mod runner;
pub mod supervisor;

// Re-export commonly used types
pub use handlers::{handler_by_name, BatchHandler, CHECKPOINT_ONLY, STORE_EVENTS};
pub use identity::RunIdentity;
pub use runner::{load_runner_config, IndexerRunner, RunnerConfig};
pub use supervisor::{EventFilter, WorkerHandle, WorkerOptions, WorkerSettings, WorkerSupervisor};
