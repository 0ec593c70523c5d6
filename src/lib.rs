pub mod backend;
pub mod config;
pub mod error;
pub mod help;
pub mod kill;
pub mod ledger;
pub mod orchestrator;
pub mod planner;
pub mod purge;
pub mod scripts;
pub mod snapshot;

pub use backend::{BackendError, BackendSpec, SubmissionBackend};
pub use config::{LaunchEnv, MergeMode, MergeSettings, PipelineVariant, RunConfig, RunOptions};
pub use error::{Result, SubmitError};
pub use kill::{kill_run, KillReport};
pub use ledger::{FinalOutcome, LedgerDoc, MergeLedger, RunState, TaskState};
pub use orchestrator::{MergeReport, Orchestrator, Prepared, RunOutcome, SubmitReport};
pub use snapshot::RunSnapshot;
