//! Online migration of the durable tier between deployments
//!
//! - [`state`]: the state machine and published status
//! - [`checkpoint`]: on-disk checkpoints for resume
//! - [`validation`]: sampled equivalence check run before cutover
//! - [`orchestrator`]: drives a migration end to end

pub mod checkpoint;
pub mod orchestrator;
pub mod state;
pub mod validation;

pub use checkpoint::CheckpointStore;
pub use orchestrator::{MigrationHandle, MigrationOrchestrator};
pub use state::{MigrationState, MigrationStatus};
pub use validation::{ValidationReport, validate};
