//! Migration execution.
//!
//! The executor applies or reverts one unit inside a session; the runner
//! plans a whole run and executes it under the run lock.

mod executor;
mod runner;
mod status;

pub use executor::MigrationExecutor;
pub use runner::{CompletedUnit, FailedUnit, MigrationRunner, RunReport};
pub use status::{AppliedStatus, ChecksumState, MigrationStatus, PendingStatus};
