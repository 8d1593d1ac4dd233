pub mod db;
pub mod migrations;
pub mod testing;

pub use db::{connect, PgBackend, SqliteBackend};
pub use migrations::{
    AppliedStatus, ChecksumState, CompletedUnit, FailedUnit, MigrationExecutor, MigrationRunner,
    MigrationStatus, PendingStatus, RunReport,
};
