//! STRATA - schema migration ledger and apply/rollback engine.
//!
//! Embed the runner directly instead of shelling out to the CLI:
//!
//! ```no_run
//! # async fn run() -> strata::Result<()> {
//! use strata::{MigrationRegistry, MigrationRunner, StrataConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! let config = StrataConfig::from_file("strata.toml")?;
//! let registry = MigrationRegistry::from_dir(&config.migrations.dir)?;
//! let backend = strata::connect(&config).await?;
//!
//! let report = MigrationRunner::new(backend, registry)
//!     .up(&CancellationToken::new())
//!     .await?
//!     .into_result()?;
//! println!("applied {} migration(s)", report.completed.len());
//! # Ok(())
//! # }
//! ```

pub use strata_core::{
    Direction, Ledger, MigrationBackend, MigrationRecord, MigrationRegistry, MigrationUnit, Plan,
    PlanWarning, Planner, Result, StrataConfig, StrataError,
};
pub use strata_runtime::{
    connect, MigrationExecutor, MigrationRunner, MigrationStatus, RunReport,
};
