pub mod backend;
pub mod config;
pub mod error;
pub mod ledger;
pub mod planner;
pub mod registry;
pub mod unit;

pub use backend::{MigrationBackend, MigrationSession, RunLock};
pub use config::{Dialect, StrataConfig};
pub use error::{Result, StrataError};
pub use ledger::{Ledger, MigrationRecord};
pub use planner::{Plan, PlanWarning, Planner};
pub use registry::MigrationRegistry;
pub use unit::{Direction, MigrationUnit};
