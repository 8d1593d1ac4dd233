//! Connections to target stores.

mod postgres;
mod sqlite;

pub use postgres::PgBackend;
pub use sqlite::SqliteBackend;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use strata_core::backend::MigrationBackend;
use strata_core::config::{redact_url, Dialect, StrataConfig};
use strata_core::error::Result;
use strata_core::ledger::MigrationRecord;

use crate::testing::MemoryBackend;

/// Open the backend named by the configured database URL.
pub async fn connect(config: &StrataConfig) -> Result<Arc<dyn MigrationBackend>> {
    let dialect = config.database.dialect()?;
    info!(
        "Connecting to {} ({})",
        redact_url(&config.database.url),
        dialect
    );

    let backend: Arc<dyn MigrationBackend> = match dialect {
        Dialect::Postgres => Arc::new(PgBackend::connect(&config.database, &config.migrations).await?),
        Dialect::Sqlite => {
            Arc::new(SqliteBackend::connect(&config.database, &config.migrations).await?)
        }
        // Nothing persists between runs; useful for checking that units parse and plan.
        Dialect::Memory => Arc::new(MemoryBackend::new()),
    };
    Ok(backend)
}

/// Ledger row as selected by both SQL backends.
type RecordRow = (String, Option<String>, Option<String>, DateTime<Utc>, Option<i64>);

fn select_records_sql(ledger_table: &str) -> String {
    format!(
        "SELECT identifier, description, checksum, applied_at, execution_time_ms FROM {}",
        ledger_table
    )
}

fn record_from_row(row: RecordRow) -> MigrationRecord {
    let (identifier, description, checksum, applied_at, execution_time_ms) = row;
    MigrationRecord {
        identifier,
        description,
        checksum,
        applied_at,
        execution_time_ms,
    }
}
