use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use strata_core::backend::{MigrationBackend, MigrationSession};
use strata_core::error::{Result, StrataError};
use strata_core::ledger::MigrationRecord;
use strata_core::unit::{Direction, MigrationUnit};

/// Applies and reverts single units against a backend.
pub struct MigrationExecutor {
    backend: Arc<dyn MigrationBackend>,
}

impl MigrationExecutor {
    /// Create a new migration executor.
    pub fn new(backend: Arc<dyn MigrationBackend>) -> Self {
        Self { backend }
    }

    /// Run a unit's forward statements and record it in the ledger.
    ///
    /// With transactional DDL the statements and the ledger insert commit
    /// together. Without it each statement commits on its own and the record
    /// is written right after the last one; a crash in between leaves schema
    /// changes with no record, which needs manual reconciliation.
    pub async fn apply_unit(&self, unit: &MigrationUnit) -> Result<MigrationRecord> {
        let start = Instant::now();
        let mut session = self.backend.begin().await?;

        match session.is_recorded(unit.identifier()).await {
            Ok(false) => {}
            Ok(true) => {
                let err = StrataError::AlreadyApplied(unit.identifier().to_string());
                self.abort(session, unit, Direction::Up, &err).await;
                return Err(err);
            }
            Err(e) => {
                self.abort(session, unit, Direction::Up, &e).await;
                return Err(e);
            }
        }

        if let Err(e) = run_statements(&mut session, unit, Direction::Up).await {
            self.abort(session, unit, Direction::Up, &e).await;
            return Err(e);
        }

        let record =
            MigrationRecord::for_unit(unit, Utc::now(), start.elapsed().as_millis() as i64);
        if let Err(e) = session.record_applied(&record).await {
            self.abort(session, unit, Direction::Up, &e).await;
            return Err(e);
        }

        session.commit().await?;

        info!(
            "Applied migration {} ({} statement(s), {} ms)",
            unit.identifier(),
            unit.up().len(),
            start.elapsed().as_millis()
        );
        Ok(record)
    }

    /// Run a unit's reverse statements and remove its ledger record.
    ///
    /// Statements run in the order the unit declares them; nothing is
    /// inverted automatically.
    pub async fn revert_unit(&self, unit: &MigrationUnit) -> Result<()> {
        if !unit.has_down() {
            return Err(StrataError::Irreversible(unit.identifier().to_string()));
        }

        let start = Instant::now();
        let mut session = self.backend.begin().await?;

        match session.is_recorded(unit.identifier()).await {
            Ok(true) => {}
            Ok(false) => {
                let err = StrataError::NotApplied(unit.identifier().to_string());
                self.abort(session, unit, Direction::Down, &err).await;
                return Err(err);
            }
            Err(e) => {
                self.abort(session, unit, Direction::Down, &e).await;
                return Err(e);
            }
        }

        if let Err(e) = run_statements(&mut session, unit, Direction::Down).await {
            self.abort(session, unit, Direction::Down, &e).await;
            return Err(e);
        }

        if let Err(e) = session.record_reverted(unit.identifier()).await {
            self.abort(session, unit, Direction::Down, &e).await;
            return Err(e);
        }

        session.commit().await?;

        info!(
            "Reverted migration {} ({} statement(s), {} ms)",
            unit.identifier(),
            unit.down().len(),
            start.elapsed().as_millis()
        );
        Ok(())
    }

    async fn abort(
        &self,
        session: Box<dyn MigrationSession>,
        unit: &MigrationUnit,
        direction: Direction,
        cause: &StrataError,
    ) {
        if let Err(e) = session.rollback().await {
            warn!(
                "Failed to roll back migration {} ({}): {}",
                unit.identifier(),
                direction,
                e
            );
        }

        if self.backend.supports_transactional_ddl() {
            return;
        }

        if let StrataError::StatementExecutionFailed {
            statement_index, ..
        } = cause
        {
            if *statement_index > 0 {
                error!(
                    "Migration {} ({}) stopped at statement {}; statements before it were \
                     committed by a backend without transactional DDL and need manual reconciliation",
                    unit.identifier(),
                    direction,
                    statement_index
                );
            }
        }
    }
}

async fn run_statements(
    session: &mut Box<dyn MigrationSession>,
    unit: &MigrationUnit,
    direction: Direction,
) -> Result<()> {
    for (index, statement) in unit.statements(direction).iter().enumerate() {
        debug!(
            "Migration {} ({}) statement {}: {}",
            unit.identifier(),
            direction,
            index,
            statement
        );

        session
            .execute(statement)
            .await
            .map_err(|e| StrataError::StatementExecutionFailed {
                identifier: unit.identifier().to_string(),
                statement_index: index,
                cause: cause_text(e),
            })?;
    }
    Ok(())
}

fn cause_text(err: StrataError) -> String {
    match err {
        StrataError::Database(msg) => msg,
        StrataError::Sql(sqlx::Error::Database(db)) => db.message().to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryBackend;

    fn outbox_unit() -> MigrationUnit {
        MigrationUnit::new(
            "20260202193346",
            "outbox and users",
            vec![
                "CREATE TABLE outbox_events (id VARCHAR(36) NOT NULL, PRIMARY KEY (id))".into(),
                "CREATE INDEX idx_outbox_event_type ON outbox_events (event_type)".into(),
                "CREATE TABLE users (id VARCHAR(36) NOT NULL, PRIMARY KEY (id))".into(),
                "CREATE INDEX idx_users_email ON users (email)".into(),
            ],
            vec!["DROP TABLE outbox_events".into(), "DROP TABLE users".into()],
        )
        .unwrap()
    }

    fn executor(backend: &MemoryBackend) -> MigrationExecutor {
        MigrationExecutor::new(Arc::new(backend.clone()))
    }

    #[tokio::test]
    async fn test_apply_records_unit() {
        let backend = MemoryBackend::new();
        let unit = outbox_unit();

        let record = executor(&backend).apply_unit(&unit).await.unwrap();
        assert_eq!(record.identifier, "20260202193346");
        assert_eq!(record.checksum.as_deref(), Some(unit.checksum()));

        assert!(backend.has_table("outbox_events"));
        assert!(backend.has_table("users"));
        assert!(backend.has_index("idx_users_email"));
        assert_eq!(backend.records(), vec![record]);
    }

    #[tokio::test]
    async fn test_apply_twice_fails_without_reexecuting() {
        let backend = MemoryBackend::new();
        let unit = outbox_unit();
        let executor = executor(&backend);

        executor.apply_unit(&unit).await.unwrap();
        let executed_once = backend.executed().len();

        let err = executor.apply_unit(&unit).await.unwrap_err();
        assert!(matches!(err, StrataError::AlreadyApplied(id) if id == "20260202193346"));
        assert_eq!(backend.executed().len(), executed_once);
        assert_eq!(backend.records().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_statement_is_atomic() {
        let backend = MemoryBackend::new();
        backend.fail_on("CREATE TABLE users");
        let before = backend.snapshot();

        let err = executor(&backend).apply_unit(&outbox_unit()).await.unwrap_err();
        match err {
            StrataError::StatementExecutionFailed {
                identifier,
                statement_index,
                cause,
            } => {
                assert_eq!(identifier, "20260202193346");
                assert_eq!(statement_index, 2);
                assert!(cause.contains("injected failure"));
            }
            other => panic!("unexpected error: {other}"),
        }

        // Statements one and two ran but their effects are gone.
        assert_eq!(backend.executed().len(), 3);
        assert_eq!(backend.snapshot(), before);
    }

    #[tokio::test]
    async fn test_failed_statement_without_transactional_ddl() {
        let backend = MemoryBackend::non_transactional();
        backend.fail_on("CREATE TABLE users");

        let err = executor(&backend).apply_unit(&outbox_unit()).await.unwrap_err();
        assert!(matches!(err, StrataError::StatementExecutionFailed { statement_index: 2, .. }));

        // Earlier statements stay committed, but no record is written.
        assert!(backend.has_table("outbox_events"));
        assert!(backend.records().is_empty());
    }

    #[tokio::test]
    async fn test_revert_round_trip() {
        let backend = MemoryBackend::new();
        let unit = outbox_unit();
        let executor = executor(&backend);
        let before = backend.snapshot();

        executor.apply_unit(&unit).await.unwrap();
        executor.revert_unit(&unit).await.unwrap();

        assert_eq!(backend.snapshot(), before);
        assert_eq!(
            &backend.executed()[4..],
            &["DROP TABLE outbox_events".to_string(), "DROP TABLE users".to_string()]
        );
    }

    #[tokio::test]
    async fn test_revert_not_applied() {
        let backend = MemoryBackend::new();
        let err = executor(&backend).revert_unit(&outbox_unit()).await.unwrap_err();
        assert!(matches!(err, StrataError::NotApplied(_)));
        assert!(backend.executed().is_empty());
    }

    #[tokio::test]
    async fn test_revert_irreversible_touches_nothing() {
        let backend = MemoryBackend::new();
        let unit = MigrationUnit::new("1", "no down", vec!["CREATE TABLE a (id INT)".into()], vec![]).unwrap();
        let executor = executor(&backend);

        executor.apply_unit(&unit).await.unwrap();
        let err = executor.revert_unit(&unit).await.unwrap_err();
        assert!(matches!(err, StrataError::Irreversible(_)));
        assert!(backend.has_table("a"));
        assert_eq!(backend.records().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_revert_keeps_record() {
        let backend = MemoryBackend::new();
        let unit = outbox_unit();
        let executor = executor(&backend);
        executor.apply_unit(&unit).await.unwrap();

        backend.fail_on("DROP TABLE users");
        let err = executor.revert_unit(&unit).await.unwrap_err();
        assert!(matches!(err, StrataError::StatementExecutionFailed { statement_index: 1, .. }));
        assert!(backend.has_table("outbox_events"));
        assert_eq!(backend.records().len(), 1);
    }
}
