use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::{Connection, Executor, Postgres, Transaction};
use tracing::debug;

use strata_core::backend::{MigrationBackend, MigrationSession, RunLock};
use strata_core::config::{DatabaseConfig, Dialect, MigrationsConfig};
use strata_core::error::{Result, StrataError};
use strata_core::ledger::{Ledger, MigrationRecord};

use super::{record_from_row, select_records_sql, RecordRow};

/// PostgreSQL target. DDL is transactional and the run lock is a session
/// advisory lock.
pub struct PgBackend {
    pool: PgPool,
    ledger_table: String,
    lock_id: i64,
}

impl PgBackend {
    pub async fn connect(database: &DatabaseConfig, migrations: &MigrationsConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(database.pool_size)
            .acquire_timeout(Duration::from_secs(database.pool_timeout_secs))
            .connect(&database.url)
            .await
            .map_err(|e| StrataError::Database(format!("Failed to connect: {}", e)))?;

        Ok(Self::from_pool(pool, migrations))
    }

    pub fn from_pool(pool: PgPool, migrations: &MigrationsConfig) -> Self {
        Self {
            pool,
            ledger_table: migrations.ledger_table.clone(),
            lock_id: migrations.lock_id,
        }
    }
}

fn create_ledger_sql(table: &str) -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            identifier VARCHAR(255) PRIMARY KEY,
            description TEXT,
            checksum VARCHAR(64),
            applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            execution_time_ms BIGINT
        )
        "#,
        table
    )
}

/// Holder of a session advisory lock, by the holder's `application_name`.
const LOCK_HOLDER_SQL: &str = r#"
    SELECT a.application_name
    FROM pg_locks l
    JOIN pg_stat_activity a ON a.pid = l.pid
    WHERE l.locktype = 'advisory'
      AND l.granted
      AND l.objsubid = 1
      AND ((l.classid::bigint << 32) | l.objid::bigint) = $1
    LIMIT 1
"#;

fn insert_record_sql(table: &str) -> String {
    format!(
        "INSERT INTO {} (identifier, description, checksum, applied_at, execution_time_ms) \
         VALUES ($1, $2, $3, $4, $5) ON CONFLICT (identifier) DO NOTHING",
        table
    )
}

#[async_trait]
impl MigrationBackend for PgBackend {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn supports_transactional_ddl(&self) -> bool {
        true
    }

    async fn ensure_ledger(&self) -> Result<()> {
        sqlx::query(&create_ledger_sql(&self.ledger_table))
            .execute(&self.pool)
            .await
            .map_err(|e| StrataError::Database(format!("Failed to create ledger table: {}", e)))?;
        Ok(())
    }

    async fn ledger(&self) -> Result<Ledger> {
        let (exists,): (bool,) = sqlx::query_as("SELECT to_regclass($1) IS NOT NULL")
            .bind(&self.ledger_table)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StrataError::Database(format!("Failed to inspect schema: {}", e)))?;
        if !exists {
            return Ok(Ledger::default());
        }

        let rows: Vec<RecordRow> = sqlx::query_as(&select_records_sql(&self.ledger_table))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StrataError::Database(format!("Failed to read ledger: {}", e)))?;

        Ok(Ledger::new(rows.into_iter().map(record_from_row).collect()))
    }

    async fn try_lock(&self, holder: &str) -> Result<Option<Box<dyn RunLock>>> {
        // The lock lives on its own connection outside the pool, so every
        // pooled connection stays free for the run itself. Dropping the guard
        // drops the connection, which ends the session and the lock.
        let options = (*self.pool.connect_options())
            .clone()
            .application_name(holder);
        let mut conn = PgConnection::connect_with(&options)
            .await
            .map_err(|e| StrataError::Database(format!("Failed to open lock connection: {}", e)))?;

        let (acquired,): (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock($1)")
            .bind(self.lock_id)
            .fetch_one(&mut conn)
            .await
            .map_err(|e| {
                StrataError::Database(format!("Failed to acquire migration lock: {}", e))
            })?;

        if !acquired {
            if let Err(e) = conn.close().await {
                debug!("Closing lock connection failed: {}", e);
            }
            return Ok(None);
        }

        Ok(Some(Box::new(PgRunLock {
            conn,
            lock_id: self.lock_id,
        })))
    }

    async fn current_holder(&self) -> Result<Option<String>> {
        let row: Option<(Option<String>,)> = sqlx::query_as(LOCK_HOLDER_SQL)
            .bind(self.lock_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StrataError::Database(format!("Failed to read lock: {}", e)))?;
        Ok(row
            .and_then(|(name,)| name)
            .filter(|name| !name.is_empty()))
    }

    async fn force_unlock(&self) -> Result<bool> {
        // A session lock cannot outlive its holder's connection.
        debug!("Advisory lock {} is released with its session", self.lock_id);
        Ok(false)
    }

    async fn begin(&self) -> Result<Box<dyn MigrationSession>> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StrataError::Database(format!("Failed to begin transaction: {}", e)))?;

        Ok(Box::new(PgSession {
            tx,
            ledger_table: self.ledger_table.clone(),
        }))
    }
}

struct PgRunLock {
    conn: PgConnection,
    lock_id: i64,
}

#[async_trait]
impl RunLock for PgRunLock {
    async fn release(self: Box<Self>) -> Result<()> {
        let PgRunLock { mut conn, lock_id } = *self;
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(lock_id)
            .execute(&mut conn)
            .await
            .map_err(|e| {
                StrataError::Database(format!("Failed to release migration lock: {}", e))
            })?;
        conn.close()
            .await
            .map_err(|e| StrataError::Database(format!("Failed to close lock connection: {}", e)))?;
        Ok(())
    }
}

struct PgSession {
    tx: Transaction<'static, Postgres>,
    ledger_table: String,
}

#[async_trait]
impl MigrationSession for PgSession {
    async fn execute(&mut self, statement: &str) -> Result<()> {
        let conn = &mut *self.tx;
        conn.execute(sqlx::raw_sql(statement)).await?;
        Ok(())
    }

    async fn is_recorded(&mut self, identifier: &str) -> Result<bool> {
        let sql = format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE identifier = $1)",
            self.ledger_table
        );
        let (exists,): (bool,) = sqlx::query_as(&sql)
            .bind(identifier)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(exists)
    }

    async fn record_applied(&mut self, record: &MigrationRecord) -> Result<()> {
        let result = sqlx::query(&insert_record_sql(&self.ledger_table))
            .bind(&record.identifier)
            .bind(&record.description)
            .bind(&record.checksum)
            .bind(record.applied_at)
            .bind(record.execution_time_ms)
            .execute(&mut *self.tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StrataError::AlreadyApplied(record.identifier.clone()));
        }
        Ok(())
    }

    async fn record_reverted(&mut self, identifier: &str) -> Result<()> {
        let sql = format!("DELETE FROM {} WHERE identifier = $1", self.ledger_table);
        let result = sqlx::query(&sql)
            .bind(identifier)
            .execute(&mut *self.tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StrataError::NotApplied(identifier.to_string()));
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
