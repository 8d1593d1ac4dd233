use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Executor, Sqlite, Transaction};

use strata_core::backend::{MigrationBackend, MigrationSession, RunLock};
use strata_core::config::{DatabaseConfig, Dialect, MigrationsConfig};
use strata_core::error::{Result, StrataError};
use strata_core::ledger::{Ledger, MigrationRecord};

use super::{record_from_row, select_records_sql, RecordRow};

/// SQLite target. DDL is transactional; SQLite has no advisory locks, so the
/// run lock is a single row in a lock table.
pub struct SqliteBackend {
    pool: SqlitePool,
    ledger_table: String,
    lock_table: String,
}

impl SqliteBackend {
    pub async fn connect(database: &DatabaseConfig, migrations: &MigrationsConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&database.url)
            .map_err(|e| StrataError::Config(format!("Invalid SQLite URL: {}", e)))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(database.pool_size)
            .acquire_timeout(Duration::from_secs(database.pool_timeout_secs))
            .connect_with(options)
            .await
            .map_err(|e| StrataError::Database(format!("Failed to connect: {}", e)))?;

        Ok(Self::from_pool(pool, migrations))
    }

    pub fn from_pool(pool: SqlitePool, migrations: &MigrationsConfig) -> Self {
        Self {
            pool,
            ledger_table: migrations.ledger_table.clone(),
            lock_table: migrations.lock_table.clone(),
        }
    }

    async fn table_exists(&self, name: &str) -> Result<bool> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
                .bind(name)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| StrataError::Database(format!("Failed to inspect schema: {}", e)))?;
        Ok(count > 0)
    }

    /// The lock table is created on its own, before the lock is taken; the
    /// ledger table is only created by the lock holder.
    async fn ensure_lock_table(&self) -> Result<()> {
        let sql = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                holder TEXT NOT NULL,
                acquired_at TEXT NOT NULL
            )
            "#,
            self.lock_table
        );
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|e| StrataError::Database(format!("Failed to create lock table: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl MigrationBackend for SqliteBackend {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn supports_transactional_ddl(&self) -> bool {
        true
    }

    async fn ensure_ledger(&self) -> Result<()> {
        let ledger = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                identifier TEXT PRIMARY KEY,
                description TEXT,
                checksum TEXT,
                applied_at TEXT NOT NULL,
                execution_time_ms INTEGER
            )
            "#,
            self.ledger_table
        );

        sqlx::query(&ledger)
            .execute(&self.pool)
            .await
            .map_err(|e| StrataError::Database(format!("Failed to create ledger table: {}", e)))?;
        Ok(())
    }

    async fn ledger(&self) -> Result<Ledger> {
        if !self.table_exists(&self.ledger_table).await? {
            return Ok(Ledger::default());
        }

        let rows: Vec<RecordRow> = sqlx::query_as(&select_records_sql(&self.ledger_table))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StrataError::Database(format!("Failed to read ledger: {}", e)))?;

        Ok(Ledger::new(rows.into_iter().map(record_from_row).collect()))
    }

    async fn try_lock(&self, holder: &str) -> Result<Option<Box<dyn RunLock>>> {
        self.ensure_lock_table().await?;

        let sql = format!(
            "INSERT OR IGNORE INTO {} (id, holder, acquired_at) VALUES (1, ?, ?)",
            self.lock_table
        );
        let result = sqlx::query(&sql)
            .bind(holder)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                StrataError::Database(format!("Failed to acquire migration lock: {}", e))
            })?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        Ok(Some(Box::new(SqliteRunLock {
            pool: self.pool.clone(),
            lock_table: self.lock_table.clone(),
            holder: holder.to_string(),
        })))
    }

    async fn current_holder(&self) -> Result<Option<String>> {
        if !self.table_exists(&self.lock_table).await? {
            return Ok(None);
        }

        let sql = format!("SELECT holder FROM {} WHERE id = 1", self.lock_table);
        let row: Option<(String,)> = sqlx::query_as(&sql)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StrataError::Database(format!("Failed to read lock: {}", e)))?;
        Ok(row.map(|(holder,)| holder))
    }

    async fn force_unlock(&self) -> Result<bool> {
        if !self.table_exists(&self.lock_table).await? {
            return Ok(false);
        }

        let sql = format!("DELETE FROM {} WHERE id = 1", self.lock_table);
        let result = sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|e| StrataError::Database(format!("Failed to clear migration lock: {}", e)))?;
        Ok(result.rows_affected() > 0)
    }

    async fn begin(&self) -> Result<Box<dyn MigrationSession>> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StrataError::Database(format!("Failed to begin transaction: {}", e)))?;

        Ok(Box::new(SqliteSession {
            tx,
            ledger_table: self.ledger_table.clone(),
        }))
    }
}

/// The row stays behind if the process dies mid-run; `force_unlock` clears it.
struct SqliteRunLock {
    pool: SqlitePool,
    lock_table: String,
    holder: String,
}

#[async_trait]
impl RunLock for SqliteRunLock {
    async fn release(self: Box<Self>) -> Result<()> {
        let sql = format!("DELETE FROM {} WHERE id = 1 AND holder = ?", self.lock_table);
        sqlx::query(&sql)
            .bind(&self.holder)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                StrataError::Database(format!("Failed to release migration lock: {}", e))
            })?;
        Ok(())
    }
}

struct SqliteSession {
    tx: Transaction<'static, Sqlite>,
    ledger_table: String,
}

#[async_trait]
impl MigrationSession for SqliteSession {
    async fn execute(&mut self, statement: &str) -> Result<()> {
        let conn = &mut *self.tx;
        conn.execute(sqlx::raw_sql(statement)).await?;
        Ok(())
    }

    async fn is_recorded(&mut self, identifier: &str) -> Result<bool> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE identifier = ?",
            self.ledger_table
        );
        let (count,): (i64,) = sqlx::query_as(&sql)
            .bind(identifier)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(count > 0)
    }

    async fn record_applied(&mut self, record: &MigrationRecord) -> Result<()> {
        let sql = format!(
            "INSERT OR IGNORE INTO {} (identifier, description, checksum, applied_at, execution_time_ms) \
             VALUES (?, ?, ?, ?, ?)",
            self.ledger_table
        );
        let result = sqlx::query(&sql)
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
        let sql = format!("DELETE FROM {} WHERE identifier = ?", self.ledger_table);
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
