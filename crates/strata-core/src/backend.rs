//! Traits implemented by each target store.
//!
//! A backend owns the connection to the target store and the ledger living
//! beside it. Schema statements and ledger writes for one unit go through a
//! single [`MigrationSession`], so on stores with transactional DDL they
//! commit or roll back together.

use async_trait::async_trait;

use crate::config::Dialect;
use crate::error::Result;
use crate::ledger::{Ledger, MigrationRecord};

/// A target store plus its ledger.
#[async_trait]
pub trait MigrationBackend: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// Whether schema statements can be rolled back inside a transaction.
    fn supports_transactional_ddl(&self) -> bool;

    /// Create the ledger table if missing. Runs under the run lock and
    /// outside of any migration unit.
    async fn ensure_ledger(&self) -> Result<()>;

    /// Snapshot of every applied record. An absent ledger table reads as
    /// empty and is not created.
    async fn ledger(&self) -> Result<Ledger>;

    /// Try to take the run lock without waiting. `None` means another holder
    /// has it. Must not depend on the ledger table existing.
    async fn try_lock(&self, holder: &str) -> Result<Option<Box<dyn RunLock>>>;

    /// Identity of the current lock holder, when the store can tell.
    async fn current_holder(&self) -> Result<Option<String>>;

    /// Clear a lock left behind by a crashed run. Returns whether anything was
    /// cleared.
    async fn force_unlock(&self) -> Result<bool>;

    /// Open a session for one unit. Dropping it without `commit` rolls back
    /// whatever the store can roll back.
    async fn begin(&self) -> Result<Box<dyn MigrationSession>>;
}

/// Scoped unit of work against the target store.
#[async_trait]
pub trait MigrationSession: Send {
    /// Execute one statement verbatim.
    async fn execute(&mut self, statement: &str) -> Result<()>;

    /// Whether the ledger holds a record for `identifier`, as seen inside
    /// this session.
    async fn is_recorded(&mut self, identifier: &str) -> Result<bool>;

    /// Insert a ledger record. Fails with `AlreadyApplied` if present.
    async fn record_applied(&mut self, record: &MigrationRecord) -> Result<()>;

    /// Delete a ledger record. Fails with `NotApplied` if absent.
    async fn record_reverted(&mut self, identifier: &str) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Held for the duration of a run.
#[async_trait]
pub trait RunLock: Send {
    async fn release(self: Box<Self>) -> Result<()>;
}
