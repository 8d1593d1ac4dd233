//! In-memory target store.
//!
//! Understands just enough DDL (`CREATE/DROP TABLE`, `CREATE/DROP INDEX`) to
//! make schema effects observable; any other statement is accepted as-is.
//! Clones share state, so two clones behave like two processes pointed at
//! the same database.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use strata_core::backend::{MigrationBackend, MigrationSession, RunLock};
use strata_core::config::Dialect;
use strata_core::error::{Result, StrataError};
use strata_core::ledger::{Ledger, MigrationRecord};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct MemoryState {
    tables: BTreeSet<String>,
    /// Index name -> table name.
    indexes: BTreeMap<String, String>,
    ledger: BTreeMap<String, MigrationRecord>,
}

/// Observable schema plus ledger contents, for before/after comparisons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemorySnapshot {
    pub tables: Vec<String>,
    pub indexes: Vec<String>,
    pub applied: Vec<String>,
}

/// Lifecycle of the ledger table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum LedgerTable {
    #[default]
    Absent,
    Creating,
    Present,
}

#[derive(Default)]
struct Shared {
    state: Mutex<MemoryState>,
    ledger_table: Mutex<LedgerTable>,
    lock_holder: Mutex<Option<String>>,
    executed: Mutex<Vec<String>>,
    fail_on: Mutex<Vec<String>>,
}

/// In-memory backend for tests and dry validation of migration files.
#[derive(Clone)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
    transactional_ddl: bool,
    statement_delay: Option<Duration>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Backend where DDL participates in transactions.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            transactional_ddl: true,
            statement_delay: None,
        }
    }

    /// Backend where every statement commits on its own.
    pub fn non_transactional() -> Self {
        Self {
            transactional_ddl: false,
            ..Self::new()
        }
    }

    /// Sleep before each statement so concurrent runs interleave.
    pub fn with_statement_delay(mut self, delay: Duration) -> Self {
        self.statement_delay = Some(delay);
        self
    }

    /// Make any statement containing `pattern` fail.
    pub fn fail_on(&self, pattern: impl Into<String>) {
        lock(&self.shared.fail_on).push(pattern.into());
    }

    pub fn clear_failures(&self) {
        lock(&self.shared.fail_on).clear();
    }

    /// Every statement ever attempted, including rolled-back ones.
    pub fn executed(&self) -> Vec<String> {
        lock(&self.shared.executed).clone()
    }

    pub fn has_table(&self, name: &str) -> bool {
        lock(&self.shared.state).tables.contains(&name.to_lowercase())
    }

    pub fn has_index(&self, name: &str) -> bool {
        lock(&self.shared.state)
            .indexes
            .contains_key(&name.to_lowercase())
    }

    pub fn records(&self) -> Vec<MigrationRecord> {
        lock(&self.shared.state).ledger.values().cloned().collect()
    }

    pub fn lock_holder(&self) -> Option<String> {
        lock(&self.shared.lock_holder).clone()
    }

    pub fn has_ledger(&self) -> bool {
        *lock(&self.shared.ledger_table) == LedgerTable::Present
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        let state = lock(&self.shared.state);
        MemorySnapshot {
            tables: state.tables.iter().cloned().collect(),
            indexes: state.indexes.keys().cloned().collect(),
            applied: state.ledger.keys().cloned().collect(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl MigrationBackend for MemoryBackend {
    fn dialect(&self) -> Dialect {
        Dialect::Memory
    }

    fn supports_transactional_ddl(&self) -> bool {
        self.transactional_ddl
    }

    /// Two creators racing on an absent table collide the way catalog
    /// inserts do on a real server.
    async fn ensure_ledger(&self) -> Result<()> {
        {
            let mut table = lock(&self.shared.ledger_table);
            match *table {
                LedgerTable::Present => return Ok(()),
                LedgerTable::Creating => {
                    return Err(StrataError::Database(
                        "Failed to create ledger table: concurrent creation".into(),
                    ))
                }
                LedgerTable::Absent => *table = LedgerTable::Creating,
            }
        }

        if let Some(delay) = self.statement_delay {
            tokio::time::sleep(delay).await;
        }
        *lock(&self.shared.ledger_table) = LedgerTable::Present;
        Ok(())
    }

    async fn ledger(&self) -> Result<Ledger> {
        if !self.has_ledger() {
            return Ok(Ledger::default());
        }
        Ok(Ledger::new(self.records()))
    }

    async fn try_lock(&self, holder: &str) -> Result<Option<Box<dyn RunLock>>> {
        let mut current = lock(&self.shared.lock_holder);
        if current.is_some() {
            return Ok(None);
        }
        *current = Some(holder.to_string());

        Ok(Some(Box::new(MemoryRunLock {
            shared: self.shared.clone(),
            holder: holder.to_string(),
        })))
    }

    async fn current_holder(&self) -> Result<Option<String>> {
        Ok(self.lock_holder())
    }

    async fn force_unlock(&self) -> Result<bool> {
        Ok(lock(&self.shared.lock_holder).take().is_some())
    }

    async fn begin(&self) -> Result<Box<dyn MigrationSession>> {
        let staged = if self.transactional_ddl {
            Some(lock(&self.shared.state).clone())
        } else {
            None
        };

        Ok(Box::new(MemorySession {
            shared: self.shared.clone(),
            staged,
            statement_delay: self.statement_delay,
        }))
    }
}

struct MemoryRunLock {
    shared: Arc<Shared>,
    holder: String,
}

#[async_trait]
impl RunLock for MemoryRunLock {
    async fn release(self: Box<Self>) -> Result<()> {
        let mut current = lock(&self.shared.lock_holder);
        if current.as_deref() == Some(self.holder.as_str()) {
            *current = None;
        }
        Ok(())
    }
}

/// Transactional sessions work on a private copy that replaces the shared
/// state on commit; non-transactional ones write through immediately.
struct MemorySession {
    shared: Arc<Shared>,
    staged: Option<MemoryState>,
    statement_delay: Option<Duration>,
}

impl MemorySession {
    fn with_state<R>(&mut self, f: impl FnOnce(&mut MemoryState) -> R) -> R {
        match self.staged.as_mut() {
            Some(staged) => f(staged),
            None => f(&mut lock(&self.shared.state)),
        }
    }
}

#[async_trait]
impl MigrationSession for MemorySession {
    async fn execute(&mut self, statement: &str) -> Result<()> {
        if let Some(delay) = self.statement_delay {
            tokio::time::sleep(delay).await;
        }

        lock(&self.shared.executed).push(statement.to_string());

        let injected = lock(&self.shared.fail_on)
            .iter()
            .find(|pattern| statement.contains(pattern.as_str()))
            .cloned();
        if let Some(pattern) = injected {
            return Err(StrataError::Database(format!(
                "injected failure matching '{}'",
                pattern
            )));
        }

        self.with_state(|state| apply_statement(state, statement))
            .map_err(StrataError::Database)
    }

    async fn is_recorded(&mut self, identifier: &str) -> Result<bool> {
        Ok(self.with_state(|state| state.ledger.contains_key(identifier)))
    }

    async fn record_applied(&mut self, record: &MigrationRecord) -> Result<()> {
        self.with_state(|state| {
            if state.ledger.contains_key(&record.identifier) {
                return Err(StrataError::AlreadyApplied(record.identifier.clone()));
            }
            state
                .ledger
                .insert(record.identifier.clone(), record.clone());
            Ok(())
        })
    }

    async fn record_reverted(&mut self, identifier: &str) -> Result<()> {
        self.with_state(|state| match state.ledger.remove(identifier) {
            Some(_) => Ok(()),
            None => Err(StrataError::NotApplied(identifier.to_string())),
        })
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        if let Some(staged) = self.staged {
            *lock(&self.shared.state) = staged;
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

fn apply_statement(state: &mut MemoryState, statement: &str) -> std::result::Result<(), String> {
    let words: Vec<String> = statement
        .split(|c: char| c.is_whitespace() || c == '(')
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect();
    let words: Vec<&str> = words.iter().map(String::as_str).collect();

    match words.as_slice() {
        ["create", "table", "if", "not", "exists", name, ..] => {
            state.tables.insert(name.to_string());
            Ok(())
        }
        ["create", "table", name, ..] => {
            if !state.tables.insert(name.to_string()) {
                return Err(format!("relation \"{}\" already exists", name));
            }
            Ok(())
        }
        ["create", "unique", "index", rest @ ..] | ["create", "index", rest @ ..] => {
            let (if_not_exists, rest) = match rest {
                ["if", "not", "exists", rest @ ..] => (true, rest),
                _ => (false, rest),
            };
            let [name, "on", table, ..] = rest else {
                return Err(format!("syntax error in \"{}\"", statement));
            };
            if !state.tables.contains(*table) {
                return Err(format!("relation \"{}\" does not exist", table));
            }
            if state.indexes.contains_key(*name) {
                if if_not_exists {
                    return Ok(());
                }
                return Err(format!("relation \"{}\" already exists", name));
            }
            state.indexes.insert(name.to_string(), table.to_string());
            Ok(())
        }
        ["drop", "table", "if", "exists", name, ..] => {
            drop_table(state, name);
            Ok(())
        }
        ["drop", "table", name, ..] => {
            if !drop_table(state, name) {
                return Err(format!("table \"{}\" does not exist", name));
            }
            Ok(())
        }
        ["drop", "index", "if", "exists", name, ..] => {
            state.indexes.remove(*name);
            Ok(())
        }
        ["drop", "index", name, ..] => match state.indexes.remove(*name) {
            Some(_) => Ok(()),
            None => Err(format!("index \"{}\" does not exist", name)),
        },
        _ => Ok(()),
    }
}

fn drop_table(state: &mut MemoryState, name: &str) -> bool {
    if !state.tables.remove(name) {
        return false;
    }
    state.indexes.retain(|_, table| table != name);
    true
}
