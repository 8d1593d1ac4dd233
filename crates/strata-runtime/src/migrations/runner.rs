//! Migration runner with run-wide locking.
//!
//! Ensures only one process runs migrations against a ledger at a time. A
//! second runner fails fast with `RunInProgress` instead of waiting.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use strata_core::backend::{MigrationBackend, RunLock};
use strata_core::error::{Result, StrataError};
use strata_core::ledger::Ledger;
use strata_core::planner::{Plan, PlanWarning, Planner};
use strata_core::registry::MigrationRegistry;
use strata_core::unit::Direction;

use super::executor::MigrationExecutor;
use super::status::MigrationStatus;

/// A unit that finished during a run.
#[derive(Debug, Clone)]
pub struct CompletedUnit {
    pub identifier: String,
    pub description: String,
    pub duration_ms: u128,
}

/// The unit that stopped a run.
#[derive(Debug)]
pub struct FailedUnit {
    pub identifier: String,
    pub error: StrataError,
}

/// Outcome of one `up` or `down` run.
#[derive(Debug)]
pub struct RunReport {
    pub direction: Direction,
    pub completed: Vec<CompletedUnit>,
    pub failed: Option<FailedUnit>,
    /// Planned units that were not executed.
    pub remaining: Vec<String>,
    pub warnings: Vec<PlanWarning>,
    pub cancelled: bool,
}

impl RunReport {
    fn new(direction: Direction, warnings: Vec<PlanWarning>) -> Self {
        Self {
            direction,
            completed: Vec::new(),
            failed: None,
            remaining: Vec::new(),
            warnings,
            cancelled: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_none() && !self.cancelled
    }

    /// Turn a failed or cancelled run into its error.
    pub fn into_result(self) -> Result<Self> {
        if let Some(failed) = self.failed {
            return Err(failed.error);
        }
        if self.cancelled {
            return Err(StrataError::Cancelled(self.remaining.len()));
        }
        Ok(self)
    }
}

/// Orchestrates planning and execution under the run lock.
pub struct MigrationRunner {
    backend: Arc<dyn MigrationBackend>,
    registry: MigrationRegistry,
    executor: MigrationExecutor,
    verify_checksums: bool,
}

impl MigrationRunner {
    pub fn new(backend: Arc<dyn MigrationBackend>, registry: MigrationRegistry) -> Self {
        Self {
            executor: MigrationExecutor::new(backend.clone()),
            backend,
            registry,
            verify_checksums: true,
        }
    }

    /// Refuse `up` when an applied unit's content no longer matches the ledger.
    pub fn verify_checksums(mut self, verify: bool) -> Self {
        self.verify_checksums = verify;
        self
    }

    pub fn registry(&self) -> &MigrationRegistry {
        &self.registry
    }

    /// Apply every pending unit in order.
    ///
    /// Stops at the first failure; units after it stay pending. Cancellation
    /// is checked between units only.
    pub async fn up(&self, cancel: &CancellationToken) -> Result<RunReport> {
        let (lock, run_id) = self.acquire_lock().await?;

        let result = self.up_inner(cancel).await;

        self.release_lock(lock, run_id).await;
        result
    }

    async fn up_inner(&self, cancel: &CancellationToken) -> Result<RunReport> {
        self.backend.ensure_ledger().await?;
        let ledger = self.backend.ledger().await?;
        if self.verify_checksums {
            self.check_checksums(&ledger)?;
        }
        let plan = Planner::new(&self.registry, &ledger).plan_up();
        Ok(self.execute_plan(plan, cancel).await)
    }

    /// Revert the `steps` most recently applied units, newest first.
    pub async fn down(&self, steps: usize, cancel: &CancellationToken) -> Result<RunReport> {
        let (lock, run_id) = self.acquire_lock().await?;

        let result = self.down_inner(steps, cancel).await;

        self.release_lock(lock, run_id).await;
        result
    }

    async fn down_inner(&self, steps: usize, cancel: &CancellationToken) -> Result<RunReport> {
        self.backend.ensure_ledger().await?;
        let ledger = self.backend.ledger().await?;
        let plan = Planner::new(&self.registry, &ledger).plan_down(steps)?;
        Ok(self.execute_plan(plan, cancel).await)
    }

    /// What `up` would run, without locking, executing or creating the
    /// ledger. Fails the same way `up` would on a checksum mismatch.
    pub async fn plan_up(&self) -> Result<Plan> {
        let ledger = self.backend.ledger().await?;
        if self.verify_checksums {
            self.check_checksums(&ledger)?;
        }
        Ok(Planner::new(&self.registry, &ledger).plan_up())
    }

    /// What `down` would run, without locking, executing or creating the
    /// ledger.
    pub async fn plan_down(&self, steps: usize) -> Result<Plan> {
        let ledger = self.backend.ledger().await?;
        Planner::new(&self.registry, &ledger).plan_down(steps)
    }

    /// Applied and pending units. Read-only.
    pub async fn status(&self) -> Result<MigrationStatus> {
        let ledger = self.backend.ledger().await?;
        Ok(MigrationStatus::build(&self.registry, &ledger))
    }

    /// Clear a lock left behind by a crashed run.
    pub async fn force_unlock(&self) -> Result<bool> {
        let cleared = self.backend.force_unlock().await?;
        if cleared {
            warn!("Cleared migration lock");
        }
        Ok(cleared)
    }

    async fn execute_plan(&self, plan: Plan, cancel: &CancellationToken) -> RunReport {
        let Plan {
            direction,
            units,
            warnings,
        } = plan;

        for warning in &warnings {
            warn!("{}", warning);
        }

        let mut report = RunReport::new(direction, warnings);
        let mut units = units.into_iter();

        for unit in units.by_ref() {
            if cancel.is_cancelled() {
                info!("Run cancelled before migration {}", unit.identifier());
                report.cancelled = true;
                report.remaining.push(unit.identifier().to_string());
                break;
            }

            let start = Instant::now();
            let outcome = match direction {
                Direction::Up => self.executor.apply_unit(&unit).await.map(|_| ()),
                Direction::Down => self.executor.revert_unit(&unit).await,
            };

            match outcome {
                Ok(()) => report.completed.push(CompletedUnit {
                    identifier: unit.identifier().to_string(),
                    description: unit.description().to_string(),
                    duration_ms: start.elapsed().as_millis(),
                }),
                Err(error) => {
                    warn!("Migration {} ({}) failed: {}", unit.identifier(), direction, error);
                    report.failed = Some(FailedUnit {
                        identifier: unit.identifier().to_string(),
                        error,
                    });
                    break;
                }
            }
        }

        report
            .remaining
            .extend(units.map(|u| u.identifier().to_string()));
        report
    }

    fn check_checksums(&self, ledger: &Ledger) -> Result<()> {
        for record in ledger.records() {
            let (Some(recorded), Some(unit)) =
                (record.checksum.as_deref(), self.registry.get(&record.identifier))
            else {
                continue;
            };

            if recorded != unit.checksum() {
                return Err(StrataError::ChecksumMismatch {
                    identifier: record.identifier.clone(),
                    recorded: recorded.to_string(),
                    current: unit.checksum().to_string(),
                });
            }
        }
        Ok(())
    }

    async fn acquire_lock(&self) -> Result<(Box<dyn RunLock>, Uuid)> {
        let run_id = Uuid::new_v4();
        let holder = lock_holder(run_id);

        debug!("Acquiring migration lock as {}", holder);
        match self.backend.try_lock(&holder).await? {
            Some(lock) => {
                debug!("Migration lock acquired");
                Ok((lock, run_id))
            }
            None => {
                let holder = match self.backend.current_holder().await {
                    Ok(Some(holder)) => holder,
                    Ok(None) => "another run".to_string(),
                    Err(e) => {
                        debug!("Could not read migration lock holder: {}", e);
                        "another run".to_string()
                    }
                };
                Err(StrataError::RunInProgress(format!(
                    "migration lock on the {} ledger is held by {}",
                    self.backend.dialect(),
                    holder
                )))
            }
        }
    }

    async fn release_lock(&self, lock: Box<dyn RunLock>, run_id: Uuid) {
        // Always release, even when the run failed.
        match lock.release().await {
            Ok(()) => debug!("Migration lock released ({})", run_id),
            Err(e) => warn!("Failed to release migration lock: {}", e),
        }
    }
}

fn lock_holder(run_id: Uuid) -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown-host".to_string());
    format!("{}:{}:{}", host, std::process::id(), run_id)
}
