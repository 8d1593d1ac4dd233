//! Computes which units a run should execute.
//!
//! A plan is derived fresh from the registry and a ledger snapshot on every
//! invocation and is never persisted.

use crate::error::{Result, StrataError};
use crate::ledger::Ledger;
use crate::registry::MigrationRegistry;
use crate::unit::{Direction, MigrationUnit};

/// Non-fatal conditions noticed while planning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanWarning {
    /// Fewer units were applied than the rollback asked for.
    PartialRollback { requested: usize, available: usize },
    /// A pending unit sorts below the newest applied one.
    OutOfOrder {
        identifier: String,
        latest_applied: String,
    },
}

impl std::fmt::Display for PlanWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanWarning::PartialRollback {
                requested,
                available,
            } => write!(
                f,
                "Requested {} step(s) but only {} migration(s) are applied",
                requested, available
            ),
            PlanWarning::OutOfOrder {
                identifier,
                latest_applied,
            } => write!(
                f,
                "Pending migration {} is older than applied migration {}",
                identifier, latest_applied
            ),
        }
    }
}

/// Ordered units to execute in one run.
#[derive(Debug, Clone)]
pub struct Plan {
    pub direction: Direction,
    pub units: Vec<MigrationUnit>,
    pub warnings: Vec<PlanWarning>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn identifiers(&self) -> Vec<&str> {
        self.units.iter().map(|u| u.identifier()).collect()
    }

    pub fn is_partial_rollback(&self) -> bool {
        self.warnings
            .iter()
            .any(|w| matches!(w, PlanWarning::PartialRollback { .. }))
    }
}

/// Diffs the registry against a ledger snapshot.
pub struct Planner<'a> {
    registry: &'a MigrationRegistry,
    ledger: &'a Ledger,
}

impl<'a> Planner<'a> {
    pub fn new(registry: &'a MigrationRegistry, ledger: &'a Ledger) -> Self {
        Self { registry, ledger }
    }

    /// Registry units not yet applied, ascending by identifier.
    pub fn plan_up(&self) -> Plan {
        let applied = self.ledger.applied_ids();
        let latest_applied = self.ledger.highest_identifier();

        let units: Vec<MigrationUnit> = self
            .registry
            .list()
            .iter()
            .filter(|u| !applied.contains(u.identifier()))
            .cloned()
            .collect();

        let warnings = match latest_applied {
            Some(latest) => units
                .iter()
                .filter(|u| u.identifier() < latest)
                .map(|u| PlanWarning::OutOfOrder {
                    identifier: u.identifier().to_string(),
                    latest_applied: latest.to_string(),
                })
                .collect(),
            None => Vec::new(),
        };

        Plan {
            direction: Direction::Up,
            units,
            warnings,
        }
    }

    /// The `steps` most recently applied units, newest first.
    ///
    /// Asking for more steps than are applied plans everything applied and
    /// attaches a `PartialRollback` warning.
    pub fn plan_down(&self, steps: usize) -> Result<Plan> {
        let records = self.ledger.most_recent_first();

        let mut units = Vec::with_capacity(steps.min(records.len()));
        for record in records.iter().take(steps) {
            let unit = self
                .registry
                .get(&record.identifier)
                .ok_or_else(|| StrataError::UnknownMigration(record.identifier.clone()))?;
            units.push(unit.clone());
        }

        let mut warnings = Vec::new();
        if steps > records.len() {
            warnings.push(PlanWarning::PartialRollback {
                requested: steps,
                available: records.len(),
            });
        }

        Ok(Plan {
            direction: Direction::Down,
            units,
            warnings,
        })
    }
}
