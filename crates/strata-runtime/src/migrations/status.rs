use chrono::{DateTime, Utc};
use serde::Serialize;

use strata_core::ledger::Ledger;
use strata_core::registry::MigrationRegistry;

/// How an applied unit's recorded checksum compares to its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumState {
    Match,
    Mismatch,
    /// No checksum recorded, or the unit is missing from the source.
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct AppliedStatus {
    pub identifier: String,
    pub description: Option<String>,
    pub applied_at: DateTime<Utc>,
    pub execution_time_ms: Option<i64>,
    pub has_down: bool,
    pub checksum: ChecksumState,
    /// Recorded in the ledger but absent from the migrations source.
    pub missing: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingStatus {
    pub identifier: String,
    pub description: String,
    pub has_down: bool,
    /// Sorts below the newest applied unit.
    pub out_of_order: bool,
}

/// Applied and pending units at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatus {
    /// Oldest application first.
    pub applied: Vec<AppliedStatus>,
    /// Execution order.
    pub pending: Vec<PendingStatus>,
}

impl MigrationStatus {
    pub fn build(registry: &MigrationRegistry, ledger: &Ledger) -> Self {
        let applied = ledger
            .most_recent_first()
            .into_iter()
            .rev()
            .map(|record| {
                let unit = registry.get(&record.identifier);
                let checksum = match (record.checksum.as_deref(), unit) {
                    (Some(recorded), Some(unit)) if recorded == unit.checksum() => {
                        ChecksumState::Match
                    }
                    (Some(_), Some(_)) => ChecksumState::Mismatch,
                    _ => ChecksumState::Unknown,
                };

                AppliedStatus {
                    identifier: record.identifier.clone(),
                    description: record
                        .description
                        .clone()
                        .or_else(|| unit.map(|u| u.description().to_string())),
                    applied_at: record.applied_at,
                    execution_time_ms: record.execution_time_ms,
                    has_down: unit.map(|u| u.has_down()).unwrap_or(false),
                    checksum,
                    missing: unit.is_none(),
                }
            })
            .collect();

        let latest_applied = ledger.highest_identifier();
        let pending = registry
            .list()
            .iter()
            .filter(|u| !ledger.is_applied(u.identifier()))
            .map(|u| PendingStatus {
                identifier: u.identifier().to_string(),
                description: u.description().to_string(),
                has_down: u.has_down(),
                out_of_order: latest_applied.map(|l| u.identifier() < l).unwrap_or(false),
            })
            .collect();

        Self { applied, pending }
    }

    pub fn is_up_to_date(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn has_drift(&self) -> bool {
        self.applied
            .iter()
            .any(|a| a.missing || a.checksum == ChecksumState::Mismatch)
    }
}
