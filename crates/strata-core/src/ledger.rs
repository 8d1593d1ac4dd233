use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::unit::MigrationUnit;

/// One applied migration, as persisted in the ledger table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub identifier: String,
    pub description: Option<String>,
    pub checksum: Option<String>,
    pub applied_at: DateTime<Utc>,
    pub execution_time_ms: Option<i64>,
}

impl MigrationRecord {
    /// Record for a unit whose forward statements just succeeded.
    pub fn for_unit(unit: &MigrationUnit, applied_at: DateTime<Utc>, execution_time_ms: i64) -> Self {
        Self {
            identifier: unit.identifier().to_string(),
            description: Some(unit.description().to_string()).filter(|d| !d.is_empty()),
            checksum: Some(unit.checksum().to_string()),
            applied_at,
            execution_time_ms: Some(execution_time_ms),
        }
    }
}

/// Point-in-time view of the ledger.
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    records: Vec<MigrationRecord>,
}

impl Ledger {
    pub fn new(records: Vec<MigrationRecord>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[MigrationRecord] {
        &self.records
    }

    pub fn applied_ids(&self) -> BTreeSet<&str> {
        self.records.iter().map(|r| r.identifier.as_str()).collect()
    }

    pub fn get(&self, identifier: &str) -> Option<&MigrationRecord> {
        self.records.iter().find(|r| r.identifier == identifier)
    }

    pub fn is_applied(&self, identifier: &str) -> bool {
        self.get(identifier).is_some()
    }

    /// Records newest first: applied_at descending, ties broken by identifier descending.
    pub fn most_recent_first(&self) -> Vec<&MigrationRecord> {
        let mut records: Vec<&MigrationRecord> = self.records.iter().collect();
        records.sort_by(|a, b| {
            b.applied_at
                .cmp(&a.applied_at)
                .then_with(|| b.identifier.cmp(&a.identifier))
        });
        records
    }

    pub fn highest_identifier(&self) -> Option<&str> {
        self.records.iter().map(|r| r.identifier.as_str()).max()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(id: &str, secs: i64) -> MigrationRecord {
        MigrationRecord {
            identifier: id.to_string(),
            description: None,
            checksum: None,
            applied_at: Utc.timestamp_opt(secs, 0).unwrap(),
            execution_time_ms: None,
        }
    }

    #[test]
    fn test_most_recent_first_orders_by_time_then_identifier() {
        let ledger = Ledger::new(vec![
            record("0001", 100),
            record("0003", 200),
            record("0002", 200),
            record("0004", 150),
        ]);

        let ids: Vec<&str> = ledger
            .most_recent_first()
            .iter()
            .map(|r| r.identifier.as_str())
            .collect();
        assert_eq!(ids, vec!["0003", "0002", "0004", "0001"]);
    }

    #[test]
    fn test_applied_ids_and_highest() {
        let ledger = Ledger::new(vec![record("b", 1), record("a", 2)]);
        assert_eq!(ledger.applied_ids().into_iter().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(ledger.highest_identifier(), Some("b"));
        assert!(ledger.is_applied("a"));
        assert!(!ledger.is_applied("c"));
        assert!(Ledger::default().highest_identifier().is_none());
    }

    #[test]
    fn test_record_for_unit() {
        let unit = MigrationUnit::new("0001", "create users", vec!["SELECT 1".into()], vec![]).unwrap();
        let now = Utc::now();
        let record = MigrationRecord::for_unit(&unit, now, 12);
        assert_eq!(record.identifier, "0001");
        assert_eq!(record.description.as_deref(), Some("create users"));
        assert_eq!(record.checksum.as_deref(), Some(unit.checksum()));
        assert_eq!(record.execution_time_ms, Some(12));
    }
}
