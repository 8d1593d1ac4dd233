use std::path::Path;

use tracing::debug;

use crate::error::{Result, StrataError};
use crate::unit::MigrationUnit;

/// All known migration units, sorted by identifier.
#[derive(Debug, Clone, Default)]
pub struct MigrationRegistry {
    units: Vec<MigrationUnit>,
}

impl MigrationRegistry {
    /// Build a registry from units in any order.
    pub fn new(mut units: Vec<MigrationUnit>) -> Result<Self> {
        units.sort_by(|a, b| a.identifier().cmp(b.identifier()));

        if let Some(pair) = units
            .windows(2)
            .find(|pair| pair[0].identifier() == pair[1].identifier())
        {
            debug!(
                "Duplicate identifier {} in {:?} and {:?}",
                pair[0].identifier(),
                pair[0].source(),
                pair[1].source()
            );
            return Err(StrataError::DuplicateIdentifier(
                pair[0].identifier().to_string(),
            ));
        }

        Ok(Self { units })
    }

    /// Load units from a directory.
    ///
    /// Migrations should be named like:
    /// - `20260202193346_create_users.sql`
    /// - `20260203090000_add_posts.sql`
    ///
    /// Non-`.sql` files are ignored; a missing directory is an empty registry.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        if !dir.exists() {
            debug!("Migrations directory does not exist: {:?}", dir);
            return Ok(Self::default());
        }

        let mut units = Vec::new();

        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();

            if path.is_file() && path.extension().map(|e| e == "sql").unwrap_or(false) {
                units.push(MigrationUnit::from_file(&path)?);
            }
        }

        debug!("Loaded {} migrations from {:?}", units.len(), dir);
        Self::new(units)
    }

    /// Units in ascending identifier order.
    pub fn list(&self) -> &[MigrationUnit] {
        &self.units
    }

    pub fn get(&self, identifier: &str) -> Option<&MigrationUnit> {
        self.units
            .binary_search_by(|u| u.identifier().cmp(identifier))
            .ok()
            .map(|idx| &self.units[idx])
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.get(identifier).is_some()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}
