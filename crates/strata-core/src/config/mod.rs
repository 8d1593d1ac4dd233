mod database;
mod logging;

pub use database::{redact_url, DatabaseConfig, Dialect};
pub use logging::{LogFormat, LoggingConfig};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, StrataError};

/// Root configuration for STRATA.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrataConfig {
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Migration source and ledger configuration.
    #[serde(default)]
    pub migrations: MigrationsConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl StrataConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| StrataError::Config(format!("Failed to read config file: {}", e)))?;

        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse_toml(content: &str) -> Result<Self> {
        let content = substitute_env_vars(content)?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| StrataError::Config(format!("Failed to parse config: {}", e)))?;
        config.migrations.validate()?;
        Ok(config)
    }

    /// Configuration with defaults and the given database URL.
    pub fn default_with_database_url(url: &str) -> Self {
        Self {
            database: DatabaseConfig {
                url: url.to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// Migration source and bookkeeping configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationsConfig {
    /// Directory holding `*.sql` migration units.
    #[serde(default = "default_dir")]
    pub dir: PathBuf,

    /// Ledger table name.
    #[serde(default = "default_ledger_table")]
    pub ledger_table: String,

    /// Lock table name, for backends without native advisory locks.
    #[serde(default = "default_lock_table")]
    pub lock_table: String,

    /// Advisory lock key, for backends with native advisory locks.
    #[serde(default = "default_lock_id")]
    pub lock_id: i64,

    /// Refuse to migrate up when an applied unit's content changed.
    #[serde(default = "default_true")]
    pub verify_checksums: bool,
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self {
            dir: default_dir(),
            ledger_table: default_ledger_table(),
            lock_table: default_lock_table(),
            lock_id: default_lock_id(),
            verify_checksums: true,
        }
    }
}

impl MigrationsConfig {
    /// Table names are interpolated into SQL, so only plain identifiers pass.
    pub fn validate(&self) -> Result<()> {
        validate_table_name(&self.ledger_table)?;
        validate_table_name(&self.lock_table)?;
        if self.ledger_table == self.lock_table {
            return Err(StrataError::Config(
                "ledger_table and lock_table must differ".into(),
            ));
        }
        Ok(())
    }
}

fn default_dir() -> PathBuf {
    PathBuf::from("migrations")
}

fn default_ledger_table() -> String {
    "strata_migrations".to_string()
}

fn default_lock_table() -> String {
    "strata_lock".to_string()
}

/// "STRAT" in hex.
fn default_lock_id() -> i64 {
    0x5354524154
}

fn default_true() -> bool {
    true
}

fn validate_table_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };

    if valid && name.len() <= 63 {
        Ok(())
    } else {
        Err(StrataError::Config(format!(
            "Invalid table name '{}': use letters, digits and underscores",
            name
        )))
    }
}

/// Substitute environment variables in the format ${VAR_NAME}.
fn substitute_env_vars(content: &str) -> Result<String> {
    let mut result = content.to_string();
    let re = regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}")
        .map_err(|e| StrataError::Config(e.to_string()))?;

    for cap in re.captures_iter(content) {
        let var_name = &cap[1];
        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(&cap[0], &value);
        }
    }

    Ok(result)
}
