use serde::{Deserialize, Serialize};

use crate::error::{Result, StrataError};

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Target database connection URL.
    #[serde(default)]
    pub url: String,

    /// Connection pool size.
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Pool checkout timeout in seconds.
    #[serde(default = "default_pool_timeout")]
    pub pool_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            pool_size: default_pool_size(),
            pool_timeout_secs: default_pool_timeout(),
        }
    }
}

impl DatabaseConfig {
    /// Dialect implied by the URL scheme.
    pub fn dialect(&self) -> Result<Dialect> {
        Dialect::from_url(&self.url)
    }
}

// A migration run needs one connection for the lock and one for the unit
// transaction; a little headroom covers status queries.
fn default_pool_size() -> u32 {
    5
}

fn default_pool_timeout() -> u64 {
    30
}

/// SQL dialect of the target store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Postgres,
    Sqlite,
    Memory,
}

impl Dialect {
    /// Infer the dialect from a connection URL.
    pub fn from_url(url: &str) -> Result<Self> {
        if url.is_empty() {
            return Err(StrataError::Config(
                "Database URL is empty. Set [database].url or pass --database-url".into(),
            ));
        }

        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Ok(Dialect::Postgres)
        } else if url.starts_with("sqlite:") {
            Ok(Dialect::Sqlite)
        } else if url.starts_with("memory:") {
            Ok(Dialect::Memory)
        } else {
            Err(StrataError::Config(format!(
                "Unsupported database URL scheme: {}",
                redact_url(url)
            )))
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::Postgres => "postgres",
            Dialect::Sqlite => "sqlite",
            Dialect::Memory => "memory",
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strip the password from a URL before it reaches logs or error messages.
pub fn redact_url(url: &str) -> String {
    let Some(scheme_end) = url.find("://") else {
        return url.to_string();
    };
    let rest = &url[scheme_end + 3..];
    let Some(at) = rest.find('@') else {
        return url.to_string();
    };
    let credentials = &rest[..at];
    match credentials.find(':') {
        Some(colon) => format!(
            "{}://{}:***{}",
            &url[..scheme_end],
            &credentials[..colon],
            &rest[at..]
        ),
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_database_config() {
        let config = DatabaseConfig::default();
        assert_eq!(config.pool_size, 5);
        assert_eq!(config.pool_timeout_secs, 30);
        assert!(config.url.is_empty());
    }

    #[test]
    fn test_parse_database_config() {
        let toml = r#"
            url = "postgres://localhost/test"
            pool_size = 2
        "#;

        let config: DatabaseConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.pool_size, 2);
        assert_eq!(config.dialect().unwrap(), Dialect::Postgres);
    }

    #[test]
    fn test_dialect_from_url() {
        assert_eq!(
            Dialect::from_url("postgresql://u@h/db").unwrap(),
            Dialect::Postgres
        );
        assert_eq!(
            Dialect::from_url("sqlite://app.db").unwrap(),
            Dialect::Sqlite
        );
        assert_eq!(Dialect::from_url("memory:").unwrap(), Dialect::Memory);
        assert!(matches!(
            Dialect::from_url("mysql://h/db"),
            Err(StrataError::Config(_))
        ));
        assert!(Dialect::from_url("").is_err());
    }

    #[test]
    fn test_redact_url() {
        assert_eq!(
            redact_url("postgres://app:secret@db:5432/app"),
            "postgres://app:***@db:5432/app"
        );
        assert_eq!(redact_url("postgres://db/app"), "postgres://db/app");
        assert_eq!(redact_url("sqlite:app.db"), "sqlite:app.db");
    }
}
