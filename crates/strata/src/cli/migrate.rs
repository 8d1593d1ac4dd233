use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use console::style;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use strata_core::config::StrataConfig;
use strata_core::error::StrataError;
use strata_core::planner::Plan;
use strata_core::registry::MigrationRegistry;
use strata_core::unit::{render_template, slugify, Direction};
use strata_runtime::migrations::{ChecksumState, MigrationRunner, MigrationStatus, RunReport};

/// Manage database migrations.
#[derive(Parser)]
pub struct MigrateCommand {
    #[command(subcommand)]
    pub action: MigrateAction,

    /// Configuration file path.
    #[arg(short, long, default_value = "strata.toml", global = true)]
    pub config: String,

    /// Migrations directory path (overrides the config file).
    #[arg(short, long, global = true)]
    pub migrations_dir: Option<PathBuf>,

    /// Database URL (overrides the config file and DATABASE_URL).
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    /// Log at debug level.
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum MigrateAction {
    /// Apply all pending migrations.
    Up {
        /// Print the plan without executing it.
        #[arg(long)]
        dry_run: bool,
    },

    /// Roll back the most recently applied migrations.
    Down {
        /// Number of migrations to roll back.
        #[arg(long, default_value_t = 1)]
        steps: usize,

        /// Print the plan without executing it.
        #[arg(long)]
        dry_run: bool,
    },

    /// Show applied and pending migrations.
    Status {
        /// Print machine-readable JSON.
        #[arg(long)]
        json: bool,
    },

    /// Clear a migration lock left behind by a crashed run.
    Unlock,

    /// Create a new migration file.
    New {
        /// Short description, used for the file name.
        name: String,
    },
}

impl MigrateCommand {
    pub async fn execute(self) -> Result<()> {
        // Load .env if present
        dotenvy::dotenv().ok();

        let config = self.load_config()?;
        super::init_logging(&config.logging, self.verbose);

        if let MigrateAction::New { name } = &self.action {
            let path = create_unit_file(&config.migrations.dir, name, Utc::now())?;
            println!();
            println!("  {} Created {}", style("✓").green(), path.display());
            println!();
            return Ok(());
        }

        let registry = match self.action {
            MigrateAction::Unlock => MigrationRegistry::default(),
            _ => MigrationRegistry::from_dir(&config.migrations.dir)?,
        };
        let backend = strata_runtime::connect(&config).await?;
        let runner = MigrationRunner::new(backend, registry)
            .verify_checksums(config.migrations.verify_checksums);

        match self.action {
            MigrateAction::Up { dry_run } => {
                print_header("Migrations");

                if runner.registry().is_empty() {
                    println!(
                        "  {} No migrations found in {}",
                        style("ℹ").blue(),
                        config.migrations.dir.display()
                    );
                    println!();
                    return Ok(());
                }

                if dry_run {
                    print_plan(&runner.plan_up().await?);
                    return Ok(());
                }

                println!("  {} Running pending migrations...", style("→").dim());
                let report = runner.up(&interrupt_token()).await?;
                print_report(&report);
                report.into_result()?;
            }

            MigrateAction::Down { steps, dry_run } => {
                print_header("Migrations");

                if steps == 0 {
                    println!("  {} Nothing to roll back (steps=0)", style("ℹ").blue());
                    println!();
                    return Ok(());
                }

                if dry_run {
                    print_plan(&runner.plan_down(steps).await?);
                    return Ok(());
                }

                println!(
                    "  {} Rolling back {} migration(s)...",
                    style("→").dim(),
                    steps
                );
                let report = runner.down(steps, &interrupt_token()).await?;
                print_report(&report);
                report.into_result()?;
            }

            MigrateAction::Status { json } => {
                let status = runner.status().await?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&status)?);
                } else {
                    print_header("Migration Status");
                    print_status(&status);
                }
            }

            MigrateAction::Unlock => {
                print_header("Migrations");
                if runner.force_unlock().await? {
                    println!("  {} Cleared migration lock", style("✓").green());
                } else {
                    println!("  {} No lock to clear", style("ℹ").blue());
                }
                println!();
            }

            MigrateAction::New { .. } => {}
        }

        Ok(())
    }

    /// Config file if present, otherwise defaults; flags override both.
    fn load_config(&self) -> Result<StrataConfig> {
        let config_path = Path::new(&self.config);
        let mut config = if config_path.exists() {
            StrataConfig::from_file(config_path)?
        } else {
            let url = std::env::var("DATABASE_URL").unwrap_or_default();
            StrataConfig::default_with_database_url(&url)
        };

        if let Some(url) = &self.database_url {
            config.database.url = url.clone();
        }
        if let Some(dir) = &self.migrations_dir {
            config.migrations.dir = dir.clone();
        }

        if config.database.url.is_empty() && !matches!(self.action, MigrateAction::New { .. }) {
            return Err(StrataError::Config(format!(
                "No database URL. Create {}, set DATABASE_URL, or pass --database-url",
                self.config
            ))
            .into());
        }
        Ok(config)
    }
}

/// Cancelled on Ctrl-C; the runner stops before the next unit.
fn interrupt_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; stopping after the current migration");
            token.cancel();
        }
    });
    cancel
}

/// Write a skeleton `<timestamp>_<slug>.sql` unit into `dir`.
fn create_unit_file(dir: &Path, name: &str, now: DateTime<Utc>) -> Result<PathBuf> {
    let slug = slugify(name);
    if slug.is_empty() {
        return Err(StrataError::InvalidMigration(format!(
            "'{}' has no usable characters for a file name",
            name
        ))
        .into());
    }

    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}_{}.sql", now.format("%Y%m%d%H%M%S"), slug));
    if path.exists() {
        anyhow::bail!("Migration file already exists: {}", path.display());
    }

    std::fs::write(&path, render_template(name))?;
    Ok(path)
}

fn print_header(title: &str) {
    println!();
    println!(
        "  {}  {} {}",
        style("⛁").bold(),
        style("STRATA").bold().cyan(),
        title
    );
    println!();
}

fn print_plan(plan: &Plan) {
    for warning in &plan.warnings {
        println!("  {} {}", style("⚠").yellow(), warning);
    }

    if plan.is_empty() {
        println!("  {} Nothing to do", style("ℹ").blue());
        println!();
        return;
    }

    let verb = match plan.direction {
        Direction::Up => "apply",
        Direction::Down => "roll back",
    };
    println!(
        "  {} Would {} {} migration(s):",
        style("ℹ").blue(),
        verb,
        plan.len()
    );
    for unit in &plan.units {
        println!(
            "    {} {} {}",
            style("→").dim(),
            style(unit.identifier()).cyan(),
            style(unit.description()).dim()
        );
    }
    println!();
}

fn print_report(report: &RunReport) {
    let verb = match report.direction {
        Direction::Up => "Applied",
        Direction::Down => "Rolled back",
    };

    for warning in &report.warnings {
        println!("  {} {}", style("⚠").yellow(), warning);
    }

    for unit in &report.completed {
        println!(
            "  {} {}: {} {}",
            style("✓").green(),
            verb,
            style(&unit.identifier).cyan(),
            style(format!("({} ms)", unit.duration_ms)).dim()
        );
    }

    if let Some(failed) = &report.failed {
        println!(
            "  {} Failed: {}",
            style("✗").red(),
            style(&failed.identifier).red()
        );
    }

    if report.cancelled {
        println!("  {} Cancelled", style("○").yellow());
    }

    if !report.remaining.is_empty() {
        println!();
        println!("  {} Not run:", style("○").yellow());
        for id in &report.remaining {
            println!("    {} {}", style("→").dim(), style(id).yellow());
        }
    }

    if report.is_success() {
        if report.completed.is_empty() {
            println!("  {} Already up to date", style("ℹ").blue());
        } else {
            println!();
            println!(
                "  {} {} {} migration(s)",
                style("✓").green(),
                verb,
                report.completed.len()
            );
        }
    }
    println!();
}

fn status_summary(status: &MigrationStatus) -> String {
    let summary = format!(
        "{} applied, {} pending",
        status.applied.len(),
        status.pending.len()
    );
    if status.is_up_to_date() {
        format!("{} (up to date)", summary)
    } else {
        summary
    }
}

fn print_status(status: &MigrationStatus) {
    if status.applied.is_empty() && status.pending.is_empty() {
        println!("  {} No migrations found", style("ℹ").blue());
        println!();
        return;
    }

    if !status.applied.is_empty() {
        println!("  {} Applied:", style("✓").green());
        for m in &status.applied {
            let down_marker = if m.has_down {
                style("↓").green().to_string()
            } else {
                style("-").dim().to_string()
            };
            let note = if m.missing {
                style(" missing from source").red().to_string()
            } else if m.checksum == ChecksumState::Mismatch {
                style(" checksum mismatch").red().to_string()
            } else {
                String::new()
            };
            println!(
                "    {} {} {} ({}){}",
                down_marker,
                style(&m.identifier).cyan(),
                style("at").dim(),
                m.applied_at.format("%Y-%m-%d %H:%M:%S"),
                note
            );
        }
    }

    if !status.pending.is_empty() {
        if !status.applied.is_empty() {
            println!();
        }
        println!("  {} Pending:", style("○").yellow());
        for m in &status.pending {
            let note = if m.out_of_order {
                style(" out of order").yellow().to_string()
            } else {
                String::new()
            };
            println!(
                "    {} {}{}",
                style("→").dim(),
                style(&m.identifier).yellow(),
                note
            );
        }
    }

    println!();
    println!("  {} {}", style("ℹ").blue(), status_summary(status));
    if status.has_drift() {
        println!(
            "  {} Ledger has drifted from the migrations directory",
            style("!").red()
        );
    }
    println!();

    // Legend
    println!(
        "  {} = has down migration, {} = no down migration",
        style("↓").green(),
        style("-").dim()
    );
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use clap::Parser;
    use strata_core::ledger::{Ledger, MigrationRecord};
    use strata_core::unit::MigrationUnit;

    fn command(args: &[&str]) -> MigrateCommand {
        let mut argv = vec!["migrate"];
        argv.extend_from_slice(args);
        MigrateCommand::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_create_unit_file() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc.with_ymd_and_hms(2026, 2, 2, 19, 33, 46).unwrap();

        let path = create_unit_file(&dir.path().join("migrations"), "Add Users table", now).unwrap();
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "20260202193346_add_users_table.sql"
        );

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("-- description: Add Users table"));
        assert!(content.contains("-- @up"));
        assert!(content.contains("-- @down"));

        let err = create_unit_file(&dir.path().join("migrations"), "Add Users table", now).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn test_created_file_loads_once_filled_in() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
        let path = create_unit_file(dir.path(), "create accounts", now).unwrap();

        let filled = std::fs::read_to_string(&path)
            .unwrap()
            .replace(
                "-- @up\n",
                "-- @up\nCREATE TABLE accounts (id BIGINT PRIMARY KEY);\n",
            )
            .replace("-- @down\n", "-- @down\nDROP TABLE accounts;\n");
        std::fs::write(&path, filled).unwrap();

        let unit = MigrationUnit::from_file(&path).unwrap();
        assert_eq!(unit.identifier(), "20260301080000");
        assert_eq!(unit.description(), "create accounts");
        assert_eq!(unit.up().len(), 1);
        assert!(unit.has_down());
    }

    #[test]
    fn test_create_unit_file_rejects_empty_slug() {
        let dir = tempfile::tempdir().unwrap();
        let err = create_unit_file(dir.path(), "!!!", Utc::now()).unwrap_err();
        assert_eq!(err.downcast_ref::<StrataError>().unwrap().exit_code(), 18);
    }

    #[test]
    fn test_load_config_flags_override_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("strata.toml");
        std::fs::write(
            &config_path,
            r#"
[database]
url = "postgres://localhost/app"

[migrations]
dir = "db/migrations"
ledger_table = "app_migrations"
"#,
        )
        .unwrap();
        let config_arg = config_path.to_str().unwrap();

        let config = command(&["--config", config_arg, "status"]).load_config().unwrap();
        assert_eq!(config.database.url, "postgres://localhost/app");
        assert_eq!(config.migrations.dir, PathBuf::from("db/migrations"));
        assert_eq!(config.migrations.ledger_table, "app_migrations");

        let config = command(&[
            "--config",
            config_arg,
            "--database-url",
            "sqlite://override.db",
            "--migrations-dir",
            "other",
            "status",
        ])
        .load_config()
        .unwrap();
        assert_eq!(config.database.url, "sqlite://override.db");
        assert_eq!(config.migrations.dir, PathBuf::from("other"));
        assert_eq!(config.migrations.ledger_table, "app_migrations");
    }

    #[test]
    fn test_load_config_without_file_uses_flag_url() {
        let config = command(&[
            "--config",
            "/nonexistent/strata.toml",
            "--database-url",
            "memory:",
            "up",
        ])
        .load_config()
        .unwrap();
        assert_eq!(config.database.url, "memory:");
        assert_eq!(config.migrations.ledger_table, "strata_migrations");
    }

    #[test]
    fn test_new_does_not_need_database() {
        let cmd = command(&["--config", "/nonexistent/strata.toml", "new", "add users"]);
        assert!(cmd.load_config().is_ok());
    }

    #[test]
    fn test_status_summary_and_drift() {
        let a = MigrationUnit::new("0001", "a", vec!["CREATE TABLE a (id INT)".into()], vec![]).unwrap();
        let b = MigrationUnit::new("0002", "b", vec!["CREATE TABLE b (id INT)".into()], vec![]).unwrap();
        let registry = MigrationRegistry::new(vec![a.clone(), b]).unwrap();
        let applied_at = Utc.with_ymd_and_hms(2026, 1, 5, 12, 0, 0).unwrap();

        let ledger = Ledger::new(vec![MigrationRecord::for_unit(&a, applied_at, 4)]);
        let status = MigrationStatus::build(&registry, &ledger);
        assert_eq!(status_summary(&status), "1 applied, 1 pending");
        assert!(!status.has_drift());

        let mut edited = MigrationRecord::for_unit(&a, applied_at, 4);
        edited.checksum = Some("0".repeat(64));
        let ledger = Ledger::new(vec![
            edited,
            MigrationRecord::for_unit(registry.get("0002").unwrap(), applied_at, 2),
        ]);
        let status = MigrationStatus::build(&registry, &ledger);
        assert_eq!(status_summary(&status), "2 applied, 0 pending (up to date)");
        assert!(status.has_drift());
    }
}
