//! Command-line front end for ledger-based migrations.
//!
//! # Responsibility
//! - Map flags onto `DatabaseConfig` / `MigrateOptions`.
//! - Print migration plans, reports and ledger contents.

use clap::{Args, Parser, Subcommand};
use ledgerlite_core::db::migrations::applied_migrations;
use ledgerlite_core::{
    core_version, default_log_level, init_logging, Database, DatabaseConfig, DbResult,
    DurabilityMode, ForcePolicy, MigrateOptions, PlannedStep,
};
use log::error;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "ledgerlite", version, about = "Reconcile SQLite schemas with migration files")]
struct Cli {
    #[command(flatten)]
    target: TargetArgs,

    /// Directory holding `<id>-<name>.sql` files.
    #[arg(long, global = true, default_value = "migrations")]
    migrations: PathBuf,

    /// Ledger table name.
    #[arg(long, global = true, default_value = "migrations")]
    table: String,

    /// Absolute directory for rolling log files; logging is off when unset.
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct TargetArgs {
    /// SQLite database file.
    #[arg(long, global = true, conflicts_with = "memory")]
    db: Option<PathBuf>,

    /// Use a throwaway in-memory database.
    #[arg(long, global = true)]
    memory: bool,

    /// Fail instead of creating a missing database file.
    #[arg(long, global = true)]
    must_exist: bool,

    /// Switch the journal to write-ahead logging.
    #[arg(long, global = true)]
    wal: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Roll back and apply migrations until the ledger matches the files.
    Migrate {
        /// Roll back and re-apply the last migration file.
        #[arg(long)]
        force_last: bool,

        /// Abort when ledger and files disagree outside the rollback tail.
        #[arg(long)]
        fail_on_drift: bool,
    },
    /// Print the steps `migrate` would run.
    Plan {
        #[arg(long)]
        force_last: bool,
    },
    /// List applied migrations recorded in the ledger.
    Status,
    /// Print the core library version.
    Version,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Some(log_dir) = &cli.log_dir {
        let level = cli.log_level.as_deref().unwrap_or(default_log_level());
        if let Err(err) = init_logging(level, log_dir) {
            eprintln!("ledgerlite: {err}");
            return ExitCode::FAILURE;
        }
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("event=cli_command module=cli status=error error={err}");
            eprintln!("ledgerlite: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> DbResult<()> {
    if let Command::Version = cli.command {
        println!("ledgerlite_core version={}", core_version());
        return Ok(());
    }

    let database = Database::shared(database_config(&cli.target))?;
    let base_options = MigrateOptions::new(&cli.migrations).table(cli.table.clone());

    let outcome = match cli.command {
        Command::Migrate {
            force_last,
            fail_on_drift,
        } => {
            let options = base_options
                .force(force_policy(force_last))
                .fail_on_drift(fail_on_drift);
            database.migrate(options).await.map(|report| {
                println!(
                    "rolled_back={:?} applied={:?}",
                    report.rolled_back, report.applied
                );
            })
        }
        Command::Plan { force_last } => {
            let options = base_options.force(force_policy(force_last));
            database.pending_plan(options).await.map(|plan| {
                if plan.is_empty() {
                    println!("up to date");
                }
                for step in &plan.steps {
                    println!("{}", describe_step(step));
                }
            })
        }
        Command::Status => {
            let handle = database.connection().await?;
            let table = cli.table.clone();
            handle
                .call(move |conn| applied_migrations(conn, &table))
                .await
                .map(|records| {
                    for record in records {
                        println!("{:>6}  {}", record.id, record.name);
                    }
                })
        }
        Command::Version => Ok(()),
    };

    let closed = database.close().await;
    outcome.and(closed)
}

fn database_config(target: &TargetArgs) -> DatabaseConfig {
    let config = match (&target.db, target.memory) {
        (Some(path), false) => DatabaseConfig::file(path),
        _ => DatabaseConfig::memory(),
    };
    let durability = if target.wal {
        DurabilityMode::Wal
    } else {
        DurabilityMode::Default
    };
    config.must_exist(target.must_exist).durability(durability)
}

fn force_policy(force_last: bool) -> ForcePolicy {
    if force_last {
        ForcePolicy::ReapplyLast
    } else {
        ForcePolicy::None
    }
}

fn describe_step(step: &PlannedStep) -> String {
    let verb = match step {
        PlannedStep::Rollback(_) => "rollback",
        PlannedStep::Apply(_) => "apply",
    };
    format!("{verb:<8} {:>6}  {}", step.id(), step.name())
}

#[cfg(test)]
mod tests {
    use super::{database_config, describe_step, Cli, TargetArgs};
    use clap::{CommandFactory, Parser};
    use ledgerlite_core::db::migrations::MigrationFile;
    use ledgerlite_core::{DatabaseTarget, DurabilityMode, PlannedStep};
    use std::path::PathBuf;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn file_target_flags_map_onto_config() {
        let config = database_config(&TargetArgs {
            db: Some(PathBuf::from("/tmp/app.db")),
            memory: false,
            must_exist: true,
            wal: true,
        });
        assert_eq!(
            config.target,
            DatabaseTarget::File(PathBuf::from("/tmp/app.db"))
        );
        assert!(config.must_exist);
        assert_eq!(config.durability, DurabilityMode::Wal);
        assert!(config.migrate.is_none());
    }

    #[test]
    fn missing_db_flag_falls_back_to_memory() {
        let cli = Cli::parse_from(["ledgerlite", "status"]);
        assert_eq!(database_config(&cli.target).target, DatabaseTarget::Memory);
        assert_eq!(cli.migrations, PathBuf::from("migrations"));
    }

    #[test]
    fn describe_step_names_action_and_id() {
        let step = PlannedStep::Apply(MigrationFile {
            id: 7,
            name: "add-index".to_string(),
            up: String::new(),
            down: String::new(),
        });
        let line = describe_step(&step);
        assert!(line.starts_with("apply"));
        assert!(line.contains("7  add-index"));
    }
}
