//! oxide-dbmaintain CLI
//!
//! Command-line tool for keeping a database in sync with its scripts.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

use oxide_dbmaintain::prelude::*;

/// Script-based database maintenance.
#[derive(Parser)]
#[command(name = "oxide-dbmaintain")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (TOML).
    #[arg(short, long, env = "DBMAINTAIN_CONFIG")]
    config: Option<PathBuf>,

    /// Database URL of the default database, overriding the configuration.
    #[arg(short, long, env = "DATABASE_URL")]
    database: Option<String>,

    /// Script location. Repeat for several locations; replaces the
    /// configured ones.
    #[arg(short, long)]
    scripts: Vec<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute new and changed scripts.
    Update {
        /// Recreate the database when scripts changed irregularly.
        #[arg(long)]
        from_scratch: bool,

        /// Allow patch scripts below the highest executed index.
        #[arg(long)]
        allow_out_of_sequence_patches: bool,
    },

    /// Show the scripts an update would execute, without executing them.
    Check,

    /// Record every script as executed without executing it.
    MarkUpToDate,

    /// Drop every database object that is not preserved.
    Clear,

    /// Delete the data of every table that is not preserved.
    Clean,

    /// Disable foreign key and check constraints.
    DisableConstraints,

    /// Raise sequences and identity columns to the lowest acceptable value.
    UpdateSequences,

    /// Record failed scripts as successfully executed.
    MarkErrorScriptPerformed,

    /// Remove failed scripts from the executed scripts table.
    MarkErrorScriptReverted,

    /// Show the executed scripts.
    Status,
}

impl Commands {
    fn needs_scripts(&self) -> bool {
        matches!(self, Self::Update { .. } | Self::Check | Self::MarkUpToDate)
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<MaintainerConfig> {
    let mut config = match &cli.config {
        Some(path) => MaintainerConfig::load(path)?,
        None => MaintainerConfig::new(),
    };

    if let Some(url) = &cli.database {
        match config.databases.first_mut() {
            Some(database) => database.url = url.clone(),
            None => config
                .databases
                .push(DatabaseConfig::new("main", Dialect::Sqlite, url.clone())),
        }
    }
    if !cli.scripts.is_empty() {
        config.scripts.locations = cli.scripts.clone();
    }
    if let Commands::Update {
        from_scratch,
        allow_out_of_sequence_patches,
    } = cli.command
    {
        config.from_scratch_enabled |= from_scratch;
        config.allow_out_of_sequence_patches |= allow_out_of_sequence_patches;
    }
    Ok(config)
}

async fn run(cli: &Cli, maintain: &DbMaintain) -> anyhow::Result<()> {
    match cli.command {
        Commands::Update { .. } => {
            let report = maintain.update_database().await?;
            for (from, to) in &report.renamed_scripts {
                info!("Renamed {} to {}", from, to);
            }
            for file_name in &report.deleted_scripts {
                info!("Removed deleted script {}", file_name);
            }
            if report.recreated_from_scratch {
                info!("Database was recreated from scratch.");
            }
            info!("{} scripts executed.", report.executed_scripts.len());
        }

        Commands::Check => {
            let updates = maintain.check_script_updates().await?;
            if !updates.conflicts().is_empty() {
                warn!("The database will be recreated from scratch:");
                for conflict in updates.conflicts() {
                    println!(" [!] {}", conflict);
                }
            }
            if updates.is_empty() {
                info!("Database is up to date.");
            } else {
                println!("\nScript updates:");
                println!("{:-<60}", "");
                for update in updates.iter() {
                    println!(" [ ] {}", update);
                }
                println!();
            }
        }

        Commands::MarkUpToDate => {
            maintain.mark_database_as_up_to_date().await?;
            info!("All scripts marked as executed.");
        }

        Commands::Clear => {
            maintain.clear_database().await?;
            info!("Database cleared.");
        }

        Commands::Clean => {
            maintain.clean_database().await?;
            info!("Database cleaned.");
        }

        Commands::DisableConstraints => {
            maintain.disable_constraints().await?;
            info!("Constraints disabled.");
        }

        Commands::UpdateSequences => {
            maintain.update_sequences().await?;
            info!("Sequences updated.");
        }

        Commands::MarkErrorScriptPerformed => {
            maintain.mark_error_script_performed().await?;
            info!("Failed scripts marked as executed.");
        }

        Commands::MarkErrorScriptReverted => {
            maintain.mark_error_script_reverted().await?;
            info!("Failed scripts removed.");
        }

        Commands::Status => {
            let executed = maintain.executed_scripts().await?;

            if executed.is_empty() {
                info!("No scripts have been executed yet.");
            } else {
                println!("\nExecuted scripts:");
                println!("{:-<60}", "");

                for script in &executed {
                    println!(
                        " [{}] {} ({})",
                        if script.succeeded() { "X" } else { "!" },
                        script.file_name(),
                        script.executed_at().format("%Y-%m-%d %H:%M:%S")
                    );
                }
                println!();
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(&cli)?;
    let connected = if cli.command.needs_scripts() {
        DbMaintain::connect(config)
    } else {
        DbMaintain::connect_without_scripts(config)
    };
    let maintain = match connected {
        Ok(maintain) => maintain,
        Err(e) if e.is_configuration_error() => {
            anyhow::bail!("Invalid configuration: {}", e)
        }
        Err(e) => return Err(e.into()),
    };

    let result = run(&cli, &maintain).await;
    let closed = maintain.close().await;
    finish(result, closed)
}

/// A command failure takes precedence over a failure to close.
fn finish(result: anyhow::Result<()>, closed: Result<()>) -> anyhow::Result<()> {
    result.and(closed.map_err(anyhow::Error::from))
}
