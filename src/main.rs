use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use esxi_backup::cli::{Cli, Commands};
use esxi_backup::commands::{self, RestoreRequest};
use esxi_backup::config::load_config;
use esxi_backup::error::AppError;
use esxi_backup::interrupt::Interrupt;
use std::io;
use std::process::ExitCode;

const EXIT_INTERRUPTED: u8 = 130;

fn main() -> ExitCode {
    let cli = Cli::parse();
    esxi_backup::init_tracing(cli.verbose);
    tracing::debug!("Starting esxi-backup v{}", env!("CARGO_PKG_VERSION"));

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if matches!(e.downcast_ref::<AppError>(), Some(AppError::Interrupted)) => {
            eprintln!("\nAborted");
            ExitCode::from(EXIT_INTERRUPTED)
        }
        Err(e) => {
            tracing::error!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        return Ok(());
    };

    if let Commands::Init = command {
        commands::cmd_init(cli.config.as_deref()).context("Failed to create sample config")?;
        return Ok(());
    }

    let config = load_config(cli.config.as_deref()).context("Failed to load configuration")?;

    match command {
        Commands::List => commands::cmd_list(&config).context("Failed to list VMs")?,
        Commands::Backup { vm, full, no_prune } => {
            commands::cmd_backup(&config, vm, full, no_prune, Interrupt::install())
                .context("Backup failed")?;
        }
        Commands::Snapshots => commands::cmd_snapshots(&config).context("Failed to list snapshots")?,
        Commands::Restore { vm, snapshot, target, list, yes } => {
            let request = RestoreRequest {
                vm: &vm,
                snapshot: snapshot.as_deref(),
                target: target.as_deref(),
                list_only: list,
                yes,
            };
            commands::cmd_restore(&config, &request, &mut io::stdin().lock())
                .context("Restore failed")?;
        }
        Commands::Init => {}
    }
    Ok(())
}
