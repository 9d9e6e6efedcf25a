use crate::config::{write_sample_config, Config, CONFIG_PATHS};
use crate::engine::{BackupEngine, RunSummary};
use crate::error::{AppError, Result};
use crate::host::HostInventory;
use crate::interrupt::Interrupt;
use crate::records::RecordStore;
use crate::remote::{format_size, SshSession, SshSettings};
use crate::restore::{default_target, list_backups, restore_backup, select_backup, validate_target_path, LISTING_LIMIT};
use crate::snapshot::SnapshotManager;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use tracing::info;

pub fn validate_machine_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(AppError::EmptyMachineName);
    }

    if name.contains('\0') {
        return Err(AppError::InvalidMachineName(name.to_string()));
    }

    // Used as a directory name under the destination
    if name.contains('/') || name.contains('\\') || name == "." || name == ".." {
        return Err(AppError::InvalidMachineName(name.to_string()));
    }

    if name.len() > 80 {
        return Err(AppError::InvalidMachineName(name.to_string()));
    }

    Ok(())
}

fn connect(config: &Config) -> Result<SshSession> {
    let settings = SshSettings::from_config(config)?;
    Ok(SshSession::connect(settings)?)
}

pub fn cmd_list(config: &Config) -> Result<()> {
    let session = connect(config)?;
    let vms = HostInventory::new(&session, &config.datastore_path).list_vms()?;

    println!("\n{:<30} {:<12} {:<20} {:<5}", "Name", "State", "Datastore", "CBT");
    println!("{}", "-".repeat(70));
    for vm in &vms {
        let cbt = if vm.change_tracking { "Yes" } else { "No" };
        println!(
            "{:<30} {:<12} {:<20} {:<5}",
            vm.name,
            vm.power_state.as_str(),
            vm.datastore,
            cbt
        );
    }
    println!("\nTotal: {} VMs", vms.len());
    Ok(())
}

pub fn cmd_backup(
    config: &Config,
    vm: Option<String>,
    full: bool,
    no_prune: bool,
    interrupt: Interrupt,
) -> Result<RunSummary> {
    if let Some(name) = &vm {
        validate_machine_name(name)?;
    }
    let requested: Vec<String> = vm.into_iter().collect();

    let session = connect(config)?;
    let engine = BackupEngine::new(&session, config, interrupt);

    engine.prepare_change_tracking(&requested)?;
    let summary = engine.backup_all(&requested, full)?;

    if !no_prune {
        let report = engine.apply_retention(false)?;
        info!(
            "Retention: {} kept, {} removed, {} skipped",
            report.kept,
            report.pruned.len(),
            report.skipped
        );
    }

    match summary.failures() {
        0 => Ok(summary),
        failed => Err(AppError::BackupIncomplete(failed)),
    }
}

pub fn cmd_snapshots(config: &Config) -> Result<()> {
    let session = connect(config)?;
    let manager = SnapshotManager::new(&session);

    for vm in HostInventory::new(&session, &config.datastore_path).list_vms()? {
        let snapshots = manager.list_snapshots(&vm)?;
        if snapshots.is_empty() {
            continue;
        }
        println!("\n{}:", vm.name);
        for snapshot in snapshots {
            println!("  {} (id {})", snapshot.name, snapshot.id);
        }
    }
    Ok(())
}

pub struct RestoreRequest<'a> {
    pub vm: &'a str,
    pub snapshot: Option<&'a str>,
    pub target: Option<&'a str>,
    pub list_only: bool,
    pub yes: bool,
}

pub fn cmd_restore(config: &Config, request: &RestoreRequest<'_>, input: &mut impl BufRead) -> Result<()> {
    validate_machine_name(request.vm)?;
    let store = RecordStore::new(config.destination());
    let backups = list_backups(&store, request.vm)?;

    println!("\nAvailable backups for {}:", request.vm);
    for (index, backup) in backups.iter().take(LISTING_LIMIT).enumerate() {
        let detail = match &backup.record {
            Some(record) if record.incremental => format!("{}, incremental", format_size(record.total_bytes)),
            Some(record) => format_size(record.total_bytes),
            None => "unknown".to_string(),
        };
        println!("  [{}] {} ({})", index, backup.name, detail);
    }

    if request.list_only {
        return Ok(());
    }

    let selected = select_backup(&store, request.vm, request.snapshot)?;
    let target = match request.target {
        Some(target) => validate_target_path(target)?,
        None => default_target(request.vm)?,
    };

    println!("\nRestoring from: {}", selected.name);
    println!("Files will be copied to: {}", target.display());

    if !request.yes && !confirm(input)? {
        println!("Aborted");
        return Ok(());
    }

    let report = restore_backup(&selected, &target)?;
    println!(
        "\nRestore complete: {} ({} files, {})",
        report.target.display(),
        report.files.len(),
        format_size(report.bytes)
    );
    Ok(())
}

fn confirm(input: &mut impl BufRead) -> Result<bool> {
    print!("Continue? [y/N] ");
    io::stdout().flush()?;

    let mut answer = String::new();
    input.read_line(&mut answer)?;
    Ok(answer.trim().eq_ignore_ascii_case("y"))
}

/// Writes the sample configuration to `path`, or the first search location.
pub fn cmd_init(path: Option<&Path>) -> Result<PathBuf> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => CONFIG_PATHS[0].clone(),
    };

    write_sample_config(&path)?;
    println!("Created sample config: {}", path.display());
    println!("Edit this file with your ESXi host details before running backup.");
    Ok(path)
}
