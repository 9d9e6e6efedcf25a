//! Drives backups of one or many machines and reports the run.

use crate::cbt::{current_change_identifier, ChangeTracking};
use crate::config::Config;
use crate::error::{AppError, Result};
use crate::host::HostInventory;
use crate::interrupt::Interrupt;
use crate::models::{BackupRecord, BackupTimestamp, VirtualMachine};
use crate::planner::{plan_backup, BackupPlan};
use crate::records::RecordStore;
use crate::remote::{format_size, RemoteChannel};
use crate::retention::{self, RetentionReport};
use crate::snapshot::SnapshotManager;
use crate::transfer::{DiskOutcome, TransferOrchestrator};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineStatus {
    Succeeded,
    Failed,
    NotAttempted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MachineOutcome {
    pub machine: String,
    pub status: MachineStatus,
    pub bytes: u64,
    /// Sources that could not be captured, disks or the `.vmx` file.
    pub failed_disks: Vec<String>,
    pub error: Option<String>,
    pub record: Option<BackupRecord>,
}

impl MachineOutcome {
    fn failed(machine: &str, error: &AppError) -> Self {
        Self {
            machine: machine.to_string(),
            status: MachineStatus::Failed,
            bytes: 0,
            failed_disks: Vec::new(),
            error: Some(error.to_string()),
            record: None,
        }
    }

    fn not_attempted(machine: &str) -> Self {
        Self {
            machine: machine.to_string(),
            status: MachineStatus::NotAttempted,
            bytes: 0,
            failed_disks: Vec::new(),
            error: None,
            record: None,
        }
    }

    pub fn success(&self) -> bool {
        self.status == MachineStatus::Succeeded
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub outcomes: Vec<MachineOutcome>,
}

impl RunSummary {
    pub fn total_bytes(&self) -> u64 {
        self.outcomes.iter().map(|o| o.bytes).sum()
    }

    pub fn failures(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.success()).count()
    }

    pub fn lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for outcome in &self.outcomes {
            let status = match outcome.status {
                MachineStatus::Succeeded => "OK",
                MachineStatus::Failed => "FAILED",
                MachineStatus::NotAttempted => "NOT ATTEMPTED",
            };
            lines.push(format!(
                "  {}: {} ({})",
                outcome.machine,
                status,
                format_size(outcome.bytes)
            ));
            for disk in &outcome.failed_disks {
                lines.push(format!("    failed: {}", disk));
            }
            if let Some(reason) = &outcome.error {
                lines.push(format!("    error: {}", reason));
            }
        }
        lines.push(format!("Total backup size: {}", format_size(self.total_bytes())));
        lines
    }

    pub fn log(&self) {
        info!("{}", "=".repeat(50));
        info!("BACKUP SUMMARY");
        info!("{}", "=".repeat(50));
        for line in self.lines() {
            info!("{}", line);
        }
    }
}

/// Picks machines by explicit names, else the configured list, minus exclusions.
///
/// Returns the selection in host order plus requested names the host does not know.
pub fn select_machines(
    vms: Vec<VirtualMachine>,
    requested: &[String],
    configured: &[String],
    excluded: &[String],
) -> (Vec<VirtualMachine>, Vec<String>) {
    let wanted = if requested.is_empty() { configured } else { requested };

    let missing = wanted
        .iter()
        .filter(|name| !vms.iter().any(|vm| &vm.name == *name))
        .cloned()
        .collect();

    let selected = vms
        .into_iter()
        .filter(|vm| wanted.is_empty() || wanted.contains(&vm.name))
        .filter(|vm| !excluded.contains(&vm.name))
        .collect();

    (selected, missing)
}

pub struct BackupEngine<'a> {
    channel: &'a dyn RemoteChannel,
    config: &'a Config,
    store: RecordStore,
    interrupt: Interrupt,
}

impl<'a> BackupEngine<'a> {
    pub fn new(channel: &'a dyn RemoteChannel, config: &'a Config, interrupt: Interrupt) -> Self {
        Self {
            channel,
            config,
            store: RecordStore::new(config.destination()),
            interrupt,
        }
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    fn inventory(&self) -> HostInventory<'a> {
        HostInventory::new(self.channel, &self.config.datastore_path)
    }

    /// Backs up the named machine now.
    pub fn backup_vm(&self, machine: &str, force_full: bool) -> Result<MachineOutcome> {
        let vm = self.inventory().vm_by_name(machine)?;
        self.backup_machine(&vm, BackupTimestamp::now(), force_full)
    }

    /// Backs up `vm` under `timestamp`.
    ///
    /// Failed disks are reported in the outcome and still produce a record;
    /// any error before the record is written removes the backup directory.
    #[instrument(skip(self, vm), fields(vm = %vm.name))]
    pub fn backup_machine(
        &self,
        vm: &VirtualMachine,
        timestamp: BackupTimestamp,
        force_full: bool,
    ) -> Result<MachineOutcome> {
        info!("{}", "=".repeat(50));
        info!("Starting backup of: {}", vm.name);
        info!("Power state: {}", vm.power_state);

        let plan = plan_backup(
            &self.store,
            &vm.name,
            timestamp,
            force_full,
            self.config.backup.use_cbt,
        )?;

        let dir = self.store.create_instance_dir(&vm.name, &timestamp)?;
        match self.capture(vm, &plan, &dir) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                if let Err(cleanup) = fs::remove_dir_all(&dir) {
                    warn!("Failed to remove incomplete backup {:?}: {}", dir, cleanup);
                } else {
                    debug!("Removed incomplete backup {:?}", dir);
                }
                Err(e)
            }
        }
    }

    fn capture(&self, vm: &VirtualMachine, plan: &BackupPlan, dir: &Path) -> Result<MachineOutcome> {
        let label = format!("backup_{}", plan.timestamp);
        let snapshot = SnapshotManager::new(self.channel).acquire(vm, &label, true)?;

        let disks = self.inventory().vm_disks(vm)?;
        info!("Found {} disk(s)", disks.len());
        if self.config.backup.parallel_transfers > 1 {
            debug!("parallel_transfers is not enforced, copying disks one at a time");
        }

        let orchestrator = TransferOrchestrator::new(
            self.channel,
            &self.config.backup.scratch_dir,
            self.config.backup.verify_after_backup,
        );

        let mut artifacts = Vec::new();
        let mut failed = Vec::new();
        let mut total_bytes = 0;
        for disk in &disks {
            self.interrupt.check()?;
            match orchestrator.transfer_disk(disk, dir, plan.incremental)? {
                DiskOutcome::Copied(copied) => {
                    total_bytes += copied.bytes;
                    artifacts.push(copied.to_artifact());
                }
                DiskOutcome::Failed { source, .. } => failed.push(source),
            }
        }
        self.interrupt.check()?;

        let vmx_local = dir.join(vmx_file_name(vm));
        info!("Backing up VMX: {}", vmx_local.display());
        if let Err(e) = self.channel.download(&vm.vmx_path, &vmx_local) {
            let e = AppError::from(e);
            if e.is_fatal() {
                return Err(e);
            }
            warn!("Failed to copy {}: {}", vm.vmx_path, e);
            failed.push(vm.vmx_path.clone());
        }

        let record = BackupRecord {
            timestamp: plan.timestamp,
            machine: vm.name.clone(),
            vmx_path: vm.vmx_path.clone(),
            disks: artifacts,
            incremental: plan.incremental,
            change_id: current_change_identifier(vm),
            parent: plan.parent,
            total_bytes,
        };
        self.store.append(&record)?;

        if let Err(e) = snapshot.release() {
            error!("Backup written but snapshot removal failed: {}", e);
        }

        if failed.is_empty() {
            info!("Backup complete: {}", format_size(total_bytes));
        } else {
            warn!(
                "Backup incomplete, {} item(s) failed: {}",
                failed.len(),
                format_size(total_bytes)
            );
        }

        Ok(MachineOutcome {
            machine: vm.name.clone(),
            status: if failed.is_empty() {
                MachineStatus::Succeeded
            } else {
                MachineStatus::Failed
            },
            bytes: total_bytes,
            failed_disks: failed,
            error: None,
            record: Some(record),
        })
    }

    /// Backs up every selected machine, one at a time.
    ///
    /// A failing machine does not stop the run unless the host is lost or
    /// the run is interrupted; the summary is logged in every case.
    #[instrument(skip(self))]
    pub fn backup_all(&self, requested: &[String], force_full: bool) -> Result<RunSummary> {
        let (selected, missing) = select_machines(
            self.inventory().list_vms()?,
            requested,
            &self.config.vms,
            &self.config.exclude_vms,
        );

        let mut summary = RunSummary::default();
        for name in missing {
            warn!("VM not found on host: {}", name);
            summary
                .outcomes
                .push(MachineOutcome::failed(&name, &AppError::MachineNotFound(name.clone())));
        }

        if selected.is_empty() {
            warn!("No VMs to backup");
            summary.log();
            return Ok(summary);
        }
        info!("Backing up {} VM(s)", selected.len());

        let fatal = self.backup_selected(&selected, force_full, &mut summary);

        summary.log();
        match fatal {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    /// Runs the machines in order, recording one outcome each. Returns the
    /// error that stopped the run, after which the rest are not attempted.
    fn backup_selected(
        &self,
        selected: &[VirtualMachine],
        force_full: bool,
        summary: &mut RunSummary,
    ) -> Option<AppError> {
        let mut fatal: Option<AppError> = None;
        for vm in selected {
            if fatal.is_none() {
                if let Err(e) = self.interrupt.check() {
                    fatal = Some(e);
                }
            }
            if fatal.is_some() {
                summary.outcomes.push(MachineOutcome::not_attempted(&vm.name));
                continue;
            }

            match self.backup_machine(vm, BackupTimestamp::now(), force_full) {
                Ok(outcome) => summary.outcomes.push(outcome),
                Err(e) => {
                    // ssh children die with the terminal's Ctrl-C
                    let e = if e.is_fatal() && self.interrupt.is_triggered() {
                        AppError::Interrupted
                    } else {
                        e
                    };
                    error!("Failed to backup {}: {}", vm.name, e);
                    summary.outcomes.push(MachineOutcome::failed(&vm.name, &e));
                    if e.is_fatal() {
                        fatal = Some(e);
                    }
                }
            }
        }
        fatal
    }

    /// Turns change tracking on for selected machines that lack it.
    pub fn prepare_change_tracking(&self, requested: &[String]) -> Result<()> {
        if !self.config.backup.use_cbt {
            return Ok(());
        }

        let (selected, _) = select_machines(
            self.inventory().list_vms()?,
            requested,
            &self.config.vms,
            &self.config.exclude_vms,
        );
        let cbt = ChangeTracking::new(self.channel, &self.config.datastore_path);

        for vm in selected.iter().filter(|vm| !vm.change_tracking) {
            match cbt.enable_change_tracking(vm) {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!("CBT not enabled for {}: {}", vm.name, e),
            }
        }
        Ok(())
    }

    pub fn apply_retention(&self, dry_run: bool) -> Result<RetentionReport> {
        self.interrupt.check()?;
        retention::apply_retention(&self.store, &self.config.retention, dry_run)
    }
}

fn vmx_file_name(vm: &VirtualMachine) -> PathBuf {
    Path::new(&vm.vmx_path)
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(format!("{}.vmx", vm.name)))
}
