//! Point-in-time snapshots that bracket each backup.
//!
//! A backup snapshot must never outlive the backup that created it. Taking
//! one through [`SnapshotManager::acquire`] ties its removal to the lifetime
//! of the returned [`SnapshotGuard`].

use crate::error::{AppError, Result};
use crate::models::VirtualMachine;
use crate::remote::RemoteChannel;
use tracing::{error, info, instrument, warn};

pub const SNAPSHOT_DESCRIPTION: &str = "Backup snapshot";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub name: String,
    pub id: String,
}

/// Snapshot tree as printed by `vim-cmd vmsvc/snapshot.get`.
pub fn parse_snapshot_tree(output: &str) -> Vec<SnapshotInfo> {
    let mut snapshots = Vec::new();
    let mut pending_name: Option<String> = None;

    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim_start_matches(['-', '|', ' ']).trim();
        let value = value.trim();
        match key {
            "Snapshot Name" => pending_name = Some(value.to_string()),
            "Snapshot Id" => {
                if let Some(name) = pending_name.take() {
                    snapshots.push(SnapshotInfo {
                        name,
                        id: value.to_string(),
                    });
                }
            }
            _ => {}
        }
    }
    snapshots
}

#[derive(Clone, Copy)]
pub struct SnapshotManager<'a> {
    channel: &'a dyn RemoteChannel,
}

impl<'a> SnapshotManager<'a> {
    pub fn new(channel: &'a dyn RemoteChannel) -> Self {
        Self { channel }
    }

    /// Creates a disk-only snapshot. Quiescing is only requested for running machines.
    #[instrument(skip(self, vm), fields(vm = %vm.name))]
    pub fn create_snapshot(&self, vm: &VirtualMachine, label: &str, quiesce: bool) -> Result<()> {
        info!("Creating snapshot '{}' for {}", label, vm.name);
        let quiesce_flag = u8::from(quiesce && vm.is_powered_on());
        let memory_flag = 0;

        let output = self.channel.run_lenient(&format!(
            "vim-cmd vmsvc/snapshot.create {} \"{}\" \"{}\" {} {}",
            vm.vmid, label, SNAPSHOT_DESCRIPTION, memory_flag, quiesce_flag
        ))?;

        let acknowledged =
            output.stdout.trim().is_empty() || output.stdout.contains("Create Snapshot");
        if output.success() && acknowledged {
            info!("Snapshot created successfully");
            Ok(())
        } else {
            let reason = if output.stderr.trim().is_empty() {
                output.stdout.trim().to_string()
            } else {
                output.stderr.trim().to_string()
            };
            error!("Failed to create snapshot: {}", reason);
            Err(AppError::SnapshotCreate {
                machine: vm.name.clone(),
                label: label.to_string(),
                reason,
            })
        }
    }

    pub fn list_snapshots(&self, vm: &VirtualMachine) -> Result<Vec<SnapshotInfo>> {
        let output = self
            .channel
            .run_lenient(&format!("vim-cmd vmsvc/snapshot.get {}", vm.vmid))?;
        Ok(parse_snapshot_tree(&output.stdout))
    }

    /// Removes the snapshot named `label`. When the label cannot be resolved
    /// every snapshot of the machine is removed instead.
    #[instrument(skip(self, vm), fields(vm = %vm.name))]
    pub fn remove_snapshot(&self, vm: &VirtualMachine, label: &str) -> Result<()> {
        info!("Removing snapshot '{}' from {}", label, vm.name);

        let snapshots = match self.list_snapshots(vm) {
            Ok(snapshots) => snapshots,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!("Could not read snapshots of {}: {}", vm.name, e);
                Vec::new()
            }
        };
        let found = snapshots
            .into_iter()
            .find(|snapshot| snapshot.name == label);

        match found {
            Some(snapshot) => {
                self.channel
                    .run_checked(&format!(
                        "vim-cmd vmsvc/snapshot.remove {} {}",
                        vm.vmid, snapshot.id
                    ))
                    .map_err(|e| AppError::SnapshotRemove {
                        machine: vm.name.clone(),
                        label: label.to_string(),
                        reason: e.to_string(),
                    })?;
            }
            None => {
                warn!(
                    "Snapshot '{}' not found on {}, removing all snapshots",
                    label, vm.name
                );
                self.channel
                    .run_lenient(&format!("vim-cmd vmsvc/snapshot.removeall {}", vm.vmid))?;
            }
        }
        Ok(())
    }

    /// Creates the snapshot and returns a guard that removes it on drop.
    pub fn acquire(
        &self,
        vm: &VirtualMachine,
        label: &str,
        quiesce: bool,
    ) -> Result<SnapshotGuard<'a>> {
        self.create_snapshot(vm, label, quiesce)?;
        Ok(SnapshotGuard {
            manager: *self,
            vm: vm.clone(),
            label: label.to_string(),
            released: false,
        })
    }
}

#[must_use = "dropping the guard removes the snapshot immediately"]
pub struct SnapshotGuard<'a> {
    manager: SnapshotManager<'a>,
    vm: VirtualMachine,
    label: String,
    released: bool,
}

impl SnapshotGuard<'_> {
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Removes the snapshot now and reports the outcome.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.manager.remove_snapshot(&self.vm, &self.label)
    }
}

impl Drop for SnapshotGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.manager.remove_snapshot(&self.vm, &self.label) {
            error!(
                "Failed to remove snapshot '{}' from {}: {}",
                self.label, self.vm.name, e
            );
        }
    }
}
