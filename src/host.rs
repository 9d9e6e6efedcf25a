//! Inventory of virtual machines and disks on the host.
//!
//! The host only answers in tool text (`vim-cmd`, `ls`, `du`); all of that
//! wording is interpreted in [`parse`] and nowhere else.

use crate::error::{AppError, Result};
use crate::models::{Disk, VirtualMachine};
use crate::remote::{quote, RemoteChannel};
use tracing::{debug, instrument};

pub mod parse {
    use crate::models::PowerState;
    use once_cell::sync::Lazy;
    use regex::Regex;

    /// `Vmid  Name  File  Guest OS  Version  Annotation`
    static VM_LINE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"^(\d+)\s+(.+?)\s+\[([^\]]+)\]\s+(.+?\.vmx)").expect("valid regex")
    });

    /// Snapshot delta descriptors created while a snapshot exists, e.g. `disk-000001.vmdk`.
    static SNAPSHOT_DELTA: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"-\d{6}\.vmdk$").expect("valid regex"));

    const AUXILIARY_SUFFIXES: [&str; 4] =
        ["-flat.vmdk", "-delta.vmdk", "-ctk.vmdk", "-sesparse.vmdk"];

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct VmListing {
        pub vmid: u32,
        pub name: String,
        pub datastore: String,
        pub vmx_relative: String,
    }

    pub fn vm_list(output: &str) -> Vec<VmListing> {
        output
            .lines()
            .skip(1)
            .filter_map(|line| {
                let caps = VM_LINE.captures(line.trim_end())?;
                Some(VmListing {
                    vmid: caps[1].parse().ok()?,
                    name: caps[2].to_string(),
                    datastore: caps[3].to_string(),
                    vmx_relative: caps[4].to_string(),
                })
            })
            .collect()
    }

    pub fn power_state(output: &str) -> PowerState {
        if output.contains("Powered on") {
            PowerState::On
        } else if output.contains("Powered off") {
            PowerState::Off
        } else if output.contains("Suspended") {
            PowerState::Suspended
        } else {
            PowerState::Unknown
        }
    }

    /// Base disk descriptors from an `ls -1` of the machine directory.
    pub fn disk_descriptors(output: &str) -> Vec<String> {
        output
            .lines()
            .map(str::trim)
            .filter(|token| token.ends_with(".vmdk"))
            .filter(|token| !AUXILIARY_SUFFIXES.iter().any(|s| token.ends_with(s)))
            .filter(|token| !SNAPSHOT_DELTA.is_match(token))
            .map(|token| token.rsplit('/').next().unwrap_or(token).to_string())
            .collect()
    }

    /// Sum of the kilobyte column of `du -k` output, in bytes.
    pub fn du_bytes(output: &str) -> Option<u64> {
        let mut total = None;
        for line in output.lines() {
            let Some(first) = line.split_whitespace().next() else {
                continue;
            };
            if let Ok(kb) = first.parse::<u64>() {
                total = Some(total.unwrap_or(0) + kb * 1024);
            }
        }
        total
    }

    pub fn thin_provisioned(descriptor: &str) -> bool {
        descriptor.lines().any(|line| {
            let compact: String = line.chars().filter(|c| !c.is_whitespace()).collect();
            compact.eq_ignore_ascii_case(r#"ddb.thinProvisioned="1""#)
        })
    }

    pub fn change_tracking_enabled(vmx_lines: &str) -> bool {
        vmx_lines.lines().any(|line| {
            let compact: String = line.chars().filter(|c| !c.is_whitespace()).collect();
            let lower = compact.to_ascii_lowercase();
            lower.starts_with("ctkenabled=") && lower.contains("true")
        })
    }
}

/// Flat data file that accompanies a `.vmdk` descriptor.
pub fn flat_companion(descriptor: &str) -> String {
    match descriptor.strip_suffix(".vmdk") {
        Some(stem) => format!("{}-flat.vmdk", stem),
        None => format!("{}-flat", descriptor),
    }
}

pub struct HostInventory<'a> {
    channel: &'a dyn RemoteChannel,
    datastore_path: String,
}

impl<'a> HostInventory<'a> {
    pub fn new(channel: &'a dyn RemoteChannel, datastore_path: &str) -> Self {
        Self {
            channel,
            datastore_path: datastore_path.trim_end_matches('/').to_string(),
        }
    }

    /// Every registered machine with its power and change-tracking state.
    /// Disks are loaded separately by [`HostInventory::vm_disks`].
    #[instrument(skip(self))]
    pub fn list_vms(&self) -> Result<Vec<VirtualMachine>> {
        let listing = self.channel.run_checked("vim-cmd vmsvc/getallvms")?;
        let mut vms = Vec::new();

        for entry in parse::vm_list(&listing.stdout) {
            let state = self
                .channel
                .run_lenient(&format!("vim-cmd vmsvc/power.getstate {}", entry.vmid))?;
            let vmx_path = format!(
                "{}/{}/{}",
                self.datastore_path, entry.datastore, entry.vmx_relative
            );
            let ctk = self.channel.run_lenient(&format!(
                "grep -i ctkEnabled {}",
                quote(&vmx_path)
            ))?;

            vms.push(VirtualMachine {
                vmid: entry.vmid,
                name: entry.name,
                vmx_path,
                datastore: entry.datastore,
                power_state: parse::power_state(&state.stdout),
                disks: Vec::new(),
                change_tracking: parse::change_tracking_enabled(&ctk.stdout),
            });
        }

        debug!("Found {} VM(s) on host", vms.len());
        Ok(vms)
    }

    pub fn vm_by_name(&self, name: &str) -> Result<VirtualMachine> {
        self.list_vms()?
            .into_iter()
            .find(|vm| vm.name == name)
            .ok_or_else(|| AppError::MachineNotFound(name.to_string()))
    }

    #[instrument(skip(self, vm), fields(vm = %vm.name))]
    pub fn vm_disks(&self, vm: &VirtualMachine) -> Result<Vec<Disk>> {
        let dir = vm.vmx_dir();
        let listing = self
            .channel
            .run_lenient(&format!("ls -1 {}/*.vmdk 2>/dev/null", quote(dir)))?;

        let mut disks = Vec::new();
        for name in parse::disk_descriptors(&listing.stdout) {
            let path = format!("{}/{}", dir, name);
            let flat = flat_companion(&path);

            let du = self.channel.run_lenient(&format!(
                "du -k {} {} 2>/dev/null",
                quote(&path),
                quote(&flat)
            ))?;
            let descriptor = self.channel.run_lenient(&format!(
                "grep -i thinProvisioned {} 2>/dev/null",
                quote(&path)
            ))?;

            disks.push(Disk {
                size_bytes: parse::du_bytes(&du.stdout).unwrap_or(0),
                thin: parse::thin_provisioned(&descriptor.stdout),
                path,
            });
        }
        Ok(disks)
    }
}
