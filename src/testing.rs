//! In-memory ESXi host for unit tests.
//!
//! Understands the handful of commands the engine issues and keeps a
//! virtual datastore, snapshot trees and a command log.

use crate::error::RemoteError;
use crate::host::flat_companion;
use crate::models::{PowerState, VirtualMachine};
use crate::remote::{CommandOutput, RemoteChannel};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;

#[derive(Default)]
struct State {
    vms: Vec<VirtualMachine>,
    files: BTreeMap<String, Vec<u8>>,
    snapshots: HashMap<u32, Vec<(String, u32)>>,
    next_snapshot_id: u32,
    commands: Vec<String>,
    refuse_snapshots: bool,
    refused_vms: HashSet<u32>,
    clone_fails: bool,
    disconnected: bool,
    disconnect_triggers: Vec<String>,
    slow_commands: Vec<String>,
    lost_downloads: HashSet<String>,
    last_quiesce: bool,
}

#[derive(Default)]
pub struct FakeHost {
    state: RefCell<State>,
}

fn ok(stdout: impl Into<String>) -> CommandOutput {
    CommandOutput {
        exit_code: 0,
        stdout: stdout.into(),
        stderr: String::new(),
    }
}

fn connection_lost() -> RemoteError {
    RemoteError::Connection {
        host: "fake".into(),
        reason: "Connection reset by peer".into(),
    }
}

fn fail(code: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        exit_code: code,
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

/// Splits a command line the way the host shell would for our simple commands.
fn words(command: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;

    for c in command.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '\'' || c == '"' => {
                quote = Some(c);
                in_word = true;
            }
            None if c.is_whitespace() => {
                if in_word {
                    out.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            None => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        out.push(current);
    }
    out
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_vm(&self, name: &str, powered_on: bool) -> VirtualMachine {
        let mut state = self.state.borrow_mut();
        let vmid = state.vms.len() as u32 + 1;
        let vmx_path = format!("/vmfs/volumes/datastore1/{0}/{0}.vmx", name);
        state.files.insert(
            vmx_path.clone(),
            format!("displayName = \"{}\"\n", name).into_bytes(),
        );
        let vm = VirtualMachine {
            vmid,
            name: name.to_string(),
            vmx_path,
            datastore: "datastore1".to_string(),
            power_state: if powered_on { PowerState::On } else { PowerState::Off },
            disks: Vec::new(),
            change_tracking: false,
        };
        state.vms.push(vm.clone());
        vm
    }

    /// Adds a descriptor plus flat file of `size` bytes; returns the descriptor path.
    pub fn add_disk(&self, vm: &VirtualMachine, name: &str, size: usize) -> String {
        let path = format!("{}/{}.vmdk", vm.vmx_dir(), name);
        let mut state = self.state.borrow_mut();
        state.files.insert(
            path.clone(),
            b"# Disk DescriptorFile\nddb.thinProvisioned = \"1\"\n".to_vec(),
        );
        state.files.insert(flat_companion(&path), vec![0xAB; size]);
        path
    }

    pub fn has_file(&self, path: &str) -> bool {
        self.state.borrow().files.contains_key(path)
    }

    pub fn file_text(&self, path: &str) -> String {
        self.state
            .borrow()
            .files
            .get(path)
            .map(|b| String::from_utf8_lossy(b).to_string())
            .unwrap_or_default()
    }

    pub fn refuse_snapshots(&self, refuse: bool) {
        self.state.borrow_mut().refuse_snapshots = refuse;
    }

    /// Refuses snapshots of `vm` only.
    pub fn refuse_snapshots_for(&self, vm: &VirtualMachine) {
        self.state.borrow_mut().refused_vms.insert(vm.vmid);
    }

    pub fn fail_clones(&self, fail: bool) {
        self.state.borrow_mut().clone_fails = fail;
    }

    pub fn disconnect(&self) {
        self.state.borrow_mut().disconnected = true;
    }

    /// Drops the connection when a command containing `needle` is issued.
    pub fn disconnect_on(&self, needle: &str) {
        self.state
            .borrow_mut()
            .disconnect_triggers
            .push(needle.to_string());
    }

    /// Commands starting with `prefix` run on the host but the channel gives
    /// up waiting for them.
    pub fn time_out(&self, prefix: &str) {
        self.state.borrow_mut().slow_commands.push(prefix.to_string());
    }

    /// Downloads of `remote` report success but leave nothing behind.
    pub fn lose_download(&self, remote: &str) {
        self.state
            .borrow_mut()
            .lost_downloads
            .insert(remote.to_string());
    }

    pub fn snapshot_count(&self, vm: &VirtualMachine) -> usize {
        self.state
            .borrow()
            .snapshots
            .get(&vm.vmid)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn total_snapshots(&self) -> usize {
        self.state.borrow().snapshots.values().map(Vec::len).sum()
    }

    pub fn last_create_quiesced(&self) -> bool {
        self.state.borrow().last_quiesce
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.borrow().commands.clone()
    }

    fn vm_by_id(state: &State, vmid: &str) -> Option<VirtualMachine> {
        let vmid: u32 = vmid.parse().ok()?;
        state.vms.iter().find(|vm| vm.vmid == vmid).cloned()
    }

    fn dispatch(&self, command: &str) -> CommandOutput {
        let mut state = self.state.borrow_mut();
        let args = words(command);
        let arg = |i: usize| args.get(i).cloned().unwrap_or_default();

        match (arg(0).as_str(), arg(1).as_str()) {
            ("vim-cmd", "vmsvc/getallvms") => {
                let mut out = String::from("Vmid   Name   File   Guest OS   Version   Annotation\n");
                for vm in &state.vms {
                    let relative = vm
                        .vmx_path
                        .trim_start_matches(&format!("/vmfs/volumes/{}/", vm.datastore))
                        .to_string();
                    out.push_str(&format!(
                        "{}   {}   [{}] {}   otherGuest64   vmx-19\n",
                        vm.vmid, vm.name, vm.datastore, relative
                    ));
                }
                ok(out)
            }
            ("vim-cmd", "vmsvc/power.getstate") => match Self::vm_by_id(&state, &arg(2)) {
                Some(vm) if vm.is_powered_on() => ok("Retrieved runtime info\nPowered on\n"),
                Some(_) => ok("Retrieved runtime info\nPowered off\n"),
                None => fail(1, "vim.fault.NotFound"),
            },
            ("vim-cmd", "vmsvc/snapshot.create") => {
                let refused = arg(2)
                    .parse::<u32>()
                    .is_ok_and(|vmid| state.refused_vms.contains(&vmid));
                if state.refuse_snapshots || refused {
                    return ok("Snapshot creation failed: vim.fault.TaskInProgress\n");
                }
                let Some(vm) = Self::vm_by_id(&state, &arg(2)) else {
                    return fail(1, "vim.fault.NotFound");
                };
                state.last_quiesce = arg(6) == "1";
                state.next_snapshot_id += 1;
                let id = state.next_snapshot_id;
                state
                    .snapshots
                    .entry(vm.vmid)
                    .or_default()
                    .push((arg(3), id));
                ok("Create Snapshot:\n")
            }
            ("vim-cmd", "vmsvc/snapshot.get") => {
                let vmid: u32 = arg(2).parse().unwrap_or_default();
                let mut out = String::from("Get Snapshot:\n");
                for (depth, (name, id)) in state
                    .snapshots
                    .get(&vmid)
                    .into_iter()
                    .flatten()
                    .enumerate()
                {
                    let dashes = "--".repeat(depth + 1);
                    out.push_str(&format!("{}Snapshot Name        : {}\n", dashes, name));
                    out.push_str(&format!("{}Snapshot Id        : {}\n", dashes, id));
                }
                ok(out)
            }
            ("vim-cmd", "vmsvc/snapshot.remove") => {
                let vmid: u32 = arg(2).parse().unwrap_or_default();
                let id: u32 = arg(3).parse().unwrap_or_default();
                let list = state.snapshots.entry(vmid).or_default();
                let before = list.len();
                list.retain(|(_, sid)| *sid != id);
                if list.len() == before {
                    fail(1, "vim.fault.NotFound")
                } else {
                    ok("")
                }
            }
            ("vim-cmd", "vmsvc/snapshot.removeall") => {
                let vmid: u32 = arg(2).parse().unwrap_or_default();
                state.snapshots.remove(&vmid);
                ok("")
            }
            ("vim-cmd", "vmsvc/reload") => ok(""),
            ("grep", "-i") => {
                let needle = arg(2).to_ascii_lowercase();
                match state.files.get(&arg(3)) {
                    Some(content) => {
                        let matched: Vec<String> = String::from_utf8_lossy(content)
                            .lines()
                            .filter(|l| l.to_ascii_lowercase().contains(&needle))
                            .map(str::to_string)
                            .collect();
                        if matched.is_empty() {
                            fail(1, "")
                        } else {
                            ok(matched.join("\n") + "\n")
                        }
                    }
                    None => fail(2, "No such file or directory"),
                }
            }
            ("ls", "-1") => {
                let pattern = arg(2);
                let dir = pattern.trim_end_matches("/*.vmdk");
                let listed: Vec<String> = state
                    .files
                    .keys()
                    .filter(|p| {
                        p.ends_with(".vmdk")
                            && Path::new(p).parent().and_then(|d| d.to_str()) == Some(dir)
                    })
                    .cloned()
                    .collect();
                ok(listed.join("\n"))
            }
            ("du", "-k") => {
                let mut out = String::new();
                for path in args.iter().skip(2).filter(|a| a.starts_with('/')) {
                    if let Some(content) = state.files.get(path) {
                        out.push_str(&format!("{}\t{}\n", content.len().div_ceil(1024), path));
                    }
                }
                ok(out)
            }
            ("vmkfstools", "-i") => {
                let (source, target) = (arg(2), arg(5));
                if state.clone_fails {
                    return fail(1, "Failed to clone disk: Insufficient space");
                }
                let Some(descriptor) = state.files.get(&source).cloned() else {
                    return fail(1, "Failed to open disk");
                };
                let flat = state
                    .files
                    .get(&flat_companion(&source))
                    .cloned()
                    .unwrap_or_default();
                state.files.insert(target.clone(), descriptor);
                state.files.insert(flat_companion(&target), flat);
                ok("Cloning disk...\nClone: 100% done.\n")
            }
            ("rm", "-f") => {
                for path in args.iter().skip(2) {
                    state.files.remove(path);
                }
                ok("")
            }
            ("echo", _) => {
                // echo '<line>' >> <file>
                let line = arg(1);
                if arg(2) == ">>" {
                    state
                        .files
                        .entry(arg(3))
                        .or_default()
                        .extend_from_slice(format!("{}\n", line).as_bytes());
                    ok("")
                } else {
                    ok(format!("{}\n", line))
                }
            }
            _ => fail(127, "command not found"),
        }
    }
}

impl RemoteChannel for FakeHost {
    fn run(&self, command: &str) -> Result<CommandOutput, RemoteError> {
        {
            let mut state = self.state.borrow_mut();
            if state
                .disconnect_triggers
                .iter()
                .any(|needle| command.contains(needle.as_str()))
            {
                state.disconnected = true;
            }
            if state.disconnected {
                return Err(connection_lost());
            }
            state.commands.push(command.to_string());
        }

        let output = self.dispatch(command);
        let slow = self
            .state
            .borrow()
            .slow_commands
            .iter()
            .any(|prefix| command.starts_with(prefix.as_str()));
        if slow {
            return Err(RemoteError::Timeout {
                command: command.to_string(),
                seconds: 300,
            });
        }
        Ok(output)
    }

    fn download(&self, remote: &str, local: &Path) -> Result<(), RemoteError> {
        let state = self.state.borrow();
        if state.disconnected {
            return Err(connection_lost());
        }
        if state.lost_downloads.contains(remote) {
            return Ok(());
        }
        let content = state
            .files
            .get(remote)
            .ok_or_else(|| RemoteError::NotFound(remote.to_string()))?;
        fs::write(local, content).map_err(|e| RemoteError::Transfer {
            remote: remote.to_string(),
            reason: e.to_string(),
        })
    }

    fn file_exists(&self, remote: &str) -> Result<bool, RemoteError> {
        Ok(self.state.borrow().files.contains_key(remote))
    }

    fn file_size(&self, remote: &str) -> Result<u64, RemoteError> {
        self.state
            .borrow()
            .files
            .get(remote)
            .map(|c| c.len() as u64)
            .ok_or_else(|| RemoteError::NotFound(remote.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_quoted_words() {
        assert_eq!(
            words(r#"vim-cmd vmsvc/snapshot.create 1 "backup 1" "Backup snapshot" 0 1"#),
            vec!["vim-cmd", "vmsvc/snapshot.create", "1", "backup 1", "Backup snapshot", "0", "1"]
        );
        assert_eq!(words("ls -1 '/a b'/*.vmdk"), vec!["ls", "-1", "/a b/*.vmdk"]);
    }

    #[test]
    fn dropped_connection_stays_down() {
        let host = FakeHost::new();
        host.disconnect_on("snapshot.create 2 ");
        assert!(host.run("vim-cmd vmsvc/snapshot.create 1 \"a\" \"b\" 0 0").is_ok());
        assert!(host.run("vim-cmd vmsvc/snapshot.create 2 \"a\" \"b\" 0 0").is_err());
        assert!(host.run("vim-cmd vmsvc/getallvms").is_err());
        assert_eq!(host.commands().len(), 1);
    }
}
