//! Command execution and file transfer against the ESXi host.
//!
//! Everything the engine does on the host goes through [`RemoteChannel`].
//! The production implementation drives the OpenSSH client binaries over a
//! single multiplexed `ControlMaster` connection, so commands reach the host
//! in the order they are issued.

use crate::config::Config;
use crate::error::{RemoteError, Result};
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

/// ssh reserves this exit status for its own failures (auth, network, ...).
const SSH_CONNECTION_FAILURE: i32 = 255;
const PROGRESS_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// How a non-zero exit status is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandMode {
    Check,
    Lenient, // Caller inspects the output itself
}

pub trait RemoteChannel {
    /// Runs a shell command on the host with the channel's timeout.
    fn run(&self, command: &str) -> std::result::Result<CommandOutput, RemoteError>;

    fn download(&self, remote: &str, local: &Path) -> std::result::Result<(), RemoteError>;

    fn file_exists(&self, remote: &str) -> std::result::Result<bool, RemoteError>;

    fn file_size(&self, remote: &str) -> std::result::Result<u64, RemoteError>;

    /// Runs a command that may outlast the channel's timeout, such as a disk clone.
    fn run_unbounded(&self, command: &str) -> std::result::Result<CommandOutput, RemoteError> {
        self.run(command)
    }

    fn run_mode(&self, command: &str, mode: CommandMode) -> Result<CommandOutput> {
        debug!("Running: {}", command);
        let output = self.run(command)?;
        if mode == CommandMode::Check && !output.success() {
            return Err(RemoteError::CommandFailed {
                command: command.to_string(),
                code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            }
            .into());
        }
        Ok(output)
    }

    fn run_checked(&self, command: &str) -> Result<CommandOutput> {
        self.run_mode(command, CommandMode::Check)
    }

    fn run_lenient(&self, command: &str) -> Result<CommandOutput> {
        self.run_mode(command, CommandMode::Lenient)
    }
}

/// Single-quotes a word for the host's POSIX shell.
pub fn quote(word: &str) -> String {
    format!("'{}'", word.replace('\'', r"'\''"))
}

#[derive(Debug, Clone)]
pub struct SshSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub key_file: Option<PathBuf>,
    pub interactive_password: bool,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
}

impl SshSettings {
    pub fn from_config(config: &Config) -> std::result::Result<Self, RemoteError> {
        let interactive_password = !config.esxi.password.is_empty();
        let key_file = if interactive_password {
            None
        } else {
            match config.key_file() {
                Some(path) if path.exists() => Some(path),
                Some(path) => {
                    return Err(RemoteError::Connection {
                        host: config.esxi.host.clone(),
                        reason: format!("SSH key not found: {}", path.display()),
                    })
                }
                None => None,
            }
        };

        Ok(Self {
            host: config.esxi.host.clone(),
            port: config.esxi.port,
            username: config.esxi.username.clone(),
            key_file,
            interactive_password,
            connect_timeout: Duration::from_secs(config.esxi.connect_timeout_secs),
            command_timeout: Duration::from_secs(config.esxi.command_timeout_secs),
        })
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }
}

/// One open connection to the host. Dropping it closes the master connection.
///
/// Each command is an `ssh` child driven on the session's own current-thread
/// runtime, so timeouts kill the child instead of leaving it behind.
pub struct SshSession {
    settings: SshSettings,
    control_path: PathBuf,
    runtime: Runtime,
}

impl SshSession {
    pub fn connect(settings: SshSettings) -> std::result::Result<Self, RemoteError> {
        let control_path =
            std::env::temp_dir().join(format!("esxi-backup-{}.sock", std::process::id()));
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| RemoteError::Connection {
                host: settings.host.clone(),
                reason: format!("Failed to start runtime: {}", e),
            })?;
        let session = Self {
            settings,
            control_path,
            runtime,
        };

        info!("Connecting to ESXi host: {}", session.settings.host);
        if session.settings.interactive_password {
            info!("Password login configured, ssh will prompt for it");
        }

        let mut cmd = session.ssh_base("ssh");
        cmd.args(["-M", "-N", "-f", "-o", "ControlPersist=yes"])
            .arg("-p")
            .arg(session.settings.port.to_string())
            .arg(session.settings.destination())
            .stdin(Stdio::inherit())
            .stdout(Stdio::null())
            // The backgrounded master keeps inherited pipes open, so errors
            // go straight to the terminal instead of being captured.
            .stderr(Stdio::inherit());

        let status = cmd.status().map_err(|e| session.connection_error(e.to_string()))?;
        if !status.success() {
            return Err(session.connection_error(format!(
                "ssh exited with status {}",
                status.code().unwrap_or(-1)
            )));
        }

        info!("Connected successfully");
        Ok(session)
    }

    fn connection_error(&self, reason: String) -> RemoteError {
        RemoteError::Connection {
            host: self.settings.host.clone(),
            reason,
        }
    }

    fn ssh_base(&self, program: &str) -> Command {
        let mut cmd = Command::new(program);
        cmd.arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .arg("-o")
            .arg(format!(
                "ConnectTimeout={}",
                self.settings.connect_timeout.as_secs()
            ))
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new")
            .arg("-o")
            .arg("ServerAliveInterval=30");
        if !self.settings.interactive_password {
            cmd.arg("-o").arg("BatchMode=yes");
        }
        if let Some(key) = &self.settings.key_file {
            cmd.arg("-i").arg(key);
        }
        cmd
    }

    fn exec(&self, command: &str, timeout: Option<Duration>) -> std::result::Result<CommandOutput, RemoteError> {
        let mut std_cmd = self.ssh_base("ssh");
        std_cmd
            .arg("-p")
            .arg(self.settings.port.to_string())
            .arg(self.settings.destination())
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut cmd = tokio::process::Command::from(std_cmd);
        cmd.kill_on_drop(true);

        let output = self
            .runtime
            .block_on(output_within(&mut cmd, timeout))
            .map_err(|e| self.connection_error(e.to_string()))?
            .ok_or_else(|| RemoteError::Timeout {
                command: command.to_string(),
                seconds: timeout.map(|t| t.as_secs()).unwrap_or_default(),
            })?;

        let exit_code = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if exit_code == SSH_CONNECTION_FAILURE {
            return Err(self.connection_error(stderr.trim().to_string()));
        }

        Ok(CommandOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr,
        })
    }

    /// Copies `remote` with scp, logging progress from the growing local file.
    fn scp(&self, remote: &str, local: &Path, expected: u64) -> std::result::Result<(), RemoteError> {
        let mut std_cmd = self.ssh_base("scp");
        std_cmd
            .arg("-q")
            .arg("-P")
            .arg(self.settings.port.to_string())
            .arg(format!("{}:{}", self.settings.destination(), remote))
            .arg(local)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        let mut cmd = tokio::process::Command::from(std_cmd);
        cmd.kill_on_drop(true);

        let transfer_error = |reason: String| RemoteError::Transfer {
            remote: remote.to_string(),
            reason,
        };

        let output = self.runtime.block_on(async {
            let child = match cmd.spawn() {
                Ok(child) => child,
                Err(e) => return Err(transfer_error(e.to_string())),
            };
            let finished = child.wait_with_output();
            tokio::pin!(finished);

            let mut progress = Progress::new(expected);
            let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
            loop {
                tokio::select! {
                    result = &mut finished => {
                        break result.map_err(|e| transfer_error(e.to_string()));
                    }
                    _ = ticker.tick() => {
                        if let Ok(meta) = std::fs::metadata(local) {
                            progress.update(meta.len());
                        }
                    }
                }
            }
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if output.status.code() == Some(SSH_CONNECTION_FAILURE) {
                return Err(self.connection_error(stderr));
            }
            return Err(transfer_error(stderr));
        }
        Ok(())
    }
}

impl RemoteChannel for SshSession {
    fn run(&self, command: &str) -> std::result::Result<CommandOutput, RemoteError> {
        self.exec(command, Some(self.settings.command_timeout))
    }

    fn run_unbounded(&self, command: &str) -> std::result::Result<CommandOutput, RemoteError> {
        self.exec(command, None)
    }

    fn download(&self, remote: &str, local: &Path) -> std::result::Result<(), RemoteError> {
        let expected = self.file_size(remote).unwrap_or(0);
        info!("  Downloading: {}", format_size(expected));
        self.scp(remote, local, expected)
    }

    fn file_exists(&self, remote: &str) -> std::result::Result<bool, RemoteError> {
        let output = self.run(&format!("test -e {}", quote(remote)))?;
        Ok(output.success())
    }

    fn file_size(&self, remote: &str) -> std::result::Result<u64, RemoteError> {
        let output = self.run(&format!("stat -c %s {}", quote(remote)))?;
        if !output.success() {
            return Err(RemoteError::NotFound(remote.to_string()));
        }
        output
            .stdout
            .trim()
            .parse()
            .map_err(|_| RemoteError::NotFound(remote.to_string()))
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        let result = self
            .ssh_base("ssh")
            .args(["-O", "exit"])
            .arg(self.settings.destination())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match result {
            Ok(_) => info!("Disconnected from ESXi"),
            Err(e) => warn!("Failed to close ssh master connection: {}", e),
        }
    }
}

/// Collects the child's output, or `None` when `timeout` elapsed first. The
/// child must be built with `kill_on_drop` so a timed-out one is killed.
async fn output_within(
    cmd: &mut tokio::process::Command,
    timeout: Option<Duration>,
) -> std::io::Result<Option<Output>> {
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, cmd.output()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        },
        None => cmd.output().await.map(Some),
    }
}

/// Logs transfer progress in 10% steps.
pub struct Progress {
    total: u64,
    last_percent: u64,
}

impl Progress {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            last_percent: 0,
        }
    }

    /// Returns the percentage when a new 10% step was crossed.
    pub fn update(&mut self, transferred: u64) -> Option<u64> {
        if self.total == 0 {
            return None;
        }
        let percent = (transferred.min(self.total) * 100) / self.total;
        if percent >= self.last_percent + 10 {
            self.last_percent = percent - percent % 10;
            info!("  Progress: {}% ({})", percent, format_size(transferred));
            return Some(percent);
        }
        None
    }
}

pub fn format_size(size: u64) -> String {
    let mut value = size as f64;
    for unit in ["B", "KB", "MB", "GB", "TB"] {
        if value < 1024.0 {
            return format!("{:.1} {}", value, unit);
        }
        value /= 1024.0;
    }
    format!("{:.1} PB", value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_embedded_single_quotes() {
        assert_eq!(quote("/vmfs/volumes/ds 1/a.vmdk"), "'/vmfs/volumes/ds 1/a.vmdk'");
        assert_eq!(quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn progress_reports_each_ten_percent_once() {
        let mut progress = Progress::new(1000);
        assert_eq!(progress.update(50), None);
        assert_eq!(progress.update(100), Some(10));
        assert_eq!(progress.update(150), None);
        assert_eq!(progress.update(350), Some(35));
        assert_eq!(progress.update(390), None);
        assert_eq!(progress.update(400), Some(40));
        assert_eq!(progress.update(1000), Some(100));
    }

    #[test]
    fn unknown_total_never_reports() {
        let mut progress = Progress::new(0);
        assert_eq!(progress.update(123), None);
    }

    #[test]
    fn formats_human_sizes() {
        assert_eq!(format_size(512), "512.0 B");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.0 GB");
    }

    fn local(program: &str, args: &[&str]) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    #[test]
    fn slow_command_times_out() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let mut cmd = local("sleep", &["5"]);
        let started = std::time::Instant::now();
        let output = runtime
            .block_on(output_within(&mut cmd, Some(Duration::from_millis(300))))
            .unwrap();
        assert!(output.is_none());
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn command_output_is_collected() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let mut cmd = local("sh", &["-c", "echo out; echo err >&2; exit 3"]);
        let output = runtime.block_on(output_within(&mut cmd, None)).unwrap().unwrap();
        assert_eq!(output.status.code(), Some(3));
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "out");
        assert_eq!(String::from_utf8_lossy(&output.stderr).trim(), "err");
    }
}
