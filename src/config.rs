use crate::error::{AppError, Result};
use crate::retention::RetentionPolicy;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const CONFIG_FILE_NAME: &str = "esxi-backup.yaml";

/// Places searched for a configuration file, first match wins.
pub static CONFIG_PATHS: Lazy<Vec<PathBuf>> = Lazy::new(|| {
    let mut paths = vec![PathBuf::from(".").join(CONFIG_FILE_NAME)];
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join("esxi-backup").join("config.yaml"));
    }
    paths.push(PathBuf::from("/etc/esxi-backup/config.yaml"));
    paths
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EsxiConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Password login is left to the ssh client (agent, askpass); keys are preferred.
    pub password: String,
    pub key_file: String,
    pub connect_timeout_secs: u64,
    pub command_timeout_secs: u64,
}

impl Default for EsxiConfig {
    fn default() -> Self {
        Self {
            host: "192.168.1.100".to_string(),
            port: 22,
            username: "root".to_string(),
            password: String::new(),
            key_file: "~/.ssh/id_rsa".to_string(),
            connect_timeout_secs: 30,
            command_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSettings {
    pub destination: String,
    /// Enables change tracking on machines and incremental chains.
    pub use_cbt: bool,
    pub verify_after_backup: bool,
    /// Reserved for concurrent disk transfers; disks are still copied one at a time.
    pub parallel_transfers: u32,
    /// Directory on the host where incremental clones are staged.
    pub scratch_dir: String,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            destination: "/Volumes/Backup/esxi-backups".to_string(),
            use_cbt: true,
            verify_after_backup: true,
            parallel_transfers: 2,
            scratch_dir: "/tmp".to_string(),
        }
    }
}

/// Typed configuration. Each key present in the file replaces the default
/// for that key only, nested sections included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub esxi: EsxiConfig,
    pub backup: BackupSettings,
    /// Machines to back up; empty means every machine on the host.
    pub vms: Vec<String>,
    pub exclude_vms: Vec<String>,
    pub retention: RetentionPolicy,
    pub datastore_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            esxi: EsxiConfig::default(),
            backup: BackupSettings::default(),
            vms: Vec::new(),
            exclude_vms: Vec::new(),
            retention: RetentionPolicy::default(),
            datastore_path: "/vmfs/volumes".to_string(),
        }
    }
}

impl Config {
    pub fn from_yaml(text: &str) -> Result<Self> {
        // An empty document is valid and means "all defaults".
        if text.trim().is_empty() {
            return Ok(Config::default());
        }
        let config: Config = serde_yaml::from_str(text)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.esxi.host.trim().is_empty() {
            return Err(AppError::InvalidConfig("esxi.host cannot be empty".to_string()));
        }
        if self.esxi.port == 0 {
            return Err(AppError::InvalidConfig("esxi.port cannot be 0".to_string()));
        }
        if self.esxi.username.trim().is_empty() {
            return Err(AppError::InvalidConfig("esxi.username cannot be empty".to_string()));
        }
        if self.esxi.connect_timeout_secs == 0 || self.esxi.command_timeout_secs == 0 {
            return Err(AppError::InvalidConfig("esxi timeouts must be positive".to_string()));
        }
        if self.backup.destination.trim().is_empty() {
            return Err(AppError::InvalidConfig(
                "backup.destination cannot be empty".to_string(),
            ));
        }
        if self.backup.parallel_transfers == 0 {
            return Err(AppError::InvalidConfig(
                "backup.parallel_transfers must be at least 1".to_string(),
            ));
        }
        if !self.backup.scratch_dir.starts_with('/') {
            return Err(AppError::InvalidConfig(
                "backup.scratch_dir must be an absolute host path".to_string(),
            ));
        }
        Ok(())
    }

    pub fn destination(&self) -> PathBuf {
        expand_home(&self.backup.destination)
    }

    pub fn key_file(&self) -> Option<PathBuf> {
        if self.esxi.key_file.trim().is_empty() {
            None
        } else {
            Some(expand_home(&self.esxi.key_file))
        }
    }
}

pub fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

pub fn load_config_from(path: &Path) -> Result<Config> {
    info!("Loading config from: {}", path.display());
    let text = fs::read_to_string(path)?;
    let config = Config::from_yaml(&text)?;
    config.validate()?;
    Ok(config)
}

/// Loads the explicit path when given, else the first file found in [`CONFIG_PATHS`].
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    if let Some(path) = explicit {
        return load_config_from(path);
    }

    for path in CONFIG_PATHS.iter() {
        if path.exists() {
            return load_config_from(path);
        }
    }

    warn!("No config file found, using defaults");
    let config = Config::default();
    config.validate()?;
    Ok(config)
}

pub const SAMPLE_CONFIG: &str = r#"# ESXi Backup Configuration
esxi:
  host: 192.168.1.100
  port: 22
  username: root
  # Key based login is used by the ssh client; leave password empty
  password: ""
  key_file: ~/.ssh/id_rsa
  connect_timeout_secs: 30
  command_timeout_secs: 300

backup:
  destination: /Volumes/Backup/esxi-backups
  use_cbt: true
  verify_after_backup: true
  # Not enforced yet, disks are copied one at a time
  parallel_transfers: 2
  scratch_dir: /tmp

# Leave empty to backup all VMs, or list specific names
vms: []
#  - Windows10
#  - Ubuntu-Server

# VMs to exclude from backup
exclude_vms: []
#  - TestVM

retention:
  keep_daily: 7
  keep_weekly: 4
  keep_monthly: 3
"#;

pub fn write_sample_config(path: &Path) -> Result<()> {
    if path.exists() {
        return Err(AppError::ConfigExists(path.to_path_buf()));
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, SAMPLE_CONFIG)?;
    Ok(())
}
