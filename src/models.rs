use crate::error::{AppError, Result};
use chrono::{Local, NaiveDateTime, Timelike};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    On,
    Off,
    Suspended,
    Unknown,
}

impl PowerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerState::On => "on",
            PowerState::Off => "off",
            PowerState::Suspended => "suspended",
            PowerState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Disk {
    pub path: String,
    pub size_bytes: u64,
    pub thin: bool,
}

impl Disk {
    pub fn file_name(&self) -> &str {
        Path::new(&self.path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.path)
    }
}

/// State of one virtual machine as reported by the host at invocation time.
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualMachine {
    pub vmid: u32,
    pub name: String,
    pub vmx_path: String,
    pub datastore: String,
    pub power_state: PowerState,
    pub disks: Vec<Disk>,
    pub change_tracking: bool,
}

impl VirtualMachine {
    pub fn is_powered_on(&self) -> bool {
        self.power_state == PowerState::On
    }

    /// Directory on the datastore that holds the `.vmx` and its disks.
    pub fn vmx_dir(&self) -> &str {
        match self.vmx_path.rfind('/') {
            Some(0) => "/",
            Some(idx) => &self.vmx_path[..idx],
            None => ".",
        }
    }
}

/// Instant of a backup, also the key of the backup within its machine's chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BackupTimestamp(NaiveDateTime);

impl BackupTimestamp {
    pub fn now() -> Self {
        Self::from_datetime(Local::now().naive_local())
    }

    /// Truncates to whole seconds so `Display` and `FromStr` stay lossless.
    pub fn from_datetime(dt: NaiveDateTime) -> Self {
        Self(dt.with_nanosecond(0).unwrap_or(dt))
    }

    pub fn datetime(&self) -> NaiveDateTime {
        self.0
    }
}

impl fmt::Display for BackupTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(TIMESTAMP_FORMAT))
    }
}

impl FromStr for BackupTimestamp {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        // chrono accepts some sloppy widths; the directory name must be exact
        if s.len() != 15 {
            return Err(AppError::InvalidTimestamp(s.to_string()));
        }
        NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
            .map(BackupTimestamp)
            .map_err(|_| AppError::InvalidTimestamp(s.to_string()))
    }
}

impl Serialize for BackupTimestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BackupTimestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One captured disk: where it came from on the host and where it is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskArtifact {
    #[serde(rename = "path")]
    pub source: String,
    #[serde(rename = "local")]
    pub artifact: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flat: Option<String>,
}

/// Metadata of one backup instance, stored as `backup.json` next to the artifacts.
///
/// `change_id` is an audit label derived from the backup time, not a block
/// change token; it cannot be used to tell which blocks changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub timestamp: BackupTimestamp,
    #[serde(rename = "vm_name")]
    pub machine: String,
    #[serde(default)]
    pub vmx_path: String,
    pub disks: Vec<DiskArtifact>,
    #[serde(rename = "cbt_used")]
    pub incremental: bool,
    #[serde(default)]
    pub change_id: String,
    #[serde(rename = "parent_backup", default, with = "empty_as_none")]
    pub parent: Option<BackupTimestamp>,
    #[serde(rename = "size_bytes", default)]
    pub total_bytes: u64,
}

/// Older records spell "no parent" as an empty string.
mod empty_as_none {
    use super::BackupTimestamp;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<BackupTimestamp>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(ts) => serializer.collect_str(ts),
            None => serializer.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<BackupTimestamp>, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        if raw.is_empty() {
            return Ok(None);
        }
        raw.parse().map(Some).map_err(serde::de::Error::custom)
    }
}
