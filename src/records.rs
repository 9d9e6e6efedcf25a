use crate::error::{AppError, Result};
use crate::models::{BackupRecord, BackupTimestamp};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

pub const RECORD_FILE_NAME: &str = "backup.json";
const RECORD_TMP_NAME: &str = "backup.json.tmp";

/// One directory under a machine's backup folder.
#[derive(Debug, Clone)]
pub struct BackupInstance {
    pub name: String,
    pub path: PathBuf,
    /// `None` when the directory name is not a backup timestamp.
    pub timestamp: Option<BackupTimestamp>,
    /// `None` when `backup.json` is missing or malformed.
    pub record: Option<BackupRecord>,
}

/// Backup records laid out as `<root>/<machine>/<timestamp>/backup.json`.
///
/// Records are immutable once written; only retention deletes them.
#[derive(Debug, Clone)]
pub struct RecordStore {
    root: PathBuf,
}

impl RecordStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn machine_dir(&self, machine: &str) -> PathBuf {
        self.root.join(machine)
    }

    pub fn instance_dir(&self, machine: &str, timestamp: &BackupTimestamp) -> PathBuf {
        self.machine_dir(machine).join(timestamp.to_string())
    }

    pub fn create_instance_dir(&self, machine: &str, timestamp: &BackupTimestamp) -> Result<PathBuf> {
        let dir = self.instance_dir(machine, timestamp);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Machine directories present under the root, sorted by name.
    pub fn machines(&self) -> Result<Vec<String>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut machines = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                machines.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        machines.sort();
        Ok(machines)
    }

    /// Every backup directory of `machine`, newest name first.
    pub fn list_instances(&self, machine: &str) -> Result<Vec<BackupInstance>> {
        let dir = self.machine_dir(machine);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut instances = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let timestamp = name.parse::<BackupTimestamp>().ok();
            let record = match timestamp {
                Some(ts) => self.read_record(machine, &ts, &entry.path()),
                None => None,
            };
            instances.push(BackupInstance {
                name,
                path: entry.path(),
                timestamp,
                record,
            });
        }

        // The timestamp format sorts chronologically by name.
        instances.sort_by(|a, b| b.name.cmp(&a.name));
        Ok(instances)
    }

    /// Well-formed records of `machine`, newest first.
    pub fn list_records(&self, machine: &str) -> Result<Vec<BackupRecord>> {
        Ok(self
            .list_instances(machine)?
            .into_iter()
            .filter_map(|instance| instance.record)
            .collect())
    }

    /// Most recent readable record, skipping anything malformed or half written.
    #[instrument(skip(self))]
    pub fn latest_record(&self, machine: &str) -> Option<BackupRecord> {
        match self.list_instances(machine) {
            Ok(instances) => instances.into_iter().find_map(|instance| instance.record),
            Err(e) => {
                warn!("Cannot scan backups of {}: {}", machine, e);
                None
            }
        }
    }

    fn read_record(&self, machine: &str, timestamp: &BackupTimestamp, dir: &Path) -> Option<BackupRecord> {
        let path = dir.join(RECORD_FILE_NAME);
        match load_record(&path) {
            Ok(record) if record.timestamp == *timestamp && record.machine == machine => Some(record),
            Ok(record) => {
                debug!(
                    "Skipping {:?}: record is for {}/{}",
                    path, record.machine, record.timestamp
                );
                None
            }
            Err(e) => {
                debug!("Skipping {:?}: {}", path, e);
                None
            }
        }
    }

    /// Writes `record` into its instance directory. The file appears under
    /// its final name only once fully written and synced.
    #[instrument(skip(self, record), fields(machine = %record.machine, timestamp = %record.timestamp))]
    pub fn append(&self, record: &BackupRecord) -> Result<PathBuf> {
        let dir = self.create_instance_dir(&record.machine, &record.timestamp)?;
        let final_path = dir.join(RECORD_FILE_NAME);
        if final_path.exists() {
            return Err(AppError::RecordExists(final_path));
        }

        let tmp_path = dir.join(RECORD_TMP_NAME);
        let json = serde_json::to_string_pretty(record)?;
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }
        if let Err(e) = fs::rename(&tmp_path, &final_path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }

        info!("Backup record written: {:?}", final_path);
        Ok(final_path)
    }

    pub fn remove_instance(&self, machine: &str, name: &str) -> Result<()> {
        let dir = self.machine_dir(machine).join(name);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }
}

pub fn load_record(path: &Path) -> Result<BackupRecord> {
    let json = fs::read_to_string(path)?;
    serde_json::from_str(&json).map_err(|e| AppError::MalformedRecord {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}
