use crate::error::{AppError, Result};
use crate::records::{BackupInstance, RecordStore, RECORD_FILE_NAME};
use std::env;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{info, instrument};

/// Number of backups shown when listing restore candidates.
pub const LISTING_LIMIT: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub target: PathBuf,
    pub files: Vec<String>,
    pub bytes: u64,
}

/// Backup directories of `machine`, newest first.
pub fn list_backups(store: &RecordStore, machine: &str) -> Result<Vec<BackupInstance>> {
    let instances = store.list_instances(machine)?;
    if instances.is_empty() {
        return Err(AppError::NoBackups(machine.to_string()));
    }
    Ok(instances)
}

/// Resolves `selector` as an index into the newest-first listing, else as a
/// backup directory name. No selector means the newest backup.
pub fn select_backup(store: &RecordStore, machine: &str, selector: Option<&str>) -> Result<BackupInstance> {
    let mut instances = list_backups(store, machine)?;
    let selector = selector.unwrap_or("0").trim();

    if let Ok(index) = selector.parse::<usize>() {
        if index < instances.len() {
            return Ok(instances.swap_remove(index));
        }
    }

    instances
        .into_iter()
        .find(|instance| instance.name == selector)
        .ok_or_else(|| AppError::BackupNotFound(selector.to_string()))
}

/// Checks a restore target. Relative targets resolve against the working directory.
pub fn validate_target_path(target: &str) -> Result<PathBuf> {
    if target.trim().is_empty() {
        return Err(AppError::EmptyTargetPath);
    }

    if target.contains('\0') {
        return Err(AppError::InvalidTargetPath);
    }

    let mut path = PathBuf::from(target);
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(AppError::PathTraversal);
    }

    if !path.is_absolute() {
        path = env::current_dir()?.join(path);
    }

    // Target itself might not exist yet, but parent should
    if let Some(parent) = path.parent() {
        if !parent.exists() && parent.components().count() > 1 {
            return Err(AppError::ParentDirectoryNotFound(parent.to_path_buf()));
        }
    }

    Ok(path)
}

/// `./<machine>` in the working directory.
pub fn default_target(machine: &str) -> Result<PathBuf> {
    Ok(env::current_dir()?.join(machine))
}

/// Copies the backup's files, all but the record itself, into `target`.
#[instrument(skip(instance), fields(backup = %instance.name))]
pub fn restore_backup(instance: &BackupInstance, target: &Path) -> Result<RestoreReport> {
    fs::create_dir_all(target)?;

    let mut entries: Vec<_> = fs::read_dir(&instance.path)?.collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    let mut report = RestoreReport {
        target: target.to_path_buf(),
        ..RestoreReport::default()
    };
    for entry in entries {
        let name = entry.file_name().to_string_lossy().to_string();
        if name == RECORD_FILE_NAME || !entry.file_type()?.is_file() {
            continue;
        }
        info!("Copying: {}", name);
        report.bytes += fs::copy(entry.path(), target.join(&name))?;
        report.files.push(name);
    }

    info!("Restore complete: {}", target.display());
    Ok(report)
}
