use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failures surfaced by the remote host channel.
///
/// Callers branch on the variant: a lost connection ends the whole run,
/// while a failed command usually only concerns one machine.
#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("Cannot reach host {host}: {reason}")]
    Connection { host: String, reason: String },

    #[error("Command timed out after {seconds}s: {command}")]
    Timeout { command: String, seconds: u64 },

    #[error("Command failed with exit code {code}: {stderr}")]
    CommandFailed { command: String, code: i32, stderr: String },

    #[error("Remote file not found: {0}")]
    NotFound(String),

    #[error("Transfer of {remote} failed: {reason}")]
    Transfer { remote: String, reason: String },
}

/// Coarse classes of [`AppError`] used to decide how far a failure reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The host cannot be reached. Fatal for the whole run.
    Connectivity,
    /// The host refused a step the backup depends on. Fatal for one machine.
    Precondition,
    /// A single file copy failed.
    Transfer,
    /// A stored record could not be read.
    Metadata,
    Interrupted,
    Other,
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Machine name cannot be empty")]
    EmptyMachineName,

    #[error("Machine name contains invalid characters: {0}")]
    InvalidMachineName(String),

    #[error("Virtual machine not found on host: {0}")]
    MachineNotFound(String),

    #[error("Failed to create snapshot '{label}' on {machine}: {reason}")]
    SnapshotCreate { machine: String, label: String, reason: String },

    #[error("Failed to remove snapshot '{label}' on {machine}: {reason}")]
    SnapshotRemove { machine: String, label: String, reason: String },

    #[error("{0} must be powered off to enable change tracking")]
    ChangeTrackingPoweredOn(String),

    #[error("Backup {timestamp} for {machine} is not newer than existing backup {latest}")]
    TimestampNotIncreasing { machine: String, timestamp: String, latest: String },

    #[error("Backup record already exists: {0}")]
    RecordExists(PathBuf),

    #[error("Malformed backup record {path}: {reason}")]
    MalformedRecord { path: PathBuf, reason: String },

    #[error("Invalid backup timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("No backups found for machine: {0}")]
    NoBackups(String),

    #[error("Backup not found: {0}")]
    BackupNotFound(String),

    #[error("Target path cannot be empty")]
    EmptyTargetPath,

    #[error("Target path contains invalid characters")]
    InvalidTargetPath,

    #[error("Target path cannot contain '..' components")]
    PathTraversal,

    #[error("Parent directory does not exist: {0}")]
    ParentDirectoryNotFound(PathBuf),

    #[error("Configuration file already exists: {0}")]
    ConfigExists(PathBuf),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{0} machine(s) were not fully backed up")]
    BackupIncomplete(usize),

    #[error("Operation interrupted")]
    Interrupted,

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl AppError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            AppError::Remote(RemoteError::Connection { .. }) => ErrorCategory::Connectivity,
            AppError::Remote(RemoteError::Transfer { .. })
            | AppError::Remote(RemoteError::NotFound(_)) => ErrorCategory::Transfer,
            AppError::Remote(_)
            | AppError::MachineNotFound(_)
            | AppError::SnapshotCreate { .. }
            | AppError::ChangeTrackingPoweredOn(_)
            | AppError::TimestampNotIncreasing { .. }
            | AppError::RecordExists(_) => ErrorCategory::Precondition,
            AppError::MalformedRecord { .. } | AppError::Json(_) => ErrorCategory::Metadata,
            AppError::Interrupted => ErrorCategory::Interrupted,
            _ => ErrorCategory::Other,
        }
    }

    /// True when the run cannot continue with the next machine.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Connectivity | ErrorCategory::Interrupted
        )
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
