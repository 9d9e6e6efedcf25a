use crate::error::{AppError, RemoteError, Result};
use crate::host::flat_companion;
use crate::models::{Disk, DiskArtifact};
use crate::remote::{quote, RemoteChannel};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, instrument, warn};

/// A disk captured into the backup directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskTransfer {
    pub source: String,
    pub artifact: PathBuf,
    pub flat: Option<PathBuf>,
    pub bytes: u64,
}

impl DiskTransfer {
    pub fn to_artifact(&self) -> DiskArtifact {
        DiskArtifact {
            source: self.source.clone(),
            artifact: self.artifact.to_string_lossy().to_string(),
            flat: self
                .flat
                .as_ref()
                .map(|p| p.to_string_lossy().to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskOutcome {
    Copied(DiskTransfer),
    Failed { source: String, reason: String },
}

/// Copies disks from the host, one at a time.
pub struct TransferOrchestrator<'a> {
    channel: &'a dyn RemoteChannel,
    scratch_dir: String,
    verify: bool,
}

impl<'a> TransferOrchestrator<'a> {
    pub fn new(channel: &'a dyn RemoteChannel, scratch_dir: &str, verify: bool) -> Self {
        Self {
            channel,
            scratch_dir: scratch_dir.trim_end_matches('/').to_string(),
            verify,
        }
    }

    /// Captures one disk into `dest_dir`.
    ///
    /// Only failures that end the whole run come back as `Err`; anything
    /// else is reported as [`DiskOutcome::Failed`] so sibling disks continue.
    #[instrument(skip(self, disk, dest_dir), fields(disk = %disk.file_name()))]
    pub fn transfer_disk(&self, disk: &Disk, dest_dir: &Path, incremental: bool) -> Result<DiskOutcome> {
        info!("Backing up: {}", disk.file_name());
        let local = dest_dir.join(disk.file_name());

        let copied = if incremental {
            self.clone_copy(disk, &local)
        } else {
            self.full_copy(&disk.path, &local)
        };

        match copied {
            Ok((bytes, flat)) => Ok(DiskOutcome::Copied(DiskTransfer {
                source: disk.path.clone(),
                artifact: local,
                flat,
                bytes,
            })),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!("Disk {} failed: {}", disk.path, e);
                discard_partial(&local);
                Ok(DiskOutcome::Failed {
                    source: disk.path.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Raw copy of the descriptor and, when present, its flat data file.
    fn full_copy(&self, remote: &str, local: &Path) -> Result<(u64, Option<PathBuf>)> {
        let mut bytes = self.copy_file(remote, local)?;

        let remote_flat = flat_companion(remote);
        let mut flat = None;
        if self.channel.file_exists(&remote_flat)? {
            let local_flat = PathBuf::from(flat_companion(&local.to_string_lossy()));
            bytes += self.copy_file(&remote_flat, &local_flat)?;
            flat = Some(local_flat);
        }
        Ok((bytes, flat))
    }

    /// Thin clone on the host, then copy of the clone. Falls back to a raw
    /// copy of the source when the host produced no clone or the clone
    /// command failed short of losing the connection.
    fn clone_copy(&self, disk: &Disk, local: &Path) -> Result<(u64, Option<PathBuf>)> {
        let staged = format!("{}/backup_{}", self.scratch_dir, disk.file_name());

        let clone = self
            .channel
            .run_unbounded(&format!(
                "vmkfstools -i {} -d thin {}",
                quote(&disk.path),
                quote(&staged)
            ))
            .map_err(AppError::from);
        let problem = match clone {
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => Some(e.to_string()),
            Ok(_) if !self.channel.file_exists(&staged)? => Some("no clone produced".to_string()),
            Ok(_) => None,
        };

        match problem {
            Some(reason) => {
                warn!("Thin clone of {} failed ({}), falling back to direct copy", disk.path, reason);
                self.remove_staged(&staged);
                self.full_copy(&disk.path, local)
            }
            None => {
                let copied = self.full_copy(&staged, local);
                self.remove_staged(&staged);
                copied
            }
        }
    }

    fn remove_staged(&self, staged: &str) {
        let cleanup = self.channel.run_lenient(&format!(
            "rm -f {} {}",
            quote(staged),
            quote(&flat_companion(staged))
        ));
        if let Err(e) = cleanup {
            warn!("Failed to remove staged clone {}: {}", staged, e);
        }
    }

    /// Downloads one file and checks what arrived.
    fn copy_file(&self, remote: &str, local: &Path) -> Result<u64> {
        self.channel.download(remote, local)?;

        let received = fs::metadata(local).map(|meta| meta.len()).unwrap_or(0);
        if received == 0 {
            return Err(AppError::Remote(RemoteError::Transfer {
                remote: remote.to_string(),
                reason: "destination missing or empty after transfer".to_string(),
            }));
        }

        if self.verify {
            let expected = self.channel.file_size(remote)?;
            if expected != received {
                return Err(AppError::Remote(RemoteError::Transfer {
                    remote: remote.to_string(),
                    reason: format!("size mismatch: host {} bytes, local {} bytes", expected, received),
                }));
            }
        }
        Ok(received)
    }
}

/// Removes whatever part of a failed disk reached the backup directory.
fn discard_partial(local: &Path) {
    let flat = PathBuf::from(flat_companion(&local.to_string_lossy()));
    for path in [local, flat.as_path()] {
        if path.exists() {
            if let Err(e) = fs::remove_file(path) {
                warn!("Failed to remove partial file {}: {}", path.display(), e);
            }
        }
    }
}
