use crate::error::{AppError, Result};
use crate::models::BackupTimestamp;
use crate::records::RecordStore;
use tracing::info;

/// Full or incremental, decided once per backup before the snapshot is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupPlan {
    pub timestamp: BackupTimestamp,
    pub incremental: bool,
    pub parent: Option<BackupTimestamp>,
}

impl BackupPlan {
    pub fn full(timestamp: BackupTimestamp) -> Self {
        Self {
            timestamp,
            incremental: false,
            parent: None,
        }
    }
}

pub fn plan_backup(
    store: &RecordStore,
    machine: &str,
    timestamp: BackupTimestamp,
    force_full: bool,
    incremental_enabled: bool,
) -> Result<BackupPlan> {
    let latest = store.latest_record(machine);

    if let Some(latest) = &latest {
        if latest.timestamp >= timestamp {
            return Err(AppError::TimestampNotIncreasing {
                machine: machine.to_string(),
                timestamp: timestamp.to_string(),
                latest: latest.timestamp.to_string(),
            });
        }
    }

    if force_full {
        info!("Full backup (forced)");
        return Ok(BackupPlan::full(timestamp));
    }

    let Some(latest) = latest else {
        info!("Full backup (no previous backup)");
        return Ok(BackupPlan::full(timestamp));
    };

    if !incremental_enabled {
        info!("Full backup (incremental mode disabled)");
        return Ok(BackupPlan::full(timestamp));
    }

    info!("Incremental backup (parent: {})", latest.timestamp);
    Ok(BackupPlan {
        timestamp,
        incremental: true,
        parent: Some(latest.timestamp),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BackupRecord;
    use tempfile::TempDir;

    fn ts(s: &str) -> BackupTimestamp {
        s.parse().unwrap()
    }

    fn seed(store: &RecordStore, stamp: &str) {
        store
            .append(&BackupRecord {
                timestamp: ts(stamp),
                machine: "web01".into(),
                vmx_path: String::new(),
                disks: vec![],
                incremental: false,
                change_id: String::new(),
                parent: None,
                total_bytes: 0,
            })
            .unwrap();
    }

    #[test]
    fn first_backup_is_full() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::new(dir.path());

        let plan = plan_backup(&store, "web01", ts("20240301_020000"), false, true).unwrap();
        assert_eq!(plan, BackupPlan::full(ts("20240301_020000")));
    }

    #[test]
    fn later_backup_chains_to_latest() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::new(dir.path());
        seed(&store, "20240301_020000");

        let plan = plan_backup(&store, "web01", ts("20240302_020000"), false, true).unwrap();
        assert!(plan.incremental);
        assert_eq!(plan.parent, Some(ts("20240301_020000")));
    }

    #[test]
    fn forced_full_ignores_history() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::new(dir.path());
        seed(&store, "20240301_020000");

        let plan = plan_backup(&store, "web01", ts("20240302_020000"), true, true).unwrap();
        assert!(!plan.incremental);
        assert_eq!(plan.parent, None);
    }

    #[test]
    fn disabled_incremental_mode_gives_full() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::new(dir.path());
        seed(&store, "20240301_020000");

        let plan = plan_backup(&store, "web01", ts("20240302_020000"), false, false).unwrap();
        assert_eq!(plan, BackupPlan::full(ts("20240302_020000")));
    }

    #[test]
    fn same_second_backup_is_refused() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::new(dir.path());
        seed(&store, "20240301_020000");

        let err = plan_backup(&store, "web01", ts("20240301_020000"), false, true).unwrap_err();
        assert!(matches!(err, AppError::TimestampNotIncreasing { .. }));
    }
}
