//! Grandfather-father-son pruning of backup instances.
//!
//! Each machine is handled on its own. Instances are walked newest first and
//! three independent quotas decide what stays:
//!
//! * daily: the `keep_daily` most recent backups, whatever their date;
//! * weekly: the `keep_weekly` most recent backups taken on a Sunday;
//! * monthly: the `keep_monthly` most recent backups taken on the 1st.
//!
//! A backup may satisfy several quotas at once and is then counted in each.
//! Anything whose name is not a backup timestamp, or whose record cannot be
//! read, is left on disk untouched.
//!
//! Incremental chains are not taken into account: a parent can be pruned
//! while one of its children is kept.

use crate::error::Result;
use crate::models::BackupTimestamp;
use crate::records::RecordStore;
use chrono::{Datelike, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, info, instrument};

pub const WEEKLY_ANCHOR: Weekday = Weekday::Sun;
pub const MONTHLY_ANCHOR_DAY: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    pub keep_daily: usize,
    pub keep_weekly: usize,
    pub keep_monthly: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep_daily: 7,
            keep_weekly: 4,
            keep_monthly: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionCandidate {
    pub name: String,
    pub timestamp: Option<BackupTimestamp>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tiers {
    pub daily: bool,
    pub weekly: bool,
    pub monthly: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeptBackup {
    pub name: String,
    pub tiers: Tiers,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionPlan {
    /// Newest first.
    pub keep: Vec<KeptBackup>,
    /// Newest first.
    pub prune: Vec<String>,
    pub skipped: Vec<String>,
}

impl RetentionPlan {
    pub fn kept_names(&self) -> Vec<&str> {
        self.keep.iter().map(|k| k.name.as_str()).collect()
    }
}

pub fn plan_retention(candidates: &[RetentionCandidate], policy: &RetentionPolicy) -> RetentionPlan {
    let mut plan = RetentionPlan::default();
    let mut dated: Vec<(BackupTimestamp, &str)> = Vec::new();

    for candidate in candidates {
        match candidate.timestamp {
            Some(ts) => dated.push((ts, candidate.name.as_str())),
            None => plan.skipped.push(candidate.name.clone()),
        }
    }
    dated.sort_by(|a, b| b.0.cmp(&a.0));

    let (mut daily, mut weekly, mut monthly) = (0usize, 0usize, 0usize);
    let mut kept: HashSet<&str> = HashSet::new();

    for (ts, name) in &dated {
        let date = ts.datetime().date();
        let mut tiers = Tiers::default();

        if daily < policy.keep_daily {
            tiers.daily = true;
            daily += 1;
        }
        if date.weekday() == WEEKLY_ANCHOR && weekly < policy.keep_weekly {
            tiers.weekly = true;
            weekly += 1;
        }
        if date.day() == MONTHLY_ANCHOR_DAY && monthly < policy.keep_monthly {
            tiers.monthly = true;
            monthly += 1;
        }

        if tiers.daily || tiers.weekly || tiers.monthly {
            if kept.insert(name) {
                plan.keep.push(KeptBackup {
                    name: name.to_string(),
                    tiers,
                });
            }
        } else {
            plan.prune.push(name.to_string());
        }
    }

    plan
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionReport {
    /// `(machine, backup)` pairs that were deleted, or would be in a dry run.
    pub pruned: Vec<(String, String)>,
    pub kept: usize,
    pub skipped: usize,
}

/// Applies `policy` to every machine directory in the store.
#[instrument(skip(store))]
pub fn apply_retention(store: &RecordStore, policy: &RetentionPolicy, dry_run: bool) -> Result<RetentionReport> {
    info!("Applying retention policy...");
    let mut report = RetentionReport::default();

    for machine in store.machines()? {
        let candidates: Vec<RetentionCandidate> = store
            .list_instances(&machine)?
            .into_iter()
            .map(|instance| RetentionCandidate {
                // Without a readable record there is nothing to classify.
                timestamp: instance.record.as_ref().and(instance.timestamp),
                name: instance.name,
            })
            .collect();

        let plan = plan_retention(&candidates, policy);
        for name in &plan.skipped {
            debug!("Leaving unrecognised backup untouched: {}/{}", machine, name);
        }

        for name in plan.prune {
            if dry_run {
                info!("Would remove old backup: {}/{}", machine, name);
            } else {
                info!("Removing old backup: {}/{}", machine, name);
                store.remove_instance(&machine, &name)?;
            }
            report.pruned.push((machine.clone(), name));
        }
        report.kept += plan.keep.len();
        report.skipped += plan.skipped.len();
    }

    Ok(report)
}
