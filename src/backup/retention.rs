// pgvault/src/backup/retention.rs
//! Removes backup files and run manifests older than a cutoff.
//!
//! Age comes from the timestamp in the file name, not from filesystem
//! metadata, so copied or restored directories keep their history.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::catalog::ObjectKind;
use crate::errors::{BackupError, Result};
use crate::utils::naming;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub max_age_days: u32,
}

impl RetentionPolicy {
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(i64::from(self.max_age_days))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub removed: Vec<PathBuf>,
    pub kept: usize,
    pub failed: Vec<(PathBuf, String)>,
}

/// Only names this tool produces are ever considered.
fn is_backup_artifact(name: &str) -> bool {
    const KINDS: [ObjectKind; 4] = [
        ObjectKind::Table,
        ObjectKind::View,
        ObjectKind::MaterializedView,
        ObjectKind::Function,
    ];
    if name.starts_with("backup_run_") {
        return name.ends_with(".json");
    }
    KINDS
        .iter()
        .any(|kind| name.strip_prefix(kind.as_str()).is_some_and(|rest| rest.starts_with('_')))
}

/// Deletes artifacts in `root` whose embedded timestamp is before the cutoff.
///
/// Files that cannot be removed are reported, not fatal.
pub async fn prune(root: &Path, policy: RetentionPolicy, now: DateTime<Utc>) -> Result<PruneReport> {
    let cutoff = policy.cutoff(now);
    let mut report = PruneReport::default();
    let mut entries = tokio::fs::read_dir(root)
        .await
        .map_err(|e| BackupError::write(root, format!("cannot list directory: {}", e)))?;

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| BackupError::write(root, e))?
    {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !is_backup_artifact(&name) {
            continue;
        }
        let Some(stamp) = naming::parse_timestamp(&name) else {
            continue;
        };
        if stamp >= cutoff {
            report.kept += 1;
            continue;
        }

        let path = entry.path();
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(path = %path.display(), "removed expired backup");
                report.removed.push(path);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not remove expired backup");
                report.failed.push((path, e.to_string()));
            }
        }
    }
    report.removed.sort();
    info!(
        root = %root.display(),
        removed = report.removed.len(),
        kept = report.kept,
        max_age_days = policy.max_age_days,
        "retention cleanup finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn test_prune_removes_only_expired_artifacts() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let files = [
            "table_public.users_2024-01-01_00_00_00.sql.gz",
            "view_public.v_2024-03-01_12_00_00.sql",
            "backup_run_2024-01-01_00_00_00_0123456789abcdef0123456789abcdef.json",
            "notes_2020-01-01_00_00_00.txt",
            ".table_public.users_2024-01-01_00_00_00.sql.gz.abc.partial",
        ];
        for name in files {
            std::fs::write(dir.path().join(name), b"x")?;
        }
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap();

        let report = prune(dir.path(), RetentionPolicy { max_age_days: 30 }, now).await?;
        let removed: Vec<String> = report
            .removed
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();
        assert_eq!(
            removed,
            vec![
                "backup_run_2024-01-01_00_00_00_0123456789abcdef0123456789abcdef.json",
                "table_public.users_2024-01-01_00_00_00.sql.gz",
            ]
        );
        assert_eq!(report.kept, 1);
        assert!(dir.path().join("notes_2020-01-01_00_00_00.txt").exists());
        Ok(())
    }

    #[test]
    fn test_artifact_names() {
        assert!(is_backup_artifact("materialized_view_s.m_2024-01-01_00_00_00.csv"));
        assert!(is_backup_artifact("function_public.f__2024-01-01_00_00_00.sql"));
        assert!(!is_backup_artifact("tables.txt"));
        assert!(!is_backup_artifact("backup_run_x.log"));
    }
}
