//! Local retention: removal of session directories past the retention window.

use crate::session::SessionId;
use crate::utils::errors::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Default, Clone, Serialize, PartialEq, Eq)]
pub struct ReapSummary {
    /// Session ids whose directories were deleted
    pub removed: Vec<String>,
    /// Sessions still inside the window (or protected)
    pub kept: usize,
    /// Entries left alone: unparseable names, non-directories, failed removals
    pub skipped: Vec<String>,
}

/// Delete every session directory whose timestamp is strictly older than
/// `now - retention_days`. `keep` is never removed regardless of age.
pub fn reap(
    sessions_dir: &Path,
    retention_days: u32,
    now: DateTime<Utc>,
    keep: Option<&SessionId>,
) -> Result<ReapSummary> {
    let mut summary = ReapSummary::default();
    if !sessions_dir.is_dir() {
        return Ok(summary);
    }

    let cutoff = now - Duration::days(i64::from(retention_days));

    let mut entries: Vec<_> = std::fs::read_dir(sessions_dir)?
        .filter_map(|e| e.ok())
        .collect();
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name().to_string_lossy().to_string();

        let id = match SessionId::parse(&name) {
            Some(id) if entry.path().is_dir() => id,
            _ => {
                summary.skipped.push(name);
                continue;
            }
        };

        if keep == Some(&id) || id.timestamp() >= cutoff {
            summary.kept += 1;
            continue;
        }

        match std::fs::remove_dir_all(entry.path()) {
            Ok(()) => {
                info!(session = %name, "Removed expired session");
                summary.removed.push(name);
            }
            Err(e) => {
                warn!(session = %name, error = %e, "Failed to remove expired session");
                summary.skipped.push(name);
            }
        }
    }

    info!(
        removed = summary.removed.len(),
        kept = summary.kept,
        skipped = summary.skipped.len(),
        retention_days,
        "Retention pass complete"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn make_session(dir: &Path, ts: DateTime<Utc>) -> SessionId {
        let id = SessionId::generate(ts, 42);
        std::fs::create_dir_all(dir.join(id.to_string()).join("metadata")).unwrap();
        id
    }

    #[test]
    fn test_window_is_strict() {
        let dir = TempDir::new().unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();

        let old = make_session(dir.path(), now - Duration::days(8));
        let boundary = make_session(dir.path(), now - Duration::days(7));
        let recent = make_session(dir.path(), now - Duration::hours(3));

        let summary = reap(dir.path(), 7, now, None).unwrap();
        assert_eq!(summary.removed, vec![old.to_string()]);
        assert_eq!(summary.kept, 2);
        assert!(!dir.path().join(old.to_string()).exists());
        assert!(dir.path().join(boundary.to_string()).exists());
        assert!(dir.path().join(recent.to_string()).exists());
    }

    #[test]
    fn test_month_boundary_uses_dates_not_strings() {
        let dir = TempDir::new().unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap();
        // 2024-02-28 is within a 7-day window even though "0228" sorts after "0302"
        let feb = make_session(dir.path(), Utc.with_ymd_and_hms(2024, 2, 28, 0, 0, 0).unwrap());
        let jan = make_session(dir.path(), Utc.with_ymd_and_hms(2024, 1, 31, 0, 0, 0).unwrap());

        let summary = reap(dir.path(), 7, now, None).unwrap();
        assert_eq!(summary.removed, vec![jan.to_string()]);
        assert!(dir.path().join(feb.to_string()).exists());
    }

    #[test]
    fn test_protected_and_foreign_entries_survive() {
        let dir = TempDir::new().unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();
        let current = make_session(dir.path(), now - Duration::days(30));
        std::fs::create_dir(dir.path().join("lost+found")).unwrap();
        std::fs::write(dir.path().join("backup_20000101_000000_1"), b"not a dir").unwrap();

        let summary = reap(dir.path(), 7, now, Some(&current)).unwrap();
        assert!(summary.removed.is_empty());
        assert_eq!(summary.kept, 1);
        assert_eq!(summary.skipped.len(), 2);
        assert!(dir.path().join("lost+found").exists());
    }

    #[test]
    fn test_missing_sessions_dir() {
        let dir = TempDir::new().unwrap();
        let summary = reap(&dir.path().join("nope"), 7, Utc::now(), None).unwrap();
        assert_eq!(summary, ReapSummary::default());
    }
}
