use super::{LatestSession, MonitorContext};
use crate::report::AlertSet;
use dr_backup::session::manifest::{load_manifest, ManifestStatus};
use dr_backup::session::{list_sessions, SessionLayout, SessionState};

/// What the sessions directory says about recent runs.
#[derive(Debug, Default)]
pub struct SessionScan {
    /// Newest session with a readable manifest, whatever its state
    pub newest: Option<LatestSession>,
    /// Newest session whose manifest reached `Finalized`
    pub latest_finalized: Option<LatestSession>,
}

/// Walk sessions newest first until a finalized one is found. Unreadable
/// manifests are passed over.
pub fn scan(ctx: &MonitorContext<'_>) -> dr_backup::Result<SessionScan> {
    let sessions_dir = ctx.config.sessions_dir();
    let mut found = SessionScan::default();

    for id in list_sessions(&sessions_dir)?.into_iter().rev() {
        let layout = SessionLayout::for_session(&sessions_dir, &id);
        let manifest = match load_manifest(&layout.manifest_path()) {
            Ok(manifest) => manifest,
            Err(e) => {
                tracing::debug!(session = %id, error = %e, "Skipping unreadable session");
                continue;
            }
        };
        let session = LatestSession {
            id: id.to_string(),
            dir: layout.root().to_path_buf(),
            manifest,
        };
        let finalized = session.manifest.state == SessionState::Finalized;
        if found.newest.is_none() {
            found.newest = Some(session.clone());
        }
        if finalized {
            found.latest_finalized = Some(session);
            break;
        }
    }
    Ok(found)
}

/// The newest run decides whether the last attempt went wrong; the newest
/// finalized one decides how old the last usable backup is. Returns the
/// latter for the checks that read artifacts.
pub fn check(ctx: &MonitorContext<'_>, alerts: &mut AlertSet) -> Option<LatestSession> {
    let found = match scan(ctx) {
        Ok(found) => found,
        Err(e) => {
            alerts.critical(format!("cannot read sessions directory: {}", e));
            return None;
        }
    };

    let Some(newest) = found.newest else {
        alerts.critical("no backups found");
        return None;
    };
    check_newest(ctx, &newest, alerts);

    let Some(latest) = found.latest_finalized else {
        alerts.critical("no finalized backups found");
        return None;
    };

    let age = ctx.now - latest.manifest.start_time;
    if age.num_seconds() > secs(ctx.config.backup_age_alert_secs) {
        alerts.critical(format!(
            "latest backup {} is {}h old (threshold {}h)",
            latest.id,
            age.num_hours(),
            ctx.config.backup_age_alert_secs / 3600
        ));
    }

    if latest.manifest.metadata.status == ManifestStatus::Failed {
        alerts.warning(format!(
            "latest backup {} finished with {} error(s)",
            latest.id, latest.manifest.metadata.errors
        ));
    }

    Some(latest)
}

fn check_newest(ctx: &MonitorContext<'_>, newest: &LatestSession, alerts: &mut AlertSet) {
    let manifest = &newest.manifest;
    match manifest.state {
        SessionState::Finalized => {}
        SessionState::Failed => alerts.critical(format!(
            "latest backup run {} failed with {} error(s)",
            newest.id, manifest.metadata.errors
        )),
        // a fatal abort stops in a non-terminal state with its errors recorded
        state if manifest.metadata.errors > 0 => alerts.critical(format!(
            "latest backup run {} aborted in state {:?} with {} error(s)",
            newest.id, state, manifest.metadata.errors
        )),
        state => {
            let running = ctx.now - manifest.start_time;
            if running.num_seconds() > secs(ctx.config.stale_run_secs) {
                alerts.warning(format!(
                    "backup run {} stuck in state {:?} for {}h",
                    newest.id,
                    state,
                    running.num_hours()
                ));
            } else {
                tracing::info!(session = %newest.id, state = ?state, "Backup run in progress");
            }
        }
    }
}

fn secs(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checks::testing::ScriptedRunner;
    use chrono::{DateTime, Duration, Utc};
    use dr_backup::notify::Severity;
    use dr_backup::session::manifest::{EncryptionInfo, Manifest, ManifestStore};
    use dr_backup::session::{BackupSession, SessionId};
    use dr_backup::DrConfig;
    use std::path::Path;
    use tempfile::TempDir;

    /// A session left in `state`. Finalized sessions end ten minutes after
    /// they start.
    fn write_session(
        sessions: &Path,
        start: DateTime<Utc>,
        state: SessionState,
        errors: u32,
    ) -> (SessionId, ManifestStore) {
        let id = SessionId::generate(start, 1);
        let layout = SessionLayout::for_session(sessions, &id);
        layout.create().unwrap();
        let mut session = BackupSession::new(id.clone(), start);
        for _ in 0..errors {
            session.record_error("dump failed");
        }
        let encryption = EncryptionInfo {
            enabled: true,
            cipher: "AES-256-GCM".into(),
            key_reference: "/k".into(),
        };
        let store = ManifestStore::create(layout.manifest_path(), &Manifest::new(&session, "h", encryption, 7)).unwrap();
        match state {
            SessionState::Finalized => {
                session.transition(SessionState::Finalized).unwrap();
                store.finalize(&session).unwrap();
                store.update(|m| m.end_time = Some(start + Duration::minutes(10))).unwrap();
            }
            SessionState::Failed => {
                session.transition(SessionState::Failed).unwrap();
                store.fail(&session).unwrap();
            }
            SessionState::Initializing => {
                store.sync_session(&session).unwrap();
            }
            other => {
                session.transition(other).unwrap();
                store.sync_session(&session).unwrap();
            }
        }
        (id, store)
    }

    fn run(config: &DrConfig, now: DateTime<Utc>) -> (AlertSet, Option<LatestSession>) {
        let runner = ScriptedRunner::healthy("");
        let ctx = MonitorContext {
            config,
            runner: &runner,
            sinks: &[],
            now,
        };
        let mut alerts = AlertSet::new();
        let latest = check(&ctx, &mut alerts);
        (alerts, latest)
    }

    fn config(dir: &TempDir) -> DrConfig {
        DrConfig {
            backup_root: dir.path().to_path_buf(),
            ..Default::default()
        }
    }

    #[test]
    fn test_run_in_progress_is_not_an_alert() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let now = Utc::now();
        let (done, _) = write_session(&config.sessions_dir(), now - Duration::hours(2), SessionState::Finalized, 0);
        write_session(
            &config.sessions_dir(),
            now - Duration::minutes(5),
            SessionState::ProducingArtifacts,
            0,
        );

        let (alerts, latest) = run(&config, now);
        assert!(alerts.is_empty());
        assert_eq!(latest.unwrap().id, done.to_string());
    }

    #[test]
    fn test_stale_backup_is_critical() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let now = Utc::now();
        write_session(&config.sessions_dir(), now - Duration::hours(30), SessionState::Finalized, 0);

        let (alerts, latest) = run(&config, now);
        assert!(latest.is_some());
        assert_eq!(alerts.level(), Severity::Critical);
        assert!(alerts.alerts()[0].message.contains("threshold 25h"));
    }

    #[test]
    fn test_age_counts_from_start_not_end() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let now = Utc::now();
        let start = now - Duration::hours(26);
        let (_, store) = write_session(&config.sessions_dir(), start, SessionState::Finalized, 0);
        store.update(|m| m.end_time = Some(now - Duration::hours(24))).unwrap();

        let (alerts, _) = run(&config, now);
        assert_eq!(alerts.level(), Severity::Critical);
        assert!(alerts.alerts()[0].message.contains("26h old"));
    }

    #[test]
    fn test_failed_latest_is_warning() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let now = Utc::now();
        write_session(&config.sessions_dir(), now - Duration::hours(1), SessionState::Finalized, 2);

        let (alerts, _) = run(&config, now);
        assert_eq!(alerts.level(), Severity::Warning);
        assert!(alerts.alerts()[0].message.contains("2 error(s)"));
    }

    #[test]
    fn test_newer_failed_run_is_critical() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let now = Utc::now();
        let (good, _) = write_session(&config.sessions_dir(), now - Duration::hours(3), SessionState::Finalized, 0);
        let (failed, _) = write_session(&config.sessions_dir(), now - Duration::hours(1), SessionState::Failed, 1);

        let (alerts, latest) = run(&config, now);
        assert_eq!(alerts.level(), Severity::Critical);
        assert!(alerts.alerts()[0].message.contains(&failed.to_string()));
        assert!(alerts.alerts()[0].message.contains("failed"));
        // artifact checks still look at the last usable session
        assert_eq!(latest.unwrap().id, good.to_string());
    }

    #[test]
    fn test_aborted_run_is_critical() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let now = Utc::now();
        write_session(&config.sessions_dir(), now - Duration::hours(3), SessionState::Finalized, 0);
        write_session(&config.sessions_dir(), now - Duration::minutes(1), SessionState::Initializing, 1);

        let (alerts, _) = run(&config, now);
        assert_eq!(alerts.level(), Severity::Critical);
        assert!(alerts.alerts()[0].message.contains("aborted in state Initializing"));
    }

    #[test]
    fn test_stuck_run_is_warning() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let now = Utc::now();
        write_session(&config.sessions_dir(), now - Duration::hours(20), SessionState::Finalized, 0);
        write_session(&config.sessions_dir(), now - Duration::hours(13), SessionState::Uploading, 0);

        let (alerts, latest) = run(&config, now);
        assert_eq!(alerts.level(), Severity::Warning);
        assert!(alerts.alerts()[0].message.contains("stuck in state Uploading"));
        assert!(latest.is_some());
    }

    #[test]
    fn test_only_failed_runs_is_critical() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let now = Utc::now();
        write_session(&config.sessions_dir(), now - Duration::hours(1), SessionState::Failed, 1);

        let (alerts, latest) = run(&config, now);
        assert!(latest.is_none());
        assert!(alerts.alerts().iter().any(|a| a.message == "no finalized backups found"));
    }

    #[test]
    fn test_no_sessions_is_critical() {
        let dir = TempDir::new().unwrap();
        let (alerts, latest) = run(&config(&dir), Utc::now());
        assert!(latest.is_none());
        assert_eq!(alerts.level(), Severity::Critical);
    }
}
