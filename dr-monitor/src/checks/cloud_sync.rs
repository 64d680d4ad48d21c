use super::{LatestSession, MonitorContext};
use crate::report::AlertSet;

/// Count-based parity of the latest session on every configured sink.
pub async fn check(ctx: &MonitorContext<'_>, latest: Option<&LatestSession>, alerts: &mut AlertSet) {
    if ctx.sinks.is_empty() {
        alerts.warning("no destination sinks configured; backups exist on this host only");
        return;
    }
    let Some(latest) = latest else {
        return;
    };

    for sink in ctx.sinks {
        match sink.compare_parity(&latest.dir, &latest.id).await {
            Ok(parity) if parity.matched => {
                tracing::debug!(sink = sink.name(), files = parity.remote_count, "Sink in sync");
            }
            Ok(parity) if parity.remote_count == 0 => alerts.critical(format!(
                "session {} missing on sink {}",
                latest.id,
                sink.name()
            )),
            Ok(parity) => alerts.critical(format!(
                "session {} out of sync on sink {} (local {}, remote {})",
                latest.id,
                sink.name(),
                parity.local_count,
                parity.remote_count
            )),
            Err(e) => alerts.warning(format!("sink {} unreachable: {}", sink.name(), e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checks::testing::ScriptedRunner;
    use async_trait::async_trait;
    use chrono::Utc;
    use dr_backup::notify::Severity;
    use dr_backup::session::manifest::load_manifest;
    use dr_backup::sinks::{ArtifactSink, LocalMirrorSink, RemoteFileInfo};
    use dr_backup::{DrConfig, DrError};
    use std::path::Path;
    use tempfile::TempDir;

    struct DownSink;

    #[async_trait]
    impl ArtifactSink for DownSink {
        fn name(&self) -> &str {
            "gdrive"
        }
        fn remote_path(&self, session_id: &str) -> String {
            format!("gdrive:{}", session_id)
        }
        async fn upload(&self, _: &Path) -> dr_backup::Result<()> {
            Err(DrError::sink("gdrive", "offline"))
        }
        async fn upload_manifest(&self, _: &Path) -> dr_backup::Result<()> {
            Err(DrError::sink("gdrive", "offline"))
        }
        async fn list_remote_files(&self, _: &str) -> dr_backup::Result<Vec<RemoteFileInfo>> {
            Err(DrError::sink("gdrive", "offline"))
        }
        async fn download(&self, _: &str, _: &Path) -> dr_backup::Result<()> {
            Err(DrError::sink("gdrive", "offline"))
        }
    }

    fn latest_session(root: &Path) -> LatestSession {
        let id = "backup_20240101_000000_1".to_string();
        let dir = root.join("sessions").join(&id);
        std::fs::create_dir_all(dir.join("databases")).unwrap();
        std::fs::create_dir_all(dir.join("metadata")).unwrap();
        std::fs::write(dir.join("databases/a.dump.enc"), b"x").unwrap();
        let manifest_json = serde_json::json!({
            "session_id": id,
            "start_time": "2024-01-01T00:00:00Z",
            "end_time": null,
            "hostname": "h",
            "encryption": {"enabled": true, "cipher": "AES-256-GCM", "key_reference": "/k"},
            "metadata": {"errors": 0, "warnings": 0, "status": "success", "retention_days": 7}
        });
        std::fs::write(dir.join("metadata/manifest.json"), manifest_json.to_string()).unwrap();
        let manifest = load_manifest(&dir.join("metadata/manifest.json")).unwrap();
        LatestSession { id, dir, manifest }
    }

    #[tokio::test]
    async fn test_parity_outcomes() {
        let root = TempDir::new().unwrap();
        let latest = latest_session(root.path());
        let mirror = root.path().join("mirror");
        std::fs::create_dir(&mirror).unwrap();

        let synced = LocalMirrorSink::new(mirror.clone());
        synced.upload(&latest.dir).await.unwrap();
        let empty_root = root.path().join("empty-mirror");
        std::fs::create_dir(&empty_root).unwrap();

        let config = DrConfig::default();
        let runner = ScriptedRunner::healthy("");

        let sinks: Vec<Box<dyn ArtifactSink>> = vec![Box::new(synced)];
        let ctx = MonitorContext {
            config: &config,
            runner: &runner,
            sinks: &sinks,
            now: Utc::now(),
        };
        let mut alerts = AlertSet::new();
        check(&ctx, Some(&latest), &mut alerts).await;
        assert!(alerts.is_empty());

        let sinks: Vec<Box<dyn ArtifactSink>> = vec![Box::new(LocalMirrorSink::new(empty_root)), Box::new(DownSink)];
        let ctx = MonitorContext {
            config: &config,
            runner: &runner,
            sinks: &sinks,
            now: Utc::now(),
        };
        let mut alerts = AlertSet::new();
        check(&ctx, Some(&latest), &mut alerts).await;
        assert_eq!(alerts.level(), Severity::Critical);
        assert_eq!(alerts.alerts().len(), 2);
        assert!(alerts.alerts()[0].message.contains("missing on sink local"));
        assert_eq!(alerts.alerts()[1].severity, Severity::Warning);
    }

    #[tokio::test]
    async fn test_no_sinks_is_warning() {
        let config = DrConfig::default();
        let runner = ScriptedRunner::healthy("");
        let ctx = MonitorContext {
            config: &config,
            runner: &runner,
            sinks: &[],
            now: Utc::now(),
        };
        let mut alerts = AlertSet::new();
        check(&ctx, None, &mut alerts).await;
        assert_eq!(alerts.level(), Severity::Warning);
    }
}
