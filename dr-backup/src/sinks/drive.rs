//! Drive-style cloud folder via `rclone`.

use super::{ArtifactSink, RemoteFileInfo};
use crate::session::SessionLayout;
use crate::tools::{run_checked, CommandRunner, ToolCommand};
use crate::utils::errors::{DrError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// rclone exit status for "directory not found".
const RCLONE_DIR_NOT_FOUND: i32 = 3;

pub struct DriveSink {
    remote: String,
    folder: String,
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LsJsonEntry {
    path: String,
    #[serde(default)]
    size: Option<i64>,
    #[serde(default)]
    is_dir: bool,
}

impl DriveSink {
    pub fn new(remote: String, folder: String, runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self {
            remote: remote.trim_end_matches(':').to_string(),
            folder: folder.trim_matches('/').to_string(),
            runner,
            timeout,
        }
    }

    fn target(&self, session_id: &str) -> String {
        if self.folder.is_empty() {
            format!("{}:{}", self.remote, session_id)
        } else {
            format!("{}:{}/{}", self.remote, self.folder, session_id)
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let cmd = ToolCommand::new("rclone", self.timeout).args(args.iter().copied());
        run_checked(self.runner.as_ref(), &cmd)
            .await
            .map(|o| o.stdout)
            .map_err(|e| DrError::sink(self.name(), e.to_string()))
    }
}

fn parse_lsjson(stdout: &str) -> Result<Vec<RemoteFileInfo>> {
    let entries: Vec<LsJsonEntry> = serde_json::from_str(stdout)?;
    Ok(entries
        .into_iter()
        .filter(|e| !e.is_dir)
        .map(|e| RemoteFileInfo {
            path: e.path,
            size: e.size.and_then(|s| u64::try_from(s).ok()),
        })
        .collect())
}

#[async_trait]
impl ArtifactSink for DriveSink {
    fn name(&self) -> &str {
        "gdrive"
    }

    fn remote_path(&self, session_id: &str) -> String {
        self.target(session_id)
    }

    async fn upload(&self, session_dir: &Path) -> Result<()> {
        let session_id = session_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| DrError::InvalidSession(session_dir.display().to_string()))?;
        let local = session_dir.to_string_lossy().to_string();
        let target = self.target(&session_id);
        self.run(&[
            "copy",
            local.as_str(),
            target.as_str(),
            "--include",
            "**.enc",
            "--include",
            "/metadata/manifest.json",
        ])
        .await?;
        info!(sink = self.name(), target = %target, "Session uploaded");
        Ok(())
    }

    async fn upload_manifest(&self, session_dir: &Path) -> Result<()> {
        let session_id = session_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| DrError::InvalidSession(session_dir.display().to_string()))?;
        let rel = SessionLayout::manifest_relative().to_string_lossy().to_string();
        let local = session_dir.join(&rel).to_string_lossy().to_string();
        let target = format!("{}/{}", self.target(&session_id), rel);
        self.run(&["copyto", local.as_str(), target.as_str()]).await?;
        Ok(())
    }

    async fn list_remote_files(&self, session_id: &str) -> Result<Vec<RemoteFileInfo>> {
        let target = self.target(session_id);
        let cmd = ToolCommand::new("rclone", self.timeout).args(["lsjson", "-R", "--files-only", target.as_str()]);
        let output = self
            .runner
            .run(&cmd)
            .await
            .map_err(|e| DrError::sink(self.name(), e.to_string()))?;

        if output.code == Some(RCLONE_DIR_NOT_FOUND) {
            return Ok(Vec::new());
        }
        if !output.success() {
            return Err(DrError::sink(
                self.name(),
                format!("rclone lsjson exited with {:?}: {}", output.code, output.stderr.trim()),
            ));
        }
        parse_lsjson(&output.stdout).map_err(|e| DrError::sink(self.name(), e.to_string()))
    }

    async fn download(&self, session_id: &str, dest: &Path) -> Result<()> {
        std::fs::create_dir_all(dest)?;
        let target = self.target(session_id);
        let local = dest.to_string_lossy().to_string();
        self.run(&["copy", target.as_str(), local.as_str()]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::fake::FakeRunner;
    use crate::tools::ToolOutput;

    fn sink(runner: FakeRunner) -> DriveSink {
        DriveSink::new("gdrive:".into(), "dr-backups".into(), Arc::new(runner), Duration::from_secs(30))
    }

    #[test]
    fn test_parse_lsjson() {
        let stdout = r#"[
            {"Path":"databases/a.dump.enc","Name":"a.dump.enc","Size":1024,"MimeType":"application/octet-stream","ModTime":"2024-01-01T00:00:10Z","IsDir":false},
            {"Path":"metadata","Name":"metadata","Size":-1,"IsDir":true},
            {"Path":"metadata/manifest.json","Name":"manifest.json","Size":300,"IsDir":false}
        ]"#;
        let files = parse_lsjson(stdout).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].path, "databases/a.dump.enc");
        assert_eq!(files[0].size, Some(1024));
    }

    #[tokio::test]
    async fn test_upload_targets_session_folder() {
        let runner = FakeRunner::new(|_| Ok(ToolOutput::ok("")));
        let drive = sink(runner.clone());
        drive
            .upload(Path::new("/var/backups/dr/sessions/backup_20240101_000000_1"))
            .await
            .unwrap();
        drive
            .upload_manifest(Path::new("/var/backups/dr/sessions/backup_20240101_000000_1"))
            .await
            .unwrap();

        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls[0].args[0], "copy");
        assert_eq!(calls[0].args[2], "gdrive:dr-backups/backup_20240101_000000_1");
        assert_eq!(calls[1].args[0], "copyto");
        assert_eq!(
            calls[1].args[2],
            "gdrive:dr-backups/backup_20240101_000000_1/metadata/manifest.json"
        );
    }

    #[tokio::test]
    async fn test_missing_remote_folder_lists_empty() {
        let drive = sink(FakeRunner::new(|_| {
            Ok(ToolOutput::failed(RCLONE_DIR_NOT_FOUND, "directory not found"))
        }));
        assert!(drive.list_remote_files("backup_20240101_000000_1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_rclone_is_sink_error() {
        let drive = sink(FakeRunner::new(|_| Ok(ToolOutput::ok(""))).with_missing(&["rclone"]));
        let err = drive.upload(Path::new("/tmp/backup_20240101_000000_1")).await.unwrap_err();
        assert!(matches!(err, DrError::Sink { .. }));
        assert!(!err.is_fatal());
    }
}
