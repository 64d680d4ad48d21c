//! S3-compatible object storage via the `aws` CLI.

use super::{ArtifactSink, RemoteFileInfo};
use crate::session::SessionLayout;
use crate::tools::{run_checked, CommandRunner, ToolCommand};
use crate::utils::errors::{DrError, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub struct ObjectStoreSink {
    bucket: String,
    prefix: String,
    endpoint_url: Option<String>,
    profile: Option<String>,
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl ObjectStoreSink {
    pub fn new(
        bucket: String,
        prefix: String,
        endpoint_url: Option<String>,
        profile: Option<String>,
        runner: Arc<dyn CommandRunner>,
        timeout: Duration,
    ) -> Self {
        Self {
            bucket,
            prefix: prefix.trim_matches('/').to_string(),
            endpoint_url,
            profile,
            runner,
            timeout,
        }
    }

    /// Object key prefix of a session, without trailing slash.
    fn key_prefix(&self, session_id: &str) -> String {
        if self.prefix.is_empty() {
            session_id.to_string()
        } else {
            format!("{}/{}", self.prefix, session_id)
        }
    }

    fn url(&self, session_id: &str) -> String {
        format!("s3://{}/{}", self.bucket, self.key_prefix(session_id))
    }

    fn command(&self, args: &[&str]) -> ToolCommand {
        let mut cmd = ToolCommand::new("aws", self.timeout).args(args.iter().copied());
        if let Some(endpoint) = &self.endpoint_url {
            cmd = cmd.args(["--endpoint-url", endpoint.as_str()]);
        }
        if let Some(profile) = &self.profile {
            cmd = cmd.args(["--profile", profile.as_str()]);
        }
        cmd
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let cmd = self.command(args);
        run_checked(self.runner.as_ref(), &cmd)
            .await
            .map(|o| o.stdout)
            .map_err(|e| DrError::sink(self.name(), e.to_string()))
    }
}

/// Parse `aws s3 ls --recursive` lines: `DATE TIME SIZE KEY`.
fn parse_listing(stdout: &str, key_prefix: &str) -> Vec<RemoteFileInfo> {
    let strip = format!("{}/", key_prefix);
    stdout
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let (_date, _time, size) = (parts.next()?, parts.next()?, parts.next()?);
            let key = parts.collect::<Vec<_>>().join(" ");
            if key.is_empty() {
                return None;
            }
            let path = key.strip_prefix(&strip).unwrap_or(&key).to_string();
            Some(RemoteFileInfo {
                path,
                size: size.parse().ok(),
            })
        })
        .collect()
}

#[async_trait]
impl ArtifactSink for ObjectStoreSink {
    fn name(&self) -> &str {
        "s3"
    }

    fn remote_path(&self, session_id: &str) -> String {
        self.url(session_id)
    }

    async fn upload(&self, session_dir: &Path) -> Result<()> {
        let session_id = session_id_of(session_dir)?;
        let local = session_dir.to_string_lossy().to_string();
        let url = self.url(&session_id);
        self.run(&[
            "s3",
            "sync",
            local.as_str(),
            url.as_str(),
            "--exclude",
            "*",
            "--include",
            "*.enc",
            "--include",
            "metadata/manifest.json",
            "--only-show-errors",
        ])
        .await?;
        info!(sink = self.name(), url = %url, "Session uploaded");
        Ok(())
    }

    async fn upload_manifest(&self, session_dir: &Path) -> Result<()> {
        let session_id = session_id_of(session_dir)?;
        let rel = SessionLayout::manifest_relative().to_string_lossy().to_string();
        let local = session_dir.join(&rel).to_string_lossy().to_string();
        let url = format!("{}/{}", self.url(&session_id), rel);
        self.run(&["s3", "cp", local.as_str(), url.as_str(), "--only-show-errors"])
            .await?;
        Ok(())
    }

    async fn list_remote_files(&self, session_id: &str) -> Result<Vec<RemoteFileInfo>> {
        let url = format!("{}/", self.url(session_id));
        let cmd = self.command(&["s3", "ls", url.as_str(), "--recursive"]);
        let output = self
            .runner
            .run(&cmd)
            .await
            .map_err(|e| DrError::sink(self.name(), e.to_string()))?;

        // `aws s3 ls` exits 1 without output when nothing matches the prefix
        if output.code == Some(1) && output.stderr.trim().is_empty() {
            return Ok(Vec::new());
        }
        if !output.success() {
            return Err(DrError::sink(
                self.name(),
                format!("aws s3 ls exited with {:?}: {}", output.code, output.stderr.trim()),
            ));
        }
        Ok(parse_listing(&output.stdout, &self.key_prefix(session_id)))
    }

    async fn download(&self, session_id: &str, dest: &Path) -> Result<()> {
        std::fs::create_dir_all(dest)?;
        let url = self.url(session_id);
        let local = dest.to_string_lossy().to_string();
        self.run(&["s3", "cp", url.as_str(), local.as_str(), "--recursive", "--only-show-errors"])
            .await?;
        Ok(())
    }
}

fn session_id_of(session_dir: &Path) -> Result<String> {
    session_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| DrError::InvalidSession(session_dir.display().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::fake::FakeRunner;
    use crate::tools::ToolOutput;

    const SESSION: &str = "backup_20240101_000000_1";

    fn sink(runner: FakeRunner) -> ObjectStoreSink {
        ObjectStoreSink::new(
            "dr-bucket".into(),
            "/dr-backups/".into(),
            Some("https://minio.internal:9000".into()),
            None,
            Arc::new(runner),
            Duration::from_secs(30),
        )
    }

    #[test]
    fn test_parse_listing_strips_session_prefix() {
        let stdout = "2024-01-01 00:00:10       1234 dr-backups/backup_20240101_000000_1/databases/a.dump.enc\n\
                      2024-01-01 00:00:11        512 dr-backups/backup_20240101_000000_1/metadata/manifest.json\n\
                      \n";
        let files = parse_listing(stdout, "dr-backups/backup_20240101_000000_1");
        assert_eq!(
            files,
            vec![
                RemoteFileInfo {
                    path: "databases/a.dump.enc".into(),
                    size: Some(1234)
                },
                RemoteFileInfo {
                    path: "metadata/manifest.json".into(),
                    size: Some(512)
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_upload_filters_to_artifacts() {
        let runner = FakeRunner::new(|_| Ok(ToolOutput::ok("")));
        let s3 = sink(runner.clone());
        s3.upload(Path::new("/var/backups/dr/sessions").join(SESSION).as_path())
            .await
            .unwrap();

        let calls = runner.calls.lock().unwrap();
        let args = &calls[0].args;
        assert_eq!(calls[0].program, "aws");
        assert_eq!(args[1], "sync");
        assert_eq!(args[3], "s3://dr-bucket/dr-backups/backup_20240101_000000_1");
        assert_eq!(calls[0].arg_after("--exclude"), Some("*"));
        assert!(args.contains(&"*.enc".to_string()));
        assert_eq!(calls[0].arg_after("--endpoint-url"), Some("https://minio.internal:9000"));
    }

    #[tokio::test]
    async fn test_empty_listing_is_not_an_error() {
        let s3 = sink(FakeRunner::new(|_| Ok(ToolOutput::failed(1, ""))));
        assert!(s3.list_remote_files(SESSION).await.unwrap().is_empty());

        let s3 = sink(FakeRunner::new(|_| Ok(ToolOutput::failed(255, "AccessDenied"))));
        let err = s3.list_remote_files(SESSION).await.unwrap_err();
        assert!(err.to_string().contains("AccessDenied"));
    }

    #[tokio::test]
    async fn test_failed_upload_is_sink_error() {
        let s3 = sink(FakeRunner::new(|_| Ok(ToolOutput::failed(1, "Could not connect"))));
        let err = s3.upload(&Path::new("/tmp").join(SESSION)).await.unwrap_err();
        assert!(matches!(err, DrError::Sink { ref sink, .. } if sink == "s3"));
    }
}
