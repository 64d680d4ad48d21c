//! Destination sinks: pluggable upload targets for finished sessions.
//!
//! A sink ships only encrypted artifacts (`*.enc`) and the session manifest;
//! scratch files and anything else in the session directory stay local.

pub mod drive;
pub mod local;
pub mod object_store;

use crate::config::DrConfig;
use crate::fs::walker::{walk_directory, WalkOptions};
use crate::session::SessionLayout;
use crate::tools::CommandRunner;
use crate::utils::errors::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

pub use drive::DriveSink;
pub use local::LocalMirrorSink;
pub use object_store::ObjectStoreSink;

/// One file as seen on the remote side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteFileInfo {
    /// Path relative to the remote session folder
    pub path: String,
    pub size: Option<u64>,
}

/// Result of a count-based local/remote comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParityReport {
    pub matched: bool,
    pub local_count: usize,
    pub remote_count: usize,
}

#[async_trait]
pub trait ArtifactSink: Send + Sync {
    fn name(&self) -> &str;

    /// Human-readable location of a session on this sink.
    fn remote_path(&self, session_id: &str) -> String;

    /// Ship all artifacts and the manifest of `session_dir`.
    async fn upload(&self, session_dir: &Path) -> Result<()>;

    /// Re-ship only the manifest (after finalization).
    async fn upload_manifest(&self, session_dir: &Path) -> Result<()>;

    async fn list_remote_files(&self, session_id: &str) -> Result<Vec<RemoteFileInfo>>;

    /// Fetch a session into `dest` (which becomes the session root).
    async fn download(&self, session_id: &str, dest: &Path) -> Result<()>;

    /// Coarse drift detector: per-extension-class file counts must agree.
    async fn compare_parity(&self, session_dir: &Path, session_id: &str) -> Result<ParityReport> {
        let local = class_counts(shippable_files(session_dir)?.iter().map(|(_, rel)| rel.as_str()));
        let remote_files = self.list_remote_files(session_id).await?;
        let remote = class_counts(remote_files.iter().map(|f| f.path.as_str()));

        let local_count = local.values().sum();
        let remote_count = remote.values().sum();
        Ok(ParityReport {
            matched: remote_count > 0 && local == remote,
            local_count,
            remote_count,
        })
    }
}

/// Extension class used by parity: artifacts and manifests.
fn parity_class(path: &str) -> Option<&'static str> {
    if path.ends_with(".enc") {
        Some("enc")
    } else if path.ends_with(".json") {
        Some("json")
    } else {
        None
    }
}

fn class_counts<'a>(paths: impl Iterator<Item = &'a str>) -> BTreeMap<&'static str, usize> {
    let mut counts = BTreeMap::new();
    for class in paths.filter_map(parity_class) {
        *counts.entry(class).or_insert(0) += 1;
    }
    counts
}

/// Files of a session that may leave the host: `(absolute, relative)` pairs.
pub fn shippable_files(session_dir: &Path) -> Result<Vec<(PathBuf, String)>> {
    let manifest = SessionLayout::manifest_relative();
    let options = WalkOptions::default();

    let files = walk_directory(session_dir, &options)?
        .into_iter()
        .filter(|f| !f.is_dir && !f.is_symlink)
        .filter(|f| {
            let hidden = f
                .relative_path
                .components()
                .any(|c| c.as_os_str().to_string_lossy().starts_with('.'));
            !hidden && (f.extension() == "enc" || f.relative_path == manifest)
        })
        .map(|f| {
            let rel = f
                .relative_path
                .to_string_lossy()
                .replace(std::path::MAIN_SEPARATOR, "/");
            (f.path, rel)
        })
        .collect();

    Ok(files)
}

/// Instantiate the configured sinks. Unknown or incomplete entries are
/// returned as problem descriptions instead of sinks.
pub fn build_sinks(
    config: &DrConfig,
    runner: Arc<dyn CommandRunner>,
) -> (Vec<Box<dyn ArtifactSink>>, Vec<String>) {
    let mut sinks: Vec<Box<dyn ArtifactSink>> = Vec::new();
    let mut problems = Vec::new();

    for name in &config.destinations {
        match name.to_lowercase().as_str() {
            "s3" | "object-store" => match &config.s3_bucket {
                Some(bucket) => sinks.push(Box::new(ObjectStoreSink::new(
                    bucket.clone(),
                    config.s3_prefix.clone(),
                    config.s3_endpoint_url.clone(),
                    config.aws_profile.clone(),
                    runner.clone(),
                    config.upload_timeout(),
                ))),
                None => problems.push(format!("destination '{}' needs s3_bucket", name)),
            },
            "gdrive" | "drive" => sinks.push(Box::new(DriveSink::new(
                config.drive_remote.clone(),
                config.drive_folder.clone(),
                runner.clone(),
                config.upload_timeout(),
            ))),
            "local" => match &config.local_mirror_dir {
                Some(dir) => sinks.push(Box::new(LocalMirrorSink::new(dir.clone()))),
                None => problems.push(format!("destination '{}' needs local_mirror_dir", name)),
            },
            other => problems.push(format!("unknown destination '{}'", other)),
        }
    }

    for problem in &problems {
        warn!("{}", problem);
    }
    (sinks, problems)
}


#[cfg(test)]
mod tests {
    use super::fake::session_dir_with_artifacts;
    use super::*;
    use crate::tools::fake::FakeRunner;
    use crate::tools::ToolOutput;
    use tempfile::TempDir;

    #[test]
    fn test_shippable_files_excludes_plaintext() {
        let root = TempDir::new().unwrap();
        let dir = session_dir_with_artifacts(root.path());
        let rels: Vec<String> = shippable_files(&dir).unwrap().into_iter().map(|(_, r)| r).collect();
        assert_eq!(
            rels,
            vec![
                "databases/a.dump.enc",
                "databases/b.dump.enc",
                "filestore/filestore.tar.zst.enc",
                "metadata/manifest.json",
            ]
        );
    }

    #[test]
    fn test_class_counts() {
        let counts = class_counts(["a.enc", "b.enc", "metadata/manifest.json", "x.txt"].into_iter());
        assert_eq!(counts.get("enc"), Some(&2));
        assert_eq!(counts.get("json"), Some(&1));
        assert_eq!(counts.len(), 2);
    }

    #[test]
    fn test_build_sinks_reports_problems() {
        let config = DrConfig {
            destinations: vec!["s3".into(), "gdrive".into(), "local".into(), "ftp".into()],
            ..Default::default()
        };
        let runner: Arc<dyn CommandRunner> = Arc::new(FakeRunner::new(|_| Ok(ToolOutput::ok(""))));
        let (sinks, problems) = build_sinks(&config, runner);
        assert_eq!(sinks.len(), 1);
        assert_eq!(sinks[0].name(), "gdrive");
        assert_eq!(problems.len(), 3);
    }

    #[tokio::test]
    async fn test_default_parity_against_local_mirror() {
        let root = TempDir::new().unwrap();
        let dir = session_dir_with_artifacts(root.path());
        let mirror_root = root.path().join("mirror");
        std::fs::create_dir(&mirror_root).unwrap();
        let sink = LocalMirrorSink::new(mirror_root.clone());

        let before = sink.compare_parity(&dir, "backup_20240101_000000_1").await.unwrap();
        assert!(!before.matched);
        assert_eq!(before.remote_count, 0);

        sink.upload(&dir).await.unwrap();
        let after = sink.compare_parity(&dir, "backup_20240101_000000_1").await.unwrap();
        assert_eq!(
            after,
            ParityReport {
                matched: true,
                local_count: 4,
                remote_count: 4
            }
        );

        std::fs::remove_file(mirror_root.join("backup_20240101_000000_1/databases/b.dump.enc")).unwrap();
        let drifted = sink.compare_parity(&dir, "backup_20240101_000000_1").await.unwrap();
        assert!(!drifted.matched);
        assert_eq!(drifted.remote_count, 3);
    }
}
