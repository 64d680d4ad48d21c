//! Mounted-directory mirror (NFS share, USB disk, second volume).

use super::{shippable_files, ArtifactSink, RemoteFileInfo};
use crate::fs::walker::{walk_directory, WalkOptions};
use crate::session::SessionLayout;
use crate::utils::errors::{DrError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::info;

pub struct LocalMirrorSink {
    root: PathBuf,
}

impl LocalMirrorSink {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn session_root(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }

    /// The mirror root must already exist; an absent mount point is a failure,
    /// not something to create on the underlying disk.
    fn ensure_mounted(&self) -> Result<()> {
        if self.root.is_dir() {
            Ok(())
        } else {
            Err(DrError::sink(
                self.name(),
                format!("mirror root {} is not available", self.root.display()),
            ))
        }
    }

    fn copy_into(&self, files: Vec<(PathBuf, String)>, session_id: &str) -> Result<u64> {
        let target = self.session_root(session_id);
        let mut bytes = 0;
        for (src, rel) in files {
            let dest = target.join(&rel);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            bytes += std::fs::copy(&src, &dest)?;
        }
        Ok(bytes)
    }
}

fn session_name(session_dir: &Path) -> Result<String> {
    session_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| DrError::InvalidSession(session_dir.display().to_string()))
}

#[async_trait]
impl ArtifactSink for LocalMirrorSink {
    fn name(&self) -> &str {
        "local"
    }

    fn remote_path(&self, session_id: &str) -> String {
        self.session_root(session_id).display().to_string()
    }

    async fn upload(&self, session_dir: &Path) -> Result<()> {
        self.ensure_mounted()?;
        let session_id = session_name(session_dir)?;
        let files = shippable_files(session_dir)?;
        let count = files.len();
        let bytes = self.copy_into(files, &session_id)?;
        info!(sink = self.name(), files = count, bytes, "Session mirrored");
        Ok(())
    }

    async fn upload_manifest(&self, session_dir: &Path) -> Result<()> {
        self.ensure_mounted()?;
        let session_id = session_name(session_dir)?;
        let rel = SessionLayout::manifest_relative().to_string_lossy().to_string();
        self.copy_into(vec![(session_dir.join(&rel), rel)], &session_id)?;
        Ok(())
    }

    async fn list_remote_files(&self, session_id: &str) -> Result<Vec<RemoteFileInfo>> {
        self.ensure_mounted()?;
        let target = self.session_root(session_id);
        if !target.is_dir() {
            return Ok(Vec::new());
        }
        Ok(walk_directory(&target, &WalkOptions::default())?
            .into_iter()
            .filter(|f| !f.is_dir)
            .map(|f| RemoteFileInfo {
                path: f.relative_path.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/"),
                size: Some(f.size),
            })
            .collect())
    }

    async fn download(&self, session_id: &str, dest: &Path) -> Result<()> {
        self.ensure_mounted()?;
        let source = self.session_root(session_id);
        if !source.is_dir() {
            return Err(DrError::sink(
                self.name(),
                format!("session {} not found on mirror", session_id),
            ));
        }
        for file in walk_directory(&source, &WalkOptions::default())? {
            let out = dest.join(&file.relative_path);
            if file.is_dir {
                std::fs::create_dir_all(&out)?;
            } else {
                if let Some(parent) = out.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::copy(&file.path, &out)?;
            }
        }
        Ok(())
    }
}
