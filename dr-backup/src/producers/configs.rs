//! Configuration file archives.

use super::archive::create_archive;
use super::ProducerContext;
use crate::session::manifest::Artifact;
use crate::session::{BackupSession, SessionLayout};
use crate::utils::errors::{DrError, Result};
use std::path::Path;
use tracing::info;

/// Archive and encrypt each path independently.
///
/// A missing path is recorded as a warning, a failing one as an error; both
/// are skipped and the remaining paths are still processed.
pub async fn backup_configs(
    ctx: &ProducerContext<'_>,
    paths: &[impl AsRef<Path>],
    session: &mut BackupSession,
) -> Vec<Artifact> {
    let mut artifacts = Vec::new();

    for path in paths {
        let path = path.as_ref();
        if !path.exists() {
            session.record_warning(format!("config path not found, skipped: {}", path.display()));
            continue;
        }

        match backup_config(ctx, path).await {
            Ok(artifact) => artifacts.push(artifact),
            Err(e) => session.record_error(format!("config backup failed for {}: {}", path.display(), e)),
        }
    }

    artifacts
}

async fn backup_config(ctx: &ProducerContext<'_>, path: &Path) -> Result<Artifact> {
    let name = path.to_string_lossy();
    let relative = ctx.artifact_relative(SessionLayout::CONFIGS, &name, ".tar.zst.enc");
    let scratch = ctx.scratch()?;
    let archive_path = scratch.path().join("config.tar.zst");

    {
        let source = path.to_path_buf();
        let out = archive_path.clone();
        let level = ctx.compression_level;
        tokio::task::spawn_blocking(move || create_archive(&source, &out, level))
            .await
            .map_err(|e| DrError::Archive(format!("archive task failed: {}", e)))??;
    }

    let artifact = ctx.seal(&name, &archive_path, &relative).await?;
    drop(scratch);

    ctx.store.append_configuration(artifact.clone())?;
    info!(path = %path.display(), size = artifact.size, "Config artifact recorded");
    Ok(artifact)
}
