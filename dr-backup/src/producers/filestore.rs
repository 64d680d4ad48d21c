//! Filestore archive artifact.

use super::archive::create_archive;
use super::ProducerContext;
use crate::session::manifest::Artifact;
use crate::session::SessionLayout;
use crate::utils::errors::{DrError, Result};
use std::path::Path;
use tracing::info;

pub const FILESTORE_ARTIFACT: &str = "filestore";

/// Archive and encrypt the whole filestore tree.
///
/// Returns `Ok(None)` when the source directory does not exist; the filestore
/// is optional infrastructure and its absence is only a warning.
pub async fn backup_filestore(ctx: &ProducerContext<'_>, source: &Path) -> Result<Option<Artifact>> {
    if !source.is_dir() {
        return Ok(None);
    }

    let scratch = ctx.scratch()?;
    let archive_path = scratch.path().join("filestore.tar.zst");

    let entries = {
        let source = source.to_path_buf();
        let out = archive_path.clone();
        let level = ctx.compression_level;
        tokio::task::spawn_blocking(move || create_archive(&source, &out, level))
            .await
            .map_err(|e| DrError::Archive(format!("archive task failed: {}", e)))??
    };

    let relative = format!("{}/filestore.tar.zst.enc", SessionLayout::FILESTORE);
    let artifact = ctx.seal(FILESTORE_ARTIFACT, &archive_path, &relative).await?;
    drop(scratch);

    ctx.store.set_filestore(artifact.clone())?;
    info!(entries, size = artifact.size, source = %source.display(), "Filestore artifact recorded");
    Ok(Some(artifact))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::producers::archive::list_archive;
    use crate::producers::testing::{pg_dump_runner, Fixture};

    #[tokio::test]
    async fn test_missing_source_is_noop() {
        let fixture = Fixture::new();
        let runner = pg_dump_runner();
        let ctx = fixture.context(&runner);

        let result = backup_filestore(&ctx, &fixture.dir.path().join("no-such-filestore")).await.unwrap();
        assert!(result.is_none());
        assert!(fixture.store.load().unwrap().filestore.is_none());
    }

    #[tokio::test]
    async fn test_filestore_overwrites_single_entry() {
        let fixture = Fixture::new();
        let runner = pg_dump_runner();
        let ctx = fixture.context(&runner);

        let source = fixture.dir.path().join("filestore-src");
        std::fs::create_dir_all(source.join("tenant_a")).unwrap();
        std::fs::write(source.join("tenant_a/attachment.bin"), vec![3u8; 2048]).unwrap();

        let first = backup_filestore(&ctx, &source).await.unwrap().unwrap();
        let second = backup_filestore(&ctx, &source).await.unwrap().unwrap();
        assert_ne!(first.checksum, second.checksum);

        let manifest = fixture.store.load().unwrap();
        assert_eq!(manifest.filestore, Some(second.clone()));
        assert!(fixture.stray_entries().is_empty());

        let plain = fixture.dir.path().join("restored.tar.zst");
        fixture.crypto.decrypt_file(&fixture.layout.resolve(&second.file), &plain).unwrap();
        assert_eq!(list_archive(&plain).unwrap(), 3);
    }
}
