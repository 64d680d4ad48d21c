use super::{LatestSession, MonitorContext};
use crate::report::AlertSet;
use dr_backup::crypto::{verify_checksum, CryptoEngine, KeyMaterial};
use dr_backup::session::SessionLayout;
use dr_backup::DrError;

/// Canary restore: checksum and decrypt exactly one artifact of the latest
/// session into scratch.
pub async fn check(ctx: &MonitorContext<'_>, latest: Option<&LatestSession>, alerts: &mut AlertSet) {
    let Some(latest) = latest else {
        return;
    };
    let Some((_, artifact)) = latest.manifest.artifacts().into_iter().next() else {
        return;
    };

    let key_path = ctx.config.encryption_key_path.clone();
    let enc = SessionLayout::new(&latest.dir).resolve(&artifact.file);
    let expected = artifact.checksum.clone();
    let name = artifact.name.clone();

    let result = tokio::task::spawn_blocking(move || -> dr_backup::Result<u64> {
        let crypto = CryptoEngine::new(KeyMaterial::load(&key_path)?);
        verify_checksum(&enc, &expected)?;
        let scratch = tempfile::Builder::new().prefix("dr-canary-").tempdir()?;
        let out = scratch.path().join("canary");
        crypto.decrypt_file(&enc, &out)?;
        Ok(std::fs::metadata(&out)?.len())
    })
    .await
    .map_err(|e| DrError::Decryption(format!("canary task failed: {}", e)))
    .and_then(|r| r);

    match result {
        Ok(bytes) => tracing::info!(artifact = %name, bytes, "Integrity canary passed"),
        Err(e) => alerts.critical(format!("integrity check failed for {} in {}: {}", name, latest.id, e)),
    }
}
