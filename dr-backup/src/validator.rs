//! Session validation: manifest consistency, checksums and decrypt probes.
//!
//! Validation never mutates the session it inspects. Plaintext produced by
//! the decrypt probes lives in a scratch directory removed on every path.

use crate::crypto::{verify_checksum, CryptoEngine};
use crate::fs::atomic::write_json_atomic;
use crate::producers::archive::list_archive;
use crate::session::manifest::{load_manifest, ArtifactKind, ManifestStatus};
use crate::session::{latest_session, SessionId, SessionLayout};
use crate::sinks::ArtifactSink;
use crate::utils::errors::{DrError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{info, warn};
use uuid::Uuid;

/// Magic bytes at the start of a `pg_dump -Fc` archive.
const PG_CUSTOM_MAGIC: &[u8] = b"PGDMP";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStatus {
    Passed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub validation_id: Uuid,
    pub session_id: String,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub error_count: usize,
    pub warning_count: usize,
    pub overall_status: ValidationStatus,
    pub timestamp: DateTime<Utc>,
}

impl ValidationReport {
    fn new(session_id: String) -> Self {
        Self {
            validation_id: Uuid::new_v4(),
            session_id,
            errors: Vec::new(),
            warnings: Vec::new(),
            error_count: 0,
            warning_count: 0,
            overall_status: ValidationStatus::Passed,
            timestamp: Utc::now(),
        }
    }

    fn error(&mut self, message: String) {
        warn!("Validation error: {}", message);
        self.errors.push(message);
    }

    fn warning(&mut self, message: String) {
        warn!("Validation warning: {}", message);
        self.warnings.push(message);
    }

    fn finish(mut self) -> Self {
        self.error_count = self.errors.len();
        self.warning_count = self.warnings.len();
        self.overall_status = if self.errors.is_empty() {
            ValidationStatus::Passed
        } else {
            ValidationStatus::Failed
        };
        self
    }

    pub fn passed(&self) -> bool {
        self.overall_status == ValidationStatus::Passed
    }

    /// Persist as `validation_<session>_<ts>.json` under `reports_dir`.
    pub fn write_report(&self, reports_dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(reports_dir)?;
        let path = reports_dir.join(format!(
            "validation_{}_{}.json",
            self.session_id,
            self.timestamp.format("%Y%m%d_%H%M%S")
        ));
        write_json_atomic(&path, self)?;
        Ok(path)
    }
}

#[derive(Clone)]
pub struct Validator {
    crypto: CryptoEngine,
    max_age: chrono::Duration,
}

impl Validator {
    pub fn new(crypto: CryptoEngine, max_age_secs: u64) -> Self {
        Self {
            crypto,
            max_age: chrono::Duration::seconds(
                i64::try_from(max_age_secs).unwrap_or(i64::MAX).min(i64::MAX / 1000),
            ),
        }
    }

    /// Validate one session directory. Blocking: hashes and decrypts every
    /// artifact.
    pub fn validate(&self, session_dir: &Path) -> ValidationReport {
        let dir_name = session_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let layout = SessionLayout::new(session_dir);

        let manifest = match load_manifest(&layout.manifest_path()) {
            Ok(m) => m,
            Err(e) => {
                let mut report = ValidationReport::new(dir_name);
                report.error(format!("manifest unusable: {}", e));
                return report.finish();
            }
        };

        let mut report = ValidationReport::new(manifest.session_id.clone());
        info!(session = %manifest.session_id, artifacts = manifest.artifact_count(), "Validating session");

        if manifest.session_id != dir_name {
            report.warning(format!(
                "manifest session_id {} does not match directory {}",
                manifest.session_id, dir_name
            ));
        }
        if manifest.metadata.status == ManifestStatus::Failed {
            report.warning(format!(
                "session finished with status failed ({} errors)",
                manifest.metadata.errors
            ));
        }
        if manifest.artifact_count() == 0 {
            report.warning("manifest lists no artifacts".to_string());
        }

        let age = Utc::now() - manifest.start_time;
        if age > self.max_age {
            report.warning(format!(
                "backup is {}h old (threshold {}h)",
                age.num_hours(),
                self.max_age.num_hours()
            ));
        }

        let scratch = match tempfile::Builder::new().prefix("dr-validate-").tempdir() {
            Ok(dir) => dir,
            Err(e) => {
                report.error(format!("cannot create scratch directory: {}", e));
                return report.finish();
            }
        };

        for (kind, artifact) in manifest.artifacts() {
            let path = layout.resolve(&artifact.file);
            if !path.is_file() {
                report.error(format!("{}: file {} missing", artifact.name, artifact.file));
                continue;
            }
            if let Err(e) = verify_checksum(&path, &artifact.checksum) {
                report.error(format!("{}: {}", artifact.name, e));
                continue;
            }
            if let Err(e) = self.probe(kind, &path, &scratch) {
                report.error(format!("{}: {}", artifact.name, e));
            }
        }

        let report = report.finish();
        info!(
            session = %report.session_id,
            status = ?report.overall_status,
            errors = report.error_count,
            warnings = report.warning_count,
            "Validation complete"
        );
        report
    }

    /// Decrypt into scratch and check that the plaintext is what it claims to be.
    fn probe(&self, kind: ArtifactKind, enc: &Path, scratch: &TempDir) -> Result<()> {
        let plain = tempfile::Builder::new()
            .prefix("probe-")
            .tempfile_in(scratch.path())?;
        self.crypto.decrypt_file(enc, plain.path())?;

        match kind {
            ArtifactKind::Database => {
                let mut magic = [0u8; 5];
                let read = std::fs::File::open(plain.path())?.read(&mut magic)?;
                if read < magic.len() || &magic[..] != PG_CUSTOM_MAGIC {
                    return Err(DrError::Archive("not a pg_dump custom-format archive".into()));
                }
            }
            ArtifactKind::Filestore | ArtifactKind::Config => {
                list_archive(plain.path())?;
            }
        }
        Ok(())
    }
}

/// Where a session to validate comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum SessionSource {
    Local,
    Cloud,
    #[default]
    Auto,
}

/// A session directory ready for validation. Downloaded sessions live in a
/// scratch directory that is removed when this value is dropped.
#[derive(Debug)]
pub struct ResolvedSession {
    pub dir: PathBuf,
    pub origin: String,
    _download: Option<TempDir>,
}

/// Locate a session by id or path (latest local session when `reference` is
/// `None`), fetching it from the first sink that has it when needed.
pub async fn resolve_session(
    sessions_dir: &Path,
    reference: Option<&str>,
    source: SessionSource,
    sinks: &[Box<dyn ArtifactSink>],
) -> Result<ResolvedSession> {
    let (session_id, local_dir) = match reference {
        Some(r) if r.contains('/') => {
            let path = PathBuf::from(r);
            let id = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .ok_or_else(|| DrError::InvalidSession(r.to_string()))?;
            (id, path)
        }
        Some(id) => (id.to_string(), sessions_dir.join(id)),
        None => {
            let latest = latest_session(sessions_dir)?
                .ok_or_else(|| DrError::InvalidSession("no local sessions found".into()))?;
            (latest.to_string(), sessions_dir.join(latest.to_string()))
        }
    };

    let local = || ResolvedSession {
        dir: local_dir.clone(),
        origin: "local".into(),
        _download: None,
    };

    match source {
        SessionSource::Local if local_dir.is_dir() => Ok(local()),
        SessionSource::Local => Err(DrError::InvalidSession(format!(
            "{} not found locally",
            local_dir.display()
        ))),
        SessionSource::Auto if local_dir.is_dir() => Ok(local()),
        SessionSource::Auto | SessionSource::Cloud => download_session(&session_id, sinks).await,
    }
}

async fn download_session(session_id: &str, sinks: &[Box<dyn ArtifactSink>]) -> Result<ResolvedSession> {
    if SessionId::parse(session_id).is_none() {
        return Err(DrError::InvalidSession(format!("{} is not a session id", session_id)));
    }

    for sink in sinks {
        match sink.list_remote_files(session_id).await {
            Ok(files) if !files.is_empty() => {}
            Ok(_) => continue,
            Err(e) => {
                warn!(sink = sink.name(), error = %e, "Sink unavailable for download");
                continue;
            }
        }

        let scratch = tempfile::Builder::new().prefix("dr-download-").tempdir()?;
        let dir = scratch.path().join(session_id);
        match sink.download(session_id, &dir).await {
            Ok(()) => {
                info!(sink = sink.name(), session = %session_id, "Session downloaded for validation");
                return Ok(ResolvedSession {
                    dir,
                    origin: sink.name().to_string(),
                    _download: Some(scratch),
                });
            }
            Err(e) => warn!(sink = sink.name(), error = %e, "Session download failed"),
        }
    }

    Err(DrError::InvalidSession(format!("{} not found on any sink", session_id)))
}
