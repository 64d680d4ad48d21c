//! Session manifest and its transactional store.
//!
//! The manifest is the authoritative JSON descriptor of a session, stored as
//! `metadata/manifest.json` inside the session directory. Every mutation is a
//! read-modify-write of the whole document followed by an atomic rename, so
//! the file on disk is always valid JSON.

use super::{BackupSession, SessionState};
use crate::fs::atomic::write_json_atomic;
use crate::utils::errors::{DrError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub session_id: String,
    #[serde(default = "default_backup_type")]
    pub backup_type: String,
    #[serde(default = "default_state")]
    pub state: SessionState,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub hostname: String,
    pub encryption: EncryptionInfo,
    #[serde(default)]
    pub databases: Vec<Artifact>,
    #[serde(default, with = "empty_object")]
    pub filestore: Option<Artifact>,
    #[serde(default)]
    pub configurations: Vec<Artifact>,
    #[serde(default)]
    pub cloud: BTreeMap<String, CloudStatus>,
    pub metadata: ManifestMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionInfo {
    pub enabled: bool,
    pub cipher: String,
    /// Path or identifier of the key; never the key itself
    pub key_reference: String,
}

/// One encrypted, checksummed output file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    /// Path relative to the session directory
    pub file: String,
    /// Size in bytes after encryption
    pub size: u64,
    /// Hex SHA-256 of the encrypted file
    pub checksum: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Database,
    Filestore,
    Config,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudStatus {
    pub uploaded: bool,
    pub path: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestStatus {
    Pending,
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub errors: u32,
    pub warnings: u32,
    pub status: ManifestStatus,
    pub retention_days: u32,
}

fn default_backup_type() -> String {
    "full".to_string()
}

fn default_state() -> SessionState {
    SessionState::Initializing
}

impl Manifest {
    pub fn new(
        session: &BackupSession,
        hostname: impl Into<String>,
        encryption: EncryptionInfo,
        retention_days: u32,
    ) -> Self {
        Self {
            session_id: session.id.to_string(),
            backup_type: default_backup_type(),
            state: session.state,
            start_time: session.start_time,
            end_time: session.end_time,
            hostname: hostname.into(),
            encryption,
            databases: Vec::new(),
            filestore: None,
            configurations: Vec::new(),
            cloud: BTreeMap::new(),
            metadata: ManifestMetadata {
                errors: session.error_count,
                warnings: session.warning_count,
                status: ManifestStatus::Pending,
                retention_days,
            },
        }
    }

    /// All artifacts with their kind: databases, filestore, configurations.
    pub fn artifacts(&self) -> Vec<(ArtifactKind, &Artifact)> {
        let mut all: Vec<(ArtifactKind, &Artifact)> = self
            .databases
            .iter()
            .map(|a| (ArtifactKind::Database, a))
            .collect();
        if let Some(fs) = &self.filestore {
            all.push((ArtifactKind::Filestore, fs));
        }
        all.extend(self.configurations.iter().map(|a| (ArtifactKind::Config, a)));
        all
    }

    pub fn artifact_count(&self) -> usize {
        self.databases.len() + usize::from(self.filestore.is_some()) + self.configurations.len()
    }

    /// Mirror the session's state and counters into the manifest.
    pub fn sync_from(&mut self, session: &BackupSession) {
        self.state = session.state;
        self.end_time = session.end_time;
        self.metadata.errors = session.error_count;
        self.metadata.warnings = session.warning_count;
    }
}

/// Read-modify-write access to one manifest file.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    path: PathBuf,
}

impl ManifestStore {
    /// Write the initial manifest.
    pub fn create(path: impl Into<PathBuf>, manifest: &Manifest) -> Result<Self> {
        let store = Self { path: path.into() };
        write_json_atomic(&store.path, manifest)?;
        Ok(store)
    }

    pub fn load(&self) -> Result<Manifest> {
        load_manifest(&self.path)
    }

    /// Apply `f` to the on-disk manifest and atomically replace it.
    pub fn update<F>(&self, f: F) -> Result<Manifest>
    where
        F: FnOnce(&mut Manifest),
    {
        let mut manifest = self.load()?;
        f(&mut manifest);
        write_json_atomic(&self.path, &manifest)?;
        Ok(manifest)
    }

    pub fn append_database(&self, artifact: Artifact) -> Result<Manifest> {
        self.update(|m| m.databases.push(artifact))
    }

    pub fn set_filestore(&self, artifact: Artifact) -> Result<Manifest> {
        self.update(|m| m.filestore = Some(artifact))
    }

    pub fn append_configuration(&self, artifact: Artifact) -> Result<Manifest> {
        self.update(|m| m.configurations.push(artifact))
    }

    pub fn set_cloud_status(&self, sink: &str, status: CloudStatus) -> Result<Manifest> {
        self.update(|m| {
            m.cloud.insert(sink.to_string(), status);
        })
    }

    pub fn sync_session(&self, session: &BackupSession) -> Result<Manifest> {
        self.update(|m| m.sync_from(session))
    }

    /// Record the final outcome: status is `success` iff there were no errors.
    pub fn finalize(&self, session: &BackupSession) -> Result<Manifest> {
        self.update(|m| {
            m.sync_from(session);
            m.metadata.status = if session.error_count == 0 {
                ManifestStatus::Success
            } else {
                ManifestStatus::Failed
            };
        })
    }

    /// Record a run that stopped short of finalizing.
    pub fn fail(&self, session: &BackupSession) -> Result<Manifest> {
        self.update(|m| {
            m.sync_from(session);
            m.metadata.status = ManifestStatus::Failed;
        })
    }
}

/// Load and parse a manifest file.
pub fn load_manifest(path: &Path) -> Result<Manifest> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            DrError::Manifest(format!("manifest not found: {}", path.display()))
        } else {
            DrError::Io(e)
        }
    })?;
    serde_json::from_str(&content)
        .map_err(|e| DrError::Manifest(format!("invalid manifest {}: {}", path.display(), e)))
}

/// Serializes `None` as `{}` and reads `{}` back as `None`.
mod empty_object {
    use serde::de::DeserializeOwned;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_json::Value;

    pub fn serialize<T: Serialize, S: Serializer>(
        value: &Option<T>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => v.serialize(serializer),
            None => serde_json::Map::new().serialize(serializer),
        }
    }

    pub fn deserialize<'de, T: DeserializeOwned, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<T>, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Null => Ok(None),
            Value::Object(map) if map.is_empty() => Ok(None),
            other => serde_json::from_value(other)
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{SessionId, SessionLayout};
    use tempfile::TempDir;

    fn sample(dir: &Path) -> (ManifestStore, BackupSession) {
        let session = BackupSession::new(SessionId::generate(Utc::now(), 77), Utc::now());
        let layout = SessionLayout::for_session(dir, &session.id);
        layout.create().unwrap();
        let manifest = Manifest::new(
            &session,
            "dr-host",
            EncryptionInfo {
                enabled: true,
                cipher: "AES-256-GCM".into(),
                key_reference: "/etc/dr-backup/backup.key".into(),
            },
            7,
        );
        (ManifestStore::create(layout.manifest_path(), &manifest).unwrap(), session)
    }

    fn artifact(name: &str) -> Artifact {
        Artifact {
            name: name.into(),
            file: format!("databases/{}.dump.enc", name),
            size: 10,
            checksum: "ab".into(),
        }
    }

    #[test]
    fn test_initial_manifest_shape() {
        let dir = TempDir::new().unwrap();
        let (store, _) = sample(dir.path());
        let json: Value = serde_json::from_str(&std::fs::read_to_string(&store.path).unwrap()).unwrap();

        assert_eq!(json["backup_type"], "full");
        assert_eq!(json["state"], "Initializing");
        assert_eq!(json["filestore"], serde_json::json!({}));
        assert!(json["end_time"].is_null());
        assert_eq!(json["metadata"]["status"], "pending");
        assert_eq!(json["encryption"]["key_reference"], "/etc/dr-backup/backup.key");
    }

    #[test]
    fn test_append_versus_overwrite() {
        let dir = TempDir::new().unwrap();
        let (store, _) = sample(dir.path());

        store.append_database(artifact("tenant_a")).unwrap();
        store.append_database(artifact("tenant_b")).unwrap();
        store.set_filestore(artifact("filestore")).unwrap();
        let mut second = artifact("filestore");
        second.size = 99;
        store.set_filestore(second).unwrap();

        let manifest = store.load().unwrap();
        assert_eq!(manifest.databases.len(), 2);
        assert_eq!(manifest.databases[0].name, "tenant_a");
        assert_eq!(manifest.filestore.as_ref().unwrap().size, 99);
        assert_eq!(manifest.artifact_count(), 3);
    }

    #[test]
    fn test_finalize_status_follows_error_count() {
        let dir = TempDir::new().unwrap();
        let (store, mut session) = sample(dir.path());

        session.record_warning("filestore missing");
        session.transition(SessionState::Finalized).unwrap();
        let manifest = store.finalize(&session).unwrap();
        assert_eq!(manifest.metadata.status, ManifestStatus::Success);
        assert_eq!(manifest.metadata.warnings, 1);
        assert!(manifest.end_time.is_some());

        let (store, mut session) = sample(&dir.path().join("other"));
        session.record_error("dump failed");
        session.transition(SessionState::Finalized).unwrap();
        assert_eq!(store.finalize(&session).unwrap().metadata.status, ManifestStatus::Failed);
    }

    #[test]
    fn test_cloud_status_extra_fields_flatten() {
        let dir = TempDir::new().unwrap();
        let (store, _) = sample(dir.path());
        let mut extra = BTreeMap::new();
        extra.insert("retention_days".to_string(), serde_json::json!(30));
        store
            .set_cloud_status(
                "s3",
                CloudStatus {
                    uploaded: true,
                    path: "s3://bucket/x".into(),
                    extra,
                },
            )
            .unwrap();

        let json: Value = serde_json::from_str(&std::fs::read_to_string(&store.path).unwrap()).unwrap();
        assert_eq!(json["cloud"]["s3"]["uploaded"], true);
        assert_eq!(json["cloud"]["s3"]["retention_days"], 30);
        assert_eq!(store.load().unwrap().cloud["s3"].extra["retention_days"], 30);
    }

    #[test]
    fn test_load_errors() {
        let dir = TempDir::new().unwrap();
        let missing = load_manifest(&dir.path().join("manifest.json")).unwrap_err();
        assert!(matches!(missing, DrError::Manifest(_)));

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, b"{\"session_id\": ").unwrap();
        assert!(matches!(load_manifest(&bad), Err(DrError::Manifest(_))));
    }
}
