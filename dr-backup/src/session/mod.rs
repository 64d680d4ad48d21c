//! Backup sessions: identifiers, on-disk layout and run state.

pub mod manifest;

use crate::utils::errors::{DrError, Result};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

const SESSION_PREFIX: &str = "backup_";
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// `backup_<YYYYMMDD_HHMMSS>_<pid>`, timestamp in UTC.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId {
    timestamp: DateTime<Utc>,
    pid: u32,
}

impl SessionId {
    pub fn generate(now: DateTime<Utc>, pid: u32) -> Self {
        // the id only has second resolution
        let timestamp = Utc
            .timestamp_opt(now.timestamp(), 0)
            .single()
            .unwrap_or(now);
        Self { timestamp, pid }
    }

    /// Parse a session id; `None` for anything that is not one.
    pub fn parse(s: &str) -> Option<Self> {
        let rest = s.strip_prefix(SESSION_PREFIX)?;
        let (stamp, pid) = rest.rsplit_once('_')?;
        let pid = pid.parse().ok()?;
        let naive = NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).ok()?;
        Some(Self {
            timestamp: naive.and_utc(),
            pid,
        })
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}_{}",
            SESSION_PREFIX,
            self.timestamp.format(TIMESTAMP_FORMAT),
            self.pid
        )
    }
}

impl PartialOrd for SessionId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SessionId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then(self.pid.cmp(&other.pid))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Initializing,
    ProducingArtifacts,
    Validating,
    Uploading,
    RetiringOld,
    Finalized,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Finalized | SessionState::Failed)
    }
}

/// Directory skeleton of one session.
#[derive(Debug, Clone)]
pub struct SessionLayout {
    root: PathBuf,
}

impl SessionLayout {
    pub const DATABASES: &'static str = "databases";
    pub const FILESTORE: &'static str = "filestore";
    pub const CONFIGS: &'static str = "configs";
    pub const METADATA: &'static str = "metadata";
    pub const MANIFEST_FILE: &'static str = "manifest.json";

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn for_session(sessions_dir: &Path, id: &SessionId) -> Self {
        Self::new(sessions_dir.join(id.to_string()))
    }

    pub fn create(&self) -> Result<()> {
        for sub in [Self::DATABASES, Self::FILESTORE, Self::CONFIGS, Self::METADATA] {
            std::fs::create_dir_all(self.root.join(sub))?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn databases_dir(&self) -> PathBuf {
        self.root.join(Self::DATABASES)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(Self::METADATA).join(Self::MANIFEST_FILE)
    }

    /// Manifest path relative to the session root (as shipped to sinks).
    pub fn manifest_relative() -> PathBuf {
        Path::new(Self::METADATA).join(Self::MANIFEST_FILE)
    }

    /// Path of an artifact recorded in the manifest.
    pub fn resolve(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }
}

/// Run-time state of the session owned by the orchestrator.
#[derive(Debug, Clone)]
pub struct BackupSession {
    pub id: SessionId,
    pub state: SessionState,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub error_count: u32,
    pub warning_count: u32,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl BackupSession {
    pub fn new(id: SessionId, start_time: DateTime<Utc>) -> Self {
        Self {
            id,
            state: SessionState::Initializing,
            start_time,
            end_time: None,
            error_count: 0,
            warning_count: 0,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!(session_id = %self.id, "{}", message);
        self.error_count += 1;
        self.errors.push(message);
    }

    pub fn record_warning(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(session_id = %self.id, "{}", message);
        self.warning_count += 1;
        self.warnings.push(message);
    }

    /// Move to `next`. Sessions are read-only once terminal.
    pub fn transition(&mut self, next: SessionState) -> Result<()> {
        if self.state.is_terminal() {
            return Err(DrError::InvalidSession(format!(
                "session {} is already {:?}",
                self.id, self.state
            )));
        }
        tracing::debug!(session_id = %self.id, from = ?self.state, to = ?next, "Session state change");
        self.state = next;
        if next.is_terminal() {
            self.end_time = Some(Utc::now());
        }
        Ok(())
    }
}

/// Session ids found under `sessions_dir`, oldest first.
pub fn list_sessions(sessions_dir: &Path) -> Result<Vec<SessionId>> {
    let mut ids: Vec<SessionId> = match std::fs::read_dir(sessions_dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|e| SessionId::parse(&e.file_name().to_string_lossy()))
            .collect(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e.into()),
    };
    ids.sort();
    Ok(ids)
}

/// Newest session id under `sessions_dir`.
pub fn latest_session(sessions_dir: &Path) -> Result<Option<SessionId>> {
    Ok(list_sessions(sessions_dir)?.pop())
}
