//! One backup run, from session allocation to notification.
//!
//! Steps run strictly in sequence. A missing prerequisite aborts before any
//! artifact work; every later failure is counted against the session and the
//! run carries on with the next unit.

use crate::config::DrConfig;
use crate::crypto::{CryptoEngine, KeyMaterial, CIPHER_NAME};
use crate::notify::{Notification, Notifier, Severity};
use crate::producers::{
    backup_configs, backup_database, backup_filestore, discover_databases, DatabaseTarget,
    ProducerContext,
};
use crate::retention::reap;
use crate::session::manifest::{CloudStatus, EncryptionInfo, Manifest, ManifestStore};
use crate::session::{BackupSession, SessionId, SessionLayout, SessionState};
use crate::sinks::{build_sinks, ArtifactSink};
use crate::tools::CommandRunner;
use crate::utils::errors::{DrError, Result};
use crate::validator::Validator;
use chrono::Utc;
use regex::Regex;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

const COMPONENT: &str = "DR Backup";

/// Tools needed when databases are part of the deployment.
const DATABASE_TOOLS: &[&str] = &["pg_dump", "psql"];

#[derive(Debug, Clone, Serialize)]
pub struct BackupOutcome {
    pub session_id: String,
    pub session_dir: PathBuf,
    /// Final manifest; `None` only if it could not be read back (or the
    /// session was discarded after a fatal abort)
    pub manifest: Option<Manifest>,
    pub error_count: u32,
    pub warning_count: u32,
    pub exit_code: i32,
}

pub struct Orchestrator {
    config: DrConfig,
    runner: Arc<dyn CommandRunner>,
    sinks: Vec<Box<dyn ArtifactSink>>,
    sink_problems: Vec<String>,
    notifier: Notifier,
    hostname: String,
}

impl Orchestrator {
    pub fn new(config: DrConfig, runner: Arc<dyn CommandRunner>) -> Self {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let (sinks, sink_problems) = build_sinks(&config, runner.clone());
        let notifier = Notifier::from_config(&config, &hostname, runner.clone());
        Self {
            config,
            runner,
            sinks,
            sink_problems,
            notifier,
            hostname,
        }
    }

    /// Replace the configured sinks.
    pub fn with_sinks(mut self, sinks: Vec<Box<dyn ArtifactSink>>) -> Self {
        self.sinks = sinks;
        self.sink_problems.clear();
        self
    }

    pub async fn run_backup(&self) -> Result<BackupOutcome> {
        let now = Utc::now();
        let mut session = BackupSession::new(SessionId::generate(now, std::process::id()), now);
        let layout = SessionLayout::for_session(&self.config.sessions_dir(), &session.id);

        let store = match self.open_session(&session, &layout) {
            Ok(store) => store,
            Err(e) => {
                error!(session_id = %session.id, error = %e, "Backup session could not be created");
                session.record_error(format!("session could not be created: {}", e));
                self.notify(&session).await;
                return Err(e);
            }
        };
        info!(session_id = %session.id, dir = %layout.root().display(), "Backup session started");

        let crypto = match self.preflight() {
            Ok(crypto) => crypto,
            Err(e) => return Ok(self.abort(session, layout, store, e).await),
        };

        for problem in &self.sink_problems {
            session.record_warning(problem.clone());
        }

        if let Err(e) = self.run_stages(&mut session, &layout, &store, &crypto).await {
            error!(session_id = %session.id, error = %e, "Backup run failed unexpectedly");
            session.record_error(format!("unexpected failure: {}", e));
            if !session.state.is_terminal() {
                let _ = session.transition(SessionState::Failed);
            }
            if let Err(e) = store.fail(&session) {
                error!(error = %e, "Could not record failed state in manifest");
            }
        }

        self.notify(&session).await;
        Ok(self.outcome(&session, &layout, &store))
    }

    /// Session skeleton plus the initial `Initializing` manifest.
    fn open_session(&self, session: &BackupSession, layout: &SessionLayout) -> Result<ManifestStore> {
        layout.create()?;
        let encryption = EncryptionInfo {
            enabled: true,
            cipher: CIPHER_NAME.to_string(),
            key_reference: self.config.encryption_key_path.display().to_string(),
        };
        let manifest = Manifest::new(session, &self.hostname, encryption, self.config.local_retention_days);
        ManifestStore::create(layout.manifest_path(), &manifest)
    }

    /// Key and required tools; any failure here is fatal.
    fn preflight(&self) -> Result<CryptoEngine> {
        let key = KeyMaterial::load(&self.config.encryption_key_path)?;

        if self.config.databases_enabled() {
            for tool in DATABASE_TOOLS {
                if !self.runner.is_available(tool) {
                    return Err(DrError::ToolMissing((*tool).to_string()));
                }
            }
        }
        Ok(CryptoEngine::new(key))
    }

    async fn abort(
        &self,
        mut session: BackupSession,
        layout: SessionLayout,
        store: ManifestStore,
        cause: DrError,
    ) -> BackupOutcome {
        session.record_error(format!("preflight failed: {}", cause));
        // state stays Initializing: nothing was produced
        if let Err(e) = store.sync_session(&session) {
            error!(error = %e, "Could not record preflight failure in manifest");
        }
        self.notify(&session).await;

        let mut outcome = self.outcome(&session, &layout, &store);
        if self.config.discard_on_fatal {
            match std::fs::remove_dir_all(layout.root()) {
                Ok(()) => outcome.manifest = None,
                Err(e) => warn!(error = %e, "Could not discard aborted session"),
            }
        }
        outcome
    }

    async fn run_stages(
        &self,
        session: &mut BackupSession,
        layout: &SessionLayout,
        store: &ManifestStore,
        crypto: &CryptoEngine,
    ) -> Result<()> {
        self.enter(session, store, SessionState::ProducingArtifacts)?;
        self.produce(session, layout, store, crypto).await;
        store.sync_session(session)?;

        if self.config.validate_after_backup {
            self.enter(session, store, SessionState::Validating)?;
            self.validate(session, layout, crypto).await?;
            store.sync_session(session)?;
        }

        self.enter(session, store, SessionState::Uploading)?;
        let shipped = self.upload(session, layout, store).await?;

        self.enter(session, store, SessionState::RetiringOld)?;
        match reap(
            &self.config.sessions_dir(),
            self.config.local_retention_days,
            Utc::now(),
            Some(&session.id),
        ) {
            Ok(summary) if !summary.removed.is_empty() => {
                info!(removed = ?summary.removed, "Expired local sessions removed")
            }
            Ok(_) => {}
            Err(e) => session.record_warning(format!("retention pass failed: {}", e)),
        }

        session.transition(SessionState::Finalized)?;
        let manifest = store.finalize(session)?;
        info!(
            session_id = %session.id,
            status = ?manifest.metadata.status,
            errors = session.error_count,
            warnings = session.warning_count,
            "Session finalized"
        );

        for sink in shipped {
            if let Err(e) = sink.upload_manifest(layout.root()).await {
                warn!(sink = sink.name(), error = %e, "Finalized manifest not re-uploaded");
            }
        }
        Ok(())
    }

    fn enter(&self, session: &mut BackupSession, store: &ManifestStore, next: SessionState) -> Result<()> {
        session.transition(next)?;
        store.sync_session(session)?;
        Ok(())
    }

    async fn produce(
        &self,
        session: &mut BackupSession,
        layout: &SessionLayout,
        store: &ManifestStore,
        crypto: &CryptoEngine,
    ) {
        let ctx = ProducerContext {
            layout,
            crypto,
            store,
            runner: self.runner.as_ref(),
            tool_timeout: self.config.tool_timeout(),
            compression_level: self.config.compression_level,
        };

        if self.config.databases_enabled() {
            self.produce_databases(&ctx, session).await;
        }

        match backup_filestore(&ctx, &self.config.filestore_dir).await {
            Ok(Some(_)) => {}
            Ok(None) => session.record_warning(format!(
                "filestore directory {} not found, skipped",
                self.config.filestore_dir.display()
            )),
            Err(e) => session.record_error(format!("filestore backup failed: {}", e)),
        }

        if !self.config.config_paths.is_empty() {
            let artifacts = backup_configs(&ctx, &self.config.config_paths, session).await;
            info!(count = artifacts.len(), "Config archives produced");
        }
    }

    async fn produce_databases(&self, ctx: &ProducerContext<'_>, session: &mut BackupSession) {
        let target = DatabaseTarget::from_config(&self.config);
        let pattern = match Regex::new(&self.config.db_discovery_pattern) {
            Ok(p) => p,
            Err(e) => {
                session.record_error(format!("invalid discovery pattern: {}", e));
                return;
            }
        };

        let names = match discover_databases(self.runner.as_ref(), &target, &pattern, self.config.probe_timeout()).await {
            Ok(names) => names,
            Err(e) => {
                session.record_error(format!("database discovery failed: {}", e));
                return;
            }
        };
        if names.is_empty() {
            session.record_warning(format!("no databases match pattern {}", pattern));
            return;
        }

        for name in &names {
            if let Err(e) = backup_database(ctx, &target, name).await {
                session.record_error(format!("database backup failed for {}: {}", name, e));
            }
        }
    }

    async fn validate(&self, session: &mut BackupSession, layout: &SessionLayout, crypto: &CryptoEngine) -> Result<()> {
        let validator = Validator::new(crypto.clone(), self.config.backup_age_alert_secs);
        let dir = layout.root().to_path_buf();
        let report = tokio::task::spawn_blocking(move || validator.validate(&dir))
            .await
            .map_err(|e| DrError::InvalidSession(format!("validation task failed: {}", e)))?;

        for message in &report.errors {
            session.record_error(format!("validation: {}", message));
        }
        if let Err(e) = report.write_report(&self.config.reports_dir()) {
            warn!(error = %e, "Validation report not written");
        }
        Ok(())
    }

    /// Attempt every sink; returns the ones that accepted the session.
    async fn upload(
        &self,
        session: &mut BackupSession,
        layout: &SessionLayout,
        store: &ManifestStore,
    ) -> Result<Vec<&dyn ArtifactSink>> {
        let mut shipped: Vec<&dyn ArtifactSink> = Vec::new();
        if self.sinks.is_empty() {
            session.record_warning("no destination sinks configured; session kept locally only");
            return Ok(shipped);
        }

        let session_id = session.id.to_string();
        for sink in &self.sinks {
            let path = sink.remote_path(&session_id);
            let mut extra = BTreeMap::new();
            extra.insert("retention_days".to_string(), json!(self.config.cloud_retention_days));

            let uploaded = match sink.upload(layout.root()).await {
                Ok(()) => {
                    extra.insert("uploaded_at".to_string(), json!(Utc::now()));
                    shipped.push(sink.as_ref());
                    true
                }
                Err(e) => {
                    session.record_warning(format!("upload to {} failed: {}", sink.name(), e));
                    extra.insert("error".to_string(), json!(e.to_string()));
                    false
                }
            };
            store.set_cloud_status(sink.name(), CloudStatus { uploaded, path, extra })?;
        }

        if shipped.is_empty() {
            session.record_error(format!("all {} destination sinks failed", self.sinks.len()));
        }
        store.sync_session(session)?;
        Ok(shipped)
    }

    async fn notify(&self, session: &BackupSession) {
        if !self.notifier.is_configured() {
            return;
        }
        let level = if session.error_count > 0 {
            Severity::Critical
        } else if session.warning_count > 0 {
            Severity::Warning
        } else {
            Severity::Info
        };
        let status = if session.error_count > 0 { "failed" } else { "success" };

        let mut lines = vec![format!(
            "Session {} finished in state {:?} with {} error(s) and {} warning(s).",
            session.id, session.state, session.error_count, session.warning_count
        )];
        lines.extend(session.errors.iter().map(|e| format!("ERROR: {}", e)));
        lines.extend(session.warnings.iter().map(|w| format!("WARNING: {}", w)));

        let notification = Notification {
            component: COMPONENT.to_string(),
            status: status.to_string(),
            id: session.id.to_string(),
            level,
            issue_count: (session.error_count + session.warning_count) as usize,
            summary: lines.join("\n"),
        };
        self.notifier.send(&notification).await;
    }

    fn outcome(&self, session: &BackupSession, layout: &SessionLayout, store: &ManifestStore) -> BackupOutcome {
        let manifest = match store.load() {
            Ok(m) => Some(m),
            Err(e) => {
                error!(error = %e, "Manifest not readable after run");
                None
            }
        };
        BackupOutcome {
            session_id: session.id.to_string(),
            session_dir: layout.root().to_path_buf(),
            manifest,
            error_count: session.error_count,
            warning_count: session.warning_count,
            exit_code: if session.error_count == 0 { 0 } else { 1 },
        }
    }
}
