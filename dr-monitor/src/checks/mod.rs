//! Independent health checks. Each check raises alerts into the shared
//! [`AlertSet`] and never stops the sweep.

pub mod backup_age;
pub mod cloud_sync;
pub mod disk;
pub mod integrity;
pub mod keys;
pub mod resources;
pub mod services;

use crate::report::{AlertSet, BackupStatus, MonitorStatusReport, SystemSnapshot};
use chrono::{DateTime, Utc};
use dr_backup::notify::{Notification, Notifier};
use dr_backup::sinks::ArtifactSink;
use dr_backup::tools::CommandRunner;
use dr_backup::DrConfig;
use std::path::PathBuf;
use tracing::{info, warn};

/// Inputs shared by all checks for one sweep.
pub struct MonitorContext<'a> {
    pub config: &'a DrConfig,
    pub runner: &'a dyn CommandRunner,
    pub sinks: &'a [Box<dyn ArtifactSink>],
    pub now: DateTime<Utc>,
}

/// The newest finalized session found locally.
#[derive(Debug, Clone)]
pub struct LatestSession {
    pub id: String,
    pub dir: PathBuf,
    pub manifest: dr_backup::session::manifest::Manifest,
}

/// Run every check, persist the report and notify when anything was raised.
///
/// A report that cannot be written becomes a CRITICAL of its own; the alerts
/// are still delivered and the exit code still reflects them.
pub async fn sweep(ctx: &MonitorContext<'_>, notifier: &Notifier, hostname: &str) -> MonitorStatusReport {
    let mut alerts = AlertSet::new();

    let key_exists = keys::check(ctx, &mut alerts);
    let latest = backup_age::check(ctx, &mut alerts);
    cloud_sync::check(ctx, latest.as_ref(), &mut alerts).await;
    let disk_usage = disk::check(ctx, &mut alerts);
    services::check(ctx, &mut alerts).await;
    if key_exists {
        integrity::check(ctx, latest.as_ref(), &mut alerts).await;
    }
    let host = resources::check(ctx, &mut alerts);

    let system = SystemSnapshot {
        hostname: hostname.to_string(),
        uptime: host.uptime,
        disk_usage,
        memory_usage: host.memory_pct,
        load_average: host.load_one,
    };
    let backup_status = BackupStatus {
        latest_session: latest.as_ref().map(|l| l.id.clone()),
        cloud_configured: !ctx.sinks.is_empty(),
        encryption_key_exists: key_exists,
    };

    let mut report = MonitorStatusReport::new(alerts, system, backup_status);
    let reports_dir = ctx.config.reports_dir();
    match report.write(&reports_dir) {
        Ok(path) => info!(
            level = %report.alert_level,
            alerts = report.alerts.len(),
            report = %path.display(),
            "Monitor sweep complete"
        ),
        Err(e) => report.record_write_failure(&reports_dir, &e),
    }

    if !report.alerts.is_empty() {
        let summary = report
            .alerts
            .iter()
            .map(|a| format!("{}: {}", a.severity, a.message))
            .collect::<Vec<_>>()
            .join("\n");
        let notification = Notification {
            component: "DR Monitor".to_string(),
            status: report.alert_level.to_string(),
            id: report.monitor_id.to_string(),
            level: report.alert_level,
            issue_count: report.alerts.len(),
            summary,
        };
        if notifier.is_configured() && notifier.send(&notification).await == 0 {
            warn!("Alerts raised but no notification channel accepted them");
        }
    }

    report
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use dr_backup::tools::{CommandRunner, ToolCommand, ToolOutput};
    use std::sync::{Arc, Mutex};

    type Handler = dyn Fn(&ToolCommand) -> ToolOutput + Send + Sync;

    /// Scripted runner; every program is available.
    pub struct ScriptedRunner {
        handler: Box<Handler>,
        pub calls: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedRunner {
        pub fn new<F>(handler: F) -> Self
        where
            F: Fn(&ToolCommand) -> ToolOutput + Send + Sync + 'static,
        {
            Self {
                handler: Box::new(handler),
                calls: Arc::new(Mutex::new(Vec::new())),
            }
        }

        pub fn healthy(services: &'static str) -> Self {
            Self::new(move |cmd| match cmd.program.as_str() {
                "docker" => ToolOutput::ok(services),
                _ => ToolOutput::ok(""),
            })
        }
    }

    #[async_trait::async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, cmd: &ToolCommand) -> dr_backup::Result<ToolOutput> {
            self.calls.lock().unwrap().push(cmd.program.clone());
            Ok((self.handler)(cmd))
        }

        fn is_available(&self, _program: &str) -> bool {
            true
        }
    }
}
