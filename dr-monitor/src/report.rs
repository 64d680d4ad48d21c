//! Alert accumulation and the persisted monitor status report.

use chrono::{DateTime, Utc};
use dr_backup::fs::write_json_atomic;
use dr_backup::notify::Severity;
use serde::{Serialize, Serializer};
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const STATUS_FILE: &str = "monitor_status.json";

#[derive(Debug, Clone, Serialize)]
pub struct AlertEvent {
    #[serde(serialize_with = "lowercase_severity")]
    pub severity: Severity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

fn lowercase_severity<S: Serializer>(severity: &Severity, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&severity.as_str().to_lowercase())
}

/// Alerts raised during one sweep. The overall level only ever goes up.
#[derive(Debug, Clone)]
pub struct AlertSet {
    level: Severity,
    alerts: Vec<AlertEvent>,
}

impl AlertSet {
    pub fn new() -> Self {
        Self {
            level: Severity::Info,
            alerts: Vec::new(),
        }
    }

    pub fn raise(&mut self, severity: Severity, message: impl Into<String>) {
        let message = message.into();
        match severity {
            Severity::Critical => tracing::error!("[CRITICAL] {}", message),
            Severity::Warning => tracing::warn!("[WARNING] {}", message),
            Severity::Info => tracing::info!("{}", message),
        }
        if severity > self.level {
            self.level = severity;
        }
        if severity > Severity::Info {
            self.alerts.push(AlertEvent {
                severity,
                message,
                timestamp: Utc::now(),
            });
        }
    }

    pub fn warning(&mut self, message: impl Into<String>) {
        self.raise(Severity::Warning, message);
    }

    pub fn critical(&mut self, message: impl Into<String>) {
        self.raise(Severity::Critical, message);
    }

    pub fn level(&self) -> Severity {
        self.level
    }

    pub fn alerts(&self) -> &[AlertEvent] {
        &self.alerts
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }
}

/// 0 = INFO, 1 = WARNING, 2 = CRITICAL.
pub fn exit_code(level: Severity) -> i32 {
    match level {
        Severity::Info => 0,
        Severity::Warning => 1,
        Severity::Critical => 2,
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SystemSnapshot {
    pub hostname: String,
    /// Seconds since boot
    pub uptime: u64,
    /// Percent used on the backup volume
    pub disk_usage: Option<f64>,
    /// Percent of physical memory in use
    pub memory_usage: Option<f64>,
    /// One-minute load average
    pub load_average: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BackupStatus {
    pub latest_session: Option<String>,
    pub cloud_configured: bool,
    pub encryption_key_exists: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Healthy,
    Issues,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatusReport {
    pub monitor_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub overall_status: OverallStatus,
    pub alert_level: Severity,
    pub alerts: Vec<AlertEvent>,
    pub system: SystemSnapshot,
    pub backup_status: BackupStatus,
}

impl MonitorStatusReport {
    pub fn new(alerts: AlertSet, system: SystemSnapshot, backup_status: BackupStatus) -> Self {
        Self {
            monitor_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            overall_status: if alerts.is_empty() {
                OverallStatus::Healthy
            } else {
                OverallStatus::Issues
            },
            alert_level: alerts.level(),
            alerts: alerts.alerts,
            system,
            backup_status,
        }
    }

    pub fn exit_code(&self) -> i32 {
        exit_code(self.alert_level)
    }

    /// Append a CRITICAL for a report that could not be persisted.
    pub fn record_write_failure(&mut self, reports_dir: &Path, error: &dr_backup::DrError) {
        let message = format!("cannot write monitor report to {}: {}", reports_dir.display(), error);
        tracing::error!("[CRITICAL] {}", message);
        self.alerts.push(AlertEvent {
            severity: Severity::Critical,
            message,
            timestamp: Utc::now(),
        });
        self.alert_level = Severity::Critical;
        self.overall_status = OverallStatus::Issues;
    }

    /// Replace `<reports_dir>/monitor_status.json`.
    pub fn write(&self, reports_dir: &Path) -> dr_backup::Result<PathBuf> {
        std::fs::create_dir_all(reports_dir)?;
        let path = reports_dir.join(STATUS_FILE);
        write_json_atomic(&path, self)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_level_never_deescalates() {
        let mut alerts = AlertSet::new();
        assert_eq!(exit_code(alerts.level()), 0);

        alerts.warning("disk at 78%");
        assert_eq!(alerts.level(), Severity::Warning);
        alerts.critical("no backups found");
        alerts.warning("load high");
        alerts.raise(Severity::Info, "all good elsewhere");

        assert_eq!(alerts.level(), Severity::Critical);
        assert_eq!(exit_code(alerts.level()), 2);
        assert_eq!(alerts.alerts().len(), 3);
    }

    #[test]
    fn test_report_serialization() {
        let mut alerts = AlertSet::new();
        alerts.warning("memory at 90%");
        let report = MonitorStatusReport::new(alerts, SystemSnapshot::default(), BackupStatus::default());
        assert_eq!(report.exit_code(), 1);

        let dir = TempDir::new().unwrap();
        let path = report.write(dir.path()).unwrap();
        assert_eq!(path.file_name().unwrap(), STATUS_FILE);

        let value: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(value["overall_status"], "issues");
        assert_eq!(value["alert_level"], "WARNING");
        assert_eq!(value["alerts"][0]["severity"], "warning");
        assert_eq!(value["backup_status"]["encryption_key_exists"], false);
    }

    #[test]
    fn test_healthy_report_overwrites() {
        let dir = TempDir::new().unwrap();
        let mut alerts = AlertSet::new();
        alerts.critical("x");
        MonitorStatusReport::new(alerts, SystemSnapshot::default(), BackupStatus::default())
            .write(dir.path())
            .unwrap();

        let healthy = MonitorStatusReport::new(AlertSet::new(), SystemSnapshot::default(), BackupStatus::default());
        let path = healthy.write(dir.path()).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(value["overall_status"], "healthy");
        assert_eq!(value["alerts"].as_array().unwrap().len(), 0);
    }
}
