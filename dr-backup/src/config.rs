//! Configuration management for the backup pipeline.
//!
//! Loads configuration from an optional TOML file with `DR_*` environment
//! variable overrides. A `.env` file in the working directory is honoured.

use crate::utils::errors::{DrError, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file read when no `--config` is given (ignored if absent).
pub const DEFAULT_CONFIG_FILE: &str = "/etc/dr-backup/dr.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DrConfig {
    /// Root of all on-disk state
    pub backup_root: PathBuf,

    /// Session directories (default: `<backup_root>/sessions`)
    pub sessions_dir: Option<PathBuf>,

    /// Validation and monitor reports (default: `<backup_root>/reports`)
    pub reports_dir: Option<PathBuf>,

    /// Pre-provisioned symmetric key file; its whole content is the secret
    pub encryption_key_path: PathBuf,

    pub db_host: String,
    pub db_port: u16,
    pub db_user: String,
    pub db_password: Option<String>,

    /// Database used to query the catalog during discovery
    pub db_maintenance_db: String,

    /// Regex matched against tenant database names
    pub db_discovery_pattern: String,

    pub filestore_dir: PathBuf,

    /// Fixed list of config files/directories to archive
    #[serde(deserialize_with = "path_list")]
    pub config_paths: Vec<PathBuf>,

    /// Destination sink names (s3, gdrive, local)
    #[serde(deserialize_with = "string_list")]
    pub destinations: Vec<String>,

    pub s3_bucket: Option<String>,
    pub s3_prefix: String,
    pub s3_endpoint_url: Option<String>,
    pub aws_profile: Option<String>,

    /// rclone remote name for the drive sink
    pub drive_remote: String,
    pub drive_folder: String,

    /// Mounted directory for the local mirror sink
    pub local_mirror_dir: Option<PathBuf>,

    pub local_retention_days: u32,
    pub cloud_retention_days: u32,

    /// Seconds after which the latest backup is considered stale
    pub backup_age_alert_secs: u64,

    /// Seconds a run may stay unfinished before the monitor calls it stuck
    pub stale_run_secs: u64,

    /// Disk usage percentage that raises a critical alert
    pub disk_usage_alert_pct: u8,

    pub memory_warn_pct: f64,
    pub memory_crit_pct: f64,

    /// One-minute load average divided by CPU count
    pub load_warn_ratio: f64,
    pub load_crit_ratio: f64,

    /// Container names that must be running
    #[serde(deserialize_with = "string_list")]
    pub expected_services: Vec<String>,

    pub notification_email: Option<String>,
    pub notification_webhook: Option<String>,

    /// Run the validator in-process after producing artifacts
    pub validate_after_backup: bool,

    /// Remove the session directory after a fatal abort
    pub discard_on_fatal: bool,

    /// zstd level for filestore/config archives (1-22)
    pub compression_level: i32,

    pub tool_timeout_secs: u64,
    pub upload_timeout_secs: u64,
    pub probe_timeout_secs: u64,

    pub log_level: String,
}

impl Default for DrConfig {
    fn default() -> Self {
        Self {
            backup_root: PathBuf::from("/var/backups/dr"),
            sessions_dir: None,
            reports_dir: None,
            encryption_key_path: PathBuf::from("/etc/dr-backup/backup.key"),
            db_host: "localhost".to_string(),
            db_port: 5432,
            db_user: "postgres".to_string(),
            db_password: None,
            db_maintenance_db: "postgres".to_string(),
            db_discovery_pattern: ".*".to_string(),
            filestore_dir: PathBuf::from("/var/lib/app/filestore"),
            config_paths: Vec::new(),
            destinations: Vec::new(),
            s3_bucket: None,
            s3_prefix: "dr-backups".to_string(),
            s3_endpoint_url: None,
            aws_profile: None,
            drive_remote: "gdrive".to_string(),
            drive_folder: "dr-backups".to_string(),
            local_mirror_dir: None,
            local_retention_days: 7,
            cloud_retention_days: 30,
            backup_age_alert_secs: 90_000,
            stale_run_secs: 43_200,
            disk_usage_alert_pct: 85,
            memory_warn_pct: 85.0,
            memory_crit_pct: 95.0,
            load_warn_ratio: 1.5,
            load_crit_ratio: 3.0,
            expected_services: Vec::new(),
            notification_email: None,
            notification_webhook: None,
            validate_after_backup: true,
            discard_on_fatal: false,
            compression_level: 3,
            tool_timeout_secs: 3600,
            upload_timeout_secs: 7200,
            probe_timeout_secs: 30,
            log_level: "info".to_string(),
        }
    }
}

impl DrConfig {
    /// Load configuration from `path` (or the default file if present),
    /// then apply `DR_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();

        let file = match path {
            Some(p) => config::File::from(p).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_FILE)
                .format(config::FileFormat::Toml)
                .required(false),
        };

        let config: DrConfig = config::Config::builder()
            .add_source(file)
            .add_source(config::Environment::with_prefix("DR"))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document directly (no environment overrides).
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: DrConfig =
            toml::from_str(content).map_err(|e| DrError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.local_retention_days == 0 {
            return Err(DrError::Config("local_retention_days must be at least 1".into()));
        }
        if !(1..=100).contains(&self.disk_usage_alert_pct) {
            return Err(DrError::Config("disk_usage_alert_pct must be within 1..=100".into()));
        }
        if self.memory_warn_pct > self.memory_crit_pct {
            return Err(DrError::Config("memory_warn_pct exceeds memory_crit_pct".into()));
        }
        if self.load_warn_ratio > self.load_crit_ratio {
            return Err(DrError::Config("load_warn_ratio exceeds load_crit_ratio".into()));
        }
        if !(1..=22).contains(&self.compression_level) {
            return Err(DrError::Config("compression_level must be within 1..=22".into()));
        }
        regex::Regex::new(&self.db_discovery_pattern).map_err(|e| {
            DrError::Config(format!("invalid db_discovery_pattern: {}", e))
        })?;
        Ok(())
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.sessions_dir
            .clone()
            .unwrap_or_else(|| self.backup_root.join("sessions"))
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.reports_dir
            .clone()
            .unwrap_or_else(|| self.backup_root.join("reports"))
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// Whether database discovery/dumps are part of this deployment.
    pub fn databases_enabled(&self) -> bool {
        !self.db_discovery_pattern.is_empty()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(s) => s
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            OneOrMany::Many(v) => v
                .into_iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }
}

/// Accepts a TOML array or a comma-separated string (env vars).
fn string_list<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Vec<String>, D::Error> {
    Ok(OneOrMany::deserialize(d)?.into_vec())
}

fn path_list<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Vec<PathBuf>, D::Error> {
    Ok(string_list(d)?.into_iter().map(PathBuf::from).collect())
}
