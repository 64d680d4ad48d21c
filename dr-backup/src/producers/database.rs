//! Tenant database discovery and `pg_dump` artifacts.

use super::{sanitize_name, ProducerContext};
use crate::session::manifest::Artifact;
use crate::session::SessionLayout;
use crate::tools::{run_checked, CommandRunner, ToolCommand};
use crate::utils::errors::{DrError, Result};
use regex::Regex;
use std::time::Duration;
use tracing::info;

/// Databases never treated as tenants.
const SYSTEM_DATABASES: &[&str] = &["postgres", "template0", "template1"];

const DISCOVERY_QUERY: &str =
    "SELECT datname FROM pg_database WHERE datistemplate = false AND datallowconn ORDER BY datname";

/// Connection parameters for the database server.
#[derive(Debug, Clone)]
pub struct DatabaseTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub maintenance_db: String,
}

impl DatabaseTarget {
    pub fn from_config(config: &crate::config::DrConfig) -> Self {
        Self {
            host: config.db_host.clone(),
            port: config.db_port,
            user: config.db_user.clone(),
            password: config.db_password.clone(),
            maintenance_db: config.db_maintenance_db.clone(),
        }
    }

    fn command(&self, program: &str, timeout: Duration) -> ToolCommand {
        let cmd = ToolCommand::new(program, timeout).args([
            "-h".to_string(),
            self.host.clone(),
            "-p".to_string(),
            self.port.to_string(),
            "-U".to_string(),
            self.user.clone(),
        ]);
        match &self.password {
            Some(pw) => cmd.env("PGPASSWORD", pw.clone()),
            None => cmd,
        }
    }

    /// `pg_isready` probe used by the monitor.
    pub fn readiness_command(&self, timeout: Duration) -> ToolCommand {
        ToolCommand::new("pg_isready", timeout).args([
            "-h".to_string(),
            self.host.clone(),
            "-p".to_string(),
            self.port.to_string(),
            "-U".to_string(),
            self.user.clone(),
        ])
    }
}

/// List tenant databases whose names match `pattern`.
pub async fn discover_databases(
    runner: &dyn CommandRunner,
    target: &DatabaseTarget,
    pattern: &Regex,
    timeout: Duration,
) -> Result<Vec<String>> {
    let cmd = target
        .command("psql", timeout)
        .args(["-d", target.maintenance_db.as_str(), "-At", "-c", DISCOVERY_QUERY]);
    let output = run_checked(runner, &cmd).await?;

    let mut names: Vec<String> = output
        .stdout
        .lines()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .filter(|n| !SYSTEM_DATABASES.contains(n))
        .filter(|n| pattern.is_match(n))
        .map(String::from)
        .collect();
    names.sort();
    names.dedup();

    info!(count = names.len(), pattern = %pattern, "Discovered tenant databases");
    Ok(names)
}

/// Dump one database in custom (structured) format, encrypt it and append
/// it to the manifest. The plaintext dump never outlives this call.
pub async fn backup_database(
    ctx: &ProducerContext<'_>,
    target: &DatabaseTarget,
    name: &str,
) -> Result<Artifact> {
    let relative = ctx.artifact_relative(SessionLayout::DATABASES, name, ".dump.enc");
    let scratch = ctx.scratch()?;
    let dump_path = scratch.path().join(format!("{}.dump", sanitize_name(name)));

    let cmd = target.command("pg_dump", ctx.tool_timeout).args([
        "-Fc".to_string(),
        "--no-password".to_string(),
        "-f".to_string(),
        dump_path.to_string_lossy().to_string(),
        name.to_string(),
    ]);
    run_checked(ctx.runner, &cmd).await?;

    if !dump_path.is_file() {
        return Err(DrError::ToolFailed {
            tool: "pg_dump".into(),
            code: Some(0),
            stderr: format!("no dump written for {}", name),
        });
    }

    let artifact = ctx.seal(name, &dump_path, &relative).await?;
    drop(scratch);

    ctx.store.append_database(artifact.clone())?;
    info!(database = %name, size = artifact.size, "Database artifact recorded");
    Ok(artifact)
}
