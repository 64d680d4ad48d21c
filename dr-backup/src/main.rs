//! dr-backup - Main entry point
//!
//! `backup` runs one full session, `validate` checks an existing session and
//! `restore` decrypts a single artifact.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dr_backup::crypto::{verify_checksum, CryptoEngine, KeyMaterial};
use dr_backup::orchestrator::Orchestrator;
use dr_backup::shutdown::wait_for_signal;
use dr_backup::sinks::build_sinks;
use dr_backup::tools::{CommandRunner, SystemRunner};
use dr_backup::validator::{resolve_session, SessionSource, Validator};
use dr_backup::{utils, DrConfig};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a full backup session
    Backup,

    /// Validate a session (latest local one by default)
    Validate {
        /// Session id or path to a session directory
        #[arg(short, long)]
        session: Option<String>,

        #[arg(long, value_enum, default_value_t = SessionSource::Auto)]
        source: SessionSource,
    },

    /// Decrypt one artifact
    Restore {
        #[arg(short, long, value_name = "PATH")]
        artifact: PathBuf,

        #[arg(short, long, value_name = "PATH")]
        output: PathBuf,

        /// Expected SHA-256 of the encrypted file, checked before decrypting
        #[arg(long)]
        checksum: Option<String>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = DrConfig::load(args.config.as_deref()).context("failed to load configuration")?;

    let log_level = args.log_level.as_deref().unwrap_or(&config.log_level);
    utils::logger::init(log_level)?;

    tracing::info!("dr-backup v{}", env!("CARGO_PKG_VERSION"));

    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);

    let code = tokio::select! {
        code = run(args.command, config, runner) => code?,
        signal = wait_for_signal() => signal.exit_code(),
    };

    std::process::exit(code);
}

async fn run(command: Command, config: DrConfig, runner: Arc<dyn CommandRunner>) -> Result<i32> {
    match command {
        Command::Backup => {
            let outcome = Orchestrator::new(config, runner).run_backup().await?;
            let status = outcome.manifest.as_ref().map(|m| m.metadata.status);
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "session_id": outcome.session_id,
                    "session_dir": outcome.session_dir,
                    "status": status,
                    "errors": outcome.error_count,
                    "warnings": outcome.warning_count,
                }))?
            );
            Ok(outcome.exit_code)
        }

        Command::Validate { session, source } => {
            let key = KeyMaterial::load(&config.encryption_key_path)?;
            let (sinks, _) = build_sinks(&config, runner);
            let resolved = resolve_session(&config.sessions_dir(), session.as_deref(), source, &sinks).await?;
            tracing::info!(dir = %resolved.dir.display(), origin = %resolved.origin, "Validating session");

            let validator = Validator::new(CryptoEngine::new(key), config.backup_age_alert_secs);
            let dir = resolved.dir.clone();
            let report = tokio::task::spawn_blocking(move || validator.validate(&dir)).await?;
            let path = report.write_report(&config.reports_dir())?;
            tracing::info!(report = %path.display(), "Validation report written");

            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(if report.passed() { 0 } else { 1 })
        }

        Command::Restore {
            artifact,
            output,
            checksum,
        } => {
            let crypto = CryptoEngine::new(KeyMaterial::load(&config.encryption_key_path)?);
            let result = tokio::task::spawn_blocking(move || {
                if let Some(expected) = checksum {
                    verify_checksum(&artifact, &expected)?;
                }
                crypto.decrypt_file(&artifact, &output).map(|()| output)
            })
            .await?;

            match result {
                Ok(path) => {
                    tracing::info!(output = %path.display(), "Artifact restored");
                    Ok(0)
                }
                Err(e) => {
                    tracing::error!("Restore failed: {}", e);
                    Ok(1)
                }
            }
        }
    }
}
