mod checks;
mod report;

use crate::checks::{sweep, MonitorContext};
use anyhow::Context;
use clap::Parser;
use dr_backup::notify::Notifier;
use dr_backup::shutdown::wait_for_signal;
use dr_backup::sinks::build_sinks;
use dr_backup::tools::{CommandRunner, SystemRunner};
use dr_backup::{utils, DrConfig};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = DrConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    utils::logger::init(args.log_level.as_deref().unwrap_or(&config.log_level))?;

    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    tracing::info!("dr-monitor v{} on {}", env!("CARGO_PKG_VERSION"), hostname);

    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
    let (sinks, problems) = build_sinks(&config, runner.clone());
    for problem in problems {
        tracing::warn!("Ignoring destination: {}", problem);
    }
    let notifier = Notifier::from_config(&config, &hostname, runner.clone());

    let ctx = MonitorContext {
        config: &config,
        runner: runner.as_ref(),
        sinks: &sinks,
        now: chrono::Utc::now(),
    };

    let code = tokio::select! {
        report = sweep(&ctx, &notifier, &hostname) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            report.exit_code()
        }
        signal = wait_for_signal() => signal.exit_code(),
    };

    std::process::exit(code);
}
