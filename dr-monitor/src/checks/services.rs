use super::MonitorContext;
use crate::report::AlertSet;
use dr_backup::producers::DatabaseTarget;
use dr_backup::tools::{run_checked, ToolCommand};
use std::collections::HashSet;

/// Database readiness and expected containers. Anything down is critical.
pub async fn check(ctx: &MonitorContext<'_>, alerts: &mut AlertSet) {
    let timeout = ctx.config.probe_timeout();

    if ctx.config.databases_enabled() {
        let target = DatabaseTarget::from_config(ctx.config);
        let cmd = target.readiness_command(timeout);
        if let Err(e) = run_checked(ctx.runner, &cmd).await {
            alerts.critical(format!(
                "database server {}:{} not ready: {}",
                target.host, target.port, e
            ));
        }
    }

    if ctx.config.expected_services.is_empty() {
        return;
    }

    let cmd = ToolCommand::new("docker", timeout).args(["ps", "--format", "{{.Names}}"]);
    let running: HashSet<String> = match run_checked(ctx.runner, &cmd).await {
        Ok(output) => output.stdout.lines().map(|l| l.trim().to_string()).collect(),
        Err(e) => {
            alerts.critical(format!("cannot list running containers: {}", e));
            return;
        }
    };

    let down: Vec<&str> = ctx
        .config
        .expected_services
        .iter()
        .filter(|name| !running.contains(name.as_str()))
        .map(String::as_str)
        .collect();
    if !down.is_empty() {
        alerts.critical(format!("services not running: {}", down.join(", ")));
    }
}
