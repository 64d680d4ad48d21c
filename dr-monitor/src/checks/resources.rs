use super::MonitorContext;
use crate::report::AlertSet;
use dr_backup::notify::Severity;
use sysinfo::System;

/// Host figures that end up in the report's system snapshot.
#[derive(Debug, Clone, Default)]
pub struct HostSample {
    pub uptime: u64,
    pub memory_pct: Option<f64>,
    pub load_one: Option<f64>,
    pub cpus: usize,
}

pub fn sample() -> HostSample {
    let mut sys = System::new();
    sys.refresh_memory();

    let total = sys.total_memory();
    let memory_pct = (total > 0).then(|| sys.used_memory() as f64 * 100.0 / total as f64);
    let load = System::load_average();
    let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);

    HostSample {
        uptime: System::uptime(),
        memory_pct,
        load_one: Some(load.one),
        cpus,
    }
}

/// Two-tier threshold: `crit` wins over `warn`.
pub fn classify(value: f64, warn: f64, crit: f64) -> Option<Severity> {
    if value >= crit {
        Some(Severity::Critical)
    } else if value >= warn {
        Some(Severity::Warning)
    } else {
        None
    }
}

pub fn evaluate(ctx: &MonitorContext<'_>, host: &HostSample, alerts: &mut AlertSet) {
    let config = ctx.config;

    if let Some(pct) = host.memory_pct {
        if let Some(severity) = classify(pct, config.memory_warn_pct, config.memory_crit_pct) {
            alerts.raise(severity, format!("memory usage is {:.1}%", pct));
        }
    }

    if let Some(load) = host.load_one {
        let ratio = load / host.cpus.max(1) as f64;
        if let Some(severity) = classify(ratio, config.load_warn_ratio, config.load_crit_ratio) {
            alerts.raise(
                severity,
                format!("load average {:.2} on {} CPUs ({:.2} per CPU)", load, host.cpus, ratio),
            );
        }
    }
}

pub fn check(ctx: &MonitorContext<'_>, alerts: &mut AlertSet) -> HostSample {
    let host = sample();
    evaluate(ctx, &host, alerts);
    host
}
