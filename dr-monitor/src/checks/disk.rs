use super::MonitorContext;
use crate::report::AlertSet;
use dr_backup::notify::Severity;
use std::path::Path;

/// Percentage points below the threshold at which a warning is raised.
const WARNING_MARGIN: f64 = 10.0;

/// Used percentage of the filesystem holding `path`, as `df` reports it.
pub fn usage_pct(path: &Path) -> nix::Result<f64> {
    let stat = nix::sys::statvfs::statvfs(path)?;
    let fragment = stat.fragment_size() as u64;
    let used = (stat.blocks() as u64).saturating_sub(stat.blocks_free() as u64) * fragment;
    let available = stat.blocks_available() as u64 * fragment;
    let total = used + available;
    if total == 0 {
        return Ok(0.0);
    }
    Ok(used as f64 * 100.0 / total as f64)
}

/// Critical strictly above `threshold`; a warning from ten points below it
/// up to and including the threshold itself.
pub fn classify(pct: f64, threshold: u8) -> Option<Severity> {
    let threshold = f64::from(threshold);
    if pct > threshold {
        Some(Severity::Critical)
    } else if pct >= threshold - WARNING_MARGIN {
        Some(Severity::Warning)
    } else {
        None
    }
}

/// Closest existing ancestor of `path` (the backup root may not exist yet).
fn existing_ancestor(path: &Path) -> Option<&Path> {
    path.ancestors().find(|p| p.exists())
}

pub fn check(ctx: &MonitorContext<'_>, alerts: &mut AlertSet) -> Option<f64> {
    let root = &ctx.config.backup_root;
    let Some(volume) = existing_ancestor(root) else {
        alerts.warning(format!("backup root {} not found", root.display()));
        return None;
    };

    match usage_pct(volume) {
        Ok(pct) => {
            let threshold = ctx.config.disk_usage_alert_pct;
            if let Some(severity) = classify(pct, threshold) {
                alerts.raise(
                    severity,
                    format!("disk usage on {} is {:.1}% (threshold {}%)", volume.display(), pct, threshold),
                );
            }
            Some(pct)
        }
        Err(e) => {
            alerts.warning(format!("cannot read disk usage of {}: {}", volume.display(), e));
            None
        }
    }
}
