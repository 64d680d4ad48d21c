use super::MonitorContext;
use crate::report::AlertSet;
use dr_backup::crypto::KeyMaterial;

/// The key file must be present and readable; without it no backup can
/// run and no artifact can be restored.
pub fn check(ctx: &MonitorContext<'_>, alerts: &mut AlertSet) -> bool {
    match KeyMaterial::load(&ctx.config.encryption_key_path) {
        Ok(_) => true,
        Err(e) => {
            alerts.critical(format!("encryption key unavailable: {}", e));
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checks::testing::ScriptedRunner;
    use chrono::Utc;
    use dr_backup::DrConfig;
    use tempfile::TempDir;

    #[test]
    fn test_key_presence() {
        let dir = TempDir::new().unwrap();
        let key = dir.path().join("backup.key");
        let mut config = DrConfig {
            encryption_key_path: key.clone(),
            ..Default::default()
        };
        let runner = ScriptedRunner::healthy("");

        let mut alerts = AlertSet::new();
        {
            let ctx = MonitorContext {
                config: &config,
                runner: &runner,
                sinks: &[],
                now: Utc::now(),
            };
            assert!(!check(&ctx, &mut alerts));
        }
        assert_eq!(crate::report::exit_code(alerts.level()), 2);

        std::fs::write(&key, b"secret").unwrap();
        config.encryption_key_path = key;
        let ctx = MonitorContext {
            config: &config,
            runner: &runner,
            sinks: &[],
            now: Utc::now(),
        };
        let mut alerts = AlertSet::new();
        assert!(check(&ctx, &mut alerts));
        assert!(alerts.is_empty());
    }
}
