//! Outbound notifications: email through `sendmail` and a chat webhook.
//!
//! Delivery is best effort. Failures are logged and never change the outcome
//! of the run that triggered them.

use crate::tools::{run_checked, CommandRunner, ToolCommand};
use crate::utils::errors::{DrError, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Alert ranking shared by the backup run summary and the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Critical => "CRITICAL",
        }
    }

    /// Attachment colour understood by Slack-compatible webhooks.
    pub fn color(self) -> &'static str {
        match self {
            Severity::Info => "good",
            Severity::Warning => "warning",
            Severity::Critical => "danger",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    /// Emitting component, e.g. "DR Backup" or "DR Monitor"
    pub component: String,
    /// Short outcome word, upper-cased in the subject
    pub status: String,
    /// Session or monitor run id
    pub id: String,
    pub level: Severity,
    pub issue_count: usize,
    pub summary: String,
}

impl Notification {
    pub fn subject(&self) -> String {
        format!("{} [{}] - {}", self.component, self.status.to_uppercase(), self.id)
    }
}

pub struct Notifier {
    email: Option<String>,
    webhook: Option<String>,
    hostname: String,
    runner: Arc<dyn CommandRunner>,
    client: reqwest::Client,
    timeout: Duration,
}

impl Notifier {
    pub fn new(
        email: Option<String>,
        webhook: Option<String>,
        hostname: impl Into<String>,
        runner: Arc<dyn CommandRunner>,
        timeout: Duration,
    ) -> Self {
        Self {
            email: email.filter(|e| !e.trim().is_empty()),
            webhook: webhook.filter(|w| !w.trim().is_empty()),
            hostname: hostname.into(),
            runner,
            client: reqwest::Client::new(),
            timeout,
        }
    }

    pub fn from_config(config: &crate::config::DrConfig, hostname: &str, runner: Arc<dyn CommandRunner>) -> Self {
        Self::new(
            config.notification_email.clone(),
            config.notification_webhook.clone(),
            hostname,
            runner,
            config.probe_timeout(),
        )
    }

    pub fn is_configured(&self) -> bool {
        self.email.is_some() || self.webhook.is_some()
    }

    /// Deliver on every configured channel; returns how many succeeded.
    pub async fn send(&self, notification: &Notification) -> usize {
        let mut delivered = 0;

        if let Some(to) = &self.email {
            match self.send_email(to, notification).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(channel = "email", error = %e, "Notification delivery failed"),
            }
        }

        if let Some(url) = &self.webhook {
            match self.send_webhook(url, notification).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(channel = "webhook", error = %e, "Notification delivery failed"),
            }
        }

        if delivered > 0 {
            info!(subject = %notification.subject(), delivered, "Notification sent");
        }
        delivered
    }

    async fn send_email(&self, to: &str, notification: &Notification) -> Result<()> {
        let message = render_email(to, &self.hostname, notification);
        let cmd = ToolCommand::new("sendmail", self.timeout)
            .arg("-t")
            .stdin(message);
        run_checked(self.runner.as_ref(), &cmd).await?;
        Ok(())
    }

    async fn send_webhook(&self, url: &str, notification: &Notification) -> Result<()> {
        let payload = webhook_payload(&self.hostname, notification);
        let response = self
            .client
            .post(url)
            .timeout(self.timeout)
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(DrError::Notification(format!("webhook returned HTTP {}", response.status())));
        }
        Ok(())
    }
}

fn render_email(to: &str, hostname: &str, n: &Notification) -> String {
    format!(
        "To: {}\nSubject: {}\nContent-Type: text/plain; charset=utf-8\n\nSystem: {}\nLevel: {}\nIssues: {}\nID: {}\n\n{}\n",
        to,
        n.subject(),
        hostname,
        n.level,
        n.issue_count,
        n.id,
        n.summary
    )
}

fn webhook_payload(hostname: &str, n: &Notification) -> serde_json::Value {
    json!({
        "text": n.subject(),
        "attachments": [{
            "color": n.level.color(),
            "title": n.subject(),
            "text": n.summary,
            "fields": [
                {"title": "System", "value": hostname, "short": true},
                {"title": "Level", "value": n.level.as_str(), "short": true},
                {"title": "Issues", "value": n.issue_count.to_string(), "short": true},
                {"title": "ID", "value": n.id, "short": true},
            ],
        }],
    })
}
