//! Announcements - reporting rule matches to an external receiver
//!
//! Announcing is best-effort: failures are logged and never interrupt the
//! watch or cleanup runners.

use crate::mail::{MailError, MailResult};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use url::Url;

pub const ENV_WEBHOOK_URL: &str = "SWEEP_WEBHOOK_URL";

const ANNOUNCE_PATH: &str = "announcements";
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait Announcer: Send + Sync {
    /// Called once per processed message; an empty name means no rule matched.
    async fn announce_match(&self, rule_name: &str);

    /// Called once per mailbox with hits during cleanup.
    async fn announce_cleanup(&self, rule_name: &str, mailbox: &str, count: usize);
}

/// Writes announcements to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAnnouncer;

#[async_trait]
impl Announcer for LogAnnouncer {
    async fn announce_match(&self, rule_name: &str) {
        if rule_name.is_empty() {
            log::info!("No rule matched");
        } else {
            log::info!("Rule '{}' matched", rule_name);
        }
    }

    async fn announce_cleanup(&self, rule_name: &str, mailbox: &str, count: usize) {
        log::info!("Rule '{}' mailbox '{}' matched {} messages", rule_name, mailbox, count);
    }
}

/// POSTs `{"message": ...}` to `<base>/announcements`
#[derive(Debug, Clone)]
pub struct WebhookAnnouncer {
    client: Client,
    endpoint: Url,
}

impl WebhookAnnouncer {
    pub fn new(base_url: &str) -> MailResult<Self> {
        let base = base_url.trim().trim_end_matches('/');
        let endpoint = Url::parse(&format!("{}/", base))
            .and_then(|url| url.join(ANNOUNCE_PATH))
            .map_err(|e| MailError::Config(format!("invalid webhook URL {:?}: {}", base_url, e)))?;

        let client = Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .map_err(|e| MailError::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self { client, endpoint })
    }

    /// Build from `SWEEP_WEBHOOK_URL`, if set.
    pub fn from_env() -> MailResult<Option<Self>> {
        match std::env::var(ENV_WEBHOOK_URL) {
            Ok(url) if !url.trim().is_empty() => Self::new(&url).map(Some),
            _ => Ok(None),
        }
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub async fn post(&self, message: &str) -> MailResult<()> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&json!({ "message": message }))
            .send()
            .await
            .map_err(|e| MailError::Connection(format!("webhook request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(MailError::Connection(format!(
                "webhook returned status {}",
                status
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Announcer for WebhookAnnouncer {
    async fn announce_match(&self, rule_name: &str) {
        if rule_name.trim().is_empty() {
            return;
        }
        if let Err(e) = self.post(&format!("rule {:?} matched", rule_name)).await {
            log::error!("Reporting failed for rule '{}': {}", rule_name, e);
        }
    }

    async fn announce_cleanup(&self, rule_name: &str, mailbox: &str, count: usize) {
        let message = format!(
            "Rule {:?} mailbox {:?} matched {} messages",
            rule_name, mailbox, count
        );
        if let Err(e) = self.post(&message).await {
            log::error!(
                "Reporting failed for rule '{}' mailbox '{}': {}",
                rule_name,
                mailbox,
                e
            );
        }
    }
}
