//! Release webhook notifications
//!
//! Posted once per minor release before it is applied, giving operators at
//! least `minimalNotificationTime` of warning.

use crate::config::NotificationConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("webhook responded with status {status}: {body}")]
    Status { status: u16, body: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    /// "MAJOR.MINOR"
    pub version: String,
    pub requirements: BTreeMap<String, String>,
    pub changelog_link: String,
    pub apply_time: String,
    pub message: String,
}

impl WebhookPayload {
    pub fn new(
        version: &semver::Version,
        requirements: BTreeMap<String, String>,
        changelog_link: String,
        apply_time: DateTime<Utc>,
    ) -> Self {
        let minor = format!("{}.{}", version.major, version.minor);
        let apply_time = crate::controller::cluster::format_time(apply_time);
        Self {
            message: format!(
                "New Deckhouse Release {minor} is available. Release will be applied at: {apply_time}"
            ),
            version: minor,
            requirements,
            changelog_link,
            apply_time,
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        config: &NotificationConfig,
        payload: &WebhookPayload,
    ) -> Result<(), NotificationError>;
}

/// POSTs the payload as JSON to the configured webhook
pub struct WebhookNotifier {
    timeout: Duration,
}

impl WebhookNotifier {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(
        &self,
        config: &NotificationConfig,
        payload: &WebhookPayload,
    ) -> Result<(), NotificationError> {
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .danger_accept_invalid_certs(config.skip_tls_verify)
            .build()?;

        let mut request = client.post(&config.webhook).json(payload);
        if let Some(auth) = &config.auth {
            if let Some(basic) = &auth.basic {
                request = request.basic_auth(&basic.username, Some(&basic.password));
            } else if let Some(token) = &auth.bearer_token {
                request = request.bearer_auth(token);
            }
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotificationError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
#[path = "notification_test.rs"]
mod tests;
