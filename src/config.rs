//! Controller configuration
//!
//! Two layers:
//! - [`ControllerConfig`]: process settings from environment variables, read once
//! - [`UpdatePolicy`]: update settings from `ModuleConfig/deckhouse`, read every tick

use crate::controller::windows::{UpdateWindows, WindowError, WindowSpec};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

pub const DEFAULT_NAMESPACE: &str = "d8-system";
pub const DEFAULT_DEPLOYMENT: &str = "deckhouse";
pub const DEFAULT_HEALTH_PORT: u16 = 9650;
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_OUTDATED_GRACE: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {name}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Process configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Namespace of the deployment, its pods, secrets and the release-data record
    pub namespace: String,
    pub deployment_name: String,
    pub health_port: u16,
    pub tick_interval: Duration,
    /// Readiness endpoint of the running platform pod; `None` trusts pod conditions
    pub readiness_url: Option<String>,
    pub leader_election: bool,
    /// Latest registered settings version per module
    pub module_config_versions: BTreeMap<String, u32>,
    /// Delay between marking an outdated pending release and deleting it
    pub outdated_grace: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            deployment_name: DEFAULT_DEPLOYMENT.to_string(),
            health_port: DEFAULT_HEALTH_PORT,
            tick_interval: DEFAULT_TICK_INTERVAL,
            readiness_url: None,
            leader_election: true,
            module_config_versions: BTreeMap::new(),
            outdated_grace: DEFAULT_OUTDATED_GRACE,
        }
    }
}

impl ControllerConfig {
    /// Create config from environment variables
    ///
    /// Uses:
    /// - `POD_NAMESPACE` (default "d8-system")
    /// - `D8_DEPLOYMENT_NAME` (default "deckhouse")
    /// - `D8_HEALTH_PORT` (default 9650)
    /// - `D8_TICK_INTERVAL` (default "15s")
    /// - `D8_READINESS_URL` (unset by default)
    /// - `D8_LEADER_ELECTION` (default true)
    /// - `D8_MODULE_CONFIG_VERSIONS` ("name=version,...")
    /// - `D8_OUTDATED_GRACE` (default "1m")
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let value = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let health_port = match value("D8_HEALTH_PORT") {
            Some(v) => v.trim().parse().map_err(|e: std::num::ParseIntError| ConfigError::Invalid {
                name: "D8_HEALTH_PORT",
                value: v.clone(),
                reason: e.to_string(),
            })?,
            None => defaults.health_port,
        };

        let tick_interval = match value("D8_TICK_INTERVAL") {
            Some(v) => parse_duration("D8_TICK_INTERVAL", &v)?,
            None => defaults.tick_interval,
        };
        if tick_interval.is_zero() {
            return Err(ConfigError::Invalid {
                name: "D8_TICK_INTERVAL",
                value: "0s".to_string(),
                reason: "must be positive".to_string(),
            });
        }

        let outdated_grace = match value("D8_OUTDATED_GRACE") {
            Some(v) => parse_duration("D8_OUTDATED_GRACE", &v)?,
            None => defaults.outdated_grace,
        };

        let leader_election = match value("D8_LEADER_ELECTION") {
            Some(v) => !matches!(v.trim().to_ascii_lowercase().as_str(), "false" | "0" | "no"),
            None => defaults.leader_election,
        };

        let module_config_versions = match value("D8_MODULE_CONFIG_VERSIONS") {
            Some(v) => parse_versions(&v)?,
            None => BTreeMap::new(),
        };

        Ok(Self {
            namespace: value("POD_NAMESPACE").unwrap_or(defaults.namespace),
            deployment_name: value("D8_DEPLOYMENT_NAME").unwrap_or(defaults.deployment_name),
            health_port,
            tick_interval,
            readiness_url: value("D8_READINESS_URL"),
            leader_election,
            module_config_versions,
            outdated_grace,
        })
    }

    /// Deadline for a single external call; always shorter than a tick
    pub fn call_timeout(&self) -> Duration {
        self.tick_interval * 2 / 3
    }
}

fn parse_duration(name: &'static str, value: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value.trim()).map_err(|e| ConfigError::Invalid {
        name,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_versions(value: &str) -> Result<BTreeMap<String, u32>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let invalid = |reason: &str| ConfigError::Invalid {
                name: "D8_MODULE_CONFIG_VERSIONS",
                value: pair.to_string(),
                reason: reason.to_string(),
            };
            let (module, version) = pair.split_once('=').ok_or_else(|| invalid("expected name=version"))?;
            let version: u32 = version
                .trim()
                .parse()
                .map_err(|_| invalid("version is not a number"))?;
            Ok((module.trim().to_string(), version))
        })
        .collect()
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("invalid deckhouse settings: {0}")]
    Json(#[from] serde_json::Error),

    #[error("update windows configuration is not valid: {0}")]
    Windows(#[from] WindowError),

    #[error("invalid duration {value:?} in {field}: {reason}")]
    Duration {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("notification webhook is required when notification is configured")]
    MissingWebhook,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum UpdateMode {
    #[default]
    Auto,
    Manual,
}

/// `spec.settings` of the `deckhouse` ModuleConfig as written by users
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeckhouseSettings {
    #[serde(default)]
    release_channel: Option<String>,
    #[serde(default)]
    update: UpdateSpec,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateSpec {
    #[serde(default)]
    mode: UpdateMode,
    #[serde(default)]
    disruption_approval_mode: UpdateMode,
    #[serde(default)]
    windows: Vec<WindowSpec>,
    #[serde(default)]
    notification: Option<NotificationSpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotificationSpec {
    #[serde(default)]
    webhook: Option<String>,
    #[serde(default)]
    minimal_notification_time: Option<String>,
    #[serde(default)]
    skip_tls_verify: bool,
    #[serde(default)]
    auth: Option<WebhookAuth>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAuth {
    #[serde(default)]
    pub basic: Option<BasicAuth>,
    #[serde(default)]
    pub bearer_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NotificationConfig {
    pub webhook: String,
    pub minimal_notification_time: Duration,
    pub skip_tls_verify: bool,
    pub auth: Option<WebhookAuth>,
}

/// Validated update settings
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdatePolicy {
    /// Kebab-case channel tag (`early-access`); `None` selects tag mode
    pub release_channel: Option<String>,
    pub mode: UpdateMode,
    pub disruption_approval_mode: UpdateMode,
    pub windows: UpdateWindows,
    pub notification: Option<NotificationConfig>,
}

impl UpdatePolicy {
    /// Build from `spec.settings` of the `deckhouse` ModuleConfig; `None` means defaults
    pub fn from_settings(settings: Option<&serde_json::Value>) -> Result<Self, SettingsError> {
        let settings: DeckhouseSettings = match settings {
            Some(value) if !value.is_null() => serde_json::from_value(value.clone())?,
            _ => DeckhouseSettings::default(),
        };

        let notification = match settings.update.notification {
            Some(spec) => {
                let webhook = spec
                    .webhook
                    .filter(|w| !w.trim().is_empty())
                    .ok_or(SettingsError::MissingWebhook)?;
                let minimal_notification_time = match spec.minimal_notification_time {
                    Some(value) => humantime::parse_duration(value.trim()).map_err(|e| {
                        SettingsError::Duration {
                            field: "update.notification.minimalNotificationTime",
                            value: value.clone(),
                            reason: e.to_string(),
                        }
                    })?,
                    None => Duration::ZERO,
                };
                Some(NotificationConfig {
                    webhook,
                    minimal_notification_time,
                    skip_tls_verify: spec.skip_tls_verify,
                    auth: spec.auth,
                })
            }
            None => None,
        };

        Ok(Self {
            release_channel: settings
                .release_channel
                .filter(|c| !c.trim().is_empty())
                .map(|c| channel_tag(&c)),
            mode: settings.update.mode,
            disruption_approval_mode: settings.update.disruption_approval_mode,
            windows: UpdateWindows::parse(&settings.update.windows)?,
            notification,
        })
    }
}

/// Channel without minor-by-minor creation; it may jump several minors
pub const LTS_CHANNEL: &str = "lts";

/// "EarlyAccess" -> "early-access", "Stable" -> "stable", "LTS" -> "lts"
pub fn channel_tag(channel: &str) -> String {
    let mut tag = String::with_capacity(channel.len() + 4);
    let mut prev_lower = false;
    for c in channel.trim().chars() {
        if c.is_ascii_uppercase() {
            if prev_lower {
                tag.push('-');
            }
            tag.push(c.to_ascii_lowercase());
        } else {
            tag.push(c);
        }
        prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
    }
    tag
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
