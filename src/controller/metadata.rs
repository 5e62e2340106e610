//! Release metadata carried by a release-channel image
//!
//! The image layers hold `version.json` (version, canary waves,
//! requirements, disruptions, suspend flag) and optionally
//! `changelog.yaml`. The image config may carry a `cooldown` label.

use chrono::{DateTime, NaiveDateTime, Utc};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::time::Duration;
use tracing::warn;

/// Changelog keys kept regardless of which modules are enabled
pub const PLATFORM_CHANGELOG_KEYS: [&str; 3] = ["candi", "deckhouse-controller", "global"];

pub const COOLDOWN_LABEL: &str = "cooldown";

const CHANGELOG_LINK_BASE: &str = "https://github.com/deckhouse/deckhouse/releases/tag";

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("version not found. Probably image is broken or layer does not exist")]
    VersionNotFound,

    #[error("invalid version.json: {0}")]
    InvalidVersionJson(#[from] serde_json::Error),

    #[error("failed to read image layer: {0}")]
    Layer(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReleaseMetadata {
    #[serde(default)]
    pub version: String,

    /// Per-channel canary settings, keyed by kebab-case channel name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub canary: BTreeMap<String, CanarySettings>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requirements: BTreeMap<String, String>,

    /// "MAJOR.MINOR" -> disruption kinds
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub disruptions: BTreeMap<String, Vec<String>>,

    #[serde(default)]
    pub suspend: bool,

    #[serde(skip)]
    pub changelog: BTreeMap<String, serde_json::Value>,

    #[serde(skip)]
    pub cooldown: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanarySettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub waves: u32,
    #[serde(default, with = "duration_string")]
    pub interval: Duration,
}

impl ReleaseMetadata {
    /// Decode metadata from raw image layers and the image config labels
    pub fn decode(
        layers: &[Vec<u8>],
        labels: &BTreeMap<String, String>,
    ) -> Result<Self, MetadataError> {
        let mut version_json: Option<Vec<u8>> = None;
        let mut changelog_yaml: Option<Vec<u8>> = None;

        for layer in layers.iter().filter(|l| !l.is_empty()) {
            let files = read_layer(layer)?;
            if let Some(content) = files.version {
                version_json = Some(content);
            }
            if let Some(content) = files.changelog {
                changelog_yaml = Some(content);
            }
        }

        let mut metadata: ReleaseMetadata = match version_json {
            Some(content) => serde_json::from_slice(&content)?,
            None => ReleaseMetadata::default(),
        };
        if metadata.version.trim().is_empty() {
            return Err(MetadataError::VersionNotFound);
        }

        if let Some(content) = changelog_yaml {
            metadata.changelog = match serde_yaml::from_slice(&content) {
                Ok(changelog) => changelog,
                Err(e) => {
                    warn!(version = %metadata.version, error = %e, "Unmarshal changelog failed, using empty changelog");
                    BTreeMap::new()
                }
            };
        }

        metadata.cooldown = labels.get(COOLDOWN_LABEL).and_then(|v| parse_cooldown(v));

        Ok(metadata)
    }

    /// Disruption kinds declared for the metadata's own MAJOR.MINOR
    pub fn disruptions_for(&self, version: &semver::Version) -> Vec<String> {
        self.disruptions
            .get(&format!("{}.{}", version.major, version.minor))
            .cloned()
            .unwrap_or_default()
    }
}

#[derive(Default)]
struct LayerFiles {
    version: Option<Vec<u8>>,
    changelog: Option<Vec<u8>>,
}

fn read_layer(layer: &[u8]) -> Result<LayerFiles, std::io::Error> {
    let reader: Box<dyn Read + '_> = if layer.starts_with(&[0x1f, 0x8b]) {
        Box::new(GzDecoder::new(layer))
    } else {
        Box::new(layer)
    };

    let mut archive = tar::Archive::new(reader);
    let mut files = LayerFiles::default();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_string_lossy().to_string();
        let path = path.trim_start_matches("./").trim_start_matches('/');

        let slot = match path {
            "version.json" => &mut files.version,
            "changelog.yaml" | "changelog.yml" => &mut files.changelog,
            _ => continue,
        };
        let mut content = Vec::new();
        entry.read_to_end(&mut content)?;
        *slot = Some(content);
    }

    Ok(files)
}

/// Parse the `cooldown` label; the first matching layout wins
pub fn parse_cooldown(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    ["%Y-%m-%d %H:%M", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|layout| NaiveDateTime::parse_from_str(value, layout).ok())
        .map(|t| t.and_utc())
        .or_else(|| {
            DateTime::parse_from_rfc3339(value)
                .ok()
                .map(|t| t.with_timezone(&Utc))
        })
}

/// Deterministic delay bucket for this cluster and version
///
/// Returns `None` when canary is off for the channel or the cluster falls
/// into wave zero.
pub fn canary_apply_after(
    settings: &CanarySettings,
    cluster_uuid: &str,
    version: &str,
    base: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if !settings.enabled || settings.waves == 0 {
        return None;
    }

    let wave = seahash::hash(format!("{cluster_uuid}{version}").as_bytes()) % settings.waves as u64;
    if wave == 0 {
        return None;
    }

    let delay = settings.interval.checked_mul(u32::try_from(wave).ok()?)?;
    Some(base + chrono::Duration::from_std(delay).ok()?)
}

/// Keep changelog entries of enabled modules and the platform keys
pub fn filter_changelog(
    changelog: &BTreeMap<String, serde_json::Value>,
    enabled_modules: &BTreeSet<String>,
) -> BTreeMap<String, serde_json::Value> {
    changelog
        .iter()
        .filter(|(module, _)| {
            enabled_modules.contains(module.as_str())
                || PLATFORM_CHANGELOG_KEYS.contains(&module.as_str())
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

pub fn changelog_link(version: &semver::Version) -> String {
    format!("{CHANGELOG_LINK_BASE}/v{version}")
}

/// Durations written as "5m", "1h30m", "90s"
pub mod duration_string {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let value = String::deserialize(deserializer)?;
        humantime::parse_duration(value.trim()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
#[path = "metadata_test.rs"]
mod tests;
