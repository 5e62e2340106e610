use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const ANNOTATION_SUSPENDED: &str = "release.deckhouse.io/suspended";
pub const ANNOTATION_FORCE: &str = "release.deckhouse.io/force";
pub const ANNOTATION_APPLY_NOW: &str = "release.deckhouse.io/apply-now";
pub const ANNOTATION_DISRUPTION_APPROVED: &str = "release.deckhouse.io/disruption-approved";
pub const ANNOTATION_NOTIFICATION_TIME_SHIFT: &str =
    "release.deckhouse.io/notification-time-shift";
pub const ANNOTATION_COOLDOWN: &str = "release.deckhouse.io/cooldown";
pub const ANNOTATION_APPROVED: &str = "release.deckhouse.io/approved";
pub const ANNOTATION_CHANGE_CAUSE: &str = "release.deckhouse.io/change-cause";

/// DeckhouseRelease is an immutable intent to run a specific platform version
///
/// Created by the release poller, advanced through its phases by the
/// reconciler. Cluster scoped; the name is derived from the version.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "deckhouse.io",
    version = "v1alpha1",
    kind = "DeckhouseRelease",
    status = "DeckhouseReleaseStatus",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Transition", "type":"date", "jsonPath":".status.transitionTime"}"#,
    printcolumn = r#"{"name":"Message", "type":"string", "jsonPath":".status.message"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DeckhouseReleaseSpec {
    /// Semantic version with a leading `v` (e.g. "v1.30.5")
    pub version: String,

    /// Earliest instant (RFC3339) the release may be applied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apply_after: Option<String>,

    /// Capability name -> required value
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requirements: BTreeMap<String, String>,

    /// Disruption kinds this release may cause
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disruptions: Vec<String>,

    /// Changelog entries keyed by module, opaque to the controller
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    #[schemars(schema_with = "any_object")]
    pub changelog: BTreeMap<String, serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changelog_link: Option<String>,

    /// Spec-level manual approval; the `approved` annotation wins when present
    #[serde(default)]
    pub approved: bool,
}

fn any_object(_gen: &mut schemars::SchemaGenerator) -> schemars::Schema {
    schemars::json_schema!({
        "type": "object",
        "x-kubernetes-preserve-unknown-fields": true
    })
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeckhouseReleaseStatus {
    /// One of Pending, Deployed, Superseded, Suspended, Skipped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    #[serde(default)]
    pub approved: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// RFC3339 time of the last phase change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition_time: Option<String>,
}

/// Release lifecycle phase
///
/// Stored as a plain string in the status so an unknown value never breaks
/// listing; anything unrecognized reads as `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Pending,
    Deployed,
    Superseded,
    Suspended,
    Skipped,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Pending => "Pending",
            Phase::Deployed => "Deployed",
            Phase::Superseded => "Superseded",
            Phase::Suspended => "Suspended",
            Phase::Skipped => "Skipped",
        }
    }

    pub fn parse(value: &str) -> Phase {
        match value {
            "Deployed" => Phase::Deployed,
            "Superseded" => Phase::Superseded,
            "Suspended" => Phase::Suspended,
            "Skipped" => Phase::Skipped,
            _ => Phase::Pending,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Annotation set of a release, parsed once when a snapshot is taken
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnnotationFlags {
    pub suspended: bool,
    pub force: bool,
    pub apply_now: bool,
    pub disruption_approved: bool,
    pub notification_time_shift: bool,
    /// `Some` when the approval annotation is present at all
    pub approved: Option<bool>,
    pub cooldown: Option<DateTime<Utc>>,
}

impl AnnotationFlags {
    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> Self {
        let flag = |key: &str| annotations.get(key).map(|v| v == "true").unwrap_or(false);

        Self {
            suspended: flag(ANNOTATION_SUSPENDED),
            force: flag(ANNOTATION_FORCE),
            apply_now: flag(ANNOTATION_APPLY_NOW),
            disruption_approved: flag(ANNOTATION_DISRUPTION_APPROVED),
            notification_time_shift: flag(ANNOTATION_NOTIFICATION_TIME_SHIFT),
            approved: annotations.get(ANNOTATION_APPROVED).map(|v| v == "true"),
            cooldown: annotations
                .get(ANNOTATION_COOLDOWN)
                .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                .map(|t| t.with_timezone(&Utc)),
        }
    }
}

impl DeckhouseRelease {
    /// Current phase, with a missing or unknown value read as `Pending`
    pub fn phase(&self) -> Phase {
        self.status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .map(Phase::parse)
            .unwrap_or(Phase::Pending)
    }

    /// True when no controller has written a phase yet
    pub fn has_phase(&self) -> bool {
        self.status.as_ref().and_then(|s| s.phase.as_ref()).is_some()
    }

    pub fn flags(&self) -> AnnotationFlags {
        self.metadata
            .annotations
            .as_ref()
            .map(AnnotationFlags::from_annotations)
            .unwrap_or_default()
    }

    pub fn message(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.message.as_deref())
    }

    pub fn apply_after(&self) -> Option<DateTime<Utc>> {
        self.spec
            .apply_after
            .as_deref()
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|t| t.with_timezone(&Utc))
    }

    pub fn transition_time(&self) -> Option<DateTime<Utc>> {
        self.status
            .as_ref()
            .and_then(|s| s.transition_time.as_deref())
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|t| t.with_timezone(&Utc))
    }
}

/// Object name for a version: "v1.30.5" -> "v1-30-5"
pub fn release_name(version: &semver::Version) -> String {
    format!("v{}-{}-{}", version.major, version.minor, version.patch)
}

/// Parse a release version, accepting an optional `v` prefix and a missing
/// patch or minor component ("1.19" reads as 1.19.0)
pub fn parse_version(value: &str) -> Result<semver::Version, semver::Error> {
    let trimmed = value.trim().trim_start_matches('v');
    match semver::Version::parse(trimmed) {
        Ok(v) => Ok(v),
        Err(err) => {
            let (core, rest) = match trimmed.find(|c: char| c == '-' || c == '+') {
                Some(idx) => trimmed.split_at(idx),
                None => (trimmed, ""),
            };
            let padded = match core.split('.').count() {
                1 => format!("{core}.0.0{rest}"),
                2 => format!("{core}.0{rest}"),
                _ => return Err(err),
            };
            semver::Version::parse(&padded)
        }
    }
}

/// Canonical `vMAJOR.MINOR.PATCH` rendering used for image tags
pub fn version_tag(version: &semver::Version) -> String {
    format!("v{version}")
}

#[cfg(test)]
#[path = "release_test.rs"]
mod tests;
