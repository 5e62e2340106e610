//! Release-channel poller
//!
//! Watches the digest of `release-channel:<channel>` and, when it moves,
//! turns the image metadata into a `DeckhouseRelease`. Releases left over
//! from a channel that went back are removed; missing intermediate minors
//! are created so the reconciler can walk one minor at a time.

use crate::config::{channel_tag, LTS_CHANNEL};
use crate::controller::clock::Clock;
use crate::controller::cluster::{format_time, ClusterApi, ClusterError, StatusPatch};
use crate::controller::environment::Environment;
use crate::controller::metadata::{
    canary_apply_after, changelog_link, filter_changelog, MetadataError, ReleaseMetadata,
};
use crate::controller::reconciler::ReleaseView;
use crate::controller::registry::{RegistryClient, RegistryError, RegistryFactory};
use crate::crd::release::{
    parse_version, release_name, version_tag, DeckhouseRelease, DeckhouseReleaseSpec, Phase,
    ANNOTATION_CHANGE_CAUSE, ANNOTATION_COOLDOWN, ANNOTATION_NOTIFICATION_TIME_SHIFT,
    ANNOTATION_SUSPENDED,
};
use crate::server::metrics::ControllerMetrics;
use chrono::{DateTime, Utc};
use semver::Version;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum PollError {
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("broken release image: {0}")]
    Metadata(#[from] MetadataError),

    #[error("release image carries invalid version {version:?}: {source}")]
    InvalidVersion {
        version: String,
        source: semver::Error,
    },

    #[error("pre-release version {0} is not allowed on a release channel")]
    PreRelease(Version),

    #[error("cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("cannot create intermediate releases before {version}: {source}")]
    StepByStep {
        version: Version,
        source: Box<PollError>,
    },

    #[error("no release tag found for minor {0}")]
    MissingMinor(String),
}

impl PollError {
    /// Label for `deckhouse_release_check_errors_total`
    pub fn reason(&self) -> &'static str {
        match self {
            PollError::Registry(_) | PollError::MissingMinor(_) => "registry",
            PollError::Metadata(_) | PollError::InvalidVersion { .. } | PollError::PreRelease(_) => {
                "broken_image"
            }
            PollError::Cluster(_) => "kube",
            PollError::StepByStep { source, .. } => source.reason(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// The channel digest did not move since the last successful poll
    Unchanged,
    /// Releases match the channel image with this digest
    Reconciled { digest: String },
}

pub struct ReleasePoller<'a> {
    pub cluster: &'a dyn ClusterApi,
    pub registries: &'a dyn RegistryFactory,
    pub clock: &'a dyn Clock,
    pub metrics: &'a ControllerMetrics,
}

/// Channel image decoded into a version
struct ChannelRelease {
    version: Version,
    metadata: ReleaseMetadata,
}

impl ChannelRelease {
    fn decode(
        layers: &[Vec<u8>],
        labels: &BTreeMap<String, String>,
    ) -> Result<Self, PollError> {
        let metadata = ReleaseMetadata::decode(layers, labels)?;
        let version = parse_version(&metadata.version).map_err(|source| PollError::InvalidVersion {
            version: metadata.version.clone(),
            source,
        })?;
        if !version.pre.is_empty() {
            return Err(PollError::PreRelease(version));
        }
        Ok(Self { version, metadata })
    }
}

impl ReleasePoller<'_> {
    pub async fn poll(
        &self,
        env: &Environment,
        channel: &str,
        last_digest: Option<&str>,
    ) -> Result<PollOutcome, PollError> {
        let repository = env.registry.release_channel_repository();
        let tag = channel_tag(channel);
        let client = self.registries.client(&repository, &env.registry)?;

        let digest = client.digest(&tag).await?;
        if last_digest == Some(digest.as_str()) {
            debug!(channel = %tag, digest = %digest, "Release channel unchanged");
            return Ok(PollOutcome::Unchanged);
        }

        let image = client.image(&tag).await?;
        let release = ChannelRelease::decode(&image.layers, &image.labels)?;
        info!(channel = %tag, version = %release.version, digest = %image.digest, "Release channel moved");

        let mut existing = self.existing_releases().await?;
        existing.sort_by(|a, b| b.version.cmp(&a.version));

        let mut older = Vec::new();
        for view in existing {
            if view.version > release.version {
                if view.phase == Phase::Pending {
                    info!(release = %view.name, "Deleting pending release newer than the channel");
                    self.cluster.delete_release(&view.name).await?;
                }
                continue;
            }
            if view.version == release.version {
                self.reconcile_suspend(&view, release.metadata.suspend).await?;
                return Ok(PollOutcome::Reconciled {
                    digest: image.digest,
                });
            }
            older.push(view);
        }

        let source = format!("{repository}:{tag}");
        if tag == LTS_CHANNEL {
            debug!(version = %release.version, "LTS channel may skip minors");
        } else {
            self.create_intermediate(env, client.as_ref(), &release.version, &mut older, &source)
                .await?;
        }
        self.create(env, &release, &older, &source).await?;

        Ok(PollOutcome::Reconciled {
            digest: image.digest,
        })
    }

    async fn existing_releases(&self) -> Result<Vec<ReleaseView>, PollError> {
        Ok(self
            .cluster
            .list_releases()
            .await?
            .iter()
            .filter_map(|r| ReleaseView::from_release(r).ok())
            .collect())
    }

    async fn reconcile_suspend(&self, view: &ReleaseView, suspend: bool) -> Result<(), PollError> {
        if suspend {
            if view.phase == Phase::Pending && !view.flags.suspended {
                info!(release = %view.name, "Channel suspended release");
                let annotations =
                    BTreeMap::from([(ANNOTATION_SUSPENDED.to_string(), Some("true".to_string()))]);
                self.cluster
                    .patch_release_annotations(&view.name, &annotations)
                    .await?;
            }
            return Ok(());
        }

        if view.flags.suspended {
            let annotations = BTreeMap::from([(ANNOTATION_SUSPENDED.to_string(), None)]);
            self.cluster
                .patch_release_annotations(&view.name, &annotations)
                .await?;
        }
        if view.phase == Phase::Suspended {
            info!(release = %view.name, "Channel resumed release");
            let patch = StatusPatch {
                phase: Some(Phase::Pending),
                message: Some(String::new()),
                approved: None,
                transition_time: Some(self.clock.now()),
            };
            self.cluster.patch_release_status(&view.name, &patch).await?;
        }
        Ok(())
    }

    /// Create the highest patch of every minor between the newest existing
    /// release of the same major and `target`
    async fn create_intermediate(
        &self,
        env: &Environment,
        client: &dyn RegistryClient,
        target: &Version,
        older: &mut Vec<ReleaseView>,
        source: &str,
    ) -> Result<(), PollError> {
        let Some(newest) = older
            .iter()
            .filter(|v| v.version.major == target.major)
            .map(|v| v.version.clone())
            .max()
        else {
            return Ok(());
        };
        if newest.minor + 1 >= target.minor {
            return Ok(());
        }

        let label = version_tag(target);
        let result = self
            .fetch_intermediate(env, client, &newest, target, older, source)
            .await;
        self.metrics.set_updating_failed(&label, result.is_err());
        result.map_err(|e| PollError::StepByStep {
            version: target.clone(),
            source: Box::new(e),
        })
    }

    async fn fetch_intermediate(
        &self,
        env: &Environment,
        client: &dyn RegistryClient,
        newest: &Version,
        target: &Version,
        older: &mut Vec<ReleaseView>,
        source: &str,
    ) -> Result<(), PollError> {
        let tags = client.list_tags().await?;
        let versions: Vec<Version> = tags.iter().filter_map(|t| strict_version(t)).collect();

        for minor in newest.minor + 1..target.minor {
            let Some(highest) = versions
                .iter()
                .filter(|v| v.major == target.major && v.minor == minor)
                .max()
            else {
                return Err(PollError::MissingMinor(format!("{}.{}", target.major, minor)));
            };

            let image = client.image(&version_tag(highest)).await?;
            let release = ChannelRelease::decode(&image.layers, &image.labels)?;
            info!(version = %release.version, "Creating intermediate release");
            let created = self.create(env, &release, older, source).await?;
            older.push(created);
        }
        Ok(())
    }

    async fn create(
        &self,
        env: &Environment,
        release: &ChannelRelease,
        older: &[ReleaseView],
        source: &str,
    ) -> Result<ReleaseView, PollError> {
        let now = self.clock.now();
        let object = build_release(env, release, older, source, now);
        self.cluster.create_release(&object).await?;
        info!(
            release = %release_name(&release.version),
            apply_after = ?object.spec.apply_after,
            "Release created"
        );
        ReleaseView::from_release(&object).map_err(|source| PollError::InvalidVersion {
            version: object.spec.version.clone(),
            source,
        })
    }
}

/// Only plain `vMAJOR.MINOR.PATCH` tags take part in step-by-step updates
fn strict_version(tag: &str) -> Option<Version> {
    let core = tag.strip_prefix('v')?;
    let parts: Vec<&str> = core.split('.').collect();
    if parts.len() != 3
        || parts
            .iter()
            .any(|p| p.is_empty() || !p.bytes().all(|b| b.is_ascii_digit()))
    {
        return None;
    }
    Version::parse(core).ok()
}

fn build_release(
    env: &Environment,
    release: &ChannelRelease,
    older: &[ReleaseView],
    source: &str,
    now: DateTime<Utc>,
) -> DeckhouseRelease {
    let version = &release.version;
    let metadata = &release.metadata;
    let same_minor: Vec<&ReleaseView> = older
        .iter()
        .filter(|v| v.same_minor(version) && v.version < *version)
        .collect();

    let cooldown = metadata.cooldown.or_else(|| {
        same_minor
            .iter()
            .max_by(|a, b| a.version.cmp(&b.version))
            .and_then(|v| v.flags.cooldown)
    });

    let shifted = same_minor
        .iter()
        .filter(|v| v.flags.notification_time_shift)
        .filter_map(|v| v.apply_after)
        .filter(|at| *at > now)
        .max();

    let apply_after = shifted.or_else(|| {
        let channel = env.policy.release_channel.as_deref().map(channel_tag)?;
        let canary = metadata.canary.get(&channel)?;
        let base = cooldown.map_or(now, |c| c.max(now));
        canary_apply_after(canary, &env.cluster_uuid, &metadata.version, base)
    });

    let mut annotations = BTreeMap::from([(
        ANNOTATION_CHANGE_CAUSE.to_string(),
        format!("check release ({source})"),
    )]);
    if metadata.suspend {
        annotations.insert(ANNOTATION_SUSPENDED.to_string(), "true".to_string());
    }
    if let Some(cooldown) = cooldown {
        annotations.insert(ANNOTATION_COOLDOWN.to_string(), format_time(cooldown));
    }
    if shifted.is_some() {
        annotations.insert(
            ANNOTATION_NOTIFICATION_TIME_SHIFT.to_string(),
            "true".to_string(),
        );
    }

    let mut object = DeckhouseRelease::new(
        &release_name(version),
        DeckhouseReleaseSpec {
            version: version_tag(version),
            apply_after: apply_after.map(format_time),
            requirements: metadata.requirements.clone(),
            disruptions: metadata.disruptions_for(version),
            changelog: filter_changelog(&metadata.changelog, &env.enabled_modules),
            changelog_link: Some(changelog_link(version)),
            approved: false,
        },
    );
    object.metadata.annotations = Some(annotations);
    if metadata.suspend {
        warn!(version = %version, "Release is created suspended");
    }
    object
}

#[cfg(test)]
#[path = "poller_test.rs"]
mod tests;
