//! Tag-mode updater
//!
//! Without a release channel the deployment follows a floating tag. When the
//! registry digest for that tag differs from the digest the pods run, the
//! deployment is restarted so the new image gets pulled.

use crate::controller::clock::Clock;
use crate::controller::cluster::{ClusterApi, ClusterError};
use crate::controller::deployment::PodView;
use crate::controller::registry::{RegistryError, RegistryFactory, RegistrySettings};
use crate::server::metrics::ControllerMetrics;
use thiserror::Error;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum TagModeError {
    #[error("cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("pods disagree on image: {0}")]
    PodsDisagree(String),

    #[error("cannot parse image reference {0:?}")]
    InvalidImage(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagModeOutcome {
    /// Pods are missing or still rolling
    Waiting,
    UpToDate,
    Restarted,
}

/// `repo:tag` split; a port in the registry host is not a tag
pub fn split_image(image: &str) -> Option<(&str, &str)> {
    let slash = image.rfind('/').map_or(0, |i| i + 1);
    let colon = image[slash..].rfind(':')? + slash;
    let (repo, tag) = (&image[..colon], &image[colon + 1..]);
    (!repo.is_empty() && !tag.is_empty()).then_some((repo, tag))
}

/// Digest part of an imageID such as `docker-pullable://repo@sha256:...`
pub fn image_id_digest(image_id: &str) -> Option<&str> {
    image_id
        .rsplit_once('@')
        .map(|(_, digest)| digest)
        .filter(|d| !d.is_empty())
}

/// The single image/imageID all pods agree on; `None` while a pod is mid-restart
///
/// Readiness does not matter here: a crash-looping pod still gets a newer digest.
fn running_image(pods: &[PodView]) -> Result<Option<(String, String)>, TagModeError> {
    let Some(first) = pods.first() else {
        return Ok(None);
    };
    if pods
        .iter()
        .any(|p| p.image.is_empty() || p.image_id.is_empty())
    {
        return Ok(None);
    }
    if let Some(other) = pods
        .iter()
        .find(|p| p.image != first.image || p.image_id != first.image_id)
    {
        return Err(TagModeError::PodsDisagree(format!(
            "{} runs {} ({}), {} runs {} ({})",
            first.name, first.image, first.image_id, other.name, other.image, other.image_id
        )));
    }
    Ok(Some((first.image.clone(), first.image_id.clone())))
}

pub struct TagModeUpdater<'a> {
    pub cluster: &'a dyn ClusterApi,
    pub registries: &'a dyn RegistryFactory,
    pub clock: &'a dyn Clock,
    pub metrics: &'a ControllerMetrics,
}

impl TagModeUpdater<'_> {
    pub async fn check(&self, settings: &RegistrySettings) -> Result<TagModeOutcome, TagModeError> {
        let pods = self.cluster.list_controller_pods().await?;
        let (image, image_id) = match running_image(&pods) {
            Ok(Some(running)) => running,
            Ok(None) => {
                debug!(pods = pods.len(), "Deckhouse pods are not settled, waiting");
                return Ok(TagModeOutcome::Waiting);
            }
            Err(e) => {
                error!(error = %e, "Refusing to update while pods run different images");
                return Err(e);
            }
        };

        let (repository, tag) =
            split_image(&image).ok_or_else(|| TagModeError::InvalidImage(image.clone()))?;
        let running_digest =
            image_id_digest(&image_id).ok_or_else(|| TagModeError::InvalidImage(image_id.clone()))?;

        let registry_digest = match self.registry_digest(repository, tag, settings).await {
            Ok(digest) => {
                self.metrics.record_registry_check(true);
                digest
            }
            Err(e) => {
                self.metrics.record_registry_check(false);
                return Err(e.into());
            }
        };

        if registry_digest == running_digest {
            debug!(image = %image, digest = %running_digest, "Image is up to date");
            return Ok(TagModeOutcome::UpToDate);
        }

        info!(
            image = %image,
            running = %running_digest,
            registry = %registry_digest,
            "New image digest for tag, restarting deployment"
        );
        self.cluster.restart_deployment(self.clock.now()).await?;
        Ok(TagModeOutcome::Restarted)
    }

    async fn registry_digest(
        &self,
        repository: &str,
        tag: &str,
        settings: &RegistrySettings,
    ) -> Result<String, RegistryError> {
        let client = self.registries.client(repository, settings)?;
        client.digest(tag).await
    }
}
