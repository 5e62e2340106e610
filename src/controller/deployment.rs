//! Live view of the managed deployment and its pods

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use std::time::Duration;
use tracing::debug;

/// Label selecting the platform pods
pub const POD_SELECTOR: &str = "app=deckhouse";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodView {
    pub name: String,
    pub phase: String,
    pub ready: bool,
    /// Image of the first container as requested by the template
    pub image: String,
    /// Runtime-resolved `repo@sha256:...`; empty while the container starts
    pub image_id: String,
}

impl PodView {
    pub fn from_pod(pod: &Pod) -> Self {
        let status = pod.status.as_ref();
        let ready = status
            .and_then(|s| s.conditions.as_ref())
            .is_some_and(|conditions| {
                conditions
                    .iter()
                    .any(|c| c.type_ == "Ready" && c.status == "True")
            });
        let container = status
            .and_then(|s| s.container_statuses.as_ref())
            .and_then(|statuses| statuses.first());
        let spec_image = pod
            .spec
            .as_ref()
            .and_then(|s| s.containers.first())
            .and_then(|c| c.image.clone())
            .unwrap_or_default();

        Self {
            name: pod.metadata.name.clone().unwrap_or_default(),
            phase: status.and_then(|s| s.phase.clone()).unwrap_or_default(),
            ready,
            image: container
                .map(|c| c.image.clone())
                .filter(|i| !i.is_empty())
                .unwrap_or(spec_image),
            image_id: container.map(|c| c.image_id.clone()).unwrap_or_default(),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.phase == "Failed"
    }
}

/// Deployment template image, its pods, and the readiness endpoint result
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeploymentView {
    pub image: String,
    pub pods: Vec<PodView>,
    pub endpoint_ready: bool,
}

impl DeploymentView {
    /// A pod running the template image reports Ready and the endpoint answers
    pub fn is_ready(&self) -> bool {
        self.endpoint_ready
            && self
                .pods
                .iter()
                .any(|p| p.ready && !p.is_failed() && p.image == self.image)
    }
}

#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn is_ready(&self) -> bool;
}

/// GET on the platform pod's readiness URL; no URL means always ready
pub struct HttpReadinessProbe {
    client: reqwest::Client,
    url: Option<String>,
}

impl HttpReadinessProbe {
    pub fn new(url: Option<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            url,
        })
    }
}

#[async_trait]
impl ReadinessProbe for HttpReadinessProbe {
    async fn is_ready(&self) -> bool {
        let Some(url) = &self.url else {
            return true;
        };
        match self.client.get(url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(url = %url, error = %e, "Readiness probe failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ContainerStatus, PodCondition, PodStatus};

    fn pod(ready: bool, image: &str, image_id: &str) -> Pod {
        Pod {
            metadata: kube::api::ObjectMeta {
                name: Some("deckhouse-0".to_string()),
                ..Default::default()
            },
            spec: None,
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..Default::default()
                }]),
                container_statuses: Some(vec![ContainerStatus {
                    name: "deckhouse".to_string(),
                    image: image.to_string(),
                    image_id: image_id.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_pod_view_from_pod() {
        let view = PodView::from_pod(&pod(true, "registry/deckhouse:v1.30.0", "registry/deckhouse@sha256:aa"));

        assert_eq!(view.name, "deckhouse-0");
        assert!(view.ready);
        assert_eq!(view.image, "registry/deckhouse:v1.30.0");
        assert_eq!(view.image_id, "registry/deckhouse@sha256:aa");
        assert!(!view.is_failed());
    }

    #[test]
    fn test_deployment_ready_needs_pod_on_template_image() {
        let ready_old = PodView::from_pod(&pod(true, "registry/deckhouse:v1.29.0", "x"));
        let starting_new = PodView::from_pod(&pod(false, "registry/deckhouse:v1.30.0", ""));

        let mut view = DeploymentView {
            image: "registry/deckhouse:v1.30.0".to_string(),
            pods: vec![ready_old, starting_new],
            endpoint_ready: true,
        };
        assert!(!view.is_ready());

        view.pods[1].ready = true;
        assert!(view.is_ready());

        view.endpoint_ready = false;
        assert!(!view.is_ready());
    }
}
