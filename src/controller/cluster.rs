//! Cluster access used by the controller
//!
//! [`ClusterApi`] covers every read and write the update loop performs, so the
//! planner and applier can run against [`KubeCluster`] in production and the
//! in-memory cluster in tests.

use crate::controller::deployment::{PodView, POD_SELECTOR};
use crate::controller::release_data::{ReleaseData, RELEASE_DATA_NAME};
use crate::crd::release::{
    DeckhouseRelease, Phase, ANNOTATION_NOTIFICATION_TIME_SHIFT,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Field manager for server-side apply
pub const FIELD_MANAGER: &str = "deckhouse-release-controller";

const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("deployment {0} not found")]
    DeploymentNotFound(String),

    #[error("deployment {0} has no containers")]
    ContainerNotFound(String),

    #[error("DeckhouseRelease {0} not found")]
    ReleaseNotFound(String),
}

/// Partial status update; unset fields are left untouched
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusPatch {
    pub phase: Option<Phase>,
    pub message: Option<String>,
    pub approved: Option<bool>,
    pub transition_time: Option<DateTime<Utc>>,
}

impl StatusPatch {
    pub fn is_empty(&self) -> bool {
        self.phase.is_none()
            && self.message.is_none()
            && self.approved.is_none()
            && self.transition_time.is_none()
    }

    /// Merge patch body for the status subresource
    pub fn to_json(&self) -> serde_json::Value {
        let mut status = serde_json::Map::new();
        if let Some(phase) = self.phase {
            status.insert("phase".to_string(), json!(phase.as_str()));
        }
        if let Some(message) = &self.message {
            status.insert("message".to_string(), json!(message));
        }
        if let Some(approved) = self.approved {
            status.insert("approved".to_string(), json!(approved));
        }
        if let Some(at) = self.transition_time {
            status.insert("transitionTime".to_string(), json!(format_time(at)));
        }
        json!({ "status": status })
    }

    /// Apply to an in-memory object, mirroring what the API server does with the merge patch
    pub fn apply_to(&self, release: &mut DeckhouseRelease) {
        let status = release.status.get_or_insert_with(Default::default);
        if let Some(phase) = self.phase {
            status.phase = Some(phase.as_str().to_string());
        }
        if let Some(message) = &self.message {
            status.message = Some(message.clone());
        }
        if let Some(approved) = self.approved {
            status.approved = approved;
        }
        if let Some(at) = self.transition_time {
            status.transition_time = Some(format_time(at));
        }
    }
}

pub fn format_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn list_releases(&self) -> Result<Vec<DeckhouseRelease>, ClusterError>;

    /// Create a release; an existing object with the same name is left as is
    async fn create_release(&self, release: &DeckhouseRelease) -> Result<(), ClusterError>;

    /// Delete a release; a missing object is not an error
    async fn delete_release(&self, name: &str) -> Result<(), ClusterError>;

    async fn patch_release_status(&self, name: &str, patch: &StatusPatch)
        -> Result<(), ClusterError>;

    /// Set (`Some`) or remove (`None`) annotations
    async fn patch_release_annotations(
        &self,
        name: &str,
        annotations: &BTreeMap<String, Option<String>>,
    ) -> Result<(), ClusterError>;

    /// Move `spec.applyAfter` and mark the release as shifted by a notification
    async fn patch_release_apply_after(
        &self,
        name: &str,
        apply_after: DateTime<Utc>,
    ) -> Result<(), ClusterError>;

    async fn release_data(&self) -> Result<ReleaseData, ClusterError>;

    async fn save_release_data(&self, data: &ReleaseData) -> Result<(), ClusterError>;

    /// Image of the first container in the deployment template
    async fn deployment_image(&self) -> Result<String, ClusterError>;

    async fn set_deployment_image(&self, image: &str) -> Result<(), ClusterError>;

    /// Roll the deployment pods without changing the image
    async fn restart_deployment(&self, at: DateTime<Utc>) -> Result<(), ClusterError>;

    /// Platform pods, failed ones excluded
    async fn list_controller_pods(&self) -> Result<Vec<PodView>, ClusterError>;
}

/// [`ClusterApi`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    namespace: String,
    deployment: String,
}

impl KubeCluster {
    pub fn new(client: Client, namespace: impl Into<String>, deployment: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            deployment: deployment.into(),
        }
    }

    fn releases(&self) -> Api<DeckhouseRelease> {
        Api::all(self.client.clone())
    }

    fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    async fn get_deployment(&self) -> Result<Deployment, ClusterError> {
        self.deployments()
            .get_opt(&self.deployment)
            .await?
            .ok_or_else(|| ClusterError::DeploymentNotFound(self.deployment.clone()))
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn list_releases(&self) -> Result<Vec<DeckhouseRelease>, ClusterError> {
        let list = self.releases().list(&ListParams::default()).await?;
        Ok(list.items)
    }

    async fn create_release(&self, release: &DeckhouseRelease) -> Result<(), ClusterError> {
        let name = release.metadata.name.clone().unwrap_or_default();
        match self.releases().create(&PostParams::default(), release).await {
            Ok(_) => {
                info!(release = %name, "DeckhouseRelease created");
                Ok(())
            }
            Err(kube::Error::Api(err)) if err.code == 409 => {
                debug!(release = %name, "DeckhouseRelease already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_release(&self, name: &str) -> Result<(), ClusterError> {
        match self.releases().delete(name, &DeleteParams::background()).await {
            Ok(_) => {
                info!(release = %name, "DeckhouseRelease deleted");
                Ok(())
            }
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_release_status(
        &self,
        name: &str,
        patch: &StatusPatch,
    ) -> Result<(), ClusterError> {
        match self
            .releases()
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch.to_json()))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(err)) if err.code == 404 => {
                Err(ClusterError::ReleaseNotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_release_annotations(
        &self,
        name: &str,
        annotations: &BTreeMap<String, Option<String>>,
    ) -> Result<(), ClusterError> {
        if annotations.is_empty() {
            return Ok(());
        }
        let patch = json!({ "metadata": { "annotations": annotations } });
        match self
            .releases()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(err)) if err.code == 404 => {
                Err(ClusterError::ReleaseNotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_release_apply_after(
        &self,
        name: &str,
        apply_after: DateTime<Utc>,
    ) -> Result<(), ClusterError> {
        let patch = json!({
            "metadata": { "annotations": { ANNOTATION_NOTIFICATION_TIME_SHIFT: "true" } },
            "spec": { "applyAfter": format_time(apply_after) },
        });
        match self
            .releases()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(err)) if err.code == 404 => {
                Err(ClusterError::ReleaseNotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn release_data(&self) -> Result<ReleaseData, ClusterError> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        let data = api
            .get_opt(RELEASE_DATA_NAME)
            .await?
            .and_then(|cm| cm.data)
            .unwrap_or_default();
        Ok(ReleaseData::from_map(&data))
    }

    async fn save_release_data(&self, data: &ReleaseData) -> Result<(), ClusterError> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        let cm = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": RELEASE_DATA_NAME, "namespace": self.namespace },
            "data": data.to_map(),
        });
        api.patch(
            RELEASE_DATA_NAME,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&cm),
        )
        .await?;
        Ok(())
    }

    async fn deployment_image(&self) -> Result<String, ClusterError> {
        let deployment = self.get_deployment().await?;
        deployment
            .spec
            .and_then(|s| s.template.spec)
            .and_then(|s| s.containers.into_iter().next())
            .map(|c| c.image.unwrap_or_default())
            .ok_or_else(|| ClusterError::ContainerNotFound(self.deployment.clone()))
    }

    async fn set_deployment_image(&self, image: &str) -> Result<(), ClusterError> {
        let deployment = self.get_deployment().await?;
        let container = deployment
            .spec
            .and_then(|s| s.template.spec)
            .and_then(|s| s.containers.into_iter().next())
            .ok_or_else(|| ClusterError::ContainerNotFound(self.deployment.clone()))?;

        let patch = json!({
            "spec": { "template": { "spec": { "containers": [
                { "name": container.name, "image": image }
            ] } } }
        });
        self.deployments()
            .patch(&self.deployment, &PatchParams::default(), &Patch::Strategic(&patch))
            .await?;
        info!(deployment = %self.deployment, image = %image, "Deployment image updated");
        Ok(())
    }

    async fn restart_deployment(&self, at: DateTime<Utc>) -> Result<(), ClusterError> {
        let patch = json!({
            "spec": { "template": { "metadata": { "annotations": {
                RESTARTED_AT_ANNOTATION: format_time(at)
            } } } }
        });
        match self
            .deployments()
            .patch(&self.deployment, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => {
                info!(deployment = %self.deployment, "Deployment restarted");
                Ok(())
            }
            Err(kube::Error::Api(err)) if err.code == 404 => {
                Err(ClusterError::DeploymentNotFound(self.deployment.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list_controller_pods(&self) -> Result<Vec<PodView>, ClusterError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let pods = api
            .list(&ListParams::default().labels(POD_SELECTOR))
            .await?;
        let views: Vec<PodView> = pods
            .items
            .iter()
            .map(PodView::from_pod)
            .filter(|p| !p.is_failed())
            .collect();
        if views.is_empty() {
            warn!(namespace = %self.namespace, "No running platform pods found");
        }
        Ok(views)
    }
}
