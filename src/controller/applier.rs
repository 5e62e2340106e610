//! Executes a [`Plan`] against the cluster
//!
//! Every action is an independent, idempotent patch. A failure stops the
//! remaining actions; the next tick re-derives the same plan and resumes.

use crate::controller::cluster::{ClusterApi, ClusterError, StatusPatch};
use crate::controller::notification::Notifier;
use crate::controller::reconciler::{Action, DeployTask, Plan};
use crate::controller::registry::RegistrySettings;
use crate::crd::release::{version_tag, Phase};
use std::collections::BTreeMap;
use tracing::{info, warn};

pub struct Applier<'a> {
    pub cluster: &'a dyn ClusterApi,
    pub notifier: &'a dyn Notifier,
    pub registry: &'a RegistrySettings,
}

impl Applier<'_> {
    pub async fn apply(&self, plan: &Plan) -> Result<(), ClusterError> {
        for action in &plan.actions {
            self.apply_action(action).await?;
        }
        Ok(())
    }

    async fn apply_action(&self, action: &Action) -> Result<(), ClusterError> {
        match action {
            Action::SetStatus { name, patch } => {
                self.cluster.patch_release_status(name, patch).await
            }
            Action::RemoveAnnotations { name, keys } => self.remove_annotations(name, keys).await,
            Action::Notify { config, payload } => {
                // Delivery is best effort; the release data still records the notification
                if let Err(e) = self.notifier.notify(config, payload).await {
                    warn!(
                        version = %payload.version,
                        webhook = %config.webhook,
                        error = %e,
                        "Release notification failed"
                    );
                } else {
                    info!(version = %payload.version, "Release notification sent");
                }
                Ok(())
            }
            Action::ShiftApplyAfter { name, apply_after } => {
                info!(release = %name, apply_after = %apply_after, "Shifting apply time after notification");
                self.cluster.patch_release_apply_after(name, *apply_after).await
            }
            Action::SaveReleaseData(data) => self.cluster.save_release_data(data).await,
            Action::Deploy(task) => self.deploy(task).await,
        }
    }

    async fn remove_annotations(&self, name: &str, keys: &[String]) -> Result<(), ClusterError> {
        if keys.is_empty() {
            return Ok(());
        }
        let annotations: BTreeMap<String, Option<String>> =
            keys.iter().map(|k| (k.clone(), None)).collect();
        self.cluster.patch_release_annotations(name, &annotations).await
    }

    async fn deploy(&self, task: &DeployTask) -> Result<(), ClusterError> {
        let image = self.registry.image_for_tag(&version_tag(&task.version));
        info!(release = %task.release, image = %image, "Applying release");
        self.cluster.set_deployment_image(&image).await?;

        for name in &task.superseded {
            let patch = StatusPatch {
                phase: Some(Phase::Superseded),
                message: Some(String::new()),
                approved: None,
                transition_time: Some(task.at),
            };
            self.cluster.patch_release_status(name, &patch).await?;
            info!(release = %name, "Release superseded");
        }

        let deployed = StatusPatch {
            phase: Some(Phase::Deployed),
            message: Some(String::new()),
            approved: Some(true),
            transition_time: Some(task.at),
        };
        self.cluster
            .patch_release_status(&task.release, &deployed)
            .await?;
        self.remove_annotations(&task.release, &task.remove_annotations)
            .await?;
        self.cluster.save_release_data(&task.release_data).await?;
        info!(release = %task.release, version = %task.version, "Release deployed");
        Ok(())
    }
}
