//! In-memory implementations of the controller seams
//!
//! Used by unit and integration tests to drive full ticks without a cluster,
//! a registry or a webhook receiver.

use crate::config::{NotificationConfig, UpdatePolicy};
use crate::controller::cluster::{format_time, ClusterApi, ClusterError, StatusPatch};
use crate::controller::deployment::{PodView, ReadinessProbe};
use crate::controller::environment::{Environment, EnvironmentError, EnvironmentSource};
use crate::controller::notification::{NotificationError, Notifier, WebhookPayload};
use crate::controller::registry::{
    sha256_digest, RegistryClient, RegistryError, RegistryFactory, RegistrySettings, ReleaseImage,
    Scheme,
};
use crate::controller::release_data::ReleaseData;
use crate::crd::release::{DeckhouseRelease, ANNOTATION_NOTIFICATION_TIME_SHIFT};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Build an uncompressed tar layer from `(path, content)` pairs
pub fn tar_layer(files: &[(&str, &[u8])]) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, *content)?;
    }
    builder.into_inner()
}

#[derive(Debug, Default)]
struct ClusterState {
    releases: BTreeMap<String, DeckhouseRelease>,
    release_data: ReleaseData,
    deployment_image: Option<String>,
    pods: Vec<PodView>,
    restarts: Vec<DateTime<Utc>>,
    image_history: Vec<String>,
}

/// Cluster held in memory; writes behave like the merge patches the API server applies
#[derive(Debug, Default)]
pub struct InMemoryCluster {
    state: Mutex<ClusterState>,
    stalled: AtomicBool,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deployment(image: &str) -> Self {
        let cluster = Self::default();
        lock(&cluster.state).deployment_image = Some(image.to_string());
        cluster
    }

    /// Make reads hang forever, like an API server that accepts the connection and never answers
    pub fn stall(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    async fn wait_if_stalled(&self) {
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }

    pub fn insert_release(&self, release: DeckhouseRelease) {
        let name = release.metadata.name.clone().unwrap_or_default();
        lock(&self.state).releases.insert(name, release);
    }

    pub fn release(&self, name: &str) -> Option<DeckhouseRelease> {
        lock(&self.state).releases.get(name).cloned()
    }

    pub fn releases(&self) -> Vec<DeckhouseRelease> {
        lock(&self.state).releases.values().cloned().collect()
    }

    pub fn set_pods(&self, pods: Vec<PodView>) {
        lock(&self.state).pods = pods;
    }

    pub fn set_release_data(&self, data: ReleaseData) {
        lock(&self.state).release_data = data;
    }

    pub fn stored_release_data(&self) -> ReleaseData {
        lock(&self.state).release_data.clone()
    }

    pub fn current_image(&self) -> Option<String> {
        lock(&self.state).deployment_image.clone()
    }

    /// Every image written by `set_deployment_image`, in order
    pub fn image_history(&self) -> Vec<String> {
        lock(&self.state).image_history.clone()
    }

    pub fn restarts(&self) -> Vec<DateTime<Utc>> {
        lock(&self.state).restarts.clone()
    }

    /// Mark every pod ready on the current deployment image
    pub fn roll_pods(&self) {
        let mut state = lock(&self.state);
        let image = state.deployment_image.clone().unwrap_or_default();
        for pod in state.pods.iter_mut() {
            pod.image = image.clone();
            pod.ready = true;
        }
    }
}

fn release_mut<'a>(
    state: &'a mut ClusterState,
    name: &str,
) -> Result<&'a mut DeckhouseRelease, ClusterError> {
    state
        .releases
        .get_mut(name)
        .ok_or_else(|| ClusterError::ReleaseNotFound(name.to_string()))
}

#[async_trait]
impl ClusterApi for InMemoryCluster {
    async fn list_releases(&self) -> Result<Vec<DeckhouseRelease>, ClusterError> {
        self.wait_if_stalled().await;
        Ok(self.releases())
    }

    async fn create_release(&self, release: &DeckhouseRelease) -> Result<(), ClusterError> {
        let name = release.metadata.name.clone().unwrap_or_default();
        lock(&self.state)
            .releases
            .entry(name)
            .or_insert_with(|| release.clone());
        Ok(())
    }

    async fn delete_release(&self, name: &str) -> Result<(), ClusterError> {
        lock(&self.state).releases.remove(name);
        Ok(())
    }

    async fn patch_release_status(
        &self,
        name: &str,
        patch: &StatusPatch,
    ) -> Result<(), ClusterError> {
        let mut state = lock(&self.state);
        patch.apply_to(release_mut(&mut state, name)?);
        Ok(())
    }

    async fn patch_release_annotations(
        &self,
        name: &str,
        annotations: &BTreeMap<String, Option<String>>,
    ) -> Result<(), ClusterError> {
        let mut state = lock(&self.state);
        let release = release_mut(&mut state, name)?;
        let current = release.metadata.annotations.get_or_insert_with(BTreeMap::new);
        for (key, value) in annotations {
            match value {
                Some(value) => {
                    current.insert(key.clone(), value.clone());
                }
                None => {
                    current.remove(key);
                }
            }
        }
        Ok(())
    }

    async fn patch_release_apply_after(
        &self,
        name: &str,
        apply_after: DateTime<Utc>,
    ) -> Result<(), ClusterError> {
        let mut state = lock(&self.state);
        let release = release_mut(&mut state, name)?;
        release.spec.apply_after = Some(format_time(apply_after));
        release
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(ANNOTATION_NOTIFICATION_TIME_SHIFT.to_string(), "true".to_string());
        Ok(())
    }

    async fn release_data(&self) -> Result<ReleaseData, ClusterError> {
        Ok(self.stored_release_data())
    }

    async fn save_release_data(&self, data: &ReleaseData) -> Result<(), ClusterError> {
        lock(&self.state).release_data = data.clone();
        Ok(())
    }

    async fn deployment_image(&self) -> Result<String, ClusterError> {
        self.current_image()
            .ok_or_else(|| ClusterError::DeploymentNotFound("deckhouse".to_string()))
    }

    async fn set_deployment_image(&self, image: &str) -> Result<(), ClusterError> {
        let mut state = lock(&self.state);
        if state.deployment_image.is_none() {
            return Err(ClusterError::DeploymentNotFound("deckhouse".to_string()));
        }
        state.deployment_image = Some(image.to_string());
        state.image_history.push(image.to_string());
        Ok(())
    }

    async fn restart_deployment(&self, at: DateTime<Utc>) -> Result<(), ClusterError> {
        lock(&self.state).restarts.push(at);
        Ok(())
    }

    async fn list_controller_pods(&self) -> Result<Vec<PodView>, ClusterError> {
        self.wait_if_stalled().await;
        Ok(lock(&self.state)
            .pods
            .iter()
            .filter(|p| !p.is_failed())
            .cloned()
            .collect())
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    images: BTreeMap<String, ReleaseImage>,
    extra_tags: BTreeSet<String>,
    fail: bool,
    image_pulls: usize,
}

/// Registry serving prepared images by tag
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    state: Mutex<RegistryState>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish an image under `tag`; the digest is derived from the layers
    pub fn push(&self, tag: &str, layers: Vec<Vec<u8>>, labels: BTreeMap<String, String>) {
        let digest = sha256_digest(&layers.concat());
        lock(&self.state).images.insert(
            tag.to_string(),
            ReleaseImage {
                digest,
                labels,
                layers,
            },
        );
    }

    /// A tag listed by the registry without an image behind it
    pub fn add_tag(&self, tag: &str) {
        lock(&self.state).extra_tags.insert(tag.to_string());
    }

    pub fn fail(&self, fail: bool) {
        lock(&self.state).fail = fail;
    }

    /// Number of full image pulls served
    pub fn image_pulls(&self) -> usize {
        lock(&self.state).image_pulls
    }

    fn check(&self) -> Result<MutexGuard<'_, RegistryState>, RegistryError> {
        let state = lock(&self.state);
        if state.fail {
            return Err(RegistryError::Status {
                status: 503,
                url: "memory".to_string(),
            });
        }
        Ok(state)
    }

    fn not_found(tag: &str) -> RegistryError {
        RegistryError::Status {
            status: 404,
            url: format!("memory/{tag}"),
        }
    }
}

#[async_trait]
impl RegistryClient for InMemoryRegistry {
    async fn image(&self, tag: &str) -> Result<ReleaseImage, RegistryError> {
        let mut state = self.check()?;
        let image = state.images.get(tag).cloned().ok_or_else(|| Self::not_found(tag))?;
        state.image_pulls += 1;
        Ok(image)
    }

    async fn digest(&self, tag: &str) -> Result<String, RegistryError> {
        self.check()?
            .images
            .get(tag)
            .map(|i| i.digest.clone())
            .ok_or_else(|| Self::not_found(tag))
    }

    async fn list_tags(&self) -> Result<Vec<String>, RegistryError> {
        let state = self.check()?;
        Ok(state
            .images
            .keys()
            .chain(state.extra_tags.iter())
            .cloned()
            .collect())
    }
}

/// Hands out the same registry for every repository and records which were asked for
#[derive(Default)]
pub struct InMemoryRegistryFactory {
    registry: Arc<InMemoryRegistry>,
    repositories: Mutex<Vec<String>>,
}

impl InMemoryRegistryFactory {
    pub fn new(registry: Arc<InMemoryRegistry>) -> Self {
        Self {
            registry,
            repositories: Mutex::new(Vec::new()),
        }
    }

    pub fn repositories(&self) -> Vec<String> {
        lock(&self.repositories).clone()
    }
}

impl RegistryFactory for InMemoryRegistryFactory {
    fn client(
        &self,
        repository: &str,
        _settings: &RegistrySettings,
    ) -> Result<Arc<dyn RegistryClient>, RegistryError> {
        lock(&self.repositories).push(repository.to_string());
        Ok(self.registry.clone())
    }
}

/// Notifier that records payloads instead of posting them
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<WebhookPayload>>,
    fail: AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<WebhookPayload> {
        lock(&self.sent).clone()
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(
        &self,
        _config: &NotificationConfig,
        payload: &WebhookPayload,
    ) -> Result<(), NotificationError> {
        lock(&self.sent).push(payload.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(NotificationError::Status {
                status: 500,
                body: "unavailable".to_string(),
            });
        }
        Ok(())
    }
}

/// Readiness probe with a switchable answer
#[derive(Debug)]
pub struct StaticReadiness(AtomicBool);

impl StaticReadiness {
    pub fn new(ready: bool) -> Self {
        Self(AtomicBool::new(ready))
    }

    pub fn set(&self, ready: bool) {
        self.0.store(ready, Ordering::SeqCst);
    }
}

#[async_trait]
impl ReadinessProbe for StaticReadiness {
    async fn is_ready(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Environment that can be edited between ticks
pub struct StaticEnvironment {
    environment: Mutex<Environment>,
}

impl StaticEnvironment {
    pub fn new(environment: Environment) -> Self {
        Self {
            environment: Mutex::new(environment),
        }
    }

    pub fn update(&self, edit: impl FnOnce(&mut Environment)) {
        edit(&mut lock(&self.environment));
    }
}

#[async_trait]
impl EnvironmentSource for StaticEnvironment {
    async fn load(&self) -> Result<Environment, EnvironmentError> {
        Ok(lock(&self.environment).clone())
    }
}

/// Environment for a bootstrapped cluster on `channel` with default settings
pub fn test_environment(channel: Option<&str>) -> Environment {
    Environment {
        policy: UpdatePolicy {
            release_channel: channel.map(str::to_string),
            ..Default::default()
        },
        values: BTreeMap::from([(
            crate::controller::checks::KUBERNETES_VERSION_KEY.to_string(),
            "v1.30.2".to_string(),
        )]),
        enabled_modules: BTreeSet::new(),
        module_config_versions: BTreeMap::new(),
        registry: RegistrySettings {
            base: "registry.example.com/deckhouse".to_string(),
            docker_config: None,
            ca: None,
            scheme: Scheme::Https,
            user_agent: "test".to_string(),
            timeout: Duration::from_secs(5),
        },
        cluster_uuid: "00000000-0000-0000-0000-000000000000".to_string(),
        bootstrapped: true,
    }
}
