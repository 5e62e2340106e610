//! Per-tick cluster inputs: update settings, registry access, discovery values

use crate::config::{SettingsError, UpdatePolicy};
use crate::controller::checks::KUBERNETES_VERSION_KEY;
use crate::controller::registry::{RegistrySettings, Scheme};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::{Api, ListParams};
use kube::core::{DynamicObject, GroupVersionKind};
use kube::discovery::ApiResource;
use kube::Client;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

pub const ENABLED_MODULES_KEY: &str = "global.enabledModules";

const DECKHOUSE_MODULE: &str = "deckhouse";
const REGISTRY_SECRET: &str = "deckhouse-registry";
const DISCOVERY_SECRET: &str = "deckhouse-discovery";
const BOOTSTRAPPED_CONFIGMAP: &str = "d8-cluster-is-bootstraped";

#[derive(Debug, thiserror::Error)]
pub enum EnvironmentError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error("registry secret is not usable: {0}")]
    RegistrySecret(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Environment {
    pub policy: UpdatePolicy,
    /// Flattened values consulted by requirement and disruption checks
    pub values: BTreeMap<String, String>,
    pub enabled_modules: BTreeSet<String>,
    /// Settings version declared by each ModuleConfig
    pub module_config_versions: BTreeMap<String, u32>,
    pub registry: RegistrySettings,
    pub cluster_uuid: String,
    pub bootstrapped: bool,
}

#[async_trait]
pub trait EnvironmentSource: Send + Sync {
    async fn load(&self) -> Result<Environment, EnvironmentError>;
}

/// Reads ModuleConfigs, the registry and discovery secrets, and the
/// bootstrap marker from the cluster
pub struct KubeEnvironment {
    client: Client,
    namespace: String,
    registry_timeout: Duration,
    generated_uuid: Mutex<Option<String>>,
}

impl KubeEnvironment {
    pub fn new(client: Client, namespace: impl Into<String>, registry_timeout: Duration) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            registry_timeout,
            generated_uuid: Mutex::new(None),
        }
    }

    async fn module_configs(&self) -> Result<Vec<DynamicObject>, kube::Error> {
        let gvk = GroupVersionKind::gvk("deckhouse.io", "v1alpha1", "ModuleConfig");
        let resource = ApiResource::from_gvk_with_plural(&gvk, "moduleconfigs");
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &resource);
        match api.list(&ListParams::default()).await {
            Ok(list) => Ok(list.items),
            Err(kube::Error::Api(err)) if err.code == 404 => {
                debug!("ModuleConfig resource is not installed");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    async fn cluster_uuid(&self, secrets: &Api<Secret>) -> Result<String, kube::Error> {
        let discovered = secrets
            .get_opt(DISCOVERY_SECRET)
            .await?
            .and_then(|s| secret_field(&s, "clusterUUID"))
            .filter(|uuid| !uuid.trim().is_empty());
        if let Some(uuid) = discovered {
            return Ok(uuid);
        }

        let mut generated = match self.generated_uuid.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let uuid = generated.get_or_insert_with(|| {
            let uuid = uuid::Uuid::new_v4().to_string();
            warn!(cluster_uuid = %uuid, "Cluster UUID not discovered, using a generated one");
            uuid
        });
        Ok(uuid.clone())
    }
}

#[async_trait]
impl EnvironmentSource for KubeEnvironment {
    async fn load(&self) -> Result<Environment, EnvironmentError> {
        let modules = ModuleConfigs::from_objects(&self.module_configs().await?);
        let policy = UpdatePolicy::from_settings(modules.deckhouse_settings.as_ref())?;

        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        let registry_secret = secrets
            .get_opt(REGISTRY_SECRET)
            .await?
            .ok_or_else(|| EnvironmentError::RegistrySecret(format!("secret {REGISTRY_SECRET} not found")))?;
        let registry = registry_settings(&registry_secret, self.registry_timeout)?;

        let cluster_uuid = self.cluster_uuid(&secrets).await?;

        let configmaps: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        let bootstrapped = configmaps.get_opt(BOOTSTRAPPED_CONFIGMAP).await?.is_some();

        let kubernetes_version = self.client.apiserver_version().await?.git_version;

        let mut values = BTreeMap::new();
        values.insert(KUBERNETES_VERSION_KEY.to_string(), kubernetes_version);
        values.insert(
            ENABLED_MODULES_KEY.to_string(),
            modules.enabled.iter().cloned().collect::<Vec<_>>().join(","),
        );

        Ok(Environment {
            policy,
            values,
            enabled_modules: modules.enabled,
            module_config_versions: modules.versions,
            registry,
            cluster_uuid,
            bootstrapped,
        })
    }
}

/// What the controller needs out of the ModuleConfig list
#[derive(Debug, Default, PartialEq)]
pub struct ModuleConfigs {
    pub enabled: BTreeSet<String>,
    pub versions: BTreeMap<String, u32>,
    pub deckhouse_settings: Option<serde_json::Value>,
}

impl ModuleConfigs {
    pub fn from_objects(objects: &[DynamicObject]) -> Self {
        let mut configs = Self::default();
        for object in objects {
            let Some(name) = object.metadata.name.clone() else {
                continue;
            };
            let spec = object.data.get("spec");

            if spec.and_then(|s| s.get("enabled")).and_then(|v| v.as_bool()) == Some(true) {
                configs.enabled.insert(name.clone());
            }
            if let Some(version) = spec
                .and_then(|s| s.get("version"))
                .and_then(|v| v.as_u64())
                .and_then(|v| u32::try_from(v).ok())
            {
                configs.versions.insert(name.clone(), version);
            }
            if name == DECKHOUSE_MODULE {
                configs.deckhouse_settings = spec.and_then(|s| s.get("settings")).cloned();
            }
        }
        configs
    }
}

fn secret_field(secret: &Secret, key: &str) -> Option<String> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .and_then(|v| String::from_utf8(v.0.clone()).ok())
        .or_else(|| secret.string_data.as_ref().and_then(|d| d.get(key)).cloned())
}

/// Build registry settings from the `deckhouse-registry` secret
pub fn registry_settings(secret: &Secret, timeout: Duration) -> Result<RegistrySettings, EnvironmentError> {
    let address = secret_field(secret, "address").filter(|a| !a.trim().is_empty());
    let path = secret_field(secret, "path").unwrap_or_default();

    let base = match (address, secret_field(secret, "imagesRegistry")) {
        (Some(address), _) => format!(
            "{}/{}",
            address.trim().trim_end_matches('/'),
            path.trim().trim_matches('/')
        )
        .trim_end_matches('/')
        .to_string(),
        (None, Some(images)) if !images.trim().is_empty() => images.trim().to_string(),
        _ => {
            return Err(EnvironmentError::RegistrySecret(
                "neither address nor imagesRegistry is set".to_string(),
            ))
        }
    };

    Ok(RegistrySettings {
        base,
        docker_config: secret_field(secret, ".dockerconfigjson"),
        ca: secret_field(secret, "ca").filter(|ca| !ca.trim().is_empty()),
        scheme: secret_field(secret, "scheme")
            .map(|s| Scheme::parse(&s))
            .unwrap_or_default(),
        user_agent: format!("deckhouse-release-controller/{}", env!("CARGO_PKG_VERSION")),
        timeout,
    })
}
