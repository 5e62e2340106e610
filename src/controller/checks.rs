//! Requirement and disruption check registries
//!
//! A release lists requirements (`k8s: "1.19"`) and disruption kinds
//! (`ingressNginx`). Each name maps to a pure function evaluated against
//! cluster values; adding a check is a registration, not a reconciler change.

use crate::crd::release::parse_version;
use std::collections::{BTreeMap, HashMap};

/// Key under which the API server version is exposed to checks
pub const KUBERNETES_VERSION_KEY: &str = "global.discovery.kubernetesVersion";

/// Read-only view of cluster values for checks
pub trait ValueGetter: Send + Sync {
    fn get(&self, key: &str) -> Option<&str>;
}

impl ValueGetter for BTreeMap<String, String> {
    fn get(&self, key: &str) -> Option<&str> {
        BTreeMap::get(self, key).map(String::as_str)
    }
}

/// `(required value, getter) -> Ok or reason`
pub type RequirementCheck =
    Box<dyn Fn(&str, &dyn ValueGetter) -> Result<(), String> + Send + Sync>;

/// `getter -> Some(reason)` when the disruption applies to this cluster
pub type DisruptionCheck = Box<dyn Fn(&dyn ValueGetter) -> Option<String> + Send + Sync>;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RequirementError {
    #[error("{0:?} requirement is not registered")]
    NotRegistered(String),

    #[error("{0}")]
    NotMet(String),
}

pub struct CheckRegistry {
    requirements: HashMap<String, RequirementCheck>,
    disruptions: HashMap<String, DisruptionCheck>,
}

impl CheckRegistry {
    /// Registry without any checks
    pub fn empty() -> Self {
        Self {
            requirements: HashMap::new(),
            disruptions: HashMap::new(),
        }
    }

    /// Registry with the built-in checks
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register_requirement("k8s", Box::new(kubernetes_version_check));
        registry
    }

    pub fn register_requirement(&mut self, name: &str, check: RequirementCheck) {
        self.requirements.insert(name.to_string(), check);
    }

    pub fn register_disruption(&mut self, name: &str, check: DisruptionCheck) {
        self.disruptions.insert(name.to_string(), check);
    }

    pub fn check_requirement(
        &self,
        name: &str,
        value: &str,
        getter: &dyn ValueGetter,
    ) -> Result<(), RequirementError> {
        let check = self
            .requirements
            .get(name)
            .ok_or_else(|| RequirementError::NotRegistered(name.to_string()))?;
        check(value, getter).map_err(RequirementError::NotMet)
    }

    /// Unknown disruption kinds never disrupt
    pub fn check_disruption(&self, name: &str, getter: &dyn ValueGetter) -> Option<String> {
        self.disruptions.get(name).and_then(|check| check(getter))
    }
}

impl Default for CheckRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The cluster must run at least the required Kubernetes version
fn kubernetes_version_check(required: &str, getter: &dyn ValueGetter) -> Result<(), String> {
    let required = parse_version(required)
        .map_err(|e| format!("invalid required version {required:?}: {e}"))?;
    let current = getter
        .get(KUBERNETES_VERSION_KEY)
        .ok_or_else(|| "kubernetes version is not discovered yet".to_string())?;
    let current =
        parse_version(current).map_err(|e| format!("invalid cluster version {current:?}: {e}"))?;

    // Compare release numbers only; "1.19.3-eks" satisfies "1.19"
    let core = |v: &semver::Version| (v.major, v.minor, v.patch);
    if core(&current) < core(&required) {
        return Err(format!(
            "current kubernetes version {current} is lower than required {required}"
        ));
    }
    Ok(())
}
