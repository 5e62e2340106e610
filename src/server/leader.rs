//! Leader election for multi-replica safety
//!
//! Only the holder of the Lease runs ticks; a second replica of the
//! controller waits until the lease expires.

use crate::config::DEFAULT_NAMESPACE;
use crate::server::ShutdownSignal;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use kube::Client;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Lease guarding the release controller
pub const LEASE_NAME: &str = "deckhouse-release-controller-leader";

/// Default lease TTL (how long leadership is valid)
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(15);

/// Default renew interval (should be ~1/3 of TTL)
pub const DEFAULT_RENEW_INTERVAL: Duration = Duration::from_secs(5);

/// Leader election configuration
#[derive(Debug, Clone)]
pub struct LeaderConfig {
    /// Unique identifier for this instance (usually pod name)
    pub holder_id: String,
    pub lease_name: String,
    pub lease_namespace: String,
    /// How long leadership is valid (in seconds)
    pub lease_duration_seconds: i32,
    pub renew_interval: Duration,
}

impl LeaderConfig {
    /// Create config from environment variables
    ///
    /// Uses:
    /// - `POD_NAME` for holder_id (falls back to `HOSTNAME`, then a random id)
    /// - `POD_NAMESPACE` for lease_namespace (falls back to `d8-system`)
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let value = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let holder_id = value("POD_NAME")
            .or_else(|| value("HOSTNAME"))
            .unwrap_or_else(|| format!("deckhouse-release-controller-{}", uuid::Uuid::new_v4()));

        Self {
            holder_id,
            lease_name: LEASE_NAME.to_string(),
            lease_namespace: value("POD_NAMESPACE").unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            lease_duration_seconds: i32::try_from(DEFAULT_LEASE_TTL.as_secs()).unwrap_or(15),
            renew_interval: DEFAULT_RENEW_INTERVAL,
        }
    }
}

/// Shared state for leader status
#[derive(Clone)]
pub struct LeaderState {
    is_leader: Arc<AtomicBool>,
}

impl LeaderState {
    /// Create new leader state (initially not leader)
    pub fn new() -> Self {
        Self {
            is_leader: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Check if this instance is currently the leader
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Set by the election loop, or once by main() when election is disabled
    pub fn set_leader(&self, is_leader: bool) {
        self.is_leader.store(is_leader, Ordering::SeqCst);
    }
}

impl Default for LeaderState {
    fn default() -> Self {
        Self::new()
    }
}

/// A lease without renew time or duration counts as expired
pub fn lease_expired(
    renew_time: Option<DateTime<Utc>>,
    duration_seconds: Option<i32>,
    now: DateTime<Utc>,
) -> bool {
    match (renew_time, duration_seconds) {
        (Some(renew), Some(duration)) => now > renew + chrono::Duration::seconds(i64::from(duration)),
        _ => true,
    }
}

/// What to do with the lease on this round
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseStep {
    Create,
    Renew,
    /// Take over an expired or released lease
    Acquire { transitions: i32 },
    /// Someone else holds a live lease
    Follow { holder: Option<String> },
}

pub fn next_step(existing: Option<&LeaseSpec>, holder_id: &str, now: DateTime<Utc>) -> LeaseStep {
    let Some(spec) = existing else {
        return LeaseStep::Create;
    };
    let holder = spec.holder_identity.as_deref().filter(|h| !h.is_empty());
    if holder == Some(holder_id) {
        return LeaseStep::Renew;
    }
    let renewed = spec.renew_time.as_ref().map(|t| t.0);
    if holder.is_none() || lease_expired(renewed, spec.lease_duration_seconds, now) {
        return LeaseStep::Acquire {
            transitions: spec.lease_transitions.unwrap_or(0) + 1,
        };
    }
    LeaseStep::Follow {
        holder: holder.map(str::to_string),
    }
}

fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 409)
}

/// One election round; returns whether this replica leads afterwards
async fn try_acquire_or_renew(api: &Api<Lease>, config: &LeaderConfig) -> Result<bool, kube::Error> {
    let now = Utc::now();
    let existing = api.get_opt(&config.lease_name).await?;
    let step = next_step(
        existing.as_ref().and_then(|l| l.spec.as_ref()),
        &config.holder_id,
        now,
    );

    let spec = match &step {
        LeaseStep::Follow { holder } => {
            debug!(holder = ?holder, "Lease held by another replica");
            return Ok(false);
        }
        LeaseStep::Renew => serde_json::json!({
            "renewTime": MicroTime(now),
            "leaseDurationSeconds": config.lease_duration_seconds,
        }),
        LeaseStep::Acquire { transitions } => serde_json::json!({
            "holderIdentity": config.holder_id,
            "acquireTime": MicroTime(now),
            "renewTime": MicroTime(now),
            "leaseDurationSeconds": config.lease_duration_seconds,
            "leaseTransitions": transitions,
        }),
        LeaseStep::Create => {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(config.lease_name.clone()),
                    namespace: Some(config.lease_namespace.clone()),
                    ..Default::default()
                },
                #[allow(clippy::needless_update)]
                spec: Some(LeaseSpec {
                    holder_identity: Some(config.holder_id.clone()),
                    acquire_time: Some(MicroTime(now)),
                    renew_time: Some(MicroTime(now)),
                    lease_duration_seconds: Some(config.lease_duration_seconds),
                    lease_transitions: Some(0),
                    ..Default::default()
                }),
            };
            return match api.create(&PostParams::default(), &lease).await {
                Ok(_) => Ok(true),
                Err(e) if is_conflict(&e) => {
                    debug!("Lease created concurrently by another replica");
                    Ok(false)
                }
                Err(e) => Err(e),
            };
        }
    };

    // The resource version makes the takeover conditional on the lease we read
    let mut patch = serde_json::json!({ "spec": spec });
    if let Some(version) = existing.and_then(|l| l.metadata.resource_version) {
        patch["metadata"] = serde_json::json!({ "resourceVersion": version });
    }
    match api
        .patch(&config.lease_name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => Ok(true),
        Err(e) if is_conflict(&e) => {
            debug!(step = ?step, "Lease changed while updating it");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// Hand the lease over on shutdown so a standby replica does not wait out the TTL
async fn release_lease(api: &Api<Lease>, config: &LeaderConfig) -> Result<(), kube::Error> {
    let patch = serde_json::json!({
        "spec": { "holderIdentity": null, "renewTime": null }
    });
    api.patch(&config.lease_name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Keep `state` in sync with lease ownership until shutdown
pub async fn run_leader_election(
    client: Client,
    config: LeaderConfig,
    state: LeaderState,
    mut shutdown: ShutdownSignal,
) {
    let api: Api<Lease> = Api::namespaced(client, &config.lease_namespace);
    info!(
        holder_id = %config.holder_id,
        lease = %config.lease_name,
        namespace = %config.lease_namespace,
        "Starting leader election"
    );

    // First round runs immediately
    let mut renew = tokio::time::interval(config.renew_interval);
    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = renew.tick() => {}
        }

        let was_leader = state.is_leader();
        let is_leader = match try_acquire_or_renew(&api, &config).await {
            Ok(is_leader) => is_leader,
            Err(e) => {
                warn!(error = %e, "Leader election round failed");
                false
            }
        };
        state.set_leader(is_leader);
        match (was_leader, is_leader) {
            (false, true) => info!(holder_id = %config.holder_id, "Acquired leadership"),
            (true, false) => warn!(holder_id = %config.holder_id, "Lost leadership"),
            _ => {}
        }
    }

    if state.is_leader() {
        state.set_leader(false);
        match release_lease(&api, &config).await {
            Ok(()) => info!("Released leadership"),
            Err(e) => warn!(error = %e, "Failed to release lease, it will expire"),
        }
    }
    info!("Leader election stopped");
}
