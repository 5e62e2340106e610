//! Release update controller
//!
//! One tick reads the environment, then either follows a floating tag
//! (no release channel) or polls the channel, plans the next step for the
//! release set, applies it and cleans up old releases.

pub mod applier;
pub mod checks;
pub mod clock;
pub mod cluster;
pub mod deployment;
pub mod environment;
pub mod gc;
pub mod memory;
pub mod metadata;
pub mod notification;
pub mod poller;
pub mod reconciler;
pub mod registry;
pub mod release_data;
pub mod runner;
pub mod tag_mode;
pub mod windows;

use crate::config::ControllerConfig;
use crate::controller::applier::Applier;
use crate::controller::checks::CheckRegistry;
use crate::controller::clock::{Clock, SystemClock};
use crate::controller::cluster::{ClusterApi, ClusterError};
use crate::controller::deployment::{DeploymentView, ReadinessProbe};
use crate::controller::environment::{Environment, EnvironmentError, EnvironmentSource};
use crate::controller::notification::Notifier;
use crate::controller::poller::{PollOutcome, ReleasePoller};
use crate::controller::reconciler::{Outcome, Plan, Policy, ReleaseView, Snapshot};
use crate::controller::registry::RegistryFactory;
use crate::controller::tag_mode::{TagModeError, TagModeOutcome, TagModeUpdater};
use crate::server::metrics::SharedMetrics;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, warn};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error("failed to load update settings: {0}")]
    Environment(#[from] EnvironmentError),

    #[error("tag mode: {0}")]
    TagMode(#[from] TagModeError),

    #[error("tick did not finish within {0:?}")]
    Timeout(Duration),
}

/// Result of one successful tick
#[derive(Debug, Clone, PartialEq)]
pub enum TickSummary {
    Tag(TagModeOutcome),
    Channel {
        /// `None` when the channel check failed this tick
        poll: Option<PollOutcome>,
        outcome: Outcome,
    },
}

pub struct Context {
    pub config: ControllerConfig,
    pub cluster: Arc<dyn ClusterApi>,
    pub environment: Arc<dyn EnvironmentSource>,
    pub registries: Arc<dyn RegistryFactory>,
    pub notifier: Arc<dyn Notifier>,
    pub readiness: Arc<dyn ReadinessProbe>,
    pub clock: Arc<dyn Clock>,
    pub checks: CheckRegistry,
    pub metrics: SharedMetrics,
    /// Channel digest of the last successful poll
    last_digest: Mutex<Option<String>>,
}

impl Context {
    pub fn new(
        config: ControllerConfig,
        cluster: Arc<dyn ClusterApi>,
        environment: Arc<dyn EnvironmentSource>,
        registries: Arc<dyn RegistryFactory>,
        notifier: Arc<dyn Notifier>,
        readiness: Arc<dyn ReadinessProbe>,
        metrics: SharedMetrics,
    ) -> Self {
        Context {
            config,
            cluster,
            environment,
            registries,
            notifier,
            readiness,
            clock: Arc::new(SystemClock),
            checks: CheckRegistry::new(),
            metrics,
            last_digest: Mutex::new(None),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_checks(mut self, checks: CheckRegistry) -> Self {
        self.checks = checks;
        self
    }

    pub fn last_digest(&self) -> Option<String> {
        match self.last_digest.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn store_digest(&self, digest: String) {
        match self.last_digest.lock() {
            Ok(mut guard) => *guard = Some(digest),
            Err(poisoned) => *poisoned.into_inner() = Some(digest),
        }
    }
}

/// Run one controller tick and record its metrics
///
/// The tick is cut off after one tick interval; every step is an idempotent
/// patch, so the next tick picks up where this one stopped.
pub async fn run_tick(ctx: &Context) -> Result<TickSummary, ReconcileError> {
    let started = Instant::now();
    let deadline = ctx.config.tick_interval;
    let (path, result) = match tokio::time::timeout(deadline, tick(ctx)).await {
        Ok(done) => done,
        Err(_) => {
            error!(deadline = ?deadline, "Tick exceeded its deadline, abandoning it");
            ("timeout", Err(ReconcileError::Timeout(deadline)))
        }
    };

    let elapsed = started.elapsed().as_secs_f64();
    match &result {
        Ok(_) => ctx.metrics.record_tick_success(path, elapsed),
        Err(_) => ctx.metrics.record_tick_error(path, elapsed),
    }
    result
}

async fn tick(ctx: &Context) -> (&'static str, Result<TickSummary, ReconcileError>) {
    match ctx.environment.load().await {
        Err(e) => ("settings", Err(e.into())),
        Ok(env) => {
            ctx.metrics.set_obsolete_config_versions(
                &env.module_config_versions,
                &ctx.config.module_config_versions,
            );
            match env.policy.release_channel.clone() {
                None => ("tag", tag_tick(ctx, &env).await),
                Some(channel) => ("channel", channel_tick(ctx, &env, &channel).await),
            }
        }
    }
}

async fn tag_tick(ctx: &Context, env: &Environment) -> Result<TickSummary, ReconcileError> {
    let outcome = TagModeUpdater {
        cluster: ctx.cluster.as_ref(),
        registries: ctx.registries.as_ref(),
        clock: ctx.clock.as_ref(),
        metrics: &ctx.metrics,
    }
    .check(&env.registry)
    .await?;
    Ok(TickSummary::Tag(outcome))
}

async fn channel_tick(
    ctx: &Context,
    env: &Environment,
    channel: &str,
) -> Result<TickSummary, ReconcileError> {
    let last = ctx.last_digest();
    let poller = ReleasePoller {
        cluster: ctx.cluster.as_ref(),
        registries: ctx.registries.as_ref(),
        clock: ctx.clock.as_ref(),
        metrics: &ctx.metrics,
    };
    let poll = match poller.poll(env, channel, last.as_deref()).await {
        Ok(outcome) => {
            if let PollOutcome::Reconciled { digest } = &outcome {
                ctx.store_digest(digest.clone());
            }
            Some(outcome)
        }
        Err(e) => {
            warn!(channel = %channel, error = %e, "Release channel check failed");
            ctx.metrics.record_release_check_error(e.reason());
            None
        }
    };

    let now = ctx.clock.now();
    let releases = ctx.cluster.list_releases().await?;
    let release_data = ctx.cluster.release_data().await?;
    let image = match ctx.cluster.deployment_image().await {
        Ok(image) => image,
        Err(e) => {
            error!(error = %e, "Cannot read the Deckhouse deployment, nothing is applied");
            return Err(e.into());
        }
    };
    let deployment = DeploymentView {
        image,
        pods: ctx.cluster.list_controller_pods().await?,
        endpoint_ready: ctx.readiness.is_ready().await,
    };

    let snapshot = Snapshot::new(
        now,
        &releases,
        release_data,
        deployment.is_ready(),
        env.bootstrapped,
    );
    let policy = Policy {
        update: &env.policy,
        checks: &ctx.checks,
        values: &env.values,
    };
    let plan = reconciler::plan(&snapshot, &policy);
    record_plan(ctx, channel, &plan);

    Applier {
        cluster: ctx.cluster.as_ref(),
        notifier: ctx.notifier.as_ref(),
        registry: &env.registry,
    }
    .apply(&plan)
    .await?;

    let views: Vec<ReleaseView> = ctx
        .cluster
        .list_releases()
        .await?
        .iter()
        .filter_map(|r| ReleaseView::from_release(r).ok())
        .collect();
    let cleanup = gc::plan_cleanup(&views, now, ctx.config.outdated_grace);
    gc::run_cleanup(ctx.cluster.as_ref(), &cleanup, now).await?;

    debug!(outcome = ?plan.outcome, actions = plan.actions.len(), "Tick finished");
    Ok(TickSummary::Channel {
        poll,
        outcome: plan.outcome,
    })
}

fn record_plan(ctx: &Context, channel: &str, plan: &Plan) {
    ctx.metrics.reset_release_gauges();
    for (name, reason) in &plan.blocked {
        ctx.metrics.set_release_blocked(name, reason.as_str());
    }
    if let Some(name) = &plan.waiting_manual {
        ctx.metrics.set_waiting_manual(name);
    }
    ctx.metrics.set_is_updating(channel, plan.is_updating);
}

#[cfg(test)]
#[path = "tick_test.rs"]
mod tests;
