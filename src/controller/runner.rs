//! Tick loop and change watchers
//!
//! Ticks run on a fixed interval. Watchers on releases, platform pods and the
//! release-data ConfigMap pull the next tick forward instead of waiting out
//! the interval.

use crate::controller::deployment::POD_SELECTOR;
use crate::controller::release_data::RELEASE_DATA_NAME;
use crate::controller::{run_tick, Context, TickSummary};
use crate::crd::release::DeckhouseRelease;
use crate::server::leader::LeaderState;
use crate::server::ShutdownSignal;
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Run ticks until shutdown is requested
///
/// Only the current leader ticks; other replicas count skipped ticks.
pub async fn run_controller(
    ctx: Arc<Context>,
    leader: LeaderState,
    trigger: Arc<Notify>,
    mut shutdown: ShutdownSignal,
) {
    let mut interval = tokio::time::interval(ctx.config.tick_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(interval = ?ctx.config.tick_interval, "Controller loop started");

    loop {
        tokio::select! {
            _ = shutdown.wait() => {
                info!("Controller loop stopped");
                return;
            }
            _ = interval.tick() => {}
            _ = trigger.notified() => {
                debug!("Tick triggered by a watched change");
                interval.reset();
            }
        }

        if !leader.is_leader() {
            ctx.metrics.record_tick_skipped();
            continue;
        }

        match run_tick(&ctx).await {
            Ok(TickSummary::Tag(outcome)) => debug!(?outcome, "Tag mode tick finished"),
            Ok(TickSummary::Channel { poll, outcome }) => {
                debug!(?poll, ?outcome, "Release channel tick finished")
            }
            Err(e) => warn!(error = %e, "Tick failed, retrying on the next interval"),
        }
    }
}

/// Spawn watchers that wake the controller loop on relevant changes
pub fn spawn_watchers(client: Client, namespace: &str, trigger: Arc<Notify>) -> Vec<JoinHandle<()>> {
    let releases: Api<DeckhouseRelease> = Api::all(client.clone());
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let config_maps: Api<ConfigMap> = Api::namespaced(client, namespace);

    vec![
        spawn_trigger(
            "releases",
            watcher(releases, watcher::Config::default())
                .default_backoff()
                .touched_objects(),
            trigger.clone(),
        ),
        spawn_trigger(
            "pods",
            watcher(pods, watcher::Config::default().labels(POD_SELECTOR))
                .default_backoff()
                .touched_objects(),
            trigger.clone(),
        ),
        spawn_trigger(
            "release-data",
            watcher(
                config_maps,
                watcher::Config::default().fields(&format!("metadata.name={RELEASE_DATA_NAME}")),
            )
            .default_backoff()
            .touched_objects(),
            trigger,
        ),
    ]
}

fn spawn_trigger<S, K>(name: &'static str, stream: S, trigger: Arc<Notify>) -> JoinHandle<()>
where
    S: Stream<Item = Result<K, watcher::Error>> + Send + 'static,
    K: Send + 'static,
{
    tokio::spawn(async move {
        let mut stream = std::pin::pin!(stream);
        while let Some(event) = stream.next().await {
            match event {
                Ok(_) => trigger.notify_one(),
                Err(e) => warn!(watcher = name, error = %e, "Watch failed, backing off"),
            }
        }
        debug!(watcher = name, "Watch stream ended");
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)] // Tests can use unwrap for brevity

    use super::*;
    use crate::config::ControllerConfig;
    use crate::controller::clock::FixedClock;
    use crate::controller::memory::{
        test_environment, InMemoryCluster, InMemoryRegistry, InMemoryRegistryFactory,
        RecordingNotifier, StaticEnvironment, StaticReadiness,
    };
    use crate::server::metrics::create_metrics;
    use crate::server::shutdown_channel;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    fn context(metrics: crate::server::SharedMetrics) -> Arc<Context> {
        let config = ControllerConfig {
            tick_interval: Duration::from_secs(3600),
            ..ControllerConfig::default()
        };
        Arc::new(
            Context::new(
                config,
                Arc::new(InMemoryCluster::new()),
                Arc::new(StaticEnvironment::new(test_environment(Some("Stable")))),
                Arc::new(InMemoryRegistryFactory::new(Arc::new(InMemoryRegistry::new()))),
                Arc::new(RecordingNotifier::new()),
                Arc::new(StaticReadiness::new(true)),
                metrics,
            )
            .with_clock(Arc::new(FixedClock::new(
                Utc.with_ymd_and_hms(2026, 1, 5, 10, 0, 0).unwrap(),
            ))),
        )
    }

    #[tokio::test]
    async fn test_follower_skips_ticks_and_stops_on_shutdown() {
        // ARRANGE
        let metrics = create_metrics().unwrap();
        let ctx = context(metrics.clone());
        let trigger = Arc::new(Notify::new());
        let (stop, signal) = shutdown_channel();
        let handle = tokio::spawn(run_controller(
            ctx,
            LeaderState::new(),
            trigger.clone(),
            signal,
        ));

        // ACT
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.shutdown();
        let finished = tokio::time::timeout(Duration::from_secs(1), handle).await;

        // ASSERT
        assert!(finished.is_ok(), "loop should stop after shutdown");
        assert!(metrics
            .encode()
            .unwrap()
            .contains("d8_release_controller_ticks_total{result=\"skipped\"} 1"));
    }

    #[tokio::test]
    async fn test_trigger_runs_an_extra_tick_for_the_leader() {
        // ARRANGE
        let metrics = create_metrics().unwrap();
        let ctx = context(metrics.clone());
        let leader = LeaderState::new();
        leader.set_leader(true);
        let trigger = Arc::new(Notify::new());
        let (stop, signal) = shutdown_channel();
        let handle = tokio::spawn(run_controller(ctx, leader, trigger.clone(), signal));

        // ACT
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.shutdown();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        // ASSERT
        let output = metrics.encode().unwrap();
        assert!(!output.contains("result=\"skipped\""));
        assert!(output.contains("d8_release_controller_tick_duration_seconds_count{path=\"channel\"} 2"));
    }
}
