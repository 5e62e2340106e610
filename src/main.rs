use deckhouse_release::config::ControllerConfig;
use deckhouse_release::controller::cluster::KubeCluster;
use deckhouse_release::controller::deployment::HttpReadinessProbe;
use deckhouse_release::controller::environment::KubeEnvironment;
use deckhouse_release::controller::notification::WebhookNotifier;
use deckhouse_release::controller::registry::HttpRegistryFactory;
use deckhouse_release::controller::runner::{run_controller, spawn_watchers};
use deckhouse_release::controller::Context;
use deckhouse_release::server::leader::{run_leader_election, LeaderConfig, LeaderState};
use deckhouse_release::server::{
    create_metrics, run_health_server, shutdown_channel, wait_for_os_signal, ReadinessState,
};
use kube::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Deckhouse release controller");

    let config = match ControllerConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Invalid controller configuration");
            return Err(e.into());
        }
    };

    let readiness = ReadinessState::new();
    let metrics = create_metrics()?;

    // Start health server in background
    let health_readiness = readiness.clone();
    let health_metrics = metrics.clone();
    let health_port = config.health_port;
    tokio::spawn(async move {
        if let Err(e) = run_health_server(health_port, health_readiness, health_metrics).await {
            warn!(error = %e, "Health server failed");
        }
    });

    // Watches hold their connection open; every other call gets a read deadline
    let timeout = config.call_timeout();
    let (client, watch_client) = match connect(timeout).await {
        Ok(clients) => clients,
        Err(e) => {
            error!(error = %e, "Failed to create Kubernetes client");
            return Err(e);
        }
    };
    info!(namespace = %config.namespace, "Connected to Kubernetes cluster");

    let ctx = Arc::new(Context::new(
        config.clone(),
        Arc::new(KubeCluster::new(
            client.clone(),
            config.namespace.clone(),
            config.deployment_name.clone(),
        )),
        Arc::new(KubeEnvironment::new(
            client.clone(),
            config.namespace.clone(),
            timeout,
        )),
        Arc::new(HttpRegistryFactory),
        Arc::new(WebhookNotifier::new(timeout)),
        Arc::new(HttpReadinessProbe::new(config.readiness_url.clone(), timeout)?),
        metrics,
    ));

    let (trigger_shutdown, shutdown) = shutdown_channel();
    let leader = LeaderState::new();
    let leader_task = if config.leader_election {
        Some(tokio::spawn(run_leader_election(
            client.clone(),
            LeaderConfig::from_env(),
            leader.clone(),
            shutdown.clone(),
        )))
    } else {
        info!("Leader election disabled, acting as leader");
        leader.set_leader(true);
        None
    };

    let trigger = Arc::new(Notify::new());
    let watchers = spawn_watchers(watch_client, &config.namespace, trigger.clone());
    let controller = tokio::spawn(run_controller(ctx, leader, trigger, shutdown));

    readiness.set_ready();
    info!("Controller ready");

    wait_for_os_signal().await;
    trigger_shutdown.shutdown();

    for watcher in watchers {
        watcher.abort();
    }
    if let Err(e) = controller.await {
        warn!(error = %e, "Controller loop ended abnormally");
    }
    if let Some(task) = leader_task {
        if let Err(e) = task.await {
            warn!(error = %e, "Leader election ended abnormally");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

async fn connect(read_timeout: Duration) -> anyhow::Result<(Client, Client)> {
    let config = kube::Config::infer().await?;
    let watch_client = Client::try_from(config.clone())?;
    let mut bounded = config;
    bounded.read_timeout = Some(read_timeout);
    Ok((Client::try_from(bounded)?, watch_client))
}
