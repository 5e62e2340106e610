//! Prometheus metrics for the release controller
//!
//! Exposes update progress and blocking reasons:
//! - Tick counts and durations
//! - Blocked and manually waiting releases
//! - Registry and digest checks of tag mode
//! - Obsolete module settings versions

use prometheus::{
    self, Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Controller metrics registry
///
/// Thread-safe container for all Prometheus metrics.
/// Clone is cheap (Arc internally).
#[derive(Clone)]
pub struct ControllerMetrics {
    registry: Registry,
    /// Total ticks by result (success, error, skipped)
    pub ticks_total: IntCounterVec,
    /// Tick duration in seconds by path (channel, tag)
    pub tick_duration_seconds: HistogramVec,
    /// Predicted release held back by a requirement, disruption or approval
    pub release_blocked: IntGaugeVec,
    pub release_waiting_manual: IntGaugeVec,
    /// 1 while a rollout is in progress
    pub is_updating: IntGaugeVec,
    /// Step-by-step release creation failed for a version
    pub updating_is_failed: IntGaugeVec,
    pub release_check_errors_total: IntCounterVec,
    pub registry_check_total: IntCounter,
    pub registry_check_errors_total: IntCounter,
    pub image_digest_check_total: IntCounter,
    /// 1 after the last registry digest fetch succeeded
    pub image_digest_check_success: IntGauge,
    pub obsolete_config_version: IntGaugeVec,
}

impl ControllerMetrics {
    /// Create a new metrics registry with all controller metrics
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let ticks_total = IntCounterVec::new(
            Opts::new(
                "d8_release_controller_ticks_total",
                "Total number of controller ticks",
            ),
            &["result"], // success, error, skipped
        )?;
        registry.register(Box::new(ticks_total.clone()))?;

        let tick_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "d8_release_controller_tick_duration_seconds",
                "Duration of a controller tick in seconds",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["path"], // channel, tag
        )?;
        registry.register(Box::new(tick_duration_seconds.clone()))?;

        let release_blocked = IntGaugeVec::new(
            Opts::new("d8_release_blocked", "Release is blocked from being applied"),
            &["name", "reason"],
        )?;
        registry.register(Box::new(release_blocked.clone()))?;

        let release_waiting_manual = IntGaugeVec::new(
            Opts::new(
                "d8_release_waiting_manual",
                "Release is waiting for manual approval",
            ),
            &["name"],
        )?;
        registry.register(Box::new(release_waiting_manual.clone()))?;

        let is_updating = IntGaugeVec::new(
            Opts::new("d8_is_updating", "Platform update is in progress"),
            &["releaseChannel"],
        )?;
        registry.register(Box::new(is_updating.clone()))?;

        let updating_is_failed = IntGaugeVec::new(
            Opts::new(
                "d8_updating_is_failed",
                "Intermediate releases could not be fetched",
            ),
            &["version"],
        )?;
        registry.register(Box::new(updating_is_failed.clone()))?;

        let release_check_errors_total = IntCounterVec::new(
            Opts::new(
                "deckhouse_release_check_errors_total",
                "Failed release channel checks",
            ),
            &["reason"], // registry, broken_image, kube
        )?;
        registry.register(Box::new(release_check_errors_total.clone()))?;

        let registry_check_total = IntCounter::new(
            "deckhouse_registry_check_total",
            "Registry digest checks in tag mode",
        )?;
        registry.register(Box::new(registry_check_total.clone()))?;

        let registry_check_errors_total = IntCounter::new(
            "deckhouse_registry_check_errors_total",
            "Failed registry digest checks in tag mode",
        )?;
        registry.register(Box::new(registry_check_errors_total.clone()))?;

        let image_digest_check_total = IntCounter::new(
            "deckhouse_kube_image_digest_check_total",
            "Image digest checks in tag mode",
        )?;
        registry.register(Box::new(image_digest_check_total.clone()))?;

        let image_digest_check_success = IntGauge::new(
            "deckhouse_kube_image_digest_check_success",
            "Whether the last registry digest fetch in tag mode succeeded",
        )?;
        registry.register(Box::new(image_digest_check_success.clone()))?;

        let obsolete_config_version = IntGaugeVec::new(
            Opts::new(
                "d8_obsolete_config_version",
                "Module settings declare a version below the latest registered one",
            ),
            &["name", "version", "latest"],
        )?;
        registry.register(Box::new(obsolete_config_version.clone()))?;

        Ok(Self {
            registry,
            ticks_total,
            tick_duration_seconds,
            release_blocked,
            release_waiting_manual,
            is_updating,
            updating_is_failed,
            release_check_errors_total,
            registry_check_total,
            registry_check_errors_total,
            image_digest_check_total,
            image_digest_check_success,
            obsolete_config_version,
        })
    }

    /// Record a successful tick
    pub fn record_tick_success(&self, path: &str, duration_secs: f64) {
        self.ticks_total.with_label_values(&["success"]).inc();
        self.tick_duration_seconds
            .with_label_values(&[path])
            .observe(duration_secs);
    }

    /// Record a failed tick
    pub fn record_tick_error(&self, path: &str, duration_secs: f64) {
        self.ticks_total.with_label_values(&["error"]).inc();
        self.tick_duration_seconds
            .with_label_values(&[path])
            .observe(duration_secs);
    }

    /// Record a skipped tick (not leader)
    pub fn record_tick_skipped(&self) {
        self.ticks_total.with_label_values(&["skipped"]).inc();
    }

    /// Drop per-release gauges; they are re-set by the tick that follows
    pub fn reset_release_gauges(&self) {
        self.release_blocked.reset();
        self.release_waiting_manual.reset();
    }

    pub fn set_release_blocked(&self, name: &str, reason: &str) {
        self.release_blocked.with_label_values(&[name, reason]).set(1);
    }

    pub fn set_waiting_manual(&self, name: &str) {
        self.release_waiting_manual.with_label_values(&[name]).set(1);
    }

    pub fn set_is_updating(&self, channel: &str, updating: bool) {
        self.is_updating
            .with_label_values(&[channel])
            .set(i64::from(updating));
    }

    pub fn set_updating_failed(&self, version: &str, failed: bool) {
        if failed {
            self.updating_is_failed.with_label_values(&[version]).set(1);
        } else {
            self.updating_is_failed.reset();
        }
    }

    pub fn record_release_check_error(&self, reason: &str) {
        self.release_check_errors_total
            .with_label_values(&[reason])
            .inc();
    }

    /// Record one tag-mode registry digest fetch
    pub fn record_registry_check(&self, success: bool) {
        self.registry_check_total.inc();
        self.image_digest_check_total.inc();
        if success {
            self.image_digest_check_success.set(1);
        } else {
            self.registry_check_errors_total.inc();
            self.image_digest_check_success.set(0);
        }
    }

    /// Replace the obsolete settings gauge with `declared` entries below `latest`
    pub fn set_obsolete_config_versions(
        &self,
        declared: &BTreeMap<String, u32>,
        latest: &BTreeMap<String, u32>,
    ) {
        self.obsolete_config_version.reset();
        for (name, version) in declared {
            if let Some(latest) = latest.get(name).filter(|latest| *latest > version) {
                self.obsolete_config_version
                    .with_label_values(&[name.as_str(), &version.to_string(), &latest.to_string()])
                    .set(1);
            }
        }
    }

    /// Encode all metrics to Prometheus text format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| {
            prometheus::Error::Msg(format!("Failed to encode metrics as UTF-8: {}", e))
        })
    }
}

/// Shared metrics handle for use across the controller
pub type SharedMetrics = Arc<ControllerMetrics>;

/// Create a new shared metrics instance
pub fn create_metrics() -> Result<SharedMetrics, prometheus::Error> {
    Ok(Arc::new(ControllerMetrics::new()?))
}
