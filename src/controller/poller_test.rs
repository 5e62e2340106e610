#![allow(clippy::unwrap_used)] // Tests can use unwrap for brevity
#![allow(clippy::expect_used)] // Tests can use expect for better error messages

use super::*;
use crate::controller::clock::FixedClock;
use crate::controller::memory::{
    tar_layer, test_environment, InMemoryCluster, InMemoryRegistry, InMemoryRegistryFactory,
};
use crate::controller::metadata::{CanarySettings, COOLDOWN_LABEL};
use crate::crd::release::{DeckhouseReleaseStatus, ANNOTATION_NOTIFICATION_TIME_SHIFT};
use chrono::TimeZone;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

const CHANNEL_SOURCE: &str = "check release (registry.example.com/deckhouse/release-channel:stable)";

struct Fixture {
    cluster: InMemoryCluster,
    registry: Arc<InMemoryRegistry>,
    factory: InMemoryRegistryFactory,
    clock: FixedClock,
    metrics: ControllerMetrics,
    env: Environment,
}

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 5, 10, 0, 0).unwrap()
}

fn fixture() -> Fixture {
    let registry = Arc::new(InMemoryRegistry::new());
    Fixture {
        cluster: InMemoryCluster::with_deployment("registry.example.com/deckhouse:v1.30.0"),
        factory: InMemoryRegistryFactory::new(registry.clone()),
        registry,
        clock: FixedClock::new(now()),
        metrics: ControllerMetrics::new().unwrap(),
        env: test_environment(Some("Stable")),
    }
}

fn push(f: &Fixture, tag: &str, version_json: &str) {
    push_with_labels(f, tag, version_json, BTreeMap::new());
}

fn push_with_labels(f: &Fixture, tag: &str, version_json: &str, labels: BTreeMap<String, String>) {
    let layer = tar_layer(&[("version.json", version_json.as_bytes())]).unwrap();
    f.registry.push(tag, vec![layer], labels);
}

fn existing(f: &Fixture, version: &str, phase: Phase) -> DeckhouseRelease {
    let parsed = parse_version(version).unwrap();
    let mut release = DeckhouseRelease::new(
        &release_name(&parsed),
        DeckhouseReleaseSpec {
            version: version.to_string(),
            ..Default::default()
        },
    );
    release.status = Some(DeckhouseReleaseStatus {
        phase: Some(phase.as_str().to_string()),
        ..Default::default()
    });
    f.cluster.insert_release(release.clone());
    release
}

async fn poll(f: &Fixture, last: Option<&str>) -> Result<PollOutcome, PollError> {
    ReleasePoller {
        cluster: &f.cluster,
        registries: &f.factory,
        clock: &f.clock,
        metrics: &f.metrics,
    }
    .poll(&f.env, "Stable", last)
    .await
}

fn names(f: &Fixture) -> Vec<String> {
    f.cluster
        .releases()
        .into_iter()
        .filter_map(|r| r.metadata.name)
        .collect()
}

#[tokio::test]
async fn test_new_channel_version_creates_release() {
    // ARRANGE
    let mut f = fixture();
    f.env.enabled_modules = BTreeSet::from(["cni-cilium".to_string()]);
    existing(&f, "v1.30.0", Phase::Deployed);
    let layer = tar_layer(&[
        (
            "version.json",
            br#"{"version":"v1.31.0","requirements":{"k8s":"1.27"},"disruptions":{"1.31":["ingressNginx"]}}"#
                .as_slice(),
        ),
        (
            "changelog.yaml",
            b"global: {fixes: []}\ncni-cilium: {features: []}\nnode-manager: {}\n".as_slice(),
        ),
    ])
    .unwrap();
    f.registry.push("stable", vec![layer], BTreeMap::new());

    // ACT
    let outcome = poll(&f, None).await.unwrap();

    // ASSERT
    assert!(matches!(outcome, PollOutcome::Reconciled { .. }));
    let created = f.cluster.release("v1-31-0").expect("release created");
    assert_eq!(created.spec.version, "v1.31.0");
    assert_eq!(created.spec.requirements.get("k8s").unwrap(), "1.27");
    assert_eq!(created.spec.disruptions, vec!["ingressNginx".to_string()]);
    let changelog: Vec<&String> = created.spec.changelog.keys().collect();
    assert_eq!(changelog, vec!["cni-cilium", "global"]);
    assert_eq!(
        created.spec.changelog_link.as_deref(),
        Some("https://github.com/deckhouse/deckhouse/releases/tag/v1.31.0")
    );
    assert_eq!(created.spec.apply_after, None);
    let annotations = created.metadata.annotations.unwrap();
    assert_eq!(annotations.get(ANNOTATION_CHANGE_CAUSE).unwrap(), CHANNEL_SOURCE);
    assert!(!annotations.contains_key(ANNOTATION_SUSPENDED));
    assert_eq!(
        f.factory.repositories(),
        vec!["registry.example.com/deckhouse/release-channel"]
    );
}

#[tokio::test]
async fn test_unchanged_digest_skips_image_pull() {
    let f = fixture();
    push(&f, "stable", r#"{"version":"v1.30.0"}"#);

    let PollOutcome::Reconciled { digest } = poll(&f, None).await.unwrap() else {
        panic!("first poll should reconcile");
    };
    let second = poll(&f, Some(&digest)).await.unwrap();

    assert_eq!(second, PollOutcome::Unchanged);
    assert_eq!(f.registry.image_pulls(), 1);
}

#[tokio::test]
async fn test_newer_pending_release_is_deleted() {
    // ARRANGE: the channel went back from 1.32 to 1.31
    let f = fixture();
    existing(&f, "v1.30.0", Phase::Deployed);
    existing(&f, "v1.32.0", Phase::Pending);
    push(&f, "stable", r#"{"version":"v1.31.0"}"#);

    // ACT
    poll(&f, None).await.unwrap();

    // ASSERT
    assert_eq!(names(&f), vec!["v1-30-0", "v1-31-0"]);
}

#[tokio::test]
async fn test_equal_release_gets_suspend_annotation() {
    let f = fixture();
    existing(&f, "v1.31.0", Phase::Pending);
    push(&f, "stable", r#"{"version":"v1.31.0","suspend":true}"#);

    poll(&f, None).await.unwrap();

    let release = f.cluster.release("v1-31-0").unwrap();
    assert!(release.flags().suspended);
    assert_eq!(names(&f), vec!["v1-31-0"]);
}

#[tokio::test]
async fn test_resumed_release_returns_to_pending() {
    let f = fixture();
    existing(&f, "v1.31.0", Phase::Suspended);
    push(&f, "stable", r#"{"version":"v1.31.0","suspend":false}"#);

    poll(&f, None).await.unwrap();

    let release = f.cluster.release("v1-31-0").unwrap();
    assert_eq!(release.phase(), Phase::Pending);
    assert_eq!(release.message(), Some(""));
    assert_eq!(release.transition_time(), Some(now()));
}

#[tokio::test]
async fn test_broken_image_does_not_mutate() {
    let f = fixture();
    existing(&f, "v1.30.0", Phase::Deployed);
    push(&f, "stable", r#"{"requirements":{"k8s":"1.27"}}"#);

    let err = poll(&f, None).await.unwrap_err();

    assert!(matches!(err, PollError::Metadata(MetadataError::VersionNotFound)));
    assert_eq!(err.reason(), "broken_image");
    assert_eq!(names(&f), vec!["v1-30-0"]);
}

#[tokio::test]
async fn test_pre_release_is_refused() {
    let f = fixture();
    push(&f, "stable", r#"{"version":"v1.31.0-rc.1"}"#);

    let err = poll(&f, None).await.unwrap_err();

    assert!(matches!(err, PollError::PreRelease(_)));
    assert!(names(&f).is_empty());
}

#[tokio::test]
async fn test_registry_failure_is_reported() {
    let f = fixture();
    f.registry.fail(true);

    let err = poll(&f, None).await.unwrap_err();

    assert_eq!(err.reason(), "registry");
}

#[tokio::test]
async fn test_canary_delay_follows_wave_table() {
    // ARRANGE
    let f = fixture();
    push(
        &f,
        "stable",
        r#"{"version":"v1.31.0","canary":{"stable":{"enabled":true,"waves":4,"interval":"30m"}}}"#,
    );
    let settings = CanarySettings {
        enabled: true,
        waves: 4,
        interval: Duration::from_secs(1800),
    };
    let expected = canary_apply_after(&settings, &f.env.cluster_uuid, "v1.31.0", now());

    // ACT
    poll(&f, None).await.unwrap();

    // ASSERT: the same inputs always land in the same wave
    let created = f.cluster.release("v1-31-0").unwrap();
    assert_eq!(created.apply_after(), expected);
}

#[tokio::test]
async fn test_cooldown_is_inherited_from_prior_patch() {
    // ARRANGE
    let f = fixture();
    let cooldown = Utc.with_ymd_and_hms(2026, 1, 6, 12, 0, 0).unwrap();
    let mut prior = existing(&f, "v1.31.0", Phase::Deployed);
    prior.metadata.annotations = Some(BTreeMap::from([(
        ANNOTATION_COOLDOWN.to_string(),
        format_time(cooldown),
    )]));
    f.cluster.insert_release(prior);
    push(&f, "stable", r#"{"version":"v1.31.1"}"#);

    // ACT
    poll(&f, None).await.unwrap();

    // ASSERT
    let created = f.cluster.release("v1-31-1").unwrap();
    assert_eq!(created.flags().cooldown, Some(cooldown));
}

#[tokio::test]
async fn test_cooldown_label_moves_canary_base() {
    let f = fixture();
    let labels = BTreeMap::from([(COOLDOWN_LABEL.to_string(), "2026-01-10 08:00".to_string())]);
    push_with_labels(
        &f,
        "stable",
        r#"{"version":"v1.31.0","canary":{"stable":{"enabled":true,"waves":3,"interval":"1h"}}}"#,
        labels,
    );
    let cooldown = Utc.with_ymd_and_hms(2026, 1, 10, 8, 0, 0).unwrap();
    let settings = CanarySettings {
        enabled: true,
        waves: 3,
        interval: Duration::from_secs(3600),
    };

    poll(&f, None).await.unwrap();

    let created = f.cluster.release("v1-31-0").unwrap();
    assert_eq!(created.flags().cooldown, Some(cooldown));
    assert_eq!(
        created.apply_after(),
        canary_apply_after(&settings, &f.env.cluster_uuid, "v1.31.0", cooldown)
    );
}

#[tokio::test]
async fn test_notification_shift_is_inherited() {
    // ARRANGE: the previous patch was postponed after a notification
    let f = fixture();
    let shifted = now() + chrono::Duration::hours(2);
    let mut prior = existing(&f, "v1.31.0", Phase::Pending);
    prior.spec.apply_after = Some(format_time(shifted));
    prior.metadata.annotations = Some(BTreeMap::from([(
        ANNOTATION_NOTIFICATION_TIME_SHIFT.to_string(),
        "true".to_string(),
    )]));
    f.cluster.insert_release(prior);
    push(&f, "stable", r#"{"version":"v1.31.1"}"#);

    // ACT
    poll(&f, None).await.unwrap();

    // ASSERT
    let created = f.cluster.release("v1-31-1").unwrap();
    assert_eq!(created.apply_after(), Some(shifted));
    assert!(created.flags().notification_time_shift);
}

#[tokio::test]
async fn test_step_by_step_creates_intermediate_minors() {
    // ARRANGE: deployed 1.30, channel jumped to 1.33
    let f = fixture();
    existing(&f, "v1.30.0", Phase::Deployed);
    push(&f, "stable", r#"{"version":"v1.33.1"}"#);
    push(&f, "v1.31.0", r#"{"version":"v1.31.0"}"#);
    push(&f, "v1.31.4", r#"{"version":"v1.31.4"}"#);
    push(&f, "v1.32.2", r#"{"version":"v1.32.2"}"#);
    f.registry.add_tag("v1.32.3-rc.1");
    f.registry.add_tag("latest");

    // ACT
    poll(&f, None).await.unwrap();

    // ASSERT
    assert_eq!(
        names(&f),
        vec!["v1-30-0", "v1-31-4", "v1-32-2", "v1-33-1"]
    );
    let output = f.metrics.encode().unwrap();
    assert!(!output.contains("d8_updating_is_failed{"));
}

#[tokio::test]
async fn test_step_by_step_failure_keeps_channel_release_back() {
    let f = fixture();
    existing(&f, "v1.30.0", Phase::Deployed);
    push(&f, "stable", r#"{"version":"v1.33.0"}"#);
    push(&f, "v1.31.2", r#"{"version":"v1.31.2"}"#);

    let err = poll(&f, None).await.unwrap_err();

    assert!(matches!(err, PollError::StepByStep { .. }));
    assert_eq!(err.reason(), "registry");
    assert!(f.cluster.release("v1-33-0").is_none());
    let output = f.metrics.encode().unwrap();
    assert!(output.contains("d8_updating_is_failed{version=\"v1.33.0\"} 1"));
}

#[tokio::test]
async fn test_lts_channel_jumps_minors() {
    // ARRANGE: deployed 1.30, LTS moved to 1.33 with no intermediate tags
    let f = fixture();
    existing(&f, "v1.30.0", Phase::Deployed);
    push(&f, "lts", r#"{"version":"v1.33.0"}"#);

    // ACT
    ReleasePoller {
        cluster: &f.cluster,
        registries: &f.factory,
        clock: &f.clock,
        metrics: &f.metrics,
    }
    .poll(&f.env, "LTS", None)
    .await
    .unwrap();

    // ASSERT
    assert_eq!(names(&f), vec!["v1-30-0", "v1-33-0"]);
    assert!(!f.metrics.encode().unwrap().contains("d8_updating_is_failed{"));
}

#[test]
fn test_strict_version_accepts_only_plain_tags() {
    assert_eq!(strict_version("v1.31.4"), Some(Version::new(1, 31, 4)));
    assert_eq!(strict_version("1.31.4"), None);
    assert_eq!(strict_version("v1.31"), None);
    assert_eq!(strict_version("v1.31.4-rc.1"), None);
    assert_eq!(strict_version("stable"), None);
}
