#![allow(clippy::unwrap_used)] // Tests can use unwrap for brevity

//! Tests for leader election

use super::leader::*;
use chrono::{DateTime, TimeZone, Utc};
use k8s_openapi::api::coordination::v1::LeaseSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use std::collections::HashMap;
use std::time::Duration;

fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |name| vars.get(name).cloned()
}

#[test]
fn test_leader_state_initially_not_leader() {
    let state = LeaderState::new();
    assert!(!state.is_leader(), "Should not be leader initially");
}

#[test]
fn test_leader_state_clones_share_state() {
    let state = LeaderState::new();
    let state2 = state.clone();

    state.set_leader(true);
    assert!(state2.is_leader(), "Clone should reflect same leader state");

    state2.set_leader(false);
    assert!(!state.is_leader());
}

#[test]
fn test_leader_config_defaults() {
    let config = LeaderConfig::from_lookup(lookup(&[]));

    assert!(
        config.holder_id.starts_with("deckhouse-release-controller-"),
        "Should have UUID fallback"
    );
    assert_eq!(config.lease_namespace, "d8-system");
    assert_eq!(config.lease_name, "deckhouse-release-controller-leader");
    assert_eq!(config.lease_duration_seconds, 15);
    assert_eq!(config.renew_interval, Duration::from_secs(5));
}

#[test]
fn test_leader_config_prefers_pod_name_over_hostname() {
    let config = LeaderConfig::from_lookup(lookup(&[
        ("POD_NAME", "deckhouse-7d9f"),
        ("HOSTNAME", "node-1"),
        ("POD_NAMESPACE", "d8-test"),
    ]));

    assert_eq!(config.holder_id, "deckhouse-7d9f");
    assert_eq!(config.lease_namespace, "d8-test");

    let config = LeaderConfig::from_lookup(lookup(&[("HOSTNAME", "node-1")]));
    assert_eq!(config.holder_id, "node-1");
}

#[test]
fn test_lease_expiry() {
    let renew = Utc.with_ymd_and_hms(2026, 1, 5, 10, 0, 0).unwrap();

    assert!(!lease_expired(
        Some(renew),
        Some(15),
        renew + chrono::Duration::seconds(15)
    ));
    assert!(lease_expired(
        Some(renew),
        Some(15),
        renew + chrono::Duration::seconds(16)
    ));
    assert!(lease_expired(None, Some(15), renew));
    assert!(lease_expired(Some(renew), None, renew));
}

fn held_by(holder: &str, renewed: DateTime<Utc>) -> LeaseSpec {
    LeaseSpec {
        holder_identity: Some(holder.to_string()),
        renew_time: Some(MicroTime(renewed)),
        lease_duration_seconds: Some(15),
        lease_transitions: Some(2),
        ..Default::default()
    }
}

#[test]
fn test_next_step_for_missing_and_own_lease() {
    let now = Utc.with_ymd_and_hms(2026, 1, 5, 10, 0, 0).unwrap();

    assert_eq!(next_step(None, "deckhouse-0", now), LeaseStep::Create);
    assert_eq!(
        next_step(Some(&held_by("deckhouse-0", now)), "deckhouse-0", now),
        LeaseStep::Renew
    );
}

#[test]
fn test_next_step_follows_live_lease_and_takes_expired_one() {
    let now = Utc.with_ymd_and_hms(2026, 1, 5, 10, 0, 0).unwrap();
    let live = held_by("deckhouse-1", now - chrono::Duration::seconds(5));
    let stale = held_by("deckhouse-1", now - chrono::Duration::seconds(60));

    assert_eq!(
        next_step(Some(&live), "deckhouse-0", now),
        LeaseStep::Follow {
            holder: Some("deckhouse-1".to_string())
        }
    );
    assert_eq!(
        next_step(Some(&stale), "deckhouse-0", now),
        LeaseStep::Acquire { transitions: 3 }
    );
}

#[test]
fn test_next_step_takes_released_lease() {
    let now = Utc.with_ymd_and_hms(2026, 1, 5, 10, 0, 0).unwrap();
    let released = LeaseSpec {
        holder_identity: None,
        lease_duration_seconds: Some(15),
        ..Default::default()
    };

    assert_eq!(
        next_step(Some(&released), "deckhouse-0", now),
        LeaseStep::Acquire { transitions: 1 }
    );
}
