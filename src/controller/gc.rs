//! Release garbage collection
//!
//! Keeps the newest [`MAX_SUPERSEDED`] superseded releases and removes
//! pending releases left behind by a newer deployment. Outdated releases are
//! first marked with [`OUTDATED_MESSAGE`] and deleted once the grace window
//! has passed, so a reader sees why they are going away.

use crate::controller::cluster::{ClusterApi, ClusterError, StatusPatch};
use crate::controller::reconciler::ReleaseView;
use crate::crd::release::Phase;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::info;

pub const MAX_SUPERSEDED: usize = 10;
pub const OUTDATED_MESSAGE: &str = "Outdated by cleanup hook";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupAction {
    Delete(String),
    MarkOutdated(String),
}

/// Decide deletions for a release list; `releases` may be in any order
pub fn plan_cleanup(
    releases: &[ReleaseView],
    now: DateTime<Utc>,
    grace: Duration,
) -> Vec<CleanupAction> {
    let mut actions = Vec::new();

    let mut superseded: Vec<&ReleaseView> = releases
        .iter()
        .filter(|r| r.phase == Phase::Superseded)
        .collect();
    superseded.sort_by(|a, b| b.version.cmp(&a.version));
    actions.extend(
        superseded
            .iter()
            .skip(MAX_SUPERSEDED)
            .map(|r| CleanupAction::Delete(r.name.clone())),
    );

    let Some(deployed) = releases
        .iter()
        .filter(|r| r.phase == Phase::Deployed)
        .map(|r| &r.version)
        .max()
    else {
        return actions;
    };

    let grace = chrono::Duration::from_std(grace).unwrap_or_else(|_| chrono::Duration::zero());
    for release in releases
        .iter()
        .filter(|r| r.phase == Phase::Pending && r.version < *deployed)
    {
        let marked_at = (release.message == OUTDATED_MESSAGE)
            .then_some(release.transition_time)
            .flatten();
        match marked_at {
            Some(at) if at + grace <= now => actions.push(CleanupAction::Delete(release.name.clone())),
            Some(_) => {}
            None => actions.push(CleanupAction::MarkOutdated(release.name.clone())),
        }
    }

    actions
}

/// Execute cleanup actions; deletions are background deletes
pub async fn run_cleanup(
    cluster: &dyn ClusterApi,
    actions: &[CleanupAction],
    now: DateTime<Utc>,
) -> Result<(), ClusterError> {
    for action in actions {
        match action {
            CleanupAction::Delete(name) => {
                cluster.delete_release(name).await?;
                info!(release = %name, "Release deleted by cleanup");
            }
            CleanupAction::MarkOutdated(name) => {
                let patch = StatusPatch {
                    phase: None,
                    message: Some(OUTDATED_MESSAGE.to_string()),
                    approved: None,
                    transition_time: Some(now),
                };
                cluster.patch_release_status(name, &patch).await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::crd::release::AnnotationFlags;
    use chrono::TimeZone;
    use semver::Version;
    use std::collections::BTreeMap;

    fn view(minor: u64, phase: Phase) -> ReleaseView {
        ReleaseView {
            name: format!("v1-{minor}-0"),
            version: Version::new(1, minor, 0),
            phase,
            has_phase: true,
            approved: false,
            spec_approved: false,
            message: String::new(),
            apply_after: None,
            transition_time: None,
            requirements: BTreeMap::new(),
            disruptions: Vec::new(),
            changelog_link: None,
            flags: AnnotationFlags::default(),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, 10, 0, 0).unwrap()
    }

    #[test]
    fn test_keeps_ten_newest_superseded() {
        // ARRANGE: 13 superseded releases, shuffled
        let mut releases: Vec<ReleaseView> =
            (1..=13).rev().map(|m| view(m, Phase::Superseded)).collect();
        releases.swap(0, 7);
        releases.push(view(14, Phase::Deployed));

        // ACT
        let actions = plan_cleanup(&releases, now(), Duration::from_secs(60));

        // ASSERT: the three oldest go
        assert_eq!(
            actions,
            vec![
                CleanupAction::Delete("v1-3-0".to_string()),
                CleanupAction::Delete("v1-2-0".to_string()),
                CleanupAction::Delete("v1-1-0".to_string()),
            ]
        );
    }

    #[test]
    fn test_outdated_pending_is_marked_then_deleted() {
        let mut outdated = view(20, Phase::Pending);
        let releases = vec![outdated.clone(), view(21, Phase::Deployed), view(22, Phase::Pending)];

        let actions = plan_cleanup(&releases, now(), Duration::from_secs(60));
        assert_eq!(actions, vec![CleanupAction::MarkOutdated("v1-20-0".to_string())]);

        // Within the grace window nothing happens
        outdated.message = OUTDATED_MESSAGE.to_string();
        outdated.transition_time = Some(now() - chrono::Duration::seconds(30));
        let releases = vec![outdated.clone(), view(21, Phase::Deployed)];
        assert!(plan_cleanup(&releases, now(), Duration::from_secs(60)).is_empty());

        outdated.transition_time = Some(now() - chrono::Duration::seconds(60));
        let releases = vec![outdated, view(21, Phase::Deployed)];
        assert_eq!(
            plan_cleanup(&releases, now(), Duration::from_secs(60)),
            vec![CleanupAction::Delete("v1-20-0".to_string())]
        );
    }

    #[test]
    fn test_nothing_outdated_without_deployed_release() {
        let releases = vec![view(20, Phase::Pending), view(21, Phase::Pending)];

        assert!(plan_cleanup(&releases, now(), Duration::from_secs(60)).is_empty());
    }

    #[tokio::test]
    async fn test_run_cleanup_marks_and_deletes() {
        use crate::controller::memory::InMemoryCluster;
        use crate::crd::release::{DeckhouseRelease, DeckhouseReleaseSpec};

        let cluster = InMemoryCluster::new();
        for name in ["v1-1-0", "v1-2-0"] {
            cluster.insert_release(DeckhouseRelease::new(name, DeckhouseReleaseSpec::default()));
        }
        let actions = vec![
            CleanupAction::Delete("v1-1-0".to_string()),
            CleanupAction::MarkOutdated("v1-2-0".to_string()),
        ];

        run_cleanup(&cluster, &actions, now()).await.unwrap();

        assert!(cluster.release("v1-1-0").is_none());
        let marked = cluster.release("v1-2-0").unwrap();
        assert_eq!(marked.message(), Some(OUTDATED_MESSAGE));
        assert_eq!(marked.transition_time(), Some(now()));
    }
}
