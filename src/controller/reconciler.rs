//! Release state machine
//!
//! [`plan`] is a pure function of a [`Snapshot`] and a [`Policy`]. It decides
//! the phase of every release and selects at most one release to deploy; the
//! resulting [`Plan`] is a list of idempotent actions executed by the applier.
//!
//! Decision order for the predicted release:
//! 1. force annotation deploys immediately
//! 2. bootstrap with a single release deploys after requirement checks
//! 3. patch releases: requirements, disruptions, apply time
//! 4. minor releases: manual approval, cooldown, apply time, update windows,
//!    pod readiness, requirements, disruptions, notification

use crate::config::{UpdateMode, UpdatePolicy};
use crate::controller::checks::{CheckRegistry, RequirementError, ValueGetter};
use crate::controller::cluster::StatusPatch;
use crate::controller::metadata::changelog_link;
use crate::controller::notification::WebhookPayload;
use crate::controller::release_data::ReleaseData;
use crate::crd::release::{
    parse_version, version_tag, AnnotationFlags, DeckhouseRelease, Phase, ANNOTATION_APPLY_NOW,
    ANNOTATION_APPROVED, ANNOTATION_DISRUPTION_APPROVED, ANNOTATION_FORCE, ANNOTATION_SUSPENDED,
};
use crate::config::NotificationConfig;
use chrono::{DateTime, Utc};
use semver::Version;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

pub const MESSAGE_SUSPENDED: &str = "Release is suspended";
pub const MESSAGE_SKIPPED: &str = "Skipped by cleanup";
pub const MESSAGE_POD_NOT_READY: &str = "Waiting for Deckhouse pod to be ready";

/// RFC822 rendering used in status messages ("05 Jan 26 08:00 UTC")
pub fn human_time(at: DateTime<Utc>) -> String {
    at.format("%d %b %y %H:%M UTC").to_string()
}

/// A release with its version parsed and annotations decoded
#[derive(Debug, Clone, PartialEq)]
pub struct ReleaseView {
    pub name: String,
    pub version: Version,
    pub phase: Phase,
    pub has_phase: bool,
    /// `status.approved`
    pub approved: bool,
    /// `spec.approved`
    pub spec_approved: bool,
    pub message: String,
    pub apply_after: Option<DateTime<Utc>>,
    pub transition_time: Option<DateTime<Utc>>,
    pub requirements: BTreeMap<String, String>,
    pub disruptions: Vec<String>,
    pub changelog_link: Option<String>,
    pub flags: AnnotationFlags,
}

impl ReleaseView {
    pub fn from_release(release: &DeckhouseRelease) -> Result<Self, semver::Error> {
        Ok(Self {
            name: release.metadata.name.clone().unwrap_or_default(),
            version: parse_version(&release.spec.version)?,
            phase: release.phase(),
            has_phase: release.has_phase(),
            approved: release.status.as_ref().is_some_and(|s| s.approved),
            spec_approved: release.spec.approved,
            message: release.message().unwrap_or_default().to_string(),
            apply_after: release.apply_after(),
            transition_time: release.transition_time(),
            requirements: release.spec.requirements.clone(),
            disruptions: release.spec.disruptions.clone(),
            changelog_link: release.spec.changelog_link.clone(),
            flags: release.flags(),
        })
    }

    /// The approval annotation wins over `spec.approved` when present
    pub fn manually_approved(&self) -> bool {
        self.flags.approved.unwrap_or(self.spec_approved)
    }

    pub fn same_minor(&self, other: &Version) -> bool {
        self.version.major == other.major && self.version.minor == other.minor
    }
}

/// A release whose version does not parse; it takes no part in ordering
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidRelease {
    pub name: String,
    pub version: String,
    pub error: String,
    pub phase: Phase,
    pub has_phase: bool,
    pub message: String,
}

impl InvalidRelease {
    pub fn skip_message(&self) -> String {
        format!("Release version {:?} cannot be parsed: {}", self.version, self.error)
    }
}

/// Everything the planner reads, captured once at the top of a tick
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub now: DateTime<Utc>,
    /// Sorted by version, ascending
    pub releases: Vec<ReleaseView>,
    pub invalid: Vec<InvalidRelease>,
    pub release_data: ReleaseData,
    /// The deployed pod runs the template image, is Ready and answers its probe
    pub deployment_ready: bool,
    pub bootstrapped: bool,
}

impl Snapshot {
    pub fn new(
        now: DateTime<Utc>,
        releases: &[DeckhouseRelease],
        release_data: ReleaseData,
        deployment_ready: bool,
        bootstrapped: bool,
    ) -> Self {
        let mut views = Vec::with_capacity(releases.len());
        let mut invalid = Vec::new();
        for release in releases {
            match ReleaseView::from_release(release) {
                Ok(view) => views.push(view),
                Err(e) => invalid.push(InvalidRelease {
                    name: release.metadata.name.clone().unwrap_or_default(),
                    version: release.spec.version.clone(),
                    error: e.to_string(),
                    phase: release.phase(),
                    has_phase: release.has_phase(),
                    message: release.message().unwrap_or_default().to_string(),
                }),
            }
        }
        views.sort_by(|a, b| a.version.cmp(&b.version));

        Self {
            now,
            releases: views,
            invalid,
            release_data,
            deployment_ready,
            bootstrapped,
        }
    }

    pub fn deployed(&self) -> Option<&ReleaseView> {
        self.releases.iter().rev().find(|r| r.phase == Phase::Deployed)
    }
}

/// Settings and check registries the planner consults
pub struct Policy<'a> {
    pub update: &'a UpdatePolicy,
    pub checks: &'a CheckRegistry,
    pub values: &'a dyn ValueGetter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    Requirement,
    Disruption,
    ManualApproval,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::Requirement => "requirement",
            BlockReason::Disruption => "disruption",
            BlockReason::ManualApproval => "manual_approval",
        }
    }
}

/// The irreversible step: point the deployment at a release
#[derive(Debug, Clone, PartialEq)]
pub struct DeployTask {
    pub release: String,
    pub version: Version,
    /// Previously deployed (and, for forced releases, older waiting) releases
    pub superseded: Vec<String>,
    pub remove_annotations: Vec<String>,
    pub release_data: ReleaseData,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    SetStatus {
        name: String,
        patch: StatusPatch,
    },
    RemoveAnnotations {
        name: String,
        keys: Vec<String>,
    },
    Notify {
        config: NotificationConfig,
        payload: WebhookPayload,
    },
    ShiftApplyAfter {
        name: String,
        apply_after: DateTime<Utc>,
    },
    SaveReleaseData(ReleaseData),
    Deploy(DeployTask),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Nothing to deploy
    Idle,
    /// The predicted release is held back
    Waiting { release: String, reason: String },
    Deploy { release: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub actions: Vec<Action>,
    pub blocked: Vec<(String, BlockReason)>,
    pub waiting_manual: Option<String>,
    /// A rollout was started and the new pod is not ready yet
    pub is_updating: bool,
    pub outcome: Outcome,
}

impl Plan {
    pub fn deploy_task(&self) -> Option<&DeployTask> {
        self.actions.iter().find_map(|a| match a {
            Action::Deploy(task) => Some(task),
            _ => None,
        })
    }
}

enum Decision {
    Idle,
    Wait { release: String, reason: String },
    Deploy(DeployTask),
}

/// Decide phases and the next deployment for one tick
pub fn plan(snapshot: &Snapshot, policy: &Policy<'_>) -> Plan {
    let mut planner = Planner::new(snapshot, policy);
    let decision = planner.decide(snapshot);
    planner.finish(snapshot, decision)
}

struct Planner<'a> {
    now: DateTime<Utc>,
    policy: &'a Policy<'a>,
    releases: Vec<ReleaseView>,
    statuses: Vec<(String, StatusPatch)>,
    annotations: Vec<(String, Vec<String>)>,
    gate_actions: Vec<Action>,
    release_data: ReleaseData,
    release_data_changed: bool,
    blocked: Vec<(String, BlockReason)>,
    waiting_manual: Option<String>,
}

impl<'a> Planner<'a> {
    fn new(snapshot: &Snapshot, policy: &'a Policy<'a>) -> Self {
        Self {
            now: snapshot.now,
            policy,
            releases: snapshot.releases.clone(),
            statuses: Vec::new(),
            annotations: Vec::new(),
            gate_actions: Vec::new(),
            release_data: snapshot.release_data.clone(),
            release_data_changed: false,
            blocked: Vec::new(),
            waiting_manual: None,
        }
    }

    fn status_entry(&mut self, name: &str) -> &mut StatusPatch {
        let idx = match self.statuses.iter().position(|(n, _)| n == name) {
            Some(idx) => idx,
            None => {
                self.statuses.push((name.to_string(), StatusPatch::default()));
                self.statuses.len() - 1
            }
        };
        &mut self.statuses[idx].1
    }

    /// Record a phase/message change; unchanged statuses produce no patch
    fn set_status(&mut self, idx: usize, phase: Phase, message: &str) {
        let now = self.now;
        let release = &mut self.releases[idx];
        let phase_changed = !release.has_phase || release.phase != phase;
        if !phase_changed && release.message == message {
            return;
        }
        release.phase = phase;
        release.has_phase = true;
        release.message = message.to_string();
        let name = release.name.clone();

        let patch = self.status_entry(&name);
        patch.phase = Some(phase);
        patch.message = Some(message.to_string());
        if phase_changed {
            patch.transition_time = Some(now);
        }
    }

    fn set_approved(&mut self, idx: usize, approved: bool) {
        let release = &mut self.releases[idx];
        if release.approved == approved {
            return;
        }
        release.approved = approved;
        let name = release.name.clone();
        self.status_entry(&name).approved = Some(approved);
    }

    fn remove_annotations(&mut self, idx: usize, keys: &[&str]) {
        let name = self.releases[idx].name.clone();
        let keys: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        match self.annotations.iter_mut().find(|(n, _)| *n == name) {
            Some((_, existing)) => existing.extend(keys),
            None => self.annotations.push((name, keys)),
        }
    }

    fn phase(&self, idx: usize) -> Phase {
        self.releases[idx].phase
    }

    fn decide(&mut self, snapshot: &Snapshot) -> Decision {
        self.normalize();

        if self.release_data.is_updating && snapshot.deployment_ready {
            info!(version = %self.release_data.version, "Rollout finished, deployment is ready");
            self.release_data.is_updating = false;
            self.release_data_changed = true;
        }

        let deployed_idx = self.collapse_deployed();
        let deployed_version = deployed_idx.map(|idx| self.releases[idx].version.clone());

        if let Some(decision) = self.forced(deployed_idx) {
            return decision;
        }

        if !snapshot.bootstrapped && self.releases.len() == 1 && self.phase(0) == Phase::Pending {
            info!(release = %self.releases[0].name, "Cluster is bootstrapping, applying the only release");
            if let Some(message) = self.requirement_failure(0) {
                return self.block(0, BlockReason::Requirement, message);
            }
            return self.deploy(0, deployed_idx, Vec::new());
        }

        let Some(predicted) = self.predict(deployed_version.as_ref()) else {
            debug!("No pending release to apply");
            return Decision::Idle;
        };

        let is_patch = deployed_version
            .as_ref()
            .is_some_and(|deployed| self.releases[predicted].same_minor(deployed));

        if is_patch {
            self.patch_gates(predicted, deployed_idx)
        } else {
            self.minor_gates(predicted, deployed_idx, snapshot.deployment_ready)
        }
    }

    /// Initial phase, suspend hand-off and approval mirror
    fn normalize(&mut self) {
        for idx in 0..self.releases.len() {
            if !self.releases[idx].has_phase {
                let message = self.releases[idx].message.clone();
                self.set_status(idx, Phase::Pending, &message);
            }

            if self.phase(idx) == Phase::Pending && self.releases[idx].flags.suspended {
                info!(release = %self.releases[idx].name, "Release suspended");
                self.set_status(idx, Phase::Suspended, MESSAGE_SUSPENDED);
                self.remove_annotations(idx, &[ANNOTATION_SUSPENDED]);
                self.releases[idx].flags.suspended = false;
            }

            if self.phase(idx) == Phase::Pending {
                let approved = match self.policy.update.mode {
                    UpdateMode::Manual => self.releases[idx].manually_approved(),
                    UpdateMode::Auto => true,
                };
                self.set_approved(idx, approved);
            }
        }
    }

    /// Keep only the highest Deployed release; returns its index
    fn collapse_deployed(&mut self) -> Option<usize> {
        let deployed: Vec<usize> = (0..self.releases.len())
            .filter(|&idx| self.phase(idx) == Phase::Deployed)
            .collect();
        let (&newest, older) = deployed.split_last()?;
        for &idx in older {
            warn!(release = %self.releases[idx].name, "Several releases are deployed, superseding older one");
            self.set_status(idx, Phase::Superseded, "");
        }
        Some(newest)
    }

    fn forced(&mut self, deployed_idx: Option<usize>) -> Option<Decision> {
        let deployed_version = deployed_idx.map(|idx| self.releases[idx].version.clone());
        let eligible = |release: &ReleaseView| {
            release.flags.force
                && matches!(release.phase, Phase::Pending | Phase::Suspended)
                && deployed_version.as_ref().map_or(true, |d| release.version > *d)
        };

        let forced = (0..self.releases.len())
            .rev()
            .find(|&idx| eligible(&self.releases[idx]));

        // A force annotation left on anything else is stale
        let stale: Vec<usize> = (0..self.releases.len())
            .filter(|&idx| self.releases[idx].flags.force && Some(idx) != forced)
            .collect();
        for idx in stale {
            debug!(release = %self.releases[idx].name, "Removing stale force annotation");
            self.remove_annotations(idx, &[ANNOTATION_FORCE]);
            self.releases[idx].flags.force = false;
        }

        let forced = forced?;
        warn!(release = %self.releases[forced].name, "Forcing release");
        let older_waiting: Vec<String> = (0..forced)
            .filter(|&idx| matches!(self.phase(idx), Phase::Pending | Phase::Suspended))
            .map(|idx| self.releases[idx].name.clone())
            .collect();
        Some(self.deploy(forced, deployed_idx, older_waiting))
    }

    /// First pending release above the deployed one, advanced to the highest
    /// patch of its minor; lower patches of that minor are skipped
    fn predict(&mut self, deployed: Option<&Version>) -> Option<usize> {
        let candidates: Vec<usize> = (0..self.releases.len())
            .filter(|&idx| {
                self.phase(idx) == Phase::Pending
                    && deployed.map_or(true, |d| self.releases[idx].version > *d)
            })
            .collect();
        let first = self.releases[*candidates.first()?].version.clone();
        let group: Vec<usize> = candidates
            .into_iter()
            .filter(|&idx| self.releases[idx].same_minor(&first))
            .collect();

        // A patch with unmet requirements does not replace an earlier one
        let predicted = group
            .iter()
            .rev()
            .copied()
            .find(|&idx| self.requirement_failure(idx).is_none())
            .or_else(|| group.last().copied())?;

        let predicted_version = self.releases[predicted].version.clone();
        for idx in group {
            if self.releases[idx].version < predicted_version {
                self.set_status(idx, Phase::Skipped, MESSAGE_SKIPPED);
            }
        }
        Some(predicted)
    }

    fn patch_gates(&mut self, idx: usize, deployed_idx: Option<usize>) -> Decision {
        if let Some(message) = self.requirement_failure(idx) {
            return self.block(idx, BlockReason::Requirement, message);
        }
        if let Some(message) = self.disruption_failure(idx) {
            return self.block(idx, BlockReason::Disruption, message);
        }
        if let Some(message) = self.apply_after_wait(idx) {
            return self.wait(idx, message);
        }
        self.deploy(idx, deployed_idx, Vec::new())
    }

    fn minor_gates(
        &mut self,
        idx: usize,
        deployed_idx: Option<usize>,
        deployment_ready: bool,
    ) -> Decision {
        let release = self.releases[idx].clone();

        if self.policy.update.mode == UpdateMode::Manual && !release.manually_approved() {
            self.waiting_manual = Some(release.name.clone());
            let message = format!(
                "Waiting for manual approval: kubectl annotate DeckhouseRelease {} {ANNOTATION_APPROVED}=true",
                release.name
            );
            return self.block(idx, BlockReason::ManualApproval, message);
        }

        if !release.flags.apply_now {
            if let Some(until) = release.flags.cooldown.filter(|until| *until > self.now) {
                return self.wait(
                    idx,
                    format!("Release is in cooldown until: {}", human_time(until)),
                );
            }
            if let Some(message) = self.apply_after_wait(idx) {
                return self.wait(idx, message);
            }
            let windows = &self.policy.update.windows;
            if !windows.is_allowed(self.now) {
                let message = match windows.next_allowed_time(self.now) {
                    Some(next) => format!(
                        "Release is waiting for the update window: {}",
                        human_time(next)
                    ),
                    None => "Release is waiting for the update window".to_string(),
                };
                return self.wait(idx, message);
            }
        }

        if deployed_idx.is_some() && !deployment_ready {
            return self.wait(idx, MESSAGE_POD_NOT_READY.to_string());
        }

        if let Some(message) = self.requirement_failure(idx) {
            return self.block(idx, BlockReason::Requirement, message);
        }
        if let Some(message) = self.disruption_failure(idx) {
            return self.block(idx, BlockReason::Disruption, message);
        }

        if let Some(config) = self.policy.update.notification.clone() {
            if !self.release_data.notified_for(&release.version) {
                let apply_at = self.notify(&release, &config);
                if apply_at > self.now {
                    self.gate_actions.push(Action::ShiftApplyAfter {
                        name: release.name.clone(),
                        apply_after: apply_at,
                    });
                    return self.wait(
                        idx,
                        format!("Release is postponed until: {}", human_time(apply_at)),
                    );
                }
            }
        }

        self.deploy(idx, deployed_idx, Vec::new())
    }

    /// Queue the webhook and mark the minor as notified; returns the announced apply time
    fn notify(&mut self, release: &ReleaseView, config: &NotificationConfig) -> DateTime<Utc> {
        let minimal = chrono::Duration::from_std(config.minimal_notification_time)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let apply_at = if release.flags.apply_now {
            self.now
        } else {
            release
                .apply_after
                .map_or(self.now, |at| at.max(self.now))
                .max(self.now + minimal)
        };

        let link = release
            .changelog_link
            .clone()
            .unwrap_or_else(|| changelog_link(&release.version));
        self.gate_actions.push(Action::Notify {
            config: config.clone(),
            payload: WebhookPayload::new(
                &release.version,
                release.requirements.clone(),
                link,
                apply_at,
            ),
        });
        self.release_data.notified = true;
        self.release_data.version = version_tag(&release.version);
        self.release_data_changed = true;
        apply_at
    }

    fn apply_after_wait(&self, idx: usize) -> Option<String> {
        let release = &self.releases[idx];
        if release.flags.apply_now {
            return None;
        }
        let at = release.apply_after.filter(|at| *at > self.now)?;
        Some(if release.flags.notification_time_shift {
            format!("Release is postponed until: {}", human_time(at))
        } else {
            format!("Waiting for canary apply time: {}", human_time(at))
        })
    }

    fn requirement_failure(&self, idx: usize) -> Option<String> {
        let release = &self.releases[idx];
        release.requirements.iter().find_map(|(key, value)| {
            match self
                .policy
                .checks
                .check_requirement(key, value, self.policy.values)
            {
                Ok(()) => None,
                Err(RequirementError::NotRegistered(_)) => {
                    Some(format!("{key:?} requirement is not registered"))
                }
                Err(RequirementError::NotMet(reason)) => Some(format!(
                    "{key:?} requirement for DeckhouseRelease \"{}\" not met: {reason}",
                    release.version
                )),
            }
        })
    }

    fn disruption_failure(&self, idx: usize) -> Option<String> {
        let release = &self.releases[idx];
        if self.policy.update.disruption_approval_mode == UpdateMode::Auto
            || release.flags.disruption_approved
        {
            return None;
        }
        release.disruptions.iter().find_map(|kind| {
            let reason = self.policy.checks.check_disruption(kind, self.policy.values)?;
            Some(format!(
                "Release requires disruption approval (`kubectl annotate DeckhouseRelease {} {ANNOTATION_DISRUPTION_APPROVED}=true`): {reason}",
                release.name
            ))
        })
    }

    fn block(&mut self, idx: usize, reason: BlockReason, message: String) -> Decision {
        warn!(release = %self.releases[idx].name, reason = reason.as_str(), message = %message, "Release is blocked");
        self.blocked.push((self.releases[idx].name.clone(), reason));
        self.wait(idx, message)
    }

    fn wait(&mut self, idx: usize, message: String) -> Decision {
        debug!(release = %self.releases[idx].name, message = %message, "Release is waiting");
        self.set_status(idx, Phase::Pending, &message);
        Decision::Wait {
            release: self.releases[idx].name.clone(),
            reason: message,
        }
    }

    fn deploy(
        &mut self,
        idx: usize,
        deployed_idx: Option<usize>,
        mut superseded: Vec<String>,
    ) -> Decision {
        if let Some(deployed) = deployed_idx {
            superseded.insert(0, self.releases[deployed].name.clone());
        }

        let release = &self.releases[idx];
        let mut remove_annotations = Vec::new();
        for (set, key) in [
            (release.flags.force, ANNOTATION_FORCE),
            (release.flags.apply_now, ANNOTATION_APPLY_NOW),
            (release.flags.suspended, ANNOTATION_SUSPENDED),
        ] {
            if set {
                remove_annotations.push(key.to_string());
            }
        }

        info!(release = %release.name, superseded = ?superseded, "Applying release");
        Decision::Deploy(DeployTask {
            release: release.name.clone(),
            version: release.version.clone(),
            superseded,
            remove_annotations,
            release_data: ReleaseData {
                is_updating: true,
                notified: false,
                version: version_tag(&release.version),
            },
            at: self.now,
        })
    }

    fn finish(mut self, snapshot: &Snapshot, decision: Decision) -> Plan {
        let mut actions = Vec::new();

        for release in &snapshot.invalid {
            let message = release.skip_message();
            let phase_changed = !release.has_phase || release.phase != Phase::Skipped;
            if phase_changed || release.message != message {
                warn!(release = %release.name, version = %release.version, "Release version cannot be parsed");
                actions.push(Action::SetStatus {
                    name: release.name.clone(),
                    patch: StatusPatch {
                        phase: Some(Phase::Skipped),
                        message: Some(message),
                        approved: None,
                        transition_time: phase_changed.then_some(self.now),
                    },
                });
            }
        }

        // Releases touched by the deployment get their status from the applier
        let deploy_names: Vec<&str> = match &decision {
            Decision::Deploy(task) => std::iter::once(task.release.as_str())
                .chain(task.superseded.iter().map(String::as_str))
                .collect(),
            _ => Vec::new(),
        };
        for (name, patch) in std::mem::take(&mut self.statuses) {
            if !deploy_names.contains(&name.as_str()) && !patch.is_empty() {
                actions.push(Action::SetStatus { name, patch });
            }
        }

        let deploy_annotations: Vec<String> = match &decision {
            Decision::Deploy(task) => task.remove_annotations.clone(),
            _ => Vec::new(),
        };
        for (name, mut keys) in std::mem::take(&mut self.annotations) {
            if let Decision::Deploy(task) = &decision {
                if task.release == name {
                    keys.retain(|k| !deploy_annotations.contains(k));
                }
            }
            keys.dedup();
            if !keys.is_empty() {
                actions.push(Action::RemoveAnnotations { name, keys });
            }
        }

        actions.append(&mut self.gate_actions);

        let outcome = match decision {
            Decision::Idle => {
                if self.release_data_changed {
                    actions.push(Action::SaveReleaseData(self.release_data.clone()));
                }
                Outcome::Idle
            }
            Decision::Wait { release, reason } => {
                if self.release_data_changed {
                    actions.push(Action::SaveReleaseData(self.release_data.clone()));
                }
                Outcome::Waiting { release, reason }
            }
            Decision::Deploy(task) => {
                let release = task.release.clone();
                actions.push(Action::Deploy(task));
                Outcome::Deploy { release }
            }
        };

        Plan {
            actions,
            blocked: self.blocked,
            waiting_manual: self.waiting_manual,
            is_updating: self.release_data.is_updating,
            outcome,
        }
    }
}

#[cfg(test)]
#[path = "reconciler_test.rs"]
mod tests;
