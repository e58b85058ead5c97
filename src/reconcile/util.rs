// Copyright 2025 RustFS Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


//! Annotations, budgets and bookkeeping shared by the rollout strategies.

use crate::types::error::{Error, InvalidIntOrPercentSnafu};
use crate::types::tenanted::Tenanted;
use crate::utils::time;
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::{
    Deployment, DeploymentCondition, DeploymentStatus, ReplicaSet,
};
use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use strum::{Display, EnumString};

const DEPLOYMENT_ANNOTATION_PREFIX: &str = "deployment.kubernetes.io/";

pub const REVISION_ANNOTATION: &str = const_str::concat!(DEPLOYMENT_ANNOTATION_PREFIX, "revision");
pub const REVISION_HISTORY_ANNOTATION: &str =
    const_str::concat!(DEPLOYMENT_ANNOTATION_PREFIX, "revision-history");
pub const DESIRED_REPLICAS_ANNOTATION: &str =
    const_str::concat!(DEPLOYMENT_ANNOTATION_PREFIX, "desired-replicas");
pub const MAX_REPLICAS_ANNOTATION: &str =
    const_str::concat!(DEPLOYMENT_ANNOTATION_PREFIX, "max-replicas");
pub const ROLLBACK_TO_ANNOTATION: &str = "deprecated.deployment.rollback.to";
pub const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

pub const POD_TEMPLATE_HASH_LABEL: &str = "pod-template-hash";

pub const CONTROLLER_KIND: &str = "Deployment";
pub const CONTROLLER_API_VERSION: &str = "apps/v1";

const DEFAULT_MAX_SURGE: &str = "25%";
const DEFAULT_MAX_UNAVAILABLE: &str = "25%";

/// Deployment annotations that never propagate to its ReplicaSets.
const ANNOTATIONS_TO_SKIP: [&str; 6] = [
    LAST_APPLIED_ANNOTATION,
    REVISION_ANNOTATION,
    REVISION_HISTORY_ANNOTATION,
    DESIRED_REPLICAS_ANNOTATION,
    MAX_REPLICAS_ANNOTATION,
    ROLLBACK_TO_ANNOTATION,
];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Display, EnumString)]
pub enum StrategyType {
    #[default]
    RollingUpdate,
    Recreate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum ConditionType {
    Available,
    Progressing,
    ReplicaFailure,
}

/// Condition and event reasons.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum Reason {
    MinimumReplicasAvailable,
    MinimumReplicasUnavailable,
    NewReplicaSetCreated,
    FoundNewReplicaSet,
    ReplicaSetUpdated,
    NewReplicaSetAvailable,
    ProgressDeadlineExceeded,
    DeploymentPaused,
    DeploymentResumed,
    ReplicaSetCreateError,
    ScalingReplicaSet,
    SelectingAll,
    DeploymentRollback,
    DeploymentRollbackRevisionNotFound,
    DeploymentRollbackTemplateUnchanged,
    SyncFailed,
}

pub const CONDITION_TRUE: &str = "True";
pub const CONDITION_FALSE: &str = "False";
pub const CONDITION_UNKNOWN: &str = "Unknown";

/// Surge and unavailability allowances of a rolling update, resolved against `replicas`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RolloutBudget {
    pub max_surge: i32,
    pub max_unavailable: i32,
}

impl RolloutBudget {
    /// With both allowances at zero a rolling update can neither add nor remove pods.
    pub fn is_blocked(&self) -> bool {
        self.max_surge == 0 && self.max_unavailable == 0
    }
}

// ---- deployment accessors ----

pub fn replicas(d: &Deployment) -> i32 {
    d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1)
}

pub fn paused(d: &Deployment) -> bool {
    d.spec.as_ref().and_then(|s| s.paused).unwrap_or(false)
}

pub fn min_ready_seconds(d: &Deployment) -> Option<i32> {
    d.spec.as_ref().and_then(|s| s.min_ready_seconds)
}

/// The progress deadline in seconds; unset or `i32::MAX` means none is tracked.
pub fn progress_deadline(d: &Deployment) -> Option<i32> {
    d.spec
        .as_ref()
        .and_then(|s| s.progress_deadline_seconds)
        .filter(|secs| *secs != i32::MAX)
}

pub fn revision_history_limit(d: &Deployment) -> Option<i32> {
    d.spec.as_ref().and_then(|s| s.revision_history_limit)
}

pub fn strategy_type(d: &Deployment) -> StrategyType {
    d.spec
        .as_ref()
        .and_then(|s| s.strategy.as_ref())
        .and_then(|s| s.type_.as_deref())
        .and_then(|t| t.parse().ok())
        .unwrap_or_default()
}

pub fn status(d: &Deployment) -> DeploymentStatus {
    d.status.clone().unwrap_or_default()
}

pub fn generation(d: &Deployment) -> i64 {
    d.metadata.generation.unwrap_or(0)
}

// ---- replica set accessors ----

pub fn rs_replicas(rs: &ReplicaSet) -> i32 {
    rs.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1)
}

pub fn set_rs_replicas(rs: &mut ReplicaSet, replicas: i32) {
    rs.spec.get_or_insert_with(Default::default).replicas = Some(replicas);
}

pub fn rs_actual_replicas(rs: &ReplicaSet) -> i32 {
    rs.status.as_ref().map_or(0, |s| s.replicas)
}

pub fn rs_ready_replicas(rs: &ReplicaSet) -> i32 {
    rs.status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0)
}

pub fn rs_available_replicas(rs: &ReplicaSet) -> i32 {
    rs.status
        .as_ref()
        .and_then(|s| s.available_replicas)
        .unwrap_or(0)
}

pub fn rs_template(rs: &ReplicaSet) -> Option<&PodTemplateSpec> {
    rs.spec.as_ref().and_then(|s| s.template.as_ref())
}

pub fn sum_replicas(rss: &[Tenanted<ReplicaSet>]) -> i32 {
    rss.iter().map(|rs| rs_replicas(rs)).sum()
}

pub fn sum_actual_replicas(rss: &[Tenanted<ReplicaSet>]) -> i32 {
    rss.iter().map(|rs| rs_actual_replicas(rs)).sum()
}

pub fn sum_ready_replicas(rss: &[Tenanted<ReplicaSet>]) -> i32 {
    rss.iter().map(|rs| rs_ready_replicas(rs)).sum()
}

pub fn sum_available_replicas(rss: &[Tenanted<ReplicaSet>]) -> i32 {
    rss.iter().map(|rs| rs_available_replicas(rs)).sum()
}

pub fn filter_active(rss: &[Tenanted<ReplicaSet>]) -> Vec<Tenanted<ReplicaSet>> {
    rss.iter()
        .filter(|rs| rs_replicas(rs) > 0)
        .cloned()
        .collect()
}

/// Old replica sets followed by the new one, when present.
pub fn with_new(
    old: &[Tenanted<ReplicaSet>],
    new: Option<&Tenanted<ReplicaSet>>,
) -> Vec<Tenanted<ReplicaSet>> {
    old.iter().cloned().chain(new.cloned()).collect()
}

// ---- ordering ----

pub fn created_at(meta: &ObjectMeta) -> Option<DateTime<Utc>> {
    meta.creation_timestamp.as_ref().and_then(time::to_chrono)
}

fn by_creation(a: &Tenanted<ReplicaSet>, b: &Tenanted<ReplicaSet>) -> Ordering {
    created_at(&a.metadata)
        .cmp(&created_at(&b.metadata))
        .then_with(|| a.name_any().cmp(&b.name_any()))
}

/// Oldest first, ties by name.
pub fn sort_by_creation(rss: &mut [Tenanted<ReplicaSet>]) {
    rss.sort_by(by_creation);
}

/// Lowest revision first, ties by creation.
pub fn sort_by_revision(rss: &mut [Tenanted<ReplicaSet>]) {
    rss.sort_by(|a, b| {
        revision(&a.metadata)
            .unwrap_or(0)
            .cmp(&revision(&b.metadata).unwrap_or(0))
            .then_with(|| by_creation(a, b))
    });
}

/// Largest first; equal sizes newest first.
pub fn sort_by_size_newer(rss: &mut [Tenanted<ReplicaSet>]) {
    rss.sort_by(|a, b| {
        rs_replicas(b)
            .cmp(&rs_replicas(a))
            .then_with(|| by_creation(b, a))
    });
}

/// Largest first; equal sizes oldest first.
pub fn sort_by_size_older(rss: &mut [Tenanted<ReplicaSet>]) {
    rss.sort_by(|a, b| {
        rs_replicas(b)
            .cmp(&rs_replicas(a))
            .then_with(|| by_creation(a, b))
    });
}

// ---- owner references ----

pub fn controller_ref(meta: &ObjectMeta) -> Option<&OwnerReference> {
    meta.owner_references
        .iter()
        .flatten()
        .find(|r| r.controller == Some(true))
}

pub fn new_controller_ref(d: &Deployment) -> OwnerReference {
    OwnerReference {
        api_version: CONTROLLER_API_VERSION.to_string(),
        kind: CONTROLLER_KIND.to_string(),
        name: d.name_any(),
        uid: d.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

// ---- revisions and annotations ----

/// Revision recorded on an object; a missing annotation is revision 0, a malformed one is
/// `None`.
pub fn revision(meta: &ObjectMeta) -> Option<i64> {
    match meta.annotations.as_ref().and_then(|a| a.get(REVISION_ANNOTATION)) {
        Some(raw) => raw.parse().ok(),
        None => Some(0),
    }
}

pub fn max_revision(rss: &[Tenanted<ReplicaSet>]) -> i64 {
    rss.iter()
        .filter_map(|rs| revision(&rs.metadata))
        .max()
        .unwrap_or(0)
}

/// The second-highest revision, i.e. the one before the current.
pub fn last_revision(rss: &[Tenanted<ReplicaSet>]) -> i64 {
    let (mut max, mut second) = (0, 0);
    for rev in rss.iter().filter_map(|rs| revision(&rs.metadata)) {
        if rev >= max {
            second = max;
            max = rev;
        } else if rev > second {
            second = rev;
        }
    }
    second
}

fn annotation<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a String> {
    meta.annotations.as_ref().and_then(|a| a.get(key))
}

fn set_annotation(meta: &mut ObjectMeta, key: &str, value: String) -> bool {
    let annotations = meta.annotations.get_or_insert_with(BTreeMap::new);
    if annotations.get(key) == Some(&value) {
        return false;
    }
    annotations.insert(key.to_string(), value);
    true
}

/// Requested rollback revision; a malformed annotation is ignored.
pub fn rollback_to(d: &Deployment) -> Option<i64> {
    annotation(&d.metadata, ROLLBACK_TO_ANNOTATION).and_then(|raw| raw.parse().ok())
}

pub fn clear_rollback_to(d: &mut Deployment) {
    if let Some(annotations) = d.metadata.annotations.as_mut() {
        annotations.remove(ROLLBACK_TO_ANNOTATION);
    }
}

pub fn set_deployment_revision(d: &mut Deployment, revision: &str) -> bool {
    set_annotation(&mut d.metadata, REVISION_ANNOTATION, revision.to_string())
}

pub fn desired_replicas_annotation(rs: &ReplicaSet) -> Option<i32> {
    annotation(&rs.metadata, DESIRED_REPLICAS_ANNOTATION).and_then(|raw| raw.parse().ok())
}

pub fn max_replicas_annotation(rs: &ReplicaSet) -> Option<i32> {
    annotation(&rs.metadata, MAX_REPLICAS_ANNOTATION).and_then(|raw| raw.parse().ok())
}

pub fn replicas_annotations_need_update(rs: &ReplicaSet, desired: i32, max: i32) -> bool {
    desired_replicas_annotation(rs) != Some(desired) || max_replicas_annotation(rs) != Some(max)
}

pub fn set_replicas_annotations(rs: &mut ReplicaSet, desired: i32, max: i32) -> bool {
    let desired_changed =
        set_annotation(&mut rs.metadata, DESIRED_REPLICAS_ANNOTATION, desired.to_string());
    let max_changed = set_annotation(&mut rs.metadata, MAX_REPLICAS_ANNOTATION, max.to_string());
    desired_changed || max_changed
}

fn copy_deployment_annotations(d: &Deployment, rs: &mut ReplicaSet) -> bool {
    let mut changed = false;
    for (key, value) in d.annotations() {
        if ANNOTATIONS_TO_SKIP.contains(&key.as_str()) {
            continue;
        }
        changed |= set_annotation(&mut rs.metadata, key, value.clone());
    }
    changed
}

/// Replaces the deployment's annotations with the ones of the replica set it rolls back to,
/// keeping its own bookkeeping annotations.
pub fn set_deployment_annotations_to(d: &mut Deployment, rs: &ReplicaSet) {
    let annotations = d.annotations_mut();
    annotations.retain(|key, _| ANNOTATIONS_TO_SKIP.contains(&key.as_str()));
    for (key, value) in rs.annotations() {
        if !ANNOTATIONS_TO_SKIP.contains(&key.as_str()) {
            annotations.insert(key.clone(), value.clone());
        }
    }
}

/// Brings a new replica set's annotations up to date. Returns whether anything changed.
pub fn set_new_replica_set_annotations(
    d: &Deployment,
    rs: &mut ReplicaSet,
    new_revision: i64,
    exists: bool,
    budget: RolloutBudget,
) -> bool {
    let mut changed = copy_deployment_annotations(d, rs);

    let current = revision(&rs.metadata).unwrap_or(0);
    if current < new_revision {
        changed |= set_annotation(&mut rs.metadata, REVISION_ANNOTATION, new_revision.to_string());
    }
    if !exists {
        let desired = replicas(d);
        changed |= set_replicas_annotations(rs, desired, desired + budget.max_surge);
    }
    changed
}

// ---- budgets ----

/// Resolves an absolute or percentage value against `total`.
pub fn value_from_int_or_percent(
    field: &str,
    value: &IntOrString,
    total: i32,
    round_up: bool,
) -> Result<i32, Error> {
    let invalid = |message: &str| {
        InvalidIntOrPercentSnafu {
            field,
            value: match value {
                IntOrString::Int(i) => i.to_string(),
                IntOrString::String(s) => s.clone(),
            },
            message,
        }
        .build()
    };

    let resolved = match value {
        IntOrString::Int(i) => *i,
        IntOrString::String(raw) => {
            let percent: i64 = raw
                .strip_suffix('%')
                .and_then(|p| p.parse().ok())
                .ok_or_else(|| invalid("must be an integer or a percentage"))?;
            let scaled = percent * i64::from(total);
            let resolved = if round_up {
                (scaled + 99).div_euclid(100)
            } else {
                scaled.div_euclid(100)
            };
            i32::try_from(resolved).map_err(|_| invalid("out of range"))?
        }
    };

    if resolved < 0 {
        return Err(invalid("must not be negative"));
    }
    Ok(resolved)
}

/// Surge (rounded up) and unavailability (rounded down) of a rolling update. Recreate
/// deployments have no budget.
pub fn rollout_budget(d: &Deployment) -> Result<RolloutBudget, Error> {
    if strategy_type(d) != StrategyType::RollingUpdate {
        return Ok(RolloutBudget::default());
    }
    let desired = replicas(d);
    let rolling = d
        .spec
        .as_ref()
        .and_then(|s| s.strategy.as_ref())
        .and_then(|s| s.rolling_update.as_ref());
    let default_surge = IntOrString::String(DEFAULT_MAX_SURGE.to_string());
    let default_unavailable = IntOrString::String(DEFAULT_MAX_UNAVAILABLE.to_string());

    let max_surge = value_from_int_or_percent(
        "maxSurge",
        rolling
            .and_then(|r| r.max_surge.as_ref())
            .unwrap_or(&default_surge),
        desired,
        true,
    )?;
    let max_unavailable = value_from_int_or_percent(
        "maxUnavailable",
        rolling
            .and_then(|r| r.max_unavailable.as_ref())
            .unwrap_or(&default_unavailable),
        desired,
        false,
    )?;

    Ok(RolloutBudget {
        max_surge,
        max_unavailable: max_unavailable.min(desired),
    })
}

// ---- templates ----

fn without_hash_label(template: &PodTemplateSpec) -> PodTemplateSpec {
    let mut template = template.clone();
    if let Some(metadata) = template.metadata.as_mut() {
        if let Some(labels) = metadata.labels.as_mut() {
            labels.remove(POD_TEMPLATE_HASH_LABEL);
            if labels.is_empty() {
                metadata.labels = None;
            }
        }
    }
    template
}

/// Template equality ignoring the `pod-template-hash` label.
pub fn equal_ignore_hash(a: &PodTemplateSpec, b: &PodTemplateSpec) -> bool {
    without_hash_label(a) == without_hash_label(b)
}

/// Stable short hash of a template and the collision counter, used in replica set names.
pub fn compute_hash(template: &PodTemplateSpec, collision_count: Option<i32>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(&without_hash_label(template)).unwrap_or_default());
    if let Some(count) = collision_count {
        hasher.update(count.to_be_bytes());
    }
    let digest = hasher.finalize();
    digest[..5].iter().map(|b| format!("{b:02x}")).collect()
}

/// Copy of the template with the given label added.
pub fn template_with_label(template: &PodTemplateSpec, key: &str, value: &str) -> PodTemplateSpec {
    let mut template = template.clone();
    template
        .metadata
        .get_or_insert_with(Default::default)
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), value.to_string());
    template
}

// ---- new / old replica sets ----

/// The oldest replica set running the deployment's current template.
pub fn find_new_replica_set(
    d: &Deployment,
    rss: &[Tenanted<ReplicaSet>],
) -> Option<Tenanted<ReplicaSet>> {
    let template = &d.spec.as_ref()?.template;
    let mut sorted = rss.to_vec();
    sort_by_creation(&mut sorted);
    sorted
        .into_iter()
        .find(|rs| rs_template(rs).is_some_and(|t| equal_ignore_hash(t, template)))
}

/// Every replica set except the new one.
pub fn find_old_replica_sets(
    rss: &[Tenanted<ReplicaSet>],
    new: Option<&Tenanted<ReplicaSet>>,
) -> Vec<Tenanted<ReplicaSet>> {
    let new_uid = new.and_then(|rs| rs.metadata.uid.clone());
    rss.iter()
        .filter(|rs| new_uid.is_none() || rs.metadata.uid != new_uid)
        .cloned()
        .collect()
}

/// The only active replica set, or the newest one when none is active.
pub fn find_active_or_latest(
    new: Option<&Tenanted<ReplicaSet>>,
    old: &[Tenanted<ReplicaSet>],
) -> Option<Tenanted<ReplicaSet>> {
    if new.is_none() && old.is_empty() {
        return None;
    }
    let mut old = old.to_vec();
    sort_by_creation(&mut old);
    old.reverse();

    let active = filter_active(&with_new(&old, new));
    match active.len() {
        0 => new.cloned().or_else(|| old.first().cloned()),
        1 => active.into_iter().next(),
        _ => None,
    }
}

/// Whether the new replica set runs every desired replica, available.
pub fn is_saturated(d: &Deployment, rs: Option<&Tenanted<ReplicaSet>>) -> bool {
    let Some(rs) = rs else {
        return false;
    };
    let desired = replicas(d);
    rs_replicas(rs) == desired
        && desired_replicas_annotation(rs) == Some(desired)
        && rs_available_replicas(rs) == desired
}

/// Replica count the new replica set may grow to right now.
pub fn new_rs_new_replicas(
    d: &Deployment,
    all: &[Tenanted<ReplicaSet>],
    new: &ReplicaSet,
    budget: RolloutBudget,
) -> i32 {
    let desired = replicas(d);
    match strategy_type(d) {
        StrategyType::Recreate => desired,
        StrategyType::RollingUpdate => {
            let current = sum_replicas(all);
            let max_total = desired + budget.max_surge;
            if current >= max_total {
                return rs_replicas(new);
            }
            let scale_up = (max_total - current).min(desired - rs_replicas(new)).max(0);
            rs_replicas(new) + scale_up
        }
    }
}

// ---- conditions ----

pub fn get_condition<'a>(
    status: &'a DeploymentStatus,
    type_: ConditionType,
) -> Option<&'a DeploymentCondition> {
    let type_ = type_.to_string();
    status.conditions.iter().flatten().find(|c| c.type_ == type_)
}

pub fn new_condition(
    type_: ConditionType,
    status: &str,
    reason: Reason,
    message: impl Into<String>,
) -> DeploymentCondition {
    let now = time::now_time();
    DeploymentCondition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: Some(reason.to_string()),
        message: Some(message.into()),
        last_update_time: now.clone(),
        last_transition_time: now,
    }
}

/// Sets a condition. An existing condition with the same status and reason is kept untouched;
/// with the same status only, its transition time is carried over.
pub fn set_condition(status: &mut DeploymentStatus, mut condition: DeploymentCondition) {
    let type_ = condition.type_.clone();
    if let Some(current) = status.conditions.iter().flatten().find(|c| c.type_ == type_) {
        if current.status == condition.status && current.reason == condition.reason {
            return;
        }
        if current.status == condition.status {
            condition.last_transition_time = current.last_transition_time.clone();
        }
    }
    let conditions = status.conditions.get_or_insert_with(Vec::new);
    conditions.retain(|c| c.type_ != type_);
    conditions.push(condition);
}

pub fn remove_condition(status: &mut DeploymentStatus, type_: ConditionType) {
    let type_ = type_.to_string();
    if let Some(conditions) = status.conditions.as_mut() {
        conditions.retain(|c| c.type_ != type_);
    }
}

fn has_reason(condition: Option<&DeploymentCondition>, reason: Reason) -> bool {
    condition.is_some_and(|c| c.reason.as_deref() == Some(reason.to_string().as_str()))
}

pub fn condition_has_reason(status: &DeploymentStatus, type_: ConditionType, reason: Reason) -> bool {
    has_reason(get_condition(status, type_), reason)
}

// ---- rollout progress ----

/// Every desired replica is updated and available, for the current generation.
pub fn deployment_complete(d: &Deployment, status: &DeploymentStatus) -> bool {
    let desired = replicas(d);
    status.updated_replicas.unwrap_or(0) == desired
        && status.replicas.unwrap_or(0) == desired
        && status.available_replicas.unwrap_or(0) == desired
        && status.observed_generation.unwrap_or(0) >= generation(d)
}

/// Whether `status` shows progress over the deployment's recorded status.
pub fn deployment_progressing(d: &Deployment, status: &DeploymentStatus) -> bool {
    let old = self::status(d);
    let old_old_replicas = old.replicas.unwrap_or(0) - old.updated_replicas.unwrap_or(0);
    let new_old_replicas = status.replicas.unwrap_or(0) - status.updated_replicas.unwrap_or(0);

    status.updated_replicas.unwrap_or(0) > old.updated_replicas.unwrap_or(0)
        || new_old_replicas < old_old_replicas
        || status.ready_replicas.unwrap_or(0) > old.ready_replicas.unwrap_or(0)
        || status.available_replicas.unwrap_or(0) > old.available_replicas.unwrap_or(0)
}

/// Whether the last recorded progress is older than the progress deadline.
pub fn deployment_timed_out(d: &Deployment, status: &DeploymentStatus, now: DateTime<Utc>) -> bool {
    let Some(deadline) = progress_deadline(d) else {
        return false;
    };
    let Some(condition) = get_condition(status, ConditionType::Progressing) else {
        return false;
    };
    if has_reason(Some(condition), Reason::NewReplicaSetAvailable) {
        return false;
    }
    if has_reason(Some(condition), Reason::ProgressDeadlineExceeded) {
        return true;
    }
    condition
        .last_update_time
        .as_ref()
        .and_then(time::to_chrono)
        .is_some_and(|from| from + chrono::Duration::seconds(i64::from(deadline)) < now)
}

/// Status derived from the replica sets; conditions other than `Available` are carried over.
pub fn calculate_status(
    d: &Deployment,
    all: &[Tenanted<ReplicaSet>],
    new: Option<&Tenanted<ReplicaSet>>,
    budget: RolloutBudget,
) -> DeploymentStatus {
    let current = status(d);
    let available = sum_available_replicas(all);
    let total = sum_replicas(all);
    let unavailable = (total - available).max(0);

    let mut next = DeploymentStatus {
        observed_generation: d.metadata.generation,
        replicas: Some(sum_actual_replicas(all)),
        updated_replicas: Some(new.map_or(0, |rs| rs_actual_replicas(rs))),
        ready_replicas: Some(sum_ready_replicas(all)),
        available_replicas: Some(available),
        unavailable_replicas: Some(unavailable),
        collision_count: current.collision_count,
        conditions: current.conditions.clone(),
        ..Default::default()
    };

    let condition = if available >= replicas(d) - budget.max_unavailable {
        new_condition(
            ConditionType::Available,
            CONDITION_TRUE,
            Reason::MinimumReplicasAvailable,
            "Deployment has minimum availability.",
        )
    } else {
        new_condition(
            ConditionType::Available,
            CONDITION_FALSE,
            Reason::MinimumReplicasUnavailable,
            "Deployment does not have minimum availability.",
        )
    };
    set_condition(&mut next, condition);
    next
}
