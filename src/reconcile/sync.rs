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

//! Replica set bookkeeping shared by every strategy: finding or creating the new replica set,
//! scaling, history cleanup and status.

use super::util::{self, ConditionType, Reason, RolloutBudget, StrategyType};
use super::{Action, Error, HashCollisionSnafu, progress};
use crate::context::Context;
use crate::types::error::NoSpecSnafu;
use crate::types::tenanted::Tenanted;
use chrono::Utc;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet, ReplicaSetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use kube::runtime::events::EventType;
use snafu::OptionExt;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// The new replica set, if any, and every other claimed replica set.
pub struct ReplicaSetsView {
    pub new: Option<Tenanted<ReplicaSet>>,
    pub old: Vec<Tenanted<ReplicaSet>>,
}

impl ReplicaSetsView {
    pub fn all(&self) -> Vec<Tenanted<ReplicaSet>> {
        util::with_new(&self.old, self.new.as_ref())
    }

    /// Replaces the copy of `rs` held by this view.
    pub fn store(&mut self, rs: Tenanted<ReplicaSet>) {
        if let Some(new) = self.new.as_mut()
            && new.metadata.uid == rs.metadata.uid
        {
            *new = rs;
            return;
        }
        if let Some(old) = self
            .old
            .iter_mut()
            .find(|old| old.metadata.uid == rs.metadata.uid)
        {
            *old = rs;
        }
    }
}

/// Splits the claimed replica sets into new and old, syncing revision annotations on the way.
/// With `create` set a missing new replica set is created.
pub async fn get_all_replica_sets_and_sync_revision(
    ctx: &Context,
    deployment: &mut Tenanted<Deployment>,
    replica_sets: &[Tenanted<ReplicaSet>],
    create: bool,
) -> Result<ReplicaSetsView, Error> {
    let existing = util::find_new_replica_set(deployment, replica_sets);
    let old = util::find_old_replica_sets(replica_sets, existing.as_ref());
    let new = get_new_replica_set(ctx, deployment, existing, &old, create).await?;
    Ok(ReplicaSetsView { new, old })
}

async fn get_new_replica_set(
    ctx: &Context,
    deployment: &mut Tenanted<Deployment>,
    existing: Option<Tenanted<ReplicaSet>>,
    old: &[Tenanted<ReplicaSet>],
    create: bool,
) -> Result<Option<Tenanted<ReplicaSet>>, Error> {
    let budget = util::rollout_budget(deployment)?;
    let new_revision = util::max_revision(old) + 1;

    if let Some(existing) = existing {
        let mut rs = existing;
        let annotations_updated =
            util::set_new_replica_set_annotations(deployment, &mut rs, new_revision, true, budget);
        let min_ready_seconds = util::min_ready_seconds(deployment);
        let min_ready_changed =
            rs.spec.as_ref().and_then(|s| s.min_ready_seconds) != min_ready_seconds;
        if annotations_updated || min_ready_changed {
            rs.spec.get_or_insert_with(Default::default).min_ready_seconds = min_ready_seconds;
            return Ok(Some(ctx.update_replica_set(&rs).await?));
        }

        let revision = rs
            .annotations()
            .get(util::REVISION_ANNOTATION)
            .cloned()
            .unwrap_or_default();
        let mut needs_update = util::set_deployment_revision(deployment, &revision);

        let mut status = util::status(deployment);
        if util::progress_deadline(deployment).is_some()
            && util::get_condition(&status, ConditionType::Progressing).is_none()
        {
            util::set_condition(
                &mut status,
                util::new_condition(
                    ConditionType::Progressing,
                    util::CONDITION_TRUE,
                    Reason::FoundNewReplicaSet,
                    format!("Found new replica set \"{}\"", rs.name_any()),
                ),
            );
            needs_update = true;
        }
        if needs_update {
            *deployment = ctx.update_status(deployment, status).await?;
        }
        return Ok(Some(rs));
    }

    if !create {
        return Ok(None);
    }

    let new_rs = new_replica_set(deployment, old, new_revision, budget)?;
    let new_replicas = util::rs_replicas(&new_rs);
    let name = new_rs.name_any();

    let (created, already_exists) = match ctx.create_replica_set(&new_rs).await {
        Ok(created) => (created, false),
        Err(e) if e.is_already_exists() => {
            let key = new_rs.key()?;
            let Some(current) = ctx.replica_set_cache.get(&key) else {
                return Err(e.into());
            };
            let owned = util::controller_ref(&current.metadata)
                .is_some_and(|r| deployment.metadata.uid.as_deref() == Some(r.uid.as_str()));
            let same_template = match (
                util::rs_template(&current),
                deployment.spec.as_ref().map(|s| &s.template),
            ) {
                (Some(a), Some(b)) => util::equal_ignore_hash(a, b),
                _ => false,
            };
            if owned && same_template {
                ((*current).clone(), true)
            } else {
                let mut status = util::status(deployment);
                let collisions = status.collision_count.unwrap_or(0) + 1;
                status.collision_count = Some(collisions);
                match ctx.update_status(deployment, status).await {
                    Ok(updated) => {
                        *deployment = updated;
                        warn!(
                            deployment = %deployment.name_any(),
                            replica_set = %name,
                            collisions,
                            "found a hash collision for deployment"
                        );
                    }
                    Err(e) => {
                        debug!(error = %e, "failed to record hash collision");
                    }
                }
                return HashCollisionSnafu { name }.fail();
            }
        }
        Err(e) => {
            let message = format!("Failed to create new replica set \"{name}\": {e}");
            if util::progress_deadline(deployment).is_some() {
                let mut status = util::status(deployment);
                util::set_condition(
                    &mut status,
                    util::new_condition(
                        ConditionType::Progressing,
                        util::CONDITION_FALSE,
                        Reason::ReplicaSetCreateError,
                        message.clone(),
                    ),
                );
                if let Ok(updated) = ctx.update_status(deployment, status).await {
                    *deployment = updated;
                }
            }
            ctx.record(
                deployment,
                EventType::Warning,
                Reason::ReplicaSetCreateError,
                &message,
            )
            .await;
            return Err(e.into());
        }
    };

    if !already_exists && new_replicas > 0 {
        ctx.record(
            deployment,
            EventType::Normal,
            Reason::ScalingReplicaSet,
            &format!("Scaled up replica set {name} to {new_replicas}"),
        )
        .await;
    }

    let mut needs_update = util::set_deployment_revision(deployment, &new_revision.to_string());
    let mut status = util::status(deployment);
    if !already_exists && util::progress_deadline(deployment).is_some() {
        util::set_condition(
            &mut status,
            util::new_condition(
                ConditionType::Progressing,
                util::CONDITION_TRUE,
                Reason::NewReplicaSetCreated,
                format!("Created new replica set \"{name}\""),
            ),
        );
        needs_update = true;
    }
    if needs_update {
        *deployment = ctx.update_status(deployment, status).await?;
    }

    Ok(Some(created))
}

/// Builds the replica set for the deployment's current template.
fn new_replica_set(
    deployment: &Tenanted<Deployment>,
    old: &[Tenanted<ReplicaSet>],
    revision: i64,
    budget: RolloutBudget,
) -> Result<Tenanted<ReplicaSet>, Error> {
    let spec = deployment
        .spec
        .as_ref()
        .context(NoSpecSnafu {
            kind: "Deployment",
            name: deployment.name_any(),
        })?;
    let collision_count = deployment.status.as_ref().and_then(|s| s.collision_count);
    let hash = util::compute_hash(&spec.template, collision_count);
    let template = util::template_with_label(&spec.template, util::POD_TEMPLATE_HASH_LABEL, &hash);

    let mut selector = spec.selector.clone();
    selector
        .match_labels
        .get_or_insert_with(Default::default)
        .insert(util::POD_TEMPLATE_HASH_LABEL.to_string(), hash.clone());

    let mut rs = Tenanted::new(
        deployment.tenant.clone(),
        ReplicaSet {
            metadata: ObjectMeta {
                name: Some(format!("{}-{}", deployment.name_any(), hash)),
                namespace: deployment.namespace(),
                owner_references: Some(vec![util::new_controller_ref(deployment)]),
                labels: template.metadata.as_ref().and_then(|m| m.labels.clone()),
                ..Default::default()
            },
            spec: Some(ReplicaSetSpec {
                replicas: Some(0),
                min_ready_seconds: spec.min_ready_seconds,
                selector,
                template: Some(template),
            }),
            status: None,
        },
    );

    let all = util::with_new(old, Some(&rs));
    let replicas = util::new_rs_new_replicas(deployment, &all, &rs, budget);
    util::set_rs_replicas(&mut rs, replicas);
    util::set_new_replica_set_annotations(deployment, &mut rs, revision, false, budget);
    Ok(rs)
}

/// Sets `rs` to `replicas` and refreshes its desired/max annotations. Returns whether the
/// replica count changed, with the stored replica set.
pub async fn scale_replica_set(
    ctx: &Context,
    deployment: &Tenanted<Deployment>,
    rs: &Tenanted<ReplicaSet>,
    replicas: i32,
) -> Result<(bool, Tenanted<ReplicaSet>), Error> {
    let budget = util::rollout_budget(deployment)?;
    let desired = util::replicas(deployment);
    let current = util::rs_replicas(rs);
    let size_needs_update = current != replicas;
    let annotations_need_update =
        util::replicas_annotations_need_update(rs, desired, desired + budget.max_surge);

    if !size_needs_update && !annotations_need_update {
        return Ok((false, rs.clone()));
    }

    let mut next = rs.clone();
    util::set_rs_replicas(&mut next, replicas);
    util::set_replicas_annotations(&mut next, desired, desired + budget.max_surge);
    let stored = ctx.update_replica_set(&next).await?;

    if size_needs_update {
        let direction = if current < replicas { "up" } else { "down" };
        info!(
            deployment = %deployment.name_any(),
            replica_set = %rs.name_any(),
            from = current,
            to = replicas,
            "scaled replica set"
        );
        ctx.record(
            deployment,
            EventType::Normal,
            Reason::ScalingReplicaSet,
            &format!(
                "Scaled {direction} replica set {} to {replicas}",
                rs.name_any()
            ),
        )
        .await;
    }
    Ok((size_needs_update, stored))
}

/// Share of `to_add` replicas that falls on `rs`, given what the larger replica sets took.
fn proportion(
    deployment: &Deployment,
    rs: &ReplicaSet,
    budget: RolloutBudget,
    to_add: i32,
    added: i32,
) -> i32 {
    if util::rs_replicas(rs) == 0 || to_add == 0 || to_add == added {
        return 0;
    }
    let fraction = fraction(deployment, rs, budget);
    let allowed = to_add - added;
    if to_add > 0 {
        fraction.min(allowed)
    } else {
        fraction.max(allowed)
    }
}

/// How many replicas `rs` gains or loses when scaled proportionally to the deployment's new size.
fn fraction(deployment: &Deployment, rs: &ReplicaSet, budget: RolloutBudget) -> i32 {
    let desired = util::replicas(deployment);
    let current = util::rs_replicas(rs);
    if desired == 0 {
        return -current;
    }

    let deployment_replicas = desired + budget.max_surge;
    let annotated = util::max_replicas_annotation(rs)
        .unwrap_or_else(|| util::status(deployment).replicas.unwrap_or(0));
    if annotated == 0 {
        return 0;
    }

    let target = f64::from(current) * f64::from(deployment_replicas) / f64::from(annotated);
    target.round() as i32 - current
}

/// Reconciles replica counts with `spec.replicas` without moving the rollout forward.
pub async fn scale(
    ctx: &Context,
    deployment: &Tenanted<Deployment>,
    view: &mut ReplicaSetsView,
) -> Result<(), Error> {
    let desired = util::replicas(deployment);

    if let Some(rs) = util::find_active_or_latest(view.new.as_ref(), &view.old) {
        if util::rs_replicas(&rs) == desired {
            return Ok(());
        }
        let (_, stored) = scale_replica_set(ctx, deployment, &rs, desired).await?;
        view.store(stored);
        return Ok(());
    }

    if util::is_saturated(deployment, view.new.as_ref()) {
        for rs in util::filter_active(&view.old) {
            let (_, stored) = scale_replica_set(ctx, deployment, &rs, 0).await?;
            view.store(stored);
        }
        return Ok(());
    }

    if util::strategy_type(deployment) != StrategyType::RollingUpdate {
        return Ok(());
    }

    let budget = util::rollout_budget(deployment)?;
    let mut active = util::filter_active(&view.all());
    let current = util::sum_replicas(&active);
    let allowed = if desired > 0 {
        desired + budget.max_surge
    } else {
        0
    };
    let to_add = allowed - current;

    if to_add > 0 {
        util::sort_by_size_newer(&mut active);
    } else if to_add < 0 {
        util::sort_by_size_older(&mut active);
    }

    let mut sizes: HashMap<String, i32> = HashMap::new();
    let mut added = 0;
    for rs in &active {
        let mut size = util::rs_replicas(rs);
        if to_add != 0 {
            let share = proportion(deployment, rs, budget, to_add, added);
            size += share;
            added += share;
        }
        sizes.insert(rs.name_any(), size);
    }

    if to_add != 0
        && let Some(first) = active.first()
        && let Some(size) = sizes.get_mut(&first.name_any())
    {
        *size = (*size + to_add - added).max(0);
    }

    debug!(
        deployment = %deployment.name_any(),
        to_add,
        "scaling replica sets proportionally"
    );
    for rs in &active {
        let size = sizes.get(&rs.name_any()).copied().unwrap_or(0).max(0);
        let (_, stored) = scale_replica_set(ctx, deployment, rs, size).await?;
        view.store(stored);
    }
    Ok(())
}

/// Deletes old replica sets beyond the revision history limit, oldest revision first. Only
/// fully scaled-down replica sets whose status has caught up are deleted.
pub async fn cleanup_deployment(
    ctx: &Context,
    deployment: &Tenanted<Deployment>,
    old: &[Tenanted<ReplicaSet>],
) -> Result<(), Error> {
    let Some(limit) = util::revision_history_limit(deployment) else {
        return Ok(());
    };

    let mut alive: Vec<_> = old
        .iter()
        .filter(|rs| rs.metadata.deletion_timestamp.is_none())
        .cloned()
        .collect();
    let diff = alive.len() as i64 - i64::from(limit);
    if diff <= 0 {
        return Ok(());
    }
    util::sort_by_revision(&mut alive);
    debug!(deployment = %deployment.name_any(), count = diff, "looking to clean up old replica sets");

    for rs in alive.iter().take(diff as usize) {
        let observed = rs
            .status
            .as_ref()
            .and_then(|s| s.observed_generation)
            .unwrap_or(0);
        let generation = rs.metadata.generation.unwrap_or(0);
        if util::rs_actual_replicas(rs) != 0 || util::rs_replicas(rs) != 0 || observed < generation
        {
            continue;
        }
        match ctx.delete_replica_set(rs).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Writes the calculated status if it differs from the recorded one.
pub async fn sync_deployment_status(
    ctx: &Context,
    deployment: &mut Tenanted<Deployment>,
    view: &ReplicaSetsView,
) -> Result<Action, Error> {
    let budget = util::rollout_budget(deployment)?;
    let status = util::calculate_status(deployment, &view.all(), view.new.as_ref(), budget);
    if deployment.status.as_ref() == Some(&status) {
        return Ok(Action::await_change());
    }
    *deployment = ctx.update_status(deployment, status).await?;
    Ok(Action::await_change())
}

/// Status only; used for deployments being deleted.
pub async fn sync_status_only(
    ctx: &Context,
    deployment: &mut Tenanted<Deployment>,
    replica_sets: &[Tenanted<ReplicaSet>],
) -> Result<Action, Error> {
    let view = get_all_replica_sets_and_sync_revision(ctx, deployment, replica_sets, false).await?;
    sync_deployment_status(ctx, deployment, &view).await
}

/// Scaling without rollout progress, for paused deployments and scaling events.
pub async fn sync(
    ctx: &Context,
    deployment: &mut Tenanted<Deployment>,
    replica_sets: &[Tenanted<ReplicaSet>],
) -> Result<Action, Error> {
    let mut view =
        get_all_replica_sets_and_sync_revision(ctx, deployment, replica_sets, false).await?;
    scale(ctx, deployment, &mut view).await?;

    if util::paused(deployment) && util::rollback_to(deployment).is_none() {
        cleanup_deployment(ctx, deployment, &view.old).await?;
    }

    sync_deployment_status(ctx, deployment, &view).await
}

/// An active replica set was sized for a different `spec.replicas`.
pub async fn is_scaling_event(
    ctx: &Context,
    deployment: &mut Tenanted<Deployment>,
    replica_sets: &[Tenanted<ReplicaSet>],
) -> Result<bool, Error> {
    let view = get_all_replica_sets_and_sync_revision(ctx, deployment, replica_sets, false).await?;
    let desired = util::replicas(deployment);
    Ok(util::filter_active(&view.all())
        .iter()
        .filter_map(|rs| util::desired_replicas_annotation(rs))
        .any(|annotated| annotated != desired))
}

/// Status plus progress conditions, then a requeue if the rollout may time out.
pub async fn sync_rollout_status(
    ctx: &Context,
    deployment: &mut Tenanted<Deployment>,
    view: &ReplicaSetsView,
) -> Result<Action, Error> {
    let budget = util::rollout_budget(deployment)?;
    let mut status = util::calculate_status(deployment, &view.all(), view.new.as_ref(), budget);
    progress::update_progress(deployment, view, &mut status, Utc::now());

    if deployment.status.as_ref() == Some(&status) {
        return Ok(progress::requeue_stuck_deployment(deployment, &status, Utc::now())
            .map_or_else(Action::await_change, Action::requeue));
    }
    *deployment = ctx.update_status(deployment, status).await?;
    Ok(Action::await_change())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::tests::{TENANT_DEFAULT, new_deployment, new_replica_set, with_max_replicas};
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

    #[test]
    fn test_fraction_follows_max_replicas_annotation() {
        let d = new_deployment(
            "web",
            12,
            None,
            Some(IntOrString::Int(3)),
            None,
            TENANT_DEFAULT,
        );
        let budget = util::rollout_budget(&d).unwrap();
        let rs = with_max_replicas(new_replica_set(&d, "web-a", 5, TENANT_DEFAULT), 10);

        // 5 * (12 + 3) / 10 = 7.5, rounded to 8
        assert_eq!(fraction(&d, &rs, budget), 3);
        assert_eq!(proportion(&d, &rs, budget, 2, 0), 2);
        assert_eq!(proportion(&d, &rs, budget, 5, 5), 0);
    }

    #[test]
    fn test_fraction_without_replicas() {
        let d = new_deployment("web", 0, None, None, None, TENANT_DEFAULT);
        let budget = util::rollout_budget(&d).unwrap();
        let rs = new_replica_set(&d, "web-a", 4, TENANT_DEFAULT);

        assert_eq!(fraction(&d, &rs, budget), -4);
    }
}
