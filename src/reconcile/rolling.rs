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

use super::sync::{self, ReplicaSetsView};
use super::util::{self, RolloutBudget};
use super::{Action, Error};
use crate::context::Context;
use crate::types::tenanted::Tenanted;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use kube::ResourceExt;
use tracing::{debug, warn};

/// Moves a rolling update one step: grow the new replica set within the surge budget, shrink
/// old ones within the availability budget, then clean up once complete.
pub async fn rollout_rolling(
    ctx: &Context,
    deployment: &mut Tenanted<Deployment>,
    replica_sets: &[Tenanted<ReplicaSet>],
) -> Result<Action, Error> {
    let mut view =
        sync::get_all_replica_sets_and_sync_revision(ctx, deployment, replica_sets, true).await?;
    let budget = util::rollout_budget(deployment)?;

    if budget.is_blocked() && !util::deployment_complete(deployment, &util::status(deployment)) {
        warn!(
            deployment = %deployment.name_any(),
            "maxSurge and maxUnavailable are both 0, rollout cannot progress"
        );
    }

    if reconcile_new_replica_set(ctx, deployment, &mut view, budget).await? {
        return sync::sync_rollout_status(ctx, deployment, &view).await;
    }

    if reconcile_old_replica_sets(ctx, deployment, &mut view, budget).await? {
        return sync::sync_rollout_status(ctx, deployment, &view).await;
    }

    if util::deployment_complete(deployment, &util::status(deployment)) {
        sync::cleanup_deployment(ctx, deployment, &view.old).await?;
    }

    sync::sync_rollout_status(ctx, deployment, &view).await
}

async fn reconcile_new_replica_set(
    ctx: &Context,
    deployment: &Tenanted<Deployment>,
    view: &mut ReplicaSetsView,
    budget: RolloutBudget,
) -> Result<bool, Error> {
    let Some(new) = view.new.clone() else {
        return Ok(false);
    };
    let desired = util::replicas(deployment);
    let current = util::rs_replicas(&new);

    if current == desired {
        return Ok(false);
    }
    let target = if current > desired {
        desired
    } else {
        util::new_rs_new_replicas(deployment, &view.all(), &new, budget)
    };
    let (scaled, stored) = sync::scale_replica_set(ctx, deployment, &new, target).await?;
    view.store(stored);
    Ok(scaled)
}

async fn reconcile_old_replica_sets(
    ctx: &Context,
    deployment: &Tenanted<Deployment>,
    view: &mut ReplicaSetsView,
    budget: RolloutBudget,
) -> Result<bool, Error> {
    let old_replicas = util::sum_replicas(&util::filter_active(&view.old));
    if old_replicas == 0 {
        return Ok(false);
    }

    let all_replicas = util::sum_replicas(&view.all());
    let min_available = util::replicas(deployment) - budget.max_unavailable;
    let new_unavailable = view
        .new
        .as_ref()
        .map_or(0, |rs| util::rs_replicas(rs) - util::rs_available_replicas(rs));
    let max_scaled_down = all_replicas - min_available - new_unavailable;
    if max_scaled_down <= 0 {
        return Ok(false);
    }

    let cleaned = cleanup_unhealthy_replicas(ctx, deployment, view, max_scaled_down).await?;
    debug!(deployment = %deployment.name_any(), cleaned, "cleaned up unhealthy replicas");

    let scaled_down = scale_down_old_replica_sets(ctx, deployment, view, budget).await?;
    debug!(deployment = %deployment.name_any(), scaled_down, "scaled down old replica sets");

    Ok(cleaned + scaled_down > 0)
}

/// Removes replicas of old replica sets that are not available, oldest first, up to
/// `max_cleanup`.
async fn cleanup_unhealthy_replicas(
    ctx: &Context,
    deployment: &Tenanted<Deployment>,
    view: &mut ReplicaSetsView,
    max_cleanup: i32,
) -> Result<i32, Error> {
    let mut old = util::filter_active(&view.old);
    util::sort_by_creation(&mut old);

    let mut total = 0;
    for rs in old {
        if total >= max_cleanup {
            break;
        }
        let replicas = util::rs_replicas(&rs);
        let available = util::rs_available_replicas(&rs);
        // A stale status can report more available replicas than the spec asks for.
        if replicas == 0 || available >= replicas {
            continue;
        }
        let scale_down = (max_cleanup - total).min(replicas - available).max(0);
        if scale_down == 0 {
            continue;
        }
        let target = (replicas - scale_down).clamp(0, replicas);
        let (_, stored) = sync::scale_replica_set(ctx, deployment, &rs, target).await?;
        view.store(stored);
        total += scale_down;
    }
    Ok(total)
}

/// Scales old replica sets down, oldest first, as far as availability allows.
async fn scale_down_old_replica_sets(
    ctx: &Context,
    deployment: &Tenanted<Deployment>,
    view: &mut ReplicaSetsView,
    budget: RolloutBudget,
) -> Result<i32, Error> {
    let min_available = util::replicas(deployment) - budget.max_unavailable;
    let available = util::sum_available_replicas(&view.all());
    if available <= min_available {
        return Ok(0);
    }

    let to_scale_down = available - min_available;
    let mut old = util::filter_active(&view.old);
    util::sort_by_creation(&mut old);

    let mut total = 0;
    for rs in old {
        if total >= to_scale_down {
            break;
        }
        let replicas = util::rs_replicas(&rs);
        let scale_down = replicas.min(to_scale_down - total);
        let (_, stored) =
            sync::scale_replica_set(ctx, deployment, &rs, replicas - scale_down).await?;
        view.store(stored);
        total += scale_down;
    }
    Ok(total)
}
