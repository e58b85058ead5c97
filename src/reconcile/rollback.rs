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

use super::sync;
use super::util::{self, Reason};
use super::{Action, Error};
use crate::context::Context;
use crate::types::tenanted::Tenanted;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::PodTemplateSpec;
use kube::ResourceExt;
use kube::runtime::events::EventType;
use tracing::info;

/// Rolls the deployment's template back to the revision named by its rollback annotation,
/// `0` being the revision before the current one. The annotation is always cleared, with
/// exactly one update.
pub async fn rollback(
    ctx: &Context,
    deployment: &mut Tenanted<Deployment>,
    replica_sets: &[Tenanted<ReplicaSet>],
) -> Result<Action, Error> {
    let view =
        sync::get_all_replica_sets_and_sync_revision(ctx, deployment, replica_sets, true).await?;
    let all = view.all();

    let mut revision = util::rollback_to(deployment).unwrap_or(0);
    if revision == 0 {
        revision = util::last_revision(&all);
        if revision == 0 {
            ctx.record(
                deployment,
                EventType::Warning,
                Reason::DeploymentRollbackRevisionNotFound,
                "Unable to find last revision.",
            )
            .await;
            return clear_rollback_to(ctx, deployment).await;
        }
    }

    let target = all
        .iter()
        .find(|rs| util::revision(&rs.metadata) == Some(revision))
        .and_then(|rs| util::rs_template(rs).cloned().map(|template| (rs, template)));

    let Some((target, template)) = target else {
        ctx.record(
            deployment,
            EventType::Warning,
            Reason::DeploymentRollbackRevisionNotFound,
            "Unable to find the revision to rollback to.",
        )
        .await;
        return clear_rollback_to(ctx, deployment).await;
    };

    if rollback_to_template(deployment, &template) {
        util::set_deployment_annotations_to(deployment, target);
        info!(deployment = %deployment.name_any(), revision, "rolling back deployment");
        let name = deployment.name_any();
        clear_rollback_to(ctx, deployment).await?;
        ctx.record(
            deployment,
            EventType::Normal,
            Reason::DeploymentRollback,
            &format!("Rolled back deployment \"{name}\" to revision {revision}"),
        )
        .await;
        return Ok(Action::await_change());
    }

    ctx.record(
        deployment,
        EventType::Warning,
        Reason::DeploymentRollbackTemplateUnchanged,
        &format!(
            "The rollback revision contains the same template as current deployment \"{}\"",
            deployment.name_any()
        ),
    )
    .await;
    clear_rollback_to(ctx, deployment).await
}

/// Copies `template` without its hash label into the deployment. Returns false when the
/// deployment already runs it.
fn rollback_to_template(deployment: &mut Deployment, template: &PodTemplateSpec) -> bool {
    let Some(spec) = deployment.spec.as_mut() else {
        return false;
    };
    if util::equal_ignore_hash(&spec.template, template) {
        return false;
    }

    let mut template = template.clone();
    if let Some(labels) = template
        .metadata
        .as_mut()
        .and_then(|m| m.labels.as_mut())
    {
        labels.remove(util::POD_TEMPLATE_HASH_LABEL);
    }
    spec.template = template;
    true
}

async fn clear_rollback_to(
    ctx: &Context,
    deployment: &mut Tenanted<Deployment>,
) -> Result<Action, Error> {
    util::clear_rollback_to(deployment);
    *deployment = ctx.update_deployment(deployment).await?;
    Ok(Action::await_change())
}
