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

use super::ownership::PodMap;
use super::sync::{self, ReplicaSetsView};
use super::util;
use super::{Action, Error};
use crate::context::Context;
use crate::types::tenanted::Tenanted;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::debug;

const POD_SUCCEEDED: &str = "Succeeded";
const POD_FAILED: &str = "Failed";

/// Whether the pod has stopped for good.
pub fn is_pod_terminal(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some(POD_SUCCEEDED | POD_FAILED)
    )
}

/// Kills every old pod before any new pod is created.
pub async fn rollout_recreate(
    ctx: &Context,
    deployment: &mut Tenanted<Deployment>,
    replica_sets: &[Tenanted<ReplicaSet>],
    pods: &PodMap,
) -> Result<Action, Error> {
    let mut view =
        sync::get_all_replica_sets_and_sync_revision(ctx, deployment, replica_sets, false).await?;

    let scaled_down = scale_down_old_replica_sets(ctx, deployment, &mut view).await?;
    if scaled_down {
        return sync::sync_rollout_status(ctx, deployment, &view).await;
    }

    if old_pods_running(view.new.as_ref(), &view.old, pods) {
        debug!(deployment = %deployment.name_any(), "waiting for old pods to terminate");
        return sync::sync_rollout_status(ctx, deployment, &view).await;
    }

    if view.new.is_none() {
        view = sync::get_all_replica_sets_and_sync_revision(ctx, deployment, replica_sets, true)
            .await?;
    }

    if let Some(new) = view.new.clone() {
        let (_, stored) =
            sync::scale_replica_set(ctx, deployment, &new, util::replicas(deployment)).await?;
        view.store(stored);
    }

    if util::deployment_complete(deployment, &util::status(deployment)) {
        sync::cleanup_deployment(ctx, deployment, &view.old).await?;
    }

    sync::sync_rollout_status(ctx, deployment, &view).await
}

async fn scale_down_old_replica_sets(
    ctx: &Context,
    deployment: &Tenanted<Deployment>,
    view: &mut ReplicaSetsView,
) -> Result<bool, Error> {
    let mut scaled = false;
    for rs in util::filter_active(&view.old) {
        let (changed, stored) = sync::scale_replica_set(ctx, deployment, &rs, 0).await?;
        view.store(stored);
        scaled |= changed;
    }
    Ok(scaled)
}

/// Old replica sets still report replicas, or some pod outside the new replica set has not
/// terminated.
fn old_pods_running(
    new: Option<&Tenanted<ReplicaSet>>,
    old: &[Tenanted<ReplicaSet>],
    pods: &PodMap,
) -> bool {
    if util::sum_actual_replicas(old) > 0 {
        return true;
    }
    let new_uid = new.and_then(|rs| rs.metadata.uid.as_deref());
    pods.iter()
        .filter(|(uid, _)| Some(uid.as_str()) != new_uid)
        .flat_map(|(_, pods)| pods)
        .any(|pod| !is_pod_terminal(pod))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::tests::{TENANT_DEFAULT, generate_pod_from_rs, new_deployment, new_replica_set};
    use std::sync::Arc;

    #[test]
    fn test_old_pods_running() {
        let d = new_deployment("web", 1, None, None, None, TENANT_DEFAULT);
        let old = new_replica_set(&d, "web-old", 0, TENANT_DEFAULT);
        let new = new_replica_set(&d, "web-new", 1, TENANT_DEFAULT);
        let old_uid = old.metadata.uid.clone().unwrap();
        let new_uid = new.metadata.uid.clone().unwrap();

        let mut pods = PodMap::new();
        pods.insert(old_uid.clone(), Vec::new());
        pods.insert(
            new_uid,
            vec![Arc::new(generate_pod_from_rs(&new, "Running", TENANT_DEFAULT))],
        );
        assert!(!old_pods_running(Some(&new), std::slice::from_ref(&old), &pods));

        pods.insert(
            old_uid.clone(),
            vec![Arc::new(generate_pod_from_rs(&old, "Failed", TENANT_DEFAULT))],
        );
        assert!(!old_pods_running(Some(&new), std::slice::from_ref(&old), &pods));

        pods.insert(
            old_uid,
            vec![Arc::new(generate_pod_from_rs(&old, "Pending", TENANT_DEFAULT))],
        );
        assert!(old_pods_running(Some(&new), std::slice::from_ref(&old), &pods));
    }
}
