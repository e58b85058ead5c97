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

//! Which replica sets and pods a deployment owns, decided afresh on every sync.

use super::util::{controller_ref, new_controller_ref};
use super::{CacheStaleSnafu, Error};
use crate::context::Context;
use crate::store::StoreError;
use crate::types::error::{Error as TypesError, NoNamespaceSnafu};
use crate::types::selector::{Selector, SelectorExt, parse_selector};
use crate::types::tenanted::Tenanted;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use serde_json::json;
use snafu::OptionExt;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Pods of each claimed replica set, keyed by replica set uid.
pub type PodMap = HashMap<String, Vec<Arc<Tenanted<Pod>>>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClaimDecision {
    /// Owned and matching.
    Keep,
    /// Orphaned and matching.
    Adopt,
    /// Owned but no longer matching.
    Release,
    /// Owned by someone else, or nothing to do.
    Ignore,
}

pub fn decide(deployment: &Deployment, selector: &Selector, rs: &ReplicaSet) -> ClaimDecision {
    let deleting = deployment.metadata.deletion_timestamp.is_some();
    let matches = selector.matches(rs.labels());

    match controller_ref(&rs.metadata) {
        Some(owner) if deployment.metadata.uid.as_deref() != Some(owner.uid.as_str()) => {
            ClaimDecision::Ignore
        }
        Some(_) if matches => ClaimDecision::Keep,
        Some(_) if deleting => ClaimDecision::Ignore,
        Some(_) => ClaimDecision::Release,
        None if !matches || deleting || rs.metadata.deletion_timestamp.is_some() => {
            ClaimDecision::Ignore
        }
        None => ClaimDecision::Adopt,
    }
}

/// Replica sets in the deployment's namespace that it owns after adopting orphans and
/// releasing the ones its selector no longer matches.
pub async fn claim_replica_sets(
    ctx: &Context,
    deployment: &Tenanted<Deployment>,
    selector: &Selector,
) -> Result<Vec<Tenanted<ReplicaSet>>, Error> {
    let namespace = deployment.namespace().context(NoNamespaceSnafu)?;
    let mut claimed = Vec::new();
    let mut rechecked = false;

    for rs in ctx
        .replica_set_cache
        .list(&deployment.tenant, Some(&namespace), None)
    {
        match decide(deployment, selector, &rs) {
            ClaimDecision::Keep => claimed.push((*rs).clone()),
            ClaimDecision::Ignore => {}
            ClaimDecision::Adopt => {
                if !rechecked {
                    recheck_deployment(ctx, deployment).await?;
                    rechecked = true;
                }
                match adopt(ctx, deployment, &rs).await {
                    Ok(adopted) => claimed.push(adopted),
                    Err(e) if e.is_not_found() || e.is_conflict() => {
                        debug!(replica_set = %rs.name_any(), error = %e, "skipping adoption");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            ClaimDecision::Release => match release(ctx, deployment, &rs).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() || e.is_conflict() => {
                    debug!(replica_set = %rs.name_any(), error = %e, "skipping release");
                }
                Err(e) => return Err(e.into()),
            },
        }
    }

    Ok(claimed)
}

/// Adoption is only safe if the deployment still exists in the store as the cache saw it.
async fn recheck_deployment(ctx: &Context, deployment: &Tenanted<Deployment>) -> Result<(), Error> {
    let key = deployment.key()?;
    let fresh = match ctx.get_deployment(&key).await {
        Ok(fresh) => fresh,
        Err(e) if e.is_not_found() => {
            return CacheStaleSnafu {
                key: key.to_string(),
                reason: "deployment no longer exists",
            }
            .fail();
        }
        Err(e) => return Err(e.into()),
    };

    if fresh.metadata.uid != deployment.metadata.uid {
        return CacheStaleSnafu {
            key: key.to_string(),
            reason: format!(
                "original deployment is gone: got uid {:?}, wanted {:?}",
                fresh.metadata.uid, deployment.metadata.uid
            ),
        }
        .fail();
    }
    if fresh.metadata.deletion_timestamp.is_some() {
        return CacheStaleSnafu {
            key: key.to_string(),
            reason: "deployment has just been deleted",
        }
        .fail();
    }
    Ok(())
}

async fn patch_owner_references(
    ctx: &Context,
    rs: &Tenanted<ReplicaSet>,
    owner_references: Vec<k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference>,
) -> Result<Tenanted<ReplicaSet>, StoreError> {
    let key = rs.key().map_err(invalid)?;
    let owner_references = serde_json::to_value(owner_references)
        .map_err(TypesError::from)
        .map_err(invalid)?;
    let patch = json!({
        "metadata": {
            "uid": rs.metadata.uid,
            "resourceVersion": rs.metadata.resource_version,
            "ownerReferences": owner_references,
        }
    });
    ctx.patch_replica_set(&key, &patch).await
}

fn invalid(error: TypesError) -> StoreError {
    StoreError::Invalid {
        message: error.to_string(),
    }
}

async fn adopt(
    ctx: &Context,
    deployment: &Tenanted<Deployment>,
    rs: &Tenanted<ReplicaSet>,
) -> Result<Tenanted<ReplicaSet>, StoreError> {
    info!(
        deployment = %deployment.name_any(),
        replica_set = %rs.name_any(),
        "adopting orphaned replica set"
    );
    let mut owner_references = rs.metadata.owner_references.clone().unwrap_or_default();
    owner_references.push(new_controller_ref(deployment));
    patch_owner_references(ctx, rs, owner_references).await
}

async fn release(
    ctx: &Context,
    deployment: &Tenanted<Deployment>,
    rs: &Tenanted<ReplicaSet>,
) -> Result<(), StoreError> {
    info!(
        deployment = %deployment.name_any(),
        replica_set = %rs.name_any(),
        "releasing replica set that no longer matches"
    );
    let owner_references = rs
        .metadata
        .owner_references
        .iter()
        .flatten()
        .filter(|r| deployment.metadata.uid.as_deref() != Some(r.uid.as_str()))
        .cloned()
        .collect();
    patch_owner_references(ctx, rs, owner_references).await?;
    Ok(())
}

/// Groups the deployment's pods under the claimed replica set that controls them. Every claimed
/// replica set has an entry, even without pods; terminated pods are included.
pub fn pod_map(
    ctx: &Context,
    deployment: &Tenanted<Deployment>,
    selector: &Selector,
    replica_sets: &[Tenanted<ReplicaSet>],
) -> PodMap {
    let mut pods: PodMap = replica_sets
        .iter()
        .filter_map(|rs| rs.metadata.uid.clone())
        .map(|uid| (uid, Vec::new()))
        .collect();

    let namespace = deployment.namespace();
    for pod in ctx
        .pod_cache
        .list(&deployment.tenant, namespace.as_deref(), Some(selector))
    {
        let Some(owner) = controller_ref(&pod.metadata) else {
            continue;
        };
        if let Some(owned) = pods.get_mut(&owner.uid) {
            owned.push(pod);
        }
    }
    pods
}
