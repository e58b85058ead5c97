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

use crate::cache::Reflector;
use crate::recorder::EventRecorder;
use crate::reconcile::util::Reason;
use crate::store::error::InvalidSnafu;
use crate::store::{ObjectStore, Preconditions, StoreError};
use crate::types::key::ObjectKey;
use crate::types::tenanted::{StoreObject, Tenanted};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus, ReplicaSet};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use kube::runtime::events::EventType;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

/// Everything a sync reads from and writes to.
pub struct Context {
    pub(crate) deployments: Arc<dyn ObjectStore<Deployment>>,
    pub(crate) replica_sets: Arc<dyn ObjectStore<ReplicaSet>>,
    pub(crate) deployment_cache: Arc<Reflector<Deployment>>,
    pub(crate) replica_set_cache: Arc<Reflector<ReplicaSet>>,
    pub(crate) pod_cache: Arc<Reflector<Pod>>,
    pub(crate) recorder: Arc<dyn EventRecorder>,
}

impl Context {
    pub fn new(
        deployments: Arc<dyn ObjectStore<Deployment>>,
        replica_sets: Arc<dyn ObjectStore<ReplicaSet>>,
        deployment_cache: Arc<Reflector<Deployment>>,
        replica_set_cache: Arc<Reflector<ReplicaSet>>,
        pod_cache: Arc<Reflector<Pod>>,
        recorder: Arc<dyn EventRecorder>,
    ) -> Self {
        Self {
            deployments,
            replica_sets,
            deployment_cache,
            replica_set_cache,
            pod_cache,
            recorder,
        }
    }

    /// send event
    #[inline]
    pub async fn record<K: StoreObject>(
        &self,
        resource: &Tenanted<K>,
        event_type: EventType,
        reason: Reason,
        message: &str,
    ) {
        self.recorder
            .record(
                &resource.tenant,
                &resource.object.object_ref(&()),
                event_type,
                &reason.to_string(),
                message,
            )
            .await;
    }

    pub async fn get_deployment(&self, key: &ObjectKey) -> Result<Tenanted<Deployment>, StoreError> {
        self.deployments.get(key).await
    }

    pub async fn update_deployment(
        &self,
        deployment: &Tenanted<Deployment>,
    ) -> Result<Tenanted<Deployment>, StoreError> {
        info!(tenant = %deployment.tenant, deployment = %deployment.name_any(), "updating deployment");
        self.deployments.update(deployment).await
    }

    /// Writes `status` through the status subresource and returns the stored deployment.
    pub async fn update_status(
        &self,
        deployment: &Tenanted<Deployment>,
        status: DeploymentStatus,
    ) -> Result<Tenanted<Deployment>, StoreError> {
        let mut next = deployment.clone();
        next.status = Some(status);
        debug!(tenant = %next.tenant, deployment = %next.name_any(), "updating deployment status");
        self.deployments.update_status(&next).await
    }

    pub async fn create_replica_set(
        &self,
        replica_set: &Tenanted<ReplicaSet>,
    ) -> Result<Tenanted<ReplicaSet>, StoreError> {
        info!(
            tenant = %replica_set.tenant,
            replica_set = %replica_set.name_any(),
            "creating replica set"
        );
        self.replica_sets.create(replica_set).await
    }

    pub async fn update_replica_set(
        &self,
        replica_set: &Tenanted<ReplicaSet>,
    ) -> Result<Tenanted<ReplicaSet>, StoreError> {
        debug!(
            tenant = %replica_set.tenant,
            replica_set = %replica_set.name_any(),
            "updating replica set"
        );
        self.replica_sets.update(replica_set).await
    }

    pub async fn patch_replica_set(
        &self,
        key: &ObjectKey,
        patch: &Value,
    ) -> Result<Tenanted<ReplicaSet>, StoreError> {
        debug!(replica_set = %key, "patching replica set");
        self.replica_sets.patch(key, patch).await
    }

    /// Deletes a replica set only if it still has the observed uid.
    pub async fn delete_replica_set(
        &self,
        replica_set: &Tenanted<ReplicaSet>,
    ) -> Result<(), StoreError> {
        let key = replica_set.key().map_err(|e| {
            InvalidSnafu {
                message: e.to_string(),
            }
            .build()
        })?;
        info!(replica_set = %key, "deleting replica set");
        self.replica_sets
            .delete(
                &key,
                &Preconditions {
                    uid: replica_set.metadata.uid.clone(),
                    resource_version: None,
                },
            )
            .await
    }
}
