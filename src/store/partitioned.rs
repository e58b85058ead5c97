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


//! Read and watch aggregation across store partitions.
//!
//! Every partition serves a subset of tenants. Partitions answering
//! [`StoreError::NoRoute`] are skipped; any other failure fails the whole request.

use crate::store::error::NoRouteSnafu;
use crate::store::{
    ListParams, ObjectList, ObjectStore, Preconditions, StoreError, WatchStream,
    compare_resource_versions,
};
use crate::types::key::ObjectKey;
use crate::types::tenanted::{StoreObject, Tenanted};
use async_trait::async_trait;
use futures::StreamExt;
use futures::future::join_all;
use futures::stream::select_all;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct PartitionedStore<K: StoreObject> {
    partitions: Vec<Arc<dyn ObjectStore<K>>>,
}

impl<K: StoreObject> PartitionedStore<K> {
    pub fn new(partitions: Vec<Arc<dyn ObjectStore<K>>>) -> Self {
        Self { partitions }
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}

fn no_route(tenant: Option<&str>) -> StoreError {
    NoRouteSnafu {
        tenant: tenant.unwrap_or("*"),
    }
    .build()
}

#[async_trait]
impl<K: StoreObject> ObjectStore<K> for PartitionedStore<K> {
    async fn get(&self, key: &ObjectKey) -> Result<Tenanted<K>, StoreError> {
        for partition in &self.partitions {
            match partition.get(key).await {
                Err(e) if e.is_no_route() => continue,
                other => return other,
            }
        }
        Err(no_route(Some(&key.tenant)))
    }

    async fn list(&self, params: &ListParams) -> Result<ObjectList<K>, StoreError> {
        let results = join_all(self.partitions.iter().map(|p| p.list(params))).await;

        let mut lists = Vec::with_capacity(results.len());
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(list) => lists.push(list),
                Err(e) if e.is_no_route() => {
                    debug!(partition = index, "partition does not serve this list, skipping");
                }
                Err(e) => return Err(e),
            }
        }

        let Some(first) = lists.first() else {
            return Err(no_route(params.tenant.as_deref()));
        };

        let resource_version = match params.resource_version.as_deref() {
            None | Some("") => first.resource_version.clone(),
            Some(_) => lists
                .iter()
                .filter_map(|list| list.resource_version.clone())
                .max_by(|a, b| compare_resource_versions(a, b)),
        };

        let mut seen = HashSet::new();
        let mut items = Vec::new();
        for item in lists.into_iter().flat_map(|list| list.items) {
            let identity = (
                item.tenant.clone(),
                item.meta().namespace.clone(),
                item.meta().name.clone(),
                item.meta().resource_version.clone(),
            );
            if seen.insert(identity) {
                items.push(item);
            }
        }

        Ok(ObjectList {
            resource_version,
            items,
        })
    }

    async fn create(&self, object: &Tenanted<K>) -> Result<Tenanted<K>, StoreError> {
        for partition in &self.partitions {
            match partition.create(object).await {
                Err(e) if e.is_no_route() => continue,
                other => return other,
            }
        }
        Err(no_route(Some(&object.tenant)))
    }

    async fn update(&self, object: &Tenanted<K>) -> Result<Tenanted<K>, StoreError> {
        for partition in &self.partitions {
            match partition.update(object).await {
                Err(e) if e.is_no_route() => continue,
                other => return other,
            }
        }
        Err(no_route(Some(&object.tenant)))
    }

    async fn update_status(&self, object: &Tenanted<K>) -> Result<Tenanted<K>, StoreError> {
        for partition in &self.partitions {
            match partition.update_status(object).await {
                Err(e) if e.is_no_route() => continue,
                other => return other,
            }
        }
        Err(no_route(Some(&object.tenant)))
    }

    async fn patch(
        &self,
        key: &ObjectKey,
        patch: &serde_json::Value,
    ) -> Result<Tenanted<K>, StoreError> {
        for partition in &self.partitions {
            match partition.patch(key, patch).await {
                Err(e) if e.is_no_route() => continue,
                other => return other,
            }
        }
        Err(no_route(Some(&key.tenant)))
    }

    async fn delete(
        &self,
        key: &ObjectKey,
        preconditions: &Preconditions,
    ) -> Result<(), StoreError> {
        for partition in &self.partitions {
            match partition.delete(key, preconditions).await {
                Err(e) if e.is_no_route() => continue,
                other => return other,
            }
        }
        Err(no_route(Some(&key.tenant)))
    }

    async fn watch(&self, params: &ListParams) -> Result<WatchStream<K>, StoreError> {
        let results = join_all(self.partitions.iter().map(|p| p.watch(params))).await;

        let mut streams = Vec::with_capacity(results.len());
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(stream) => streams.push(stream),
                Err(e) if e.is_no_route() => continue,
                Err(e) if params.allow_partial_watch => {
                    warn!(partition = index, error = %e, "dropping partition from watch");
                }
                Err(e) => return Err(e),
            }
        }

        if streams.is_empty() {
            return Err(no_route(params.tenant.as_deref()));
        }
        Ok(select_all(streams).boxed())
    }
}
