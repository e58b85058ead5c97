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


//! Scoped object stores: the in-memory backend, the kube-backed backend, and the aggregator
//! fanning reads and watches across store partitions.

pub mod error;
pub mod kubernetes;
pub mod memory;
pub mod partitioned;

pub use error::StoreError;

use crate::types::key::ObjectKey;
use crate::types::tenanted::{StoreObject, Tenanted};
use async_trait::async_trait;
use futures::stream::BoxStream;

/// Scope and cursor of a list or watch request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListParams {
    pub tenant: Option<String>,
    pub namespace: Option<String>,
    /// Resource-version cursor; empty means "most recent".
    pub resource_version: Option<String>,
    /// Let a multi-partition watch start even when some partitions fail to set up.
    pub allow_partial_watch: bool,
}

impl ListParams {
    pub fn tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn at(mut self, resource_version: impl Into<String>) -> Self {
        self.resource_version = Some(resource_version.into());
        self
    }
}

#[derive(Clone, Debug)]
pub struct ObjectList<K> {
    pub resource_version: Option<String>,
    pub items: Vec<Tenanted<K>>,
}

#[derive(Clone, Debug)]
pub enum WatchEvent<K> {
    Added(Tenanted<K>),
    Modified(Tenanted<K>),
    Deleted(Tenanted<K>),
}

impl<K> WatchEvent<K> {
    pub fn object(&self) -> &Tenanted<K> {
        match self {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => obj,
        }
    }
}

pub type WatchStream<K> = BoxStream<'static, Result<WatchEvent<K>, StoreError>>;

/// Preconditions checked by the store before a delete.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Preconditions {
    pub uid: Option<String>,
    pub resource_version: Option<String>,
}

/// Tenant-scoped access to one kind of object.
///
/// Updates carry the resource version they were computed from and fail with
/// [`StoreError::Conflict`] when it is stale. `patch` applies a JSON merge patch; a
/// `metadata.uid` or `metadata.resourceVersion` inside the patch acts as a precondition.
#[async_trait]
pub trait ObjectStore<K: StoreObject>: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> Result<Tenanted<K>, StoreError>;

    async fn list(&self, params: &ListParams) -> Result<ObjectList<K>, StoreError>;

    async fn create(&self, object: &Tenanted<K>) -> Result<Tenanted<K>, StoreError>;

    async fn update(&self, object: &Tenanted<K>) -> Result<Tenanted<K>, StoreError>;

    async fn update_status(&self, object: &Tenanted<K>) -> Result<Tenanted<K>, StoreError>;

    async fn patch(
        &self,
        key: &ObjectKey,
        patch: &serde_json::Value,
    ) -> Result<Tenanted<K>, StoreError>;

    async fn delete(&self, key: &ObjectKey, preconditions: &Preconditions)
    -> Result<(), StoreError>;

    async fn watch(&self, params: &ListParams) -> Result<WatchStream<K>, StoreError>;
}

/// Orders resource versions numerically when both parse, lexically otherwise.
pub fn compare_resource_versions(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}
