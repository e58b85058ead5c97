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


//! Store partition backed by a Kubernetes API server.
//!
//! One API server serves exactly one tenant; requests scoped to any other tenant answer
//! [`StoreError::NoRoute`] so the partition aggregator can skip it.

use crate::store::error::NoRouteSnafu;
use crate::store::{ListParams, ObjectList, ObjectStore, Preconditions, StoreError, WatchEvent, WatchStream};
use crate::types::key::ObjectKey;
use crate::types::tenanted::{StoreObject, Tenanted};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams, WatchParams};
use kube::{Client, Resource};
use std::marker::PhantomData;
use tracing::debug;

pub struct KubeStore<K> {
    client: Client,
    tenant: String,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeStore<K>
where
    K: StoreObject + Resource<Scope = NamespaceResourceScope>,
{
    pub fn new(client: Client, tenant: impl Into<String>) -> Self {
        Self {
            client,
            tenant: tenant.into(),
            _kind: PhantomData,
        }
    }

    fn route(&self, tenant: &str) -> Result<(), StoreError> {
        if tenant == self.tenant {
            Ok(())
        } else {
            NoRouteSnafu { tenant }.fail()
        }
    }

    fn namespaced(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn scoped(&self, namespace: Option<&str>) -> Api<K> {
        match namespace {
            Some(namespace) => self.namespaced(namespace),
            None => Api::all(self.client.clone()),
        }
    }

    fn object_api(&self, object: &Tenanted<K>) -> Result<(Api<K>, String), StoreError> {
        self.route(&object.tenant)?;
        let key = object.key().map_err(|e| StoreError::Invalid {
            message: e.to_string(),
        })?;
        Ok((self.namespaced(&key.namespace), key.name))
    }

    fn wrap(&self, object: K) -> Tenanted<K> {
        Tenanted::new(self.tenant.clone(), object)
    }
}

#[async_trait]
impl<K> ObjectStore<K> for KubeStore<K>
where
    K: StoreObject + Resource<Scope = NamespaceResourceScope>,
{
    async fn get(&self, key: &ObjectKey) -> Result<Tenanted<K>, StoreError> {
        self.route(&key.tenant)?;
        let object = self.namespaced(&key.namespace).get(&key.name).await?;
        Ok(self.wrap(object))
    }

    async fn list(&self, params: &ListParams) -> Result<ObjectList<K>, StoreError> {
        if let Some(tenant) = &params.tenant {
            self.route(tenant)?;
        }
        let mut lp = kube::api::ListParams::default();
        if let Some(rv) = params.resource_version.as_deref().filter(|rv| !rv.is_empty()) {
            lp = lp.at(rv);
        }
        let list = self.scoped(params.namespace.as_deref()).list(&lp).await?;

        Ok(ObjectList {
            resource_version: list.metadata.resource_version,
            items: list.items.into_iter().map(|obj| self.wrap(obj)).collect(),
        })
    }

    async fn create(&self, object: &Tenanted<K>) -> Result<Tenanted<K>, StoreError> {
        let (api, _) = self.object_api(object)?;
        let created = api.create(&PostParams::default(), &object.object).await?;
        Ok(self.wrap(created))
    }

    async fn update(&self, object: &Tenanted<K>) -> Result<Tenanted<K>, StoreError> {
        let (api, name) = self.object_api(object)?;
        let updated = api
            .replace(&name, &PostParams::default(), &object.object)
            .await?;
        Ok(self.wrap(updated))
    }

    async fn update_status(&self, object: &Tenanted<K>) -> Result<Tenanted<K>, StoreError> {
        let (api, name) = self.object_api(object)?;
        let updated = api
            .replace_status(&name, &PostParams::default(), &object.object)
            .await?;
        Ok(self.wrap(updated))
    }

    async fn patch(
        &self,
        key: &ObjectKey,
        patch: &serde_json::Value,
    ) -> Result<Tenanted<K>, StoreError> {
        self.route(&key.tenant)?;
        let patched = self
            .namespaced(&key.namespace)
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        Ok(self.wrap(patched))
    }

    async fn delete(
        &self,
        key: &ObjectKey,
        preconditions: &Preconditions,
    ) -> Result<(), StoreError> {
        self.route(&key.tenant)?;
        let dp = DeleteParams {
            preconditions: Some(kube::api::Preconditions {
                uid: preconditions.uid.clone(),
                resource_version: preconditions.resource_version.clone(),
            }),
            ..DeleteParams::default()
        };
        self.namespaced(&key.namespace)
            .delete(&key.name, &dp)
            .await?;
        debug!(%key, "deleted object");
        Ok(())
    }

    async fn watch(&self, params: &ListParams) -> Result<WatchStream<K>, StoreError> {
        if let Some(tenant) = &params.tenant {
            self.route(tenant)?;
        }
        let version = params
            .resource_version
            .clone()
            .filter(|rv| !rv.is_empty())
            .unwrap_or_else(|| "0".to_string());
        let tenant = self.tenant.clone();

        let stream = self
            .scoped(params.namespace.as_deref())
            .watch(&WatchParams::default(), &version)
            .await?
            .map_err(StoreError::from)
            .try_filter_map(move |event| {
                let wrap = |obj: K| Tenanted::new(tenant.clone(), obj);
                let mapped = match event {
                    kube::core::WatchEvent::Added(obj) => Ok(Some(WatchEvent::Added(wrap(obj)))),
                    kube::core::WatchEvent::Modified(obj) => {
                        Ok(Some(WatchEvent::Modified(wrap(obj))))
                    }
                    kube::core::WatchEvent::Deleted(obj) => {
                        Ok(Some(WatchEvent::Deleted(wrap(obj))))
                    }
                    kube::core::WatchEvent::Bookmark(_) => Ok(None),
                    kube::core::WatchEvent::Error(e) => Err(StoreError::Transport {
                        message: format!("watch error: {e:?}"),
                    }),
                };
                futures::future::ready(mapped)
            });

        Ok(stream.boxed())
    }
}
