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


use crate::types::error::{Error, NoNameSnafu, NoNamespaceSnafu};
use crate::types::key::ObjectKey;
use kube::{Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use snafu::OptionExt;
use std::fmt::Debug;
use std::ops::{Deref, DerefMut};

/// Bounds shared by every kind the stores and caches carry.
pub trait StoreObject:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<K> StoreObject for K where
    K: Resource<DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// An API object together with the tenant that owns it.
///
/// Tenancy is not part of `ObjectMeta`, so every object read from or written to a store travels
/// in this wrapper. It dereferences to the inner object, so `ResourceExt` accessors work as-is.
#[derive(Clone, Debug, PartialEq)]
pub struct Tenanted<K> {
    pub tenant: String,
    pub object: K,
}

impl<K: StoreObject> Tenanted<K> {
    pub fn new(tenant: impl Into<String>, object: K) -> Self {
        Self {
            tenant: tenant.into(),
            object,
        }
    }

    pub fn key(&self) -> Result<ObjectKey, Error> {
        let namespace = self.object.namespace().context(NoNamespaceSnafu)?;
        let name = self.object.meta().name.clone().context(NoNameSnafu)?;
        Ok(ObjectKey::new(self.tenant.clone(), namespace, name))
    }

    pub fn into_inner(self) -> K {
        self.object
    }

    /// Whether the object lives in the given tenant and, when set, namespace.
    pub fn in_scope(&self, tenant: Option<&str>, namespace: Option<&str>) -> bool {
        tenant.is_none_or(|t| t == self.tenant)
            && namespace.is_none_or(|ns| self.object.meta().namespace.as_deref() == Some(ns))
    }
}

impl<K> Deref for Tenanted<K> {
    type Target = K;

    fn deref(&self) -> &Self::Target {
        &self.object
    }
}

impl<K> DerefMut for Tenanted<K> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.object
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    #[test]
    fn test_key_requires_namespace() {
        let deployment = Tenanted::new(
            "tenant-a",
            Deployment {
                metadata: ObjectMeta {
                    name: Some("web".to_string()),
                    ..Default::default()
                },
                ..Default::default()
            },
        );

        assert!(matches!(deployment.key(), Err(Error::NoNamespace)));
    }

    #[test]
    fn test_scope_matching() {
        let deployment = Tenanted::new(
            "tenant-a",
            Deployment {
                metadata: ObjectMeta {
                    name: Some("web".to_string()),
                    namespace: Some("default".to_string()),
                    ..Default::default()
                },
                ..Default::default()
            },
        );

        assert_eq!(
            deployment.key().unwrap(),
            ObjectKey::new("tenant-a", "default", "web")
        );
        assert!(deployment.in_scope(None, None));
        assert!(deployment.in_scope(Some("tenant-a"), Some("default")));
        assert!(!deployment.in_scope(Some("tenant-b"), None));
        assert!(!deployment.in_scope(None, Some("kube-system")));
    }
}
