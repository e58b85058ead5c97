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


//! An in-process store with resource versions, preconditions, merge patches and watches.
//!
//! Backs the test fixtures and the `--in-memory` server mode. Every call except list and watch
//! is appended to an [`ActionLog`] that can be shared between the stores of several kinds.

use crate::store::{ListParams, ObjectList, ObjectStore, Preconditions, StoreError, WatchEvent, WatchStream};
use crate::store::error::{AlreadyExistsSnafu, ConflictSnafu, NoRouteSnafu, NotFoundSnafu};
use crate::types::key::ObjectKey;
use crate::types::tenanted::{StoreObject, Tenanted};
use crate::utils::time;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use strum::Display;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::debug;

const WATCH_BUFFER: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Verb {
    Get,
    Create,
    Update,
    Patch,
    Delete,
}

/// One call made against a memory store, rendered as `verb resource[/subresource]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreAction {
    pub verb: Verb,
    pub resource: String,
    pub subresource: Option<&'static str>,
    pub key: ObjectKey,
}

impl fmt::Display for StoreAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.subresource {
            Some(sub) => write!(f, "{} {}/{}", self.verb, self.resource, sub),
            None => write!(f, "{} {}", self.verb, self.resource),
        }
    }
}

#[derive(Debug, Default)]
pub struct ActionLog {
    actions: Mutex<Vec<StoreAction>>,
}

impl ActionLog {
    fn lock(&self) -> MutexGuard<'_, Vec<StoreAction>> {
        self.actions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, action: StoreAction) {
        self.lock().push(action);
    }

    pub fn actions(&self) -> Vec<StoreAction> {
        self.lock().clone()
    }

    /// Rendered actions, e.g. `["create replicasets", "update deployments/status"]`.
    pub fn rendered(&self) -> Vec<String> {
        self.lock().iter().map(ToString::to_string).collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

struct State<K> {
    objects: BTreeMap<ObjectKey, Tenanted<K>>,
    revision: u64,
}

impl<K> State<K> {
    fn next_revision(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }
}

pub struct MemoryStore<K: StoreObject> {
    resource: String,
    tenants: Option<BTreeSet<String>>,
    state: Mutex<State<K>>,
    events: broadcast::Sender<WatchEvent<K>>,
    actions: Arc<ActionLog>,
}

impl<K: StoreObject> Default for MemoryStore<K> {
    fn default() -> Self {
        Self::new(Arc::new(ActionLog::default()))
    }
}

impl<K: StoreObject> MemoryStore<K> {
    pub fn new(actions: Arc<ActionLog>) -> Self {
        let (events, _) = broadcast::channel(WATCH_BUFFER);
        Self {
            resource: K::plural(&()).to_string(),
            tenants: None,
            state: Mutex::new(State {
                objects: BTreeMap::new(),
                revision: 0,
            }),
            events,
            actions,
        }
    }

    /// Restricts the store to the given tenants; requests for any other tenant fail with
    /// [`StoreError::NoRoute`].
    pub fn serving<I, S>(mut self, tenants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tenants = Some(tenants.into_iter().map(Into::into).collect());
        self
    }

    pub fn action_log(&self) -> Arc<ActionLog> {
        self.actions.clone()
    }

    /// Inserts an object as-is without logging or notifying watchers. Missing uid and resource
    /// version are filled in.
    pub fn seed(&self, object: Tenanted<K>) -> Result<Tenanted<K>, StoreError> {
        let key = self.key_of(&object)?;
        let mut state = self.state();
        let mut object = object;
        if object.meta().resource_version.is_none() {
            object.meta_mut().resource_version = Some(state.next_revision());
        }
        if object.meta().uid.is_none() {
            object.meta_mut().uid = Some(new_uid(&key, state.revision));
        }
        state.objects.insert(key, object.clone());
        Ok(object)
    }

    /// Current content of the store, in key order.
    pub fn snapshot(&self) -> Vec<Tenanted<K>> {
        self.state().objects.values().cloned().collect()
    }

    pub fn get_now(&self, key: &ObjectKey) -> Option<Tenanted<K>> {
        self.state().objects.get(key).cloned()
    }

    fn state(&self) -> MutexGuard<'_, State<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn route(&self, tenant: &str) -> Result<(), StoreError> {
        match &self.tenants {
            Some(tenants) if !tenants.contains(tenant) => NoRouteSnafu { tenant }.fail(),
            _ => Ok(()),
        }
    }

    fn key_of(&self, object: &Tenanted<K>) -> Result<ObjectKey, StoreError> {
        object.key().map_err(|e| StoreError::Invalid {
            message: e.to_string(),
        })
    }

    fn record(&self, verb: Verb, subresource: Option<&'static str>, key: &ObjectKey) {
        self.actions.push(StoreAction {
            verb,
            resource: self.resource.clone(),
            subresource,
            key: key.clone(),
        });
    }

    fn not_found(&self, key: &ObjectKey) -> StoreError {
        NotFoundSnafu {
            resource: self.resource.clone(),
            name: key.to_string(),
        }
        .build()
    }

    fn check_preconditions(
        &self,
        key: &ObjectKey,
        current: &Tenanted<K>,
        uid: Option<&str>,
        resource_version: Option<&str>,
    ) -> Result<(), StoreError> {
        if let Some(uid) = uid
            && current.meta().uid.as_deref() != Some(uid)
        {
            return ConflictSnafu {
                resource: self.resource.clone(),
                name: key.to_string(),
                message: format!("uid precondition failed: expected {uid}"),
            }
            .fail();
        }
        if let Some(rv) = resource_version
            && current.meta().resource_version.as_deref() != Some(rv)
        {
            return ConflictSnafu {
                resource: self.resource.clone(),
                name: key.to_string(),
                message: format!(
                    "the object has been modified: resource version {rv} is stale"
                ),
            }
            .fail();
        }
        Ok(())
    }

    fn commit(
        &self,
        state: &mut State<K>,
        key: ObjectKey,
        mut object: Tenanted<K>,
        previous: &Tenanted<K>,
    ) -> Tenanted<K> {
        object.meta_mut().resource_version = Some(state.next_revision());
        object.meta_mut().uid = previous.meta().uid.clone();
        object.meta_mut().creation_timestamp = previous.meta().creation_timestamp.clone();
        state.objects.insert(key, object.clone());
        let _ = self.events.send(WatchEvent::Modified(object.clone()));
        object
    }
}

fn new_uid(key: &ObjectKey, revision: u64) -> String {
    let digest = crate::partition::key_hash(key);
    format!(
        "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
        digest >> 32,
        (digest >> 16) & 0xffff,
        digest & 0xffff,
        revision & 0xffff,
        revision
    )
}

fn to_value<T: serde::Serialize>(object: &T) -> Result<Value, StoreError> {
    serde_json::to_value(object).map_err(|e| StoreError::Invalid {
        message: e.to_string(),
    })
}

fn from_value<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Invalid {
        message: e.to_string(),
    })
}

/// RFC 7386 JSON merge patch.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(serde_json::Map::new());
    }
    if let Value::Object(target) = target {
        for (key, value) in patch {
            if value.is_null() {
                target.remove(key);
            } else {
                merge_patch(target.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

fn bump_generation_if_spec_changed(old: &Value, new: &mut Value) {
    let generation = old
        .pointer("/metadata/generation")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let next = if old.get("spec") != new.get("spec") {
        generation + 1
    } else {
        generation
    };
    if let Some(metadata) = new.get_mut("metadata").and_then(Value::as_object_mut) {
        metadata.insert("generation".to_string(), Value::from(next));
    }
}

#[async_trait]
impl<K: StoreObject> ObjectStore<K> for MemoryStore<K> {
    async fn get(&self, key: &ObjectKey) -> Result<Tenanted<K>, StoreError> {
        self.record(Verb::Get, None, key);
        self.route(&key.tenant)?;
        self.get_now(key).ok_or_else(|| self.not_found(key))
    }

    async fn list(&self, params: &ListParams) -> Result<ObjectList<K>, StoreError> {
        if let Some(tenant) = &params.tenant {
            self.route(tenant)?;
        }
        let state = self.state();
        let items = state
            .objects
            .values()
            .filter(|obj| self.tenants.as_ref().is_none_or(|t| t.contains(&obj.tenant)))
            .filter(|obj| obj.in_scope(params.tenant.as_deref(), params.namespace.as_deref()))
            .cloned()
            .collect();

        Ok(ObjectList {
            resource_version: Some(state.revision.to_string()),
            items,
        })
    }

    async fn create(&self, object: &Tenanted<K>) -> Result<Tenanted<K>, StoreError> {
        let key = self.key_of(object)?;
        self.record(Verb::Create, None, &key);
        self.route(&key.tenant)?;

        let mut state = self.state();
        if state.objects.contains_key(&key) {
            return AlreadyExistsSnafu {
                resource: self.resource.clone(),
                name: key.to_string(),
            }
            .fail();
        }

        let mut created = object.clone();
        let revision = state.next_revision();
        let meta = created.meta_mut();
        meta.uid = Some(new_uid(&key, state.revision));
        meta.resource_version = Some(revision);
        meta.generation = Some(1);
        if meta.creation_timestamp.is_none() {
            meta.creation_timestamp = time::now_time();
        }
        state.objects.insert(key.clone(), created.clone());
        let _ = self.events.send(WatchEvent::Added(created.clone()));
        debug!(resource = %self.resource, %key, "created object");

        Ok(created)
    }

    async fn update(&self, object: &Tenanted<K>) -> Result<Tenanted<K>, StoreError> {
        let key = self.key_of(object)?;
        self.record(Verb::Update, None, &key);
        self.route(&key.tenant)?;

        let mut state = self.state();
        let current = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| self.not_found(&key))?;
        self.check_preconditions(
            &key,
            &current,
            object.meta().uid.as_deref(),
            object.meta().resource_version.as_deref(),
        )?;

        // The main resource ignores status changes.
        let old = to_value(&current.object)?;
        let mut new = to_value(&object.object)?;
        match old.get("status") {
            Some(status) => {
                if let Some(map) = new.as_object_mut() {
                    map.insert("status".to_string(), status.clone());
                }
            }
            None => {
                if let Some(map) = new.as_object_mut() {
                    map.remove("status");
                }
            }
        }
        bump_generation_if_spec_changed(&old, &mut new);

        let updated = Tenanted::new(key.tenant.clone(), from_value::<K>(new)?);
        Ok(self.commit(&mut state, key, updated, &current))
    }

    async fn update_status(&self, object: &Tenanted<K>) -> Result<Tenanted<K>, StoreError> {
        let key = self.key_of(object)?;
        self.record(Verb::Update, Some("status"), &key);
        self.route(&key.tenant)?;

        let mut state = self.state();
        let current = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| self.not_found(&key))?;
        self.check_preconditions(
            &key,
            &current,
            object.meta().uid.as_deref(),
            object.meta().resource_version.as_deref(),
        )?;

        // The status subresource keeps spec, labels and generation of the stored object.
        let old = to_value(&current.object)?;
        let mut new = to_value(&object.object)?;
        if let Some(map) = new.as_object_mut() {
            match old.get("spec") {
                Some(spec) => map.insert("spec".to_string(), spec.clone()),
                None => map.remove("spec"),
            };
        }
        if let Some(metadata) = new.get_mut("metadata").and_then(Value::as_object_mut) {
            for field in ["labels", "generation"] {
                match old.pointer(&format!("/metadata/{field}")) {
                    Some(value) => metadata.insert(field.to_string(), value.clone()),
                    None => metadata.remove(field),
                };
            }
        }

        let updated = Tenanted::new(key.tenant.clone(), from_value::<K>(new)?);
        Ok(self.commit(&mut state, key, updated, &current))
    }

    async fn patch(&self, key: &ObjectKey, patch: &Value) -> Result<Tenanted<K>, StoreError> {
        self.record(Verb::Patch, None, key);
        self.route(&key.tenant)?;

        let mut state = self.state();
        let current = state
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| self.not_found(key))?;
        self.check_preconditions(
            key,
            &current,
            patch.pointer("/metadata/uid").and_then(Value::as_str),
            patch
                .pointer("/metadata/resourceVersion")
                .and_then(Value::as_str),
        )?;

        let old = to_value(&current.object)?;
        let mut new = old.clone();
        merge_patch(&mut new, patch);
        bump_generation_if_spec_changed(&old, &mut new);

        let patched = Tenanted::new(key.tenant.clone(), from_value::<K>(new)?);
        Ok(self.commit(&mut state, key.clone(), patched, &current))
    }

    async fn delete(&self, key: &ObjectKey, preconditions: &Preconditions) -> Result<(), StoreError> {
        self.record(Verb::Delete, None, key);
        self.route(&key.tenant)?;

        let mut state = self.state();
        let current = state
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| self.not_found(key))?;
        self.check_preconditions(
            key,
            &current,
            preconditions.uid.as_deref(),
            preconditions.resource_version.as_deref(),
        )?;

        let mut deleted = current;
        deleted.meta_mut().resource_version = Some(state.next_revision());
        state.objects.remove(key);
        let _ = self.events.send(WatchEvent::Deleted(deleted));
        debug!(resource = %self.resource, %key, "deleted object");

        Ok(())
    }

    async fn watch(&self, params: &ListParams) -> Result<WatchStream<K>, StoreError> {
        if let Some(tenant) = &params.tenant {
            self.route(tenant)?;
        }
        let tenant = params.tenant.clone();
        let namespace = params.namespace.clone();
        let resource = self.resource.clone();

        let stream = BroadcastStream::new(self.events.subscribe()).filter_map(move |event| {
            let item = match event {
                Ok(event) => event
                    .object()
                    .in_scope(tenant.as_deref(), namespace.as_deref())
                    .then_some(Ok(event)),
                Err(BroadcastStreamRecvError::Lagged(missed)) => {
                    Some(Err(StoreError::Transport {
                        message: format!("watch on {resource} fell behind by {missed} events"),
                    }))
                }
            };
            futures::future::ready(item)
        });

        Ok(stream.boxed())
    }
}
