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


//! Eventually consistent local mirror of one kind, fed by a store list + watch.

use crate::store::{ListParams, ObjectStore, WatchEvent, compare_resource_versions};
use crate::types::key::ObjectKey;
use crate::types::selector::{Selector, SelectorExt};
use crate::types::tenanted::{StoreObject, Tenanted};
use futures::StreamExt;
use kube::ResourceExt;
use std::cmp::Ordering as VersionOrdering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A change observed by the cache, with snapshots before and after.
#[derive(Clone, Debug)]
pub enum CacheEvent<K> {
    Added(Arc<Tenanted<K>>),
    Updated {
        old: Arc<Tenanted<K>>,
        new: Arc<Tenanted<K>>,
    },
    Deleted(Arc<Tenanted<K>>),
}

pub type EventHandler<K> = Arc<dyn Fn(&CacheEvent<K>) + Send + Sync>;

/// Local object store of one kind, read-only to the controller.
pub struct Reflector<K> {
    objects: RwLock<HashMap<ObjectKey, Arc<Tenanted<K>>>>,
    handlers: RwLock<Vec<EventHandler<K>>>,
    synced: AtomicBool,
}

impl<K: StoreObject> Default for Reflector<K> {
    fn default() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            handlers: RwLock::new(Vec::new()),
            synced: AtomicBool::new(false),
        }
    }
}

impl<K: StoreObject> Reflector<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &ObjectKey) -> Option<Arc<Tenanted<K>>> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Objects of one tenant, optionally narrowed to a namespace and selector.
    pub fn list(
        &self,
        tenant: &str,
        namespace: Option<&str>,
        selector: Option<&Selector>,
    ) -> Vec<Arc<Tenanted<K>>> {
        let mut found: Vec<_> = self
            .objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|obj| obj.in_scope(Some(tenant), namespace))
            .filter(|obj| selector.is_none_or(|s| s.matches(obj.labels())))
            .cloned()
            .collect();
        found.sort_by_key(|obj| obj.meta().name.clone());
        found
    }

    pub fn list_all(&self) -> Vec<Arc<Tenanted<K>>> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn add_handler(&self, handler: EventHandler<K>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    pub fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    /// Puts an object into the cache without notifying handlers.
    pub fn insert(&self, object: Tenanted<K>) {
        let Ok(key) = object.key() else {
            warn!(name = %object.name_any(), "ignoring object without namespace");
            return;
        };
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, Arc::new(object));
    }

    /// Applies one watch event and notifies handlers.
    pub fn apply(&self, event: WatchEvent<K>) {
        let Ok(key) = event.object().key() else {
            warn!(name = %event.object().name_any(), "ignoring object without namespace");
            return;
        };

        let notification = {
            let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
            match event {
                WatchEvent::Added(obj) | WatchEvent::Modified(obj) => {
                    let new = Arc::new(obj);
                    match objects.insert(key, new.clone()) {
                        Some(old) => CacheEvent::Updated { old, new },
                        None => CacheEvent::Added(new),
                    }
                }
                WatchEvent::Deleted(obj) => {
                    let last = objects.remove(&key).unwrap_or_else(|| Arc::new(obj));
                    CacheEvent::Deleted(last)
                }
            }
        };

        self.dispatch(&notification);
    }

    /// Replaces the whole content after a (re-)list. Objects still present are reported as
    /// updates even when unchanged, so a re-list doubles as a resync.
    pub fn replace(&self, items: Vec<Tenanted<K>>) {
        let mut notifications = Vec::new();
        {
            let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
            let mut fresh = HashMap::with_capacity(items.len());
            for item in items {
                if let Ok(key) = item.key() {
                    fresh.insert(key, Arc::new(item));
                }
            }

            for (key, old) in objects.iter() {
                if !fresh.contains_key(key) {
                    notifications.push(CacheEvent::Deleted(old.clone()));
                }
            }
            for (key, new) in &fresh {
                match objects.get(key) {
                    Some(old) => notifications.push(CacheEvent::Updated {
                        old: old.clone(),
                        new: new.clone(),
                    }),
                    None => notifications.push(CacheEvent::Added(new.clone())),
                }
            }
            *objects = fresh;
        }

        self.synced.store(true, Ordering::Release);
        for notification in &notifications {
            self.dispatch(notification);
        }
    }

    fn dispatch(&self, event: &CacheEvent<K>) {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in handlers {
            handler(event);
        }
    }
}

/// Keeps a [`Reflector`] current: list, then follow the watch until the stream ends, fails, or the resync
/// period elapses, then list again.
pub struct Informer<K: StoreObject> {
    store: Arc<dyn ObjectStore<K>>,
    reflector: Arc<Reflector<K>>,
    params: ListParams,
    resync_period: Duration,
    retry_delay: Duration,
}

impl<K: StoreObject> Informer<K> {
    pub fn new(
        store: Arc<dyn ObjectStore<K>>,
        reflector: Arc<Reflector<K>>,
        params: ListParams,
        resync_period: Duration,
    ) -> Self {
        Self {
            store,
            reflector,
            params,
            resync_period,
            retry_delay: Duration::from_secs(1),
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let kind = K::kind(&()).to_string();
        info!(%kind, "starting informer");

        while !cancel.is_cancelled() {
            if let Err(e) = self.list_and_watch(&cancel).await {
                warn!(%kind, error = %e, "watch failed, re-listing");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.retry_delay) => {}
                }
            }
        }

        info!(%kind, "informer stopped");
    }

    async fn list_and_watch(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(), crate::store::StoreError> {
        // Watch before listing so nothing written in between is missed. Events the list
        // already covers are dropped by `is_replayed`.
        let mut events = self.store.watch(&self.params).await?;
        let list = self.store.list(&self.params).await?;
        debug!(count = list.items.len(), "listed objects");
        self.reflector.replace(list.items);

        let resync = tokio::time::sleep(self.resync_period);
        tokio::pin!(resync);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = &mut resync => return Ok(()),
                event = events.next() => match event {
                    Some(Ok(event)) => {
                        if is_replayed(&self.reflector, &event) {
                            debug!(name = %event.object().name_any(), "dropping replayed watch event");
                        } else {
                            self.reflector.apply(event);
                        }
                    }
                    Some(Err(e)) => return Err(e),
                    None => return Ok(()),
                },
            }
        }
    }
}

/// Whether the cache already holds this object at the event's resource version or later.
/// A key belongs to a single store partition, so the two versions are comparable.
fn is_replayed<K: StoreObject>(reflector: &Reflector<K>, event: &WatchEvent<K>) -> bool {
    let object = event.object();
    let Ok(key) = object.key() else {
        return false;
    };
    let (Some(cached), Some(incoming)) = (reflector.get(&key), object.resource_version()) else {
        return false;
    };
    cached.resource_version().is_some_and(|current| {
        compare_resource_versions(&incoming, &current) != VersionOrdering::Greater
    })
}
