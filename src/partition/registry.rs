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


//! Store-backed partition membership.
//!
//! Each replica keeps a `ControllerInstance` record alive with heartbeats. On every heartbeat
//! it lists its peers, reaps the ones whose heartbeat went stale, and derives its own range
//! from its position among the live instances sorted by name.

use crate::partition::{PartitionAssignment, PartitionMembership};
use crate::store::{ListParams, ObjectStore, Preconditions, StoreError};
use crate::types::key::ObjectKey;
use crate::types::tenanted::Tenanted;
use crate::types::v1::controller_instance::{ControllerInstance, ControllerInstanceSpec};
use chrono::Utc;
use kube::ResourceExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub struct RegistryConfig {
    pub controller_type: String,
    pub instance_name: String,
    pub tenant: String,
    pub namespace: String,
    pub heartbeat_interval: Duration,
    pub staleness: Duration,
}

pub struct InstanceRegistry {
    store: Arc<dyn ObjectStore<ControllerInstance>>,
    config: RegistryConfig,
    tx: watch::Sender<PartitionAssignment>,
    processed: AtomicI64,
}

impl InstanceRegistry {
    pub fn new(store: Arc<dyn ObjectStore<ControllerInstance>>, config: RegistryConfig) -> Self {
        let (tx, _) = watch::channel(PartitionAssignment::whole());
        Self {
            store,
            config,
            tx,
            processed: AtomicI64::new(0),
        }
    }

    fn own_key(&self) -> ObjectKey {
        ObjectKey::new(
            self.config.tenant.clone(),
            self.config.namespace.clone(),
            self.config.instance_name.clone(),
        )
    }

    fn staleness(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.staleness).unwrap_or(chrono::Duration::MAX)
    }

    fn new_record(&self) -> Tenanted<ControllerInstance> {
        let assignment = self.current();
        let mut instance = ControllerInstance::new(
            &self.config.instance_name,
            ControllerInstanceSpec {
                controller_type: self.config.controller_type.clone(),
                lower_bound: assignment.lower,
                upper_bound: assignment.upper,
                workload_num: 0,
                heartbeat: None,
            },
        );
        instance.metadata.namespace = Some(self.config.namespace.clone());
        instance.set_heartbeat(Utc::now());
        Tenanted::new(self.config.tenant.clone(), instance)
    }

    /// Creates this replica's record, taking over a leftover record of the same name.
    pub async fn register(&self) -> Result<(), StoreError> {
        match self.store.create(&self.new_record()).await {
            Ok(_) => {
                info!(instance = %self.config.instance_name, "registered controller instance");
                Ok(())
            }
            Err(e) if e.is_already_exists() => {
                let mut existing = self.store.get(&self.own_key()).await?;
                existing.set_heartbeat(Utc::now());
                self.store.update(&existing).await?;
                info!(instance = %self.config.instance_name, "took over controller instance record");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// One heartbeat: refresh the own record, reap stale peers and publish the new range.
    pub async fn refresh(&self) -> Result<PartitionAssignment, StoreError> {
        let now = Utc::now();
        let staleness = self.staleness();
        let params = ListParams::default()
            .tenant(self.config.tenant.clone())
            .namespace(self.config.namespace.clone());
        let peers: Vec<_> = self
            .store
            .list(&params)
            .await?
            .items
            .into_iter()
            .filter(|i| i.spec.controller_type == self.config.controller_type)
            .collect();

        let mut live = Vec::new();
        let mut own = None;
        for peer in peers {
            if peer.name_any() == self.config.instance_name {
                own = Some(peer);
            } else if peer.is_alive(now, staleness) {
                live.push(peer.name_any());
            } else {
                self.reap(&peer).await;
            }
        }
        live.push(self.config.instance_name.clone());
        live.sort();

        let index = live
            .iter()
            .position(|name| *name == self.config.instance_name)
            .unwrap_or(0);
        let previous = self.current();
        let mut assignment = PartitionAssignment::slice(index, live.len(), previous.revision);
        if !assignment.same_range(&previous) {
            assignment.revision = previous.revision + 1;
        }

        let mut record = match own {
            Some(record) => record,
            None => {
                warn!(instance = %self.config.instance_name, "own instance record vanished, recreating");
                self.store.create(&self.new_record()).await?
            }
        };
        record.spec.lower_bound = assignment.lower;
        record.spec.upper_bound = assignment.upper;
        record.spec.workload_num = self.processed.swap(0, Ordering::Relaxed);
        record.set_heartbeat(now);
        self.store.update(&record).await?;

        let published = assignment.clone();
        self.tx.send_if_modified(|current| {
            if current.same_range(&published) {
                false
            } else {
                info!(
                    index = published.index,
                    members = published.members,
                    revision = published.revision,
                    "partition assignment changed"
                );
                *current = published;
                true
            }
        });

        Ok(assignment)
    }

    async fn reap(&self, peer: &Tenanted<ControllerInstance>) {
        let Ok(key) = peer.key() else {
            return;
        };
        let preconditions = Preconditions {
            uid: peer.metadata.uid.clone(),
            resource_version: peer.metadata.resource_version.clone(),
        };
        match self.store.delete(&key, &preconditions).await {
            Ok(()) => info!(instance = %key.name, "reaped stale controller instance"),
            Err(e) if e.is_not_found() || e.is_conflict() => {
                debug!(instance = %key.name, "stale instance changed before reaping");
            }
            Err(e) => warn!(instance = %key.name, error = %e, "failed to reap stale instance"),
        }
    }

    pub async fn deregister(&self) -> Result<(), StoreError> {
        match self
            .store
            .delete(&self.own_key(), &Preconditions::default())
            .await
        {
            Err(e) if !e.is_not_found() => Err(e),
            _ => {
                info!(instance = %self.config.instance_name, "deregistered controller instance");
                Ok(())
            }
        }
    }

    /// Heartbeats until cancelled, then removes the own record.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh().await {
                        warn!(error = %e, "controller instance heartbeat failed");
                    }
                }
            }
        }

        if let Err(e) = self.deregister().await {
            warn!(error = %e, "failed to deregister controller instance");
        }
    }
}

impl PartitionMembership for InstanceRegistry {
    fn current(&self) -> PartitionAssignment {
        self.tx.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<PartitionAssignment> {
        self.tx.subscribe()
    }

    fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }
}
