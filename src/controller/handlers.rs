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

//! Maps cache events of deployments, replica sets and pods to deployment keys.

use super::DeploymentController;
use crate::cache::CacheEvent;
use crate::reconcile::recreate::is_pod_terminal;
use crate::reconcile::util::{self, CONTROLLER_KIND, StrategyType};
use crate::types::key::ObjectKey;
use crate::types::selector::{SelectorExt, parse_selector};
use crate::types::tenanted::Tenanted;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

const REPLICA_SET_KIND: &str = "ReplicaSet";

impl DeploymentController {
    pub(super) fn register_handlers(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.ctx
            .deployment_cache
            .add_handler(Arc::new(move |event: &CacheEvent<Deployment>| {
                if let Some(controller) = weak.upgrade() {
                    match event {
                        CacheEvent::Added(d) | CacheEvent::Deleted(d) => {
                            controller.enqueue_deployment(d)
                        }
                        CacheEvent::Updated { new, .. } => controller.enqueue_deployment(new),
                    }
                }
            }));

        let weak: Weak<Self> = Arc::downgrade(self);
        self.ctx
            .replica_set_cache
            .add_handler(Arc::new(move |event: &CacheEvent<ReplicaSet>| {
                if let Some(controller) = weak.upgrade() {
                    match event {
                        CacheEvent::Added(rs) => controller.add_replica_set(rs),
                        CacheEvent::Updated { old, new } => controller.update_replica_set(old, new),
                        CacheEvent::Deleted(rs) => controller.delete_replica_set(rs),
                    }
                }
            }));

        let weak: Weak<Self> = Arc::downgrade(self);
        self.ctx
            .pod_cache
            .add_handler(Arc::new(move |event: &CacheEvent<Pod>| {
                if let (Some(controller), CacheEvent::Deleted(pod)) = (weak.upgrade(), event) {
                    controller.delete_pod(pod);
                }
            }));
    }

    fn enqueue_deployment(&self, deployment: &Tenanted<Deployment>) {
        match deployment.key() {
            Ok(key) => self.enqueue(key),
            Err(e) => warn!(deployment = %deployment.name_any(), error = %e, "cannot queue deployment"),
        }
    }

    /// The deployment a controller reference points at, if it still has the referenced uid.
    fn resolve_controller_ref(
        &self,
        tenant: &str,
        namespace: &str,
        owner: &OwnerReference,
    ) -> Option<Arc<Tenanted<Deployment>>> {
        if owner.kind != CONTROLLER_KIND {
            return None;
        }
        let deployment = self
            .ctx
            .deployment_cache
            .get(&ObjectKey::new(tenant, namespace, owner.name.clone()))?;
        (deployment.metadata.uid.as_deref() == Some(owner.uid.as_str())).then_some(deployment)
    }

    /// Deployments whose selector matches an orphaned replica set.
    fn deployments_for_replica_set(
        &self,
        rs: &Tenanted<ReplicaSet>,
    ) -> Vec<Arc<Tenanted<Deployment>>> {
        let namespace = rs.namespace();
        let matching: Vec<_> = self
            .ctx
            .deployment_cache
            .list(&rs.tenant, namespace.as_deref(), None)
            .into_iter()
            .filter(|d| {
                d.spec
                    .as_ref()
                    .and_then(|spec| parse_selector(&spec.selector).ok())
                    .is_some_and(|selector| !selector.selects_all() && selector.matches(rs.labels()))
            })
            .collect();

        if matching.len() > 1 {
            warn!(
                replica_set = %rs.name_any(),
                deployments = matching.len(),
                "more than one deployment selects replica set"
            );
        }
        matching
    }

    pub(crate) fn add_replica_set(&self, rs: &Tenanted<ReplicaSet>) {
        if rs.metadata.deletion_timestamp.is_some() {
            self.delete_replica_set(rs);
            return;
        }

        let namespace = rs.namespace().unwrap_or_default();
        if let Some(owner) = util::controller_ref(&rs.metadata) {
            if let Some(d) = self.resolve_controller_ref(&rs.tenant, &namespace, owner) {
                debug!(replica_set = %rs.name_any(), "replica set added");
                self.enqueue_deployment(&d);
            }
            return;
        }

        for d in self.deployments_for_replica_set(rs) {
            self.enqueue_deployment(&d);
        }
    }

    pub(crate) fn update_replica_set(&self, old: &Tenanted<ReplicaSet>, new: &Tenanted<ReplicaSet>) {
        if old.metadata.resource_version == new.metadata.resource_version {
            return;
        }

        let namespace = new.namespace().unwrap_or_default();
        let old_owner = util::controller_ref(&old.metadata);
        let new_owner = util::controller_ref(&new.metadata);
        let owner_changed = old_owner != new_owner;

        if owner_changed
            && let Some(owner) = old_owner
            && let Some(d) = self.resolve_controller_ref(&old.tenant, &namespace, owner)
        {
            self.enqueue_deployment(&d);
        }

        if let Some(owner) = new_owner {
            if let Some(d) = self.resolve_controller_ref(&new.tenant, &namespace, owner) {
                debug!(replica_set = %new.name_any(), "replica set updated");
                self.enqueue_deployment(&d);
            }
            return;
        }

        if owner_changed || old.labels() != new.labels() {
            for d in self.deployments_for_replica_set(new) {
                self.enqueue_deployment(&d);
            }
        }
    }

    pub(crate) fn delete_replica_set(&self, rs: &Tenanted<ReplicaSet>) {
        let namespace = rs.namespace().unwrap_or_default();
        let Some(owner) = util::controller_ref(&rs.metadata) else {
            return;
        };
        if let Some(d) = self.resolve_controller_ref(&rs.tenant, &namespace, owner) {
            debug!(replica_set = %rs.name_any(), "replica set deleted");
            self.enqueue_deployment(&d);
        }
    }

    /// A Recreate deployment waits for its old pods to go away; the last one to go wakes it up.
    pub(crate) fn delete_pod(&self, pod: &Tenanted<Pod>) {
        let namespace = pod.namespace().unwrap_or_default();
        let Some(owner) = util::controller_ref(&pod.metadata) else {
            return;
        };
        if owner.kind != REPLICA_SET_KIND {
            return;
        }
        let Some(rs) = self.ctx.replica_set_cache.get(&ObjectKey::new(
            pod.tenant.clone(),
            namespace.clone(),
            owner.name.clone(),
        )) else {
            return;
        };
        if rs.metadata.uid.as_deref() != Some(owner.uid.as_str()) {
            return;
        }
        let Some(d) = util::controller_ref(&rs.metadata)
            .and_then(|owner| self.resolve_controller_ref(&rs.tenant, &namespace, owner))
        else {
            return;
        };
        if util::strategy_type(&d) != StrategyType::Recreate {
            return;
        }
        let Some(selector) = d
            .spec
            .as_ref()
            .and_then(|spec| parse_selector(&spec.selector).ok())
        else {
            return;
        };

        let owned: HashSet<String> = self
            .ctx
            .replica_set_cache
            .list(&d.tenant, Some(&namespace), None)
            .into_iter()
            .filter(|candidate| match util::controller_ref(&candidate.metadata) {
                Some(owner) => d.metadata.uid.as_deref() == Some(owner.uid.as_str()),
                None => selector.matches(candidate.labels()),
            })
            .filter_map(|candidate| candidate.metadata.uid.clone())
            .collect();

        let remaining = self
            .ctx
            .pod_cache
            .list(&d.tenant, Some(&namespace), Some(&selector))
            .into_iter()
            .filter(|p| p.metadata.uid != pod.metadata.uid)
            .filter(|p| {
                util::controller_ref(&p.metadata).is_some_and(|owner| owned.contains(&owner.uid))
            })
            .filter(|p| !is_pod_terminal(p))
            .count();

        if remaining == 0 {
            debug!(pod = %pod.name_any(), deployment = %d.name_any(), "last old pod deleted");
            self.enqueue_deployment(&d);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use crate::tests::{
        Fixture, TENANT_DEFAULT, TENANT_OTHER, generate_pod_from_rs, new_deployment,
        new_replica_set, orphan, recreate,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn bump_resource_version(meta: &mut ObjectMeta) {
        let current: u64 = meta
            .resource_version
            .as_deref()
            .and_then(|rv| rv.parse().ok())
            .unwrap_or(0);
        meta.resource_version = Some((current + 1).to_string());
    }

    fn check_add_replica_set(tenant: &str) {
        let f = Fixture::new();
        let d1 = f.add_deployment(new_deployment("d1", 1, None, None, None, tenant));
        let d2 = f.add_deployment(new_deployment("d2", 1, None, None, None, tenant));
        let rs1 = new_replica_set(&d1, "rs1", 1, tenant);
        let rs2 = new_replica_set(&d2, "rs2", 1, tenant);
        let dc = f.controller();

        dc.add_replica_set(&rs1);
        assert_eq!(dc.queue().pending(), vec![d1.key().unwrap()]);
        dc.queue().clear();

        dc.add_replica_set(&rs2);
        assert_eq!(dc.queue().pending(), vec![d2.key().unwrap()]);
    }

    #[test]
    fn test_add_replica_set() {
        check_add_replica_set(TENANT_DEFAULT);
        check_add_replica_set(TENANT_OTHER);
    }

    #[test]
    fn test_add_replica_set_orphan() {
        let f = Fixture::new();
        let d1 = f.add_deployment(new_deployment("d1", 1, None, None, None, TENANT_DEFAULT));
        f.add_deployment(new_deployment("d2", 1, None, None, None, TENANT_DEFAULT));
        let mut d3 = new_deployment("d3", 1, None, None, None, TENANT_DEFAULT);
        d3.spec.as_mut().unwrap().selector.match_labels =
            Some([("foo".to_string(), "notbar".to_string())].into());
        f.add_deployment(d3);
        let dc = f.controller();

        dc.add_replica_set(&orphan(new_replica_set(&d1, "rs1", 1, TENANT_DEFAULT)));
        assert_eq!(dc.queue().len(), 2);
    }

    #[test]
    fn test_add_replica_set_other_tenant_is_ignored() {
        let f = Fixture::new();
        let d1 = f.add_deployment(new_deployment("d1", 1, None, None, None, TENANT_DEFAULT));
        let dc = f.controller();

        let mut rs = orphan(new_replica_set(&d1, "rs1", 1, TENANT_DEFAULT));
        rs.tenant = TENANT_OTHER.to_string();
        dc.add_replica_set(&rs);
        assert!(dc.queue().is_empty());
    }

    #[test]
    fn test_update_replica_set() {
        let f = Fixture::new();
        let d1 = f.add_deployment(new_deployment("d1", 1, None, None, None, TENANT_DEFAULT));
        let d2 = f.add_deployment(new_deployment("d2", 1, None, None, None, TENANT_DEFAULT));
        let rs1 = f.add_replica_set(new_replica_set(&d1, "rs1", 1, TENANT_DEFAULT));
        let rs2 = f.add_replica_set(new_replica_set(&d2, "rs2", 1, TENANT_DEFAULT));
        let dc = f.controller();

        let mut next = rs1.clone();
        bump_resource_version(&mut next.metadata);
        dc.update_replica_set(&rs1, &next);
        assert_eq!(dc.queue().pending(), vec![d1.key().unwrap()]);
        dc.queue().clear();

        let mut next = rs2.clone();
        bump_resource_version(&mut next.metadata);
        dc.update_replica_set(&rs2, &next);
        assert_eq!(dc.queue().pending(), vec![d2.key().unwrap()]);
        dc.queue().clear();

        // Resync: same resource version.
        dc.update_replica_set(&rs2, &rs2);
        assert!(dc.queue().is_empty());
    }

    #[test]
    fn test_update_replica_set_orphan_with_new_labels() {
        let f = Fixture::new();
        let d1 = f.add_deployment(new_deployment("d1", 1, None, None, None, TENANT_DEFAULT));
        f.add_deployment(new_deployment("d2", 1, None, None, None, TENANT_DEFAULT));
        let rs = f.add_replica_set(orphan(new_replica_set(&d1, "rs1", 1, TENANT_DEFAULT)));
        let dc = f.controller();

        let mut prev = rs.clone();
        prev.metadata.labels = Some([("foo".to_string(), "notbar".to_string())].into());
        let mut next = rs.clone();
        bump_resource_version(&mut next.metadata);
        dc.update_replica_set(&prev, &next);
        assert_eq!(dc.queue().len(), 2);
    }

    #[test]
    fn test_update_replica_set_change_controller_ref() {
        let f = Fixture::new();
        let d1 = f.add_deployment(new_deployment("d1", 1, None, None, None, TENANT_DEFAULT));
        let d2 = f.add_deployment(new_deployment("d2", 1, None, None, None, TENANT_DEFAULT));
        let rs = f.add_replica_set(new_replica_set(&d1, "rs1", 1, TENANT_DEFAULT));
        let dc = f.controller();

        let mut prev = rs.clone();
        prev.metadata.owner_references = Some(vec![crate::reconcile::util::new_controller_ref(&d2)]);
        let mut next = rs.clone();
        bump_resource_version(&mut next.metadata);
        dc.update_replica_set(&prev, &next);
        assert_eq!(dc.queue().len(), 2);
    }

    #[test]
    fn test_update_replica_set_release() {
        let f = Fixture::new();
        let d1 = f.add_deployment(new_deployment("d1", 1, None, None, None, TENANT_DEFAULT));
        f.add_deployment(new_deployment("d2", 1, None, None, None, TENANT_DEFAULT));
        let rs = f.add_replica_set(new_replica_set(&d1, "rs1", 1, TENANT_DEFAULT));
        let dc = f.controller();

        let prev = rs.clone();
        let mut next = orphan(rs.clone());
        bump_resource_version(&mut next.metadata);
        dc.update_replica_set(&prev, &next);
        assert_eq!(dc.queue().len(), 2);
    }

    #[test]
    fn test_delete_replica_set() {
        let f = Fixture::new();
        let d1 = f.add_deployment(new_deployment("d1", 1, None, None, None, TENANT_DEFAULT));
        let d2 = f.add_deployment(new_deployment("d2", 1, None, None, None, TENANT_DEFAULT));
        let rs1 = new_replica_set(&d1, "rs1", 1, TENANT_DEFAULT);
        let rs2 = new_replica_set(&d2, "rs2", 1, TENANT_DEFAULT);
        let dc = f.controller();

        dc.delete_replica_set(&rs1);
        assert_eq!(dc.queue().pending(), vec![d1.key().unwrap()]);
        dc.queue().clear();

        dc.delete_replica_set(&rs2);
        assert_eq!(dc.queue().pending(), vec![d2.key().unwrap()]);
    }

    #[test]
    fn test_delete_replica_set_orphan() {
        let f = Fixture::new();
        let d1 = f.add_deployment(new_deployment("d1", 1, None, None, None, TENANT_DEFAULT));
        f.add_deployment(new_deployment("d2", 1, None, None, None, TENANT_DEFAULT));
        let dc = f.controller();

        dc.delete_replica_set(&orphan(new_replica_set(&d1, "rs1", 1, TENANT_DEFAULT)));
        assert!(dc.queue().is_empty());
    }

    #[test]
    fn test_add_replica_set_being_deleted_only_wakes_owner() {
        let f = Fixture::new();
        let d1 = f.add_deployment(new_deployment("d1", 1, None, None, None, TENANT_DEFAULT));
        let dc = f.controller();

        let mut rs = orphan(new_replica_set(&d1, "rs1", 1, TENANT_DEFAULT));
        rs.metadata.deletion_timestamp = crate::utils::time::now_time();
        dc.add_replica_set(&rs);
        assert!(dc.queue().is_empty());
    }

    fn check_pod_deletion_enqueues_recreate(tenant: &str) {
        let f = Fixture::new();
        let foo = f.add_deployment(recreate(new_deployment("foo", 1, None, None, None, tenant)));
        let rs = f.add_replica_set(new_replica_set(&foo, "foo-1", 1, tenant));
        let pod = generate_pod_from_rs(&rs, "Running", tenant);
        let dc = f.controller();

        dc.delete_pod(&pod);
        assert_eq!(dc.queue().pending(), vec![foo.key().unwrap()]);
    }

    #[test]
    fn test_pod_deletion_enqueues_recreate_deployment() {
        check_pod_deletion_enqueues_recreate(TENANT_DEFAULT);
        check_pod_deletion_enqueues_recreate(TENANT_OTHER);
    }

    #[test]
    fn test_pod_deletion_doesnt_enqueue_recreate_deployment() {
        let f = Fixture::new();
        let foo = f.add_deployment(recreate(new_deployment(
            "foo",
            1,
            None,
            None,
            None,
            TENANT_DEFAULT,
        )));
        let rs = f.add_replica_set(new_replica_set(&foo, "foo-1", 2, TENANT_DEFAULT));
        let pod = generate_pod_from_rs(&rs, "Running", TENANT_DEFAULT);
        let mut other = generate_pod_from_rs(&rs, "Running", TENANT_DEFAULT);
        other.metadata.name = Some("foo-1-other".to_string());
        other.metadata.uid = Some("other-pod-uid".to_string());
        f.add_pod(other);
        let dc = f.controller();

        dc.delete_pod(&pod);
        assert!(dc.queue().is_empty());
    }

    #[test]
    fn test_pod_deletion_ignores_terminated_pods() {
        let f = Fixture::new();
        let foo = f.add_deployment(recreate(new_deployment(
            "foo",
            1,
            None,
            None,
            None,
            TENANT_DEFAULT,
        )));
        let rs = f.add_replica_set(new_replica_set(&foo, "foo-1", 2, TENANT_DEFAULT));
        let pod = generate_pod_from_rs(&rs, "Running", TENANT_DEFAULT);
        let mut done = generate_pod_from_rs(&rs, "Succeeded", TENANT_DEFAULT);
        done.metadata.name = Some("foo-1-done".to_string());
        done.metadata.uid = Some("done-pod-uid".to_string());
        f.add_pod(done);
        let dc = f.controller();

        dc.delete_pod(&pod);
        assert_eq!(dc.queue().len(), 1);
    }

    #[test]
    fn test_pod_deletion_partial_replica_set_ownership_enqueues() {
        let f = Fixture::new();
        let foo = f.add_deployment(recreate(new_deployment(
            "foo",
            1,
            None,
            None,
            None,
            TENANT_DEFAULT,
        )));
        let rs1 = f.add_replica_set(new_replica_set(&foo, "foo-1", 1, TENANT_DEFAULT));
        f.add_replica_set(orphan(new_replica_set(&foo, "foo-2", 1, TENANT_DEFAULT)));
        let pod = generate_pod_from_rs(&rs1, "Running", TENANT_DEFAULT);
        let dc = f.controller();

        dc.delete_pod(&pod);
        assert_eq!(dc.queue().len(), 1);
    }

    #[test]
    fn test_pod_deletion_partial_replica_set_ownership_doesnt_enqueue() {
        let f = Fixture::new();
        let foo = f.add_deployment(recreate(new_deployment(
            "foo",
            1,
            None,
            None,
            None,
            TENANT_DEFAULT,
        )));
        let rs1 = f.add_replica_set(new_replica_set(&foo, "foo-1", 1, TENANT_DEFAULT));
        let rs2 = f.add_replica_set(orphan(new_replica_set(&foo, "foo-2", 1, TENANT_DEFAULT)));
        let pod = generate_pod_from_rs(&rs1, "Running", TENANT_DEFAULT);
        // A pod of the orphaned sibling still runs.
        f.add_pod(generate_pod_from_rs(&rs2, "Running", TENANT_DEFAULT));
        let dc = f.controller();

        dc.delete_pod(&pod);
        assert!(dc.queue().is_empty());
    }

    #[test]
    fn test_pod_deletion_ignores_rolling_deployments() {
        let f = Fixture::new();
        let foo = f.add_deployment(new_deployment("foo", 1, None, None, None, TENANT_DEFAULT));
        let rs = f.add_replica_set(new_replica_set(&foo, "foo-1", 1, TENANT_DEFAULT));
        let pod = generate_pod_from_rs(&rs, "Running", TENANT_DEFAULT);
        let dc = f.controller();

        dc.delete_pod(&pod);
        assert!(dc.queue().is_empty());
    }
}
