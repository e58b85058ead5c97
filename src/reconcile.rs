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

//! One pass of deployment reconciliation, from a queue key to store writes.

use crate::context::Context;
use crate::store::StoreError;
use crate::types;
use crate::types::error::NoSpecSnafu;
use crate::types::key::ObjectKey;
use crate::types::selector::parse_selector;
use kube::runtime::events::EventType;
use snafu::{OptionExt, Snafu};
use std::time::Duration;
use tracing::debug;
use util::{Reason, StrategyType};

pub mod ownership;
pub mod progress;
pub mod recreate;
pub mod rollback;
pub mod rolling;
pub mod sync;
pub mod util;

#[derive(Snafu, Debug)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(transparent)]
    Store { source: StoreError },

    #[snafu(transparent)]
    Types { source: types::error::Error },

    #[snafu(display("cached deployment {} is out of date: {}", key, reason))]
    CacheStale { key: String, reason: String },

    #[snafu(display("hash collision creating new replica set '{}'", name))]
    HashCollision { name: String },

    #[snafu(display("invalid queue key '{}': {}", key, source))]
    InvalidKey {
        key: String,
        source: types::error::Error,
    },
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Store { source } if source.is_not_found())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Store { source } if source.is_conflict())
    }

    /// Errors the API server will keep returning until someone changes the object.
    pub fn is_rejected(&self) -> bool {
        matches!(
            self,
            Error::Store {
                source: StoreError::Forbidden { .. } | StoreError::Invalid { .. }
            }
        )
    }

    /// A deployment whose spec cannot be interpreted, e.g. an unparsable maxSurge.
    pub fn is_malformed(&self) -> bool {
        matches!(self, Error::Types { .. })
    }

    /// A malformed queue key fails the same way on every attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::InvalidKey { .. })
    }
}

/// What the worker does with a key after a successful sync.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    /// Nothing to do until the next watch event or resync.
    pub fn await_change() -> Self {
        Self::default()
    }

    pub fn requeue(after: Duration) -> Self {
        Self {
            requeue_after: Some(after),
        }
    }

    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }
}

/// Reconciles the deployment behind `key` against its replica sets.
pub async fn sync_deployment(ctx: &Context, key: &ObjectKey) -> Result<Action, Error> {
    let Some(cached) = ctx.deployment_cache.get(key) else {
        debug!(deployment = %key, "deployment has been deleted");
        return Ok(Action::await_change());
    };
    let mut deployment = (*cached).clone();

    let spec = deployment.spec.as_ref().context(NoSpecSnafu {
        kind: "Deployment",
        name: key.to_string(),
    })?;
    let selector = parse_selector(&spec.selector)?;

    if selector.selects_all() {
        ctx.record(
            &deployment,
            EventType::Warning,
            Reason::SelectingAll,
            "This deployment is selecting all pods. A non-empty selector is required.",
        )
        .await;
        let mut status = util::status(&deployment);
        if status.observed_generation.unwrap_or(0) < util::generation(&deployment) {
            status.observed_generation = deployment.metadata.generation;
            ctx.update_status(&deployment, status).await?;
        }
        return Ok(Action::await_change());
    }

    let replica_sets = ownership::claim_replica_sets(ctx, &deployment, &selector).await?;
    let pods = ownership::pod_map(ctx, &deployment, &selector, &replica_sets);

    if deployment.metadata.deletion_timestamp.is_some() {
        return sync::sync_status_only(ctx, &mut deployment, &replica_sets).await;
    }

    progress::check_paused_conditions(ctx, &mut deployment).await?;

    if util::paused(&deployment) {
        return sync::sync(ctx, &mut deployment, &replica_sets).await;
    }

    if util::rollback_to(&deployment).is_some() {
        return rollback::rollback(ctx, &mut deployment, &replica_sets).await;
    }

    if sync::is_scaling_event(ctx, &mut deployment, &replica_sets).await? {
        return sync::sync(ctx, &mut deployment, &replica_sets).await;
    }

    match util::strategy_type(&deployment) {
        StrategyType::Recreate => {
            recreate::rollout_recreate(ctx, &mut deployment, &replica_sets, &pods).await
        }
        StrategyType::RollingUpdate => {
            rolling::rollout_rolling(ctx, &mut deployment, &replica_sets).await
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::tests::{
        Fixture, TENANT_DEFAULT, TENANT_OTHER, generate_pod_from_rs, new_deployment,
        new_replica_set, orphan, recreate, with_available, with_revision,
    };
    use crate::types::tenanted::Tenanted;
    use crate::utils::time::now_time;
    use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus, ReplicaSet};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
    use kube::ResourceExt;

    const CHANGE_CAUSE: &str = "kubernetes.io/change-cause";

    fn key_of(name: &str, tenant: &str) -> ObjectKey {
        ObjectKey::new(tenant, "default", name)
    }

    /// A template the deployment no longer runs.
    fn outdated(mut rs: Tenanted<ReplicaSet>) -> Tenanted<ReplicaSet> {
        let spec = rs
            .spec
            .as_mut()
            .and_then(|s| s.template.as_mut())
            .and_then(|t| t.spec.as_mut())
            .unwrap();
        spec.termination_grace_period_seconds = Some(1);
        rs
    }

    fn annotate_revision(d: &mut Tenanted<Deployment>, revision: &str) {
        d.annotations_mut()
            .insert(util::REVISION_ANNOTATION.to_string(), revision.to_string());
    }

    fn stored_rs(f: &Fixture, name: &str) -> Tenanted<ReplicaSet> {
        f.replica_set_store
            .get_now(&key_of(name, TENANT_DEFAULT))
            .unwrap()
    }

    async fn check_creates_replica_set(tenant: &str) {
        let f = Fixture::new();
        let d = f.add_deployment(new_deployment("foo", 1, None, None, None, tenant));

        sync_deployment(&f.context(), &d.key().unwrap()).await.unwrap();

        assert_eq!(
            f.actions.rendered(),
            vec![
                "create replicasets",
                "update deployments/status",
                "update deployments/status"
            ]
        );
        let created = f.replica_set_store.snapshot();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].tenant, tenant);
        assert!(created[0].name_any().starts_with("foo-"));
        assert_eq!(util::rs_replicas(&created[0]), 1);
        assert!(created[0].labels().contains_key(util::POD_TEMPLATE_HASH_LABEL));
        assert_eq!(f.recorder.reasons(), vec!["ScalingReplicaSet"]);
    }

    #[tokio::test]
    async fn test_sync_creates_replica_set() {
        check_creates_replica_set(TENANT_DEFAULT).await;
        check_creates_replica_set(TENANT_OTHER).await;
    }

    #[tokio::test]
    async fn test_sync_only_updates_status_during_deletion() {
        for tenant in [TENANT_DEFAULT, TENANT_OTHER] {
            let f = Fixture::new();
            let mut d = new_deployment("foo", 1, None, None, None, tenant);
            d.metadata.deletion_timestamp = now_time();
            let d = f.add_deployment(d);

            sync_deployment(&f.context(), &d.key().unwrap()).await.unwrap();
            assert_eq!(f.actions.rendered(), vec!["update deployments/status"]);
        }
    }

    #[tokio::test]
    async fn test_sync_deletion_race() {
        for tenant in [TENANT_DEFAULT, TENANT_OTHER] {
            let f = Fixture::new();
            let d = new_deployment("foo", 1, None, None, None, tenant);
            // The cache has not seen the deletion the store already has.
            let mut deleted = d.clone();
            deleted.metadata.deletion_timestamp = now_time();
            f.deployment_store.seed(deleted).unwrap();
            f.deployments.insert(d.clone());
            // The recheck only happens when there is an orphan to adopt.
            f.add_replica_set(orphan(new_replica_set(&d, "rs1", 1, tenant)));

            let err = sync_deployment(&f.context(), &d.key().unwrap())
                .await
                .unwrap_err();
            assert!(matches!(err, Error::CacheStale { .. }), "{err}");
            assert_eq!(f.actions.rendered(), vec!["get deployments"]);
        }
    }

    #[tokio::test]
    async fn test_empty_selector_is_not_synced() {
        for tenant in [TENANT_DEFAULT, TENANT_OTHER] {
            let f = Fixture::new();
            let mut d = new_deployment("foo", 1, None, None, None, tenant);
            d.spec.as_mut().unwrap().selector = LabelSelector::default();
            let d = f.add_deployment(d);

            sync_deployment(&f.context(), &d.key().unwrap()).await.unwrap();
            assert!(f.actions.rendered().is_empty());
            assert_eq!(f.recorder.reasons(), vec!["SelectingAll"]);
        }
    }

    #[tokio::test]
    async fn test_missing_deployment_is_ignored() {
        let f = Fixture::new();
        let action = sync_deployment(&f.context(), &key_of("gone", TENANT_DEFAULT))
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
        assert!(f.actions.rendered().is_empty());
    }

    #[tokio::test]
    async fn test_reentrant_rollback() {
        for tenant in [TENANT_DEFAULT, TENANT_OTHER] {
            let f = Fixture::new();
            let mut d = new_deployment("foo", 1, None, None, None, tenant);
            annotate_revision(&mut d, "2");
            d.annotations_mut()
                .insert(util::ROLLBACK_TO_ANNOTATION.to_string(), "0".to_string());
            d.annotations_mut()
                .insert(CHANGE_CAUSE.to_string(), "image foo/bar:v2".to_string());
            let d = f.add_deployment(d);

            let mut rs1 = outdated(with_revision(
                new_replica_set(&d, "deploymentrs-old", 0, tenant),
                1,
            ));
            rs1.annotations_mut()
                .insert(CHANGE_CAUSE.to_string(), "image foo/bar:v1".to_string());
            let mut rs2 = with_revision(new_replica_set(&d, "deploymentrs-new", 1, tenant), 2);
            rs2.annotations_mut()
                .insert(CHANGE_CAUSE.to_string(), "image foo/bar:v2".to_string());
            for rs in [&mut rs1, &mut rs2] {
                rs.spec
                    .as_mut()
                    .unwrap()
                    .selector
                    .match_labels
                    .get_or_insert_with(Default::default)
                    .insert(util::POD_TEMPLATE_HASH_LABEL.to_string(), "hash".to_string());
            }
            f.add_replica_set(rs1);
            f.add_replica_set(rs2);

            sync_deployment(&f.context(), &d.key().unwrap()).await.unwrap();

            assert_eq!(f.actions.rendered(), vec!["update deployments"]);
            let stored = f.deployment_store.get_now(&d.key().unwrap()).unwrap();
            assert!(util::rollback_to(&stored).is_none());
            let template = &stored.spec.as_ref().unwrap().template;
            assert_eq!(
                template.spec.as_ref().unwrap().termination_grace_period_seconds,
                Some(1)
            );
            assert_eq!(
                stored.annotations().get(CHANGE_CAUSE).map(String::as_str),
                Some("image foo/bar:v1")
            );
            assert_eq!(util::revision(&stored.metadata), Some(2));
            assert!(f.recorder.reasons().contains(&"DeploymentRollback".to_string()));
        }
    }

    #[tokio::test]
    async fn test_rollback_without_history_only_clears_annotation() {
        let f = Fixture::new();
        let mut d = new_deployment("foo", 1, None, None, None, TENANT_DEFAULT);
        d.annotations_mut()
            .insert(util::ROLLBACK_TO_ANNOTATION.to_string(), "0".to_string());
        let d = f.add_deployment(d);

        sync_deployment(&f.context(), &d.key().unwrap()).await.unwrap();

        let rendered = f.actions.rendered();
        assert_eq!(rendered.last().unwrap(), "update deployments");
        let stored = f.deployment_store.get_now(&d.key().unwrap()).unwrap();
        assert!(util::rollback_to(&stored).is_none());
        assert!(
            f.recorder
                .reasons()
                .contains(&"DeploymentRollbackRevisionNotFound".to_string())
        );
    }

    #[tokio::test]
    async fn test_claim_keeps_replica_sets_of_each_deployment() {
        for tenant in [TENANT_DEFAULT, TENANT_OTHER] {
            let f = Fixture::new();
            // Same selector, ownership decided by controller references.
            let d1 = f.add_deployment(new_deployment("foo", 1, None, None, None, tenant));
            let d2 = f.add_deployment(new_deployment("bar", 1, None, None, None, tenant));
            f.add_replica_set(new_replica_set(&d1, "rs1", 1, tenant));
            f.add_replica_set(new_replica_set(&d2, "rs2", 1, tenant));
            let ctx = f.context();

            for (d, expected) in [(&d1, "rs1"), (&d2, "rs2")] {
                let selector =
                    parse_selector(&d.spec.as_ref().unwrap().selector).unwrap();
                let claimed = ownership::claim_replica_sets(&ctx, d, &selector)
                    .await
                    .unwrap();
                let names: Vec<_> = claimed.iter().map(|rs| rs.name_any()).collect();
                assert_eq!(names, vec![expected]);
            }
            assert!(f.actions.rendered().is_empty());
        }
    }

    #[tokio::test]
    async fn test_claim_adopts_and_releases() {
        for tenant in [TENANT_DEFAULT, TENANT_OTHER] {
            let f = Fixture::new();
            let d = f.add_deployment(new_deployment("foo", 1, None, None, None, tenant));
            // Matching labels but orphaned: adopted.
            f.add_replica_set(orphan(new_replica_set(&d, "rsAdopt", 1, tenant)));
            // Owned but no longer matching: released.
            let mut release = new_replica_set(&d, "rsRelease", 1, tenant);
            release.metadata.labels = Some([("foo".to_string(), "notbar".to_string())].into());
            f.add_replica_set(release);
            let ctx = f.context();

            let selector =
                parse_selector(&d.spec.as_ref().unwrap().selector).unwrap();
            let claimed = ownership::claim_replica_sets(&ctx, &d, &selector)
                .await
                .unwrap();

            let names: Vec<_> = claimed.iter().map(|rs| rs.name_any()).collect();
            assert_eq!(names, vec!["rsAdopt"]);
            assert_eq!(
                f.actions.rendered(),
                vec!["get deployments", "patch replicasets", "patch replicasets"]
            );

            let adopted = f
                .replica_set_store
                .get_now(&key_of("rsAdopt", tenant))
                .unwrap();
            assert_eq!(util::controller_ref(&adopted.metadata).unwrap().uid, d.uid().unwrap());
            let released = f
                .replica_set_store
                .get_now(&key_of("rsRelease", tenant))
                .unwrap();
            assert!(util::controller_ref(&released.metadata).is_none());
        }
    }

    #[tokio::test]
    async fn test_pod_map_groups_pods_by_controller() {
        for tenant in [TENANT_DEFAULT, TENANT_OTHER] {
            let f = Fixture::new();
            let d = f.add_deployment(new_deployment("foo", 1, None, None, None, tenant));
            let rs1 = f.add_replica_set(new_replica_set(&d, "rs1", 1, tenant));
            let rs2 = f.add_replica_set(new_replica_set(&d, "rs2", 1, tenant));

            f.add_pod(generate_pod_from_rs(&rs1, "Running", tenant));
            f.add_pod(generate_pod_from_rs(&rs2, "Running", tenant));
            // Matching labels, no controller.
            let mut pod3 = generate_pod_from_rs(&rs1, "Running", tenant);
            pod3.metadata.name = Some("pod3".to_string());
            pod3.metadata.owner_references = None;
            f.add_pod(pod3);
            // Controlled but inactive pods are still listed.
            let mut pod4 = generate_pod_from_rs(&rs1, "Failed", tenant);
            pod4.metadata.name = Some("pod4".to_string());
            f.add_pod(pod4);

            let selector =
                parse_selector(&d.spec.as_ref().unwrap().selector).unwrap();
            let pods = ownership::pod_map(&f.context(), &d, &selector, &[rs1.clone(), rs2.clone()]);

            assert_eq!(pods.len(), 2);
            assert_eq!(pods.values().map(Vec::len).sum::<usize>(), 3);
            let mut rs1_pods: Vec<_> = pods[&rs1.uid().unwrap()]
                .iter()
                .map(|p| p.name_any())
                .collect();
            rs1_pods.sort();
            assert_eq!(rs1_pods, vec!["pod4", "rs1-pod"]);
            let rs2_pods: Vec<_> = pods[&rs2.uid().unwrap()]
                .iter()
                .map(|p| p.name_any())
                .collect();
            assert_eq!(rs2_pods, vec!["rs2-pod"]);
        }
    }

    #[tokio::test]
    async fn test_rolling_update_surges_before_scaling_down() {
        let f = Fixture::new();
        let d = f.add_deployment(new_deployment(
            "foo",
            3,
            None,
            Some(IntOrString::Int(1)),
            Some(IntOrString::Int(0)),
            TENANT_DEFAULT,
        ));
        let old = outdated(with_revision(new_replica_set(&d, "foo-old", 3, TENANT_DEFAULT), 1));
        f.add_replica_set(with_available(old, 3));

        sync_deployment(&f.context(), &d.key().unwrap()).await.unwrap();

        assert_eq!(
            f.actions.rendered(),
            vec![
                "create replicasets",
                "update deployments/status",
                "update deployments/status"
            ]
        );
        assert_eq!(util::rs_replicas(&stored_rs(&f, "foo-old")), 3);
        let new = f
            .replica_set_store
            .snapshot()
            .into_iter()
            .find(|rs| rs.name_any() != "foo-old")
            .unwrap();
        assert_eq!(util::rs_replicas(&new), 1);
        assert_eq!(util::revision(&new.metadata), Some(2));
        assert_eq!(util::desired_replicas_annotation(&new), Some(3));
        assert_eq!(util::max_replicas_annotation(&new), Some(4));
    }

    #[tokio::test]
    async fn test_rolling_update_scales_down_available_old_replicas() {
        let f = Fixture::new();
        let mut d = new_deployment(
            "foo",
            3,
            None,
            Some(IntOrString::Int(1)),
            Some(IntOrString::Int(0)),
            TENANT_DEFAULT,
        );
        annotate_revision(&mut d, "2");
        let d = f.add_deployment(d);
        let old = outdated(with_revision(new_replica_set(&d, "foo-old", 3, TENANT_DEFAULT), 1));
        f.add_replica_set(with_available(old, 3));
        let mut new = with_available(
            with_revision(new_replica_set(&d, "foo-new", 1, TENANT_DEFAULT), 2),
            1,
        );
        util::set_replicas_annotations(&mut new, 3, 4);
        f.add_replica_set(new);

        sync_deployment(&f.context(), &d.key().unwrap()).await.unwrap();

        assert_eq!(
            f.actions.rendered(),
            vec!["update replicasets", "update deployments/status"]
        );
        assert_eq!(util::rs_replicas(&stored_rs(&f, "foo-old")), 2);
        assert_eq!(util::rs_replicas(&stored_rs(&f, "foo-new")), 1);
        assert!(
            f.recorder
                .events()
                .iter()
                .any(|e| e.message == "Scaled down replica set foo-old to 2")
        );
    }

    #[tokio::test]
    async fn test_recreate_scales_old_down_first() {
        let f = Fixture::new();
        let d = f.add_deployment(recreate(new_deployment(
            "foo",
            2,
            None,
            None,
            None,
            TENANT_DEFAULT,
        )));
        let old = outdated(with_revision(new_replica_set(&d, "foo-old", 2, TENANT_DEFAULT), 1));
        f.add_replica_set(with_available(old, 2));

        sync_deployment(&f.context(), &d.key().unwrap()).await.unwrap();

        assert_eq!(
            f.actions.rendered(),
            vec!["update replicasets", "update deployments/status"]
        );
        assert_eq!(util::rs_replicas(&stored_rs(&f, "foo-old")), 0);
    }

    #[tokio::test]
    async fn test_recreate_waits_for_old_pods() {
        let f = Fixture::new();
        let d = f.add_deployment(recreate(new_deployment(
            "foo",
            2,
            None,
            None,
            None,
            TENANT_DEFAULT,
        )));
        let old = f.add_replica_set(outdated(with_revision(
            new_replica_set(&d, "foo-old", 0, TENANT_DEFAULT),
            1,
        )));
        f.add_pod(generate_pod_from_rs(&old, "Running", TENANT_DEFAULT));

        sync_deployment(&f.context(), &d.key().unwrap()).await.unwrap();

        assert_eq!(f.actions.rendered(), vec!["update deployments/status"]);
        assert_eq!(f.replica_set_store.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_recreate_creates_new_once_old_pods_are_gone() {
        let f = Fixture::new();
        let d = f.add_deployment(recreate(new_deployment(
            "foo",
            2,
            None,
            None,
            None,
            TENANT_DEFAULT,
        )));
        let old = f.add_replica_set(outdated(with_revision(
            new_replica_set(&d, "foo-old", 0, TENANT_DEFAULT),
            1,
        )));
        f.add_pod(generate_pod_from_rs(&old, "Succeeded", TENANT_DEFAULT));

        sync_deployment(&f.context(), &d.key().unwrap()).await.unwrap();

        assert_eq!(
            f.actions.rendered(),
            vec![
                "create replicasets",
                "update deployments/status",
                "update deployments/status"
            ]
        );
        let new = f
            .replica_set_store
            .snapshot()
            .into_iter()
            .find(|rs| rs.name_any() != "foo-old")
            .unwrap();
        assert_eq!(util::rs_replicas(&new), 2);
    }

    #[tokio::test]
    async fn test_scaling_event_resizes_proportionally() {
        let f = Fixture::new();
        let mut d = new_deployment(
            "foo",
            15,
            None,
            Some(IntOrString::Int(3)),
            Some(IntOrString::Int(0)),
            TENANT_DEFAULT,
        );
        annotate_revision(&mut d, "2");
        let d = f.add_deployment(d);

        let mut old = outdated(with_revision(new_replica_set(&d, "foo-old", 5, TENANT_DEFAULT), 1));
        util::set_replicas_annotations(&mut old, 10, 13);
        f.add_replica_set(old);
        let mut new = with_revision(new_replica_set(&d, "foo-new", 8, TENANT_DEFAULT), 2);
        util::set_replicas_annotations(&mut new, 10, 13);
        f.add_replica_set(new);

        sync_deployment(&f.context(), &d.key().unwrap()).await.unwrap();

        assert_eq!(
            f.actions.rendered(),
            vec![
                "update replicasets",
                "update replicasets",
                "update deployments/status"
            ]
        );
        // 18 allowed replicas split 11/7 along the 8/5 ratio.
        let new = stored_rs(&f, "foo-new");
        let old = stored_rs(&f, "foo-old");
        assert_eq!(util::rs_replicas(&new), 11);
        assert_eq!(util::rs_replicas(&old), 7);
        assert_eq!(util::desired_replicas_annotation(&new), Some(15));
        assert_eq!(util::max_replicas_annotation(&old), Some(18));
    }

    #[tokio::test]
    async fn test_paused_deployment_scales_without_rollout() {
        let f = Fixture::new();
        let mut d = new_deployment("foo", 3, None, None, None, TENANT_DEFAULT);
        d.spec.as_mut().unwrap().paused = Some(true);
        let d = f.add_deployment(d);
        // The template changed, but a paused deployment does not roll out.
        f.add_replica_set(outdated(with_revision(
            new_replica_set(&d, "foo-old", 1, TENANT_DEFAULT),
            1,
        )));

        sync_deployment(&f.context(), &d.key().unwrap()).await.unwrap();

        assert_eq!(
            f.actions.rendered(),
            vec!["update replicasets", "update deployments/status"]
        );
        assert_eq!(f.replica_set_store.snapshot().len(), 1);
        assert_eq!(util::rs_replicas(&stored_rs(&f, "foo-old")), 3);
    }

    #[tokio::test]
    async fn test_complete_rollout_cleans_up_history() {
        let f = Fixture::new();
        let mut d = new_deployment("foo", 1, Some(1), None, None, TENANT_DEFAULT);
        annotate_revision(&mut d, "3");
        d.status = Some(DeploymentStatus {
            replicas: Some(1),
            updated_replicas: Some(1),
            available_replicas: Some(1),
            ..Default::default()
        });
        let d = f.add_deployment(d);

        f.add_replica_set(outdated(with_revision(
            new_replica_set(&d, "foo-a", 0, TENANT_DEFAULT),
            1,
        )));
        let mut b = outdated(with_revision(new_replica_set(&d, "foo-b", 0, TENANT_DEFAULT), 2));
        b.spec
            .as_mut()
            .and_then(|s| s.template.as_mut())
            .and_then(|t| t.spec.as_mut())
            .unwrap()
            .termination_grace_period_seconds = Some(2);
        f.add_replica_set(b);
        let mut new = with_available(
            with_revision(new_replica_set(&d, "foo-c", 1, TENANT_DEFAULT), 3),
            1,
        );
        util::set_replicas_annotations(&mut new, 1, 1);
        f.add_replica_set(new);

        sync_deployment(&f.context(), &d.key().unwrap()).await.unwrap();

        assert_eq!(f.actions.rendered()[0], "delete replicasets");
        let names: Vec<_> = f
            .replica_set_store
            .snapshot()
            .iter()
            .map(|rs| rs.name_any())
            .collect();
        assert_eq!(names, vec!["foo-b", "foo-c"]);
    }

    #[tokio::test]
    async fn test_blocked_rollout_does_not_progress() {
        let f = Fixture::new();
        let mut d = new_deployment("foo", 2, None, None, None, TENANT_DEFAULT);
        annotate_revision(&mut d, "2");
        let d = f.add_deployment(d);
        let old = outdated(with_revision(new_replica_set(&d, "foo-old", 2, TENANT_DEFAULT), 1));
        f.add_replica_set(with_available(old, 2));
        let mut new = with_revision(new_replica_set(&d, "foo-new", 0, TENANT_DEFAULT), 2);
        util::set_replicas_annotations(&mut new, 2, 2);
        f.add_replica_set(new);

        sync_deployment(&f.context(), &d.key().unwrap()).await.unwrap();

        assert_eq!(f.actions.rendered(), vec!["update deployments/status"]);
        assert_eq!(util::rs_replicas(&stored_rs(&f, "foo-old")), 2);
        assert_eq!(util::rs_replicas(&stored_rs(&f, "foo-new")), 0);
    }

    #[tokio::test]
    async fn test_blocked_rollout_creates_empty_replica_set() {
        let f = Fixture::new();
        let d = f.add_deployment(new_deployment("foo", 1, None, None, None, TENANT_DEFAULT));
        let old = outdated(with_revision(new_replica_set(&d, "foo-old", 1, TENANT_DEFAULT), 1));
        f.add_replica_set(with_available(old, 1));

        sync_deployment(&f.context(), &d.key().unwrap()).await.unwrap();

        let rendered = f.actions.rendered();
        assert!(rendered.contains(&"create replicasets".to_string()));
        assert!(!rendered.contains(&"update replicasets".to_string()));
        assert_eq!(util::rs_replicas(&stored_rs(&f, "foo-old")), 1);
        let new = f
            .replica_set_store
            .snapshot()
            .into_iter()
            .find(|rs| rs.name_any() != "foo-old")
            .unwrap();
        assert_eq!(util::rs_replicas(&new), 0);
        assert!(f.recorder.events().is_empty());
    }

    #[tokio::test]
    async fn test_stale_old_status_never_scales_up() {
        let f = Fixture::new();
        let mut d = new_deployment(
            "foo",
            4,
            None,
            Some(IntOrString::Int(2)),
            Some(IntOrString::Int(1)),
            TENANT_DEFAULT,
        );
        annotate_revision(&mut d, "2");
        let d = f.add_deployment(d);
        // Status still reports the replicas the old replica set had before its last scale-down.
        let old = outdated(with_revision(new_replica_set(&d, "foo-old", 2, TENANT_DEFAULT), 1));
        f.add_replica_set(with_available(old, 4));
        let mut new = with_available(
            with_revision(new_replica_set(&d, "foo-new", 4, TENANT_DEFAULT), 2),
            4,
        );
        util::set_replicas_annotations(&mut new, 4, 6);
        f.add_replica_set(new);

        sync_deployment(&f.context(), &d.key().unwrap()).await.unwrap();

        let messages: Vec<_> = f.recorder.events().into_iter().map(|e| e.message).collect();
        assert!(!messages.iter().any(|m| m.starts_with("Scaled up")));
        assert_eq!(messages, vec!["Scaled down replica set foo-old to 0"]);
        assert_eq!(util::rs_replicas(&stored_rs(&f, "foo-old")), 0);
        assert_eq!(util::rs_replicas(&stored_rs(&f, "foo-new")), 4);
        assert_eq!(
            f.actions.rendered(),
            vec!["update replicasets", "update deployments/status"]
        );
    }

    #[tokio::test]
    async fn test_overlapping_deployments_adopt_orphan_once() {
        for tenant in [TENANT_DEFAULT, TENANT_OTHER] {
            let f = Fixture::new();
            let d1 = f.add_deployment(new_deployment("foo", 1, None, None, None, tenant));
            let d2 = f.add_deployment(new_deployment("bar", 1, None, None, None, tenant));
            f.add_replica_set(orphan(new_replica_set(&d1, "rs", 1, tenant)));
            let ctx = f.context();

            let mut claims = Vec::new();
            for d in [&d1, &d2] {
                let selector =
                    parse_selector(&d.spec.as_ref().unwrap().selector).unwrap();
                let claimed = ownership::claim_replica_sets(&ctx, d, &selector)
                    .await
                    .unwrap();
                claims.push(claimed.len());
            }

            assert_eq!(claims, vec![1, 0]);
            let adopted = f.replica_set_store.get_now(&key_of("rs", tenant)).unwrap();
            let owners: Vec<_> = adopted
                .owner_references()
                .iter()
                .filter(|r| r.controller == Some(true))
                .map(|r| r.uid.clone())
                .collect();
            assert_eq!(owners, vec![d1.uid().unwrap()]);
        }
    }
}
