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

//! Work queue, workers and partition handling around [`reconcile::sync_deployment`].

mod handlers;

use crate::context::Context;
use crate::error_policy::{ErrorAction, error_policy};
use crate::partition::PartitionMembership;
use crate::queue::{Backoff, WorkQueue};
use crate::reconcile::util::Reason;
use crate::reconcile::{self, Action, Error};
use crate::types::key::ObjectKey;
use futures::future::join_all;
use kube::runtime::events::EventType;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const CACHE_SYNC_POLL: Duration = Duration::from_millis(100);

pub struct DeploymentController {
    ctx: Arc<Context>,
    queue: WorkQueue<ObjectKey>,
    membership: Arc<dyn PartitionMembership>,
    workers: usize,
}

impl DeploymentController {
    pub fn new(
        ctx: Arc<Context>,
        membership: Arc<dyn PartitionMembership>,
        backoff: Backoff,
        workers: usize,
    ) -> Arc<Self> {
        let controller = Arc::new(Self {
            ctx,
            queue: WorkQueue::new(backoff),
            membership,
            workers: workers.max(1),
        });
        controller.register_handlers();
        controller
    }

    pub fn queue(&self) -> &WorkQueue<ObjectKey> {
        &self.queue
    }

    /// Queues a deployment key, unless another replica owns it.
    pub fn enqueue(&self, key: ObjectKey) {
        if !self.membership.current().owns(&key) {
            trace!(deployment = %key, "key belongs to another partition");
            return;
        }
        self.queue.add(key);
    }

    pub async fn sync_deployment(&self, key: &ObjectKey) -> Result<Action, Error> {
        let started = Instant::now();
        debug!(deployment = %key, "started syncing deployment");
        let result = reconcile::sync_deployment(&self.ctx, key).await;
        debug!(
            deployment = %key,
            elapsed = ?started.elapsed(),
            "finished syncing deployment"
        );
        result
    }

    /// Takes one key off the queue and syncs it. Returns false once the queue shut down.
    pub async fn process_next(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        if self.membership.current().owns(&key) {
            self.membership.record_processed();
            match self.sync_deployment(&key).await {
                Ok(action) => {
                    self.queue.forget(&key);
                    if let Some(after) = action.requeue_after() {
                        self.queue.add_after(key.clone(), after);
                    }
                }
                Err(e) => self.handle_error(&key, &e).await,
            }
        } else {
            self.queue.forget(&key);
        }

        self.queue.done(&key);
        true
    }

    async fn handle_error(&self, key: &ObjectKey, error: &Error) {
        match error_policy(key, error, self.queue.num_requeues(key)) {
            ErrorAction::Requeue => self.queue.add_rate_limited(key.clone()),
            ErrorAction::RequeueWithEvent => {
                if let Some(deployment) = self.ctx.deployment_cache.get(key) {
                    self.ctx
                        .record(
                            &deployment,
                            EventType::Warning,
                            Reason::SyncFailed,
                            &error.to_string(),
                        )
                        .await;
                }
                self.queue.add_rate_limited(key.clone());
            }
            ErrorAction::Drop => self.queue.forget(key),
        }
    }

    fn caches_synced(&self) -> bool {
        self.ctx.deployment_cache.has_synced()
            && self.ctx.replica_set_cache.has_synced()
            && self.ctx.pod_cache.has_synced()
    }

    /// Runs the workers until `cancel` fires; each worker finishes its current key first.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(workers = self.workers, "starting deployment controller");

        while !self.caches_synced() {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(CACHE_SYNC_POLL) => {}
            }
        }
        info!("caches synced");
        self.resync_partition().await;

        let partitions = tokio::spawn(self.clone().watch_partitions(cancel.clone()));
        let queue = self.queue.clone();
        let shutdown = cancel.clone();
        tokio::spawn(async move {
            shutdown.cancelled().await;
            queue.shut_down();
        });

        let workers = (0..self.workers).map(|_| {
            let controller = self.clone();
            tokio::spawn(async move { while controller.process_next().await {} })
        });
        for result in join_all(workers).await {
            if let Err(e) = result {
                warn!(error = %e, "worker task failed");
            }
        }

        partitions.abort();
        info!("shutting down deployment controller");
    }

    async fn watch_partitions(self: Arc<Self>, cancel: CancellationToken) {
        let mut changes = self.membership.subscribe();
        let mut current = changes.borrow_and_update().clone();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = changes.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let next = changes.borrow_and_update().clone();
                    if next.same_range(&current) {
                        continue;
                    }
                    current = next;
                    self.resync_partition().await;
                }
            }
        }
    }

    /// Drops every queued key and re-queues the deployments owned under the current assignment.
    pub async fn resync_partition(&self) {
        let assignment = self.membership.current();
        info!(
            index = assignment.index,
            members = assignment.members,
            revision = assignment.revision,
            "partition assignment changed, resyncing"
        );

        self.queue.drain().await;
        let mut owned = 0;
        for deployment in self.ctx.deployment_cache.list_all() {
            if let Ok(key) = deployment.key()
                && assignment.owns(&key)
            {
                self.queue.add(key);
                owned += 1;
            }
        }
        self.queue.resume();
        info!(owned, "re-queued deployments for partition");
    }
}
