// Copyright 2024 RustFS Team
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


use crate::reconcile::Error;
use crate::types::key::ObjectKey;
use tracing::{debug, error, warn};

/// Failed syncs of one key before it is dropped from the queue.
pub const MAX_RETRIES: u32 = 15;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorAction {
    /// Retry after the key's backoff.
    Requeue,
    /// Retry after the key's backoff and tell the deployment's owner why it failed.
    RequeueWithEvent,
    /// Give up until the next watch event or resync.
    Drop,
}

pub fn error_policy(key: &ObjectKey, error: &Error, retries: u32) -> ErrorAction {
    if error.is_not_found() {
        debug!(deployment = %key, error = %error, "object vanished while syncing deployment");
        return ErrorAction::Drop;
    }
    if !error.is_retryable() {
        error!(deployment = %key, error = %error, "dropping deployment out of the queue");
        return ErrorAction::Drop;
    }
    if retries >= MAX_RETRIES {
        error!(
            deployment = %key,
            error = %error,
            retries,
            "dropping deployment out of the queue after too many retries"
        );
        return ErrorAction::Drop;
    }

    if error.is_conflict() {
        debug!(deployment = %key, error = %error, "conflict while syncing deployment, retrying");
        return ErrorAction::Requeue;
    }
    if error.is_rejected() {
        warn!(deployment = %key, error = %error, "request rejected while syncing deployment");
        return ErrorAction::RequeueWithEvent;
    }
    if error.is_malformed() {
        warn!(deployment = %key, error = %error, "invalid deployment spec");
        return ErrorAction::RequeueWithEvent;
    }

    warn!(deployment = %key, error = %error, retries, "error syncing deployment");
    ErrorAction::Requeue
}
