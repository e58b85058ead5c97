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

//! The `Progressing` condition and the progress deadline.

use super::sync::ReplicaSetsView;
use super::util::{self, CONDITION_FALSE, CONDITION_TRUE, CONDITION_UNKNOWN, ConditionType, Reason};
use super::Error;
use crate::context::Context;
use crate::types::tenanted::Tenanted;
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentCondition, DeploymentStatus};
use kube::ResourceExt;
use std::time::Duration;

fn progress_message(view: &ReplicaSetsView, deployment: &Deployment, what: &str) -> String {
    match view.new.as_ref() {
        Some(rs) => format!("ReplicaSet \"{}\" {what}.", rs.name_any()),
        None => format!("Deployment \"{}\" {what}.", deployment.name_any()),
    }
}

/// Moves the `Progressing` condition of `status` forward and mirrors replica failures of the
/// replica sets onto the deployment.
pub fn update_progress(
    deployment: &Deployment,
    view: &ReplicaSetsView,
    status: &mut DeploymentStatus,
    now: DateTime<Utc>,
) {
    if util::progress_deadline(deployment).is_none() {
        util::remove_condition(status, ConditionType::Progressing);
    }

    let current = util::get_condition(status, ConditionType::Progressing).cloned();
    let complete = status.replicas == status.updated_replicas
        && util::condition_has_reason(
            status,
            ConditionType::Progressing,
            Reason::NewReplicaSetAvailable,
        );

    if util::progress_deadline(deployment).is_some() && !complete {
        if util::deployment_complete(deployment, status) {
            util::set_condition(
                status,
                util::new_condition(
                    ConditionType::Progressing,
                    CONDITION_TRUE,
                    Reason::NewReplicaSetAvailable,
                    progress_message(view, deployment, "has successfully progressed"),
                ),
            );
        } else if util::deployment_progressing(deployment, status) {
            let mut condition = util::new_condition(
                ConditionType::Progressing,
                CONDITION_TRUE,
                Reason::ReplicaSetUpdated,
                progress_message(view, deployment, "is progressing"),
            );
            // Progress refreshes the update time even when the reason stays the same.
            if let Some(current) = current {
                if current.status == CONDITION_TRUE {
                    condition.last_transition_time = current.last_transition_time;
                }
                util::remove_condition(status, ConditionType::Progressing);
            }
            util::set_condition(status, condition);
        } else if util::deployment_timed_out(deployment, status, now) {
            util::set_condition(
                status,
                util::new_condition(
                    ConditionType::Progressing,
                    CONDITION_FALSE,
                    Reason::ProgressDeadlineExceeded,
                    progress_message(view, deployment, "has timed out progressing"),
                ),
            );
        }
    }

    let failures: Vec<DeploymentCondition> = view
        .all()
        .iter()
        .filter_map(|rs| rs.status.as_ref())
        .flat_map(|s| s.conditions.iter().flatten())
        .filter(|c| c.type_ == ConditionType::ReplicaFailure.to_string())
        .map(|c| DeploymentCondition {
            type_: c.type_.clone(),
            status: c.status.clone(),
            reason: c.reason.clone(),
            message: c.message.clone(),
            last_update_time: c.last_transition_time.clone(),
            last_transition_time: c.last_transition_time.clone(),
        })
        .collect();
    match failures.into_iter().next() {
        Some(failure) => util::set_condition(status, failure),
        None => util::remove_condition(status, ConditionType::ReplicaFailure),
    }
}

/// How long until an unchanged, still rolling deployment should be checked for a timeout.
pub fn requeue_stuck_deployment(
    deployment: &Deployment,
    status: &DeploymentStatus,
    now: DateTime<Utc>,
) -> Option<Duration> {
    let deadline = util::progress_deadline(deployment)?;
    let current = util::get_condition(&util::status(deployment), ConditionType::Progressing)?.clone();

    if util::deployment_complete(deployment, status)
        || current.reason.as_deref() == Some(Reason::ProgressDeadlineExceeded.to_string().as_str())
    {
        return None;
    }

    let last_update = current
        .last_update_time
        .as_ref()
        .and_then(crate::utils::time::to_chrono)?;
    let after = last_update + chrono::Duration::seconds(i64::from(deadline)) - now;
    if after < chrono::Duration::seconds(1) {
        return Some(Duration::from_secs(1));
    }
    (after + chrono::Duration::seconds(1)).to_std().ok()
}

/// Records pausing and resuming on the `Progressing` condition, unless the rollout already timed
/// out.
pub async fn check_paused_conditions(
    ctx: &Context,
    deployment: &mut Tenanted<Deployment>,
) -> Result<(), Error> {
    if util::progress_deadline(deployment).is_none() {
        return Ok(());
    }
    let mut status = util::status(deployment);
    if util::condition_has_reason(
        &status,
        ConditionType::Progressing,
        Reason::ProgressDeadlineExceeded,
    ) {
        return Ok(());
    }
    let paused_recorded =
        util::condition_has_reason(&status, ConditionType::Progressing, Reason::DeploymentPaused);

    let condition = match (util::paused(deployment), paused_recorded) {
        (true, false) => util::new_condition(
            ConditionType::Progressing,
            CONDITION_UNKNOWN,
            Reason::DeploymentPaused,
            "Deployment is paused",
        ),
        (false, true) => util::new_condition(
            ConditionType::Progressing,
            CONDITION_UNKNOWN,
            Reason::DeploymentResumed,
            "Deployment is resumed",
        ),
        _ => return Ok(()),
    };
    util::set_condition(&mut status, condition);
    *deployment = ctx.update_status(deployment, status).await?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::tests::{TENANT_DEFAULT, new_deployment, with_progress_deadline};
    use crate::utils::time::time_from;

    fn view() -> ReplicaSetsView {
        ReplicaSetsView {
            new: None,
            old: Vec::new(),
        }
    }

    fn progressing(reason: Reason, updated_at: DateTime<Utc>) -> DeploymentStatus {
        let mut condition =
            util::new_condition(ConditionType::Progressing, CONDITION_TRUE, reason, "");
        condition.last_update_time = time_from(updated_at);
        DeploymentStatus {
            replicas: Some(1),
            updated_replicas: Some(0),
            conditions: Some(vec![condition]),
            ..Default::default()
        }
    }

    #[test]
    fn test_no_deadline_drops_progressing() {
        let d = new_deployment("web", 1, None, None, None, TENANT_DEFAULT);
        let mut status = progressing(Reason::ReplicaSetUpdated, Utc::now());

        update_progress(&d, &view(), &mut status, Utc::now());
        assert!(util::get_condition(&status, ConditionType::Progressing).is_none());
    }

    #[test]
    fn test_stalled_rollout_times_out() {
        let now = Utc::now();
        let mut d = with_progress_deadline(
            new_deployment("web", 1, None, None, None, TENANT_DEFAULT),
            60,
        );
        d.status = Some(progressing(
            Reason::ReplicaSetUpdated,
            now - chrono::Duration::seconds(120),
        ));
        let mut status = d.status.clone().unwrap();

        update_progress(&d, &view(), &mut status, now);
        assert!(util::condition_has_reason(
            &status,
            ConditionType::Progressing,
            Reason::ProgressDeadlineExceeded
        ));
        assert_eq!(requeue_stuck_deployment(&d, &status, now), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_requeue_before_deadline() {
        let now = Utc::now();
        let mut d = with_progress_deadline(
            new_deployment("web", 1, None, None, None, TENANT_DEFAULT),
            60,
        );
        d.status = Some(progressing(
            Reason::ReplicaSetUpdated,
            now - chrono::Duration::seconds(20),
        ));
        let status = d.status.clone().unwrap();

        let after = requeue_stuck_deployment(&d, &status, now).unwrap();
        assert!(after > Duration::from_secs(38) && after <= Duration::from_secs(41));
    }
}
