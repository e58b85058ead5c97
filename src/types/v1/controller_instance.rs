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


use crate::utils::time;
use chrono::{DateTime, Utc};
use kube::{CustomResource, KubeSchema};
use serde::{Deserialize, Serialize};

/// One live replica of a controller, used to split the key space between replicas.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, KubeSchema, Default, PartialEq)]
#[kube(
    group = "controllers.fabric.io",
    version = "v1",
    kind = "ControllerInstance",
    namespaced,
    shortname = "ci",
    plural = "controllerinstances",
    singular = "controllerinstance",
    printcolumn = r#"{"name":"Type", "type":"string", "jsonPath":".spec.controllerType"}"#,
    printcolumn = r#"{"name":"Workloads", "type":"integer", "jsonPath":".spec.workloadNum"}"#,
    printcolumn = r#"{"name":"Heartbeat", "type":"string", "jsonPath":".spec.heartbeat"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ControllerInstanceSpec {
    /// Kind of controller this instance runs, e.g. `Deployment`.
    pub controller_type: String,

    /// Inclusive lower bound of the owned key-hash range.
    #[serde(default)]
    pub lower_bound: u64,

    /// Inclusive upper bound of the owned key-hash range.
    #[serde(default)]
    pub upper_bound: u64,

    /// Number of keys this instance processed since its last heartbeat.
    #[serde(default)]
    pub workload_num: i64,

    /// RFC 3339 timestamp of the last heartbeat.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<String>,
}

impl ControllerInstance {
    pub fn heartbeat_at(&self) -> Option<DateTime<Utc>> {
        let raw = self.spec.heartbeat.as_deref()?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|at| at.with_timezone(&Utc))
    }

    pub fn set_heartbeat(&mut self, at: DateTime<Utc>) {
        self.spec.heartbeat = Some(at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true));
    }

    /// An instance counts as alive while its heartbeat is newer than `staleness`. Instances
    /// being deleted or without any heartbeat are not alive.
    pub fn is_alive(&self, now: DateTime<Utc>, staleness: chrono::Duration) -> bool {
        if self.metadata.deletion_timestamp.is_some() {
            return false;
        }
        self.heartbeat_at()
            .is_some_and(|at| now.signed_duration_since(at) <= staleness)
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.metadata
            .creation_timestamp
            .as_ref()
            .and_then(time::to_chrono)
    }
}
