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


use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

/// Records Normal/Warning events against an object. Recording is best effort: failures are
/// logged and never fail a sync.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn record(
        &self,
        tenant: &str,
        reference: &ObjectReference,
        event_type: EventType,
        reason: &str,
        message: &str,
    );
}

/// Publishes events to the API server through kube's [`Recorder`].
pub struct KubeRecorder {
    recorder: Recorder,
}

impl KubeRecorder {
    pub fn new(client: kube::Client, controller: &str) -> Self {
        let reporter = Reporter {
            controller: controller.into(),
            instance: std::env::var("HOSTNAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventRecorder for KubeRecorder {
    async fn record(
        &self,
        tenant: &str,
        reference: &ObjectReference,
        event_type: EventType,
        reason: &str,
        message: &str,
    ) {
        let event = Event {
            type_: event_type,
            reason: reason.to_owned(),
            note: Some(message.into()),
            action: "Reconcile".into(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, reference).await {
            warn!(
                tenant,
                object = ?reference.name,
                reason,
                error = %e,
                "failed to record event"
            );
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedEvent {
    pub tenant: String,
    pub kind: Option<String>,
    pub name: Option<String>,
    pub warning: bool,
    pub reason: String,
    pub message: String,
}

/// Keeps events in memory; used by tests and the in-memory server mode.
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    events: Mutex<Vec<RecordedEvent>>,
}

impl MemoryRecorder {
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }
}

#[async_trait]
impl EventRecorder for MemoryRecorder {
    async fn record(
        &self,
        tenant: &str,
        reference: &ObjectReference,
        event_type: EventType,
        reason: &str,
        message: &str,
    ) {
        debug!(tenant, object = ?reference.name, reason, message, "event");
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedEvent {
                tenant: tenant.to_string(),
                kind: reference.kind.clone(),
                name: reference.name.clone(),
                warning: matches!(event_type, EventType::Warning),
                reason: reason.to_string(),
                message: message.to_string(),
            });
    }
}
