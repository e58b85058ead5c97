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

use crate::cache::{Informer, Reflector};
use crate::config::{Settings, StorePartition};
use crate::context::Context;
use crate::controller::DeploymentController;
use crate::partition::registry::{InstanceRegistry, RegistryConfig};
use crate::recorder::{EventRecorder, KubeRecorder, MemoryRecorder};
use crate::store::kubernetes::KubeStore;
use crate::store::memory::{ActionLog, MemoryStore};
use crate::store::partitioned::PartitionedStore;
use crate::store::{ListParams, ObjectStore};
use crate::types::tenanted::StoreObject;
use crate::types::v1::controller_instance::ControllerInstance;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::Pod;
use kube::config::KubeConfigOptions;
use kube::{Client, CustomResourceExt, Resource};
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

pub mod cache;
pub mod config;
pub mod context;
pub mod controller;
pub mod error_policy;
pub mod partition;
pub mod queue;
pub mod reconcile;
pub mod recorder;
pub mod store;
pub mod types;
pub mod utils;


pub const CONTROLLER_NAME: &str = "deployment-controller";

/// Stores and recorder a server run talks to.
struct Backends {
    deployments: Arc<dyn ObjectStore<Deployment>>,
    replica_sets: Arc<dyn ObjectStore<ReplicaSet>>,
    pods: Arc<dyn ObjectStore<Pod>>,
    instances: Arc<dyn ObjectStore<ControllerInstance>>,
    recorder: Arc<dyn EventRecorder>,
}

impl Backends {
    fn in_memory() -> Self {
        let actions = Arc::new(ActionLog::default());
        Self {
            deployments: Arc::new(MemoryStore::<Deployment>::new(actions.clone())),
            replica_sets: Arc::new(MemoryStore::<ReplicaSet>::new(actions.clone())),
            pods: Arc::new(MemoryStore::<Pod>::new(actions.clone())),
            instances: Arc::new(MemoryStore::<ControllerInstance>::new(actions)),
            recorder: Arc::new(MemoryRecorder::default()),
        }
    }

    async fn connect(partitions: &[StorePartition]) -> Result<Self, Box<dyn std::error::Error>> {
        let mut clients = Vec::with_capacity(partitions.len());
        for partition in partitions {
            let client = partition_client(partition).await?;
            info!(
                tenant = %partition.tenant,
                context = partition.context.as_deref().unwrap_or("<default>"),
                "connected store partition"
            );
            clients.push((partition.tenant.clone(), client));
        }
        let Some((tenant, client)) = clients.first().cloned() else {
            return Err("no store partition configured".into());
        };

        Ok(Self {
            deployments: partitioned::<Deployment>(&clients),
            replica_sets: partitioned::<ReplicaSet>(&clients),
            pods: partitioned::<Pod>(&clients),
            // Instance records live with the first partition only.
            instances: Arc::new(KubeStore::<ControllerInstance>::new(client.clone(), tenant)),
            recorder: Arc::new(KubeRecorder::new(client, CONTROLLER_NAME)),
        })
    }
}

async fn partition_client(partition: &StorePartition) -> Result<Client, Box<dyn std::error::Error>> {
    let config = match &partition.context {
        Some(context) => {
            let options = KubeConfigOptions {
                context: Some(context.clone()),
                ..Default::default()
            };
            kube::Config::from_kubeconfig(&options).await?
        }
        None => kube::Config::infer().await?,
    };
    Ok(Client::try_from(config)?)
}

fn partitioned<K>(clients: &[(String, Client)]) -> Arc<dyn ObjectStore<K>>
where
    K: StoreObject + Resource<Scope = NamespaceResourceScope>,
{
    let stores = clients
        .iter()
        .map(|(tenant, client)| {
            Arc::new(KubeStore::<K>::new(client.clone(), tenant.clone())) as Arc<dyn ObjectStore<K>>
        })
        .collect();
    Arc::new(PartitionedStore::new(stores))
}

fn spawn_informer<K: StoreObject>(
    store: Arc<dyn ObjectStore<K>>,
    reflector: Arc<Reflector<K>>,
    settings: &Settings,
    cancel: &CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let params = ListParams {
        allow_partial_watch: settings.allow_partial_watch,
        ..Default::default()
    };
    let informer = Informer::new(store, reflector, params, settings.resync_period);
    tokio::spawn(informer.run(cancel.clone()))
}

pub async fn run(settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_filter.as_str()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_level(true)
        .with_file(true)
        .with_line_number(true)
        .with_target(true)
        .init();

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("a rustls crypto provider was already installed");
    }

    let backends = if settings.in_memory {
        info!("serving from in-memory stores");
        Backends::in_memory()
    } else {
        Backends::connect(&settings.partitions).await?
    };

    let cancel = CancellationToken::new();

    let registry = Arc::new(InstanceRegistry::new(
        backends.instances.clone(),
        RegistryConfig {
            controller_type: Deployment::kind(&()).to_string(),
            instance_name: settings.instance_name.clone(),
            tenant: settings.instance_tenant().to_string(),
            namespace: settings.instance_namespace.clone(),
            heartbeat_interval: settings.heartbeat_interval,
            staleness: settings.staleness,
        },
    ));
    registry.register().await?;
    registry.refresh().await?;
    let registry_task = tokio::spawn(registry.clone().run(cancel.clone()));

    let deployment_cache = Arc::new(Reflector::<Deployment>::new());
    let replica_set_cache = Arc::new(Reflector::<ReplicaSet>::new());
    let pod_cache = Arc::new(Reflector::<Pod>::new());

    let ctx = Arc::new(Context::new(
        backends.deployments.clone(),
        backends.replica_sets.clone(),
        deployment_cache.clone(),
        replica_set_cache.clone(),
        pod_cache.clone(),
        backends.recorder.clone(),
    ));
    // Handlers are registered before the informers fill the caches.
    let controller = DeploymentController::new(
        ctx,
        registry.clone(),
        settings.backoff,
        settings.workers,
    );

    let informers = [
        spawn_informer(backends.deployments, deployment_cache, &settings, &cancel),
        spawn_informer(backends.replica_sets, replica_set_cache, &settings, &cancel),
        spawn_informer(backends.pods, pod_cache, &settings, &cancel),
    ];

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received interrupt, shutting down"),
            Err(e) => warn!(error = %e, "failed to listen for interrupt, shutting down"),
        }
        shutdown.cancel();
    });

    controller.run(cancel.clone()).await;

    cancel.cancel();
    for informer in informers {
        if let Err(e) = informer.await {
            warn!(error = %e, "informer task failed");
        }
    }
    if let Err(e) = registry_task.await {
        warn!(error = %e, "registry task failed");
    }

    Ok(())
}

/// Writes the ControllerInstance CRD as YAML to `file`, or stdout when unset.
pub async fn crd(file: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let mut writer: Pin<Box<dyn AsyncWrite + Send>> = if let Some(file) = file {
        Box::pin(
            tokio::fs::OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(file)
                .await?,
        )
    } else {
        Box::pin(tokio::io::stdout())
    };

    writer
        .write_all(serde_yaml_ng::to_string(&ControllerInstance::crd())?.as_bytes())
        .await?;
    writer.flush().await?;

    Ok(())
}
