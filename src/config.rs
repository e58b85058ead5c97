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

//! Server settings from the command line, the environment and an optional YAML file.
//!
//! Command-line and environment values win over the file; the file wins over built-in defaults.

use crate::queue::Backoff;
use clap::Args;
use serde::Deserialize;
use snafu::{ResultExt, Snafu, ensure};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_WORKERS: usize = 5;
const DEFAULT_TENANT: &str = "system";
const DEFAULT_INSTANCE_NAMESPACE: &str = "kube-system";
const DEFAULT_HEARTBEAT_SECS: u64 = 10;
const DEFAULT_STALENESS_SECS: u64 = 30;
const DEFAULT_RESYNC_SECS: u64 = 300;
const DEFAULT_BACKOFF_BASE_MS: u64 = 5;
const DEFAULT_BACKOFF_MAX_SECS: u64 = 1000;
const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("failed to read config file {}: {}", path.display(), source))]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to parse config file {}: {}", path.display(), source))]
    ParseFile {
        path: PathBuf,
        source: serde_yaml_ng::Error,
    },

    #[snafu(display("invalid store partition '{}': expected tenant[=context]", value))]
    InvalidPartition { value: String },

    #[snafu(display("invalid setting {}: {}", field, message))]
    InvalidSetting { field: String, message: String },
}

/// One store partition: the API server that serves a tenant.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct StorePartition {
    pub tenant: String,
    /// Kubeconfig context of the API server; the default context when unset.
    #[serde(default)]
    pub context: Option<String>,
}

impl std::str::FromStr for StorePartition {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (tenant, context) = match value.split_once('=') {
            Some((tenant, context)) => (tenant.trim(), Some(context.trim())),
            None => (value.trim(), None),
        };
        ensure!(!tenant.is_empty(), InvalidPartitionSnafu { value });
        Ok(Self {
            tenant: tenant.to_string(),
            context: context.filter(|c| !c.is_empty()).map(str::to_string),
        })
    }
}

#[derive(Args, Clone, Debug, Default)]
pub struct ControllerConfig {
    /// YAML file with default settings
    #[arg(long, env = "FDC_CONFIG")]
    pub config: Option<PathBuf>,

    /// Number of concurrent sync workers
    #[arg(long, env = "FDC_WORKERS")]
    pub workers: Option<usize>,

    /// Store partitions as tenant[=kubeconfig-context]; repeat for every API server
    #[arg(long = "partition", env = "FDC_PARTITIONS", value_delimiter = ',')]
    pub partitions: Vec<String>,

    /// Keep watching the reachable partitions when one of them fails
    #[arg(long, env = "FDC_ALLOW_PARTIAL_WATCH")]
    pub allow_partial_watch: bool,

    /// Name of this replica's controller instance record
    #[arg(long, env = "FDC_INSTANCE_NAME")]
    pub instance_name: Option<String>,

    /// Namespace holding the controller instance records
    #[arg(long, env = "FDC_INSTANCE_NAMESPACE")]
    pub instance_namespace: Option<String>,

    /// Seconds between heartbeats of the controller instance record
    #[arg(long, env = "FDC_HEARTBEAT_SECONDS")]
    pub heartbeat_seconds: Option<u64>,

    /// Seconds without heartbeat after which a peer is considered gone
    #[arg(long, env = "FDC_STALENESS_SECONDS")]
    pub staleness_seconds: Option<u64>,

    /// Seconds between full re-lists of the caches
    #[arg(long, env = "FDC_RESYNC_SECONDS")]
    pub resync_seconds: Option<u64>,

    /// First retry delay of a failed key, in milliseconds
    #[arg(long, env = "FDC_BACKOFF_BASE_MS")]
    pub backoff_base_ms: Option<u64>,

    /// Upper bound of the retry delay, in seconds
    #[arg(long, env = "FDC_BACKOFF_MAX_SECONDS")]
    pub backoff_max_seconds: Option<u64>,

    /// Tracing filter, used when RUST_LOG is not set
    #[arg(long, env = "FDC_LOG_FILTER")]
    pub log_filter: Option<String>,

    /// Serve from in-process stores instead of API servers
    #[arg(long, env = "FDC_IN_MEMORY")]
    pub in_memory: bool,
}

/// Same settings as [`ControllerConfig`], as read from the YAML file.
#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
struct FileConfig {
    workers: Option<usize>,
    partitions: Vec<StorePartition>,
    allow_partial_watch: Option<bool>,
    instance_name: Option<String>,
    instance_namespace: Option<String>,
    heartbeat_seconds: Option<u64>,
    staleness_seconds: Option<u64>,
    resync_seconds: Option<u64>,
    backoff_base_ms: Option<u64>,
    backoff_max_seconds: Option<u64>,
    log_filter: Option<String>,
    in_memory: Option<bool>,
}

/// Resolved settings of a server run.
#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    pub workers: usize,
    pub partitions: Vec<StorePartition>,
    pub allow_partial_watch: bool,
    pub instance_name: String,
    pub instance_namespace: String,
    pub heartbeat_interval: Duration,
    pub staleness: Duration,
    pub resync_period: Duration,
    pub backoff: Backoff,
    pub log_filter: String,
    pub in_memory: bool,
}

impl Settings {
    /// Tenant holding the controller instance records.
    pub fn instance_tenant(&self) -> &str {
        self.partitions
            .first()
            .map_or(DEFAULT_TENANT, |p| p.tenant.as_str())
    }
}

impl ControllerConfig {
    pub async fn load(self) -> Result<Settings, Error> {
        let file = match &self.config {
            Some(path) => {
                let raw = tokio::fs::read_to_string(path)
                    .await
                    .context(ReadFileSnafu { path: path.clone() })?;
                parse_file(&raw).context(ParseFileSnafu { path: path.clone() })?
            }
            None => FileConfig::default(),
        };
        self.merge(file)
    }

    fn merge(self, file: FileConfig) -> Result<Settings, Error> {
        let mut partitions = self
            .partitions
            .iter()
            .map(|raw| raw.parse())
            .collect::<Result<Vec<StorePartition>, _>>()?;
        if partitions.is_empty() {
            partitions = file.partitions;
        }
        if partitions.is_empty() {
            partitions.push(StorePartition {
                tenant: DEFAULT_TENANT.to_string(),
                context: None,
            });
        }

        let workers = self.workers.or(file.workers).unwrap_or(DEFAULT_WORKERS);
        ensure!(
            workers > 0,
            InvalidSettingSnafu {
                field: "workers",
                message: "must be at least 1",
            }
        );

        let heartbeat = self
            .heartbeat_seconds
            .or(file.heartbeat_seconds)
            .unwrap_or(DEFAULT_HEARTBEAT_SECS);
        let staleness = self
            .staleness_seconds
            .or(file.staleness_seconds)
            .unwrap_or(DEFAULT_STALENESS_SECS);
        ensure!(
            staleness > heartbeat,
            InvalidSettingSnafu {
                field: "stalenessSeconds",
                message: format!("must exceed the heartbeat interval of {heartbeat}s"),
            }
        );

        let backoff = Backoff {
            base: Duration::from_millis(
                self.backoff_base_ms
                    .or(file.backoff_base_ms)
                    .unwrap_or(DEFAULT_BACKOFF_BASE_MS),
            ),
            max: Duration::from_secs(
                self.backoff_max_seconds
                    .or(file.backoff_max_seconds)
                    .unwrap_or(DEFAULT_BACKOFF_MAX_SECS),
            ),
        };

        Ok(Settings {
            workers,
            partitions,
            allow_partial_watch: self.allow_partial_watch
                || file.allow_partial_watch.unwrap_or(false),
            instance_name: self
                .instance_name
                .or(file.instance_name)
                .or_else(|| std::env::var("HOSTNAME").ok())
                .unwrap_or_else(|| "deployment-controller".to_string()),
            instance_namespace: self
                .instance_namespace
                .or(file.instance_namespace)
                .unwrap_or_else(|| DEFAULT_INSTANCE_NAMESPACE.to_string()),
            heartbeat_interval: Duration::from_secs(heartbeat),
            staleness: Duration::from_secs(staleness),
            resync_period: Duration::from_secs(
                self.resync_seconds
                    .or(file.resync_seconds)
                    .unwrap_or(DEFAULT_RESYNC_SECS),
            ),
            backoff,
            log_filter: self
                .log_filter
                .or(file.log_filter)
                .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string()),
            in_memory: self.in_memory || file.in_memory.unwrap_or(false),
        })
    }
}

fn parse_file(raw: &str) -> Result<FileConfig, serde_yaml_ng::Error> {
    if raw.trim().is_empty() {
        return Ok(FileConfig::default());
    }
    serde_yaml_ng::from_str(raw)
}
