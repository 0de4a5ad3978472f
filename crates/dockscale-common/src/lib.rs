// Re-export dependencies used in public interfaces of common types

use std::collections::BTreeMap;
use std::fmt::Display;

use async_trait::async_trait;
pub use chrono;
use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Label written on every container started for a service.
pub const SERVICE_LABEL: &str = "dockscale.service";
/// Label marking a container as started by this control plane.
pub const MANAGED_LABEL: &str = "dockscale.managed";
/// Length of the short-form instance id (same as `docker ps`).
pub const SHORT_ID_LEN: usize = 12;

/// Errors surfaced by a [`ContainerEngine`] implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Image not found: {0}")]
    ImageNotFound(String),

    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Container start failed for {image}: {message}")]
    StartFailed { image: String, message: String },

    #[error("Engine unavailable: {0}")]
    Unavailable(String),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// A named service from the registry manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub name: String,
    pub image_reference: String,
}

impl ServiceDefinition {
    pub fn new(name: impl Into<String>, image_reference: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image_reference: image_reference.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown,
}

impl InstanceStatus {
    /// Maps the engine's state string (`State` in the Docker API).
    pub fn from_engine_state(state: &str) -> Self {
        match state.to_ascii_lowercase().as_str() {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "removing" => Self::Removing,
            "exited" => Self::Exited,
            "dead" => Self::Dead,
            _ => Self::Unknown,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Restarting => "restarting",
            Self::Removing => "removing",
            Self::Exited => "exited",
            Self::Dead => "dead",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A live handle to a container as reported by the engine at query time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Short-form id, unique within the engine.
    pub id: String,
    /// Full engine id; `id` is its first [`SHORT_ID_LEN`] characters.
    pub full_id: String,
    pub image_reference: String,
    pub status: InstanceStatus,
    pub created_at: DateTime<Utc>,
    pub display_name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl Instance {
    /// True when `candidate` is a non-empty prefix of the full id.
    pub fn matches_id(&self, candidate: &str) -> bool {
        !candidate.is_empty() && self.full_id.starts_with(candidate)
    }

    pub fn service_label(&self) -> Option<&str> {
        self.labels.get(SERVICE_LABEL).map(String::as_str)
    }
}

impl Display for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Instance(id: {}, image: {}, status: {}, name: {})",
            self.id, self.image_reference, self.status, self.display_name
        )
    }
}

/// Truncates an engine id to its short form.
pub fn short_id(id: &str) -> String {
    id.chars().take(SHORT_ID_LEN).collect()
}

/// Point-in-time resource usage of one instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub read_at: Option<DateTime<Utc>>,
    pub cpu_percent: f64,
    pub online_cpus: u64,
    pub memory_usage_bytes: u64,
    pub memory_limit_bytes: u64,
    pub memory_percent: f64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    pub block_read_bytes: u64,
    pub block_write_bytes: u64,
    pub pids: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    /// Include instances that are not running (exited, created, ...).
    pub include_stopped: bool,
    /// Only instances carrying this `(key, value)` label.
    pub label: Option<(String, String)>,
}

impl ListFilter {
    pub fn running() -> Self {
        Self::default()
    }

    pub fn any_state() -> Self {
        Self {
            include_stopped: true,
            label: None,
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.label = Some((key.into(), value.into()));
        self
    }

    /// Applies the filter to an already-fetched instance.
    pub fn admits(&self, instance: &Instance) -> bool {
        if !self.include_stopped && !instance.status.is_running() {
            return false;
        }
        match &self.label {
            Some((key, value)) => instance.labels.get(key) == Some(value),
            None => true,
        }
    }
}

/// Request to create and start one detached instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    pub service: String,
    pub image_reference: String,
}

impl From<&ServiceDefinition> for RunRequest {
    fn from(def: &ServiceDefinition) -> Self {
        Self {
            service: def.name.clone(),
            image_reference: def.image_reference.clone(),
        }
    }
}

/// Capability-bounded view of the container engine.
///
/// Every call reads engine state at call time; implementations hold no cache.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn list(&self, filter: &ListFilter) -> EngineResult<Vec<Instance>>;
    async fn run(&self, request: &RunRequest) -> EngineResult<Instance>;
    async fn stop(&self, instance_id: &str) -> EngineResult<()>;
    async fn remove(&self, instance_id: &str, force: bool) -> EngineResult<()>;
    async fn stats(&self, instance_id: &str) -> EngineResult<UsageSnapshot>;
    async fn ping(&self) -> EngineResult<()>;
}
