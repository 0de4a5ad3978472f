use dockscale_common::{ContainerEngine, EngineError, Instance};
use serde::Serialize;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument};

pub use dockscale_common as common;

mod locks;
pub mod lifecycle;
pub mod membership;
pub mod reconciler;
pub mod registry;
pub mod reporter;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use lifecycle::{Lifecycle, TeardownOutcome};
pub use membership::{Member, MembershipResolver};
pub use reconciler::{ReconcileOutcome, Reconciler};
pub use registry::{RegistryError, ServiceRegistry};
pub use reporter::{InstanceInfo, Reporter, ResourceEntry, Target};

/// Work already applied to the engine when an operation was cut short.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub started: usize,
    pub stopped: usize,
    pub removed: usize,
}

impl Display for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "started: {}, stopped: {}, removed: {}",
            self.started, self.stopped, self.removed
        )
    }
}

// --- Custom Error Type ---
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Service not found in registry: {0}")]
    ServiceNotFound(String),
    #[error("Instance not found: {0}")]
    InstanceNotFound(String),
    #[error("Image not found: {0}")]
    ImageNotFound(String),
    #[error("Container start failed for {image}: {message}")]
    ContainerStartError { image: String, message: String },
    #[error("Invalid replica count {requested}: {reason}")]
    InvalidReplicaCount { requested: i64, reason: String },
    #[error("Engine unavailable: {0}")]
    EngineUnavailable(String),
    #[error("Stopped after partial progress ({progress}): {source}")]
    PartialReconciliation {
        progress: Progress,
        #[source]
        source: Box<ControlError>,
    },
}

impl ControlError {
    /// Stable machine-readable name of the taxonomy member.
    pub fn code(&self) -> &'static str {
        match self {
            ControlError::ServiceNotFound(_) => "SERVICE_NOT_FOUND",
            ControlError::InstanceNotFound(_) => "INSTANCE_NOT_FOUND",
            ControlError::ImageNotFound(_) => "IMAGE_NOT_FOUND",
            ControlError::ContainerStartError { .. } => "CONTAINER_START_ERROR",
            ControlError::InvalidReplicaCount { .. } => "INVALID_REPLICA_COUNT",
            ControlError::EngineUnavailable(_) => "ENGINE_UNAVAILABLE",
            ControlError::PartialReconciliation { .. } => "PARTIAL_RECONCILIATION",
        }
    }

    pub fn progress(&self) -> Option<Progress> {
        match self {
            ControlError::PartialReconciliation { progress, .. } => Some(*progress),
            _ => None,
        }
    }

    pub(crate) fn partial(progress: Progress, source: ControlError) -> Self {
        ControlError::PartialReconciliation {
            progress,
            source: Box::new(source),
        }
    }
}

impl From<EngineError> for ControlError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::ImageNotFound(image) => ControlError::ImageNotFound(image),
            EngineError::InstanceNotFound(id) => ControlError::InstanceNotFound(id),
            EngineError::StartFailed { image, message } => {
                ControlError::ContainerStartError { image, message }
            }
            EngineError::Unavailable(message) => ControlError::EngineUnavailable(message),
        }
    }
}

pub type Result<T> = std::result::Result<T, ControlError>;

/// How an instance is attributed to a registry service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipRule {
    /// Image reference equality only. Services sharing an image share instances.
    #[default]
    Image,
    /// Image equality and a matching `dockscale.service` label.
    Label,
}

impl FromStr for MembershipRule {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "image" => Ok(MembershipRule::Image),
            "label" => Ok(MembershipRule::Label),
            other => Err(format!("unknown membership rule '{other}' (expected image or label)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub membership: MembershipRule,
    /// Upper bound accepted by `reconcile`.
    pub max_replicas: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            membership: MembershipRule::Image,
            max_replicas: 64,
        }
    }
}

// --- Controller Implementation ---

/// Entry point for the HTTP layer: every core operation, no transport concerns.
#[derive(Clone)]
pub struct Controller {
    engine: Arc<dyn ContainerEngine>,
    registry: Arc<ServiceRegistry>,
    resolver: MembershipResolver,
    lifecycle: Lifecycle,
    reconciler: Reconciler,
    reporter: Reporter,
}

impl Controller {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        registry: ServiceRegistry,
        config: ControllerConfig,
    ) -> Self {
        let registry = Arc::new(registry);
        let locks = locks::ServiceLocks::default();
        let resolver = MembershipResolver::new(engine.clone(), registry.clone(), config.membership);
        let lifecycle = Lifecycle::new(engine.clone(), resolver.clone(), locks.clone());
        let reconciler = Reconciler::new(resolver.clone(), lifecycle.clone(), locks, config.max_replicas);
        let reporter = Reporter::new(engine.clone(), resolver.clone());

        info!(
            services = registry.len(),
            membership = ?config.membership,
            max_replicas = config.max_replicas,
            "Controller initialized"
        );

        Self {
            engine,
            registry,
            resolver,
            lifecycle,
            reconciler,
            reporter,
        }
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn resolver(&self) -> &MembershipResolver {
        &self.resolver
    }

    pub async fn reconcile(&self, service: &str, desired: i64) -> Result<ReconcileOutcome> {
        self.reconciler.reconcile(service, desired).await
    }

    pub async fn start_one(&self, service: &str) -> Result<Instance> {
        self.lifecycle.start_one(service).await
    }

    pub async fn stop_all_for_service(&self, service: &str) -> Result<usize> {
        self.lifecycle.stop_all_for_service(service).await
    }

    pub async fn remove_all_for_service(&self, service: &str) -> Result<usize> {
        self.lifecycle.remove_all_for_service(service).await
    }

    pub async fn teardown_service(&self, service: &str) -> Result<TeardownOutcome> {
        self.lifecycle.teardown_service(service).await
    }

    pub async fn stop_instance(&self, instance_id: &str) -> Result<Member> {
        self.lifecycle.stop_instance(instance_id).await
    }

    pub async fn remove_instance(&self, instance_id: &str) -> Result<Member> {
        self.lifecycle.remove_instance(instance_id).await
    }

    pub async fn info(&self, target: &Target) -> Result<std::collections::BTreeMap<String, InstanceInfo>> {
        self.reporter.info(target).await
    }

    pub async fn resource(&self, target: &Target) -> Result<std::collections::BTreeMap<String, ResourceEntry>> {
        self.reporter.resource(target).await
    }

    /// Checks that the engine answers.
    #[instrument(skip(self))]
    pub async fn health(&self) -> Result<()> {
        self.engine.ping().await.map_err(ControlError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_translation() {
        let err: ControlError = EngineError::ImageNotFound("x:1".to_string()).into();
        assert!(matches!(err, ControlError::ImageNotFound(ref image) if image == "x:1"));

        let err: ControlError = EngineError::StartFailed {
            image: "x:1".to_string(),
            message: "conflict".to_string(),
        }
        .into();
        assert_eq!(err.code(), "CONTAINER_START_ERROR");

        let err: ControlError = EngineError::Unavailable("socket closed".to_string()).into();
        assert_eq!(err.code(), "ENGINE_UNAVAILABLE");
    }

    #[test]
    fn test_partial_carries_progress_and_source() {
        let progress = Progress {
            started: 2,
            stopped: 0,
            removed: 0,
        };
        let err = ControlError::partial(progress, ControlError::ImageNotFound("x:1".to_string()));
        assert_eq!(err.progress(), Some(progress));
        assert_eq!(err.code(), "PARTIAL_RECONCILIATION");
        let source = std::error::Error::source(&err).unwrap().to_string();
        assert!(source.contains("x:1"));
    }

    #[test]
    fn test_membership_rule_from_str() {
        assert_eq!("image".parse::<MembershipRule>().unwrap(), MembershipRule::Image);
        assert_eq!(" Label ".parse::<MembershipRule>().unwrap(), MembershipRule::Label);
        assert!("tags".parse::<MembershipRule>().is_err());
    }
}
