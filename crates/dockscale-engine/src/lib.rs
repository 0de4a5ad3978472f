use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions, StatsOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError; // Alias bollard error
use bollard::image::CreateImageOptions;
use bollard::models::ContainerSummary;
use bollard::Docker;
use chrono::{DateTime, Utc};
use dockscale_common::{
    short_id, ContainerEngine, EngineError, EngineResult, Instance, InstanceStatus, ListFilter,
    RunRequest, UsageSnapshot, MANAGED_LABEL, SERVICE_LABEL,
};
use futures::{StreamExt, TryStreamExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

// Re-export dependencies potentially needed by consumers (like the server)
pub use bollard;
pub use dockscale_common as common;

pub mod test_utils;
pub mod usage;

// --- Custom Error Type ---
#[derive(Error, Debug)]
pub enum DockerError {
    #[error("Container creation failed for {image}: {source}")]
    CreationFailed {
        image: String,
        #[source]
        source: BollardError,
    },
    #[error("Image pull failed for {image}: {source}")]
    PullFailed {
        image: String,
        #[source]
        source: BollardError,
    },
    #[error("Container start failed for {image} ({id}): {source}")]
    StartFailed {
        id: String,
        image: String,
        #[source]
        source: BollardError,
    },
    #[error("Container stop failed for {id}: {source}")]
    StopFailed {
        id: String,
        #[source]
        source: BollardError,
    },
    #[error("Container removal failed for {id}: {source}")]
    RemovalFailed {
        id: String,
        #[source]
        source: BollardError,
    },
    #[error("Container stats retrieval failed for {id}: {source}")]
    StatsFailed {
        id: String,
        #[source]
        source: BollardError,
    },
    #[error("Container {0} not found")]
    NotFound(String),
    #[error("Stats stream for {0} ended without a sample")]
    EmptyStats(String),
    #[error("Docker API error: {0}")]
    DockerApi(#[from] BollardError), // Catch-all for other bollard errors
}

fn status_code(err: &BollardError) -> Option<u16> {
    match err {
        BollardError::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

fn is_client_error(err: &BollardError) -> bool {
    matches!(status_code(err), Some(code) if (400..500).contains(&code))
}

// Registries answer a missing repository in several ways depending on auth.
fn pull_reports_missing(err: &BollardError) -> bool {
    match err {
        BollardError::DockerResponseServerError { status_code: 404, .. } => true,
        BollardError::DockerResponseServerError { message, .. }
        | BollardError::DockerStreamError { error: message } => {
            let message = message.to_ascii_lowercase();
            message.contains("not found")
                || message.contains("does not exist")
                || message.contains("pull access denied")
        }
        _ => false,
    }
}

// Translate into the adapter taxonomy; everything unclassified is an availability problem.
impl From<DockerError> for EngineError {
    fn from(err: DockerError) -> Self {
        match err {
            DockerError::CreationFailed { image, source } => match status_code(&source) {
                Some(404) => EngineError::ImageNotFound(image),
                _ if is_client_error(&source) => EngineError::StartFailed {
                    image,
                    message: source.to_string(),
                },
                _ => EngineError::Unavailable(source.to_string()),
            },
            DockerError::PullFailed { image, source } => {
                if pull_reports_missing(&source) {
                    EngineError::ImageNotFound(image)
                } else {
                    EngineError::Unavailable(source.to_string())
                }
            }
            DockerError::StartFailed { image, source, .. } => {
                if is_client_error(&source) {
                    EngineError::StartFailed {
                        image,
                        message: source.to_string(),
                    }
                } else {
                    EngineError::Unavailable(source.to_string())
                }
            }
            DockerError::StopFailed { id, source }
            | DockerError::RemovalFailed { id, source }
            | DockerError::StatsFailed { id, source } => match status_code(&source) {
                Some(404) => EngineError::InstanceNotFound(id),
                _ => EngineError::Unavailable(source.to_string()),
            },
            DockerError::NotFound(id) => EngineError::InstanceNotFound(id),
            err @ DockerError::EmptyStats(_) => EngineError::Unavailable(err.to_string()),
            DockerError::DockerApi(source) => EngineError::Unavailable(source.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DockerEngineConfig {
    /// Grace period given to `docker stop` before SIGKILL.
    pub stop_timeout: Duration,
    /// Pull the image when a create fails because it is missing locally.
    pub pull_missing_images: bool,
}

impl Default for DockerEngineConfig {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(10),
            pull_missing_images: true,
        }
    }
}

// --- DockerEngine Implementation ---

/// [`ContainerEngine`] over a Docker daemon.
///
/// `list` returns containers in Docker API order, which is most-recently-created
/// first. Callers that need a stable order must sort.
#[derive(Clone)]
pub struct DockerEngine {
    docker: Arc<Docker>,
    config: DockerEngineConfig,
}

impl DockerEngine {
    pub fn new(docker: Arc<Docker>, config: DockerEngineConfig) -> Self {
        Self { docker, config }
    }

    /// Connects using `DOCKER_HOST` or the platform's local socket.
    pub fn connect(config: DockerEngineConfig) -> Result<Self, DockerError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self::new(Arc::new(docker), config))
    }

    pub fn client(&self) -> Arc<Docker> {
        self.docker.clone()
    }

    async fn create(&self, request: &RunRequest) -> Result<String, DockerError> {
        let config = Config {
            image: Some(request.image_reference.clone()),
            labels: Some(run_labels(request)),
            attach_stdin: Some(false),
            attach_stdout: Some(false),
            attach_stderr: Some(false),
            tty: Some(false),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await
            .map_err(|source| DockerError::CreationFailed {
                image: request.image_reference.clone(),
                source,
            })?;

        for warning in &response.warnings {
            warn!(container_id = %response.id, %warning, "Docker reported a warning on create");
        }
        Ok(response.id)
    }

    async fn pull(&self, image: &str) -> Result<(), DockerError> {
        let (repository, tag) = split_image_reference(image);
        info!(%image, %repository, %tag, "Image missing locally, pulling...");
        let options = CreateImageOptions {
            from_image: repository.to_string(),
            tag: tag.to_string(),
            ..Default::default()
        };
        self.docker
            .create_image(Some(options), None, None)
            .try_collect::<Vec<_>>()
            .await
            .map_err(|source| DockerError::PullFailed {
                image: image.to_string(),
                source,
            })?;
        info!(%image, "Image pulled.");
        Ok(())
    }

    async fn inspect(&self, id: &str) -> Result<Instance, DockerError> {
        let options = ListContainersOptions::<String> {
            all: true,
            filters: HashMap::from([("id".to_string(), vec![id.to_string()])]),
            ..Default::default()
        };
        self.docker
            .list_containers(Some(options))
            .await?
            .into_iter()
            .find_map(instance_from_summary)
            .ok_or_else(|| DockerError::NotFound(id.to_string()))
    }
}

fn run_labels(request: &RunRequest) -> HashMap<String, String> {
    HashMap::from([
        (SERVICE_LABEL.to_string(), request.service.clone()),
        (MANAGED_LABEL.to_string(), "true".to_string()),
    ])
}

/// Splits an image reference into repository and tag (or digest). A missing
/// tag means `latest`; an empty tag would make Docker pull every tag.
pub fn split_image_reference(reference: &str) -> (&str, &str) {
    if let Some((repository, digest)) = reference.split_once('@') {
        return (repository, digest);
    }
    // A ':' before the last '/' is a registry port, not a tag.
    let name_start = reference.rfind('/').map_or(0, |i| i + 1);
    match reference[name_start..].rfind(':') {
        Some(i) if name_start + i + 1 < reference.len() => (
            &reference[..name_start + i],
            &reference[name_start + i + 1..],
        ),
        Some(i) => (&reference[..name_start + i], "latest"),
        None => (reference, "latest"),
    }
}

/// Best-effort view of a container that started but could not be listed back.
fn started_instance(full_id: &str, request: &RunRequest) -> Instance {
    Instance {
        id: short_id(full_id),
        full_id: full_id.to_string(),
        image_reference: request.image_reference.clone(),
        status: InstanceStatus::Running,
        created_at: Utc::now(),
        display_name: String::new(),
        labels: run_labels(request).into_iter().collect(),
    }
}

/// Maps a Docker container summary onto the engine-neutral [`Instance`].
pub fn instance_from_summary(summary: ContainerSummary) -> Option<Instance> {
    let id = summary.id?;
    let created_at = summary
        .created
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .unwrap_or_default();
    let display_name = summary
        .names
        .and_then(|names| names.into_iter().next())
        .map(|name| name.trim_start_matches('/').to_string())
        .unwrap_or_default();

    Some(Instance {
        id: short_id(&id),
        full_id: id,
        image_reference: summary.image.unwrap_or_default(),
        status: summary
            .state
            .as_deref()
            .map(InstanceStatus::from_engine_state)
            .unwrap_or(InstanceStatus::Unknown),
        created_at,
        display_name,
        labels: summary
            .labels
            .unwrap_or_default()
            .into_iter()
            .collect::<BTreeMap<_, _>>(),
    })
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    #[instrument(skip(self), fields(include_stopped = filter.include_stopped))]
    async fn list(&self, filter: &ListFilter) -> EngineResult<Vec<Instance>> {
        let mut filters = HashMap::new();
        if let Some((key, value)) = &filter.label {
            filters.insert("label".to_string(), vec![format!("{key}={value}")]);
        }
        let options = ListContainersOptions::<String> {
            all: filter.include_stopped,
            filters,
            ..Default::default()
        };

        let summaries = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(DockerError::DockerApi)?;

        let instances: Vec<Instance> = summaries
            .into_iter()
            .filter_map(instance_from_summary)
            .filter(|instance| filter.admits(instance))
            .collect();
        debug!(count = instances.len(), "Listed containers");
        Ok(instances)
    }

    #[instrument(skip(self, request), fields(service = %request.service, image = %request.image_reference))]
    async fn run(&self, request: &RunRequest) -> EngineResult<Instance> {
        let id = match self.create(request).await {
            Ok(id) => id,
            Err(DockerError::CreationFailed { source, .. })
                if self.config.pull_missing_images && status_code(&source) == Some(404) =>
            {
                self.pull(&request.image_reference).await?;
                self.create(request).await?
            }
            Err(e) => return Err(e.into()),
        };
        info!(container_id = %id, "Container created. Starting...");

        if let Err(source) = self
            .docker
            .start_container(&id, None::<StartContainerOptions<String>>)
            .await
        {
            let remove_opts = Some(RemoveContainerOptions {
                force: true,
                ..Default::default()
            });
            if let Err(e) = self.docker.remove_container(&id, remove_opts).await {
                warn!(container_id = %id, error = %e, "Failed to remove container that did not start");
            }
            return Err(DockerError::StartFailed {
                id,
                image: request.image_reference.clone(),
                source,
            }
            .into());
        }

        // Already running: fall back to what the request says.
        let instance = match self.inspect(&id).await {
            Ok(instance) => instance,
            Err(e) => {
                warn!(container_id = %id, error = %e, "Started container could not be inspected");
                started_instance(&id, request)
            }
        };
        info!(instance_id = %instance.id, name = %instance.display_name, "Container started.");
        Ok(instance)
    }

    #[instrument(skip(self))]
    async fn stop(&self, instance_id: &str) -> EngineResult<()> {
        let options = StopContainerOptions {
            t: self.config.stop_timeout.as_secs() as i64,
        };
        match self.docker.stop_container(instance_id, Some(options)).await {
            Ok(()) => {
                info!("Container stopped.");
                Ok(())
            }
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!("Container was already stopped");
                Ok(())
            }
            Err(source) => Err(DockerError::StopFailed {
                id: instance_id.to_string(),
                source,
            }
            .into()),
        }
    }

    #[instrument(skip(self))]
    async fn remove(&self, instance_id: &str, force: bool) -> EngineResult<()> {
        let options = Some(RemoveContainerOptions {
            force,
            ..Default::default()
        });
        self.docker
            .remove_container(instance_id, options)
            .await
            .map_err(|source| DockerError::RemovalFailed {
                id: instance_id.to_string(),
                source,
            })?;
        info!("Container removed.");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn stats(&self, instance_id: &str) -> EngineResult<UsageSnapshot> {
        let options = StatsOptions {
            stream: false,
            one_shot: false,
        };
        let stream = self.docker.stats(instance_id, Some(options));
        futures::pin_mut!(stream);

        match stream.next().await {
            Some(Ok(stats)) => Ok(usage::snapshot_from_stats(&stats)),
            Some(Err(source)) => Err(DockerError::StatsFailed {
                id: instance_id.to_string(),
                source,
            }
            .into()),
            None => Err(DockerError::EmptyStats(instance_id.to_string()).into()),
        }
    }

    async fn ping(&self) -> EngineResult<()> {
        self.docker.ping().await.map_err(DockerError::DockerApi)?;
        Ok(())
    }
}
