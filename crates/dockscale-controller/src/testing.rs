//! In-memory [`ContainerEngine`] for tests, with call recording and failure
//! injection. Enabled with the `testing` feature.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dockscale_common::{
    short_id, ContainerEngine, EngineError, EngineResult, Instance, InstanceStatus, ListFilter,
    RunRequest, UsageSnapshot, MANAGED_LABEL, SERVICE_LABEL,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

// 2024-01-01T00:00:00Z; each new container is one second younger than the last.
const BASE_TIMESTAMP: i64 = 1_704_067_200;

/// One recorded trait call, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    List { include_stopped: bool, label: Option<(String, String)> },
    Run { image: String },
    Stop { id: String },
    Remove { id: String, force: bool },
    Stats { id: String },
    Ping,
}

#[derive(Debug, Clone)]
struct StoredContainer {
    full_id: String,
    instance: Instance,
}

#[derive(Debug, Clone)]
struct RunBudget {
    remaining: usize,
    error: EngineError,
}

#[derive(Debug, Default)]
struct EngineState {
    containers: Vec<StoredContainer>,
    calls: Vec<EngineCall>,
    created: i64,
    unavailable: bool,
    run_budget: Option<RunBudget>,
    run_delay: Option<Duration>,
    missing_images: HashSet<String>,
    stop_failures: HashMap<String, EngineError>,
    stats_failures: HashSet<String>,
    vanish_on_stop: HashSet<String>,
}

impl EngineState {
    fn next_created_at(&mut self) -> DateTime<Utc> {
        let at = DateTime::from_timestamp(BASE_TIMESTAMP + self.created, 0).unwrap_or_default();
        self.created += 1;
        at
    }

    fn insert(
        &mut self,
        service: Option<&str>,
        image: &str,
        status: InstanceStatus,
    ) -> Instance {
        let full_id = format!(
            "{}{}",
            uuid::Uuid::new_v4().simple(),
            uuid::Uuid::new_v4().simple()
        );
        let created_at = self.next_created_at();
        let mut labels = BTreeMap::new();
        if let Some(service) = service {
            labels.insert(SERVICE_LABEL.to_string(), service.to_string());
            labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        }
        let instance = Instance {
            id: short_id(&full_id),
            full_id: full_id.clone(),
            image_reference: image.to_string(),
            status,
            created_at,
            display_name: format!("{}-{}", service.unwrap_or("stray"), self.created),
            labels,
        };
        self.containers.push(StoredContainer {
            full_id,
            instance: instance.clone(),
        });
        instance
    }

    fn position(&self, id: &str) -> Option<usize> {
        if id.is_empty() {
            return None;
        }
        self.containers.iter().position(|c| c.full_id.starts_with(id))
    }

    fn check_available(&self) -> EngineResult<()> {
        if self.unavailable {
            return Err(EngineError::Unavailable("engine is not reachable".to_string()));
        }
        Ok(())
    }
}

/// Deterministic engine double. Clones share state.
#[derive(Clone, Default)]
pub struct InMemoryEngine {
    state: Arc<Mutex<EngineState>>,
    newest_first: bool,
}

impl InMemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lists most-recent first, like `docker ps`.
    pub fn newest_first(mut self) -> Self {
        self.newest_first = true;
        self
    }

    /// Adds a container labelled for `service` without recording a call.
    pub async fn seed(&self, service: &str, image: &str, status: InstanceStatus) -> Instance {
        self.state.lock().await.insert(Some(service), image, status)
    }

    /// Adds a container with no control-plane labels.
    pub async fn seed_unmanaged(&self, image: &str, status: InstanceStatus) -> Instance {
        self.state.lock().await.insert(None, image, status)
    }

    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }

    /// Lets `successes` more runs through, then fails every run with `error`.
    pub async fn fail_runs_after(&self, successes: usize, error: EngineError) {
        self.state.lock().await.run_budget = Some(RunBudget {
            remaining: successes,
            error,
        });
    }

    pub async fn mark_image_missing(&self, image: &str) {
        self.state.lock().await.missing_images.insert(image.to_string());
    }

    pub async fn fail_stop_for(&self, id: &str, error: EngineError) {
        self.state
            .lock()
            .await
            .stop_failures
            .insert(id.to_string(), error);
    }

    pub async fn fail_stats_for(&self, id: &str) {
        self.state.lock().await.stats_failures.insert(id.to_string());
    }

    /// The container disappears when a stop reaches it, as if removed by
    /// another client in between.
    pub async fn vanish_on_stop(&self, id: &str) {
        self.state.lock().await.vanish_on_stop.insert(id.to_string());
    }

    /// Delay applied inside every `run`, after the call is recorded.
    pub async fn set_run_delay(&self, delay: Duration) {
        self.state.lock().await.run_delay = Some(delay);
    }

    pub async fn calls(&self) -> Vec<EngineCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn list_calls(&self) -> usize {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| matches!(c, EngineCall::List { .. }))
            .count()
    }

    pub async fn run_calls(&self) -> usize {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| matches!(c, EngineCall::Run { .. }))
            .count()
    }

    pub async fn full_id(&self, id: &str) -> Option<String> {
        let state = self.state.lock().await;
        state.position(id).map(|i| state.containers[i].full_id.clone())
    }

    pub async fn instances(&self) -> Vec<Instance> {
        self.state
            .lock()
            .await
            .containers
            .iter()
            .map(|c| c.instance.clone())
            .collect()
    }

    pub async fn instance(&self, id: &str) -> Option<Instance> {
        let state = self.state.lock().await;
        state.position(id).map(|i| state.containers[i].instance.clone())
    }

    pub async fn running_count(&self, image: &str) -> usize {
        self.state
            .lock()
            .await
            .containers
            .iter()
            .filter(|c| c.instance.image_reference == image && c.instance.status.is_running())
            .count()
    }
}

#[async_trait]
impl ContainerEngine for InMemoryEngine {
    async fn list(&self, filter: &ListFilter) -> EngineResult<Vec<Instance>> {
        let mut state = self.state.lock().await;
        state.calls.push(EngineCall::List {
            include_stopped: filter.include_stopped,
            label: filter.label.clone(),
        });
        state.check_available()?;

        let mut instances: Vec<Instance> = state
            .containers
            .iter()
            .map(|c| c.instance.clone())
            .filter(|i| filter.admits(i))
            .collect();
        if self.newest_first {
            instances.reverse();
        }
        Ok(instances)
    }

    async fn run(&self, request: &RunRequest) -> EngineResult<Instance> {
        let delay = {
            let mut state = self.state.lock().await;
            state.calls.push(EngineCall::Run {
                image: request.image_reference.clone(),
            });
            state.check_available()?;
            state.run_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().await;
        if state.missing_images.contains(&request.image_reference) {
            return Err(EngineError::ImageNotFound(request.image_reference.clone()));
        }
        if let Some(budget) = state.run_budget.as_mut() {
            if budget.remaining == 0 {
                return Err(budget.error.clone());
            }
            budget.remaining -= 1;
        }
        Ok(state.insert(
            Some(request.service.as_str()),
            &request.image_reference,
            InstanceStatus::Running,
        ))
    }

    async fn stop(&self, instance_id: &str) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        state.calls.push(EngineCall::Stop {
            id: instance_id.to_string(),
        });
        state.check_available()?;

        if state.vanish_on_stop.remove(instance_id) {
            if let Some(i) = state.position(instance_id) {
                state.containers.remove(i);
            }
            return Err(EngineError::InstanceNotFound(instance_id.to_string()));
        }
        if let Some(error) = state.stop_failures.get(instance_id) {
            return Err(error.clone());
        }
        let i = state
            .position(instance_id)
            .ok_or_else(|| EngineError::InstanceNotFound(instance_id.to_string()))?;
        state.containers[i].instance.status = InstanceStatus::Exited;
        Ok(())
    }

    async fn remove(&self, instance_id: &str, force: bool) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        state.calls.push(EngineCall::Remove {
            id: instance_id.to_string(),
            force,
        });
        state.check_available()?;

        let i = state
            .position(instance_id)
            .ok_or_else(|| EngineError::InstanceNotFound(instance_id.to_string()))?;
        if !force && state.containers[i].instance.status.is_running() {
            return Err(EngineError::Unavailable(format!(
                "cannot remove running instance {instance_id} without force"
            )));
        }
        state.containers.remove(i);
        Ok(())
    }

    async fn stats(&self, instance_id: &str) -> EngineResult<UsageSnapshot> {
        let mut state = self.state.lock().await;
        state.calls.push(EngineCall::Stats {
            id: instance_id.to_string(),
        });
        state.check_available()?;

        if state.stats_failures.contains(instance_id) {
            return Err(EngineError::Unavailable(format!(
                "stats stream closed for {instance_id}"
            )));
        }
        let i = state
            .position(instance_id)
            .ok_or_else(|| EngineError::InstanceNotFound(instance_id.to_string()))?;
        let instance = &state.containers[i].instance;
        let memory_usage_bytes = 16 * 1024 * 1024 * (i as u64 + 1);
        let memory_limit_bytes = 512 * 1024 * 1024;
        Ok(UsageSnapshot {
            read_at: Some(instance.created_at),
            cpu_percent: if instance.status.is_running() { 2.5 } else { 0.0 },
            online_cpus: 2,
            memory_usage_bytes,
            memory_limit_bytes,
            memory_percent: memory_usage_bytes as f64 / memory_limit_bytes as f64 * 100.0,
            pids: if instance.status.is_running() { 3 } else { 0 },
            ..UsageSnapshot::default()
        })
    }

    async fn ping(&self) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        state.calls.push(EngineCall::Ping);
        state.check_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_stop_remove() {
        let engine = InMemoryEngine::new();
        let request = RunRequest {
            service: "web".to_string(),
            image_reference: "nginx:latest".to_string(),
        };
        let instance = engine.run(&request).await.unwrap();
        assert_eq!(instance.id.len(), 12);
        assert_eq!(instance.service_label(), Some("web"));
        assert_eq!(engine.running_count("nginx:latest").await, 1);

        engine.stop(&instance.id).await.unwrap();
        assert_eq!(engine.running_count("nginx:latest").await, 0);
        assert_eq!(engine.instances().await.len(), 1);

        engine.remove(&instance.id, false).await.unwrap();
        assert!(engine.instances().await.is_empty());
        assert!(matches!(
            engine.stop(&instance.id).await,
            Err(EngineError::InstanceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_created_at_increases() {
        let engine = InMemoryEngine::new();
        let a = engine.seed("web", "nginx:latest", InstanceStatus::Running).await;
        let b = engine.seed("web", "nginx:latest", InstanceStatus::Running).await;
        assert!(a.created_at < b.created_at);
    }

    #[tokio::test]
    async fn test_run_budget() {
        let engine = InMemoryEngine::new();
        engine
            .fail_runs_after(1, EngineError::Unavailable("boom".to_string()))
            .await;
        let request = RunRequest {
            service: "web".to_string(),
            image_reference: "nginx:latest".to_string(),
        };
        assert!(engine.run(&request).await.is_ok());
        assert!(engine.run(&request).await.is_err());
        assert_eq!(engine.run_calls().await, 2);
    }
}
