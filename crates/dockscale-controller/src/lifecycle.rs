use crate::locks::ServiceLocks;
use crate::membership::{Member, MembershipResolver};
use crate::{ControlError, Progress, Result};
use dockscale_common::{ContainerEngine, Instance, InstanceStatus, RunRequest, ServiceDefinition};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TeardownOutcome {
    pub stopped: usize,
    pub removed: usize,
}

/// Per-instance start/stop/remove plus the bulk sweeps built on them.
///
/// Service-scoped operations hold the service lock for their whole run. In bulk
/// sweeps an instance that disappeared in the meantime counts as done and is
/// skipped; any other failure ends the sweep as `PartialReconciliation`.
#[derive(Clone)]
pub struct Lifecycle {
    engine: Arc<dyn ContainerEngine>,
    resolver: MembershipResolver,
    locks: ServiceLocks,
}

impl Lifecycle {
    pub(crate) fn new(
        engine: Arc<dyn ContainerEngine>,
        resolver: MembershipResolver,
        locks: ServiceLocks,
    ) -> Self {
        Self {
            engine,
            resolver,
            locks,
        }
    }

    #[instrument(skip(self))]
    pub async fn start_one(&self, service: &str) -> Result<Instance> {
        let def = self.resolver.lookup(service)?.clone();
        let _guard = self.locks.acquire(service).await;
        self.launch(&def).await
    }

    /// Starts one instance without taking the service lock; the caller holds it.
    pub(crate) async fn launch(&self, def: &ServiceDefinition) -> Result<Instance> {
        match self.engine.run(&RunRequest::from(def)).await {
            Ok(instance) => {
                info!(service = %def.name, instance_id = %instance.id, "Started instance");
                Ok(instance)
            }
            Err(e) => {
                warn!(service = %def.name, image = %def.image_reference, error = %e, "Failed to start instance");
                Err(e.into())
            }
        }
    }

    pub async fn stop_one(&self, instance: &Instance) -> Result<()> {
        self.engine.stop(&instance.id).await?;
        debug!(instance_id = %instance.id, "Stopped instance");
        Ok(())
    }

    /// Force-removes the instance, running or not.
    pub async fn remove_one(&self, instance: &Instance) -> Result<()> {
        self.engine.remove(&instance.id, true).await?;
        debug!(instance_id = %instance.id, "Removed instance");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn stop_all_for_service(&self, service: &str) -> Result<usize> {
        self.resolver.lookup(service)?;
        let _guard = self.locks.acquire(service).await;

        let members = self.resolver.resolve(service).await?;
        let progress = self.stop_each(&members, Progress::default()).await?;
        info!(%service, stopped = progress.stopped, "Stopped all instances");
        Ok(progress.stopped)
    }

    #[instrument(skip(self))]
    pub async fn remove_all_for_service(&self, service: &str) -> Result<usize> {
        self.resolver.lookup(service)?;
        let _guard = self.locks.acquire(service).await;

        let members = self.resolver.resolve_any_state(service).await?;
        let progress = self.remove_each(&members, Progress::default()).await?;
        info!(%service, removed = progress.removed, "Removed all instances");
        Ok(progress.removed)
    }

    /// Stops every running member, then removes every member in any state.
    #[instrument(skip(self))]
    pub async fn teardown_service(&self, service: &str) -> Result<TeardownOutcome> {
        self.resolver.lookup(service)?;
        let _guard = self.locks.acquire(service).await;

        let running = self.resolver.resolve(service).await?;
        let progress = self.stop_each(&running, Progress::default()).await?;

        let all = match self.resolver.resolve_any_state(service).await {
            Ok(all) => all,
            Err(e) => return Err(ControlError::partial(progress, e)),
        };
        let progress = self.remove_each(&all, progress).await?;

        info!(%service, stopped = progress.stopped, removed = progress.removed, "Service torn down");
        Ok(TeardownOutcome {
            stopped: progress.stopped,
            removed: progress.removed,
        })
    }

    /// Stops a single managed instance addressed by id.
    #[instrument(skip(self))]
    pub async fn stop_instance(&self, instance_id: &str) -> Result<Member> {
        let mut member = self.resolver.find(instance_id).await?;
        let _guard = self.locks.acquire(&member.service).await;

        self.stop_one(&member.instance).await?;
        member.instance.status = InstanceStatus::Exited;
        info!(service = %member.service, instance_id = %member.instance.id, "Stopped instance");
        Ok(member)
    }

    /// Force-removes a single managed instance addressed by id.
    #[instrument(skip(self))]
    pub async fn remove_instance(&self, instance_id: &str) -> Result<Member> {
        let member = self.resolver.find(instance_id).await?;
        let _guard = self.locks.acquire(&member.service).await;

        self.remove_one(&member.instance).await?;
        info!(service = %member.service, instance_id = %member.instance.id, "Removed instance");
        Ok(member)
    }

    async fn stop_each(&self, members: &[Instance], mut progress: Progress) -> Result<Progress> {
        for instance in members {
            match self.stop_one(instance).await {
                Ok(()) => progress.stopped += 1,
                Err(ControlError::InstanceNotFound(_)) => {
                    debug!(instance_id = %instance.id, "Instance already gone, skipping stop");
                }
                Err(e) => return Err(ControlError::partial(progress, e)),
            }
        }
        Ok(progress)
    }

    async fn remove_each(&self, members: &[Instance], mut progress: Progress) -> Result<Progress> {
        for instance in members {
            match self.remove_one(instance).await {
                Ok(()) => progress.removed += 1,
                Err(ControlError::InstanceNotFound(_)) => {
                    debug!(instance_id = %instance.id, "Instance already gone, skipping removal");
                }
                Err(e) => return Err(ControlError::partial(progress, e)),
            }
        }
        Ok(progress)
    }
}
