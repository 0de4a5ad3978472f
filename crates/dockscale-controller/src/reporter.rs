use crate::membership::{Member, MembershipResolver};
use crate::Result;
use chrono::{DateTime, Utc};
use dockscale_common::{ContainerEngine, InstanceStatus, UsageSnapshot};
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{instrument, warn};

/// Scope of a status or resource report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Every instance managed by any registry service.
    All,
    Service(String),
}

impl Target {
    pub fn service(name: impl Into<String>) -> Self {
        Target::Service(name.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceInfo {
    pub service: String,
    pub image: String,
    pub status: InstanceStatus,
    pub created_at: DateTime<Utc>,
    pub display_name: String,
}

/// Usage for one instance, or the reason it could not be sampled.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceEntry {
    pub service: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Read-only views over the same membership the reconciler acts on.
#[derive(Clone)]
pub struct Reporter {
    engine: Arc<dyn ContainerEngine>,
    resolver: MembershipResolver,
}

impl Reporter {
    pub(crate) fn new(engine: Arc<dyn ContainerEngine>, resolver: MembershipResolver) -> Self {
        Self { engine, resolver }
    }

    async fn members(&self, target: &Target) -> Result<Vec<Member>> {
        match target {
            Target::All => self.resolver.resolve_all().await,
            Target::Service(service) => Ok(self
                .resolver
                .resolve(service)
                .await?
                .into_iter()
                .map(|instance| Member {
                    service: service.clone(),
                    instance,
                })
                .collect()),
        }
    }

    #[instrument(skip(self))]
    pub async fn info(&self, target: &Target) -> Result<BTreeMap<String, InstanceInfo>> {
        Ok(self
            .members(target)
            .await?
            .into_iter()
            .map(|Member { service, instance }| {
                (
                    instance.id,
                    InstanceInfo {
                        service,
                        image: instance.image_reference,
                        status: instance.status,
                        created_at: instance.created_at,
                        display_name: instance.display_name,
                    },
                )
            })
            .collect())
    }

    /// Samples every member concurrently. A failed sample is recorded on its
    /// entry and does not fail the report.
    #[instrument(skip(self))]
    pub async fn resource(&self, target: &Target) -> Result<BTreeMap<String, ResourceEntry>> {
        let members = self.members(target).await?;

        let samples = join_all(members.iter().map(|member| {
            let engine = self.engine.clone();
            let id = member.instance.id.clone();
            async move { engine.stats(&id).await }
        }))
        .await;

        Ok(members
            .into_iter()
            .zip(samples)
            .map(|(Member { service, instance }, sample)| {
                let entry = match sample {
                    Ok(usage) => ResourceEntry {
                        service,
                        usage: Some(usage),
                        error: None,
                    },
                    Err(e) => {
                        warn!(instance_id = %instance.id, error = %e, "Stats unavailable for instance");
                        ResourceEntry {
                            service,
                            usage: None,
                            error: Some(e.to_string()),
                        }
                    }
                };
                (instance.id, entry)
            })
            .collect())
    }
}
