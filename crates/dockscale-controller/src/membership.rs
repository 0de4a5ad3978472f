//! Maps registry services onto the engine's live instances.
//!
//! Membership is recomputed from a fresh `list` on every call; nothing is cached.
//! Results are ordered oldest-created first (ties broken by id), which is the
//! order scale-in consumes them in. The engine's own list order is never used.

use crate::{ControlError, MembershipRule, Result, ServiceRegistry};
use dockscale_common::{
    ContainerEngine, Instance, ListFilter, ServiceDefinition, MANAGED_LABEL, SERVICE_LABEL,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// A managed instance together with the service it was attributed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Member {
    pub service: String,
    pub instance: Instance,
}

#[derive(Clone)]
pub struct MembershipResolver {
    engine: Arc<dyn ContainerEngine>,
    registry: Arc<ServiceRegistry>,
    rule: MembershipRule,
}

impl MembershipResolver {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        registry: Arc<ServiceRegistry>,
        rule: MembershipRule,
    ) -> Self {
        Self {
            engine,
            registry,
            rule,
        }
    }

    pub fn rule(&self) -> MembershipRule {
        self.rule
    }

    /// Registry lookup; fails before any engine traffic.
    pub fn lookup(&self, service: &str) -> Result<&ServiceDefinition> {
        self.registry
            .lookup(service)
            .ok_or_else(|| ControlError::ServiceNotFound(service.to_string()))
    }

    pub fn is_member(&self, def: &ServiceDefinition, instance: &Instance) -> bool {
        if instance.image_reference != def.image_reference {
            return false;
        }
        match self.rule {
            MembershipRule::Image => true,
            MembershipRule::Label => instance.service_label() == Some(def.name.as_str()),
        }
    }

    fn filter_for(&self, service: Option<&str>, include_stopped: bool) -> ListFilter {
        let filter = if include_stopped {
            ListFilter::any_state()
        } else {
            ListFilter::running()
        };
        match (self.rule, service) {
            (MembershipRule::Image, _) => filter,
            (MembershipRule::Label, Some(service)) => filter.with_label(SERVICE_LABEL, service),
            (MembershipRule::Label, None) => filter.with_label(MANAGED_LABEL, "true"),
        }
    }

    async fn matching(&self, service: &str, include_stopped: bool) -> Result<Vec<Instance>> {
        let def = self.lookup(service)?;
        let instances = self
            .engine
            .list(&self.filter_for(Some(service), include_stopped))
            .await?;

        let mut members: Vec<Instance> = instances
            .into_iter()
            .filter(|instance| include_stopped || instance.status.is_running())
            .filter(|instance| self.is_member(def, instance))
            .collect();
        sort_oldest_first(&mut members);
        debug!(%service, count = members.len(), include_stopped, "Resolved membership");
        Ok(members)
    }

    /// Running instances of `service`, oldest first.
    #[instrument(skip(self))]
    pub async fn resolve(&self, service: &str) -> Result<Vec<Instance>> {
        self.matching(service, false).await
    }

    /// Instances of `service` in any state, oldest first.
    #[instrument(skip(self))]
    pub async fn resolve_any_state(&self, service: &str) -> Result<Vec<Instance>> {
        self.matching(service, true).await
    }

    /// Running instances of every registry service, from a single `list` call.
    ///
    /// An instance matching several services is attributed to the first by name.
    #[instrument(skip(self))]
    pub async fn resolve_all(&self) -> Result<Vec<Member>> {
        let instances = self.engine.list(&self.filter_for(None, false)).await?;
        let mut members: Vec<Member> = instances
            .into_iter()
            .filter(|instance| instance.status.is_running())
            .filter_map(|instance| self.attribute(instance))
            .collect();
        members.sort_by(|a, b| oldest_first(&a.instance, &b.instance));
        debug!(count = members.len(), "Resolved membership across registry");
        Ok(members)
    }

    /// Finds a managed instance in any state by a unique prefix of its full id.
    #[instrument(skip(self))]
    pub async fn find(&self, instance_id: &str) -> Result<Member> {
        let instance_id = instance_id.trim();
        if instance_id.is_empty() {
            return Err(ControlError::InstanceNotFound(String::new()));
        }
        let mut members: Vec<Member> = self
            .engine
            .list(&self.filter_for(None, true))
            .await?
            .into_iter()
            .filter(|instance| instance.matches_id(instance_id))
            .filter_map(|instance| self.attribute(instance))
            .collect();
        if members.len() > 1 {
            warn!(instance_id, matches = members.len(), "Ambiguous instance id prefix");
            return Err(ControlError::InstanceNotFound(instance_id.to_string()));
        }
        members
            .pop()
            .ok_or_else(|| ControlError::InstanceNotFound(instance_id.to_string()))
    }

    fn attribute(&self, instance: Instance) -> Option<Member> {
        let service = self
            .registry
            .list_all()
            .find(|def| self.is_member(def, &instance))?
            .name
            .clone();
        Some(Member { service, instance })
    }
}

fn oldest_first(a: &Instance, b: &Instance) -> std::cmp::Ordering {
    a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id))
}

pub(crate) fn sort_oldest_first(instances: &mut [Instance]) {
    instances.sort_by(oldest_first);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryEngine;
    use dockscale_common::InstanceStatus;

    fn registry() -> Arc<ServiceRegistry> {
        Arc::new(
            ServiceRegistry::from_definitions(
                vec![
                    ServiceDefinition::new("web", "nginx:latest"),
                    ServiceDefinition::new("mirror", "nginx:latest"),
                    ServiceDefinition::new("api", "acme/api:1"),
                ],
                "control-plane",
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_resolve_sorts_oldest_first_regardless_of_engine_order() {
        let engine = Arc::new(InMemoryEngine::new().newest_first());
        let first = engine.seed("web", "nginx:latest", InstanceStatus::Running).await;
        let second = engine.seed("web", "nginx:latest", InstanceStatus::Running).await;
        let third = engine.seed("web", "nginx:latest", InstanceStatus::Running).await;

        let resolver = MembershipResolver::new(engine.clone(), registry(), MembershipRule::Image);
        let ids: Vec<String> = resolver
            .resolve("web")
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(ids, vec![first.id, second.id, third.id]);
    }

    #[tokio::test]
    async fn test_resolve_excludes_stopped_and_foreign_images() {
        let engine = Arc::new(InMemoryEngine::new());
        engine.seed("web", "nginx:latest", InstanceStatus::Running).await;
        engine.seed("web", "nginx:latest", InstanceStatus::Exited).await;
        engine.seed("api", "acme/api:1", InstanceStatus::Running).await;
        engine.seed_unmanaged("nginx:1.25", InstanceStatus::Running).await;

        let resolver = MembershipResolver::new(engine.clone(), registry(), MembershipRule::Image);
        assert_eq!(resolver.resolve("web").await.unwrap().len(), 1);
        assert_eq!(resolver.resolve_any_state("web").await.unwrap().len(), 2);
        assert_eq!(engine.list_calls().await, 2);
    }

    #[tokio::test]
    async fn test_image_rule_cannot_tell_shared_images_apart() {
        let engine = Arc::new(InMemoryEngine::new());
        engine.seed("web", "nginx:latest", InstanceStatus::Running).await;
        engine.seed("mirror", "nginx:latest", InstanceStatus::Running).await;

        let image = MembershipResolver::new(engine.clone(), registry(), MembershipRule::Image);
        assert_eq!(image.resolve("web").await.unwrap().len(), 2);
        assert_eq!(image.resolve("mirror").await.unwrap().len(), 2);

        let label = MembershipResolver::new(engine.clone(), registry(), MembershipRule::Label);
        assert_eq!(label.resolve("web").await.unwrap().len(), 1);
        assert_eq!(label.resolve("mirror").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_service_makes_no_engine_call() {
        let engine = Arc::new(InMemoryEngine::new());
        let resolver = MembershipResolver::new(engine.clone(), registry(), MembershipRule::Image);

        let err = resolver.resolve("ghost").await.unwrap_err();
        assert!(matches!(err, ControlError::ServiceNotFound(ref s) if s == "ghost"));
        assert!(engine.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_all_attributes_to_first_service_by_name() {
        let engine = Arc::new(InMemoryEngine::new());
        engine.seed("web", "nginx:latest", InstanceStatus::Running).await;
        engine.seed("api", "acme/api:1", InstanceStatus::Running).await;
        engine.seed_unmanaged("redis:7", InstanceStatus::Running).await;

        let resolver = MembershipResolver::new(engine.clone(), registry(), MembershipRule::Image);
        let members = resolver.resolve_all().await.unwrap();
        let services: Vec<&str> = members.iter().map(|m| m.service.as_str()).collect();
        // "mirror" sorts before "web" and shares its image
        assert_eq!(services, vec!["mirror", "api"]);
        assert_eq!(engine.list_calls().await, 1);
    }

    #[tokio::test]
    async fn test_find_by_short_and_long_id() {
        let engine = Arc::new(InMemoryEngine::new());
        let web = engine.seed("web", "nginx:latest", InstanceStatus::Exited).await;
        let stray = engine.seed_unmanaged("redis:7", InstanceStatus::Running).await;

        let resolver = MembershipResolver::new(engine.clone(), registry(), MembershipRule::Label);
        let found = resolver.find(&web.id).await.unwrap();
        assert_eq!(found.service, "web");
        assert_eq!(found.instance.status, InstanceStatus::Exited);

        let long_id = engine.full_id(&web.id).await.unwrap();
        assert_eq!(resolver.find(&long_id).await.unwrap().instance.id, web.id);

        let err = resolver.find(&stray.id).await.unwrap_err();
        assert!(matches!(err, ControlError::InstanceNotFound(_)));
        assert!(matches!(resolver.find("  ").await, Err(ControlError::InstanceNotFound(_))));
    }

    #[tokio::test]
    async fn test_find_matches_prefixes_of_the_full_id_only() {
        let engine = Arc::new(InMemoryEngine::new());
        let web = engine.seed("web", "nginx:latest", InstanceStatus::Running).await;
        let resolver = MembershipResolver::new(engine.clone(), registry(), MembershipRule::Label);

        let found = resolver.find(&web.id[..6]).await.unwrap();
        assert_eq!(found.instance.id, web.id);

        let garbage = format!("{}ZZZZ-not-this-container", web.id);
        let err = resolver.find(&garbage).await.unwrap_err();
        assert!(matches!(err, ControlError::InstanceNotFound(ref id) if *id == garbage));
    }
}
