use dockscale_controller::common::{InstanceStatus, ServiceDefinition};
use dockscale_controller::testing::InMemoryEngine;
use dockscale_controller::{Controller, ControllerConfig, ServiceRegistry, Target};
use std::collections::BTreeSet;
use std::sync::Arc;

fn controller(engine: &Arc<InMemoryEngine>) -> Controller {
    let registry = ServiceRegistry::from_definitions(
        vec![
            ServiceDefinition::new("web", "nginx:latest"),
            ServiceDefinition::new("api", "acme/api:1"),
        ],
        "control-plane",
    )
    .unwrap();
    Controller::new(engine.clone(), registry, ControllerConfig::default())
}

#[tokio::test]
async fn test_info_for_service() {
    let engine = Arc::new(InMemoryEngine::new());
    let web = engine.seed("web", "nginx:latest", InstanceStatus::Running).await;
    engine.seed("web", "nginx:latest", InstanceStatus::Exited).await;
    engine.seed("api", "acme/api:1", InstanceStatus::Running).await;
    let ctl = controller(&engine);

    let info = ctl.info(&Target::service("web")).await.unwrap();
    assert_eq!(info.len(), 1);
    let entry = &info[&web.id];
    assert_eq!(entry.service, "web");
    assert_eq!(entry.image, "nginx:latest");
    assert_eq!(entry.status, InstanceStatus::Running);
    assert_eq!(entry.created_at, web.created_at);
    assert_eq!(entry.display_name, web.display_name);
}

#[tokio::test]
async fn test_info_all_is_union_of_services() {
    let engine = Arc::new(InMemoryEngine::new());
    engine.seed("web", "nginx:latest", InstanceStatus::Running).await;
    engine.seed("api", "acme/api:1", InstanceStatus::Running).await;
    engine.seed_unmanaged("postgres:16", InstanceStatus::Running).await;
    let ctl = controller(&engine);

    let info = ctl.info(&Target::All).await.unwrap();
    let services: BTreeSet<&str> = info.values().map(|i| i.service.as_str()).collect();
    assert_eq!(services, BTreeSet::from(["api", "web"]));
    assert_eq!(engine.list_calls().await, 1);
}

#[tokio::test]
async fn test_info_unknown_service() {
    let engine = Arc::new(InMemoryEngine::new());
    let ctl = controller(&engine);
    let err = ctl.info(&Target::service("ghost")).await.unwrap_err();
    assert_eq!(err.code(), "SERVICE_NOT_FOUND");
    assert!(engine.calls().await.is_empty());
}

#[tokio::test]
async fn test_resource_isolates_stats_failure() {
    let engine = Arc::new(InMemoryEngine::new());
    let healthy = engine.seed("web", "nginx:latest", InstanceStatus::Running).await;
    let broken = engine.seed("web", "nginx:latest", InstanceStatus::Running).await;
    engine.fail_stats_for(&broken.id).await;
    let ctl = controller(&engine);

    let report = ctl.resource(&Target::service("web")).await.unwrap();
    assert_eq!(report.len(), 2);

    let ok = &report[&healthy.id];
    assert!(ok.error.is_none());
    let usage = ok.usage.as_ref().unwrap();
    assert!(usage.memory_usage_bytes > 0);

    let failed = &report[&broken.id];
    assert!(failed.usage.is_none());
    assert!(failed.error.as_deref().unwrap().contains(&broken.id));
}

#[tokio::test]
async fn test_reports_match_reconciled_set() {
    let engine = Arc::new(InMemoryEngine::new());
    let ctl = controller(&engine);

    ctl.reconcile("web", 3).await.unwrap();
    ctl.reconcile("web", 2).await.unwrap();
    ctl.reconcile("api", 1).await.unwrap();

    let current: BTreeSet<String> = ctl
        .resolver()
        .resolve("web")
        .await
        .unwrap()
        .into_iter()
        .map(|i| i.id)
        .collect();
    let info: BTreeSet<String> = ctl
        .info(&Target::service("web"))
        .await
        .unwrap()
        .into_keys()
        .collect();
    let resource: BTreeSet<String> = ctl
        .resource(&Target::service("web"))
        .await
        .unwrap()
        .into_keys()
        .collect();

    assert_eq!(current.len(), 2);
    assert_eq!(info, current);
    assert_eq!(resource, current);
    assert_eq!(ctl.info(&Target::All).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_resource_serializes_error_entries() {
    let engine = Arc::new(InMemoryEngine::new());
    let broken = engine.seed("web", "nginx:latest", InstanceStatus::Running).await;
    engine.fail_stats_for(&broken.id).await;
    let ctl = controller(&engine);

    let report = ctl.resource(&Target::All).await.unwrap();
    let json = serde_json::to_value(&report).unwrap();
    let entry = &json[&broken.id];
    assert_eq!(entry["service"], "web");
    assert!(entry.get("usage").is_none());
    assert!(entry["error"].is_string());
}
