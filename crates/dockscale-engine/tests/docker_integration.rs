//! Real Docker round-trips for the engine adapter.
//! Run with: cargo test -p dockscale-engine --test docker_integration -- --ignored

use dockscale_common::{ContainerEngine, EngineError, InstanceStatus, ListFilter, RunRequest, SERVICE_LABEL};
use dockscale_engine::{require_docker, DockerEngine, DockerEngineConfig};
use serial_test::serial;
use std::time::Duration;

const IMAGE: &str = "nginx:alpine";

fn engine() -> DockerEngine {
    DockerEngine::connect(DockerEngineConfig {
        stop_timeout: Duration::from_secs(2),
        pull_missing_images: true,
    })
    .expect("docker client")
}

#[tokio::test]
#[ignore = "Requires Docker"]
#[serial]
async fn test_run_list_stop_remove_roundtrip() {
    require_docker!();
    let engine = engine();

    let request = RunRequest {
        service: "it-web".to_string(),
        image_reference: IMAGE.to_string(),
    };
    let instance = engine.run(&request).await.expect("run");
    assert_eq!(instance.status, InstanceStatus::Running);
    assert_eq!(instance.image_reference, IMAGE);
    assert_eq!(instance.service_label(), Some("it-web"));

    let running = engine
        .list(&ListFilter::running().with_label(SERVICE_LABEL, "it-web"))
        .await
        .unwrap();
    assert!(running.iter().any(|i| i.id == instance.id));

    let usage = engine.stats(&instance.id).await.expect("stats");
    assert!(usage.memory_usage_bytes > 0);

    engine.stop(&instance.id).await.expect("stop");
    // Stopping twice is a no-op on the engine side
    engine.stop(&instance.id).await.expect("second stop");

    let all = engine.list(&ListFilter::any_state()).await.unwrap();
    let stopped = all.iter().find(|i| i.id == instance.id).expect("still listed");
    assert_eq!(stopped.status, InstanceStatus::Exited);

    engine.remove(&instance.id, true).await.expect("remove");
    let err = engine.remove(&instance.id, true).await.unwrap_err();
    assert_eq!(err, EngineError::InstanceNotFound(instance.id.clone()));
}

#[tokio::test]
#[ignore = "Requires Docker"]
#[serial]
async fn test_run_unknown_image() {
    require_docker!();
    let engine = engine();

    let image = "docker.io/library/this-image-definitely-does-not-exist-ever:latest";
    let err = engine
        .run(&RunRequest {
            service: "ghost".to_string(),
            image_reference: image.to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::ImageNotFound(image.to_string()));
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_stats_for_missing_container() {
    require_docker!();
    let err = engine().stats("000000000000").await.unwrap_err();
    assert!(matches!(err, EngineError::InstanceNotFound(_)));
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_ping() {
    require_docker!();
    engine().ping().await.expect("ping");
}
