use bollard::Docker;

/// True when a daemon answers a ping over the default connection
/// (`DOCKER_HOST` or the local socket).
pub async fn docker_reachable() -> bool {
    match Docker::connect_with_local_defaults() {
        Ok(docker) => docker.ping().await.is_ok(),
        Err(_) => false,
    }
}

/// Returns early from an async test when no Docker daemon is reachable.
#[macro_export]
macro_rules! require_docker {
    () => {
        if !$crate::test_utils::docker_reachable().await {
            eprintln!("Skipping: Docker daemon not reachable");
            return;
        }
    };
}
