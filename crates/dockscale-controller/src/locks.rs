use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

/// One async mutex per service name.
///
/// Held across a whole resolve → decide → act sequence. Tokio's mutex queues
/// waiters in FIFO order, so contending callers run in arrival order.
#[derive(Clone, Default)]
pub(crate) struct ServiceLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl ServiceLocks {
    pub(crate) async fn acquire(&self, service: &str) -> OwnedMutexGuard<()> {
        // Clone the Arc out so the shard lock is released before awaiting.
        let lock = self
            .locks
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        trace!(%service, "Waiting for service lock");
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_service_is_exclusive() {
        let locks = ServiceLocks::default();
        let guard = locks.acquire("web").await;

        let contender = locks.clone();
        let waiter = tokio::spawn(async move {
            let _guard = contender.acquire("web").await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_different_services_do_not_contend() {
        let locks = ServiceLocks::default();
        let _web = locks.acquire("web").await;
        tokio::time::timeout(Duration::from_millis(100), locks.acquire("api"))
            .await
            .expect("api lock should be free");
    }
}
