use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// Per-gateway mutual exclusion.
///
/// At most one reconciliation action runs per gateway at any time; callers
/// that request a busy gateway queue on the mutex rather than being
/// rejected. Different gateways proceed fully in parallel.
#[derive(Default)]
pub struct GatewayLocks {
    inner: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl GatewayLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for and hold the gateway's lock.
    pub async fn hold(&self, id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let entry = self.inner.entry(id).or_default();
            Arc::clone(entry.value())
        };
        lock.lock_owned().await
    }

    /// Drop the lock entry for a gateway that no longer exists.
    pub fn forget(&self, id: Uuid) {
        self.inner.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_gateway_is_exclusive() {
        let locks = Arc::new(GatewayLocks::new());
        let id = Uuid::new_v4();

        let guard = locks.hold(id).await;

        let contender = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                locks.hold(id).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished(), "second holder should queue");

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .expect("queued holder should acquire after release")
            .unwrap();
    }

    #[tokio::test]
    async fn different_gateways_do_not_contend() {
        let locks = GatewayLocks::new();
        let _a = locks.hold(Uuid::new_v4()).await;
        let _b = locks.hold(Uuid::new_v4()).await;
    }
}
