//! Background job: periodically delete expired secrets.
//!
//! Sweeps once immediately, then every `interval`. A pass that is already
//! running when the token is cancelled is allowed to finish; nothing starts
//! after cancellation.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::store::Store;

/// Handle to a running cleaner task.
pub struct Cleaner {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Cleaner {
    /// Spawn the cleaner for `store`. Must be called from within a tokio runtime.
    pub fn spawn(store: Store, interval: Duration) -> Self {
        let token = CancellationToken::new();
        let child = token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            // A slow sweep should not trigger a burst of catch-up passes.
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(
                backend = %store.kind(),
                interval_secs = interval.as_secs(),
                "cleaner started"
            );

            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {
                        tracing::debug!(backend = %store.kind(), "cleaner: sweeping");
                        store.delete_expired().await;
                    }
                }
            }

            tracing::info!(backend = %store.kind(), "cleaner stopped");
        });

        Self { token, handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel the task and wait for it to exit.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            tracing::error!("cleaner task failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::errors::StoreError;
    use crate::models::secret::{derive_key_material, now, Secret};
    use crate::store::memory::MemoryBackend;
    use crate::store::{Backend, BackendKind, SweepReport};

    fn expired_secret() -> Secret {
        let mut s = Secret::new("1 hour", &derive_key_material("p1", "k"), "CIPHERTEXT", 4).unwrap();
        s.expire_date = now() - 1;
        s
    }

    async fn store_with(backend: Arc<MemoryBackend>) -> Store {
        Store::start_with_backend(backend, Duration::from_secs(3600))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_sweeps_immediately_on_start() {
        let backend = Arc::new(MemoryBackend::new());
        backend.put(&expired_secret()).await.unwrap();
        let store = store_with(backend.clone()).await;

        // The first tick of an interval completes at once.
        for _ in 0..50 {
            if backend.is_empty() {
                break;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        assert!(backend.is_empty());
        store.shutdown().await;
    }

    /// Counts sweeps instead of deleting anything.
    #[derive(Default)]
    struct CountingBackend {
        sweeps: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Backend for CountingBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Memory
        }
        async fn get(&self, _id: &str) -> Result<Option<Secret>, StoreError> {
            Ok(None)
        }
        async fn put(&self, _secret: &Secret) -> Result<(), StoreError> {
            Ok(())
        }
        async fn delete(&self, _id: &str) -> Result<(), StoreError> {
            Ok(())
        }
        async fn claim(&self, _id: &str) -> Result<bool, StoreError> {
            Ok(false)
        }
        async fn sweep_expired(&self) -> Result<SweepReport, StoreError> {
            self.sweeps.fetch_add(1, Ordering::SeqCst);
            Ok(SweepReport::default())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeps_every_interval() {
        let backend = Arc::new(CountingBackend::default());
        let store = Store::start_with_backend(backend.clone(), Duration::from_secs(60))
            .await
            .unwrap();

        time::sleep(Duration::from_millis(1)).await;
        assert_eq!(backend.sweeps.load(Ordering::SeqCst), 1);

        time::sleep(Duration::from_secs(60)).await;
        assert_eq!(backend.sweeps.load(Ordering::SeqCst), 2);

        time::sleep(Duration::from_secs(60)).await;
        assert_eq!(backend.sweeps.load(Ordering::SeqCst), 3);

        store.shutdown().await;
        time::sleep(Duration::from_secs(600)).await;
        assert_eq!(backend.sweeps.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_stop_ends_task() {
        let store = Store::open(BackendKind::Memory, &Default::default())
            .await
            .unwrap();
        let cleaner = Cleaner::spawn(store, Duration::from_secs(3600));
        assert!(!cleaner.is_finished());
        time::timeout(Duration::from_secs(5), cleaner.stop())
            .await
            .expect("cleaner did not stop");
    }
}
