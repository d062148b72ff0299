use async_trait::async_trait;
use dashmap::DashMap;

use super::{Backend, BackendKind, SweepReport};
use crate::errors::StoreError;
use crate::models::secret::{now, Secret};

/// Process-local backend. Everything is lost when the process exits.
///
/// The map is shared between request handlers and the cleaner; `DashMap`
/// shards it behind per-bucket locks.
#[derive(Default)]
pub struct MemoryBackend {
    secrets: DashMap<String, Secret>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn get(&self, id: &str) -> Result<Option<Secret>, StoreError> {
        Ok(self.secrets.get(id).map(|entry| entry.value().clone()))
    }

    async fn put(&self, secret: &Secret) -> Result<(), StoreError> {
        if !secret.is_valid_id() {
            return Err(StoreError::InvalidId);
        }
        self.secrets.insert(secret.id.clone(), secret.clone());
        tracing::debug!(id = %secret.id, "memory: secret saved");
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        if self.secrets.remove(id).is_some() {
            tracing::debug!(id = %id, "memory: secret deleted");
        }
        Ok(())
    }

    async fn claim(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.secrets.remove(id).is_some())
    }

    async fn sweep_expired(&self) -> Result<SweepReport, StoreError> {
        let now = now();
        // Counted inside the pass: writers may insert while it runs.
        let mut report = SweepReport::default();
        self.secrets.retain(|_, secret| {
            report.scanned += 1;
            let expired = secret.is_expired_at(now);
            if expired {
                report.deleted += 1;
            }
            !expired
        });
        Ok(report)
    }
}
