//! Secret service: create, retrieve and revoke secrets on top of a [`Store`].
//!
//! Passwords never reach storage. Each one is prefixed with the server
//! secret and bcrypt-hashed; the hash is the only verifier kept. bcrypt is
//! deliberately slow, so hashing and verification run on the blocking pool.

use std::sync::Arc;

use zeroize::Zeroizing;

use crate::errors::StoreError;
use crate::middleware::metrics::{self, RetrievalOutcome};
use crate::models::secret::{derive_key_material, Secret};
use crate::store::Store;

/// Result of a retrieval request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Retrieval {
    /// The stored ciphertext, exactly as submitted.
    Data(String),
    InvalidId,
    InvalidPassword,
}

/// Result of a revocation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Revocation {
    Deleted,
    InvalidId,
    InvalidPassword,
}

enum Denied {
    InvalidId,
    InvalidPassword,
}

#[derive(Clone)]
pub struct SecretService {
    store: Store,
    server_secret: Arc<Zeroizing<String>>,
    cost: u32,
}

impl SecretService {
    pub fn new(store: Store, server_secret: impl Into<String>, cost: u32) -> Self {
        Self {
            store,
            server_secret: Arc::new(Zeroizing::new(server_secret.into())),
            cost,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Create and persist a secret. Returns its id.
    pub async fn create(
        &self,
        label: &str,
        password: &str,
        ciphertext: String,
    ) -> Result<String, StoreError> {
        let key = derive_key_material(password, &self.server_secret);
        let label = label.to_string();
        let cost = self.cost;
        let secret =
            tokio::task::spawn_blocking(move || Secret::new(&label, &key, ciphertext, cost))
                .await??;

        self.store.set_secret(&secret).await?;
        metrics::record_created(secret.is_one_time());
        tracing::info!(
            id = %secret.id,
            expire_date = secret.expire_date,
            "secret created"
        );
        Ok(secret.id)
    }

    /// Return the ciphertext if `password` matches. One-time secrets are
    /// claimed before the ciphertext is released: only the request that
    /// removes the record gets it, and a failed removal withholds it.
    pub async fn retrieve(&self, id: &str, password: &str) -> Result<Retrieval, StoreError> {
        let secret = match self.authenticate(id, password).await? {
            Ok(secret) => secret,
            Err(Denied::InvalidId) => {
                metrics::record_retrieval(RetrievalOutcome::InvalidId);
                tracing::info!("retrieval: invalid secret id");
                return Ok(Retrieval::InvalidId);
            }
            Err(Denied::InvalidPassword) => {
                metrics::record_retrieval(RetrievalOutcome::InvalidPassword);
                tracing::info!(id = %id, "retrieval: invalid password");
                return Ok(Retrieval::InvalidPassword);
            }
        };

        if secret.is_one_time() && !self.store.claim_secret(&secret.id).await? {
            metrics::record_retrieval(RetrievalOutcome::InvalidId);
            tracing::info!(id = %secret.id, "retrieval: one-time secret already consumed");
            return Ok(Retrieval::InvalidId);
        }

        metrics::record_retrieval(RetrievalOutcome::Retrieved);
        tracing::info!(id = %secret.id, one_time = secret.is_one_time(), "secret retrieved");
        Ok(Retrieval::Data(secret.data))
    }

    /// Delete a secret ahead of its expiry. Requires the password.
    pub async fn revoke(&self, id: &str, password: &str) -> Result<Revocation, StoreError> {
        match self.authenticate(id, password).await? {
            Ok(secret) => {
                self.store.delete_secret(&secret.id).await?;
                tracing::info!(id = %secret.id, "secret revoked");
                Ok(Revocation::Deleted)
            }
            Err(Denied::InvalidId) => Ok(Revocation::InvalidId),
            Err(Denied::InvalidPassword) => {
                tracing::info!(id = %id, "revocation: invalid password");
                Ok(Revocation::InvalidPassword)
            }
        }
    }

    async fn authenticate(
        &self,
        id: &str,
        password: &str,
    ) -> Result<Result<Secret, Denied>, StoreError> {
        let Some(secret) = self.store.get_secret(id).await else {
            return Ok(Err(Denied::InvalidId));
        };

        let key = derive_key_material(password, &self.server_secret);
        let (secret, ok) = tokio::task::spawn_blocking(move || {
            let ok = secret.check_password(&key);
            (secret, ok)
        })
        .await?;

        Ok(if ok {
            Ok(secret)
        } else {
            Err(Denied::InvalidPassword)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::secret::{is_valid_id, ONE_TIME};
    use crate::store::BackendKind;

    async fn service() -> SecretService {
        let store = Store::open(BackendKind::Memory, &Default::default())
            .await
            .unwrap();
        SecretService::new(store, "server-secret", 4)
    }

    #[tokio::test]
    async fn test_create_then_retrieve() {
        let svc = service().await;
        let id = svc.create("1 hour", "p1", "CIPHERTEXT".into()).await.unwrap();
        assert!(is_valid_id(&id));

        assert_eq!(svc.retrieve(&id, "wrong").await.unwrap(), Retrieval::InvalidPassword);
        assert_eq!(
            svc.retrieve(&id, "p1").await.unwrap(),
            Retrieval::Data("CIPHERTEXT".into())
        );
        // Timed secrets survive retrieval.
        assert_eq!(
            svc.retrieve(&id, "p1").await.unwrap(),
            Retrieval::Data("CIPHERTEXT".into())
        );
    }

    #[tokio::test]
    async fn test_one_time_secret_is_consumed() {
        let svc = service().await;
        let id = svc.create("", "p1", "ONCE".into()).await.unwrap();
        let stored = svc.store().get_secret(&id).await.unwrap();
        assert_eq!(stored.expire_date, ONE_TIME);

        // A wrong password does not consume it.
        assert_eq!(svc.retrieve(&id, "nope").await.unwrap(), Retrieval::InvalidPassword);
        assert_eq!(svc.retrieve(&id, "p1").await.unwrap(), Retrieval::Data("ONCE".into()));
        assert_eq!(svc.retrieve(&id, "p1").await.unwrap(), Retrieval::InvalidId);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_retrievals_release_one_time_secret_once() {
        let svc = service().await;
        for _ in 0..10 {
            let id = svc.create("", "p1", "ONCE".into()).await.unwrap();
            let attempts: Vec<_> = (0..4)
                .map(|_| {
                    let svc = svc.clone();
                    let id = id.clone();
                    tokio::spawn(async move { svc.retrieve(&id, "p1").await.unwrap() })
                })
                .collect();

            let mut served = 0;
            for attempt in attempts {
                match attempt.await.unwrap() {
                    Retrieval::Data(data) => {
                        assert_eq!(data, "ONCE");
                        served += 1;
                    }
                    other => assert_eq!(other, Retrieval::InvalidId),
                }
            }
            assert_eq!(served, 1);
            assert!(svc.store().get_secret(&id).await.is_none());
        }
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_ids() {
        let svc = service().await;
        assert_eq!(
            svc.retrieve(&"a".repeat(40), "p1").await.unwrap(),
            Retrieval::InvalidId
        );
        assert_eq!(svc.retrieve("../x", "p1").await.unwrap(), Retrieval::InvalidId);
    }

    #[tokio::test]
    async fn test_server_secret_is_part_of_the_key() {
        let svc = service().await;
        let id = svc.create("1 day", "p1", "X".into()).await.unwrap();
        let other = SecretService::new(svc.store().clone(), "another-secret", 4);
        assert_eq!(other.retrieve(&id, "p1").await.unwrap(), Retrieval::InvalidPassword);
    }

    #[tokio::test]
    async fn test_revoke() {
        let svc = service().await;
        let id = svc.create("1 week", "p1", "X".into()).await.unwrap();
        assert_eq!(svc.revoke(&id, "bad").await.unwrap(), Revocation::InvalidPassword);
        assert_eq!(svc.revoke(&id, "p1").await.unwrap(), Revocation::Deleted);
        assert_eq!(svc.revoke(&id, "p1").await.unwrap(), Revocation::InvalidId);
        assert_eq!(svc.retrieve(&id, "p1").await.unwrap(), Retrieval::InvalidId);
    }
}
