//! Pluggable persistence for secrets.
//!
//! Supports four backends, selected by `storage_class`:
//!   - `memory`: process-local map, for tests and ephemeral deployments.
//!   - `local`: one JSON file per secret in a directory.
//!   - `s3`: S3 (or MinIO) objects, dates carried as metadata and tags.
//!   - `gcs`: Google Cloud Storage objects, dates carried as metadata.
//!
//! ## Configuration
//!
//! ```yaml
//! storage_class: s3
//! storage_config:
//!   bucket_name: my-bucket
//!   bucket_path: whisper
//!   region: eu-west-1
//! storage_clean_interval: 900
//! ```
//!
//! The legacy dotted names (`whisper.storage.aws.s3`, ...) are accepted too;
//! only the last segment is significant.
//!
//! The [`Store`] facade validates the backend configuration, collapses every
//! read failure into "not found", and owns the background [`Cleaner`].

pub mod filesystem;
pub mod memory;
pub mod object;
pub mod retry;
pub mod schema;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::errors::{ConfigError, StoreError};
use crate::jobs::cleaner::Cleaner;
use crate::models::secret::{is_valid_id, Secret};

use schema::{ConfigOption, ConfigSchema, ValidatedConfig};

/// Outcome of one pass over a backend's records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Records examined.
    pub scanned: usize,
    /// Records removed because they were expired (or unreadable).
    pub deleted: usize,
    /// Records whose inspection or deletion failed; retried next sweep.
    pub failed: usize,
}

/// Contract every storage medium satisfies.
///
/// `get` distinguishes "absent" (`Ok(None)`) from corrupt records and
/// transient failures (`Err`) so the facade can log them apart; callers of
/// [`Store`] only ever see `None`.
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Open connections, create directories, probe buckets.
    async fn start(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Secret>, StoreError>;

    /// Persist `secret`, overwriting any record with the same id.
    async fn put(&self, secret: &Secret) -> Result<(), StoreError>;

    /// Remove a record. Removing an absent record succeeds.
    async fn delete(&self, id: &str) -> Result<(), StoreError>;

    /// Remove a record and report whether this call is the one that removed
    /// it. Of several concurrent claims on one id at most one sees `true`.
    async fn claim(&self, id: &str) -> Result<bool, StoreError>;

    /// Delete every expired record. Individual failures are counted in the
    /// report; `Err` means the records could not be enumerated at all.
    async fn sweep_expired(&self) -> Result<SweepReport, StoreError>;
}

/// Static registry of available backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Memory,
    Filesystem,
    S3,
    Gcs,
}

const MEMORY_SCHEMA: ConfigSchema = &[];

const FILESYSTEM_SCHEMA: ConfigSchema = &[ConfigOption::optional("path", "/tmp/whisper")];

const S3_SCHEMA: ConfigSchema = &[
    ConfigOption::required("bucket_name"),
    ConfigOption::optional("bucket_path", ""),
    ConfigOption::optional("region", "us-east-1"),
    ConfigOption::optional("endpoint", ""),
    ConfigOption::optional("access_key_id", ""),
    ConfigOption::optional("secret_access_key", ""),
    ConfigOption::optional("timeout_secs", "30"),
];

const GCS_SCHEMA: ConfigSchema = &[
    ConfigOption::required("bucket_name"),
    ConfigOption::optional("bucket_path", ""),
    ConfigOption::optional("gcp_project", ""),
    ConfigOption::optional("service_account_path", ""),
    ConfigOption::optional("timeout_secs", "30"),
];

impl BackendKind {
    pub const ALL: [BackendKind; 4] = [
        BackendKind::Memory,
        BackendKind::Filesystem,
        BackendKind::S3,
        BackendKind::Gcs,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Memory => "memory",
            BackendKind::Filesystem => "local",
            BackendKind::S3 => "s3",
            BackendKind::Gcs => "gcs",
        }
    }

    /// Options this backend accepts, with defaults for the optional ones.
    pub fn schema(self) -> ConfigSchema {
        match self {
            BackendKind::Memory => MEMORY_SCHEMA,
            BackendKind::Filesystem => FILESYSTEM_SCHEMA,
            BackendKind::S3 => S3_SCHEMA,
            BackendKind::Gcs => GCS_SCHEMA,
        }
    }

    /// Construct the backend from validated configuration. Does not perform
    /// any I/O; see [`Backend::start`].
    pub fn build(self, config: &ValidatedConfig) -> Result<Arc<dyn Backend>, StoreError> {
        let backend: Arc<dyn Backend> = match self {
            BackendKind::Memory => Arc::new(memory::MemoryBackend::new()),
            BackendKind::Filesystem => Arc::new(filesystem::FilesystemBackend::new(
                filesystem::FilesystemConfig::from_validated(config)?,
            )),
            BackendKind::S3 => Arc::new(object::ObjectBackend::s3(
                object::S3Config::from_validated(config)?,
            )?),
            BackendKind::Gcs => Arc::new(object::ObjectBackend::gcs(
                object::GcsConfig::from_validated(config)?,
            )?),
        };
        Ok(backend)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().rsplit('.').next().unwrap_or_default();
        match name.to_ascii_lowercase().as_str() {
            "memory" => Ok(BackendKind::Memory),
            "local" | "filesystem" => Ok(BackendKind::Filesystem),
            "s3" | "aws" => Ok(BackendKind::S3),
            "gcs" | "gcp" => Ok(BackendKind::Gcs),
            _ => Err(ConfigError::UnknownBackend(s.to_string())),
        }
    }
}

fn check_sweep_interval(sweep_interval: Duration) -> Result<(), ConfigError> {
    if sweep_interval.is_zero() {
        return Err(ConfigError::Invalid {
            key: "storage_clean_interval".into(),
            reason: "must be greater than zero".into(),
        });
    }
    Ok(())
}

/// Backend-agnostic facade used by request handlers and the cleaner.
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn Backend>,
    cleaner: Arc<Mutex<Option<Cleaner>>>,
}

impl Store {
    /// Resolve, validate and start a backend, then spawn its cleaner.
    pub async fn start(
        kind: BackendKind,
        storage_config: &BTreeMap<String, String>,
        sweep_interval: Duration,
    ) -> Result<Self, StoreError> {
        check_sweep_interval(sweep_interval)?;
        let store = Self::open(kind, storage_config).await?;
        store.spawn_cleaner(sweep_interval).await;
        Ok(store)
    }

    /// Like [`Store::start`] but without a cleaner; used by one-shot commands.
    pub async fn open(
        kind: BackendKind,
        storage_config: &BTreeMap<String, String>,
    ) -> Result<Self, StoreError> {
        let config = ValidatedConfig::validate(kind.schema(), storage_config)?;
        let backend = kind.build(&config)?;
        Self::open_backend(backend).await
    }

    /// Start an already constructed backend and spawn its cleaner.
    pub async fn start_with_backend(
        backend: Arc<dyn Backend>,
        sweep_interval: Duration,
    ) -> Result<Self, StoreError> {
        check_sweep_interval(sweep_interval)?;
        let store = Self::open_backend(backend).await?;
        store.spawn_cleaner(sweep_interval).await;
        Ok(store)
    }

    async fn open_backend(backend: Arc<dyn Backend>) -> Result<Self, StoreError> {
        backend.start().await?;
        tracing::info!(backend = %backend.kind(), "store started");
        Ok(Self {
            backend,
            cleaner: Arc::new(Mutex::new(None)),
        })
    }

    async fn spawn_cleaner(&self, sweep_interval: Duration) {
        let mut slot = self.cleaner.lock().await;
        if slot.is_none() {
            *slot = Some(Cleaner::spawn(self.clone(), sweep_interval));
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Fetch a secret. Malformed ids, missing, expired and corrupt records
    /// all come back as `None`.
    pub async fn get_secret(&self, id: &str) -> Option<Secret> {
        if !is_valid_id(id) {
            tracing::debug!("get_secret: rejected malformed id");
            return None;
        }

        let secret = match self.backend.get(id).await {
            Ok(Some(secret)) => secret,
            Ok(None) => {
                tracing::debug!(id = %id, "secret not found");
                return None;
            }
            Err(StoreError::Corrupt { id, source }) => {
                tracing::error!(id = %id, error = %source, "corrupt secret record");
                return None;
            }
            Err(e) => {
                tracing::error!(id = %id, error = %e, "backend read failed");
                return None;
            }
        };

        if secret.id != id || !secret.is_valid_id() {
            tracing::error!(id = %id, "stored record carries a different id");
            return None;
        }

        if secret.is_expired() {
            tracing::debug!(id = %id, "secret expired, evicting");
            if let Err(e) = self.backend.delete(id).await {
                tracing::warn!(id = %id, error = %e, "lazy eviction failed");
            }
            return None;
        }

        Some(secret)
    }

    pub async fn set_secret(&self, secret: &Secret) -> Result<(), StoreError> {
        if !secret.is_valid_id() {
            tracing::warn!("set_secret: refusing secret without a valid id");
            return Err(StoreError::InvalidId);
        }
        self.backend.put(secret).await?;
        tracing::info!(id = %secret.id, one_time = secret.is_one_time(), "secret stored");
        Ok(())
    }

    /// Delete a secret. Absent and malformed ids succeed without touching
    /// the backend.
    pub async fn delete_secret(&self, id: &str) -> Result<(), StoreError> {
        if !is_valid_id(id) {
            tracing::debug!("delete_secret: ignoring malformed id");
            return Ok(());
        }
        self.backend.delete(id).await?;
        tracing::info!(id = %id, "secret deleted");
        Ok(())
    }

    /// Take a secret out of the store for single use. `Ok(true)` means this
    /// caller removed it and may serve it; `Ok(false)` means another caller
    /// got there first or it was never there.
    pub async fn claim_secret(&self, id: &str) -> Result<bool, StoreError> {
        if !is_valid_id(id) {
            return Ok(false);
        }
        let claimed = self.backend.claim(id).await?;
        if claimed {
            tracing::info!(id = %id, "secret claimed");
        } else {
            tracing::info!(id = %id, "secret already claimed");
        }
        Ok(claimed)
    }

    /// Run one sweep. Never fails: enumeration errors are logged and reported
    /// as a single failure.
    pub async fn delete_expired(&self) -> SweepReport {
        match self.backend.sweep_expired().await {
            Ok(report) => {
                crate::middleware::metrics::record_sweep(&report);
                if report.deleted > 0 || report.failed > 0 {
                    tracing::info!(
                        backend = %self.kind(),
                        scanned = report.scanned,
                        deleted = report.deleted,
                        failed = report.failed,
                        "expired secrets swept"
                    );
                } else {
                    tracing::debug!(backend = %self.kind(), scanned = report.scanned, "nothing to sweep");
                }
                report
            }
            Err(e) => {
                tracing::error!(backend = %self.kind(), error = %e, "sweep failed");
                let report = SweepReport {
                    failed: 1,
                    ..Default::default()
                };
                crate::middleware::metrics::record_sweep(&report);
                report
            }
        }
    }

    /// Stop the cleaner and wait for it to finish its current pass.
    pub async fn shutdown(&self) {
        let cleaner = self.cleaner.lock().await.take();
        if let Some(cleaner) = cleaner {
            cleaner.stop().await;
        }
    }

    pub async fn has_cleaner(&self) -> bool {
        self.cleaner.lock().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::secret::{derive_key_material, ONE_TIME};

    fn memory_config() -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    fn secret(label: &str) -> Secret {
        Secret::new(label, &derive_key_material("p1", "k"), "CIPHERTEXT", 4).unwrap()
    }

    #[test]
    fn test_backend_kind_names() {
        for kind in BackendKind::ALL {
            assert_eq!(kind.as_str().parse::<BackendKind>().unwrap(), kind);
        }
        assert_eq!(
            "whisper.storage.aws.s3".parse::<BackendKind>().unwrap(),
            BackendKind::S3
        );
        assert_eq!(
            "whisper.storage.gcp.gcs".parse::<BackendKind>().unwrap(),
            BackendKind::Gcs
        );
        assert_eq!(
            "whisper.storage.local.local".parse::<BackendKind>().unwrap(),
            BackendKind::Filesystem
        );
        assert!(matches!(
            "redis".parse::<BackendKind>(),
            Err(ConfigError::UnknownBackend(_))
        ));
    }

    #[test]
    fn test_object_backends_require_bucket() {
        for kind in [BackendKind::S3, BackendKind::Gcs] {
            let err = ValidatedConfig::validate(kind.schema(), &BTreeMap::new()).unwrap_err();
            assert_eq!(err, ConfigError::Missing("bucket_name".into()));
        }
    }

    #[tokio::test]
    async fn test_start_rejects_unknown_option() {
        let mut cfg = memory_config();
        cfg.insert("path".into(), "/tmp".into());
        let err = Store::start(BackendKind::Memory, &cfg, Duration::from_secs(900))
            .await
            .err()
            .expect("unknown option must fail");
        assert!(matches!(err, StoreError::Config(ConfigError::Unknown(k)) if k == "path"));
    }

    #[tokio::test]
    async fn test_start_rejects_missing_option() {
        let err = Store::start(BackendKind::S3, &BTreeMap::new(), Duration::from_secs(900))
            .await
            .err()
            .expect("missing bucket must fail");
        assert!(matches!(
            err,
            StoreError::Config(ConfigError::Missing(k)) if k == "bucket_name"
        ));
    }

    #[tokio::test]
    async fn test_facade_round_trip() {
        let store = Store::open(BackendKind::Memory, &memory_config())
            .await
            .unwrap();
        let s = secret("1 day");
        store.set_secret(&s).await.unwrap();
        assert_eq!(store.get_secret(&s.id).await, Some(s.clone()));
        store.delete_secret(&s.id).await.unwrap();
        assert_eq!(store.get_secret(&s.id).await, None);
        store.delete_secret(&s.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_ids_never_reach_backend() {
        let store = Store::open(BackendKind::Memory, &memory_config())
            .await
            .unwrap();
        assert_eq!(store.get_secret("../etc/passwd").await, None);
        assert_eq!(store.get_secret("").await, None);
        assert!(store.delete_secret("not-an-id").await.is_ok());

        let mut s = secret("1 day");
        s.id = "short".into();
        assert!(matches!(store.set_secret(&s).await, Err(StoreError::InvalidId)));
    }

    #[tokio::test]
    async fn test_expired_secret_is_not_served() {
        let store = Store::open(BackendKind::Memory, &memory_config())
            .await
            .unwrap();
        let mut s = secret("1 hour");
        s.create_date -= 7_200;
        s.expire_date = s.create_date + 3_600;
        store.set_secret(&s).await.unwrap();
        assert_eq!(store.get_secret(&s.id).await, None);

        let mut one_time = secret("");
        assert_eq!(one_time.expire_date, ONE_TIME);
        one_time.create_date -= 31 * 86_400;
        store.set_secret(&one_time).await.unwrap();
        assert_eq!(store.get_secret(&one_time.id).await, None);
    }

    #[tokio::test]
    async fn test_start_spawns_single_cleaner() {
        let store = Store::start(BackendKind::Memory, &memory_config(), Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(store.has_cleaner().await);
        store.spawn_cleaner(Duration::from_secs(1)).await;
        store.shutdown().await;
        assert!(!store.has_cleaner().await);
        // Idempotent.
        store.shutdown().await;
    }

    #[tokio::test]
    async fn test_zero_sweep_interval_rejected() {
        for result in [
            Store::start(BackendKind::Memory, &memory_config(), Duration::ZERO).await,
            Store::start_with_backend(Arc::new(memory::MemoryBackend::new()), Duration::ZERO)
                .await,
        ] {
            let err = result.err().expect("zero interval must fail");
            assert!(matches!(
                err,
                StoreError::Config(ConfigError::Invalid { ref key, .. }) if key == "storage_clean_interval"
            ));
        }
    }

    #[tokio::test]
    async fn test_claim_secret() {
        let store = Store::open(BackendKind::Memory, &memory_config())
            .await
            .unwrap();
        let s = secret("");
        store.set_secret(&s).await.unwrap();
        assert!(store.claim_secret(&s.id).await.unwrap());
        assert!(!store.claim_secret(&s.id).await.unwrap());
        assert!(store.get_secret(&s.id).await.is_none());
        assert!(!store.claim_secret("../x").await.unwrap());
    }
}
