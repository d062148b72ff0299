//! Object storage backends (S3 / MinIO and Google Cloud Storage).
//!
//! Each secret is one object, `<bucket_path>/<id>.json`, holding the JSON
//! record. `create_date` and `expire_date` are duplicated into user metadata
//! (`x-amz-meta-*` / `x-goog-meta-*`), and on S3 into object tags as well, so
//! the sweep can decide expiry from a HEAD request instead of downloading
//! every body. Objects written without metadata fall back to a body read.
//!
//! ## Failure handling
//!
//! The HTTP clients carry their own I/O timeouts and request-level retries.
//! On top of that the sweep retries a failed listing with backoff, rebuilds
//! the client once the retry budget is spent, and keeps going past any single
//! object that cannot be inspected or deleted.
//!
//! ## Single-use claims
//!
//! Object stores have no conditional delete, so a one-time secret is claimed
//! by creating `<id>.claim` with a create-only put before the record is
//! deleted. Only one creator wins. The marker is removed afterwards; any left
//! behind by a crash are reclaimed by the sweep.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use object_store::aws::{AmazonS3Builder, S3ConditionalPut};
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::path::Path;
use object_store::{
    Attribute, AttributeValue, Attributes, BackoffConfig, ClientOptions, GetOptions, ObjectMeta,
    ObjectStore, PutMode, PutOptions, PutPayload, RetryConfig, TagSet,
};

use super::retry::{with_retry, RetryPolicy};
use super::schema::ValidatedConfig;
use super::{Backend, BackendKind, SweepReport};
use crate::errors::{ConfigError, StoreError};
use crate::models::secret::{is_expired, is_valid_id, now, Secret};

const EXTENSION: &str = "json";
const CREATE_DATE: &str = "create_date";
const EXPIRE_DATE: &str = "expire_date";
const CLAIM_EXTENSION: &str = "claim";

/// Claim markers older than this belong to a claimant that died.
const STALE_CLAIM_SECS: i64 = 3_600;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Config {
    pub bucket_name: String,
    pub bucket_path: String,
    pub region: String,
    /// Custom endpoint for S3-compatible services such as MinIO.
    pub endpoint: Option<String>,
    /// Static credentials; the environment / instance role is used otherwise.
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub timeout: Duration,
}

impl S3Config {
    pub fn from_validated(config: &ValidatedConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            bucket_name: config.get("bucket_name").trim().to_string(),
            bucket_path: config.get("bucket_path").to_string(),
            region: config.get("region").trim().to_string(),
            endpoint: config.get_opt("endpoint").map(String::from),
            access_key_id: config.get_opt("access_key_id").map(String::from),
            secret_access_key: config.get_opt("secret_access_key").map(String::from),
            timeout: Duration::from_secs(config.parse("timeout_secs")?),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcsConfig {
    pub bucket_name: String,
    pub bucket_path: String,
    /// Informational; the bucket name fully identifies the target.
    pub gcp_project: Option<String>,
    pub service_account_path: Option<String>,
    pub timeout: Duration,
}

impl GcsConfig {
    pub fn from_validated(config: &ValidatedConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            bucket_name: config.get("bucket_name").trim().to_string(),
            bucket_path: config.get("bucket_path").to_string(),
            gcp_project: config.get_opt("gcp_project").map(String::from),
            service_account_path: config.get_opt("service_account_path").map(String::from),
            timeout: Duration::from_secs(config.parse("timeout_secs")?),
        })
    }
}

type Connector = Box<dyn Fn() -> Result<Arc<dyn ObjectStore>, StoreError> + Send + Sync>;

pub struct ObjectBackend {
    kind: BackendKind,
    prefix: Path,
    client: RwLock<Arc<dyn ObjectStore>>,
    connect: Connector,
    retry: RetryPolicy,
}

impl ObjectBackend {
    pub fn s3(config: S3Config) -> Result<Self, StoreError> {
        tracing::info!(
            bucket = %config.bucket_name,
            prefix = %config.bucket_path,
            region = %config.region,
            "configuring S3 backend"
        );
        let prefix = config.bucket_path.clone();
        Self::with_connector(BackendKind::S3, &prefix, RetryPolicy::default(), move || {
            build_s3(&config)
        })
    }

    pub fn gcs(config: GcsConfig) -> Result<Self, StoreError> {
        tracing::info!(
            bucket = %config.bucket_name,
            prefix = %config.bucket_path,
            project = config.gcp_project.as_deref().unwrap_or("-"),
            "configuring GCS backend"
        );
        let prefix = config.bucket_path.clone();
        Self::with_connector(BackendKind::Gcs, &prefix, RetryPolicy::default(), move || {
            build_gcs(&config)
        })
    }

    /// Build a backend around an arbitrary client factory. `connect` is
    /// called now and again whenever the client has to be rebuilt.
    pub fn with_connector(
        kind: BackendKind,
        bucket_path: &str,
        retry: RetryPolicy,
        connect: impl Fn() -> Result<Arc<dyn ObjectStore>, StoreError> + Send + Sync + 'static,
    ) -> Result<Self, StoreError> {
        let client = connect()?;
        Ok(Self {
            kind,
            prefix: Path::from(bucket_path.trim_matches('/')),
            client: RwLock::new(client),
            connect: Box::new(connect),
            retry,
        })
    }

    /// Backend over a fixed client, e.g. `object_store::memory::InMemory`.
    pub fn with_store(
        kind: BackendKind,
        store: Arc<dyn ObjectStore>,
        bucket_path: &str,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            kind,
            prefix: Path::from(bucket_path.trim_matches('/')),
            client: RwLock::new(store.clone()),
            connect: Box::new(move || Ok(store.clone())),
            retry,
        }
    }

    fn client(&self) -> Arc<dyn ObjectStore> {
        self.client
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn reconnect(&self) -> Result<(), StoreError> {
        let fresh = (self.connect)()?;
        *self
            .client
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = fresh;
        Ok(())
    }

    fn object_path(&self, id: &str) -> Path {
        self.prefix.child(format!("{}.{}", id, EXTENSION))
    }

    fn list_prefix(&self) -> Option<&Path> {
        (!self.prefix.as_ref().is_empty()).then_some(&self.prefix)
    }

    /// Secret id for a listed object, if it is a record directly under the
    /// configured prefix.
    fn record_id(&self, location: &Path) -> Option<String> {
        let id = location
            .filename()?
            .strip_suffix(EXTENSION)?
            .strip_suffix('.')?;
        (is_valid_id(id) && self.object_path(id) == *location).then(|| id.to_string())
    }

    fn claim_path(&self, id: &str) -> Path {
        self.prefix.child(format!("{}.{}", id, CLAIM_EXTENSION))
    }

    /// Secret id for a listed claim marker.
    fn claim_id(&self, location: &Path) -> Option<String> {
        let id = location
            .filename()?
            .strip_suffix(CLAIM_EXTENSION)?
            .strip_suffix('.')?;
        (is_valid_id(id) && self.claim_path(id) == *location).then(|| id.to_string())
    }

    /// Create the claim marker. `Some(false)` when another caller holds it,
    /// `None` when the store cannot do create-only puts.
    async fn create_claim_marker(
        &self,
        client: &Arc<dyn ObjectStore>,
        id: &str,
    ) -> Result<Option<bool>, StoreError> {
        let opts = PutOptions {
            mode: PutMode::Create,
            ..Default::default()
        };
        match client
            .put_opts(&self.claim_path(id), PutPayload::default(), opts)
            .await
        {
            Ok(_) => Ok(Some(true)),
            Err(object_store::Error::AlreadyExists { .. })
            | Err(object_store::Error::Precondition { .. }) => Ok(Some(false)),
            Err(object_store::Error::NotImplemented)
            | Err(object_store::Error::NotSupported { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_claim_marker(&self, client: &Arc<dyn ObjectStore>, id: &str) {
        match client.delete(&self.claim_path(id)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
            Err(e) => {
                tracing::warn!(id = %id, error = %e, backend = %self.kind, "could not remove claim marker")
            }
        }
    }

    async fn fetch(
        &self,
        client: &Arc<dyn ObjectStore>,
        id: &str,
    ) -> Result<Option<Secret>, StoreError> {
        let bytes = match client.get(&self.object_path(id)).await {
            Ok(result) => result.bytes().await?,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Secret::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Corrupt {
                id: id.to_string(),
                source,
            })
    }

    /// `(create_date, expire_date)` for an object, from metadata when present
    /// and from the body otherwise. `None` when the object is gone.
    async fn read_dates(
        &self,
        client: &Arc<dyn ObjectStore>,
        id: &str,
    ) -> Result<Option<(i64, i64)>, StoreError> {
        let head = GetOptions {
            head: true,
            ..Default::default()
        };
        match client.get_opts(&self.object_path(id), head).await {
            Ok(result) => {
                if let Some(dates) = dates_from_attributes(&result.attributes) {
                    return Ok(Some(dates));
                }
            }
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        tracing::debug!(id = %id, backend = %self.kind, "no date metadata, reading body");
        Ok(self
            .fetch(client, id)
            .await?
            .map(|secret| (secret.create_date, secret.expire_date)))
    }

    async fn remove(&self, client: &Arc<dyn ObjectStore>, id: &str) -> Result<(), StoreError> {
        match client.delete(&self.object_path(id)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_once(&self) -> Result<Vec<ObjectMeta>, object_store::Error> {
        let client = self.client();
        let listing = client
            .list(self.list_prefix())
            .try_collect::<Vec<_>>()
            .await;
        listing
    }

    async fn list_with_retry(&self) -> Result<Vec<ObjectMeta>, object_store::Error> {
        let what = format!("{} listing", self.kind);
        with_retry(&self.retry, &what, is_transient, move || self.list_once()).await
    }

    /// List all objects under the prefix, reconnecting once if the retries
    /// are exhausted.
    async fn list_records(&self) -> Result<Vec<ObjectMeta>, StoreError> {
        match self.list_with_retry().await {
            Ok(listing) => Ok(listing),
            Err(e) if is_transient(&e) => {
                tracing::error!(backend = %self.kind, error = %e, "connection error while listing, reconnecting");
                self.reconnect()?;
                tracing::info!(backend = %self.kind, "reconnected");
                Ok(self.list_with_retry().await?)
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn build_s3(config: &S3Config) -> Result<Arc<dyn ObjectStore>, StoreError> {
    let mut builder = AmazonS3Builder::from_env()
        .with_bucket_name(&config.bucket_name)
        .with_region(&config.region)
        .with_conditional_put(S3ConditionalPut::ETagMatch)
        .with_client_options(client_options(config.timeout))
        .with_retry(retry_config(config.timeout));

    if let Some(ep) = &config.endpoint {
        builder = builder.with_endpoint(ep).with_allow_http(true);
    }

    if let (Some(key), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
        builder = builder
            .with_access_key_id(key)
            .with_secret_access_key(secret);
    }

    let store = builder
        .build()
        .map_err(|e| StoreError::Start(format!("failed to build S3 client: {}", e)))?;
    Ok(Arc::new(store))
}

fn build_gcs(config: &GcsConfig) -> Result<Arc<dyn ObjectStore>, StoreError> {
    let mut builder = GoogleCloudStorageBuilder::from_env()
        .with_bucket_name(&config.bucket_name)
        .with_client_options(client_options(config.timeout))
        .with_retry(retry_config(config.timeout));

    if let Some(path) = &config.service_account_path {
        builder = builder.with_service_account_path(path);
    }

    let store = builder
        .build()
        .map_err(|e| StoreError::Start(format!("failed to build GCS client: {}", e)))?;
    Ok(Arc::new(store))
}

fn client_options(timeout: Duration) -> ClientOptions {
    ClientOptions::new()
        .with_timeout(timeout)
        .with_connect_timeout(Duration::from_secs(5))
}

fn retry_config(timeout: Duration) -> RetryConfig {
    RetryConfig {
        backoff: BackoffConfig::default(),
        max_retries: 3,
        retry_timeout: timeout * 2,
    }
}

/// Errors worth retrying: everything except answers the service gave on
/// purpose (missing object, precondition, bad request shape).
fn is_transient(e: &object_store::Error) -> bool {
    !matches!(
        e,
        object_store::Error::NotFound { .. }
            | object_store::Error::AlreadyExists { .. }
            | object_store::Error::Precondition { .. }
            | object_store::Error::NotModified { .. }
            | object_store::Error::NotSupported { .. }
            | object_store::Error::NotImplemented
            | object_store::Error::InvalidPath { .. }
            | object_store::Error::UnknownConfigurationKey { .. }
    )
}

fn is_transient_store(e: &StoreError) -> bool {
    match e {
        StoreError::ObjectStore(inner) => is_transient(inner),
        _ => false,
    }
}

fn metadata_key(name: &'static str) -> Attribute {
    Attribute::Metadata(name.into())
}

/// Attributes written alongside every record body.
fn record_attributes(secret: &Secret) -> Attributes {
    let mut attributes = Attributes::new();
    attributes.insert(Attribute::ContentType, "application/json".into());
    attributes.insert(
        metadata_key(CREATE_DATE),
        AttributeValue::from(secret.create_date.to_string()),
    );
    attributes.insert(
        metadata_key(EXPIRE_DATE),
        AttributeValue::from(secret.expire_date.to_string()),
    );
    attributes
}

fn record_tags(secret: &Secret) -> TagSet {
    let mut tags = TagSet::default();
    tags.push(CREATE_DATE, &secret.create_date.to_string());
    tags.push(EXPIRE_DATE, &secret.expire_date.to_string());
    tags
}

fn dates_from_attributes(attributes: &Attributes) -> Option<(i64, i64)> {
    let read = |name: &'static str| -> Option<i64> {
        let value: &str = attributes.get(&metadata_key(name))?.as_ref();
        value.trim().parse().ok()
    };
    Some((read(CREATE_DATE)?, read(EXPIRE_DATE)?))
}

#[async_trait]
impl Backend for ObjectBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    /// Verify the bucket is reachable with the configured credentials.
    async fn start(&self) -> Result<(), StoreError> {
        let client = &self.client();
        let what = format!("{} bucket probe", self.kind);
        let prefix = self.list_prefix();
        with_retry(&self.retry, &what, is_transient, move || {
            client.list_with_delimiter(prefix)
        })
            .await
            .map_err(|e| StoreError::Start(format!("{} bucket is not reachable: {}", self.kind, e)))?;
        tracing::info!(backend = %self.kind, prefix = %self.prefix, "bucket reachable");
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Secret>, StoreError> {
        if !is_valid_id(id) {
            return Ok(None);
        }
        tracing::debug!(id = %id, backend = %self.kind, "reading secret object");
        let client = self.client();
        self.fetch(&client, id).await
    }

    async fn put(&self, secret: &Secret) -> Result<(), StoreError> {
        if !secret.is_valid_id() {
            return Err(StoreError::InvalidId);
        }
        let body = secret.to_vec()?;
        let tags = match self.kind {
            BackendKind::S3 => record_tags(secret),
            _ => TagSet::default(),
        };
        let opts = PutOptions {
            tags,
            attributes: record_attributes(secret),
            ..Default::default()
        };
        self.client()
            .put_opts(&self.object_path(&secret.id), PutPayload::from(body), opts)
            .await?;
        tracing::debug!(id = %secret.id, backend = %self.kind, "secret object saved");
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        if !is_valid_id(id) {
            return Ok(());
        }
        let client = &self.client();
        let what = format!("{} delete", self.kind);
        with_retry(&self.retry, &what, is_transient_store, move || {
            self.remove(client, id)
        })
        .await?;
        tracing::debug!(id = %id, backend = %self.kind, "secret object deleted");
        Ok(())
    }

    async fn claim(&self, id: &str) -> Result<bool, StoreError> {
        if !is_valid_id(id) {
            return Ok(false);
        }
        let client = &self.client();
        let marker = self.create_claim_marker(client, id).await?;
        match marker {
            Some(true) => {}
            Some(false) => {
                tracing::debug!(id = %id, backend = %self.kind, "claim lost");
                return Ok(false);
            }
            None => {
                tracing::warn!(backend = %self.kind, "create-only puts unsupported, claim is not exclusive")
            }
        }

        let claimed = match client.head(&self.object_path(id)).await {
            Ok(_) => self.delete(id).await.map(|()| true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        };
        if marker.is_some() {
            self.remove_claim_marker(client, id).await;
        }
        claimed
    }

    async fn sweep_expired(&self) -> Result<SweepReport, StoreError> {
        let listing = self.list_records().await?;
        let client = &self.client();
        let now = now();
        let mut report = SweepReport::default();

        for meta in listing {
            if let Some(id) = self.claim_id(&meta.location) {
                if now.saturating_sub(meta.last_modified.timestamp()) >= STALE_CLAIM_SECS {
                    tracing::info!(id = %id, backend = %self.kind, "removing stale claim marker");
                    self.remove_claim_marker(client, &id).await;
                }
                continue;
            }
            let Some(owned_id) = self.record_id(&meta.location) else {
                continue;
            };
            let id = owned_id.as_str();
            report.scanned += 1;

            let what = format!("{} metadata read", self.kind);
            let expired = match with_retry(&self.retry, &what, is_transient_store, move || {
                self.read_dates(client, id)
            })
            .await
            {
                Ok(Some((create_date, expire_date))) => is_expired(create_date, expire_date, now),
                Ok(None) => continue,
                Err(StoreError::Corrupt { source, .. }) => {
                    tracing::warn!(id = %id, error = %source, backend = %self.kind, "removing unreadable secret object");
                    true
                }
                Err(e) => {
                    tracing::error!(id = %id, error = %e, backend = %self.kind, "could not read secret dates");
                    report.failed += 1;
                    continue;
                }
            };

            if !expired {
                continue;
            }

            let what = format!("{} delete", self.kind);
            match with_retry(&self.retry, &what, is_transient_store, move || {
                self.remove(client, id)
            })
            .await
            {
                Ok(()) => {
                    tracing::info!(id = %id, backend = %self.kind, "expired secret deleted");
                    report.deleted += 1;
                }
                Err(e) => {
                    tracing::error!(id = %id, error = %e, backend = %self.kind, "could not delete expired secret");
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }
}
