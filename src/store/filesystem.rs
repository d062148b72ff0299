//! Local filesystem backend: one `<id>.json` file per secret.
//!
//! Writes land in a uniquely named temp file in the same directory and are
//! renamed into place, so readers and the sweep never observe a partial
//! record. There is no cross-process locking; ids are never reused, so two
//! writers racing on one id is not a concern.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::fs;
use uuid::Uuid;

use super::schema::ValidatedConfig;
use super::{Backend, BackendKind, SweepReport};
use crate::errors::{ConfigError, StoreError};
use crate::models::secret::{is_valid_id, now, Secret};

const EXTENSION: &str = "json";

/// Temp files older than this are leftovers of a crashed write.
const STALE_TEMP_AGE: Duration = Duration::from_secs(3_600);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilesystemConfig {
    pub path: PathBuf,
}

impl FilesystemConfig {
    pub fn from_validated(config: &ValidatedConfig) -> Result<Self, ConfigError> {
        let path = config.get_opt("path").ok_or_else(|| ConfigError::Invalid {
            key: "path".into(),
            reason: "must not be empty".into(),
        })?;
        Ok(Self {
            path: PathBuf::from(path),
        })
    }
}

pub struct FilesystemBackend {
    dir: PathBuf,
}

impl FilesystemBackend {
    pub fn new(config: FilesystemConfig) -> Self {
        Self { dir: config.path }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", id, EXTENSION))
    }

    async fn read_record(&self, id: &str) -> Result<Option<Secret>, StoreError> {
        let path = self.record_path(id);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Secret::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Corrupt {
                id: id.to_string(),
                source,
            })
    }

    async fn remove_stale_temp(&self, entry: &fs::DirEntry) {
        let age = match entry.metadata().await.and_then(|m| m.modified()) {
            Ok(modified) => SystemTime::now()
                .duration_since(modified)
                .unwrap_or_default(),
            Err(_) => return,
        };
        if age < STALE_TEMP_AGE {
            return;
        }
        match fs::remove_file(entry.path()).await {
            Ok(()) => {
                tracing::info!(file = ?entry.file_name(), "local: removed stale temp file")
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(file = ?entry.file_name(), error = %e, "local: could not remove stale temp file")
            }
        }
    }

    async fn remove_record(&self, id: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.record_path(id)).await {
            Ok(()) => {
                tracing::debug!(id = %id, "local: secret file deleted");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn is_temp_name(file_name: &str) -> bool {
    file_name.starts_with('.') && file_name.ends_with(".tmp")
}

/// Secret id encoded in a directory entry name, if it looks like a record.
fn record_id(file_name: &str) -> Option<&str> {
    let id = file_name.strip_suffix(EXTENSION)?.strip_suffix('.')?;
    is_valid_id(id).then_some(id)
}

#[async_trait]
impl Backend for FilesystemBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Filesystem
    }

    async fn start(&self) -> Result<(), StoreError> {
        if fs::metadata(&self.dir).await.is_err() {
            fs::create_dir_all(&self.dir).await?;
            tracing::info!(path = %self.dir.display(), "created secret directory");
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Secret>, StoreError> {
        if !is_valid_id(id) {
            return Ok(None);
        }
        tracing::debug!(id = %id, "local: reading secret file");
        self.read_record(id).await
    }

    async fn put(&self, secret: &Secret) -> Result<(), StoreError> {
        if !secret.is_valid_id() {
            return Err(StoreError::InvalidId);
        }
        let bytes = secret.to_vec()?;
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", secret.id, Uuid::new_v4().simple()));
        let written = match fs::write(&tmp, &bytes).await {
            Ok(()) => fs::rename(&tmp, self.record_path(&secret.id)).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        tracing::debug!(id = %secret.id, "local: secret file saved");
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        if !is_valid_id(id) {
            return Ok(());
        }
        self.remove_record(id).await
    }

    async fn claim(&self, id: &str) -> Result<bool, StoreError> {
        if !is_valid_id(id) {
            return Ok(false);
        }
        // unlink succeeds for exactly one caller.
        match fs::remove_file(self.record_path(id)).await {
            Ok(()) => {
                tracing::debug!(id = %id, "local: secret file claimed");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn sweep_expired(&self) -> Result<SweepReport, StoreError> {
        let now = now();
        let mut report = SweepReport::default();
        let mut entries = fs::read_dir(&self.dir).await?;

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "local: directory listing interrupted");
                    report.failed += 1;
                    break;
                }
            };
            let file_name = entry.file_name();
            if file_name.to_str().is_some_and(is_temp_name) {
                self.remove_stale_temp(&entry).await;
                continue;
            }
            let Some(id) = file_name.to_str().and_then(record_id) else {
                continue;
            };
            report.scanned += 1;

            let expired = match self.read_record(id).await {
                Ok(Some(secret)) => secret.is_expired_at(now),
                // Removed concurrently.
                Ok(None) => continue,
                Err(StoreError::Corrupt { source, .. }) => {
                    tracing::warn!(id = %id, error = %source, "local: removing unreadable secret file");
                    true
                }
                Err(e) => {
                    tracing::error!(id = %id, error = %e, "local: could not read secret file");
                    report.failed += 1;
                    continue;
                }
            };

            if expired {
                match self.remove_record(id).await {
                    Ok(()) => report.deleted += 1,
                    Err(e) => {
                        tracing::error!(id = %id, error = %e, "local: could not delete secret file");
                        report.failed += 1;
                    }
                }
            }
        }

        Ok(report)
    }
}
