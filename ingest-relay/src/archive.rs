//! Archival of raw upstream pages to object storage.
//!
//! A store hands out a writable target for an [`ArchiveKey`] before the
//! upstream is contacted, so that a broken storage configuration fails the
//! request early. Uploads always overwrite.
use crate::config::{ArchiveConfig, ArchiveStoreType, StorageCredentials};
use async_trait::async_trait;
use bytes::Bytes;
use google_cloud_storage::client::Storage;
use std::fmt;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::OnceCell;

pub const ARCHIVE_NAMESPACE: &str = "open311";
pub const ARCHIVE_CONTENT_TYPE: &str = "application/json";

#[derive(thiserror::Error, Debug)]
pub enum ArchiveError {
    #[error("storage credentials not configured, set {0}")]
    MissingCredentials(String),

    #[error("invalid storage credentials: {0}")]
    InvalidCredentials(String),

    #[error("could not create storage client: {0}")]
    Client(String),

    #[error("invalid archive key: {0}")]
    InvalidKey(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("upload of {key} failed: {reason}")]
    Upload { key: String, reason: String },
}

/// Storage location of one archived page: `open311/{service_code}_{start_date}_{page}.{extension}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArchiveKey(String);

impl ArchiveKey {
    pub fn new(service_code: &str, start_date: &str, page: u32, extension: &str) -> Self {
        ArchiveKey(format!(
            "{ARCHIVE_NAMESPACE}/{service_code}_{start_date}_{page}.{extension}"
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArchiveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[async_trait]
pub trait ArchiveStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Resolves a writable target for `key`. Fails when the store is
    /// misconfigured or unreachable.
    async fn open(&self, key: &ArchiveKey) -> Result<Box<dyn ArchiveObject>, ArchiveError>;
}

#[async_trait]
pub trait ArchiveObject: Send + Sync {
    fn key(&self) -> &ArchiveKey;

    /// Writes `data`, replacing any existing object at the key.
    async fn upload(&self, data: Bytes) -> Result<(), ArchiveError>;
}

/// An archive store together with the extension used for its keys.
#[derive(Clone)]
pub struct Archive {
    store: Arc<dyn ArchiveStore>,
    extension: String,
}

impl Archive {
    pub fn new(store: Arc<dyn ArchiveStore>, extension: impl Into<String>) -> Self {
        Archive {
            store,
            extension: extension.into(),
        }
    }

    pub fn from_config(config: &ArchiveConfig) -> Self {
        let store: Arc<dyn ArchiveStore> = match &config.store {
            ArchiveStoreType::Filesystem {
                base_dir,
                container,
            } => Arc::new(FilesystemArchiveStore::new(base_dir, container)),
            ArchiveStoreType::Gcs {
                bucket,
                credentials_env,
                endpoint,
                credentials,
            } => Arc::new(GcsArchiveStore::new(
                bucket,
                credentials_env,
                endpoint.clone(),
                credentials.clone(),
            )),
        };
        Archive::new(store, &config.extension)
    }

    pub fn store(&self) -> &dyn ArchiveStore {
        self.store.as_ref()
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }
}

/// Writes archived pages to `{base_dir}/{container}/{key}` on local disk.
pub struct FilesystemArchiveStore {
    base_dir: PathBuf,
    container: String,
}

impl FilesystemArchiveStore {
    pub fn new(base_dir: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        FilesystemArchiveStore {
            base_dir: base_dir.into(),
            container: container.into(),
        }
    }

    fn path_for(&self, key: &ArchiveKey) -> Result<PathBuf, ArchiveError> {
        let relative = Path::new(&self.container).join(key.as_str());
        if !relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
        {
            return Err(ArchiveError::InvalidKey(key.to_string()));
        }
        Ok(self.base_dir.join(relative))
    }
}

#[async_trait]
impl ArchiveStore for FilesystemArchiveStore {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    async fn open(&self, key: &ArchiveKey) -> Result<Box<dyn ArchiveObject>, ArchiveError> {
        let path = self.path_for(key)?;
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.base_dir.clone());

        Ok(Box::new(FilesystemObject {
            key: key.clone(),
            dir,
            path,
        }))
    }
}

struct FilesystemObject {
    key: ArchiveKey,
    dir: PathBuf,
    path: PathBuf,
}

impl FilesystemObject {
    /// Writes `data` to a fresh temp file in the target directory, then
    /// renames it over the key. Concurrent writers each rename a complete
    /// file, and the last rename wins.
    fn write_atomic(dir: &Path, path: &Path, data: &[u8]) -> Result<(), ArchiveError> {
        std::fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(data)?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

#[async_trait]
impl ArchiveObject for FilesystemObject {
    fn key(&self) -> &ArchiveKey {
        &self.key
    }

    async fn upload(&self, data: Bytes) -> Result<(), ArchiveError> {
        let size = data.len();
        let dir = self.dir.clone();
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || Self::write_atomic(&dir, &path, &data))
            .await
            .map_err(|e| ArchiveError::Upload {
                key: self.key.to_string(),
                reason: e.to_string(),
            })??;

        tracing::debug!(path = ?self.path, bytes = size, "Stored archive page");
        Ok(())
    }
}

/// Writes archived pages to a Google Cloud Storage bucket.
///
/// The client is built on first use from the configured service account
/// key. A failed build is not cached, so a fixed credential takes effect on
/// the next request without a restart.
pub struct GcsArchiveStore {
    bucket: String,
    credentials_env: String,
    endpoint: Option<String>,
    credentials: Option<StorageCredentials>,
    client: OnceCell<Storage>,
}

impl GcsArchiveStore {
    pub fn new(
        bucket: &str,
        credentials_env: &str,
        endpoint: Option<String>,
        credentials: Option<StorageCredentials>,
    ) -> Self {
        GcsArchiveStore {
            bucket: format!("projects/_/buckets/{bucket}"),
            credentials_env: credentials_env.to_owned(),
            endpoint,
            credentials,
            client: OnceCell::new(),
        }
    }

    async fn client(&self) -> Result<&Storage, ArchiveError> {
        self.client.get_or_try_init(|| self.build_client()).await
    }

    async fn build_client(&self) -> Result<Storage, ArchiveError> {
        let Some(credentials) = &self.credentials else {
            return Err(ArchiveError::MissingCredentials(
                self.credentials_env.clone(),
            ));
        };

        let key: serde_json::Value = serde_json::from_str(credentials.expose())
            .map_err(|e| ArchiveError::InvalidCredentials(e.to_string()))?;
        let credentials = google_cloud_auth::credentials::service_account::Builder::new(key)
            .build()
            .map_err(|e| ArchiveError::InvalidCredentials(e.to_string()))?;

        let mut builder = Storage::builder().with_credentials(credentials);
        if let Some(endpoint) = &self.endpoint {
            builder = builder.with_endpoint(endpoint.clone());
        }

        let client = builder
            .build()
            .await
            .map_err(|e| ArchiveError::Client(e.to_string()))?;

        tracing::info!(bucket = %self.bucket, "Created storage client");
        Ok(client)
    }
}

#[async_trait]
impl ArchiveStore for GcsArchiveStore {
    fn name(&self) -> &'static str {
        "gcs"
    }

    async fn open(&self, key: &ArchiveKey) -> Result<Box<dyn ArchiveObject>, ArchiveError> {
        let client = self.client().await?.clone();
        Ok(Box::new(GcsObject {
            client,
            bucket: self.bucket.clone(),
            key: key.clone(),
        }))
    }
}

struct GcsObject {
    client: Storage,
    bucket: String,
    key: ArchiveKey,
}

#[async_trait]
impl ArchiveObject for GcsObject {
    fn key(&self) -> &ArchiveKey {
        &self.key
    }

    async fn upload(&self, data: Bytes) -> Result<(), ArchiveError> {
        let size = data.len();
        self
            .client
            .write_object(&self.bucket, self.key.as_str(), data)
            .set_content_type(ARCHIVE_CONTENT_TYPE)
            .send_buffered()
            .await
            .map_err(|e| ArchiveError::Upload {
                key: self.key.to_string(),
                reason: e.to_string(),
            })?;

        tracing::debug!(
            bucket = %self.bucket,
            key = %self.key,
            bytes = size,
            "Stored archive page"
        );
        Ok(())
    }
}
