//! Artifact persistence: moving built images between the daemon and a
//! backend store.
//!
//! With the `swift` backend images travel as `docker save` archives stored as
//! objects. With `docker_registry` the pushed tag is the reference and nothing
//! is uploaded.

pub mod download;
#[cfg(test)]
pub mod memory;
pub mod swift;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use slipway_common::StorageBackend;

use crate::config::{Config, StorageConfig};
use crate::docker::ContainerRuntime;
use crate::errors::{DockerError, PersistError};
use crate::retry::RetryPolicy;

pub use swift::{BlobStore, SwiftClient};

pub struct ArtifactPersister {
    runtime: Arc<dyn ContainerRuntime>,
    blob: Option<Arc<dyn BlobStore>>,
    storage: StorageConfig,
    retry: RetryPolicy,
}

impl ArtifactPersister {
    pub fn new(
        storage: &StorageConfig,
        retry: RetryPolicy,
        runtime: Arc<dyn ContainerRuntime>,
        blob: Option<Arc<dyn BlobStore>>,
    ) -> Self {
        Self {
            runtime,
            blob,
            storage: storage.clone(),
            retry,
        }
    }

    /// Persister for the configured backend, with a Swift client when needed.
    pub fn from_config(
        config: &Config,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Result<Self, PersistError> {
        let blob: Option<Arc<dyn BlobStore>> = match config.storage.backend {
            StorageBackend::Swift => Some(Arc::new(SwiftClient::new(&config.storage.swift)?)),
            StorageBackend::DockerRegistry => None,
        };
        Ok(Self::new(
            &config.storage,
            config.docker.retry_policy(),
            runtime,
            blob,
        ))
    }

    pub fn backend(&self) -> StorageBackend {
        self.storage.backend
    }

    fn blob(&self) -> Result<&dyn BlobStore, PersistError> {
        self.blob.as_deref().ok_or(PersistError::Unsupported {
            backend: self.storage.backend.as_str(),
            op: "blob access",
        })
    }

    /// Tag an artifact is built under: registry-qualified for registry
    /// backends so it can be pushed as is.
    pub fn image_tag(&self, name: &str) -> String {
        match self.storage.backend {
            StorageBackend::DockerRegistry => {
                format!("{}/{}", self.storage.registry.url.trim_end_matches('/'), name)
            }
            StorageBackend::Swift => name.to_string(),
        }
    }

    /// `docker save` `tag` into `dest` after checking free space.
    pub async fn export(&self, tag: &str, dest: &Path) -> Result<u64, PersistError> {
        let dir = dest.parent().unwrap_or(Path::new("."));
        let available = fs2::available_space(dir).map_err(|source| PersistError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let required = self.storage.min_free_mb.saturating_mul(1024 * 1024);
        if available < required {
            return Err(PersistError::InsufficientSpace {
                path: dir.to_path_buf(),
                available,
                required,
            });
        }
        let size = self
            .retry
            .run(
                |_| self.runtime.save_image(tag, dest),
                DockerError::is_transient,
            )
            .await?;
        tracing::info!(tag, path = %dest.display(), bytes = size, "exported image");
        Ok(size)
    }

    /// Ship an artifact. Swift uploads `local` and returns the object name;
    /// registry backends push the tag and return `None`.
    pub async fn persist(&self, local: &Path, name: &str) -> Result<Option<String>, PersistError> {
        match self.storage.backend {
            StorageBackend::DockerRegistry => {
                let tag = self.image_tag(name);
                self.retry
                    .run(|_| self.runtime.push_image(&tag), DockerError::is_transient)
                    .await?;
                tracing::info!(tag = %tag, "pushed image");
                Ok(None)
            }
            StorageBackend::Swift => {
                let size = std::fs::metadata(local)
                    .map_err(|source| PersistError::Io {
                        path: local.to_path_buf(),
                        source,
                    })?
                    .len();
                let limit = self.storage.max_upload_bytes;
                if size >= limit {
                    return Err(PersistError::TooLarge {
                        path: local.to_path_buf(),
                        size,
                        limit,
                    });
                }
                let blob = self.blob()?;
                let container = &self.storage.swift.container;
                blob.ensure_container(container).await?;
                blob.upload(container, name, local).await?;
                tracing::info!(object = name, bytes = size, "uploaded artifact");
                Ok(Some(name.to_string()))
            }
        }
    }

    /// `docker load` an archive.
    pub async fn restore(&self, src: &Path) -> Result<(), PersistError> {
        self.retry
            .run(|_| self.runtime.load_image(src), DockerError::is_transient)
            .await?;
        Ok(())
    }

    /// Download a stored artifact to `dest`.
    pub async fn fetch(&self, location: &str, dest: &Path) -> Result<u64, PersistError> {
        download::resumable_download(
            self.blob()?,
            &self.storage.swift.container,
            location,
            dest,
            self.storage.download_resumes,
        )
        .await
    }

    /// Delete a stored artifact. Registry images are left to registry GC.
    pub async fn remove(&self, location: &str) -> Result<(), PersistError> {
        match self.storage.backend {
            StorageBackend::Swift => {
                self.blob()?
                    .delete(&self.storage.swift.container, location)
                    .await
            }
            StorageBackend::DockerRegistry => {
                tracing::debug!(location, "registry artifact left in place");
                Ok(())
            }
        }
    }

    /// Time-limited download URL for a stored artifact.
    pub fn temp_url(&self, location: &str) -> Result<String, PersistError> {
        self.blob()?.temp_url(
            &self.storage.swift.container,
            location,
            Duration::from_secs(self.storage.swift.temp_url_ttl_secs),
        )
    }

    /// Publish a finished job log. Returns its location: `<container>/<object>`
    /// in Swift, or the local path for other backends.
    pub async fn publish_log(&self, path: &Path) -> Result<String, PersistError> {
        let Some(blob) = self.blob.as_deref() else {
            return Ok(path.display().to_string());
        };
        let object = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "job.log".to_string());
        let container = &self.storage.swift.logs_container;
        blob.ensure_container(container).await?;
        blob.upload(container, &object, path).await?;
        Ok(format!("{}/{}", container, object))
    }

    /// Remove a log published by [`publish_log`](Self::publish_log).
    pub async fn remove_log(&self, location: &str) -> Result<(), PersistError> {
        let prefix = format!("{}/", self.storage.swift.logs_container);
        if let (Some(blob), Some(object)) = (self.blob.as_deref(), location.strip_prefix(&prefix)) {
            return blob.delete(&self.storage.swift.logs_container, object).await;
        }
        let path = PathBuf::from(location);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(PersistError::Io { path, source }),
        }
    }
}
