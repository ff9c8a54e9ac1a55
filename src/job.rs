//! Scoped ownership of everything a job creates.
//!
//! A [`BuildJob`] records containers, images and directories in acquisition
//! order and releases them in reverse when [`BuildJob::close`] runs, whether
//! the job succeeded or not.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::docker::{ContainerOutcome, ContainerRuntime, ContainerSpec};
use crate::errors::DockerError;
use crate::workdir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    Container(String),
    Image(String),
    Dir(PathBuf),
}

pub struct BuildJob {
    id: String,
    runtime: Arc<dyn ContainerRuntime>,
    cleanup_image: String,
    resources: Vec<Resource>,
    closed: bool,
}

impl BuildJob {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, cleanup_image: &str) -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        Self {
            id: id[..12].to_string(),
            runtime,
            cleanup_image: cleanup_image.to_string(),
            resources: Vec::new(),
            closed: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn runtime(&self) -> &dyn ContainerRuntime {
        self.runtime.as_ref()
    }

    pub fn cleanup_image(&self) -> &str {
        &self.cleanup_image
    }

    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    pub fn track(&mut self, resource: Resource) {
        if !self.resources.contains(&resource) {
            self.resources.push(resource);
        }
    }

    pub fn track_image(&mut self, tag: &str) {
        self.track(Resource::Image(tag.to_string()));
    }

    pub fn track_dir(&mut self, path: &Path) {
        self.track(Resource::Dir(path.to_path_buf()));
    }

    /// Stop tracking an image so it outlives the job. Returns whether it was
    /// tracked.
    pub fn release_image(&mut self, tag: &str) -> bool {
        let before = self.resources.len();
        self.resources
            .retain(|r| !matches!(r, Resource::Image(t) if t == tag));
        before != self.resources.len()
    }

    /// Create, run and remove a container. The container is tracked while it
    /// exists so an abandoned run is still cleaned up on close.
    pub async fn run_container(
        &mut self,
        spec: &ContainerSpec,
        timeout: Duration,
    ) -> Result<ContainerOutcome, DockerError> {
        let id = self.runtime.create_container(spec).await?;
        self.track(Resource::Container(id.clone()));
        let outcome = self.runtime.start_and_wait(&id, timeout).await;
        match self.runtime.remove_container(&id).await {
            Ok(()) => self.resources.retain(|r| r != &Resource::Container(id.clone())),
            Err(e) => tracing::warn!(container = %id, error = %e, "container removal deferred to job close"),
        }
        outcome
    }

    /// Release every tracked resource, newest first. Failures are logged and
    /// returned; they never stop the remaining releases.
    pub async fn close(mut self) -> Vec<String> {
        self.closed = true;
        let mut failures = Vec::new();
        while let Some(resource) = self.resources.pop() {
            let result = match &resource {
                Resource::Container(id) => self.runtime.remove_container(id).await,
                Resource::Image(tag) => self.runtime.remove_image(tag).await,
                Resource::Dir(path) => {
                    workdir::remove_tree(self.runtime.as_ref(), &self.cleanup_image, path).await
                }
            };
            match result {
                Ok(()) => tracing::debug!(job = %self.id, ?resource, "released"),
                Err(e) => {
                    tracing::warn!(job = %self.id, ?resource, error = %e, "release failed");
                    failures.push(format!("{:?}: {}", resource, e));
                }
            }
        }
        failures
    }
}

impl Drop for BuildJob {
    fn drop(&mut self) {
        if !self.closed && !self.resources.is_empty() {
            tracing::error!(
                job = %self.id,
                leaked = self.resources.len(),
                "build job dropped without close; resources leaked"
            );
        }
    }
}
