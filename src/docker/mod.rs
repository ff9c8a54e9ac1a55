//! Container daemon seam.
//!
//! Everything the pipeline asks of the daemon goes through [`ContainerRuntime`].
//! The bollard-backed implementation lives in [`engine`]; tests use the
//! scripted runtime in `fake`.

pub mod engine;
#[cfg(test)]
pub mod fake;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use crate::errors::DockerError;

pub use engine::DockerEngine;

/// Where the builder gets its Dockerfile and context from.
#[derive(Debug, Clone, PartialEq)]
pub enum BuildContext {
    /// A directory sent as the build context, with the Dockerfile inside it.
    Dir { path: PathBuf, dockerfile: String },
    /// A Dockerfile with no other context files.
    Inline(String),
}

#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub tag: String,
    pub context: BuildContext,
    pub nocache: bool,
    /// Memory ceiling in bytes; `None` leaves the daemon default.
    pub memory: Option<u64>,
}

/// Builder stream as seen by the caller.
#[derive(Debug, Clone, Default)]
pub struct BuildOutput {
    pub lines: Vec<String>,
    /// First error the builder reported, if any.
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub entrypoint: Option<Vec<String>>,
    /// `uid:gid` to run as.
    pub user: Option<String>,
    pub env: Vec<String>,
    /// `host:container[:mode]` bind mounts.
    pub binds: Vec<String>,
    pub working_dir: Option<String>,
    pub memory: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Code(i64),
    /// Killed with SIGKILL after the deadline.
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct ContainerOutcome {
    pub exit: ExitStatus,
    /// Interleaved stdout and stderr.
    pub output: String,
}

impl ContainerOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit == ExitStatus::Code(0)
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn build_image(&self, req: &BuildRequest) -> Result<BuildOutput, DockerError>;

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, DockerError>;

    /// Start a created container and wait for it, killing it at `timeout`.
    async fn start_and_wait(
        &self,
        id: &str,
        timeout: Duration,
    ) -> Result<ContainerOutcome, DockerError>;

    /// Force-remove a container; a missing container is not an error.
    async fn remove_container(&self, id: &str) -> Result<(), DockerError>;

    /// Write `docker save` output for `tag` to `dest`; returns bytes written.
    async fn save_image(&self, tag: &str, dest: &Path) -> Result<u64, DockerError>;

    async fn load_image(&self, src: &Path) -> Result<(), DockerError>;

    async fn push_image(&self, tag: &str) -> Result<(), DockerError>;

    async fn image_exists(&self, tag: &str) -> Result<bool, DockerError>;

    /// Force-remove an image; a missing image is not an error.
    async fn remove_image(&self, tag: &str) -> Result<(), DockerError>;
}

/// Create, run and always remove a container.
pub async fn run_once(
    runtime: &dyn ContainerRuntime,
    spec: &ContainerSpec,
    timeout: Duration,
) -> Result<ContainerOutcome, DockerError> {
    let id = runtime.create_container(spec).await?;
    let outcome = runtime.start_and_wait(&id, timeout).await;
    if let Err(e) = runtime.remove_container(&id).await {
        tracing::warn!(container = %id, error = %e, "failed to remove container");
    }
    outcome
}

/// Container name unique to this process and call.
pub fn unique_name(prefix: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, &id[..12])
}

/// Quote `s` for a POSIX shell command line.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:@=".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}
