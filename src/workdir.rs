//! Per-job working directories.
//!
//! Layout: `<work_dir>/<tenant>/<resource-uuid>-<job-id>`, holding the build
//! context (`src/`, with the checkout in `src/code`) apart from image archives
//! (`artifacts/`) so archives never reach the builder. Checkouts are
//! written by containers running as other users, so removal happens inside a
//! disposable cleanup container rather than from the host.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::docker::{ContainerRuntime, ContainerSpec, run_once, shell_quote, unique_name};
use crate::errors::DockerError;

const CLEANUP_MOUNT: &str = "/work";
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct WorkDir {
    path: PathBuf,
}

impl WorkDir {
    /// Create the job's directory; an existing one is reused.
    pub fn create(
        base: &Path,
        tenant: &str,
        resource_uuid: &str,
        job_id: &str,
    ) -> std::io::Result<Self> {
        let tenant = slipway_common::naming::sanitize(tenant);
        let tenant = if tenant.is_empty() {
            "default".to_string()
        } else {
            tenant
        };
        let path = base
            .join(tenant)
            .join(format!("{}-{}", resource_uuid, job_id));
        std::fs::create_dir_all(path.join("src"))?;
        std::fs::create_dir_all(path.join("artifacts"))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Build context root; the cloner writes `code/` here.
    pub fn context_dir(&self) -> PathBuf {
        self.path.join("src")
    }

    pub fn code_dir(&self) -> PathBuf {
        self.context_dir().join("code")
    }

    /// Scratch location for exported and downloaded image archives.
    pub fn artifact_path(&self, name: &str) -> PathBuf {
        self.path.join("artifacts").join(format!("{}.tar", name))
    }
}

/// Delete `target` by running `rm -rf` in a container that mounts its parent.
pub async fn remove_tree(
    runtime: &dyn ContainerRuntime,
    cleanup_image: &str,
    target: &Path,
) -> Result<(), DockerError> {
    if !target.exists() {
        return Ok(());
    }
    let (Some(parent), Some(name)) = (target.parent(), target.file_name()) else {
        return Err(DockerError::api(
            "cleanup",
            format!("refusing to remove {}", target.display()),
        ));
    };
    let inner = format!("{}/{}", CLEANUP_MOUNT, name.to_string_lossy());
    let spec = ContainerSpec {
        name: unique_name("slipway-cleanup"),
        image: cleanup_image.to_string(),
        cmd: vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("rm -rf {}", shell_quote(&inner)),
        ],
        binds: vec![format!("{}:{}", parent.display(), CLEANUP_MOUNT)],
        ..Default::default()
    };

    let outcome = run_once(runtime, &spec, CLEANUP_TIMEOUT).await?;
    if !outcome.succeeded() {
        return Err(DockerError::api(
            "cleanup",
            format!(
                "rm -rf {} exited with {:?}: {}",
                target.display(),
                outcome.exit,
                outcome.output.trim()
            ),
        ));
    }
    if target.exists() {
        return Err(DockerError::api(
            "cleanup",
            format!("{} still present after cleanup", target.display()),
        ));
    }
    tracing::debug!(path = %target.display(), "removed working tree");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::fake::FakeRuntime;
    use tempfile::tempdir;

    #[test]
    fn create_nests_under_tenant() {
        let base = tempdir().unwrap();
        let wd = WorkDir::create(base.path(), "Tenant A", "uuid-1", "job-9").unwrap();
        assert_eq!(wd.path(), base.path().join("tenant-a").join("uuid-1-job-9"));
        assert!(wd.context_dir().is_dir());
        assert_eq!(wd.code_dir(), wd.path().join("src").join("code"));
        assert_eq!(
            wd.artifact_path("app"),
            wd.path().join("artifacts").join("app.tar")
        );
    }

    #[tokio::test]
    async fn remove_tree_runs_cleanup_container() {
        let base = tempdir().unwrap();
        let wd = WorkDir::create(base.path(), "t", "u", "j").unwrap();
        std::fs::create_dir_all(wd.code_dir()).unwrap();
        std::fs::write(wd.code_dir().join("file"), "x").unwrap();

        let runtime = FakeRuntime::new();
        remove_tree(&runtime, "busybox", wd.path()).await.unwrap();

        assert!(!wd.path().exists());
        let created = runtime.created();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].image, "busybox");
        assert!(created[0].cmd[2].starts_with("rm -rf /work/"));
        assert!(runtime.live_containers().is_empty());
    }

    #[tokio::test]
    async fn remove_tree_of_missing_path_is_noop() {
        let base = tempdir().unwrap();
        let runtime = FakeRuntime::new();
        remove_tree(&runtime, "busybox", &base.path().join("gone"))
            .await
            .unwrap();
        assert!(runtime.created().is_empty());
    }

    #[tokio::test]
    async fn remove_tree_reports_failed_container() {
        let base = tempdir().unwrap();
        let wd = WorkDir::create(base.path(), "t", "u", "j").unwrap();
        let runtime = FakeRuntime::new();
        runtime.on_run(|_| Some(crate::docker::fake::exited(1, "permission denied")));

        let err = remove_tree(&runtime, "busybox", wd.path()).await.unwrap_err();
        assert!(err.to_string().contains("permission denied"));
        assert!(runtime.live_containers().is_empty());
    }
}
