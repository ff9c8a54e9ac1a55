use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    BuildImageOptions, BuildImageOptionsBuilder, CreateContainerOptionsBuilder,
    ImportImageOptionsBuilder, KillContainerOptionsBuilder, LogsOptionsBuilder,
    PushImageOptionsBuilder, RemoveContainerOptionsBuilder, RemoveImageOptionsBuilder,
    StartContainerOptions, WaitContainerOptions,
};
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use super::{
    BuildContext, BuildOutput, BuildRequest, ContainerOutcome, ContainerRuntime, ContainerSpec,
    ExitStatus,
};
use crate::config::DockerConfig;
use crate::errors::DockerError;

/// [`ContainerRuntime`] over the Docker Engine API.
#[derive(Debug, Clone)]
pub struct DockerEngine {
    docker: Docker,
    /// Bound for short control calls (create, start, remove, inspect, kill).
    call_timeout: Duration,
}

impl DockerEngine {
    pub fn connect(config: &DockerConfig) -> Result<Self, DockerError> {
        let docker = match &config.host {
            Some(host) => {
                Docker::connect_with_http(host, STREAM_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
            }
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(|e| DockerError::Connect(e.to_string()))?
        .with_timeout(Duration::from_secs(STREAM_TIMEOUT_SECS));

        tracing::debug!(host = ?config.host, "connected to container daemon");
        Ok(Self {
            docker,
            call_timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> Result<T, DockerError>
    where
        F: std::future::Future<Output = Result<T, BollardError>>,
    {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result.map_err(|e| DockerError::api(op, e)),
            Err(_) => Err(DockerError::Timeout {
                op,
                secs: self.call_timeout.as_secs(),
            }),
        }
    }
}

/// Client-level ceiling; builds, waits and image transfers carry their own
/// deadlines, so this only guards against a hung connection.
const STREAM_TIMEOUT_SECS: u64 = 6 * 60 * 60;

fn is_not_found(e: &BollardError) -> bool {
    matches!(
        e,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// Tar the build context in memory. Blocking; call on the blocking pool.
fn tar_context(context: &BuildContext) -> std::io::Result<(Vec<u8>, String)> {
    let mut builder = tar::Builder::new(Vec::new());
    let dockerfile = match context {
        BuildContext::Dir { path, dockerfile } => {
            builder.follow_symlinks(false);
            builder.append_dir_all(".", path)?;
            dockerfile.clone()
        }
        BuildContext::Inline(content) => {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, "Dockerfile", content.as_bytes())?;
            "Dockerfile".to_string()
        }
    };
    Ok((builder.into_inner()?, dockerfile))
}

/// Build query for `req`. The API carries the memory ceiling as a signed
/// 32-bit byte count.
fn build_options(req: &BuildRequest, dockerfile: &str) -> Result<BuildImageOptions, DockerError> {
    let mut options = BuildImageOptionsBuilder::default()
        .dockerfile(dockerfile)
        .t(&req.tag)
        .nocache(req.nocache)
        .rm(true)
        .forcerm(true);
    if let Some(memory) = req.memory {
        let memory = i32::try_from(memory).map_err(|_| {
            DockerError::api(
                "build",
                format!("memory limit {} bytes exceeds {} bytes", memory, i32::MAX),
            )
        })?;
        options = options.memory(memory);
    }
    Ok(options.build())
}

#[async_trait]
impl ContainerRuntime for DockerEngine {
    async fn build_image(&self, req: &BuildRequest) -> Result<BuildOutput, DockerError> {
        let context = req.context.clone();
        let (archive, dockerfile) = tokio::task::spawn_blocking(move || tar_context(&context))
            .await
            .map_err(|e| DockerError::api("build", e))?
            .map_err(|e| DockerError::api("build", format!("failed to tar context: {}", e)))?;

        let options = build_options(req, &dockerfile)?;
        let mut stream = self.docker.build_image(
            options,
            None,
            Some(bollard::body_full(archive.into())),
        );

        let mut output = BuildOutput::default();
        while let Some(item) = stream.next().await {
            match item {
                Ok(info) => {
                    if let Some(line) = info.stream {
                        let line = line.trim_end();
                        if !line.is_empty() {
                            output.lines.push(line.to_string());
                        }
                    }
                    if let Some(detail) = info.error_detail
                        && output.error.is_none()
                    {
                        output.error = Some(detail.message.unwrap_or_else(|| "build error".into()));
                    }
                }
                Err(e) => {
                    // Builder errors arrive as stream errors on newer daemons.
                    if output.error.is_none() {
                        output.error = Some(e.to_string());
                    }
                    break;
                }
            }
        }
        Ok(output)
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, DockerError> {
        let host_config = HostConfig {
            binds: (!spec.binds.is_empty()).then(|| spec.binds.clone()),
            memory: spec.memory.map(|m| m as i64),
            ..Default::default()
        };
        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: (!spec.cmd.is_empty()).then(|| spec.cmd.clone()),
            entrypoint: spec.entrypoint.clone(),
            user: spec.user.clone(),
            env: (!spec.env.is_empty()).then(|| spec.env.clone()),
            working_dir: spec.working_dir.clone(),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(host_config),
            ..Default::default()
        };
        let options = CreateContainerOptionsBuilder::default()
            .name(&spec.name)
            .build();
        let created = self
            .bounded(
                "create container",
                self.docker.create_container(Some(options), body),
            )
            .await?;
        tracing::debug!(name = %spec.name, id = %created.id, "container created");
        Ok(created.id)
    }

    async fn start_and_wait(
        &self,
        id: &str,
        timeout: Duration,
    ) -> Result<ContainerOutcome, DockerError> {
        self.bounded(
            "start container",
            self.docker.start_container(id, None::<StartContainerOptions>),
        )
        .await?;

        let mut wait = self.docker.wait_container(id, None::<WaitContainerOptions>);
        let exit = match tokio::time::timeout(timeout, wait.next()).await {
            Ok(Some(Ok(resp))) => ExitStatus::Code(resp.status_code),
            Ok(Some(Err(BollardError::DockerContainerWaitError { code, .. }))) => {
                ExitStatus::Code(code)
            }
            Ok(Some(Err(e))) => return Err(DockerError::api("wait container", e)),
            Ok(None) => return Err(DockerError::api("wait container", "wait stream ended")),
            Err(_) => {
                tracing::warn!(container = %id, secs = timeout.as_secs(), "container timed out, killing");
                let kill = KillContainerOptionsBuilder::default().signal("SIGKILL").build();
                if let Err(e) = self
                    .bounded("kill container", self.docker.kill_container(id, Some(kill)))
                    .await
                {
                    tracing::warn!(container = %id, error = %e, "kill failed");
                }
                ExitStatus::TimedOut
            }
        };

        let logs_options = LogsOptionsBuilder::default()
            .stdout(true)
            .stderr(true)
            .follow(false)
            .build();
        let mut logs = self.docker.logs(id, Some(logs_options));
        let mut output = String::new();
        while let Some(chunk) = logs.next().await {
            match chunk {
                Ok(chunk) => output.push_str(&chunk.to_string()),
                Err(e) => {
                    tracing::debug!(container = %id, error = %e, "log stream ended early");
                    break;
                }
            }
        }

        Ok(ContainerOutcome { exit, output })
    }

    async fn remove_container(&self, id: &str) -> Result<(), DockerError> {
        let options = RemoveContainerOptionsBuilder::default()
            .force(true)
            .v(true)
            .build();
        let removal = tokio::time::timeout(
            self.call_timeout,
            self.docker.remove_container(id, Some(options)),
        )
        .await;
        match removal {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if is_not_found(&e) => Ok(()),
            Ok(Err(e)) => Err(DockerError::api("remove container", e)),
            Err(_) => Err(DockerError::Timeout {
                op: "remove container",
                secs: self.call_timeout.as_secs(),
            }),
        }
    }

    async fn save_image(&self, tag: &str, dest: &Path) -> Result<u64, DockerError> {
        let io_err = |source| DockerError::Io {
            path: dest.to_path_buf(),
            source,
        };
        let mut file = tokio::fs::File::create(dest).await.map_err(io_err)?;
        let mut stream = self.docker.export_image(tag);
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| DockerError::api("save image", e))?;
            file.write_all(&chunk).await.map_err(io_err)?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(io_err)?;
        Ok(written)
    }

    async fn load_image(&self, src: &Path) -> Result<(), DockerError> {
        let file = tokio::fs::File::open(src)
            .await
            .map_err(|source| DockerError::Io {
                path: src.to_path_buf(),
                source,
            })?;
        let options = ImportImageOptionsBuilder::default().quiet(true).build();
        let mut stream = self
            .docker
            .import_image_stream(options, ReaderStream::new(file), None);
        while let Some(item) = stream.next().await {
            let info = item.map_err(|e| DockerError::api("load image", e))?;
            if let Some(detail) = info.error_detail {
                return Err(DockerError::api(
                    "load image",
                    detail.message.unwrap_or_else(|| "load failed".into()),
                ));
            }
        }
        Ok(())
    }

    async fn push_image(&self, tag: &str) -> Result<(), DockerError> {
        let (name, version) = split_tag(tag);
        let options = PushImageOptionsBuilder::default().tag(version).build();
        let mut stream = self.docker.push_image(name, Some(options), None);
        while let Some(item) = stream.next().await {
            item.map_err(|e| DockerError::api("push image", e))?;
        }
        Ok(())
    }

    async fn image_exists(&self, tag: &str) -> Result<bool, DockerError> {
        let inspect = tokio::time::timeout(self.call_timeout, self.docker.inspect_image(tag)).await;
        match inspect {
            Ok(Ok(_)) => Ok(true),
            Ok(Err(e)) if is_not_found(&e) => Ok(false),
            Ok(Err(e)) => Err(DockerError::api("inspect image", e)),
            Err(_) => Err(DockerError::Timeout {
                op: "inspect image",
                secs: self.call_timeout.as_secs(),
            }),
        }
    }

    async fn remove_image(&self, tag: &str) -> Result<(), DockerError> {
        let options = RemoveImageOptionsBuilder::default().force(true).build();
        let removal = tokio::time::timeout(
            self.call_timeout,
            self.docker.remove_image(tag, Some(options), None),
        )
        .await;
        match removal {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) if is_not_found(&e) => Ok(()),
            Ok(Err(e)) => Err(DockerError::api("remove image", e)),
            Err(_) => Err(DockerError::Timeout {
                op: "remove image",
                secs: self.call_timeout.as_secs(),
            }),
        }
    }
}

/// Split `registry:5000/name:tag` into name and tag, defaulting to `latest`.
fn split_tag(reference: &str) -> (&str, &str) {
    let last_slash = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
    match reference[last_slash..].rfind(':') {
        Some(i) => (
            &reference[..last_slash + i],
            &reference[last_slash + i + 1..],
        ),
        None => (reference, "latest"),
    }
}
