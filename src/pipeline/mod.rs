//! Build pipeline: clone, unit-test, build and persist one application or
//! language pack, then hand the artifact to the deployer.
//!
//! Everything a run creates is owned by a [`BuildJob`] and released when the
//! run ends. Errors never escape [`Pipeline::run`]: they become the Assembly's
//! terminal status and the report's `error`.

pub mod status;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use slipway_common::naming::artifact_name;
use slipway_common::{
    ArtifactType, Assembly, AssemblyStatus, Image, ImageStatus, Stage, StorageBackend, Workflow,
};

use crate::clone::RepoCloner;
use crate::config::{Config, WorkerConfig};
use crate::docker::{BuildContext, ContainerRuntime, ContainerSpec, ExitStatus, unique_name};
use crate::errors::{BuildError, DeployError, PersistError, PipelineError};
use crate::image::{ImageBuilder, dockerfile};
use crate::job::BuildJob;
use crate::logging::JobLog;
use crate::storage::ArtifactPersister;
use crate::store::{ImageUpdate, MetadataStore, NewImage};
use crate::workdir::WorkDir;

pub use status::StatusTracker;

const UNITTEST_DOCKERFILE: &str = "Dockerfile.unittest";
const BUILD_DOCKERFILE: &str = "Dockerfile.build";
const BUILD_SCRIPT: &str = "build.sh";
const APP_DIR: &str = "/app";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSpec {
    pub url: String,
    /// Commit SHA or branch; empty means the default branch.
    #[serde(default)]
    pub revision: String,
}

/// The dispatch payload for one application build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub assembly_id: i64,
    /// Overrides the Assembly's tenant for the working directory.
    #[serde(default)]
    pub tenant: Option<String>,
    pub source: SourceSpec,
    pub language_pack_id: i64,
    #[serde(default)]
    pub ports: Vec<u16>,
    /// Overrides the Assembly's stored workflow.
    #[serde(default)]
    pub workflow: Option<Workflow>,
    #[serde(default)]
    pub test_cmd: Option<String>,
    #[serde(default)]
    pub build_cmd: Option<String>,
    #[serde(default)]
    pub run_cmd: Option<String>,
}

/// A persisted application image, as handed to the deployer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub image_id: i64,
    /// Blob object name; `None` for registry backends.
    pub location: Option<String>,
    pub image_name: String,
    /// Tag the image carries in the daemon (and registry).
    pub tag: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct JobReport {
    pub assembly_id: i64,
    pub job_id: String,
    pub status: Option<AssemblyStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unittest_exit: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Artifact>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cleanup_failures: Vec<String>,
}

impl JobReport {
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.status != Some(AssemblyStatus::UnitTestingFailed)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LanguagePackReport {
    pub image_id: i64,
    pub job_id: String,
    pub status: Option<ImageStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker_image_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cleanup_failures: Vec<String>,
}

/// Receives built artifacts when `deploy` is in the workflow.
#[async_trait]
pub trait DeployHandoff: Send + Sync {
    /// Deploy and return the application address.
    async fn deploy(
        &self,
        assembly_id: i64,
        artifact: &Artifact,
        ports: &[u16],
    ) -> Result<String, DeployError>;
}

pub struct Pipeline {
    worker: WorkerConfig,
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn MetadataStore>,
    persister: Arc<ArtifactPersister>,
    deployer: Option<Arc<dyn DeployHandoff>>,
}

impl Pipeline {
    pub fn new(
        config: &Config,
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn MetadataStore>,
        persister: Arc<ArtifactPersister>,
    ) -> Self {
        Self {
            worker: config.worker.clone(),
            runtime,
            store,
            persister,
            deployer: None,
        }
    }

    pub fn with_deployer(mut self, deployer: Arc<dyn DeployHandoff>) -> Self {
        self.deployer = Some(deployer);
        self
    }

    /// Run the Assembly's workflow. Always returns a report; failures are
    /// recorded as status and `error`.
    pub async fn run(&self, spec: &JobSpec) -> JobReport {
        let mut job = BuildJob::new(self.runtime.clone(), &self.worker.cleanup_image);
        let mut report = JobReport {
            assembly_id: spec.assembly_id,
            job_id: job.id().to_string(),
            ..Default::default()
        };
        let tracker = StatusTracker::new(self.store.as_ref(), spec.assembly_id);

        let assembly = match self.store.get_assembly(spec.assembly_id).await {
            Ok(Some(a)) => a,
            Ok(None) => {
                report.error = Some(PipelineError::AssemblyNotFound { id: spec.assembly_id }.to_string());
                return report;
            }
            Err(e) => {
                report.error = Some(PipelineError::Store(e).to_string());
                return report;
            }
        };
        let log = match JobLog::create(&self.worker.log_dir, &assembly.uuid, job.id()) {
            Ok(log) => log,
            Err(e) => {
                tracker.fail(AssemblyStatus::Error).await;
                report.error = Some(format!("{:#}", e));
                report.status = tracker.current().await.ok();
                return report;
            }
        };

        let workflow = spec
            .workflow
            .clone()
            .unwrap_or_else(|| assembly.workflow.clone());
        log.line(
            "pipeline",
            format!(
                "job {} for assembly {} ({}), workflow [{}]",
                job.id(),
                assembly.id,
                assembly.name,
                workflow.to_csv()
            ),
        );

        let outcome = self
            .execute(
                &mut job,
                &assembly,
                &workflow,
                spec,
                &tracker,
                &log,
                &mut report,
            )
            .await;
        let artifact = match outcome {
            Ok(artifact) => artifact,
            Err(e) => {
                log.error("pipeline", e.to_string());
                if let Some(status) = e.terminal_status() {
                    tracker.fail(status).await;
                }
                report.error = Some(e.to_string());
                None
            }
        };

        report.cleanup_failures = job.close().await;
        for failure in &report.cleanup_failures {
            log.error("cleanup", failure);
        }
        report.log_location = self.publish_log(&log, "build").await;

        if let Some(artifact) = &artifact {
            report.artifact = Some(artifact.clone());
            if workflow.contains(Stage::Deploy) {
                self.hand_off(&assembly, artifact, &spec.ports, &mut report)
                    .await;
            }
        }
        report.status = tracker.current().await.ok();
        report
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute(
        &self,
        job: &mut BuildJob,
        assembly: &Assembly,
        workflow: &Workflow,
        spec: &JobSpec,
        tracker: &StatusTracker<'_>,
        log: &JobLog,
        report: &mut JobReport,
    ) -> Result<Option<Artifact>, PipelineError> {
        tracker.ensure_live().await?;

        let needs_build = workflow.contains(Stage::Unittest) || workflow.contains(Stage::Build);
        if !needs_build {
            log.line("pipeline", "no unittest or build stage, nothing to do");
            return Ok(None);
        }

        let lp = self.language_pack(spec.language_pack_id).await?;
        let tenant = spec.tenant.as_deref().unwrap_or(&assembly.tenant);
        let workdir = WorkDir::create(&self.worker.work_dir, tenant, &assembly.uuid, job.id())
            .map_err(|source| PipelineError::Workspace {
                path: self.worker.work_dir.clone(),
                source,
            })?;
        job.track_dir(workdir.path());

        let lp_tag = self.prepare_language_pack(job, &lp, &workdir, log).await?;
        let sha = RepoCloner::new(&self.worker)
            .clone(job, &spec.source.url, &spec.source.revision, &workdir.context_dir(), log)
            .await?;
        report.commit_sha = Some(sha.clone());

        if workflow.contains(Stage::Unittest) {
            tracker.begin(AssemblyStatus::UnitTesting).await?;
            let exit = self
                .unittest(job, &lp_tag, spec.test_cmd.as_deref(), &workdir, log)
                .await?;
            report.unittest_exit = Some(exit);
            if exit != 0 {
                log.error("unittest", format!("unit tests exited with {}", exit));
                tracker.advance(AssemblyStatus::UnitTestingFailed).await?;
                return Ok(None);
            }
            tracker.advance(AssemblyStatus::UnitTestingPassed).await?;
        }

        if !workflow.contains(Stage::Build) {
            return Ok(None);
        }
        if workflow.contains(Stage::Unittest) {
            tracker.advance(AssemblyStatus::Building).await?;
        } else {
            tracker.begin(AssemblyStatus::Building).await?;
        }
        let name = artifact_name(&assembly.name, Utc::now(), &sha);
        let tag = self
            .build_app(job, &lp_tag, spec, &name, &workdir, log)
            .await?;
        let location = self.store_artifact(job, &workdir, &tag, &name, log).await?;

        tracker.ensure_live().await?;
        let image = self
            .store
            .create_image(NewImage {
                name: name.clone(),
                status: ImageStatus::Ready,
                external_ref: Some(location.clone().unwrap_or_else(|| tag.clone())),
                docker_image_name: Some(tag.clone()),
                source_format: "docker".to_string(),
                artifact_type: ArtifactType::Application,
                base_image_id: Some(lp.id),
                tenant: tenant.to_string(),
            })
            .await
            .map_err(PipelineError::Store)?;
        self.store
            .set_assembly_image(assembly.id, image.id)
            .await
            .map_err(PipelineError::Store)?;
        tracker.advance(AssemblyStatus::Built).await?;
        log.line("build", format!("artifact {} ready", name));

        Ok(Some(Artifact {
            image_id: image.id,
            location,
            image_name: name,
            tag,
        }))
    }

    /// Look up and validate a language pack before any side effect.
    async fn language_pack(&self, id: i64) -> Result<Image, PipelineError> {
        let lp = self
            .store
            .get_image(id)
            .await
            .map_err(PipelineError::Store)?
            .ok_or(PipelineError::ImageNotFound { id })?;
        if !lp.is_consumable() {
            return Err(PipelineError::LanguagePackUnusable {
                id,
                reason: format!(
                    "status {}, external ref {:?}, image name {:?}",
                    lp.status, lp.external_ref, lp.docker_image_name
                ),
            });
        }
        Ok(lp)
    }

    /// Make the language pack available in the daemon; returns its tag.
    async fn prepare_language_pack(
        &self,
        job: &mut BuildJob,
        lp: &Image,
        workdir: &WorkDir,
        log: &JobLog,
    ) -> Result<String, PipelineError> {
        let (Some(location), Some(tag)) = (lp.external_ref.as_deref(), lp.docker_image_name.as_deref())
        else {
            return Err(PipelineError::LanguagePackUnusable {
                id: lp.id,
                reason: "missing references".to_string(),
            });
        };
        if self.persister.backend() == StorageBackend::DockerRegistry {
            return Ok(tag.to_string());
        }
        log.line("language_pack", format!("fetching {} from {}", tag, location));
        let archive = workdir.artifact_path(&slipway_common::naming::sanitize(tag));
        self.persister.fetch(location, &archive).await?;
        job.track_image(tag);
        self.persister.restore(&archive).await?;
        if let Err(e) = std::fs::remove_file(&archive) {
            tracing::debug!(path = %archive.display(), error = %e, "archive left for cleanup");
        }
        if !job.runtime().image_exists(tag).await? {
            return Err(PipelineError::LanguagePackUnusable {
                id: lp.id,
                reason: format!("archive {} did not provide {}", location, tag),
            });
        }
        Ok(tag.to_string())
    }

    /// Run the test command in a language pack + source image; returns the
    /// exit code. No command means success without any container.
    async fn unittest(
        &self,
        job: &mut BuildJob,
        lp_tag: &str,
        test_cmd: Option<&str>,
        workdir: &WorkDir,
        log: &JobLog,
    ) -> Result<i64, PipelineError> {
        let Some(cmd) = test_cmd.map(str::trim).filter(|c| !c.is_empty()) else {
            log.line("unittest", "no test command, skipping");
            return Ok(0);
        };
        let context = workdir.context_dir();
        write_context_file(&context, UNITTEST_DOCKERFILE, &dockerfile::unittest(lp_tag))?;
        let tag = format!("slipway-ut-{}", job.id());
        ImageBuilder::new(&self.worker)
            .build(
                job,
                &tag,
                BuildContext::Dir {
                    path: context,
                    dockerfile: UNITTEST_DOCKERFILE.to_string(),
                },
                log,
                "unittest",
            )
            .await?;

        let spec = ContainerSpec {
            name: unique_name("slipway-ut"),
            image: tag,
            cmd: vec!["/bin/sh".to_string(), "-c".to_string(), cmd.to_string()],
            working_dir: Some(APP_DIR.to_string()),
            memory: Some(self.worker.build_memory_bytes()).filter(|m| *m > 0),
            ..Default::default()
        };
        log.line("unittest", format!("running {}", cmd));
        let timeout = self.worker.unittest_timeout();
        let outcome = job.run_container(&spec, timeout).await?;
        log.output("unittest", &outcome.output);
        match outcome.exit {
            ExitStatus::Code(code) => Ok(code),
            ExitStatus::TimedOut => Err(PipelineError::UnitTestTimedOut {
                secs: timeout.as_secs(),
            }),
        }
    }

    /// Two-phase build: run `build.sh` on language pack + source, then set
    /// the start command on top. Returns the final tag.
    async fn build_app(
        &self,
        job: &mut BuildJob,
        lp_tag: &str,
        spec: &JobSpec,
        name: &str,
        workdir: &WorkDir,
        log: &JobLog,
    ) -> Result<String, PipelineError> {
        let builder = ImageBuilder::new(&self.worker);
        let context = workdir.context_dir();
        write_context_file(
            &context,
            BUILD_SCRIPT,
            &dockerfile::build_script(spec.build_cmd.as_deref().unwrap_or_default()),
        )?;
        write_context_file(&context, BUILD_DOCKERFILE, &dockerfile::build(lp_tag))?;

        let intermediate = format!("slipway-build-{}", job.id());
        builder
            .build(
                job,
                &intermediate,
                BuildContext::Dir {
                    path: context,
                    dockerfile: BUILD_DOCKERFILE.to_string(),
                },
                log,
                "build",
            )
            .await?;

        let tag = self.persister.image_tag(name);
        builder
            .build(
                job,
                &tag,
                BuildContext::Inline(dockerfile::final_image(&intermediate, spec.run_cmd.as_deref())),
                log,
                "build",
            )
            .await?;
        Ok(tag)
    }

    /// Export and ship a built image. Registry images are released from the
    /// job so the pushed tag outlives it.
    async fn store_artifact(
        &self,
        job: &mut BuildJob,
        workdir: &WorkDir,
        tag: &str,
        name: &str,
        log: &JobLog,
    ) -> Result<Option<String>, PersistError> {
        log.line("persist", format!("storing {} ({})", name, self.persister.backend()));
        match self.persister.backend() {
            StorageBackend::Swift => {
                let archive = workdir.artifact_path(name);
                self.persister.export(tag, &archive).await?;
                let location = self.persister.persist(&archive, name).await?;
                if let Err(e) = std::fs::remove_file(&archive) {
                    tracing::debug!(path = %archive.display(), error = %e, "archive left for cleanup");
                }
                Ok(location)
            }
            StorageBackend::DockerRegistry => {
                let location = self.persister.persist(workdir.path(), name).await?;
                job.release_image(tag);
                Ok(location)
            }
        }
    }

    async fn hand_off(
        &self,
        assembly: &Assembly,
        artifact: &Artifact,
        ports: &[u16],
        report: &mut JobReport,
    ) {
        let Some(deployer) = &self.deployer else {
            tracing::warn!(assembly = assembly.id, "deploy requested but no deployer configured");
            report.error = Some("deploy requested but no deployer configured".to_string());
            return;
        };
        match deployer.deploy(assembly.id, artifact, ports).await {
            Ok(uri) => report.application_uri = Some(uri),
            Err(e) => report.error = Some(e.to_string()),
        }
    }

    /// Build, persist and mark READY a language pack from its repository's
    /// Dockerfile.
    pub async fn build_language_pack(
        &self,
        image_id: i64,
        source: &SourceSpec,
    ) -> LanguagePackReport {
        let mut job = BuildJob::new(self.runtime.clone(), &self.worker.cleanup_image);
        let mut report = LanguagePackReport {
            image_id,
            job_id: job.id().to_string(),
            ..Default::default()
        };
        let image = match self.store.get_image(image_id).await {
            Ok(Some(image)) => image,
            Ok(None) => {
                report.error = Some(PipelineError::ImageNotFound { id: image_id }.to_string());
                return report;
            }
            Err(e) => {
                report.error = Some(PipelineError::Store(e).to_string());
                return report;
            }
        };
        let log = match JobLog::create(&self.worker.log_dir, &image.uuid, job.id()) {
            Ok(log) => log,
            Err(e) => {
                report.error = Some(format!("{:#}", e));
                self.set_image_status(image_id, ImageStatus::Error).await;
                report.status = Some(ImageStatus::Error);
                return report;
            }
        };

        let status = match self.execute_language_pack(&mut job, &image, source, &log, &mut report).await {
            Ok(()) => ImageStatus::Ready,
            Err(e) => {
                log.error("languagepack", e.to_string());
                report.error = Some(e.to_string());
                self.set_image_status(image_id, ImageStatus::Error).await;
                ImageStatus::Error
            }
        };
        report.status = Some(status);
        report.cleanup_failures = job.close().await;
        report.log_location = self.publish_log(&log, "languagepack").await;
        report
    }

    async fn execute_language_pack(
        &self,
        job: &mut BuildJob,
        image: &Image,
        source: &SourceSpec,
        log: &JobLog,
        report: &mut LanguagePackReport,
    ) -> Result<(), PipelineError> {
        self.store
            .update_image(
                image.id,
                ImageUpdate {
                    status: Some(ImageStatus::Building),
                    ..Default::default()
                },
            )
            .await
            .map_err(PipelineError::Store)?;

        let workdir = WorkDir::create(&self.worker.work_dir, &image.tenant, &image.uuid, job.id())
            .map_err(|source| PipelineError::Workspace {
                path: self.worker.work_dir.clone(),
                source,
            })?;
        job.track_dir(workdir.path());

        let sha = RepoCloner::new(&self.worker)
            .clone(job, &source.url, &source.revision, &workdir.context_dir(), log)
            .await?;
        report.commit_sha = Some(sha.clone());

        let name = artifact_name(&image.name, Utc::now(), &sha);
        let tag = self.persister.image_tag(&name);
        ImageBuilder::new(&self.worker)
            .build(
                job,
                &tag,
                BuildContext::Dir {
                    path: workdir.code_dir(),
                    dockerfile: "Dockerfile".to_string(),
                },
                log,
                "languagepack",
            )
            .await?;
        let location = self.store_artifact(job, &workdir, &tag, &name, log).await?;

        self.store
            .update_image(
                image.id,
                ImageUpdate {
                    status: Some(ImageStatus::Ready),
                    external_ref: Some(location.unwrap_or_else(|| tag.clone())),
                    docker_image_name: Some(tag.clone()),
                },
            )
            .await
            .map_err(PipelineError::Store)?;
        log.line("languagepack", format!("language pack {} ready", tag));
        report.docker_image_name = Some(tag);
        Ok(())
    }

    async fn set_image_status(&self, id: i64, status: ImageStatus) {
        let update = ImageUpdate {
            status: Some(status),
            ..Default::default()
        };
        if let Err(e) = self.store.update_image(id, update).await {
            tracing::warn!(image = id, error = %e, "could not record image status");
        }
    }

    /// Upload the job log and record it; failures only cost the log.
    async fn publish_log(&self, log: &JobLog, stage: &str) -> Option<String> {
        let location = match self.persister.publish_log(log.path()).await {
            Ok(location) => location,
            Err(e) => {
                tracing::warn!(path = %log.path().display(), error = %e, "job log upload failed");
                return None;
            }
        };
        if let Err(e) = self
            .store
            .add_log(log.resource_uuid(), stage, &location)
            .await
        {
            tracing::warn!(error = %e, "could not record job log");
        }
        Some(location)
    }
}

fn write_context_file(dir: &Path, name: &str, content: &str) -> Result<(), BuildError> {
    let path = dir.join(name);
    std::fs::write(&path, content).map_err(|source| BuildError::Context { path, source })
}
