//! Deployment engine: provision an orchestration stack for a built artifact,
//! wait for it, record the application address, and tear down superseded
//! deploys of the same plan.
//!
//! Stacks are named `<assembly-name>-<assembly-uuid>`, so a redeploy finds
//! and updates the existing stack instead of creating a second one.

pub mod gc;
pub mod heat;
pub mod network;
pub mod poll;
pub mod template;

#[cfg(test)]
pub mod fake;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use slipway_common::naming::stack_name;
use slipway_common::{
    Assembly, AssemblyStatus, HEAT_STACK_COMPONENT, ImageFormat, StorageBackend,
};
use tokio::net::TcpStream;

use crate::config::{Config, DeployerConfig};
use crate::docker::unique_name;
use crate::errors::DeployError;
use crate::logging::JobLog;
use crate::pipeline::{Artifact, DeployHandoff, StatusTracker};
use crate::retry::RetryPolicy;
use crate::storage::ArtifactPersister;
use crate::store::{MetadataStore, NewComponent};

pub use heat::{HeatClient, StackInfo, StackService};
pub use network::{NetworkService, NeutronClient};
pub use template::StackStrategy;

const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_PROBE_PORT: u16 = 80;

pub struct DeploymentEngine {
    config: DeployerConfig,
    image_format: ImageFormat,
    backend: StorageBackend,
    log_dir: PathBuf,
    store: Arc<dyn MetadataStore>,
    stacks: Arc<dyn StackService>,
    networks: Arc<dyn NetworkService>,
    persister: Arc<ArtifactPersister>,
}

impl DeploymentEngine {
    pub fn new(
        config: &Config,
        store: Arc<dyn MetadataStore>,
        stacks: Arc<dyn StackService>,
        networks: Arc<dyn NetworkService>,
        persister: Arc<ArtifactPersister>,
    ) -> Self {
        Self {
            config: config.deployer.clone(),
            image_format: config.storage.image_format,
            backend: config.storage.backend,
            log_dir: config.worker.log_dir.clone(),
            store,
            stacks,
            networks,
            persister,
        }
    }

    /// Engine talking to the configured Heat and Neutron endpoints.
    pub fn from_config(
        config: &Config,
        store: Arc<dyn MetadataStore>,
        persister: Arc<ArtifactPersister>,
    ) -> Result<Self, DeployError> {
        let stacks = Arc::new(HeatClient::new(&config.deployer)?);
        let networks = Arc::new(NeutronClient::new(&config.deployer)?);
        Ok(Self::new(config, store, stacks, networks, persister))
    }

    /// Deploy `artifact` for an Assembly and return the application address.
    ///
    /// A failure is recorded as the Assembly's terminal status before it is
    /// returned. Superseded twins are destroyed only after a complete deploy.
    pub async fn deploy(
        &self,
        assembly_id: i64,
        artifact: &Artifact,
        ports: &[u16],
    ) -> Result<String, DeployError> {
        let assembly = self.assembly(assembly_id).await?;
        let tracker = StatusTracker::new(self.store.as_ref(), assembly.id);
        let log = match JobLog::create(&self.log_dir, &assembly.uuid, &unique_name("deploy")) {
            Ok(log) => log,
            Err(e) => {
                tracker.fail(AssemblyStatus::Error).await;
                return Err(DeployError::JobLog(e));
            }
        };

        let result = self
            .provision(&assembly, artifact, ports, &tracker, &log)
            .await;
        if let Err(e) = &result {
            log.error("deploy", e.to_string());
            if let Some(status) = e.terminal_status() {
                tracker.fail(status).await;
            }
        }
        self.publish_log(&log, "deploy").await;
        let address = result?;

        if let Err(e) = self.collect_twins(&assembly).await {
            tracing::warn!(assembly = assembly.id, error = %e, "twin cleanup failed");
        }
        Ok(address)
    }

    async fn provision(
        &self,
        assembly: &Assembly,
        artifact: &Artifact,
        ports: &[u16],
        tracker: &StatusTracker<'_>,
        log: &JobLog,
    ) -> Result<String, DeployError> {
        tracker.begin(AssemblyStatus::Deploying).await?;

        let strategy = StackStrategy::select(self.image_format, self.backend)?;
        let network = network::resolve(self.networks.as_ref()).await?;
        let name = stack_name(&assembly.name, &assembly.uuid);
        log.line(
            "deploy",
            format!("stack {} ({:?}) for {}", name, strategy, artifact.image_name),
        );

        let download_url = if strategy.needs_download_url() {
            let location = artifact.location.as_deref().ok_or_else(|| {
                DeployError::orchestration("render template", "artifact has no blob location")
            })?;
            Some(self.persister.temp_url(location)?)
        } else {
            None
        };
        let template = strategy.render(ports, self.config.key_name.is_some())?;
        let parameters = strategy.parameters(
            &self.config,
            &template::StackRequest {
                name: &name,
                network: &network,
                ports,
                tag: &artifact.tag,
                image_name: &artifact.image_name,
                download_url: download_url.as_deref(),
            },
        )?;

        tracker.ensure_live().await?;
        let stack_id = match self.stacks.get_stack(&name).await? {
            Some(existing) => {
                log.line("deploy", format!("updating stack {}", existing.id));
                self.stacks
                    .update_stack(&name, &existing.id, &template, &parameters)
                    .await?;
                existing.id
            }
            None => {
                log.line("deploy", "creating stack");
                self.stacks.create_stack(&name, &template, &parameters).await?
            }
        };
        self.record_stack(assembly.id, &name, &stack_id).await?;

        let stack =
            poll::wait_until_ready(self.stacks.as_ref(), &name, &self.config.poll_policy()).await?;
        let address = app_address(&stack, ports)?;
        log.line("deploy", format!("stack {} ready at {}", stack.stack_status, address));

        tracker.advance(AssemblyStatus::StartingApp).await?;
        self.store
            .set_application_uri(assembly.id, &address)
            .await
            .map_err(DeployError::Store)?;

        if self.config.probe_attempts > 0 {
            let host = public_ip(&stack)?;
            let port = ports.first().copied().unwrap_or(DEFAULT_PROBE_PORT);
            self.probe(&host, port, log).await?;
        }

        tracker.advance(AssemblyStatus::DeploymentComplete).await?;
        Ok(address)
    }

    /// Record the stack as a Component the first time it is seen.
    async fn record_stack(
        &self,
        assembly_id: i64,
        name: &str,
        stack_id: &str,
    ) -> Result<(), DeployError> {
        let existing = self
            .store
            .find_component(assembly_id, HEAT_STACK_COMPONENT)
            .await
            .map_err(DeployError::Store)?;
        if existing.is_some() {
            return Ok(());
        }
        self.store
            .create_component(NewComponent {
                assembly_id,
                component_type: HEAT_STACK_COMPONENT.to_string(),
                name: name.to_string(),
                resource_uri: None,
                heat_stack_id: Some(stack_id.to_string()),
            })
            .await
            .map_err(DeployError::Store)?;
        Ok(())
    }

    async fn probe(&self, host: &str, port: u16, log: &JobLog) -> Result<(), DeployError> {
        let address = format!("{}:{}", host, port);
        let policy = RetryPolicy::fixed(
            self.config.probe_attempts,
            Duration::from_secs(self.config.probe_interval_secs),
        );
        let attempts = policy.max_attempts.max(1);
        log.line("deploy", format!("probing {}", address));
        policy
            .run(
                move |_| async move {
                    match tokio::time::timeout(
                        PROBE_CONNECT_TIMEOUT,
                        TcpStream::connect((host, port)),
                    )
                    .await
                    {
                        Ok(Ok(_)) => Ok(()),
                        Ok(Err(e)) => Err(e),
                        Err(_) => Err(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "connect timed out",
                        )),
                    }
                },
                |_| true,
            )
            .await
            .map_err(|_| DeployError::AppUnreachable { address, attempts })
    }

    /// Destroy every older settled deploy of the same plan.
    async fn collect_twins(&self, assembly: &Assembly) -> Result<(), DeployError> {
        let assemblies = self
            .store
            .list_assemblies_for_plan(assembly.plan_id)
            .await
            .map_err(DeployError::Store)?;
        for twin in gc::superseded(assemblies, assembly) {
            tracing::info!(assembly = assembly.id, twin = twin.id, "destroying superseded deploy");
            if let Err(e) = self.destroy(twin.id).await {
                tracing::warn!(twin = twin.id, error = %e, "superseded deploy not destroyed");
            }
        }
        Ok(())
    }

    /// Tear down an Assembly's stack, artifact, logs and rows.
    ///
    /// The Assembly is marked `DELETING` first. If the stack cannot be
    /// deleted it is marked `ERROR_STACK_DELETE_FAILED` and nothing else is
    /// removed.
    pub async fn destroy(&self, assembly_id: i64) -> Result<(), DeployError> {
        let assembly = self.assembly(assembly_id).await?;
        self.store
            .set_assembly_status(assembly.id, AssemblyStatus::Deleting)
            .await
            .map_err(DeployError::Store)?;

        let name = stack_name(&assembly.name, &assembly.uuid);
        if let Err(e) = self.delete_stack(&name).await {
            tracing::error!(assembly = assembly.id, stack = %name, error = %e, "stack delete failed");
            if let Err(store_err) = self
                .store
                .set_assembly_status(assembly.id, AssemblyStatus::ErrorStackDeleteFailed)
                .await
            {
                tracing::warn!(assembly = assembly.id, error = %store_err, "could not record delete failure");
            }
            return Err(e);
        }

        if let Some(image_id) = assembly.image_id {
            self.remove_image(image_id).await?;
        }
        let logs = self
            .store
            .take_logs(&assembly.uuid)
            .await
            .map_err(DeployError::Store)?;
        for record in logs {
            if let Err(e) = self.persister.remove_log(&record.location).await {
                tracing::warn!(location = %record.location, error = %e, "log not removed");
            }
        }
        self.store
            .delete_components(assembly.id)
            .await
            .map_err(DeployError::Store)?;
        self.store
            .delete_assembly(assembly.id)
            .await
            .map_err(DeployError::Store)?;
        tracing::info!(assembly = assembly.id, stack = %name, "assembly destroyed");
        Ok(())
    }

    async fn delete_stack(&self, name: &str) -> Result<(), DeployError> {
        let Some(stack) = self.stacks.get_stack(name).await? else {
            return Ok(());
        };
        self.stacks.delete_stack(name, &stack.id).await?;
        poll::wait_until_deleted(self.stacks.as_ref(), name, &self.config.poll_policy()).await
    }

    async fn remove_image(&self, image_id: i64) -> Result<(), DeployError> {
        let image = self
            .store
            .get_image(image_id)
            .await
            .map_err(DeployError::Store)?;
        let Some(image) = image else {
            return Ok(());
        };
        if let Some(location) = image.external_ref.as_deref().filter(|l| !l.is_empty()) {
            if let Err(e) = self.persister.remove(location).await {
                tracing::warn!(image = image_id, location, error = %e, "artifact not removed");
            }
        }
        self.store
            .delete_image(image_id)
            .await
            .map_err(DeployError::Store)
    }

    async fn assembly(&self, id: i64) -> Result<Assembly, DeployError> {
        self.store
            .get_assembly(id)
            .await
            .map_err(DeployError::Store)?
            .ok_or(DeployError::AssemblyNotFound { id })
    }

    async fn publish_log(&self, log: &JobLog, stage: &str) {
        match self.persister.publish_log(log.path()).await {
            Ok(location) => {
                if let Err(e) = self
                    .store
                    .add_log(log.resource_uuid(), stage, &location)
                    .await
                {
                    tracing::warn!(error = %e, "could not record deploy log");
                }
            }
            Err(e) => {
                tracing::warn!(path = %log.path().display(), error = %e, "deploy log upload failed");
            }
        }
    }
}

#[async_trait]
impl DeployHandoff for DeploymentEngine {
    async fn deploy(
        &self,
        assembly_id: i64,
        artifact: &Artifact,
        ports: &[u16],
    ) -> Result<String, DeployError> {
        DeploymentEngine::deploy(self, assembly_id, artifact, ports).await
    }
}

fn public_ip(stack: &StackInfo) -> Result<String, DeployError> {
    let value = stack.outputs.first().map(|o| match &o.output_value {
        serde_json::Value::String(s) => s.trim().to_string(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    });
    value
        .filter(|ip| !ip.is_empty())
        .ok_or_else(|| DeployError::BadOutputs {
            stack: stack.stack_name.clone(),
            reason: "first output holds no address".to_string(),
        })
}

/// Address from the first stack output: `ip:port` for one port,
/// `ip:[p1, p2]` for several, the bare ip for none.
pub fn app_address(stack: &StackInfo, ports: &[u16]) -> Result<String, DeployError> {
    let ip = public_ip(stack)?;
    Ok(match ports {
        [] => ip,
        [port] => format!("{}:{}", ip, port),
        many => {
            let list: Vec<String> = many.iter().map(u16::to_string).collect();
            format!("{}:[{}]", ip, list.join(", "))
        }
    })
}
