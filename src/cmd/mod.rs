//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module   | Commands handled          |
//! |----------|---------------------------|
//! | `run`    | `Run`, `BuildLp`          |
//! | `deploy` | `Deploy`, `Destroy`       |
//! | `db`     | `Db`                      |
//! | `config` | `Config`                  |
//!
//! Job commands print a JSON report on stdout and return whether the job
//! succeeded; `main` turns `false` into exit code 1.

pub mod config;
pub mod db;
pub mod deploy;
pub mod run;

pub use config::cmd_config;
pub use db::cmd_db;
pub use deploy::{cmd_deploy, cmd_destroy};
pub use run::{cmd_build_lp, cmd_run};

use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::Arc;

use slipway::config::Config;
use slipway::deploy::DeploymentEngine;
use slipway::docker::ContainerRuntime;
use slipway::docker::engine::DockerEngine;
use slipway::storage::ArtifactPersister;
use slipway::store::StoreHandle;

/// Long-lived clients shared by the job commands.
pub struct Services {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub store: Arc<StoreHandle>,
    pub persister: Arc<ArtifactPersister>,
}

impl Services {
    pub fn connect(config: &Config) -> Result<Self> {
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerEngine::connect(&config.docker)?);
        let store = Arc::new(open_store(config)?);
        let persister = Arc::new(
            ArtifactPersister::from_config(config, runtime.clone())
                .context("Failed to set up artifact storage")?,
        );
        Ok(Self {
            runtime,
            store,
            persister,
        })
    }

    pub fn deployer(&self, config: &Config) -> Result<DeploymentEngine> {
        DeploymentEngine::from_config(config, self.store.clone(), self.persister.clone())
            .context("Failed to set up the deployment engine")
    }
}

pub fn open_store(config: &Config) -> Result<StoreHandle> {
    let path = &config.worker.db_path;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    StoreHandle::open(path)
        .with_context(|| format!("Failed to open metadata database {}", path.display()))
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value).context("Failed to serialize report")?;
    println!("{}", out);
    Ok(())
}
