//! Metadata database commands: `slipway db`.

use anyhow::{Context, Result};
use serde::Serialize;
use slipway_common::{Assembly, Component, LogRecord};

use slipway::config::Config;
use slipway::store::{NewAssembly, NewImage};

use super::super::DbCommands;
use super::{open_store, print_json};

#[derive(Debug, Serialize)]
struct AssemblyView {
    #[serde(flatten)]
    assembly: Assembly,
    components: Vec<Component>,
    logs: Vec<LogRecord>,
}

pub async fn cmd_db(config: &Config, command: DbCommands) -> Result<()> {
    let store = open_store(config)?;
    match command {
        DbCommands::Init => {
            println!("Database ready at {}", config.worker.db_path.display());
        }
        DbCommands::AddAssembly {
            name,
            plan_id,
            workflow,
            tenant,
        } => {
            let new = NewAssembly {
                name,
                plan_id,
                workflow,
                tenant,
            };
            let assembly = store.call(move |db| db.create_assembly(&new)).await?;
            print_json(&assembly)?;
        }
        DbCommands::AddImage {
            name,
            artifact_type,
            status,
            external_ref,
            docker_image_name,
            tenant,
        } => {
            let new = NewImage {
                name,
                status,
                external_ref,
                docker_image_name,
                source_format: "docker".to_string(),
                artifact_type,
                base_image_id: None,
                tenant,
            };
            let image = store.call(move |db| db.create_image(&new)).await?;
            print_json(&image)?;
        }
        DbCommands::ShowAssembly { id } => {
            let view = store
                .call(move |db| {
                    let Some(assembly) = db.get_assembly(id)? else {
                        return Ok(None);
                    };
                    let components = db.list_components(id)?;
                    let logs = db.list_logs(&assembly.uuid)?;
                    Ok(Some(AssemblyView {
                        assembly,
                        components,
                        logs,
                    }))
                })
                .await?
                .with_context(|| format!("Assembly {} not found", id))?;
            print_json(&view)?;
        }
    }
    Ok(())
}
