//! Stack commands: `slipway deploy` and `slipway destroy`.

use anyhow::Result;
use serde::Serialize;
use slipway_common::AssemblyStatus;

use slipway::config::Config;
use slipway::pipeline::Artifact;
use slipway::store::MetadataStore;

use super::{Services, print_json};

#[derive(Debug, Serialize)]
struct DeployReport {
    assembly_id: i64,
    status: Option<AssemblyStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    application_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct DestroyReport {
    assembly_id: i64,
    destroyed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<AssemblyStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub async fn cmd_deploy(
    config: &Config,
    assembly_id: i64,
    location: Option<String>,
    image_name: &str,
    ports: &[u16],
) -> Result<bool> {
    let services = Services::connect(config)?;
    let engine = services.deployer(config)?;
    let image_id = services
        .store
        .get_assembly(assembly_id)
        .await?
        .and_then(|a| a.image_id)
        .unwrap_or_default();
    let artifact = Artifact {
        image_id,
        location,
        image_name: image_name.to_string(),
        tag: services.persister.image_tag(image_name),
    };

    let result = engine.deploy(assembly_id, &artifact, ports).await;
    let status = services
        .store
        .get_assembly(assembly_id)
        .await?
        .map(|a| a.status);
    let report = match result {
        Ok(uri) => DeployReport {
            assembly_id,
            status,
            application_uri: Some(uri),
            error: None,
        },
        Err(e) => DeployReport {
            assembly_id,
            status,
            application_uri: None,
            error: Some(e.to_string()),
        },
    };
    print_json(&report)?;
    Ok(report.error.is_none())
}

pub async fn cmd_destroy(config: &Config, assembly_id: i64) -> Result<bool> {
    let services = Services::connect(config)?;
    let engine = services.deployer(config)?;
    let result = engine.destroy(assembly_id).await;
    let status = services
        .store
        .get_assembly(assembly_id)
        .await?
        .map(|a| a.status);
    let report = DestroyReport {
        assembly_id,
        destroyed: result.is_ok(),
        status,
        error: result.err().map(|e| e.to_string()),
    };
    print_json(&report)?;
    Ok(report.destroyed)
}
