//! Build jobs: `slipway run` and `slipway build-lp`.

use anyhow::{Context, Result};
use slipway_common::Stage;
use std::path::Path;
use std::sync::Arc;

use slipway::config::Config;
use slipway::pipeline::{JobSpec, Pipeline, SourceSpec};

use super::{Services, print_json};

pub fn load_job(path: &Path) -> Result<JobSpec> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read job file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse job file: {}", path.display()))
}

pub async fn cmd_run(config: &Config, job: &Path) -> Result<bool> {
    let spec = load_job(job)?;
    let services = Services::connect(config)?;
    let mut pipeline = Pipeline::new(
        config,
        services.runtime.clone(),
        services.store.clone(),
        services.persister.clone(),
    );

    let wants_deploy = spec
        .workflow
        .as_ref()
        .is_none_or(|w| w.contains(Stage::Deploy));
    if wants_deploy {
        match services.deployer(config) {
            Ok(engine) => pipeline = pipeline.with_deployer(Arc::new(engine)),
            Err(e) => tracing::warn!(error = %format!("{:#}", e), "deploy handoff unavailable"),
        }
    }

    let report = pipeline.run(&spec).await;
    print_json(&report)?;
    Ok(report.succeeded())
}

pub async fn cmd_build_lp(
    config: &Config,
    image_id: i64,
    source: &str,
    revision: &str,
) -> Result<bool> {
    let services = Services::connect(config)?;
    let pipeline = Pipeline::new(
        config,
        services.runtime.clone(),
        services.store.clone(),
        services.persister.clone(),
    );
    let report = pipeline
        .build_language_pack(
            image_id,
            &SourceSpec {
                url: source.to_string(),
                revision: revision.to_string(),
            },
        )
        .await;
    print_json(&report)?;
    Ok(report.error.is_none())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn job_file_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("job.json");
        std::fs::write(
            &path,
            r#"{"assembly_id": 3, "language_pack_id": 1,
                "source": {"url": "https://git.example.com/app.git"},
                "workflow": ["build", "deploy"], "ports": [8080]}"#,
        )
        .unwrap();

        let spec = load_job(&path).unwrap();
        assert_eq!(spec.assembly_id, 3);
        assert_eq!(spec.source.revision, "");
        assert_eq!(spec.ports, vec![8080]);
        assert!(spec.test_cmd.is_none());
        assert!(spec.workflow.unwrap().contains(Stage::Deploy));
    }

    #[test]
    fn malformed_job_file_names_the_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("job.json");
        std::fs::write(&path, "{").unwrap();
        let err = load_job(&path).unwrap_err();
        assert!(err.to_string().contains("job.json"));
    }
}
