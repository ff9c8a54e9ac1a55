//! Stack strategies, keyed by image format and storage backend.

use std::collections::BTreeMap;

use serde_yaml::{Mapping, Value};
use slipway_common::{ImageFormat, StorageBackend};

use super::network::NetworkParams;
use crate::config::DeployerConfig;
use crate::docker::shell_quote;
use crate::errors::DeployError;

const CONTAINER_HOST_TEMPLATE: &str = include_str!("templates/coreos.yaml");
const VM_TEMPLATE: &str = include_str!("templates/vm.yaml");
const DEFAULT_PORT: u16 = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackStrategy {
    /// Container host downloads the saved image through a temporary URL.
    DockerSwift,
    /// Container host pulls the image from the registry.
    DockerRegistry,
    /// Server boots from the stored image.
    VmSwift,
}

/// What a stack is built from.
#[derive(Debug, Clone)]
pub struct StackRequest<'a> {
    pub name: &'a str,
    pub network: &'a NetworkParams,
    pub ports: &'a [u16],
    pub tag: &'a str,
    pub image_name: &'a str,
    pub download_url: Option<&'a str>,
}

impl StackStrategy {
    pub fn select(format: ImageFormat, backend: StorageBackend) -> Result<Self, DeployError> {
        match (format, backend) {
            (ImageFormat::Docker, StorageBackend::Swift) => Ok(Self::DockerSwift),
            (ImageFormat::Docker, StorageBackend::DockerRegistry) => Ok(Self::DockerRegistry),
            (ImageFormat::Vm, StorageBackend::Swift) => Ok(Self::VmSwift),
            (format, backend) => Err(DeployError::UnsupportedStrategy {
                format: format.to_string(),
                backend: backend.to_string(),
            }),
        }
    }

    pub fn needs_download_url(&self) -> bool {
        matches!(self, Self::DockerSwift)
    }

    fn base_template(&self) -> &'static str {
        match self {
            Self::DockerSwift | Self::DockerRegistry => CONTAINER_HOST_TEMPLATE,
            Self::VmSwift => VM_TEMPLATE,
        }
    }

    /// Template with a TCP ingress rule per port. `key_name` is dropped when
    /// no key pair is configured.
    pub fn render(&self, ports: &[u16], with_key: bool) -> Result<String, DeployError> {
        let mut doc: Value = serde_yaml::from_str(self.base_template())
            .map_err(|e| DeployError::orchestration("render template", e))?;

        let rules = doc
            .get_mut("resources")
            .and_then(|r| r.get_mut("security_group"))
            .and_then(|s| s.get_mut("properties"))
            .and_then(|p| p.get_mut("rules"))
            .and_then(Value::as_sequence_mut)
            .ok_or_else(|| DeployError::orchestration("render template", "no security group rules"))?;
        for port in ports {
            let mut rule = Mapping::new();
            rule.insert("protocol".into(), "tcp".into());
            rule.insert("port_range_min".into(), Value::Number(u64::from(*port).into()));
            rule.insert("port_range_max".into(), Value::Number(u64::from(*port).into()));
            rule.insert("remote_ip_prefix".into(), "0.0.0.0/0".into());
            rules.push(Value::Mapping(rule));
        }

        if !with_key {
            let props = doc
                .get_mut("resources")
                .and_then(|r| r.get_mut("compute"))
                .and_then(|c| c.get_mut("properties"))
                .and_then(Value::as_mapping_mut);
            if let Some(props) = props {
                props.remove("key_name");
            }
        }

        serde_yaml::to_string(&doc).map_err(|e| DeployError::orchestration("render template", e))
    }

    pub fn parameters(
        &self,
        config: &DeployerConfig,
        req: &StackRequest<'_>,
    ) -> Result<BTreeMap<String, String>, DeployError> {
        let mut params = BTreeMap::new();
        params.insert("name".to_string(), req.name.to_string());
        params.insert("flavor".to_string(), config.flavor.clone());
        let port = req.ports.first().copied().unwrap_or(DEFAULT_PORT);
        params.insert("port".to_string(), port.to_string());
        params.insert("public_net".to_string(), req.network.public_net.clone());
        params.insert("private_net".to_string(), req.network.private_net.clone());
        params.insert(
            "private_subnet".to_string(),
            req.network.private_subnet.clone(),
        );
        if let Some(key) = &config.key_name {
            params.insert("key_name".to_string(), key.clone());
        }

        match self {
            Self::DockerSwift => {
                let url = req.download_url.ok_or_else(|| {
                    DeployError::orchestration("render template", "artifact has no download url")
                })?;
                params.insert("image".to_string(), config.host_image.clone());
                params.insert(
                    "user_data".to_string(),
                    boot_script(Some(url), req.tag, req.ports),
                );
            }
            Self::DockerRegistry => {
                params.insert("image".to_string(), config.host_image.clone());
                params.insert("user_data".to_string(), boot_script(None, req.tag, req.ports));
            }
            Self::VmSwift => {
                params.insert("image".to_string(), req.image_name.to_string());
            }
        }
        Ok(params)
    }
}

/// Host boot script: obtain the image, then run it publishing every port.
pub fn boot_script(download_url: Option<&str>, tag: &str, ports: &[u16]) -> String {
    let mut script = String::from("#!/bin/sh\nset -e\n");
    match download_url {
        Some(url) => {
            script.push_str(&format!(
                "curl -fsSL --retry 5 -o /tmp/app.tar {}\n",
                shell_quote(url)
            ));
            script.push_str("docker load -i /tmp/app.tar\n");
        }
        None => script.push_str(&format!("docker pull {}\n", shell_quote(tag))),
    }
    let publish: String = ports
        .iter()
        .map(|p| format!(" -p {}:{}", p, p))
        .collect();
    script.push_str(&format!(
        "docker run -d --restart always --name app{} {}\n",
        publish,
        shell_quote(tag)
    ));
    script
}
