//! Network service (Neutron) lookups.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::DeployerConfig;
use crate::errors::DeployError;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Network {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "router:external", default)]
    pub external: bool,
    #[serde(default)]
    pub subnets: Vec<String>,
}

/// Networks a stack is wired into.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkParams {
    pub public_net: String,
    pub private_net: String,
    pub private_subnet: String,
}

#[async_trait]
pub trait NetworkService: Send + Sync {
    async fn list_networks(&self) -> Result<Vec<Network>, DeployError>;
}

/// First external network is public; first internal one with a subnet is
/// private.
pub async fn resolve(service: &dyn NetworkService) -> Result<NetworkParams, DeployError> {
    let networks = service.list_networks().await?;
    let public = networks
        .iter()
        .find(|n| n.external)
        .ok_or_else(|| DeployError::Network("no external network".to_string()))?;
    let private = networks
        .iter()
        .find(|n| !n.external && !n.subnets.is_empty())
        .ok_or_else(|| DeployError::Network("no private network with a subnet".to_string()))?;
    Ok(NetworkParams {
        public_net: public.id.clone(),
        private_net: private.id.clone(),
        private_subnet: private.subnets[0].clone(),
    })
}

pub struct NeutronClient {
    client: reqwest::Client,
    base: String,
    token: Option<String>,
}

#[derive(Deserialize)]
struct NetworkList {
    networks: Vec<Network>,
}

impl NeutronClient {
    pub fn new(config: &DeployerConfig) -> Result<Self, DeployError> {
        let base = config
            .neutron_url
            .as_deref()
            .ok_or_else(|| DeployError::Network("deployer.neutron_url is not set".to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| DeployError::Network(e.to_string()))?;
        Ok(Self {
            client,
            base: base.trim_end_matches('/').to_string(),
            token: config.auth_token.clone(),
        })
    }
}

#[async_trait]
impl NetworkService for NeutronClient {
    async fn list_networks(&self) -> Result<Vec<Network>, DeployError> {
        let mut req = self.client.get(format!("{}/v2.0/networks", self.base));
        if let Some(token) = &self.token {
            req = req.header("X-Auth-Token", token);
        }
        let list: NetworkList = req
            .send()
            .await
            .map_err(|e| DeployError::Network(e.to_string()))?
            .error_for_status()
            .map_err(|e| DeployError::Network(e.to_string()))?
            .json()
            .await
            .map_err(|e| DeployError::Network(e.to_string()))?;
        Ok(list.networks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;

    struct Fixed(Vec<Network>);

    #[async_trait]
    impl NetworkService for Fixed {
        async fn list_networks(&self) -> Result<Vec<Network>, DeployError> {
            Ok(self.0.clone())
        }
    }

    fn net(id: &str, external: bool, subnets: &[&str]) -> Network {
        Network {
            id: id.into(),
            name: id.into(),
            external,
            subnets: subnets.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn resolve_picks_public_and_private() {
        let svc = Fixed(vec![
            net("empty", false, &[]),
            net("ext", true, &["ext-sub"]),
            net("priv", false, &["priv-sub", "other"]),
        ]);
        let params = resolve(&svc).await.unwrap();
        assert_eq!(params.public_net, "ext");
        assert_eq!(params.private_net, "priv");
        assert_eq!(params.private_subnet, "priv-sub");
    }

    #[tokio::test]
    async fn resolve_without_external_network_fails() {
        let svc = Fixed(vec![net("priv", false, &["s"])]);
        assert!(matches!(resolve(&svc).await, Err(DeployError::Network(_))));
    }

    #[tokio::test]
    async fn neutron_client_reads_router_external() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/v2.0/networks")
            .with_status(200)
            .with_body(
                r#"{"networks": [
                    {"id": "n1", "name": "public", "router:external": true, "subnets": ["s1"]},
                    {"id": "n2", "name": "private", "subnets": ["s2"]}
                ]}"#,
            )
            .create_async()
            .await;
        let client = NeutronClient::new(&DeployerConfig {
            neutron_url: Some(server.url()),
            ..Default::default()
        })
        .unwrap();

        let networks = client.list_networks().await.unwrap();
        assert!(networks[0].external);
        assert!(!networks[1].external);
        assert_eq!(networks[1].subnets, vec!["s2".to_string()]);
    }
}
