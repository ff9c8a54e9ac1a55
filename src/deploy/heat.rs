//! Orchestration service (Heat) client.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;

use crate::config::DeployerConfig;
use crate::errors::DeployError;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StackOutput {
    pub output_key: String,
    #[serde(default)]
    pub output_value: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StackInfo {
    pub id: String,
    pub stack_name: String,
    pub stack_status: String,
    #[serde(default)]
    pub stack_status_reason: Option<String>,
    #[serde(default)]
    pub outputs: Vec<StackOutput>,
}

#[async_trait]
pub trait StackService: Send + Sync {
    async fn get_stack(&self, name: &str) -> Result<Option<StackInfo>, DeployError>;

    /// Returns the new stack's id.
    async fn create_stack(
        &self,
        name: &str,
        template: &str,
        parameters: &BTreeMap<String, String>,
    ) -> Result<String, DeployError>;

    async fn update_stack(
        &self,
        name: &str,
        id: &str,
        template: &str,
        parameters: &BTreeMap<String, String>,
    ) -> Result<(), DeployError>;

    /// Start deleting a stack; a missing stack is not an error.
    async fn delete_stack(&self, name: &str, id: &str) -> Result<(), DeployError>;
}

pub struct HeatClient {
    client: reqwest::Client,
    base: String,
    token: Option<String>,
}

#[derive(Deserialize)]
struct StackEnvelope {
    stack: StackInfo,
}

#[derive(Deserialize)]
struct CreatedStack {
    id: String,
}

#[derive(Deserialize)]
struct CreatedEnvelope {
    stack: CreatedStack,
}

impl HeatClient {
    pub fn new(config: &DeployerConfig) -> Result<Self, DeployError> {
        let base = config
            .heat_url
            .as_deref()
            .ok_or_else(|| DeployError::orchestration("connect", "deployer.heat_url is not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| DeployError::orchestration("connect", e))?;
        Ok(Self {
            client,
            base: base.trim_end_matches('/').to_string(),
            token: config.auth_token.clone(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let req = self
            .client
            .request(method, format!("{}{}", self.base, path))
            .header("Accept", "application/json");
        match &self.token {
            Some(token) => req.header("X-Auth-Token", token),
            None => req,
        }
    }
}

async fn failure(op: &'static str, resp: reqwest::Response) -> DeployError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    DeployError::orchestration(op, format!("HTTP {}: {}", status, body.trim()))
}

#[async_trait]
impl StackService for HeatClient {
    async fn get_stack(&self, name: &str) -> Result<Option<StackInfo>, DeployError> {
        let resp = self
            .request(reqwest::Method::GET, &format!("/stacks/{}", name))
            .send()
            .await
            .map_err(|e| DeployError::orchestration("get stack", e))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(failure("get stack", resp).await);
        }
        let envelope: StackEnvelope = resp
            .json()
            .await
            .map_err(|e| DeployError::orchestration("get stack", e))?;
        Ok(Some(envelope.stack))
    }

    async fn create_stack(
        &self,
        name: &str,
        template: &str,
        parameters: &BTreeMap<String, String>,
    ) -> Result<String, DeployError> {
        let body = json!({
            "stack_name": name,
            "template": template,
            "parameters": parameters,
        });
        let resp = self
            .request(reqwest::Method::POST, "/stacks")
            .json(&body)
            .send()
            .await
            .map_err(|e| DeployError::orchestration("create stack", e))?;
        if !resp.status().is_success() {
            return Err(failure("create stack", resp).await);
        }
        let created: CreatedEnvelope = resp
            .json()
            .await
            .map_err(|e| DeployError::orchestration("create stack", e))?;
        tracing::info!(stack = name, id = %created.stack.id, "stack create requested");
        Ok(created.stack.id)
    }

    async fn update_stack(
        &self,
        name: &str,
        id: &str,
        template: &str,
        parameters: &BTreeMap<String, String>,
    ) -> Result<(), DeployError> {
        let body = json!({
            "template": template,
            "parameters": parameters,
        });
        let resp = self
            .request(reqwest::Method::PUT, &format!("/stacks/{}/{}", name, id))
            .json(&body)
            .send()
            .await
            .map_err(|e| DeployError::orchestration("update stack", e))?;
        if !resp.status().is_success() {
            return Err(failure("update stack", resp).await);
        }
        tracing::info!(stack = name, id, "stack update requested");
        Ok(())
    }

    async fn delete_stack(&self, name: &str, id: &str) -> Result<(), DeployError> {
        let resp = self
            .request(reqwest::Method::DELETE, &format!("/stacks/{}/{}", name, id))
            .send()
            .await
            .map_err(|e| DeployError::orchestration("delete stack", e))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        if !resp.status().is_success() {
            return Err(failure("delete stack", resp).await);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    fn client(url: &str) -> HeatClient {
        HeatClient::new(&DeployerConfig {
            heat_url: Some(format!("{}/v1/tenant", url)),
            auth_token: Some("tok".into()),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn missing_stack_is_none() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/v1/tenant/stacks/app-1")
            .with_status(404)
            .create_async()
            .await;
        assert!(client(&server.url()).get_stack("app-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn get_stack_parses_status_and_outputs() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/v1/tenant/stacks/app-1")
            .match_header("x-auth-token", "tok")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"stack": {"id": "s-1", "stack_name": "app-1",
                    "stack_status": "CREATE_COMPLETE",
                    "outputs": [{"output_key": "public_ip", "output_value": "172.24.4.10"}]}}"#,
            )
            .create_async()
            .await;

        let stack = client(&server.url())
            .get_stack("app-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stack.id, "s-1");
        assert_eq!(stack.stack_status, "CREATE_COMPLETE");
        assert_eq!(stack.outputs[0].output_value, "172.24.4.10");
    }

    #[tokio::test]
    async fn create_stack_sends_template_and_parameters() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/tenant/stacks")
            .match_body(Matcher::PartialJson(json!({
                "stack_name": "app-1",
                "parameters": {"flavor": "m1.small"}
            })))
            .with_status(201)
            .with_body(r#"{"stack": {"id": "s-9"}}"#)
            .create_async()
            .await;

        let mut params = BTreeMap::new();
        params.insert("flavor".to_string(), "m1.small".to_string());
        let id = client(&server.url())
            .create_stack("app-1", "heat_template_version: 2013-05-23\n", &params)
            .await
            .unwrap();
        assert_eq!(id, "s-9");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn update_failure_carries_body() {
        let mut server = Server::new_async().await;
        server
            .mock("PUT", "/v1/tenant/stacks/app-1/s-1")
            .with_status(409)
            .with_body("stack is locked")
            .create_async()
            .await;
        let err = client(&server.url())
            .update_stack("app-1", "s-1", "", &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("stack is locked"));
    }
}
