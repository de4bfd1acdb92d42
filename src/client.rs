//! Thin client for the admin API, backing the `endpoint` and `deploy`
//! subcommands.

use std::collections::BTreeMap;

use anyhow::{Context, bail};
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use reqwest::{RequestBuilder, StatusCode};
use serde_json::{Value, json};

use edge_gateway_common::{DeployId, EndpointId, Runtime};

/// Header carrying the admin token.
const ADMIN_TOKEN_HEADER: &str = "X-Admin-Token";

/// Talks to a gateway's admin API.
#[derive(Debug, Clone)]
pub struct AdminClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl AdminClient {
    /// `base_url` includes the admin prefix, e.g. `http://127.0.0.1:8080/admin`.
    pub fn new(base_url: &str, token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    /// Create an endpoint; the server picks an id when `id` is `None`.
    pub async fn create_endpoint(
        &self,
        id: Option<&EndpointId>,
        name: &str,
        runtime: Runtime,
        environment: &BTreeMap<String, String>,
    ) -> anyhow::Result<Value> {
        let body = json!({
            "id": id.map(EndpointId::as_str),
            "name": name,
            "runtime": runtime.to_string(),
            "environment": environment,
        });
        self.send(self.http.post(self.url("/endpoints")).json(&body))
            .await
    }

    pub async fn list_endpoints(&self) -> anyhow::Result<Value> {
        self.send(self.http.get(self.url("/endpoints"))).await
    }

    /// Upload an artifact; it becomes the endpoint's active deploy.
    pub async fn deploy(
        &self,
        endpoint_id: &EndpointId,
        file_name: &str,
        artifact: Bytes,
    ) -> anyhow::Result<Value> {
        let part = Part::bytes(artifact.to_vec()).file_name(file_name.to_string());
        let form = Form::new().part("file", part);
        self.send(
            self.http
                .post(self.url(&format!("/endpoints/{endpoint_id}/deploys")))
                .multipart(form),
        )
        .await
    }

    pub async fn rollback(
        &self,
        endpoint_id: &EndpointId,
        deploy_id: &DeployId,
    ) -> anyhow::Result<Value> {
        self.send(
            self.http
                .post(self.url(&format!("/endpoints/{endpoint_id}/rollback")))
                .json(&json!({ "deploy_id": deploy_id.as_str() })),
        )
        .await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn send(&self, request: RequestBuilder) -> anyhow::Result<Value> {
        let response = request
            .header(ADMIN_TOKEN_HEADER, &self.token)
            .send()
            .await
            .context("Admin API request failed")?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            bail!("Admin API rejected the token");
        }

        let text = response
            .text()
            .await
            .context("Failed to read admin API response")?;

        if !status.is_success() {
            // Extractor rejections are plain text, handler errors are JSON
            let message = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|body| body["error"].as_str().map(str::to_string))
                .unwrap_or(text);
            bail!("Admin API answered {status}: {message}");
        }

        serde_json::from_str(&text)
            .with_context(|| format!("Admin API answered {status} without JSON"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edge_gateway_common::{EngineConfig, RuntimeConfig};
    use edge_gateway_server::{AdminRouterConfig, GatewayServer, ServerConfig, TestHandle};

    const TOKEN: &str = "cli-token";

    const HELLO: &str = r#"
        (module
            (import "wasi_snapshot_preview1" "fd_write"
                (func $fd_write (param i32 i32 i32 i32) (result i32)))
            (memory (export "memory") 1)
            (data (i32.const 16) "hello|200\n")
            (func (export "_start")
                (i32.store (i32.const 0) (i32.const 16))
                (i32.store (i32.const 4) (i32.const 10))
                (drop (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 8))))
        )
    "#;

    async fn start() -> TestHandle {
        let config = RuntimeConfig {
            engine: EngineConfig {
                pooling_allocator: false,
                ..Default::default()
            },
            ..Default::default()
        };
        GatewayServer::new(&config, ServerConfig::default())
            .unwrap()
            .with_admin(AdminRouterConfig {
                prefix: "/admin".into(),
                token: TOKEN.into(),
            })
            .start_test()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_deploy_and_rollback() {
        let server = start().await;
        let client = AdminClient::new(&format!("{}/admin/", server.url()), TOKEN);
        let api = EndpointId::new("api");

        let endpoint = client
            .create_endpoint(Some(&api), "api", Runtime::Go, &BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(endpoint["id"], "api");

        let wasm = Bytes::from(wat::parse_str(HELLO).unwrap());
        let first = client.deploy(&api, "a.wasm", wasm.clone()).await.unwrap();
        client.deploy(&api, "b.wasm", wasm).await.unwrap();

        let first_id = DeployId::new(first["id"].as_str().unwrap());
        let endpoint = client.rollback(&api, &first_id).await.unwrap();
        assert_eq!(endpoint["active_deploy_id"], first_id.as_str());

        let listed = client.list_endpoints().await.unwrap();
        assert_eq!(listed["count"], 1);

        let response = reqwest::get(format!("{}/functions/api", server.url()))
            .await
            .unwrap();
        assert_eq!(response.text().await.unwrap(), "hello");

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_errors_surface_server_message() {
        let server = start().await;
        let client = AdminClient::new(&format!("{}/admin", server.url()), TOKEN);

        let err = client
            .rollback(&EndpointId::new("missing"), &DeployId::new("d1"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("404"), "unexpected error: {err}");

        let intruder = AdminClient::new(&format!("{}/admin", server.url()), "wrong");
        let err = intruder.list_endpoints().await.unwrap_err();
        assert!(err.to_string().contains("token"), "unexpected error: {err}");

        server.shutdown().await;
    }
}
