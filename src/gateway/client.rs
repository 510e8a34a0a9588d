use anyhow::{Context, Result};
use reqwest::Client;
use std::time::Duration;
use tracing::warn;

use super::{GatewayRequest, GatewayResult};

/// Async client for the host gateway. Transport failures never surface as
/// errors to the caller: they come back as a [`GatewayResult`] with `error`
/// set, so tools can relay them to the agent as ordinary text.
pub struct GatewayClient {
    base_url: String,
    token: Option<String>,
}

impl GatewayClient {
    pub fn new(base_url: &str, token: Option<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn client_for(&self, timeout_secs: u64) -> Result<Client> {
        let mut builder = Client::builder();
        // Leave room for the gateway's own subprocess timeout to fire first.
        if timeout_secs > 0 {
            builder = builder.timeout(Duration::from_secs(timeout_secs + 10));
        }
        builder.build().context("building gateway HTTP client")
    }

    /// Execute a command via the gateway. `timeout` 0 means no limit.
    pub async fn execute(
        &self,
        bridge: &str,
        cmd: Vec<String>,
        cwd: Option<String>,
        timeout: u64,
    ) -> GatewayResult {
        let client = match self.client_for(timeout) {
            Ok(client) => client,
            Err(e) => return GatewayResult::transport_error(format!("Gateway error: {e}")),
        };

        let payload = GatewayRequest {
            bridge: bridge.to_string(),
            cmd,
            cwd,
            timeout: Some(timeout),
        };

        let mut req = client
            .post(format!("{}/execute", self.base_url))
            .json(&payload);
        if let Some(token) = &self.token {
            req = req.header("Authorization", format!("Bearer {}", token));
        }

        let resp = match req.send().await {
            Ok(resp) => resp,
            Err(e) if e.is_connect() => {
                return GatewayResult::transport_error(
                    "Cannot connect to host gateway. Is the gateway server running?",
                );
            }
            Err(e) if e.is_timeout() => {
                return GatewayResult::transport_error("Gateway request timed out.");
            }
            Err(e) => {
                warn!("Gateway request failed: {}", e);
                return GatewayResult::transport_error(format!("Gateway error: {e}"));
            }
        };

        let status = resp.status();
        if status.as_u16() == 401 {
            return GatewayResult::transport_error("Gateway auth failed. Check gateway.token.");
        }
        if status.as_u16() == 403 {
            let message = resp
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
                .unwrap_or_else(|| "Forbidden (403)".to_string());
            return GatewayResult::transport_error(message);
        }
        if !status.is_success() {
            return GatewayResult::transport_error(format!("Gateway returned HTTP {}", status));
        }

        match resp.json::<GatewayResult>().await {
            Ok(result) => result,
            Err(e) => GatewayResult::transport_error(format!("Gateway error: {e}")),
        }
    }

    /// Probe the gateway health endpoint. Returns (reachable, payload).
    pub async fn health(&self) -> (bool, serde_json::Value) {
        let client = match self.client_for(10) {
            Ok(client) => client,
            Err(e) => return (false, serde_json::json!({ "error": e.to_string() })),
        };
        let mut req = client.get(format!("{}/health", self.base_url));
        if let Some(token) = &self.token {
            req = req.header("Authorization", format!("Bearer {}", token));
        }
        match req.send().await {
            Ok(resp) if resp.status().is_success() => {
                let body = resp.json().await.unwrap_or(serde_json::Value::Null);
                (true, body)
            }
            Ok(resp) => (
                false,
                serde_json::json!({ "error": format!("HTTP {}", resp.status()) }),
            ),
            Err(e) if e.is_connect() => (
                false,
                serde_json::json!({ "error": "Cannot connect to host gateway" }),
            ),
            Err(e) => (false, serde_json::json!({ "error": e.to_string() })),
        }
    }
}
