pub mod client;
pub mod process;
pub mod server;

use serde::{Deserialize, Serialize};

pub use client::GatewayClient;
pub use server::GatewayServer;

/// Wire request for `POST /execute`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayRequest {
    pub bridge: String,
    pub cmd: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

/// Wire result for `POST /execute`. Application-level failures travel inside
/// a 200 response: `returncode` 127 means the binary was missing, -1 means
/// the command timed out. `error` is only ever set client-side, for
/// transport-level failures, and leaves `returncode` at 0.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayResult {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub returncode: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl GatewayResult {
    pub fn transport_error(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            ..Self::default()
        }
    }
}
