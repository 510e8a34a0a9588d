use std::collections::HashMap;

use crate::gateway::GatewayClient;

const MAX_OUTPUT_LENGTH: usize = 15_000;

/// Host execution tool: runs allowlisted commands on the host through the
/// gateway. The output is always agent-facing text — process failures are
/// narrated, not raised, so the agent can reason about them.
pub struct HostTools {
    client: GatewayClient,
    bridges: HashMap<String, Vec<String>>,
    default_timeout: u64,
}

impl HostTools {
    pub fn new(
        client: GatewayClient,
        bridges: HashMap<String, Vec<String>>,
        default_timeout: u64,
    ) -> Self {
        Self {
            client,
            bridges,
            default_timeout,
        }
    }

    /// Execute `command` (a shell-style string, split without a shell) on
    /// the named bridge. `timeout` 0 means "use the configured default".
    pub async fn host_execute(&self, bridge: &str, command: &str, timeout: u64) -> String {
        if !self.bridges.contains_key(bridge) {
            let mut available: Vec<&str> = self.bridges.keys().map(String::as_str).collect();
            available.sort_unstable();
            let available = if available.is_empty() {
                "(none)".to_string()
            } else {
                available.join(", ")
            };
            return format!("Error: unknown bridge '{}'. Available: {}", bridge, available);
        }

        let Some(cmd) = shlex::split(command) else {
            return "Error: invalid command syntax.".to_string();
        };
        if cmd.is_empty() {
            return "Error: empty command.".to_string();
        }

        let effective_timeout = if timeout > 0 {
            timeout
        } else {
            self.default_timeout
        };

        let result = self
            .client
            .execute(bridge, cmd, None, effective_timeout)
            .await;

        if !result.error.is_empty() {
            return format!("Error: {}", result.error);
        }

        let mut output = result.stdout.trim().to_string();
        if result.returncode != 0 {
            let stderr = result.stderr.trim();
            output = if !stderr.is_empty() {
                format!("Command failed (exit {}):\n{}", result.returncode, stderr)
            } else if !output.is_empty() {
                format!("Command failed (exit {}):\n{}", result.returncode, output)
            } else {
                format!("Command failed with exit code {}.", result.returncode)
            };
        }

        if output.is_empty() {
            return "(no output)".to_string();
        }
        if output.len() > MAX_OUTPUT_LENGTH {
            let cut = output
                .char_indices()
                .take_while(|(i, _)| *i < MAX_OUTPUT_LENGTH)
                .last()
                .map(|(i, c)| i + c.len_utf8())
                .unwrap_or(MAX_OUTPUT_LENGTH);
            output.truncate(cut);
            output.push_str("\n\n... (truncated)");
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tools() -> HostTools {
        let client = GatewayClient::new("http://127.0.0.1:1", None);
        let mut bridges = HashMap::new();
        bridges.insert("apple-notes".to_string(), vec!["memo".to_string()]);
        HostTools::new(client, bridges, 30)
    }

    #[tokio::test]
    async fn unknown_bridge_lists_available() {
        let out = tools().host_execute("spotify", "spogo play", 0).await;
        assert!(out.starts_with("Error: unknown bridge 'spotify'"));
        assert!(out.contains("apple-notes"));
    }

    #[tokio::test]
    async fn empty_command_is_rejected_before_transport() {
        let out = tools().host_execute("apple-notes", "   ", 0).await;
        assert_eq!(out, "Error: empty command.");
    }

    #[tokio::test]
    async fn transport_failure_is_narrated_not_raised() {
        // Port 1 refuses connections; the tool must relay the client's
        // uniform error envelope.
        let out = tools().host_execute("apple-notes", "memo list", 1).await;
        assert!(out.starts_with("Error:"), "got: {}", out);
    }
}
