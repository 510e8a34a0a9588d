use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

use crate::agent::AgentReply;
use crate::bridge::BridgeSessionManager;
use crate::channels::{IncomingMessage, MessageHandler};
use crate::events::Event;
use crate::router::MessageRouter;

fn text_reply(content: impl Into<String>) -> AgentReply {
    AgentReply {
        events: vec![Event::Text {
            content: content.into(),
        }],
    }
}

/// Front door for every normalized message. Bridge-mode users talk to their
/// CLI session directly; `/code`, `/exit`, `/model`, and `/effort` manage
/// that mode; everything else goes through the router.
pub struct Dispatcher {
    router: Arc<MessageRouter>,
    bridge: Option<Arc<BridgeSessionManager>>,
}

impl Dispatcher {
    pub fn new(router: Arc<MessageRouter>, bridge: Option<Arc<BridgeSessionManager>>) -> Self {
        Self { router, bridge }
    }

    /// Handle bridge-mode commands. Returns None when the text is not a
    /// command for the bridge manager.
    async fn bridge_command(
        &self,
        bridge: &BridgeSessionManager,
        msg: &IncomingMessage,
    ) -> Option<AgentReply> {
        let text = msg.text.trim();
        let user_id = msg.user_id.as_str();

        if let Some(rest) = text.strip_prefix("/code") {
            let mut parts = rest.split_whitespace();
            return match (parts.next(), parts.next()) {
                (Some(project), Some(path)) => {
                    if let Err(e) = bridge.enter(user_id, project, path, None).await {
                        warn!("Failed to enter bridge mode for {}: {:#}", user_id, e);
                        return Some(text_reply("Failed to enter bridge mode."));
                    }
                    Some(text_reply(format!(
                        "Bridge mode on: project '{}'. Messages now go to the CLI; /exit to leave.",
                        project
                    )))
                }
                _ => Some(text_reply("Usage: /code <project> <path>")),
            };
        }

        if !bridge.is_bridge_mode(user_id).await {
            return None;
        }

        if text == "/exit" {
            if let Err(e) = bridge.exit(user_id).await {
                warn!("Failed to exit bridge mode for {}: {:#}", user_id, e);
            }
            return Some(text_reply("Left bridge mode."));
        }
        if let Some(model) = text.strip_prefix("/model") {
            let model = model.trim();
            let value = (!model.is_empty()).then(|| model.to_string());
            if let Err(e) = bridge.set_model(user_id, value.clone()).await {
                warn!("Failed to set model for {}: {:#}", user_id, e);
            }
            return Some(text_reply(match value {
                Some(model) => format!("Model set to '{}'.", model),
                None => "Model reset to default.".to_string(),
            }));
        }
        if let Some(effort) = text.strip_prefix("/effort") {
            let effort = effort.trim();
            let value = (!effort.is_empty()).then(|| effort.to_string());
            if let Err(e) = bridge.set_effort(user_id, value.clone()).await {
                warn!("Failed to set effort for {}: {:#}", user_id, e);
            }
            return Some(text_reply(match value {
                Some(effort) => format!("Effort set to '{}'.", effort),
                None => "Effort reset to default.".to_string(),
            }));
        }
        None
    }
}

#[async_trait]
impl MessageHandler for Dispatcher {
    async fn handle(&self, msg: IncomingMessage) -> Option<AgentReply> {
        if let Some(bridge) = &self.bridge
            && !msg.reset_session
        {
            if let Some(reply) = self.bridge_command(bridge, &msg).await {
                return Some(reply);
            }
            if !msg.text.trim().is_empty() && bridge.is_bridge_mode(&msg.user_id).await {
                let response = bridge.send_message(&msg.user_id, msg.text.trim()).await;
                if !response.error.is_empty() {
                    return Some(text_reply(format!("❌ {}", response.error)));
                }
                return Some(AgentReply {
                    events: response.events,
                });
            }
        }
        self.router.handle(msg).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Agent, AgentRequest};
    use crate::config::{AppConfig, BridgeCliSection};
    use anyhow::Result;

    struct EchoAgent;

    #[async_trait]
    impl Agent for EchoAgent {
        async fn invoke(&self, _request: AgentRequest) -> Result<AgentReply> {
            Ok(text_reply("routed"))
        }
    }

    async fn dispatcher(dir: &std::path::Path) -> Dispatcher {
        let mut config = AppConfig::default();
        config.agent.data_dir = dir.to_path_buf();
        let router = Arc::new(
            MessageRouter::new(Arc::new(EchoAgent), &config)
                .await
                .unwrap(),
        );
        let section = BridgeCliSection {
            enabled: true,
            state_file: dir.join("bridge_states.json"),
            sessions_dir: dir.join("projects").to_string_lossy().into_owned(),
            ..BridgeCliSection::default()
        };
        let bridge = Arc::new(BridgeSessionManager::new(&section, None, vec![]).unwrap());
        Dispatcher::new(router, Some(bridge))
    }

    fn dm(text: &str) -> IncomingMessage {
        IncomingMessage {
            channel: "telegram".to_string(),
            chat_id: "42".to_string(),
            user_id: "7".to_string(),
            user_name: "Ada".to_string(),
            text: text.to_string(),
            is_private: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn code_command_enters_bridge_mode_and_exit_leaves() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(dir.path()).await;

        let reply = dispatcher.handle(dm("/code proj /home/me/proj")).await.unwrap();
        assert!(reply.final_text().contains("Bridge mode on"));
        assert!(
            dispatcher
                .bridge
                .as_ref()
                .unwrap()
                .is_bridge_mode("7")
                .await
        );

        let reply = dispatcher.handle(dm("/model opus")).await.unwrap();
        assert!(reply.final_text().contains("opus"));

        let reply = dispatcher.handle(dm("/exit")).await.unwrap();
        assert_eq!(reply.final_text(), "Left bridge mode.");
        assert!(
            !dispatcher
                .bridge
                .as_ref()
                .unwrap()
                .is_bridge_mode("7")
                .await
        );
    }

    #[tokio::test]
    async fn normal_messages_still_reach_the_router() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(dir.path()).await;
        let reply = dispatcher.handle(dm("hello")).await.unwrap();
        assert_eq!(reply.final_text(), "routed");
    }

    #[tokio::test]
    async fn incomplete_code_command_gets_usage() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(dir.path()).await;
        let reply = dispatcher.handle(dm("/code onlyproject")).await.unwrap();
        assert!(reply.final_text().starts_with("Usage:"));
    }
}
