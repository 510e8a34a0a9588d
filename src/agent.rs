use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::events::Event;

/// The chat a message originated from, carried explicitly through the agent
/// invocation so tools (the schedule tool in particular) can bind new work
/// back to the right channel and chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatContext {
    pub channel: String,
    pub chat_id: String,
}

/// Content of a single user turn: plain text, or text plus one inline image.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    Text(String),
    TextWithImage {
        text: String,
        image_base64: String,
        mime_type: String,
    },
}

#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub thread_id: String,
    pub content: MessageContent,
    /// Originating chat, when the invocation came from a live conversation.
    /// Scheduler-driven invocations leave this unset.
    pub origin: Option<ChatContext>,
    /// Per-invocation model tier hint. Scoped to this request only; nothing
    /// ambient to restore afterwards.
    pub model_tier: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AgentReply {
    pub events: Vec<Event>,
}

impl AgentReply {
    /// The final reply text: the content of the last text event, or empty.
    pub fn final_text(&self) -> &str {
        self.events
            .iter()
            .rev()
            .find_map(|e| match e {
                Event::Text { content } => Some(content.as_str()),
                _ => None,
            })
            .unwrap_or("")
    }
}

/// The LLM-driven agent, modeled as an opaque callable. The runtime never
/// looks inside: it hands over a framed turn under a thread identity and gets
/// back ordered events.
#[async_trait]
pub trait Agent: Send + Sync {
    async fn invoke(&self, request: AgentRequest) -> Result<AgentReply>;
}

// ── HTTP-backed agent ──

#[derive(Serialize)]
struct InvokePayload<'a> {
    thread_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    model_tier: Option<&'a str>,
    /// Originating chat, passed through so tool callbacks can bind work to
    /// the right conversation.
    #[serde(skip_serializing_if = "Option::is_none")]
    origin: Option<&'a ChatContext>,
    messages: Vec<WireMessage>,
}

#[derive(Serialize)]
struct WireMessage {
    role: &'static str,
    content: serde_json::Value,
}

#[derive(Deserialize)]
struct InvokeResponse {
    #[serde(default)]
    events: Vec<Event>,
}

fn content_to_wire(content: &MessageContent) -> serde_json::Value {
    match content {
        MessageContent::Text(text) => serde_json::Value::String(text.clone()),
        MessageContent::TextWithImage {
            text,
            image_base64,
            mime_type,
        } => serde_json::json!([
            { "type": "text", "text": text },
            { "type": "image", "source": {
                "type": "base64",
                "media_type": mime_type,
                "data": image_base64,
            }},
        ]),
    }
}

/// Agent client for a runtime served over HTTP. Posts one user turn per call
/// and deserializes the structured event list from the response.
pub struct RemoteAgent {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl RemoteAgent {
    pub fn new(base_url: &str, token: Option<String>, timeout_secs: u64) -> Result<Self> {
        let mut builder = Client::builder();
        if timeout_secs > 0 {
            builder = builder.timeout(Duration::from_secs(timeout_secs));
        }
        Ok(Self {
            client: builder.build().context("building agent HTTP client")?,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }
}

#[async_trait]
impl Agent for RemoteAgent {
    async fn invoke(&self, request: AgentRequest) -> Result<AgentReply> {
        let payload = InvokePayload {
            thread_id: &request.thread_id,
            model_tier: request.model_tier.as_deref(),
            origin: request.origin.as_ref(),
            messages: vec![WireMessage {
                role: "user",
                content: content_to_wire(&request.content),
            }],
        };

        let mut req = self
            .client
            .post(format!("{}/invoke", self.base_url))
            .json(&payload);
        if let Some(token) = &self.token {
            req = req.header("Authorization", format!("Bearer {}", token));
        }

        let resp = req.send().await.context("agent request failed")?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("agent returned HTTP {}: {}", status, body));
        }

        let parsed: InvokeResponse = resp.json().await.context("parsing agent response")?;
        debug!(
            thread_id = %request.thread_id,
            events = parsed.events.len(),
            "Agent invocation complete"
        );
        Ok(AgentReply {
            events: parsed.events,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_text_is_last_text_event() {
        let reply = AgentReply {
            events: vec![
                Event::Text {
                    content: "draft".into(),
                },
                Event::ToolCall {
                    id: "t1".into(),
                    name: "Bash".into(),
                    input_summary: "ls".into(),
                    result_text: String::new(),
                    is_error: false,
                },
                Event::Text {
                    content: "final answer".into(),
                },
            ],
        };
        assert_eq!(reply.final_text(), "final answer");
    }

    #[test]
    fn final_text_is_empty_without_text_events() {
        let reply = AgentReply {
            events: vec![Event::Thinking {
                content: "hmm".into(),
            }],
        };
        assert_eq!(reply.final_text(), "");
    }

    #[test]
    fn multimodal_content_carries_image_block() {
        let wire = content_to_wire(&MessageContent::TextWithImage {
            text: "what is this?".into(),
            image_base64: "aGVsbG8=".into(),
            mime_type: "image/jpeg".into(),
        });
        assert_eq!(wire[0]["type"], "text");
        assert_eq!(wire[1]["source"]["media_type"], "image/jpeg");
    }
}
