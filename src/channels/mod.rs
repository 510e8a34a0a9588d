pub mod telegram;

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;

use crate::agent::AgentReply;

/// Normalized incoming message from any channel adapter. Channels own the
/// wire-level work (media decoding, command detection); everything past this
/// struct is channel-agnostic.
#[derive(Debug, Clone, Default)]
pub struct IncomingMessage {
    pub channel: String,
    pub chat_id: String,
    pub user_id: String,
    pub user_name: String,
    pub text: String,
    pub is_private: bool,
    pub message_id: Option<String>,
    pub image_base64: Option<String>,
    pub image_mime_type: Option<String>,
    pub reset_session: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SendResult {
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub reply_to: Option<String>,
    /// Low-priority send: delivered without notifying the user. Used by the
    /// scheduler for task results.
    pub disable_notification: bool,
}

/// Receiver for normalized messages. `None` means "no response" — the
/// channel stays silent (unauthorized user, trigger miss, session reset).
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, msg: IncomingMessage) -> Option<AgentReply>;
}

/// A chat transport. Implementations serialize handling per chat and chunk
/// long outputs at their own wire limit.
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    /// Start receiving messages (non-blocking).
    async fn start(&self) -> Result<()>;

    /// Stop receiving and wait for in-flight handlers to finish.
    async fn stop(&self) -> Result<()>;

    async fn send(
        &self,
        chat_id: &str,
        text: &str,
        options: SendOptions,
    ) -> Result<Option<SendResult>>;

    async fn send_file(&self, chat_id: &str, path: &Path, caption: &str) -> Result<()>;
}
