use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use teloxide::net::Download;
use teloxide::payloads::{SendDocumentSetters, SendMessageSetters};
use teloxide::prelude::*;
use teloxide::types::{BotCommand, ChatAction, InputFile};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::{Channel, IncomingMessage, MessageHandler, SendOptions, SendResult};
use crate::transcription::Transcriber;

/// Telegram's hard limit for one message.
const MESSAGE_CHUNK_LIMIT: usize = 4096;

/// Split a reply into chunks Telegram will accept, breaking on char
/// boundaries.
fn chunk_text(text: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if current.len() + ch.len_utf8() > MESSAGE_CHUNK_LIMIT {
            chunks.push(std::mem::take(&mut current));
        }
        current.push(ch);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Telegram adapter: long-polls updates, normalizes them into
/// [`IncomingMessage`], serializes handling per chat, and chunks replies at
/// the wire limit.
pub struct TelegramChannel {
    bot: Bot,
    handler: Arc<dyn MessageHandler>,
    transcriber: Option<Arc<Transcriber>>,
    repl_handle: Mutex<Option<JoinHandle<()>>>,
    // Handlers hold read guards; stop() takes the write side to wait for
    // in-flight turns.
    work_gate: Arc<RwLock<()>>,
    chat_locks: Arc<Mutex<HashMap<i64, Arc<Mutex<()>>>>>,
}

impl TelegramChannel {
    pub fn new(
        token: &str,
        handler: Arc<dyn MessageHandler>,
        transcriber: Option<Arc<Transcriber>>,
    ) -> Self {
        Self {
            bot: Bot::new(token),
            handler,
            transcriber,
            repl_handle: Mutex::new(None),
            work_gate: Arc::new(RwLock::new(())),
            chat_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

async fn chat_lock(
    locks: &Mutex<HashMap<i64, Arc<Mutex<()>>>>,
    chat_id: i64,
) -> Arc<Mutex<()>> {
    let mut locks = locks.lock().await;
    locks
        .entry(chat_id)
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

/// Download a voice or audio attachment and turn it into text. Failures are
/// reported to the chat and end the update.
async fn transcribe_voice(
    bot: &Bot,
    msg: &Message,
    transcriber: Option<&Transcriber>,
) -> Option<String> {
    let configured = transcriber.filter(|t| t.is_configured());
    let Some(transcriber) = configured else {
        info!(
            "Transcription not configured, rejecting voice from chat {}",
            msg.chat.id
        );
        let _ = bot
            .send_message(
                msg.chat.id,
                "Voice messages are not supported (transcription not configured).",
            )
            .await;
        return None;
    };

    let _ = bot.send_chat_action(msg.chat.id, ChatAction::Typing).await;

    let (file_id, filename, mime_type) = if let Some(voice) = msg.voice() {
        (
            voice.file.id.clone(),
            "voice.ogg".to_string(),
            "audio/ogg".to_string(),
        )
    } else {
        let audio = msg.audio()?;
        (
            audio.file.id.clone(),
            audio
                .file_name
                .clone()
                .unwrap_or_else(|| "audio.mp3".to_string()),
            audio
                .mime_type
                .as_ref()
                .map(|m| m.to_string())
                .unwrap_or_else(|| "audio/mpeg".to_string()),
        )
    };

    let file = match bot.get_file(file_id).await {
        Ok(file) => file,
        Err(e) => {
            error!("Failed to get voice file info: {}", e);
            let _ = bot
                .send_message(msg.chat.id, "Could not download the voice message.")
                .await;
            return None;
        }
    };
    let mut buf = Vec::new();
    if let Err(e) = bot.download_file(&file.path, &mut buf).await {
        error!("Failed to download voice message: {}", e);
        let _ = bot
            .send_message(msg.chat.id, "Could not download the voice message.")
            .await;
        return None;
    }
    if buf.is_empty() {
        let _ = bot
            .send_message(msg.chat.id, "Could not download the voice message (empty file).")
            .await;
        return None;
    }

    match transcriber.transcribe(buf, &filename, &mime_type).await {
        Ok(text) if !text.trim().is_empty() => {
            info!("Transcribed voice message: {}", text.trim());
            Some(text.trim().to_string())
        }
        Ok(_) => {
            let _ = bot
                .send_message(
                    msg.chat.id,
                    "Could not transcribe the voice message (empty result).",
                )
                .await;
            None
        }
        Err(e) => {
            error!("Voice transcription failed for chat {}: {:#}", msg.chat.id, e);
            let _ = bot
                .send_message(msg.chat.id, format!("Voice transcription failed: {}", e))
                .await;
            None
        }
    }
}

/// Normalize one Telegram update. Returns None for updates we ignore
/// (stickers, edits, messages without a sender).
async fn normalize(
    bot: &Bot,
    msg: &Message,
    transcriber: Option<&Transcriber>,
) -> Option<IncomingMessage> {
    let user = msg.from.as_ref()?;
    let mut incoming = IncomingMessage {
        channel: "telegram".to_string(),
        chat_id: msg.chat.id.0.to_string(),
        user_id: user.id.0.to_string(),
        user_name: user.full_name(),
        is_private: msg.chat.is_private(),
        message_id: Some(msg.id.0.to_string()),
        ..Default::default()
    };

    if let Some(text) = msg.text() {
        if text.trim() == "/new" {
            incoming.reset_session = true;
        } else {
            incoming.text = text.to_string();
        }
        return Some(incoming);
    }

    if msg.voice().is_some() || msg.audio().is_some() {
        let text = transcribe_voice(bot, msg, transcriber).await?;
        incoming.text = text;
        return Some(incoming);
    }

    if let Some(photos) = msg.photo() {
        // Sizes are ordered smallest to largest; take the largest.
        let photo = photos.last()?;
        let file = match bot.get_file(photo.file.id.clone()).await {
            Ok(file) => file,
            Err(e) => {
                error!("Failed to get photo file info: {}", e);
                return None;
            }
        };
        let mut buf = Vec::new();
        if let Err(e) = bot.download_file(&file.path, &mut buf).await {
            error!("Failed to download photo: {}", e);
            return None;
        }
        incoming.image_base64 = Some(base64::engine::general_purpose::STANDARD.encode(&buf));
        incoming.image_mime_type = Some("image/jpeg".to_string());
        incoming.text = msg.caption().unwrap_or("").to_string();
        return Some(incoming);
    }

    None
}

async fn handle_update(
    bot: Bot,
    msg: Message,
    handler: Arc<dyn MessageHandler>,
    transcriber: Option<Arc<Transcriber>>,
    chat_locks: Arc<Mutex<HashMap<i64, Arc<Mutex<()>>>>>,
    work_gate: Arc<RwLock<()>>,
) {
    let Some(incoming) = normalize(&bot, &msg, transcriber.as_deref()).await else {
        return;
    };
    let was_reset = incoming.reset_session;

    // One turn at a time per chat; the gate keeps stop() honest.
    let lock = chat_lock(&chat_locks, msg.chat.id.0).await;
    let _serialized = lock.lock().await;
    let _working = work_gate.read().await;

    // Keep the typing indicator alive while the agent works.
    let typing_bot = bot.clone();
    let typing_chat = msg.chat.id;
    let (typing_stop_tx, mut typing_stop_rx) = tokio::sync::oneshot::channel::<()>();
    let typing_task = tokio::spawn(async move {
        loop {
            let _ = typing_bot
                .send_chat_action(typing_chat, ChatAction::Typing)
                .await;
            tokio::select! {
                _ = &mut typing_stop_rx => break,
                _ = tokio::time::sleep(Duration::from_secs(4)) => {}
            }
        }
    });

    let reply = handler.handle(incoming).await;

    let _ = typing_stop_tx.send(());
    let _ = typing_task.await;

    if was_reset {
        let _ = bot
            .send_message(msg.chat.id, "🔄 Session reset. Starting fresh!")
            .await;
        return;
    }

    let Some(reply) = reply else { return };
    let text = reply.final_text();
    if text.is_empty() {
        return;
    }
    for chunk in chunk_text(text) {
        if let Err(e) = bot.send_message(msg.chat.id, chunk).await {
            error!("Failed to send telegram reply: {}", e);
            break;
        }
    }
}

#[async_trait]
impl Channel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn start(&self) -> Result<()> {
        let commands = vec![BotCommand::new("new", "Start a fresh conversation")];
        if let Err(e) = self.bot.set_my_commands(commands).await {
            error!("Failed to set telegram bot commands: {}", e);
        }

        let bot = self.bot.clone();
        let handler = self.handler.clone();
        let transcriber = self.transcriber.clone();
        let chat_locks = self.chat_locks.clone();
        let work_gate = self.work_gate.clone();

        let repl = tokio::spawn(async move {
            teloxide::repl(bot, move |bot: Bot, msg: Message| {
                let handler = handler.clone();
                let transcriber = transcriber.clone();
                let chat_locks = chat_locks.clone();
                let work_gate = work_gate.clone();
                async move {
                    handle_update(bot, msg, handler, transcriber, chat_locks, work_gate).await;
                    Ok(())
                }
            })
            .await;
        });
        *self.repl_handle.lock().await = Some(repl);
        info!("Telegram channel started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(handle) = self.repl_handle.lock().await.take() {
            handle.abort();
        }
        // In-flight handlers hold read guards; this waits them out.
        let _ = self.work_gate.write().await;
        info!("Telegram channel stopped");
        Ok(())
    }

    async fn send(
        &self,
        chat_id: &str,
        text: &str,
        options: SendOptions,
    ) -> Result<Option<SendResult>> {
        let chat: i64 = chat_id
            .parse()
            .with_context(|| format!("invalid telegram chat id '{}'", chat_id))?;
        if options.reply_to.is_some() {
            warn!("Telegram reply threading is not supported; sending plain");
        }
        let mut last_id = None;
        for chunk in chunk_text(text) {
            let sent = self
                .bot
                .send_message(ChatId(chat), chunk)
                .disable_notification(options.disable_notification)
                .await
                .context("telegram send failed")?;
            last_id = Some(sent.id.0.to_string());
        }
        Ok(last_id.map(|id| SendResult {
            message_id: Some(id),
        }))
    }

    async fn send_file(&self, chat_id: &str, path: &Path, caption: &str) -> Result<()> {
        let chat: i64 = chat_id
            .parse()
            .with_context(|| format!("invalid telegram chat id '{}'", chat_id))?;
        self.bot
            .send_document(ChatId(chat), InputFile::file(path.to_path_buf()))
            .caption(caption.to_string())
            .await
            .context("telegram send_file failed")?;
        Ok(())
    }
}
