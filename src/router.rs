use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::agent::{Agent, AgentReply, AgentRequest, ChatContext, MessageContent};
use crate::channels::{IncomingMessage, MessageHandler};
use crate::config::AppConfig;
use crate::events::Event;
use crate::store::JsonStore;

/// Enumerates thread ids already present in the external
/// conversation-checkpoint namespace, so reset counters can be reconciled at
/// startup and never reuse a suffix after restoring from backup.
pub trait ThreadIndex: Send + Sync {
    fn thread_ids(&self) -> Result<Vec<String>>;
}

/// Thread index over a directory of per-thread `.jsonl` files.
pub struct DirThreadIndex {
    dir: PathBuf,
}

impl DirThreadIndex {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl ThreadIndex for DirThreadIndex {
    fn thread_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        if !self.dir.exists() {
            return Ok(ids);
        }
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "jsonl")
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
            {
                ids.push(stem.to_string());
            }
        }
        Ok(ids)
    }
}

/// Per-chat session reset counters: in-memory map backed by a JSON file.
/// Counters only ever grow.
pub struct SessionCounters {
    store: JsonStore,
    counters: Mutex<HashMap<String, u64>>,
}

impl SessionCounters {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let store = JsonStore::open(path)?;
        let counters = store
            .all()
            .await
            .into_iter()
            .filter_map(|(k, v)| v.as_u64().map(|n| (k, n)))
            .collect();
        Ok(Self {
            store,
            counters: Mutex::new(counters),
        })
    }

    pub async fn get(&self, key: &str) -> u64 {
        *self.counters.lock().await.get(key).unwrap_or(&0)
    }

    pub async fn increment(&self, key: &str) -> Result<u64> {
        let mut counters = self.counters.lock().await;
        let next = counters.get(key).copied().unwrap_or(0) + 1;
        counters.insert(key.to_string(), next);
        self.store.set(key, &next).await?;
        Ok(next)
    }

    /// Reconcile with thread ids observed in the checkpoint namespace,
    /// taking the max suffix per base key and persisting any upgrade.
    pub async fn sync_with_threads(&self, thread_ids: &[String]) -> Result<()> {
        let mut counters = self.counters.lock().await;
        for thread_id in thread_ids {
            let Some((base, suffix)) = thread_id.rsplit_once("_s") else {
                continue;
            };
            let Ok(observed) = suffix.parse::<u64>() else {
                continue;
            };
            let current = counters.get(base).copied().unwrap_or(0);
            if observed > current {
                counters.insert(base.to_string(), observed);
                self.store.set(base, &observed).await?;
                info!("Session counter synced: {} -> s{}", base, observed);
            }
        }
        Ok(())
    }
}

/// One line of the append-only per-thread turn log.
#[derive(Debug, Serialize, Deserialize)]
pub struct TurnRecord {
    pub role: String,
    pub content: String,
    pub ts: String,
    pub channel: String,
    pub user_id: Option<String>,
}

/// Routes normalized messages to the agent: authorization, trigger
/// detection, session identity, multimodal framing, and turn logging.
pub struct MessageRouter {
    agent: Arc<dyn Agent>,
    sessions_dir: PathBuf,
    allowed_users: HashMap<String, Vec<String>>,
    trigger: String,
    counters: SessionCounters,
}

impl MessageRouter {
    pub async fn new(agent: Arc<dyn Agent>, config: &AppConfig) -> Result<Self> {
        let data_dir = &config.agent.data_dir;
        let mut allowed_users = HashMap::new();
        let tg = &config.channels.telegram;
        if !tg.allowed_users.is_empty() {
            allowed_users.insert("telegram".to_string(), tg.allowed_users.clone());
        }
        if allowed_users.is_empty() {
            warn!("No allowed_users configured for any channel — bot is open to ALL users");
        }
        let counters = SessionCounters::open(data_dir.join("session_counters.json"))
            .await
            .context("opening session counters")?;
        Ok(Self {
            agent,
            sessions_dir: data_dir.join("sessions"),
            allowed_users,
            trigger: config.channels.telegram.trigger.clone(),
            counters,
        })
    }

    /// Startup reconciliation against the checkpoint namespace. Must run
    /// before the first message is served.
    pub async fn sync_counters(&self, index: &dyn ThreadIndex) -> Result<()> {
        let ids = index
            .thread_ids()
            .context("scanning checkpoint namespace")?;
        self.counters.sync_with_threads(&ids).await
    }

    /// Allowlist check: an empty (or missing) list for a channel allows all.
    pub fn is_user_allowed(&self, channel: &str, user_id: &str) -> bool {
        match self.allowed_users.get(channel) {
            None => true,
            Some(allowed) if allowed.is_empty() => true,
            Some(allowed) => !user_id.is_empty() && allowed.iter().any(|u| u == user_id),
        }
    }

    /// Thread identity for a chat: base key, or `_sN` suffixed after N
    /// resets.
    pub async fn thread_id(&self, channel: &str, chat_id: &str) -> String {
        let key = format!("{}_{}", channel, chat_id);
        match self.counters.get(&key).await {
            0 => key,
            n => format!("{}_s{}", key, n),
        }
    }

    /// Trigger gate. Private chats always pass; group chats require the
    /// trigger prefix, compared case-insensitively over exactly its length.
    fn should_respond(&self, msg: &IncomingMessage) -> Option<String> {
        let text = msg.text.trim();
        if msg.is_private {
            return Some(text.to_string());
        }
        let trigger = self.trigger.as_str();
        if text
            .get(..trigger.len())
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(trigger))
        {
            return Some(text[trigger.len()..].trim().to_string());
        }
        None
    }

    pub async fn handle_message(&self, msg: IncomingMessage) -> Option<AgentReply> {
        if !self.is_user_allowed(&msg.channel, &msg.user_id) {
            warn!(
                "Blocked message from unauthorized user: {}/{}",
                msg.channel, msg.user_id
            );
            return None;
        }

        if msg.reset_session {
            let key = format!("{}_{}", msg.channel, msg.chat_id);
            match self.counters.increment(&key).await {
                Ok(n) => info!("Session reset: {} -> s{}", key, n),
                Err(e) => warn!("Failed to persist session reset for {}: {:#}", key, e),
            }
            return None;
        }

        let clean_text = self.should_respond(&msg)?;
        if clean_text.is_empty() && msg.image_base64.is_none() {
            return None;
        }

        let thread_id = self.thread_id(&msg.channel, &msg.chat_id).await;
        info!(
            "Processing: channel={} chat={} user={} thread={}",
            msg.channel, msg.chat_id, msg.user_name, thread_id
        );

        let now = Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
        let framed = format!("[{}] [{}]: {}", now, msg.user_name, clean_text);
        let content = match (&msg.image_base64, &msg.image_mime_type) {
            (Some(image), mime) => MessageContent::TextWithImage {
                text: framed,
                image_base64: image.clone(),
                mime_type: mime.clone().unwrap_or_else(|| "image/jpeg".to_string()),
            },
            _ => MessageContent::Text(framed),
        };

        self.log_turn(&thread_id, "user", &clean_text, &msg.channel, Some(&msg.user_id));

        let request = AgentRequest {
            thread_id: thread_id.clone(),
            content,
            origin: Some(ChatContext {
                channel: msg.channel.clone(),
                chat_id: msg.chat_id.clone(),
            }),
            model_tier: None,
        };

        let reply = match self.agent.invoke(request).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Agent error for thread {}: {:#}", thread_id, e);
                AgentReply {
                    events: vec![Event::Text {
                        content: "Sorry, I encountered an error. Please try again.".to_string(),
                    }],
                }
            }
        };

        self.log_turn(&thread_id, "assistant", reply.final_text(), &msg.channel, None);

        Some(reply)
    }

    /// Append one record to the per-thread JSONL log. Logging failures are
    /// warnings, never fatal to the turn.
    fn log_turn(
        &self,
        thread_id: &str,
        role: &str,
        content: &str,
        channel: &str,
        user_id: Option<&str>,
    ) {
        let record = TurnRecord {
            role: role.to_string(),
            content: content.to_string(),
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            channel: channel.to_string(),
            user_id: user_id.map(str::to_string),
        };
        if let Err(e) = self.append_record(thread_id, &record) {
            warn!("Failed to log message for {}: {:#}", thread_id, e);
        }
    }

    fn append_record(&self, thread_id: &str, record: &TurnRecord) -> Result<()> {
        std::fs::create_dir_all(&self.sessions_dir)?;
        let path = self.sessions_dir.join(format!("{}.jsonl", thread_id));
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    #[cfg(test)]
    fn turn_log_path(&self, thread_id: &str) -> PathBuf {
        self.sessions_dir.join(format!("{}.jsonl", thread_id))
    }
}

#[async_trait]
impl MessageHandler for MessageRouter {
    async fn handle(&self, msg: IncomingMessage) -> Option<AgentReply> {
        self.handle_message(msg).await
    }
}
