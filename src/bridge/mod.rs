use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{BridgeCliSection, expand_user};
use crate::events::{Event, summarize_tool_input};
use crate::gateway::{GatewayClient, process};
use crate::store::JsonStore;

const TOOL_RESULT_MAX_CHARS: usize = 12_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Normal,
    Bridge,
}

/// Per-user bridge session state. Persisted only while `mode == Bridge`;
/// absence of a key in the store means normal mode.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserSession {
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub active_project: Option<String>,
    #[serde(default)]
    pub active_project_path: Option<String>,
    /// None means "new conversation": the next call creates a session file
    /// and detection picks its id up.
    #[serde(default)]
    pub active_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_effort: Option<String>,
}

#[derive(Debug, Default)]
pub struct BridgeResponse {
    pub events: Vec<Event>,
    pub error: String,
}

impl BridgeResponse {
    fn failed(message: impl Into<String>) -> Self {
        Self {
            events: Vec::new(),
            error: message.into(),
        }
    }
}

/// Owns per-user sessions over a streaming NDJSON CLI. Messages for a user
/// in bridge mode bypass the router entirely; this manager builds the CLI
/// invocation, executes it (locally or through the host gateway), and
/// translates the stream into ordered events.
pub struct BridgeSessionManager {
    cli_path: String,
    sessions_dir: PathBuf,
    permission_mode: Option<String>,
    timeout: u64,
    gateway: Option<GatewayClient>,
    gateway_bridge: String,
    strip_env: Vec<String>,
    store: JsonStore,
    states: Mutex<HashMap<String, UserSession>>,
    // Per-user call locks, created on first access and never removed; the
    // table is bounded by user cardinality.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl BridgeSessionManager {
    pub fn new(
        section: &BridgeCliSection,
        gateway: Option<GatewayClient>,
        strip_env: Vec<String>,
    ) -> Result<Self> {
        let store = JsonStore::open(&section.state_file).context("opening bridge state store")?;
        Ok(Self {
            cli_path: section.cli_path.clone(),
            sessions_dir: expand_user(&section.sessions_dir),
            permission_mode: section.permission_mode.clone(),
            timeout: section.timeout,
            gateway,
            gateway_bridge: section.gateway_bridge.clone(),
            strip_env,
            store,
            states: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Load persisted user states. Call once at startup, before serving.
    pub async fn restore(&self) -> Result<()> {
        let mut states = self.states.lock().await;
        for (user_id, raw) in self.store.all().await {
            match serde_json::from_value::<UserSession>(raw) {
                Ok(session) => {
                    states.insert(user_id, session);
                }
                Err(e) => warn!("Discarding unreadable bridge state for {}: {}", user_id, e),
            }
        }
        if !states.is_empty() {
            info!("Restored bridge state for {} user(s)", states.len());
        }
        Ok(())
    }

    async fn user_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn state(&self, user_id: &str) -> UserSession {
        self.states
            .lock()
            .await
            .get(user_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn is_bridge_mode(&self, user_id: &str) -> bool {
        self.states
            .lock()
            .await
            .get(user_id)
            .is_some_and(|s| s.mode == Mode::Bridge)
    }

    /// Put the user into bridge mode bound to a project. `session_id` None
    /// starts a new conversation on the next message.
    pub async fn enter(
        &self,
        user_id: &str,
        project: &str,
        project_path: &str,
        session_id: Option<String>,
    ) -> Result<()> {
        let session = UserSession {
            mode: Mode::Bridge,
            active_project: Some(project.to_string()),
            active_project_path: Some(project_path.to_string()),
            active_session_id: session_id,
            active_model: None,
            active_effort: None,
        };
        self.states
            .lock()
            .await
            .insert(user_id.to_string(), session.clone());
        self.store.set(user_id, &session).await
    }

    /// Leave bridge mode: state reverts to defaults and the persisted entry
    /// is removed.
    pub async fn exit(&self, user_id: &str) -> Result<()> {
        self.states.lock().await.remove(user_id);
        self.store.delete(user_id).await?;
        Ok(())
    }

    pub async fn set_model(&self, user_id: &str, model: Option<String>) -> Result<()> {
        self.update_state(user_id, |s| s.active_model = model.clone())
            .await
    }

    pub async fn set_effort(&self, user_id: &str, effort: Option<String>) -> Result<()> {
        self.update_state(user_id, |s| s.active_effort = effort.clone())
            .await
    }

    async fn update_state(&self, user_id: &str, apply: impl Fn(&mut UserSession)) -> Result<()> {
        let mut states = self.states.lock().await;
        let session = states.entry(user_id.to_string()).or_default();
        apply(session);
        if session.mode == Mode::Bridge {
            self.store.set(user_id, session).await?;
        }
        Ok(())
    }

    /// Send one message through the user's CLI session. Calls for the same
    /// user are serialized; distinct users run in parallel.
    pub async fn send_message(&self, user_id: &str, text: &str) -> BridgeResponse {
        let lock = self.user_lock(user_id).await;
        let _serialized = lock.lock().await;

        let state = self.state(user_id).await;
        if state.mode != Mode::Bridge {
            return BridgeResponse::failed("Not in bridge mode.");
        }

        let cmd = self.build_command(text, &state);
        let cwd = state.active_project_path.clone();

        // Snapshot session files so a newly created one can be identified.
        let pre_existing = if state.active_session_id.is_none() {
            state.active_project.as_deref().map(|p| self.session_stems(p))
        } else {
            None
        };

        let response = self.execute(cmd, cwd).await;

        if let (Some(known), Some(project)) = (pre_existing, state.active_project.as_deref()) {
            self.adopt_new_session(user_id, project, &known).await;
        }

        response
    }

    /// Probe CLI availability: gateway health when configured, otherwise a
    /// local `--version` call.
    pub async fn check_available(&self) -> (bool, String) {
        if let Some(gateway) = &self.gateway {
            let (ok, body) = gateway.health().await;
            let detail = body
                .get("error")
                .and_then(|e| e.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| "Gateway OK".to_string());
            return (ok, detail);
        }
        let cmd = vec![self.cli_path.clone(), "--version".to_string()];
        match process::run_command(&cmd, None, 10, &self.strip_env).await {
            Ok(out) if out.returncode == 0 => (true, out.stdout.trim().to_string()),
            Ok(out) if out.returncode == 127 => (false, out.stderr.trim().to_string()),
            Ok(out) => (false, out.stderr.trim().to_string()),
            Err(e) => (false, e.to_string()),
        }
    }

    // --- Command construction & execution ---

    fn build_command(&self, text: &str, state: &UserSession) -> Vec<String> {
        let mut cmd = vec![self.cli_path.clone(), "-p".to_string()];
        if let Some(session_id) = &state.active_session_id {
            cmd.push("--resume".to_string());
            cmd.push(session_id.clone());
        }
        cmd.push("--output-format".to_string());
        cmd.push("stream-json".to_string());
        cmd.push("--verbose".to_string());
        if let Some(mode) = &self.permission_mode {
            cmd.push("--permission-mode".to_string());
            cmd.push(mode.clone());
        }
        if let Some(model) = &state.active_model {
            cmd.push("--model".to_string());
            cmd.push(model.clone());
        }
        if let Some(effort) = &state.active_effort {
            cmd.push("--effort".to_string());
            cmd.push(effort.clone());
        }
        cmd.push(text.to_string());
        cmd
    }

    async fn execute(&self, cmd: Vec<String>, cwd: Option<String>) -> BridgeResponse {
        let (stdout, stderr, returncode) = if let Some(gateway) = &self.gateway {
            let result = gateway
                .execute(&self.gateway_bridge, cmd, cwd, self.timeout)
                .await;
            if !result.error.is_empty() {
                return BridgeResponse::failed(result.error);
            }
            (result.stdout, result.stderr, result.returncode)
        } else {
            let cwd = cwd.map(PathBuf::from);
            match process::run_command(&cmd, cwd.as_deref(), self.timeout, &self.strip_env).await {
                Ok(out) => (out.stdout, out.stderr, out.returncode),
                Err(e) => return BridgeResponse::failed(format!("Error running CLI: {e}")),
            }
        };

        let stdout = stdout.trim();
        let stderr = stderr.trim();

        if returncode == -1 {
            return BridgeResponse::failed(
                "Command timed out. The request may have been too complex.",
            );
        }
        if returncode != 0 {
            warn!("Bridge CLI exited {}: {}", returncode, stderr);
            return BridgeResponse::failed(if stderr.is_empty() {
                "The CLI returned an error.".to_string()
            } else {
                stderr.to_string()
            });
        }
        if stdout.is_empty() {
            if !stderr.is_empty() {
                return BridgeResponse::failed(stderr.to_string());
            }
            return BridgeResponse {
                events: vec![Event::Text {
                    content: "(empty response)".to_string(),
                }],
                error: String::new(),
            };
        }

        BridgeResponse {
            events: parse_stream(stdout),
            error: String::new(),
        }
    }

    // --- New-session detection ---

    fn session_stems(&self, project: &str) -> HashSet<String> {
        let dir = self.sessions_dir.join(project);
        let mut stems = HashSet::new();
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return stems;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "jsonl")
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
            {
                stems.insert(stem.to_string());
            }
        }
        stems
    }

    /// Adopt the session file that appeared during the call. Exactly one new
    /// stem becomes the active session; zero or several leave the id unset
    /// and the next message retries.
    async fn adopt_new_session(&self, user_id: &str, project: &str, known: &HashSet<String>) {
        let after = self.session_stems(project);
        let new: Vec<&String> = after.difference(known).collect();
        match new.as_slice() {
            [stem] => {
                let stem = (*stem).clone();
                info!("Detected new session: {}", stem);
                let result = self
                    .update_state(user_id, |s| s.active_session_id = Some(stem.clone()))
                    .await;
                if let Err(e) = result {
                    warn!("Failed to persist new session id for {}: {:#}", user_id, e);
                }
            }
            [] => debug!("No new session file appeared for project {}", project),
            many => warn!(
                "{} new session files appeared for project {}; leaving session unset",
                many.len(),
                project
            ),
        }
    }
}

// --- NDJSON stream parsing ---

#[derive(Deserialize)]
struct StreamLine {
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    content: Option<serde_json::Value>,
    #[serde(default)]
    message: Option<StreamMessage>,
}

#[derive(Deserialize)]
struct StreamMessage {
    #[serde(default)]
    content: Option<serde_json::Value>,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "tool_use")]
    ToolUse {
        #[serde(default)]
        id: String,
        #[serde(default)]
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        #[serde(default)]
        tool_use_id: String,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        content: serde_json::Value,
    },
    #[serde(rename = "text")]
    Text {
        #[serde(default)]
        text: String,
    },
    #[serde(rename = "thinking")]
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    #[serde(other)]
    Unknown,
}

/// Parse stream-json output into ordered events. Empty lines are skipped,
/// malformed lines are logged and skipped, `result` records emit nothing,
/// and tool results are paired with their tool call by id.
pub fn parse_stream(raw: &str) -> Vec<Event> {
    let mut blocks: Vec<ContentBlock> = Vec::new();

    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parsed: StreamLine = match serde_json::from_str(line) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("Skipping malformed stream line: {}", e);
                continue;
            }
        };
        // The final "result" record is metadata, not content.
        if parsed.kind == "result" {
            continue;
        }
        let content = parsed
            .content
            .or(parsed.message.and_then(|m| m.content));
        let Some(serde_json::Value::Array(items)) = content else {
            continue;
        };
        for item in items {
            match serde_json::from_value::<ContentBlock>(item) {
                Ok(block) => blocks.push(block),
                Err(e) => debug!("Skipping unreadable content block: {}", e),
            }
        }
    }

    // Index results by tool id so each call can carry its outcome inline.
    let mut results_by_id: HashMap<&str, (&bool, &serde_json::Value)> = HashMap::new();
    for block in &blocks {
        if let ContentBlock::ToolResult {
            tool_use_id,
            is_error,
            content,
        } = block
        {
            results_by_id.insert(tool_use_id.as_str(), (is_error, content));
        }
    }

    let mut events = Vec::new();
    let mut paired: HashSet<&str> = HashSet::new();

    for block in &blocks {
        match block {
            ContentBlock::Thinking { thinking } => {
                let text = thinking.trim();
                if !text.is_empty() {
                    events.push(Event::Thinking {
                        content: text.to_string(),
                    });
                }
            }
            ContentBlock::Text { text } => {
                let text = text.trim();
                if !text.is_empty() {
                    events.push(Event::Text {
                        content: text.to_string(),
                    });
                }
            }
            ContentBlock::ToolUse { id, name, input } => {
                let (is_error, result_text) = match results_by_id.get(id.as_str()) {
                    Some((is_error, content)) => {
                        paired.insert(id.as_str());
                        (**is_error, extract_tool_result_text(content))
                    }
                    None => (false, String::new()),
                };
                events.push(Event::ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    input_summary: summarize_tool_input(name, input),
                    result_text,
                    is_error,
                });
            }
            ContentBlock::ToolResult {
                tool_use_id,
                is_error,
                content,
            } => {
                // Orphan error results surface; successful orphans do not.
                if !paired.contains(tool_use_id.as_str()) && *is_error {
                    paired.insert(tool_use_id.as_str());
                    events.push(Event::ToolCall {
                        id: tool_use_id.clone(),
                        name: "unknown".to_string(),
                        input_summary: String::new(),
                        result_text: extract_tool_result_text(content),
                        is_error: true,
                    });
                }
            }
            ContentBlock::Unknown => debug!("Skipping unknown content block type"),
        }
    }

    if events.is_empty() {
        // Nothing parseable; fall back to the raw text so the user sees
        // something rather than silence.
        return vec![Event::Text {
            content: raw.trim().to_string(),
        }];
    }
    events
}

/// Normalize a tool_result body (string, block list, or object) into text.
fn extract_tool_result_text(content: &serde_json::Value) -> String {
    match content {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.trim().to_string(),
        serde_json::Value::Array(items) => {
            let mut texts = Vec::new();
            for item in items {
                match item {
                    serde_json::Value::Object(obj) => match obj.get("type").and_then(|t| t.as_str())
                    {
                        Some("text") => texts.push(
                            obj.get("text")
                                .and_then(|t| t.as_str())
                                .unwrap_or("")
                                .to_string(),
                        ),
                        Some("image") => texts.push("[image]".to_string()),
                        _ => texts.push(item.to_string()),
                    },
                    serde_json::Value::String(s) => texts.push(s.clone()),
                    _ => {}
                }
            }
            texts.join("\n").trim().to_string()
        }
        serde_json::Value::Object(obj) => {
            if obj.get("type").and_then(|t| t.as_str()) == Some("text") {
                return obj
                    .get("text")
                    .and_then(|t| t.as_str())
                    .unwrap_or("")
                    .trim()
                    .to_string();
            }
            let mut pretty = serde_json::to_string_pretty(content).unwrap_or_default();
            pretty.truncate(TOOL_RESULT_MAX_CHARS);
            pretty
        }
        other => other.to_string().trim().to_string(),
    }
}
