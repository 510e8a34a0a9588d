use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Replace `${VAR}` references with environment variable values (missing
/// variables expand to the empty string, matching the config template docs).
fn expand_env(raw: &str) -> String {
    let re = Regex::new(r"\$\{([^}]+)\}").expect("static env regex");
    re.replace_all(raw, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .into_owned()
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_user(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/")
        && let Ok(home) = std::env::var("HOME")
    {
        return Path::new(&home).join(rest);
    }
    if path == "~"
        && let Ok(home) = std::env::var("HOME")
    {
        return PathBuf::from(home);
    }
    PathBuf::from(path)
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_trigger() -> String {
    "@Ciana".to_string()
}

fn default_poll_interval() -> u64 {
    60
}

fn default_tasks_file() -> PathBuf {
    PathBuf::from("./data/scheduled_tasks.json")
}

fn default_gateway_port() -> u16 {
    9842
}

fn default_gateway_timeout() -> u64 {
    30
}

fn default_strip_env() -> Vec<String> {
    vec!["CLAUDE_CODE".to_string(), "CLAUDECODE".to_string()]
}

fn default_transcription_provider() -> String {
    "groq".to_string()
}

fn default_transcription_model() -> String {
    "whisper-large-v3-turbo".to_string()
}

fn default_transcription_timeout() -> u64 {
    30
}

fn default_cli_path() -> String {
    "claude".to_string()
}

fn default_sessions_dir() -> String {
    "~/.claude/projects".to_string()
}

fn default_bridge_state_file() -> PathBuf {
    PathBuf::from("./data/bridge_user_states.json")
}

fn default_gateway_bridge() -> String {
    "claude-code".to_string()
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub channels: ChannelsSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub transcription: TranscriptionSection,
    #[serde(default)]
    pub bridge_cli: BridgeCliSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentSection {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Base URL of the agent runtime. Absent means no agent is wired in and
    /// only the gateway subcommand is usable.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    /// HTTP timeout for agent calls, seconds. 0 means no limit.
    #[serde(default)]
    pub timeout: u64,
    /// Port for the tool-callback API the agent runtime calls back into.
    #[serde(default = "default_tools_port")]
    pub tools_port: u16,
}

fn default_tools_port() -> u16 {
    8790
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            url: None,
            token: None,
            timeout: 0,
            tools_port: default_tools_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ChannelsSection {
    #[serde(default)]
    pub telegram: TelegramSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TelegramSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_trigger")]
    pub trigger: String,
    /// Empty list means the channel is open to all users.
    #[serde(default)]
    pub allowed_users: Vec<String>,
}

impl Default for TelegramSection {
    fn default() -> Self {
        Self {
            enabled: false,
            token: String::new(),
            trigger: default_trigger(),
            allowed_users: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    #[serde(default = "default_tasks_file")]
    pub data_file: PathBuf,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval: default_poll_interval(),
            data_file: default_tasks_file(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewaySection {
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    /// Client-side base URL for reaching the gateway from the runtime.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    /// Fallback subprocess timeout when the client supplies none.
    #[serde(default = "default_gateway_timeout")]
    pub default_timeout: u64,
    /// Environment variables stripped before spawning, so the invoked tool
    /// does not believe it is running embedded in itself.
    #[serde(default = "default_strip_env")]
    pub strip_env: Vec<String>,
    #[serde(default)]
    pub bridges: HashMap<String, BridgeSection>,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            url: None,
            token: None,
            default_timeout: default_gateway_timeout(),
            strip_env: default_strip_env(),
            bridges: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct BridgeSection {
    #[serde(default)]
    pub allowed_commands: Vec<String>,
    #[serde(default)]
    pub allowed_cwd: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TranscriptionSection {
    #[serde(default)]
    pub enabled: bool,
    /// "groq" or "openai".
    #[serde(default = "default_transcription_provider")]
    pub provider: String,
    #[serde(default = "default_transcription_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Overrides the provider's default endpoint.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_transcription_timeout")]
    pub timeout: u64,
}

impl Default for TranscriptionSection {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: default_transcription_provider(),
            model: default_transcription_model(),
            api_key: None,
            base_url: None,
            timeout: default_transcription_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeCliSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_cli_path")]
    pub cli_path: String,
    /// Directory holding per-project session files (`<project>/<id>.jsonl`).
    #[serde(default = "default_sessions_dir")]
    pub sessions_dir: String,
    #[serde(default)]
    pub permission_mode: Option<String>,
    /// Overall CLI call timeout, seconds. 0 means no limit.
    #[serde(default)]
    pub timeout: u64,
    #[serde(default = "default_bridge_state_file")]
    pub state_file: PathBuf,
    /// Gateway bridge name used when executing through the host gateway.
    #[serde(default = "default_gateway_bridge")]
    pub gateway_bridge: String,
}

impl Default for BridgeCliSection {
    fn default() -> Self {
        Self {
            enabled: false,
            cli_path: default_cli_path(),
            sessions_dir: default_sessions_dir(),
            permission_mode: None,
            timeout: 0,
            state_file: default_bridge_state_file(),
            gateway_bridge: default_gateway_bridge(),
        }
    }
}

impl AppConfig {
    /// Load and validate the config file. Startup errors here are fatal.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            bail!("config file not found: {}", path.display());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let expanded = expand_env(&raw);
        let config: AppConfig = serde_yaml::from_str(&expanded)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let level = self.logging.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            bail!(
                "logging.level must be one of {:?}, got '{}'",
                VALID_LOG_LEVELS,
                self.logging.level
            );
        }
        if self.scheduler.poll_interval < 1 {
            bail!("scheduler.poll_interval must be >= 1 second");
        }
        if self.channels.telegram.enabled && self.channels.telegram.token.is_empty() {
            bail!("channels.telegram.token is required when telegram is enabled");
        }
        if !matches!(self.transcription.provider.as_str(), "groq" | "openai") {
            bail!(
                "transcription.provider must be 'groq' or 'openai', got '{}'",
                self.transcription.provider
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let config: AppConfig = serde_yaml::from_str("agent:\n  data_dir: ./data\n").unwrap();
        assert_eq!(config.scheduler.poll_interval, 60);
        assert_eq!(config.channels.telegram.trigger, "@Ciana");
        assert_eq!(config.gateway.port, 9842);
        assert_eq!(
            config.gateway.strip_env,
            vec!["CLAUDE_CODE".to_string(), "CLAUDECODE".to_string()]
        );
    }

    #[test]
    fn env_vars_expand_inside_values() {
        // Safety: test-local variable name, no concurrent reader cares.
        unsafe { std::env::set_var("CIANA_TEST_TOKEN", "sekrit") };
        let raw = "gateway:\n  token: ${CIANA_TEST_TOKEN}\n";
        let expanded = expand_env(raw);
        assert!(expanded.contains("sekrit"));
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let config: AppConfig =
            serde_yaml::from_str("scheduler:\n  enabled: true\n  poll_interval: 0\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn enabled_telegram_without_token_is_rejected() {
        let config: AppConfig =
            serde_yaml::from_str("channels:\n  telegram:\n    enabled: true\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_transcription_provider_is_rejected() {
        let config: AppConfig =
            serde_yaml::from_str("transcription:\n  provider: whispercpp\n").unwrap();
        assert!(config.validate().is_err());
        let config: AppConfig =
            serde_yaml::from_str("transcription:\n  provider: openai\n").unwrap();
        assert!(config.validate().is_ok());
    }
}
