use anyhow::{Context, Result, anyhow, bail};
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use crate::config::TranscriptionSection;

const GROQ_ENDPOINT: &str = "https://api.groq.com/openai/v1/audio/transcriptions";
const OPENAI_ENDPOINT: &str = "https://api.openai.com/v1/audio/transcriptions";

/// Whisper-API transcription client (Groq or OpenAI). Provider, model, and
/// credentials are bound at construction; channels just hand over audio
/// bytes and get text back.
pub struct Transcriber {
    provider: String,
    model: String,
    api_key: Option<String>,
    base_url: Option<String>,
    client: Client,
}

impl Transcriber {
    pub fn from_config(section: &TranscriptionSection) -> Result<Self> {
        let mut builder = Client::builder();
        if section.timeout > 0 {
            builder = builder.timeout(Duration::from_secs(section.timeout));
        }
        Ok(Self {
            provider: section.provider.clone(),
            model: section.model.clone(),
            api_key: section
                .api_key
                .clone()
                .filter(|key| !key.trim().is_empty()),
            base_url: section
                .base_url
                .clone()
                .filter(|url| !url.trim().is_empty()),
            client: builder.build().context("building transcription client")?,
        })
    }

    /// True when an API key is present; without one, voice messages are
    /// rejected up front instead of failing mid-download.
    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    fn endpoint(&self) -> &str {
        if let Some(url) = &self.base_url {
            return url;
        }
        match self.provider.as_str() {
            "openai" => OPENAI_ENDPOINT,
            _ => GROQ_ENDPOINT,
        }
    }

    /// Transcribe audio bytes via the configured Whisper API. Returns the
    /// transcribed text; any HTTP or API failure is an error.
    pub async fn transcribe(
        &self,
        audio: Vec<u8>,
        filename: &str,
        mime_type: &str,
    ) -> Result<String> {
        let Some(api_key) = &self.api_key else {
            bail!("transcription not configured (missing API key)");
        };

        let audio_len = audio.len();
        let file = reqwest::multipart::Part::bytes(audio)
            .file_name(filename.to_string())
            .mime_str(mime_type)
            .context("invalid audio mime type")?;
        let form = reqwest::multipart::Form::new()
            .text("model", self.model.clone())
            .part("file", file);

        let resp = self
            .client
            .post(self.endpoint())
            .header("Authorization", format!("Bearer {}", api_key))
            .multipart(form)
            .send()
            .await
            .context("transcription request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("Whisper API error ({}): {}", status, body));
        }

        let parsed: serde_json::Value = resp.json().await.context("parsing Whisper response")?;
        let text = parsed
            .get("text")
            .and_then(|t| t.as_str())
            .ok_or_else(|| anyhow!("no text in Whisper response"))?;
        debug!("Transcribed {} bytes of audio", audio_len);
        Ok(text.to_string())
    }
}
