//! Chat-completion client for the AI provider (OpenRouter-compatible).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::Config;

/// Reply used when the inbound message has no content to forward.
pub const EMPTY_MESSAGE_REPLY: &str = "I received an empty message.";
/// Reply used when the provider answers 2xx but the expected content field
/// is absent. Soft failure so the user still gets a reply.
pub const NO_CONTENT_REPLY: &str = "No content returned from AI Provider.";

/// Marker appended to truncated messages.
const TRUNCATION_MARKER: &str = "...";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const TEMPERATURE: f32 = 0.7;

pub struct Client {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    system_prompt: String,
    max_message_length: usize,
    app_url: String,
    app_title: String,
}

#[derive(Serialize)]
struct ApiRequest {
    model: String,
    messages: Vec<ApiMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

/// Expected response shape. Every field is optional so a malformed body
/// decodes to "no content" instead of a decode error.
#[derive(Deserialize)]
struct ApiResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    #[serde(default)]
    message: Option<ChoiceMessage>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl ApiResponse {
    fn into_content(self) -> Option<String> {
        self.choices.into_iter().next()?.message?.content
    }
}

impl Client {
    pub fn new(config: &Config) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;

        Ok(Self {
            http,
            api_url: config.api_url.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            system_prompt: config.system_prompt.clone(),
            max_message_length: config.max_message_length,
            app_url: config.app_url.clone(),
            app_title: config.app_title.clone(),
        })
    }

    /// One completion round-trip: truncate, POST, extract reply text.
    /// No retries; a single failure is surfaced to the caller.
    pub async fn complete(&self, text: &str) -> Result<String, Error> {
        if text.trim().is_empty() {
            return Ok(EMPTY_MESSAGE_REPLY.to_string());
        }

        let text = truncate_message(text, self.max_message_length);

        let request = ApiRequest {
            model: self.model.clone(),
            messages: vec![
                ApiMessage { role: "system", content: self.system_prompt.clone() },
                ApiMessage { role: "user", content: text },
            ],
            temperature: TEMPERATURE,
            max_tokens: self.max_tokens,
        };

        let url = format!("{}/api/v1/chat/completions", self.api_url);
        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("HTTP-Referer", &self.app_url)
            .header("X-Title", &self.app_title)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Api(format!("{status}: {body}")));
        }

        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| Error::Parse(e.to_string()))?;

        Ok(api_response
            .into_content()
            .unwrap_or_else(|| NO_CONTENT_REPLY.to_string()))
    }
}

/// Truncate to `max_chars` characters plus a marker. Char-based so
/// multibyte text never splits a codepoint.
fn truncate_message(text: &str, max_chars: usize) -> String {
    let len = text.chars().count();
    if len <= max_chars {
        return text.to_string();
    }
    warn!("Truncating message from {} to {} chars", len, max_chars);
    let mut truncated: String = text.chars().take(max_chars).collect();
    truncated.push_str(TRUNCATION_MARKER);
    truncated
}

#[derive(Debug)]
pub enum Error {
    Http(String),
    Api(String),
    Parse(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Http(e) => write!(f, "HTTP error: {e}"),
            Error::Api(e) => write!(f, "API error: {e}"),
            Error::Parse(e) => write!(f, "Parse error: {e}"),
        }
    }
}

impl std::error::Error for Error {}
