use std::collections::HashSet;
use std::fmt;
use std::num::ParseIntError;

use tracing::warn;

/// Default AI provider root URL (OpenRouter).
const DEFAULT_API_URL: &str = "https://openrouter.ai";
const DEFAULT_MODEL: &str = "openai/gpt-5-mini";
const DEFAULT_MAX_TOKENS: u32 = 10000;
const DEFAULT_MAX_MESSAGE_LENGTH: usize = 1000;
const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful chatbot that answers the user's messages with short, direct replies. Keep your answers clear, factual, and concise.";
const DEFAULT_APP_URL: &str = "http://localhost";
const DEFAULT_APP_TITLE: &str = "Delta Chat AI Bot";

/// Errors that can occur when loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// A required environment variable is absent or empty.
    MissingVar { var: &'static str },
    /// A numeric variable failed to parse.
    InvalidNumber { var: &'static str, value: String, source: ParseIntError },
    /// A numeric variable parsed but is zero.
    NotPositive { var: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingVar { var } => {
                write!(f, "{var} environment variable is required")
            }
            Self::InvalidNumber { var, value, source } => {
                write!(f, "{var}='{value}' is not a valid integer: {source}")
            }
            Self::NotPositive { var, value } => {
                write!(f, "{var}='{value}' must be a positive integer")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidNumber { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Immutable runtime configuration, loaded once at startup from the
/// environment and passed by reference into the handler.
pub struct Config {
    /// Sender addresses the bot is allowed to talk to. Empty means no one.
    pub respond_to: HashSet<String>,
    /// AI provider root URL (the chat-completions path is appended).
    pub api_url: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub system_prompt: String,
    /// Inbound text longer than this (in chars) is truncated before the
    /// completion call.
    pub max_message_length: usize,
    /// Sent as the HTTP-Referer header on completion requests.
    pub app_url: String,
    /// Sent as the X-Title header on completion requests.
    pub app_title: String,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration from an arbitrary lookup. Tests substitute a map
    /// here instead of mutating the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let respond_to: HashSet<String> = lookup("RESPOND_TO")
            .unwrap_or_default()
            .split(',')
            .map(|entry| entry.trim().to_string())
            .filter(|entry| !entry.is_empty())
            .collect();
        if respond_to.is_empty() {
            warn!("RESPOND_TO is empty - bot will not respond to anyone");
        }

        let api_key = lookup("AI_API_KEY").filter(|k| !k.is_empty());
        let Some(api_key) = api_key else {
            return Err(ConfigError::MissingVar { var: "AI_API_KEY" });
        };

        Ok(Self {
            respond_to,
            api_url: lookup("AI_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            api_key,
            model: lookup("AI_API_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            max_tokens: parse_positive(&lookup, "AI_API_MAX_TOKENS", DEFAULT_MAX_TOKENS)?,
            system_prompt: lookup("SYSTEM_PROMPT")
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            max_message_length: parse_positive(
                &lookup,
                "MAX_MESSAGE_LENGTH",
                DEFAULT_MAX_MESSAGE_LENGTH as u32,
            )? as usize,
            app_url: lookup("APP_URL").unwrap_or_else(|| DEFAULT_APP_URL.to_string()),
            app_title: lookup("APP_TITLE").unwrap_or_else(|| DEFAULT_APP_TITLE.to_string()),
        })
    }

    /// Access filter: exact-match membership in the allow-list.
    /// Empty allow-list means no sender is authorized.
    pub fn is_authorized(&self, sender_address: &str) -> bool {
        self.respond_to.contains(sender_address)
    }
}

fn parse_positive(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: u32,
) -> Result<u32, ConfigError> {
    let Some(value) = lookup(var) else {
        return Ok(default);
    };
    let parsed = value
        .trim()
        .parse::<u32>()
        .map_err(|e| ConfigError::InvalidNumber { var, value: value.clone(), source: e })?;
    if parsed == 0 {
        return Err(ConfigError::NotPositive { var, value });
    }
    Ok(parsed)
}
