//! Data model shared across the store, selector, and admin surface.

use serde::{Deserialize, Serialize};

/// Dialect tag for an upstream channel. Authorization header name and body
/// mutation strategy are dispatched per-variant here rather than through
/// inheritance (see the design notes on tagged-variant dialect dispatch).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    Anthropic,
    OpenAi,
    Gemini,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::Anthropic => "anthropic",
            ChannelType::OpenAi => "openai",
            ChannelType::Gemini => "gemini",
        }
    }

    pub fn from_str_loose(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "openai" => ChannelType::OpenAi,
            "gemini" => ChannelType::Gemini,
            _ => ChannelType::Anthropic,
        }
    }

    /// The header name the credential is written into for this dialect.
    pub fn auth_header_name(&self) -> &'static str {
        match self {
            ChannelType::Anthropic => "x-api-key",
            ChannelType::OpenAi => "authorization",
            ChannelType::Gemini => "x-goog-api-key",
        }
    }

    /// Render the credential value for the dialect's auth header.
    pub fn auth_header_value(&self, key: &str) -> String {
        match self {
            ChannelType::OpenAi => format!("Bearer {key}"),
            ChannelType::Anthropic | ChannelType::Gemini => key.to_string(),
        }
    }
}

impl Default for ChannelType {
    fn default() -> Self {
        ChannelType::Anthropic
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    Sequential,
    RoundRobin,
}

impl KeyStrategy {
    pub fn from_str_loose(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "round_robin" | "roundrobin" => KeyStrategy::RoundRobin,
            _ => KeyStrategy::Sequential,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStrategy::Sequential => "sequential",
            KeyStrategy::RoundRobin => "round_robin",
        }
    }
}

impl Default for KeyStrategy {
    fn default() -> Self {
        KeyStrategy::Sequential
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub priority: i64,
    pub channel_type: ChannelType,
    pub enabled: bool,
    pub cooldown_until: i64,
    pub cooldown_duration_ms: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub channel_id: i64,
    pub model: String,
    pub redirect_model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRow {
    pub channel_id: i64,
    pub key_index: i64,
    pub api_key: String,
    pub key_strategy: KeyStrategy,
    pub cooldown_until: i64,
    pub cooldown_duration_ms: i64,
}

impl ApiKeyRow {
    /// Mask as `abcd…wxyz` for logging/display, per the log-entry spec.
    pub fn masked(&self) -> String {
        mask_secret(&self.api_key)
    }
}

pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}…{tail}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownScope {
    Channel,
    Key,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: Option<i64>,
    pub time_ms: i64,
    pub model: String,
    pub channel_id: i64,
    pub status_code: u16,
    pub message: String,
    pub duration_secs: f64,
    pub is_streaming: bool,
    pub first_byte_secs: Option<f64>,
    pub api_key_used: Option<String>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read_tokens: i64,
    pub cache_creation_tokens: i64,
    pub cost_microusd: i64,
    pub auth_token_id: Option<i64>,
    pub client_ip: Option<String>,
}

impl LogEntry {
    /// Truncate the message to 2000 chars, per the data model.
    pub fn truncate_message(mut self) -> Self {
        if self.message.chars().count() > 2000 {
            self.message = self.message.chars().take(2000).collect();
        }
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthToken {
    pub id: i64,
    pub token_hash: String,
    pub description: String,
    pub expires_at: Option<i64>,
    pub active: bool,
    pub allowed_models: Vec<String>,
    pub cost_cap_microusd: Option<i64>,
    pub cost_used_microusd: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub streaming_ttfb_avg_ms: f64,
    pub non_streaming_duration_avg_ms: f64,
    pub total_tokens: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct AdminSession {
    pub token_hash: String,
    pub created_at: i64,
    pub expires_at: i64,
}
