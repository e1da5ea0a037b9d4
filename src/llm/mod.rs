pub mod chat;
pub mod error;
pub mod sse;

pub use error::CompletionError;

use serde::{ Deserialize, Serialize };
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Upper bound accepted for `max_tokens` by every supported provider.
pub const MAX_TOKENS_LIMIT: u32 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    OpenRouter,
    OpenAI,
    Replicate,
}

impl ProviderType {
    pub fn default_model(&self) -> &'static str {
        match self {
            ProviderType::OpenRouter => "openai/gpt-4o-mini-2024-07-18",
            ProviderType::OpenAI => "gpt-4o-mini",
            ProviderType::Replicate => "meta/meta-llama-3-70b-instruct",
        }
    }

    /// Provider specific environment variable holding the credential.
    pub fn api_key_env(&self) -> &'static str {
        match self {
            ProviderType::OpenRouter => "OPENROUTER_API_KEY",
            ProviderType::OpenAI => "OPENAI_API_KEY",
            ProviderType::Replicate => "REPLICATE_API_TOKEN",
        }
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProviderType::OpenRouter => "openrouter",
            ProviderType::OpenAI => "openai",
            ProviderType::Replicate => "replicate",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseProviderTypeError {
    message: String,
}

impl fmt::Display for ParseProviderTypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ParseProviderTypeError {}

impl FromStr for ProviderType {
    type Err = ParseProviderTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openrouter" => Ok(ProviderType::OpenRouter),
            "openai" => Ok(ProviderType::OpenAI),
            "replicate" => Ok(ProviderType::Replicate),
            _ =>
                Err(ParseProviderTypeError {
                    message: format!("Invalid provider type: '{}'", s),
                }),
        }
    }
}

/// Connection settings for one provider. Model and sampling parameters are
/// per call and live in [`RequestConfig`].
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub provider: ProviderType,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub connect_timeout: Option<Duration>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: ProviderType::OpenRouter,
            api_key: None,
            base_url: None,
            connect_timeout: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestConfig {
    pub model_id: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub stream: bool,
    pub top_p: Option<f32>,
    pub system_prompt: Option<String>,
}

impl RequestConfig {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), CompletionError> {
        if self.model_id.trim().is_empty() {
            return Err(CompletionError::Config("model id must not be empty".to_string()));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(
                CompletionError::Config(
                    format!("temperature {} is outside [0, 2]", self.temperature)
                )
            );
        }
        if self.max_tokens == 0 || self.max_tokens > MAX_TOKENS_LIMIT {
            return Err(
                CompletionError::Config(
                    format!("max_tokens {} is outside 1..={}", self.max_tokens, MAX_TOKENS_LIMIT)
                )
            );
        }
        if let Some(top_p) = self.top_p {
            if !(top_p > 0.0 && top_p <= 1.0) {
                return Err(CompletionError::Config(format!("top_p {} is outside (0, 1]", top_p)));
            }
        }
        Ok(())
    }

    /// System instructions to send, if any survive trimming.
    pub fn system_instructions(&self) -> Option<&str> {
        self.system_prompt
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            model_id: ProviderType::OpenRouter.default_model().to_string(),
            temperature: 1.0,
            max_tokens: 1000,
            stream: true,
            top_p: None,
            system_prompt: None,
        }
    }
}
