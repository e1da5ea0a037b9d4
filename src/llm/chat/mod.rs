pub mod openai;
pub mod replicate;

use async_trait::async_trait;
use futures::StreamExt;
use log::debug;
use reqwest::{ Client as HttpClient, Response, header::{ HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE } };
use std::sync::Arc;

use self::openai::OpenAIChatClient;
use self::replicate::ReplicateChatClient;
use super::{ CompletionError, LlmConfig, ProviderType, RequestConfig };
use crate::models::chat::{ ConversationHistory, ConversationTurn };
use crate::tokens::pending_text;

pub use super::sse::TextStream;

#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Sends `history` plus `new_turn` and returns the reply as a lazy,
    /// single-pass stream of text fragments.
    ///
    /// Errors raised before the first fragment (bad config, rejected
    /// credential, non-2xx status, connection failure) are returned here;
    /// later failures arrive as `Err` items and end the stream.
    async fn stream(
        &self,
        history: &ConversationHistory,
        new_turn: &str,
        config: &RequestConfig
    ) -> Result<TextStream, CompletionError>;

    /// Drains [`ChatClient::stream`] into a single string.
    async fn complete(
        &self,
        history: &ConversationHistory,
        new_turn: &str,
        config: &RequestConfig
    ) -> Result<String, CompletionError> {
        let mut stream = self.stream(history, new_turn, config).await?;
        let mut response = String::new();
        while let Some(fragment) = stream.next().await {
            response.push_str(&fragment?);
        }
        Ok(response)
    }

    /// Text the token budget is checked against. Defaults to the newline
    /// joined turn contents; prompt-only providers count the rendered prompt.
    fn budget_text(&self, history: &ConversationHistory, new_turn: &str, _config: &RequestConfig) -> String {
        pending_text(history, new_turn)
    }

    fn provider(&self) -> ProviderType;
}

pub fn new_client(config: &LlmConfig) -> Result<Arc<dyn ChatClient>, CompletionError> {
    let client: Arc<dyn ChatClient> = match config.provider {
        ProviderType::OpenRouter | ProviderType::OpenAI => {
            let specific_client = OpenAIChatClient::from_config(config)?;
            Arc::new(specific_client)
        }
        ProviderType::Replicate => {
            let specific_client = ReplicateChatClient::from_config(config)?;
            Arc::new(specific_client)
        }
    };
    Ok(client)
}

/// Outgoing turn list: system instructions first, then the history in order,
/// then the new user turn.
pub fn build_messages(
    history: &ConversationHistory,
    new_turn: &str,
    config: &RequestConfig
) -> Vec<ConversationTurn> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    if let Some(system) = config.system_instructions() {
        messages.push(ConversationTurn::system(system));
    }
    messages.extend(history.iter().cloned());
    messages.push(ConversationTurn::user(new_turn));
    messages
}

pub(crate) fn check_request(new_turn: &str, config: &RequestConfig) -> Result<(), CompletionError> {
    if new_turn.trim().is_empty() {
        return Err(CompletionError::Config("new turn must not be empty".to_string()));
    }
    config.validate()
}

pub(crate) fn require_api_key(config: &LlmConfig) -> Result<String, CompletionError> {
    config.api_key
        .clone()
        .filter(|key| !key.trim().is_empty())
        .ok_or_else(|| CompletionError::Config(format!("{} API key is required", config.provider)))
}

/// Builds the shared HTTP client with bearer auth baked into the default headers.
pub(crate) fn build_http_client(
    api_key: &str,
    config: &LlmConfig
) -> Result<HttpClient, CompletionError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    let mut auth = HeaderValue::from_str(&format!("Bearer {}", api_key)).map_err(|e|
        CompletionError::Config(format!("Invalid API key format: {}", e))
    )?;
    auth.set_sensitive(true);
    headers.insert(AUTHORIZATION, auth);

    let mut builder = HttpClient::builder().default_headers(headers);
    if let Some(timeout) = config.connect_timeout {
        builder = builder.connect_timeout(timeout);
    }
    Ok(builder.build()?)
}

/// Passes 2xx responses through; otherwise reads the body into the error.
pub(crate) async fn ensure_success(resp: Response) -> Result<Response, CompletionError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = match resp.text().await {
        Ok(body) => body,
        Err(e) => {
            debug!("Failed to read {} error body: {}", status, e);
            String::new()
        }
    };
    debug!("Provider returned {}: {}", status, body);
    Err(CompletionError::from_status(status.as_u16(), body))
}
