use async_trait::async_trait;
use log::{ debug, info };
use reqwest::{ Client as HttpClient, header::ACCEPT };
use serde::{ Deserialize, Serialize };

use super::{ build_http_client, build_messages, check_request, ensure_success, require_api_key, ChatClient, TextStream };
use crate::llm::sse::{ decode_event_stream, field_value, single_fragment, EventParser, MalformedLine, StreamEvent };
use crate::llm::{ CompletionError, LlmConfig, ProviderType, RequestConfig };
use crate::models::chat::{ ConversationHistory, ConversationTurn };

const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1";
const OPENAI_URL: &str = "https://api.openai.com/v1";
const COMPLETIONS_ROUTE: &str = "/chat/completions";

/// Client for OpenAI-compatible chat-completions endpoints (OpenRouter, OpenAI).
pub struct OpenAIChatClient {
    http: HttpClient,
    provider: ProviderType,
    url: String,
}

#[derive(Serialize)]
struct OpenAIChatRequest<'a> {
    model: &'a str,
    messages: Vec<ConversationTurn>,
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    stream: bool,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    #[serde(default)]
    choices: Vec<OpenAIChoice>,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessage,
}

#[derive(Deserialize)]
struct OpenAIMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAIStreamResponse {
    #[serde(default)]
    choices: Vec<OpenAIStreamChoice>,
    error: Option<OpenAIStreamError>,
}

#[derive(Deserialize)]
struct OpenAIStreamChoice {
    delta: Option<OpenAIDelta>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAIDelta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAIStreamError {
    message: Option<String>,
    code: Option<serde_json::Value>,
}

/// Decodes `data: {json}` lines; `data: [DONE]` ends the stream.
#[derive(Debug, Default)]
pub struct ChatCompletionParser;

impl EventParser for ChatCompletionParser {
    fn parse_line(&mut self, line: &str) -> Result<Option<StreamEvent>, MalformedLine> {
        let Some(data) = field_value(line, "data") else {
            return Ok(None);
        };
        let data = data.trim();
        if data == "[DONE]" {
            return Ok(Some(StreamEvent::Done));
        }

        let chunk = serde_json::from_str::<OpenAIStreamResponse>(data).map_err(|e| MalformedLine {
            line: line.to_string(),
            reason: e.to_string(),
        })?;

        if let Some(error) = chunk.error {
            let message = error.message.unwrap_or_else(|| "unknown error".to_string());
            let message = match error.code {
                Some(code) => format!("{} (code {})", message, code),
                None => message,
            };
            return Ok(Some(StreamEvent::Failed(message)));
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return Ok(None);
        };
        if let Some(reason) = &choice.finish_reason {
            debug!("Stream finish reason: {}", reason);
        }
        Ok(
            choice.delta
                .and_then(|delta| delta.content)
                .filter(|content| !content.is_empty())
                .map(StreamEvent::Content)
        )
    }
}

impl OpenAIChatClient {
    pub fn new(
        api_key: &str,
        provider: ProviderType,
        config: &LlmConfig
    ) -> Result<Self, CompletionError> {
        let base_url = config.base_url.clone().unwrap_or_else(|| {
            match provider {
                ProviderType::OpenAI => OPENAI_URL.to_string(),
                _ => OPENROUTER_URL.to_string(),
            }
        });

        Ok(Self {
            http: build_http_client(api_key, config)?,
            provider,
            url: completions_url(&base_url),
        })
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, CompletionError> {
        let api_key = require_api_key(config)?;
        Self::new(&api_key, config.provider, config)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn complete_once(&self, req: &OpenAIChatRequest<'_>) -> Result<String, CompletionError> {
        let resp = self.http.post(&self.url).json(req).send().await?;
        let body = ensure_success(resp).await?.text().await?;
        let resp = serde_json::from_str::<OpenAIResponse>(&body)?;

        resp.choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content.unwrap_or_default())
            .ok_or_else(|| CompletionError::Stream(format!("No response from {} API", self.provider)))
    }
}

/// Accepts either a bare API root or the full completions endpoint.
fn completions_url(base_url: &str) -> String {
    let trimmed = base_url.trim_end_matches('/');
    if trimmed.ends_with(COMPLETIONS_ROUTE) {
        trimmed.to_string()
    } else {
        format!("{}{}", trimmed, COMPLETIONS_ROUTE)
    }
}

#[async_trait]
impl ChatClient for OpenAIChatClient {
    async fn stream(
        &self,
        history: &ConversationHistory,
        new_turn: &str,
        config: &RequestConfig
    ) -> Result<TextStream, CompletionError> {
        check_request(new_turn, config)?;

        let req = OpenAIChatRequest {
            model: &config.model_id,
            messages: build_messages(history, new_turn, config),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            top_p: config.top_p,
            stream: config.stream,
        };

        if !config.stream {
            info!("Sending {} completion request (model {})", self.provider, config.model_id);
            let response = self.complete_once(&req).await?;
            return Ok(single_fragment(response));
        }

        info!("Starting {} stream request to {} (model {})", self.provider, self.url, config.model_id);
        let resp = self.http
            .post(&self.url)
            .header(ACCEPT, "text/event-stream")
            .json(&req)
            .send().await?;
        let resp = ensure_success(resp).await?;

        Ok(decode_event_stream(resp.bytes_stream(), ChatCompletionParser))
    }

    fn provider(&self) -> ProviderType {
        self.provider
    }
}
