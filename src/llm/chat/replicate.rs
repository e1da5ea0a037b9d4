use async_trait::async_trait;
use log::{ info, warn };
use reqwest::{ Client as HttpClient, header::{ ACCEPT, CACHE_CONTROL } };
use serde::{ Deserialize, Serialize };
use std::time::Duration;

use super::{ build_http_client, check_request, ensure_success, require_api_key, ChatClient, TextStream };
use crate::config::prompt::{ render_chatml_prompt, LANGUAGE_INSTRUCTION };
use crate::llm::sse::{ decode_event_stream, field_value, single_fragment, EventParser, MalformedLine, StreamEvent };
use crate::llm::{ CompletionError, LlmConfig, ProviderType, RequestConfig };
use crate::models::chat::{ ConversationHistory, ConversationTurn };

const REPLICATE_URL: &str = "https://api.replicate.com/v1";
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Client for Replicate language models, which take a single rendered prompt
/// instead of a message list and stream through a separate SSE URL.
pub struct ReplicateChatClient {
    http: HttpClient,
    base_url: String,
}

#[derive(Serialize)]
struct ReplicateInput {
    prompt: String,
    prompt_template: &'static str,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    max_tokens: u32,
}

#[derive(Serialize)]
struct PredictionRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<&'a str>,
    input: ReplicateInput,
    stream: bool,
}

#[derive(Deserialize)]
struct Prediction {
    id: String,
    status: Option<String>,
    urls: Option<PredictionUrls>,
    output: Option<serde_json::Value>,
    error: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct PredictionUrls {
    stream: Option<String>,
    get: Option<String>,
}

#[derive(Deserialize)]
struct ErrorPayload {
    detail: Option<String>,
}

/// `owner/name` or `owner/name:version`.
#[derive(Debug, PartialEq, Eq)]
struct ModelRef<'a> {
    name: &'a str,
    version: Option<&'a str>,
}

impl<'a> ModelRef<'a> {
    fn parse(model_id: &'a str) -> Result<Self, CompletionError> {
        let (name, version) = match model_id.split_once(':') {
            Some((name, version)) => (name, Some(version)),
            None => (model_id, None),
        };
        match name.split_once('/') {
            Some((owner, model)) if !owner.is_empty() && !model.is_empty() && !model.contains('/') => {
                Ok(Self { name, version: version.filter(|v| !v.is_empty()) })
            }
            _ =>
                Err(
                    CompletionError::Config(
                        format!("Replicate model must look like owner/name[:version], got '{}'", model_id)
                    )
                ),
        }
    }
}

/// Frames `event:`/`data:` lines and dispatches on the blank line that ends
/// each event. Multi-line data is joined with `\n`.
#[derive(Debug, Default)]
pub struct PredictionEventParser {
    event: Option<String>,
    data: Vec<String>,
}

impl PredictionEventParser {
    fn dispatch(&mut self) -> Option<StreamEvent> {
        let event = self.event.take();
        if self.data.is_empty() && event.is_none() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        match event.as_deref().unwrap_or("message") {
            "output" if !data.is_empty() => Some(StreamEvent::Content(data)),
            "done" => Some(StreamEvent::Done),
            "error" => {
                let detail = serde_json::from_str::<ErrorPayload>(&data)
                    .ok()
                    .and_then(|payload| payload.detail)
                    .unwrap_or(data);
                Some(StreamEvent::Failed(detail))
            }
            _ => None,
        }
    }
}

impl EventParser for PredictionEventParser {
    fn parse_line(&mut self, line: &str) -> Result<Option<StreamEvent>, MalformedLine> {
        if line.is_empty() {
            return Ok(self.dispatch());
        }
        if let Some(event) = field_value(line, "event") {
            self.event = Some(event.to_string());
        } else if let Some(data) = field_value(line, "data") {
            self.data.push(data.to_string());
        }
        Ok(None)
    }

    fn finish(&mut self) -> Option<StreamEvent> {
        self.dispatch()
    }
}

/// ChatML prompt for the prediction. The language instruction always opens
/// the system block, followed by any persona instructions.
fn render_prompt(history: &ConversationHistory, new_turn: &str, config: &RequestConfig) -> String {
    let system = match config.system_instructions() {
        Some(instructions) => format!("{} {}", LANGUAGE_INSTRUCTION, instructions),
        None => LANGUAGE_INSTRUCTION.to_string(),
    };
    let mut turns = Vec::with_capacity(history.len() + 2);
    turns.push(ConversationTurn::system(system));
    turns.extend(history.iter().cloned());
    turns.push(ConversationTurn::user(new_turn));
    render_chatml_prompt(&turns)
}

fn output_text(output: &serde_json::Value) -> String {
    match output {
        serde_json::Value::String(text) => text.clone(),
        serde_json::Value::Array(parts) =>
            parts
                .iter()
                .filter_map(|part| part.as_str())
                .collect(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

impl ReplicateChatClient {
    pub fn new(api_key: &str, config: &LlmConfig) -> Result<Self, CompletionError> {
        if !(api_key.starts_with("r8_") && api_key.len() == 40) {
            warn!("Replicate API token does not look like an r8_ token; the provider may reject it");
        }
        let base_url = config.base_url
            .clone()
            .unwrap_or_else(|| REPLICATE_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            http: build_http_client(api_key, config)?,
            base_url,
        })
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, CompletionError> {
        let api_key = require_api_key(config)?;
        Self::new(&api_key, config)
    }

    async fn create_prediction(
        &self,
        model: &ModelRef<'_>,
        input: ReplicateInput,
        stream: bool
    ) -> Result<Prediction, CompletionError> {
        let url = match model.version {
            Some(_) => format!("{}/predictions", self.base_url),
            None => format!("{}/models/{}/predictions", self.base_url, model.name),
        };
        let req = PredictionRequest { version: model.version, input, stream };

        let mut builder = self.http.post(&url).json(&req);
        if !stream {
            builder = builder.header("Prefer", "wait");
        }
        let body = ensure_success(builder.send().await?).await?.text().await?;
        let prediction = serde_json::from_str::<Prediction>(&body)?;
        info!("Created Replicate prediction {} for {}", prediction.id, model.name);
        Ok(prediction)
    }

    /// Polls until the prediction reaches a terminal status.
    async fn wait_for_output(&self, mut prediction: Prediction) -> Result<String, CompletionError> {
        loop {
            match prediction.status.as_deref() {
                Some("succeeded") => {
                    return Ok(prediction.output.as_ref().map(output_text).unwrap_or_default());
                }
                Some("failed") | Some("canceled") => {
                    let reason = prediction.error
                        .as_ref()
                        .map(output_text)
                        .unwrap_or_else(|| "prediction did not succeed".to_string());
                    return Err(CompletionError::Stream(reason));
                }
                _ => {}
            }
            let get_url = prediction.urls
                .as_ref()
                .and_then(|urls| urls.get.clone())
                .ok_or_else(|| CompletionError::Stream(format!("Prediction {} has no status URL", prediction.id)))?;
            tokio::time::sleep(POLL_INTERVAL).await;
            let body = ensure_success(self.http.get(&get_url).send().await?).await?.text().await?;
            prediction = serde_json::from_str::<Prediction>(&body)?;
        }
    }
}

#[async_trait]
impl ChatClient for ReplicateChatClient {
    async fn stream(
        &self,
        history: &ConversationHistory,
        new_turn: &str,
        config: &RequestConfig
    ) -> Result<TextStream, CompletionError> {
        check_request(new_turn, config)?;
        let model = ModelRef::parse(&config.model_id)?;

        let input = ReplicateInput {
            prompt: render_prompt(history, new_turn, config),
            prompt_template: "{prompt}",
            temperature: config.temperature,
            top_p: config.top_p,
            max_tokens: config.max_tokens,
        };

        let prediction = self.create_prediction(&model, input, config.stream).await?;

        if !config.stream {
            let response = self.wait_for_output(prediction).await?;
            return Ok(single_fragment(response));
        }

        let stream_url = prediction.urls
            .and_then(|urls| urls.stream)
            .ok_or_else(|| CompletionError::Stream(format!("Prediction {} has no stream URL", prediction.id)))?;

        info!("Starting replicate stream request to {}", stream_url);
        let resp = self.http
            .get(&stream_url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-store")
            .send().await?;
        let resp = ensure_success(resp).await?;

        Ok(decode_event_stream(resp.bytes_stream(), PredictionEventParser::default()))
    }

    fn budget_text(&self, history: &ConversationHistory, new_turn: &str, config: &RequestConfig) -> String {
        render_prompt(history, new_turn, config)
    }

    fn provider(&self) -> ProviderType {
        ProviderType::Replicate
    }
}
