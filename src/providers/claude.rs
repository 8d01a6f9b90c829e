//! Anthropic Claude adapter (Messages API).
//!
//! Format differences handled here:
//! - system messages travel in a top-level `system` field
//! - `max_tokens` is mandatory
//! - tool messages and penalty parameters have no equivalent
//! - streaming uses typed SSE events instead of completion chunks

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{
    health_status, http_client, log_adjustments, parse_json, pricing_table, read_json,
    resolve_model, send, Adjustment, ChatReply, ModelPricing, PricingTable, ProviderAdapter,
    ProviderKind, HEALTH_CHECK_TIMEOUT,
};
use crate::config::{ExternalProviderConfig, Secret};
use crate::error::{Error, Result};
use crate::proxy::stream::{decode_stream, ChunkDecoder, SseDataReader};
use crate::proxy::types::{
    completion_id, unix_now, ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse,
    Delta, Role, Usage,
};

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
pub const DEFAULT_MODEL: &str = "claude-3-haiku-20240307";
pub const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

fn default_pricing() -> PricingTable {
    pricing_table(&[
        ("claude-3-5-sonnet-20241022", ModelPricing::new(0.003, 0.015, 8192, 200000)),
        ("claude-3-opus-20240229", ModelPricing::new(0.015, 0.075, 4096, 200000)),
        ("claude-3-sonnet-20240229", ModelPricing::new(0.003, 0.015, 4096, 200000)),
        ("claude-3-haiku-20240307", ModelPricing::new(0.00025, 0.00125, 4096, 200000)),
    ])
}

// ============================================================================
// Wire format
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct ClaudeRequest {
    pub model: String,
    pub max_tokens: u32,
    pub messages: Vec<ClaudeMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct ClaudeMessage {
    pub role: &'static str,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ClaudeResponse {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub usage: Option<ClaudeUsage>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ContentBlock {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub(crate) struct ClaudeUsage {
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart {
        message: StartMessage,
    },
    ContentBlockDelta {
        delta: BlockDelta,
    },
    MessageDelta {
        delta: MessageDeltaBody,
        #[serde(default)]
        usage: Option<ClaudeUsage>,
    },
    MessageStop,
    Error {
        error: StreamError,
    },
    /// ping, content_block_start, content_block_stop
    #[serde(other)]
    Ignored,
}

#[derive(Debug, Deserialize)]
struct StartMessage {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<ClaudeUsage>,
}

#[derive(Debug, Deserialize)]
struct BlockDelta {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaBody {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamError {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: String,
}

// ============================================================================
// Translation
// ============================================================================

/// Map Claude's stop reason onto the canonical finish reason.
pub(crate) fn finish_reason(stop_reason: &str) -> String {
    match stop_reason {
        "end_turn" | "stop_sequence" => "stop",
        "max_tokens" => "length",
        "tool_use" => "tool_calls",
        other => other,
    }
    .to_string()
}

fn serves_model(model: &str) -> bool {
    model.starts_with("claude-")
}

pub(crate) fn translate_request(
    request: &ChatCompletionRequest,
    default_model: &str,
) -> (ClaudeRequest, Vec<Adjustment>) {
    let mut adjustments = Vec::new();
    let model = resolve_model(
        request.model.as_deref(),
        default_model,
        serves_model,
        &mut adjustments,
    );

    let mut system = Vec::new();
    let mut messages = Vec::new();
    let mut tool_messages = 0;
    let mut non_text = 0;

    for message in &request.messages {
        non_text += message.non_text_parts();
        match message.role {
            Role::System | Role::Developer => system.push(message.text()),
            Role::User => messages.push(ClaudeMessage {
                role: "user",
                content: message.text(),
            }),
            Role::Assistant => messages.push(ClaudeMessage {
                role: "assistant",
                content: message.text(),
            }),
            Role::Tool | Role::Function => tool_messages += 1,
        }
    }

    if !system.is_empty() {
        adjustments.push(Adjustment::SystemHoisted { count: system.len() });
    }
    if tool_messages > 0 {
        adjustments.push(Adjustment::ToolMessagesDropped {
            count: tool_messages,
        });
    }
    if non_text > 0 {
        adjustments.push(Adjustment::NonTextContentDropped { count: non_text });
    }

    let mut dropped = Vec::new();
    if request.frequency_penalty.is_some() {
        dropped.push("frequency_penalty");
    }
    if request.presence_penalty.is_some() {
        dropped.push("presence_penalty");
    }
    if !dropped.is_empty() {
        adjustments.push(Adjustment::ParametersDropped { names: dropped });
    }

    let max_tokens = match request.max_tokens {
        Some(n) => n,
        None => {
            adjustments.push(Adjustment::MaxTokensDefaulted {
                max_tokens: DEFAULT_MAX_TOKENS,
            });
            DEFAULT_MAX_TOKENS
        }
    };

    let translated = ClaudeRequest {
        model,
        max_tokens,
        messages,
        system: (!system.is_empty()).then(|| system.join("\n\n")),
        temperature: request.temperature,
        top_p: request.top_p,
        stop_sequences: request.stop_sequences(),
        stream: request.stream,
    };
    (translated, adjustments)
}

pub(crate) fn translate_response(response: ClaudeResponse, model: &str) -> ChatCompletionResponse {
    let text: String = response
        .content
        .iter()
        .filter(|block| block.kind == "text")
        .filter_map(|block| block.text.as_deref())
        .collect();

    ChatCompletionResponse::assistant(
        response.model.unwrap_or_else(|| model.to_string()),
        text,
        Some(
            response
                .stop_reason
                .as_deref()
                .map(finish_reason)
                .unwrap_or_else(|| "stop".to_string()),
        ),
        response
            .usage
            .map(|u| Usage::new(u.input_tokens, u.output_tokens)),
    )
}

/// Converts Claude's event stream into canonical chunks.
pub(crate) struct ClaudeDecoder {
    provider: String,
    reader: SseDataReader,
    id: String,
    created: i64,
    model: String,
    usage: ClaudeUsage,
    stop_reason: Option<String>,
    started: bool,
    stopped: bool,
}

impl ClaudeDecoder {
    pub(crate) fn new(provider: &str, model: &str) -> Self {
        Self {
            provider: provider.to_string(),
            reader: SseDataReader::new(),
            id: completion_id(),
            created: unix_now(),
            model: model.to_string(),
            usage: ClaudeUsage::default(),
            stop_reason: None,
            started: false,
            stopped: false,
        }
    }

    fn chunk(&self, delta: Delta, finish_reason: Option<String>) -> ChatCompletionChunk {
        ChatCompletionChunk::new(&self.id, self.created, &self.model, delta, finish_reason)
    }

    fn event(&mut self, data: &str) -> Option<Result<ChatCompletionChunk>> {
        if self.stopped || data.is_empty() {
            return None;
        }
        let event: StreamEvent = match parse_json(&self.provider, data) {
            Ok(event) => event,
            Err(e) => return Some(Err(e)),
        };

        match event {
            StreamEvent::MessageStart { message } => {
                self.started = true;
                if let Some(model) = message.model {
                    self.model = model;
                }
                if let Some(usage) = message.usage {
                    self.usage.input_tokens = usage.input_tokens;
                }
                Some(Ok(self.chunk(
                    Delta {
                        role: Some(Role::Assistant),
                        content: Some(String::new()),
                    },
                    None,
                )))
            }
            StreamEvent::ContentBlockDelta { delta } if delta.kind == "text_delta" => {
                Some(Ok(self.chunk(
                    Delta {
                        role: None,
                        content: delta.text,
                    },
                    None,
                )))
            }
            StreamEvent::ContentBlockDelta { .. } => None,
            StreamEvent::MessageDelta { delta, usage } => {
                if delta.stop_reason.is_some() {
                    self.stop_reason = delta.stop_reason;
                }
                if let Some(usage) = usage {
                    self.usage.output_tokens = usage.output_tokens;
                }
                None
            }
            StreamEvent::MessageStop => {
                self.stopped = true;
                let reason = self
                    .stop_reason
                    .as_deref()
                    .map(finish_reason)
                    .unwrap_or_else(|| "stop".to_string());
                let usage = Usage::new(self.usage.input_tokens, self.usage.output_tokens);
                Some(Ok(self
                    .chunk(Delta::default(), Some(reason))
                    .with_usage(Some(usage))))
            }
            StreamEvent::Error { error } => {
                self.stopped = true;
                Some(Err(Error::ProviderStatus {
                    provider: self.provider.clone(),
                    status: 502,
                    body: format!("{}: {}", error.kind, error.message),
                }))
            }
            StreamEvent::Ignored => None,
        }
    }
}

impl ChunkDecoder for ClaudeDecoder {
    fn decode(&mut self, bytes: &[u8]) -> Vec<Result<ChatCompletionChunk>> {
        let payloads = self.reader.push(bytes);
        payloads
            .into_iter()
            .filter_map(|p| match p {
                Ok(data) => self.event(&data),
                Err(e) => {
                    self.stopped = true;
                    Some(Err(e.into_error(&self.provider)))
                }
            })
            .collect()
    }

    fn finish(&mut self) -> Vec<Result<ChatCompletionChunk>> {
        let mut out: Vec<_> = self
            .reader
            .finish()
            .and_then(|d| self.event(&d))
            .into_iter()
            .collect();
        if self.started && !self.stopped {
            out.push(Err(Error::Translation {
                provider: self.provider.clone(),
                message: "stream ended before message_stop".to_string(),
                raw: String::new(),
            }));
        }
        out
    }
}

// ============================================================================
// Adapter
// ============================================================================

pub struct ClaudeAdapter {
    name: String,
    api_key: Option<Secret>,
    base_url: String,
    default_model: String,
    pricing: PricingTable,
    client: Client,
}

impl ClaudeAdapter {
    pub fn new(config: &ExternalProviderConfig) -> Result<Self> {
        Ok(Self {
            name: config.name.clone(),
            api_key: config.api_key.clone(),
            base_url: config
                .base_url
                .as_deref()
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            default_model: config
                .default_model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            pricing: default_pricing(),
            client: http_client()?,
        })
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = request.header("anthropic-version", ANTHROPIC_VERSION);
        match &self.api_key {
            Some(key) => request.header("x-api-key", key.expose_secret()),
            None => request,
        }
    }
}

#[async_trait]
impl ProviderAdapter for ClaudeAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Claude
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    fn pricing_table(&self) -> &PricingTable {
        &self.pricing
    }

    fn serves(&self, model: &str) -> bool {
        serves_model(model)
    }

    async fn health_check(&self) -> Result<()> {
        let request = self
            .client
            .get(format!("{}/v1/models", self.base_url))
            .timeout(HEALTH_CHECK_TIMEOUT);
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| Error::upstream(&self.name, e))?;
        health_status(&self.name, response.status())
    }

    async fn forward(&self, request: ChatCompletionRequest) -> Result<ChatReply> {
        let (claude_request, adjustments) = translate_request(&request, &self.default_model);
        log_adjustments(&self.name, &adjustments);

        let http = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .json(&claude_request);
        let response = send(&self.name, self.authorized(http)).await?;

        if request.is_streaming() {
            let decoder = ClaudeDecoder::new(&self.name, &claude_request.model);
            return Ok(ChatReply::Stream(decode_stream(
                response.bytes_stream(),
                decoder,
                &self.name,
            )));
        }

        let body: ClaudeResponse = read_json(&self.name, response).await?;
        Ok(ChatReply::Complete(translate_response(
            body,
            &claude_request.model,
        )))
    }
}
