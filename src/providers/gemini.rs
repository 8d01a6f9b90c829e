//! Google Gemini adapter (generateContent API).
//!
//! Conversation turns become `contents` with roles `user` and `model`,
//! instructions go to `systemInstruction`, sampling options to
//! `generationConfig`. Streaming returns a JSON array whose elements arrive
//! incrementally.

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
use crate::proxy::stream::{decode_stream, ChunkDecoder, JsonArrayReader};
use crate::proxy::types::{
    completion_id, unix_now, ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse,
    Delta, Role, Usage,
};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_MODEL: &str = "gemini-pro";
const API_VERSION: &str = "v1beta";

fn default_pricing() -> PricingTable {
    pricing_table(&[
        ("gemini-1.5-pro", ModelPricing::new(0.0035, 0.0105, 8192, 2000000)),
        ("gemini-1.5-flash", ModelPricing::new(0.000075, 0.0003, 8192, 1000000)),
        ("gemini-pro", ModelPricing::new(0.0005, 0.0015, 2048, 30720)),
    ])
}

// ============================================================================
// Wire format
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GeminiRequest {
    pub contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl Content {
    fn text(role: Option<&str>, text: String) -> Self {
        Self {
            role: role.map(str::to_string),
            parts: vec![Part { text: Some(text) }],
        }
    }

    fn joined_text(&self) -> String {
        self.parts.iter().filter_map(|p| p.text.as_deref()).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
}

impl GenerationConfig {
    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GeminiResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default)]
    pub usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    pub model_version: Option<String>,
    /// Streamed bodies report failures in-band.
    #[serde(default)]
    pub error: Option<GeminiError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Candidate {
    #[serde(default)]
    pub content: Option<Content>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UsageMetadata {
    #[serde(default)]
    pub prompt_token_count: u32,
    #[serde(default)]
    pub candidates_token_count: u32,
    #[serde(default)]
    pub total_token_count: u32,
}

impl From<UsageMetadata> for Usage {
    fn from(meta: UsageMetadata) -> Self {
        Usage {
            prompt_tokens: meta.prompt_token_count,
            completion_tokens: meta.candidates_token_count,
            total_tokens: meta
                .total_token_count
                .max(meta.prompt_token_count.saturating_add(meta.candidates_token_count)),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct GeminiError {
    #[serde(default)]
    pub code: u16,
    #[serde(default)]
    pub message: String,
}

// ============================================================================
// Translation
// ============================================================================

pub(crate) fn finish_reason(reason: &str) -> String {
    match reason {
        "STOP" => "stop".to_string(),
        "MAX_TOKENS" => "length".to_string(),
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" => {
            "content_filter".to_string()
        }
        other => other.to_ascii_lowercase(),
    }
}

/// Model path segment; callers may pass either `gemini-pro` or `models/gemini-pro`.
fn model_path(model: &str) -> &str {
    model.strip_prefix("models/").unwrap_or(model)
}

fn serves_model(model: &str) -> bool {
    model_path(model).starts_with("gemini-")
}

pub(crate) fn translate_request(
    request: &ChatCompletionRequest,
    default_model: &str,
) -> (String, GeminiRequest, Vec<Adjustment>) {
    let mut adjustments = Vec::new();
    let model = resolve_model(
        request.model.as_deref(),
        default_model,
        serves_model,
        &mut adjustments,
    );

    let mut system = Vec::new();
    let mut contents = Vec::new();
    let mut renamed = 0;
    let mut tool_messages = 0;
    let mut non_text = 0;

    for message in &request.messages {
        non_text += message.non_text_parts();
        match message.role {
            Role::System | Role::Developer => system.push(message.text()),
            Role::User => contents.push(Content::text(Some("user"), message.text())),
            Role::Assistant => {
                renamed += 1;
                contents.push(Content::text(Some("model"), message.text()));
            }
            Role::Tool | Role::Function => tool_messages += 1,
        }
    }

    if !system.is_empty() {
        adjustments.push(Adjustment::SystemHoisted { count: system.len() });
    }
    if renamed > 0 {
        adjustments.push(Adjustment::AssistantRenamed { count: renamed });
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

    let config = GenerationConfig {
        temperature: request.temperature,
        top_p: request.top_p,
        max_output_tokens: request.max_tokens,
        stop_sequences: request.stop_sequences(),
    };

    let translated = GeminiRequest {
        contents,
        system_instruction: (!system.is_empty()).then(|| Content::text(None, system.join("\n\n"))),
        generation_config: (!config.is_empty()).then_some(config),
    };
    (model, translated, adjustments)
}

pub(crate) fn translate_response(
    provider: &str,
    response: GeminiResponse,
    model: &str,
) -> Result<ChatCompletionResponse> {
    let Some(candidate) = response.candidates.into_iter().next() else {
        return Err(Error::Translation {
            provider: provider.to_string(),
            message: "response carried no candidates".to_string(),
            raw: String::new(),
        });
    };

    let text = candidate
        .content
        .as_ref()
        .map(Content::joined_text)
        .unwrap_or_default();

    Ok(ChatCompletionResponse::assistant(
        response.model_version.unwrap_or_else(|| model.to_string()),
        text,
        Some(
            candidate
                .finish_reason
                .as_deref()
                .map(finish_reason)
                .unwrap_or_else(|| "stop".to_string()),
        ),
        response.usage_metadata.map(Usage::from),
    ))
}

/// Converts the streamed array of partial responses into canonical chunks.
pub(crate) struct GeminiDecoder {
    provider: String,
    reader: JsonArrayReader,
    id: String,
    created: i64,
    model: String,
    role_sent: bool,
    failed: bool,
}

impl GeminiDecoder {
    pub(crate) fn new(provider: &str, model: &str) -> Self {
        Self {
            provider: provider.to_string(),
            reader: JsonArrayReader::new(),
            id: completion_id(),
            created: unix_now(),
            model: model.to_string(),
            role_sent: false,
            failed: false,
        }
    }

    fn element(&mut self, raw: &str) -> Option<Result<ChatCompletionChunk>> {
        if self.failed {
            return None;
        }
        let response: GeminiResponse = match parse_json(&self.provider, raw) {
            Ok(response) => response,
            Err(e) => {
                self.failed = true;
                return Some(Err(e));
            }
        };

        if let Some(error) = response.error {
            self.failed = true;
            return Some(Err(Error::ProviderStatus {
                provider: self.provider.clone(),
                status: if error.code == 0 { 502 } else { error.code },
                body: error.message,
            }));
        }

        let candidate = response.candidates.into_iter().next();
        let text = candidate
            .as_ref()
            .and_then(|c| c.content.as_ref())
            .map(Content::joined_text)
            .unwrap_or_default();
        let finish = candidate
            .and_then(|c| c.finish_reason)
            .map(|r| finish_reason(&r));

        // Gemini repeats cumulative usage on every element; report it once.
        let usage = finish
            .is_some()
            .then_some(response.usage_metadata)
            .flatten()
            .map(Usage::from);

        if text.is_empty() && finish.is_none() && self.role_sent {
            return None;
        }

        let delta = Delta {
            role: (!self.role_sent).then_some(Role::Assistant),
            content: Some(text),
        };
        self.role_sent = true;
        Some(Ok(ChatCompletionChunk::new(
            &self.id,
            self.created,
            &self.model,
            delta,
            finish,
        )
        .with_usage(usage)))
    }
}

impl ChunkDecoder for GeminiDecoder {
    fn decode(&mut self, bytes: &[u8]) -> Vec<Result<ChatCompletionChunk>> {
        let elements = self.reader.push(bytes);
        elements
            .into_iter()
            .filter_map(|e| match e {
                Ok(raw) => self.element(&raw),
                Err(e) => {
                    self.failed = true;
                    Some(Err(e.into_error(&self.provider)))
                }
            })
            .collect()
    }

    fn finish(&mut self) -> Vec<Result<ChatCompletionChunk>> {
        match self.reader.pending() {
            Some(raw) if !self.failed => vec![Err(Error::Translation {
                provider: self.provider.clone(),
                message: "stream ended inside a response element".to_string(),
                raw,
            })],
            _ => Vec::new(),
        }
    }
}

// ============================================================================
// Adapter
// ============================================================================

pub struct GeminiAdapter {
    name: String,
    api_key: Option<Secret>,
    base_url: String,
    default_model: String,
    pricing: PricingTable,
    client: Client,
}

impl GeminiAdapter {
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

    /// The API key travels as the `key` query parameter.
    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.query(&[("key", key.expose_secret())]),
            None => request,
        }
    }

    fn method_url(&self, model: &str, method: &str) -> String {
        format!(
            "{}/{}/models/{}:{}",
            self.base_url,
            API_VERSION,
            model_path(model),
            method
        )
    }
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Gemini
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
            .get(format!("{}/{}/models", self.base_url, API_VERSION))
            .timeout(HEALTH_CHECK_TIMEOUT);
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| Error::upstream(&self.name, e))?;
        health_status(&self.name, response.status())
    }

    async fn forward(&self, request: ChatCompletionRequest) -> Result<ChatReply> {
        let (model, gemini_request, adjustments) =
            translate_request(&request, &self.default_model);
        log_adjustments(&self.name, &adjustments);

        let method = if request.is_streaming() {
            "streamGenerateContent"
        } else {
            "generateContent"
        };
        let http = self
            .client
            .post(self.method_url(&model, method))
            .json(&gemini_request);
        let response = send(&self.name, self.authorized(http)).await?;

        if request.is_streaming() {
            let decoder = GeminiDecoder::new(&self.name, &model);
            return Ok(ChatReply::Stream(decode_stream(
                response.bytes_stream(),
                decoder,
                &self.name,
            )));
        }

        let body: GeminiResponse = read_json(&self.name, response).await?;
        translate_response(&self.name, body, &model).map(ChatReply::Complete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::types::{Message, StopSequence};

    fn request(messages: Vec<Message>) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: Some("gemini-1.5-flash".to_string()),
            messages,
            temperature: Some(0.7),
            max_tokens: Some(256),
            stream: None,
            stream_options: None,
            top_p: None,
            frequency_penalty: None,
            presence_penalty: Some(0.3),
            stop: Some(StopSequence::Single("END".to_string())),
            user: None,
        }
    }

    #[test]
    fn test_roles_and_generation_config() {
        let req = request(vec![
            Message::new(Role::System, "be terse"),
            Message::new(Role::User, "hi"),
            Message::new(Role::Assistant, "hello"),
            Message::new(Role::User, "again"),
        ]);
        let (model, out, adjustments) = translate_request(&req, DEFAULT_MODEL);
        assert_eq!(model, "gemini-1.5-flash");

        let json = serde_json::to_value(&out).unwrap();
        assert_eq!(json["systemInstruction"]["parts"][0]["text"], "be terse");
        assert!(json["systemInstruction"].get("role").is_none());
        assert_eq!(json["contents"].as_array().unwrap().len(), 3);
        assert_eq!(json["contents"][1]["role"], "model");
        assert_eq!(json["contents"][1]["parts"][0]["text"], "hello");
        assert_eq!(json["generationConfig"]["maxOutputTokens"], 256);
        assert_eq!(json["generationConfig"]["stopSequences"][0], "END");
        assert!(json["generationConfig"].get("topP").is_none());

        assert!(adjustments.contains(&Adjustment::SystemHoisted { count: 1 }));
        assert!(adjustments.contains(&Adjustment::AssistantRenamed { count: 1 }));
        assert!(adjustments.contains(&Adjustment::ParametersDropped {
            names: vec!["presence_penalty"]
        }));
    }

    #[test]
    fn test_foreign_model_substituted() {
        let mut req = request(vec![Message::new(Role::User, "hi")]);
        req.model = Some("gpt-4".to_string());
        req.temperature = None;
        req.max_tokens = None;
        req.stop = None;
        let (model, out, adjustments) = translate_request(&req, DEFAULT_MODEL);
        assert_eq!(model, DEFAULT_MODEL);
        assert!(out.generation_config.is_none());
        assert_eq!(
            adjustments[0],
            Adjustment::ModelSubstituted {
                requested: "gpt-4".to_string(),
                used: DEFAULT_MODEL.to_string()
            }
        );
    }

    #[test]
    fn test_response_round_trip_keeps_content_and_usage() {
        let raw = r#"{
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "Bonjour"}, {"text": "!"}]},
                "finishReason": "MAX_TOKENS"
            }],
            "usageMetadata": {"promptTokenCount": 5, "candidatesTokenCount": 3, "totalTokenCount": 8}
        }"#;
        let parsed: GeminiResponse = serde_json::from_str(raw).unwrap();
        let out = translate_response("gemini", parsed, DEFAULT_MODEL).unwrap();

        assert_eq!(out.model, DEFAULT_MODEL);
        assert_eq!(out.choices[0].message.role, Role::Assistant);
        assert_eq!(out.choices[0].message.text(), "Bonjour!");
        assert_eq!(out.choices[0].finish_reason.as_deref(), Some("length"));
        assert_eq!(out.usage, Some(Usage::new(5, 3)));
    }

    #[test]
    fn test_response_without_candidates_is_translation_error() {
        let parsed: GeminiResponse =
            serde_json::from_str(r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#).unwrap();
        assert!(matches!(
            translate_response("gemini", parsed, DEFAULT_MODEL),
            Err(Error::Translation { .. })
        ));
    }

    #[test]
    fn test_finish_reason_mapping() {
        assert_eq!(finish_reason("STOP"), "stop");
        assert_eq!(finish_reason("SAFETY"), "content_filter");
        assert_eq!(finish_reason("OTHER"), "other");
    }

    #[test]
    fn test_stream_array_becomes_chunks() {
        let body = r#"[{"candidates":[{"content":{"role":"model","parts":[{"text":"Hel"}]}}],"usageMetadata":{"promptTokenCount":4,"candidatesTokenCount":1}}
,
{"candidates":[{"content":{"role":"model","parts":[{"text":"lo"}]},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":4,"candidatesTokenCount":2,"totalTokenCount":6}}
]"#;
        let mut decoder = GeminiDecoder::new("gemini", DEFAULT_MODEL);
        let mut chunks = Vec::new();
        for piece in body.as_bytes().chunks(11) {
            chunks.extend(decoder.decode(piece));
        }
        chunks.extend(decoder.finish());
        let chunks: Vec<_> = chunks.into_iter().map(Result::unwrap).collect();

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].choices[0].delta.role, Some(Role::Assistant));
        assert!(chunks[0].usage.is_none());
        assert_eq!(chunks[1].choices[0].delta.role, None);
        assert_eq!(chunks[0].text() + &chunks[1].text(), "Hello");
        assert_eq!(chunks[1].choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(chunks[1].usage, Some(Usage::new(4, 2)));
    }

    #[test]
    fn test_stream_in_band_error() {
        let mut decoder = GeminiDecoder::new("gemini", DEFAULT_MODEL);
        let out = decoder
            .decode(br#"[{"error":{"code":429,"message":"quota","status":"RESOURCE_EXHAUSTED"}}]"#);
        assert!(matches!(
            &out[0],
            Err(Error::ProviderStatus { status: 429, .. })
        ));
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn test_stream_truncated_element() {
        let mut decoder = GeminiDecoder::new("gemini", DEFAULT_MODEL);
        assert!(decoder.decode(br#"[{"candidates":[{"content""#).is_empty());
        assert!(matches!(
            decoder.finish().as_slice(),
            [Err(Error::Translation { .. })]
        ));
    }

    #[test]
    fn test_usage_metadata_total_saturates() {
        let usage = Usage::from(UsageMetadata {
            prompt_token_count: u32::MAX,
            candidates_token_count: 5,
            total_token_count: 0,
        });
        assert_eq!(usage.total_tokens, u32::MAX);
    }

    #[tokio::test]
    async fn test_transport_errors_do_not_leak_api_key() {
        let adapter = GeminiAdapter::new(&ExternalProviderConfig {
            name: "gemini".to_string(),
            kind: ProviderKind::Gemini,
            api_key: Some(Secret::from("SUPERSECRETKEY123")),
            base_url: Some("http://127.0.0.1:1".to_string()),
            default_model: None,
            enabled: true,
        })
        .unwrap();

        let err = adapter
            .forward(request(vec![Message::new(Role::User, "hi")]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Upstream { .. }));
        assert!(!err.to_string().contains("SUPERSECRETKEY123"), "{}", err);

        let err = adapter.health_check().await.unwrap_err();
        assert!(!err.to_string().contains("SUPERSECRETKEY123"), "{}", err);
    }
}
