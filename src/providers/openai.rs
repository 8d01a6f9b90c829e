//! OpenAI adapter. The canonical schema is OpenAI's, so translation is limited
//! to model resolution and stream usage reporting.

use async_trait::async_trait;
use reqwest::Client;

use super::{
    health_status, http_client, log_adjustments, parse_json, pricing_table, read_json,
    resolve_model, send, Adjustment, ChatReply, ModelPricing, PricingTable, ProviderAdapter,
    ProviderKind, HEALTH_CHECK_TIMEOUT,
};
use crate::config::{ExternalProviderConfig, Secret};
use crate::error::Result;
use crate::proxy::stream::{decode_stream, ChunkDecoder, SseDataReader};
use crate::proxy::types::{
    ensure_stream_options, ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse,
    EmbeddingRequest, EmbeddingResponse,
};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com";
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";

const MODEL_PREFIXES: &[&str] = &["gpt-", "chatgpt-", "o1", "o3", "o4", "text-embedding-"];

fn default_pricing() -> PricingTable {
    pricing_table(&[
        ("gpt-4", ModelPricing::new(0.03, 0.06, 8192, 8192)),
        ("gpt-4-turbo", ModelPricing::new(0.01, 0.03, 4096, 128000)),
        ("gpt-3.5-turbo", ModelPricing::new(0.0005, 0.0015, 4096, 16385)),
        ("gpt-3.5-turbo-16k", ModelPricing::new(0.003, 0.004, 16384, 16385)),
    ])
}

pub struct OpenAiAdapter {
    name: String,
    api_key: Option<Secret>,
    base_url: String,
    default_model: String,
    /// A non-default base URL points at an OpenAI-compatible server that may
    /// host any model name.
    custom_base_url: bool,
    pricing: PricingTable,
    client: Client,
}

impl OpenAiAdapter {
    pub fn new(config: &ExternalProviderConfig) -> Result<Self> {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        Ok(Self {
            name: config.name.clone(),
            api_key: config.api_key.clone(),
            custom_base_url: base_url != DEFAULT_BASE_URL,
            base_url,
            default_model: config
                .default_model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            pricing: default_pricing(),
            client: http_client()?,
        })
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key.expose_secret()),
            None => request,
        }
    }
}

/// Resolve the model and request usage on streamed responses.
pub(crate) fn translate_request(
    mut request: ChatCompletionRequest,
    default_model: &str,
    serves: impl Fn(&str) -> bool,
) -> (ChatCompletionRequest, Vec<Adjustment>) {
    let mut adjustments = Vec::new();
    let model = resolve_model(request.model.as_deref(), default_model, serves, &mut adjustments);
    request.model = Some(model);

    if request.is_streaming() && ensure_stream_options(&mut request) {
        adjustments.push(Adjustment::StreamUsageRequested);
    }
    (request, adjustments)
}

/// Decodes OpenAI's SSE stream, which already carries canonical chunks.
pub(crate) struct OpenAiDecoder {
    provider: String,
    reader: SseDataReader,
    done: bool,
}

impl OpenAiDecoder {
    pub(crate) fn new(provider: &str) -> Self {
        Self {
            provider: provider.to_string(),
            reader: SseDataReader::new(),
            done: false,
        }
    }

    fn payload(&mut self, data: String) -> Option<Result<ChatCompletionChunk>> {
        if self.done || data.is_empty() {
            return None;
        }
        if data == "[DONE]" {
            self.done = true;
            return None;
        }
        Some(parse_json(&self.provider, &data))
    }
}

impl ChunkDecoder for OpenAiDecoder {
    fn decode(&mut self, bytes: &[u8]) -> Vec<Result<ChatCompletionChunk>> {
        let payloads = self.reader.push(bytes);
        payloads
            .into_iter()
            .filter_map(|p| match p {
                Ok(data) => self.payload(data),
                Err(e) => Some(Err(e.into_error(&self.provider))),
            })
            .collect()
    }

    fn finish(&mut self) -> Vec<Result<ChatCompletionChunk>> {
        self.reader
            .finish()
            .and_then(|d| self.payload(d))
            .into_iter()
            .collect()
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    fn pricing_table(&self) -> &PricingTable {
        &self.pricing
    }

    fn serves(&self, model: &str) -> bool {
        self.custom_base_url
            || self.pricing.contains_key(model)
            || MODEL_PREFIXES.iter().any(|p| model.starts_with(p))
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
            .map_err(|e| crate::error::Error::upstream(&self.name, e))?;
        health_status(&self.name, response.status())
    }

    async fn forward(&self, request: ChatCompletionRequest) -> Result<ChatReply> {
        let (request, adjustments) =
            translate_request(request, &self.default_model, |m| self.serves(m));
        log_adjustments(&self.name, &adjustments);

        let http = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .json(&request);
        let response = send(&self.name, self.authorized(http)).await?;

        if request.is_streaming() {
            let decoder = OpenAiDecoder::new(&self.name);
            return Ok(ChatReply::Stream(decode_stream(
                response.bytes_stream(),
                decoder,
                &self.name,
            )));
        }

        let body: ChatCompletionResponse = read_json(&self.name, response).await?;
        Ok(ChatReply::Complete(body))
    }

    async fn embeddings(&self, mut request: EmbeddingRequest) -> Result<EmbeddingResponse> {
        if request.model.is_none() {
            request.model = Some(DEFAULT_EMBEDDING_MODEL.to_string());
        }
        let http = self
            .client
            .post(format!("{}/v1/embeddings", self.base_url))
            .json(&request);
        let response = send(&self.name, self.authorized(http)).await?;
        read_json(&self.name, response).await
    }
}
