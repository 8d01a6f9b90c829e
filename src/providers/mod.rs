//! External hosted-model providers.
//!
//! Each provider family implements [`ProviderAdapter`]; the router and the
//! HTTP handlers only ever see `Arc<dyn ProviderAdapter>`. Adapters translate
//! the canonical request into their wire format, call the provider, and
//! translate the answer back. Every change a translation makes to the
//! request is reported as an [`Adjustment`].

mod claude;
mod gemini;
mod openai;

pub use claude::ClaudeAdapter;
pub use gemini::GeminiAdapter;
pub use openai::OpenAiAdapter;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::ExternalProviderConfig;
use crate::error::{Error, Result};
use crate::forward::FORWARD_TIMEOUT;
use crate::proxy::stream::ChunkStream;
use crate::proxy::types::{
    ChatCompletionRequest, ChatCompletionResponse, EmbeddingRequest, EmbeddingResponse,
};

/// Timeout for provider liveness checks.
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Provider family, the `type` key of an `externalProviders` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Claude,
    Gemini,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Claude => "claude",
            ProviderKind::Gemini => "gemini",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Published price of one model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ModelPricing {
    pub input_price_per_1k: f64,
    pub output_price_per_1k: f64,
    pub max_tokens: u32,
    pub context_window: u32,
}

impl ModelPricing {
    pub const fn new(input: f64, output: f64, max_tokens: u32, context_window: u32) -> Self {
        Self {
            input_price_per_1k: input,
            output_price_per_1k: output,
            max_tokens,
            context_window,
        }
    }

    /// Mean of input and output price; the figure used for routing.
    pub fn average_per_1k(&self) -> f64 {
        (self.input_price_per_1k + self.output_price_per_1k) / 2.0
    }

    pub fn cost(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        f64::from(input_tokens) * self.input_price_per_1k / 1000.0
            + f64::from(output_tokens) * self.output_price_per_1k / 1000.0
    }
}

/// Model name to pricing, sorted by model name.
pub type PricingTable = BTreeMap<String, ModelPricing>;

fn pricing_table(entries: &[(&str, ModelPricing)]) -> PricingTable {
    entries
        .iter()
        .map(|(model, pricing)| (model.to_string(), *pricing))
        .collect()
}

/// Cheapest model by average price; ties go to the first model by name.
pub fn cheapest_model(table: &PricingTable) -> Option<(&str, &ModelPricing)> {
    table
        .iter()
        .fold(None, |best: Option<(&String, &ModelPricing)>, (model, pricing)| match best {
            Some((_, b)) if b.average_per_1k() <= pricing.average_per_1k() => best,
            _ => Some((model, pricing)),
        })
        .map(|(model, pricing)| (model.as_str(), pricing))
}

/// A change made to a request while translating it for a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Adjustment {
    /// The request named no model; the provider default was used.
    DefaultModelApplied { model: String },
    /// The requested model belongs to another family and was replaced.
    ModelSubstituted { requested: String, used: String },
    /// System messages moved out of the message list into a dedicated field.
    SystemHoisted { count: usize },
    /// `assistant` turns renamed to the provider's role name.
    AssistantRenamed { count: usize },
    /// Tool/function messages the provider format cannot carry.
    ToolMessagesDropped { count: usize },
    /// Image or other non-text content parts.
    NonTextContentDropped { count: usize },
    /// Sampling parameters the provider does not support.
    ParametersDropped { names: Vec<&'static str> },
    /// `max_tokens` is mandatory for the provider and was filled in.
    MaxTokensDefaulted { max_tokens: u32 },
    /// Usage reporting requested for a streamed response.
    StreamUsageRequested,
}

impl Adjustment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Adjustment::DefaultModelApplied { .. } => "default_model_applied",
            Adjustment::ModelSubstituted { .. } => "model_substituted",
            Adjustment::SystemHoisted { .. } => "system_hoisted",
            Adjustment::AssistantRenamed { .. } => "assistant_renamed",
            Adjustment::ToolMessagesDropped { .. } => "tool_messages_dropped",
            Adjustment::NonTextContentDropped { .. } => "non_text_content_dropped",
            Adjustment::ParametersDropped { .. } => "parameters_dropped",
            Adjustment::MaxTokensDefaulted { .. } => "max_tokens_defaulted",
            Adjustment::StreamUsageRequested => "stream_usage_requested",
        }
    }
}

impl fmt::Display for Adjustment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Adjustment::DefaultModelApplied { model } => write!(f, "default model {}", model),
            Adjustment::ModelSubstituted { requested, used } => {
                write!(f, "model {} replaced by {}", requested, used)
            }
            Adjustment::SystemHoisted { count } => write!(f, "{} system message(s) hoisted", count),
            Adjustment::AssistantRenamed { count } => {
                write!(f, "{} assistant message(s) renamed", count)
            }
            Adjustment::ToolMessagesDropped { count } => {
                write!(f, "{} tool message(s) dropped", count)
            }
            Adjustment::NonTextContentDropped { count } => {
                write!(f, "{} non-text part(s) dropped", count)
            }
            Adjustment::ParametersDropped { names } => {
                write!(f, "unsupported parameters dropped: {}", names.join(", "))
            }
            Adjustment::MaxTokensDefaulted { max_tokens } => {
                write!(f, "max_tokens defaulted to {}", max_tokens)
            }
            Adjustment::StreamUsageRequested => write!(f, "stream usage requested"),
        }
    }
}

/// Log the adjustments a translation made.
pub(crate) fn log_adjustments(provider: &str, adjustments: &[Adjustment]) {
    for adjustment in adjustments {
        tracing::debug!(
            provider = %provider,
            rule = adjustment.as_str(),
            "Request adjusted: {}",
            adjustment
        );
    }
}

/// Resolve the model to send: the requested one when the provider serves it,
/// otherwise the provider default.
pub(crate) fn resolve_model(
    requested: Option<&str>,
    default_model: &str,
    serves: impl Fn(&str) -> bool,
    adjustments: &mut Vec<Adjustment>,
) -> String {
    match requested {
        Some(model) if serves(model) => model.to_string(),
        Some(model) => {
            adjustments.push(Adjustment::ModelSubstituted {
                requested: model.to_string(),
                used: default_model.to_string(),
            });
            default_model.to_string()
        }
        None => {
            adjustments.push(Adjustment::DefaultModelApplied {
                model: default_model.to_string(),
            });
            default_model.to_string()
        }
    }
}

/// Result of a chat call.
pub enum ChatReply {
    Complete(ChatCompletionResponse),
    Stream(ChunkStream),
}

impl fmt::Debug for ChatReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatReply::Complete(response) => f.debug_tuple("Complete").field(response).finish(),
            ChatReply::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Uniform contract of an external provider.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Configured name, unique among targets.
    fn name(&self) -> &str;

    fn kind(&self) -> ProviderKind;

    /// Model used when a request names none or names a foreign one.
    fn default_model(&self) -> &str;

    fn pricing_table(&self) -> &PricingTable;

    /// Whether a request naming `model` is sent upstream unchanged.
    fn serves(&self, model: &str) -> bool {
        self.pricing_table().contains_key(model)
    }

    /// Model actually used for a request naming `requested`.
    fn served_model(&self, requested: Option<&str>) -> String {
        resolve_model(requested, self.default_model(), |m| self.serves(m), &mut Vec::new())
    }

    /// Whether the provider can reach its API. Rate limiting counts as healthy.
    async fn health_check(&self) -> Result<()>;

    /// Execute a chat completion.
    async fn forward(&self, request: ChatCompletionRequest) -> Result<ChatReply>;

    async fn embeddings(&self, _request: EmbeddingRequest) -> Result<EmbeddingResponse> {
        Err(Error::Unsupported {
            provider: self.name().to_string(),
            endpoint: "/v1/embeddings".to_string(),
        })
    }

    /// Dollar cost of a call, priced at the default model, falling back to
    /// the cheapest known model.
    fn estimate_cost(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        let table = self.pricing_table();
        table
            .get(self.default_model())
            .or_else(|| cheapest_model(table).map(|(_, p)| p))
            .map(|p| p.cost(input_tokens, output_tokens))
            .unwrap_or(0.0)
    }

    /// $/1K figure used for routing: the cheapest model's average price.
    fn routing_cost_per_1k(&self) -> f64 {
        cheapest_model(self.pricing_table())
            .map(|(_, p)| p.average_per_1k())
            .unwrap_or(f64::INFINITY)
    }
}

/// Shared client for provider calls.
pub(crate) fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(FORWARD_TIMEOUT)
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| Error::Internal(format!("Failed to build HTTP client: {}", e)))
}

/// Send a provider request, turning transport failures and non-2xx answers
/// into errors that carry the provider's identity.
pub(crate) async fn send(
    provider: &str,
    request: reqwest::RequestBuilder,
) -> Result<reqwest::Response> {
    let response = request.send().await.map_err(|e| {
        let err = Error::upstream(provider, e);
        tracing::error!(provider = %provider, error = %err, "Failed to reach provider");
        err
    })?;

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    tracing::error!(
        provider = %provider,
        status = %status,
        body = %body,
        "Provider returned error"
    );
    Err(Error::ProviderStatus {
        provider: provider.to_string(),
        status: status.as_u16(),
        body,
    })
}

/// Read a successful JSON body into `T`, keeping the raw text on failure.
pub(crate) async fn read_json<T: serde::de::DeserializeOwned>(
    provider: &str,
    response: reqwest::Response,
) -> Result<T> {
    let raw = response
        .text()
        .await
        .map_err(|e| Error::upstream(provider, e))?;
    parse_json(provider, &raw)
}

pub(crate) fn parse_json<T: serde::de::DeserializeOwned>(provider: &str, raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| Error::Translation {
        provider: provider.to_string(),
        message: e.to_string(),
        raw: raw.to_string(),
    })
}

/// Interpret a liveness response: 2xx and 429 mean reachable.
pub(crate) fn health_status(provider: &str, status: reqwest::StatusCode) -> Result<()> {
    if status.is_success() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        Ok(())
    } else {
        Err(Error::ProviderStatus {
            provider: provider.to_string(),
            status: status.as_u16(),
            body: format!("health check failed with status {}", status.as_u16()),
        })
    }
}

/// Build the adapter for one configured provider.
pub fn build_adapter(config: &ExternalProviderConfig) -> Result<Arc<dyn ProviderAdapter>> {
    let adapter: Arc<dyn ProviderAdapter> = match config.kind {
        ProviderKind::OpenAi => Arc::new(OpenAiAdapter::new(config)?),
        ProviderKind::Claude => Arc::new(ClaudeAdapter::new(config)?),
        ProviderKind::Gemini => Arc::new(GeminiAdapter::new(config)?),
    };
    Ok(adapter)
}

/// Cached liveness of one provider.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub healthy: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Registered providers in configuration order, with cached health.
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn ProviderAdapter>>,
    status: DashMap<String, ProviderStatus>,
}

impl ProviderRegistry {
    pub fn new(providers: Vec<Arc<dyn ProviderAdapter>>) -> Self {
        let status = providers
            .iter()
            .map(|p| {
                (
                    p.name().to_string(),
                    ProviderStatus {
                        healthy: false,
                        last_check: None,
                        last_error: None,
                    },
                )
            })
            .collect();
        Self { providers, status }
    }

    /// Build adapters for every enabled provider.
    pub fn from_config(configs: &[ExternalProviderConfig]) -> Result<Self> {
        let mut providers = Vec::new();
        for config in configs.iter().filter(|c| c.enabled) {
            let adapter = build_adapter(config)?;
            tracing::info!(
                provider = %config.name,
                kind = %config.kind,
                default_model = %adapter.default_model(),
                "Registered external provider"
            );
            providers.push(adapter);
        }
        Ok(Self::new(providers))
    }

    pub fn all(&self) -> &[Arc<dyn ProviderAdapter>] {
        &self.providers
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.providers.iter().find(|p| p.name() == name).cloned()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Last observed health; false until the first check completes.
    pub fn is_healthy(&self, name: &str) -> bool {
        self.status.get(name).map(|s| s.healthy).unwrap_or(false)
    }

    pub fn healthy_count(&self) -> usize {
        self.status.iter().filter(|s| s.healthy).count()
    }

    pub fn status(&self, name: &str) -> Option<ProviderStatus> {
        self.status.get(name).map(|s| s.clone())
    }

    /// Administrative override of a provider's cached health.
    pub fn set_healthy(&self, name: &str, healthy: bool) -> bool {
        match self.status.get_mut(name) {
            Some(mut status) => {
                status.healthy = healthy;
                true
            }
            None => false,
        }
    }

    /// Check every provider concurrently and cache the results.
    pub async fn check_all(&self) {
        let checks = self.providers.iter().map(|provider| async move {
            let result = provider.health_check().await;
            (provider.name().to_string(), result)
        });

        for (name, result) in futures::future::join_all(checks).await {
            let Some(mut status) = self.status.get_mut(&name) else {
                continue;
            };
            let was_healthy = status.healthy;
            status.last_check = Some(Utc::now());
            match result {
                Ok(()) => {
                    status.healthy = true;
                    status.last_error = None;
                    if !was_healthy {
                        tracing::info!(provider = %name, "Provider healthy");
                    }
                }
                Err(e) => {
                    status.healthy = false;
                    status.last_error = Some(e.to_string());
                    if was_healthy {
                        tracing::warn!(provider = %name, error = %e, "Provider unhealthy");
                    } else {
                        tracing::debug!(
                            provider = %name,
                            error = %e,
                            "Provider health check failed"
                        );
                    }
                }
            }
        }
    }

    /// Poll provider health every `interval` until `cancel` fires.
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.check_all().await;
        }

        tracing::info!("Provider health monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cheapest_model_by_average() {
        let table = pricing_table(&[
            ("big", ModelPricing::new(0.03, 0.06, 8192, 8192)),
            ("small", ModelPricing::new(0.0005, 0.0015, 4096, 16385)),
            ("mid", ModelPricing::new(0.003, 0.004, 4096, 16385)),
        ]);
        let (model, pricing) = cheapest_model(&table).unwrap();
        assert_eq!(model, "small");
        assert_eq!(pricing.average_per_1k(), (0.0005 + 0.0015) / 2.0);
    }

    #[test]
    fn test_cheapest_model_tie_goes_to_first_name() {
        let table = pricing_table(&[
            ("b", ModelPricing::new(0.001, 0.001, 1, 1)),
            ("a", ModelPricing::new(0.001, 0.001, 1, 1)),
        ]);
        assert_eq!(cheapest_model(&table).unwrap().0, "a");
        assert!(cheapest_model(&PricingTable::new()).is_none());
    }

    #[test]
    fn test_pricing_cost() {
        let pricing = ModelPricing::new(0.01, 0.03, 4096, 128000);
        let cost = pricing.cost(1000, 500);
        assert!((cost - (0.01 + 0.015)).abs() < 1e-12);
    }

    #[test]
    fn test_resolve_model() {
        let mut adjustments = Vec::new();
        let serves = |m: &str| m.starts_with("claude-");

        assert_eq!(
            resolve_model(
                Some("claude-3-opus-20240229"),
                "claude-3-haiku-20240307",
                serves,
                &mut adjustments
            ),
            "claude-3-opus-20240229"
        );
        assert!(adjustments.is_empty());

        assert_eq!(
            resolve_model(Some("gpt-4"), "claude-3-haiku-20240307", serves, &mut adjustments),
            "claude-3-haiku-20240307"
        );
        assert_eq!(
            resolve_model(None, "claude-3-haiku-20240307", serves, &mut adjustments),
            "claude-3-haiku-20240307"
        );
        assert_eq!(
            adjustments,
            vec![
                Adjustment::ModelSubstituted {
                    requested: "gpt-4".to_string(),
                    used: "claude-3-haiku-20240307".to_string()
                },
                Adjustment::DefaultModelApplied {
                    model: "claude-3-haiku-20240307".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_health_status_accepts_rate_limit() {
        assert!(health_status("p", reqwest::StatusCode::OK).is_ok());
        assert!(health_status("p", reqwest::StatusCode::TOO_MANY_REQUESTS).is_ok());
        assert!(health_status("p", reqwest::StatusCode::UNAUTHORIZED).is_err());
        assert!(health_status("p", reqwest::StatusCode::SERVICE_UNAVAILABLE).is_err());
    }

    #[test]
    fn test_adjustment_display() {
        let adj = Adjustment::ParametersDropped {
            names: vec!["frequency_penalty", "presence_penalty"],
        };
        assert_eq!(adj.as_str(), "parameters_dropped");
        assert_eq!(
            adj.to_string(),
            "unsupported parameters dropped: frequency_penalty, presence_penalty"
        );
    }

    #[test]
    fn test_parse_json_keeps_raw_on_failure() {
        let err = parse_json::<serde_json::Value>("gemini", "{not json").unwrap_err();
        match err {
            Error::Translation { provider, raw, .. } => {
                assert_eq!(provider, "gemini");
                assert_eq!(raw, "{not json");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
