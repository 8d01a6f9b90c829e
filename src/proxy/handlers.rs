//! HTTP request handlers.

use axum::{
    body::Bytes,
    extract::{Extension, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;

use super::server::{AppState, RequestId};
use super::stream::sse_body;
use super::types::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, CompletionRequest,
    EmbeddingRequest, TextCompletionResponse, Usage,
};
use crate::error::{Error, Result};
use crate::forward::secrets_match;
use crate::metrics::NO_TARGET;
use crate::providers::{ChatReply, ProviderAdapter};
use crate::router::{RouteDecision, TargetKind};

/// Response header: correlation ID (UUID v4).
pub const REQUEST_ID_HEADER: &str = "x-request-id";
/// Response header: name of the target that served the request.
pub const TARGET_HEADER: &str = "x-router-target";
/// Response header: reason tag of the routing decision.
pub const REASON_HEADER: &str = "x-router-reason";

/// The inference endpoints, with their parsed bodies.
#[derive(Debug)]
enum Payload {
    Chat(ChatCompletionRequest),
    Completion(CompletionRequest),
    Embeddings(EmbeddingRequest),
}

impl Payload {
    fn model(&self) -> Option<&str> {
        match self {
            Payload::Chat(r) => r.model.as_deref(),
            Payload::Completion(r) => r.model.as_deref(),
            Payload::Embeddings(r) => r.model.as_deref(),
        }
    }

    fn is_streaming(&self) -> bool {
        match self {
            Payload::Chat(r) => r.is_streaming(),
            Payload::Completion(r) => r.stream.unwrap_or(false),
            Payload::Embeddings(_) => false,
        }
    }
}

fn parse<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| Error::BadRequest(e.to_string()))
}

/// Attach correlation and routing headers to a response.
fn attach_router_headers(
    response: &mut Response,
    request_id: &str,
    decision: Option<&RouteDecision>,
) {
    let headers = response.headers_mut();

    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }

    if let Some(decision) = decision {
        if let Ok(value) = HeaderValue::from_str(&decision.target.name) {
            headers.insert(HeaderName::from_static(TARGET_HEADER), value);
        }
        headers.insert(
            HeaderName::from_static(REASON_HEADER),
            HeaderValue::from_static(decision.reason.as_str()),
        );
    }
}

/// Handle POST /v1/chat/completions
pub async fn chat_completions(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let payload = parse::<ChatCompletionRequest>(&body).and_then(|request| {
        request.validate()?;
        Ok(Payload::Chat(request))
    });
    route(state, request_id, payload, method, uri, headers, body).await
}

/// Handle POST /v1/completions
pub async fn completions(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let payload = parse::<CompletionRequest>(&body).map(Payload::Completion);
    route(state, request_id, payload, method, uri, headers, body).await
}

/// Handle POST /v1/embeddings
pub async fn embeddings(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let payload = parse::<EmbeddingRequest>(&body).map(Payload::Embeddings);
    route(state, request_id, payload, method, uri, headers, body).await
}

/// Select a target, dispatch to it, and record the outcome.
async fn route(
    state: AppState,
    request_id: RequestId,
    payload: Result<Payload>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let start = Instant::now();
    let correlation_id = request_id.0.to_string();

    let payload = match payload {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!(path = %uri.path(), error = %e, "Rejected request");
            let mut response = e.into_response();
            state
                .metrics
                .record_request(NO_TARGET, response.status().as_u16(), start.elapsed());
            attach_router_headers(&mut response, &correlation_id, None);
            return response;
        }
    };

    tracing::info!(
        path = %uri.path(),
        model = payload.model().unwrap_or("default"),
        stream = payload.is_streaming(),
        "Received inference request"
    );

    let decision = match state.router.select_target() {
        Ok(decision) => decision,
        Err(e) => {
            let mut response = e.into_response();
            state
                .metrics
                .record_request(NO_TARGET, response.status().as_u16(), start.elapsed());
            attach_router_headers(&mut response, &correlation_id, None);
            return response;
        }
    };
    state.metrics.record_decision(&decision);

    let result = match decision.target.kind {
        TargetKind::Cluster => {
            let endpoint = decision.target.endpoint.as_deref().unwrap_or_default();
            let path = uri
                .path_and_query()
                .map(|p| p.as_str())
                .unwrap_or_else(|| uri.path());
            state
                .forwarder
                .forward(&decision.target.name, endpoint, method, path, &headers, body)
                .await
        }
        TargetKind::Provider => match state.router.providers().get(&decision.target.name) {
            Some(provider) => dispatch_to_provider(&state, provider, payload).await,
            None => Err(Error::UnknownTarget(decision.target.name.clone())),
        },
    };

    let mut response = match result {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(
                target_name = %decision.target.name,
                kind = %decision.target.kind,
                error = %e,
                "Failed to forward request"
            );
            e.into_response()
        }
    };

    state.metrics.record_request(
        &decision.target.name,
        response.status().as_u16(),
        start.elapsed(),
    );
    attach_router_headers(&mut response, &correlation_id, Some(&decision));
    response
}

/// Serve a parsed request through a provider adapter.
async fn dispatch_to_provider(
    state: &AppState,
    provider: Arc<dyn ProviderAdapter>,
    payload: Payload,
) -> Result<Response> {
    let name = provider.name().to_string();
    let model = match &payload {
        Payload::Embeddings(request) => request
            .model
            .clone()
            .unwrap_or_else(|| provider.default_model().to_string()),
        _ => provider.served_model(payload.model()),
    };

    let result = match payload {
        Payload::Chat(request) => provider
            .forward(request)
            .await
            .map(|reply| chat_response(state, &name, reply, |r| r, |chunk| chunk)),
        Payload::Completion(request) => provider
            .forward(request.into_chat())
            .await
            .map(|reply| {
                chat_response(
                    state,
                    &name,
                    reply,
                    TextCompletionResponse::from,
                    TextCompletionResponse::from,
                )
            }),
        Payload::Embeddings(request) => provider.embeddings(request).await.map(|response| {
            if let Some(usage) = response.usage {
                state
                    .metrics
                    .record_tokens(&name, Usage::new(usage.prompt_tokens, 0));
            }
            Json(response).into_response()
        }),
    };

    let status = if result.is_ok() { "success" } else { "error" };
    state.metrics.record_external(&name, &model, status);
    result
}

/// Render a chat reply. `complete` shapes a whole response and `shape` each
/// streamed chunk, so the legacy completions endpoint can reuse the chat path.
fn chat_response<C, T, G, F>(
    state: &AppState,
    provider: &str,
    reply: ChatReply,
    complete: G,
    shape: F,
) -> Response
where
    C: serde::Serialize,
    T: serde::Serialize,
    G: FnOnce(ChatCompletionResponse) -> C,
    F: Fn(ChatCompletionChunk) -> T + Send + 'static,
{
    match reply {
        ChatReply::Complete(response) => {
            if let Some(usage) = response.usage {
                state.metrics.record_tokens(provider, usage);
            }
            Json(complete(response)).into_response()
        }
        ChatReply::Stream(chunks) => {
            let metrics = state.metrics.clone();
            let provider = provider.to_string();
            let body = sse_body(chunks, shape, move |usage| {
                metrics.record_tokens(&provider, usage)
            });
            (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, "text/event-stream"),
                    (header::CACHE_CONTROL, "no-cache"),
                ],
                body,
            )
                .into_response()
        }
    }
}

/// Handle GET /health
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let router = &state.router;
    Json(serde_json::json!({
        "status": "healthy",
        "healthy_clusters": router.health().healthy_snapshot().len(),
        "total_clusters": router.health().len(),
        "healthy_providers": router.providers().healthy_count(),
        "total_providers": router.providers().len(),
        "timestamp": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
    }))
}

/// Handle GET /metrics
pub async fn metrics(State(state): State<AppState>) -> Result<Response> {
    let text = state.metrics.render()?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        text,
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
struct AuthRequest {
    password: String,
}

/// Handle POST /api/auth (demo mode only)
pub async fn auth(State(state): State<AppState>, body: Bytes) -> Result<Response> {
    let request: AuthRequest = parse(&body)?;
    let expected = state
        .config
        .demo
        .password
        .as_ref()
        .ok_or(Error::Auth)?;

    if !secrets_match(
        request.password.as_bytes(),
        expected.expose_secret().as_bytes(),
    ) {
        tracing::warn!("Demo login rejected");
        return Err(Error::Auth);
    }

    Ok(Json(serde_json::json!({
        "success": true,
        "token": uuid::Uuid::new_v4().to_string(),
    }))
    .into_response())
}
