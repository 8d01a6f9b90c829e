//! HTTP server setup and lifecycle.

use axum::{
    extract::Request,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use super::handlers;
use crate::config::{AuthType, Config};
use crate::cost::CostEngine;
use crate::forward::Forwarder;
use crate::health::HealthMonitor;
use crate::metrics::Metrics;
use crate::providers::ProviderRegistry;
use crate::router::Router as TargetRouter;

/// Upper bound on draining in-flight requests after a shutdown signal.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Correlation id of one inbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestId(pub Uuid);

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<TargetRouter>,
    pub forwarder: Arc<Forwarder>,
    pub metrics: Arc<Metrics>,
    pub config: Arc<Config>,
}

impl AppState {
    /// Build every component from configuration.
    ///
    /// Fails on unreadable TLS material or a provider that cannot be built.
    pub async fn from_config(config: Config) -> crate::error::Result<Self> {
        let costs = Arc::new(CostEngine::new(config.router.overhead_factor));
        let health = Arc::new(HealthMonitor::new(config.router.health_check_interval()));
        let providers = Arc::new(ProviderRegistry::from_config(&config.external_providers)?);
        let router = TargetRouter::new(&config.router, health, costs, providers);
        router.register_clusters(&config.clusters);

        let forwarder = Forwarder::new()?;
        for cluster in &config.clusters {
            match cluster.auth_type {
                Some(AuthType::Hmac) => {
                    if let Some(secret) = &cluster.shared_secret {
                        forwarder.set_hmac(&cluster.name, secret.clone());
                    }
                }
                Some(AuthType::Mtls) => {
                    if let (Some(cert), Some(key)) = (&cluster.cert_file, &cluster.key_file) {
                        forwarder
                            .set_mtls(
                                &cluster.name,
                                &cluster.endpoint,
                                cert,
                                key,
                                cluster.ca_file.as_deref(),
                            )
                            .await?;
                    }
                }
                None => {}
            }
            tracing::info!(
                cluster = %cluster.name,
                endpoint = %cluster.endpoint,
                auth = cluster.auth_type.map(|a| a.as_str()).unwrap_or("none"),
                cost_per_hour = cluster.cost_per_hour,
                "Registered cluster"
            );
        }

        Ok(Self {
            router: Arc::new(router),
            forwarder: Arc::new(forwarder),
            metrics: Arc::new(Metrics::new()?),
            config: Arc::new(config),
        })
    }
}

/// Reuse a caller-supplied UUID `x-request-id`, otherwise mint one.
async fn assign_request_id(mut request: Request, next: Next) -> Response {
    let id = request
        .headers()
        .get(handlers::REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v).ok())
        .unwrap_or_else(Uuid::new_v4);
    request.extensions_mut().insert(RequestId(id));
    next.run(request).await
}

/// Create the axum router with all endpoints.
pub fn create_router(state: AppState) -> Router {
    let write_timeout = state.config.server.write_timeout();
    let demo = state.config.demo.enabled;

    let mut app = Router::new()
        // OpenAI-compatible endpoints
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/completions", post(handlers::completions))
        .route("/v1/embeddings", post(handlers::embeddings))
        // Operational endpoints
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics));

    if demo {
        app = app.route("/api/auth", post(handlers::auth));
    }

    app.with_state(state)
        .layer(middleware::from_fn(assign_request_id))
        .layer(TimeoutLayer::new(write_timeout))
        .layer(TraceLayer::new_for_http())
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Run the HTTP server and background loops until a shutdown signal.
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let listen_addr = config.server.listen_addr();
    let health_interval = config.router.health_check_interval();
    let metrics_interval = config.router.metrics_update_interval();
    let clusters = config.clusters.clone();

    let state = AppState::from_config(config).await?;

    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();
    tracker.spawn(state.router.health().clone().run(cancel.child_token()));
    tracker.spawn(
        state
            .router
            .providers()
            .clone()
            .run(health_interval, cancel.child_token()),
    );
    tracker.spawn(state.metrics.clone().run(
        state.router.clone(),
        clusters,
        metrics_interval,
        cancel.child_token(),
    ));
    tracker.close();

    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!(address = %listen_addr, "Starting llm-router");

    let server_cancel = cancel.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
    });

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received, draining in-flight requests");
            cancel.cancel();
        }
        result = &mut server => {
            cancel.cancel();
            tracker.wait().await;
            return Ok(result??);
        }
    }

    match tokio::time::timeout(DRAIN_TIMEOUT, &mut server).await {
        Ok(result) => result??,
        Err(_) => {
            tracing::warn!(
                timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "Drain timed out, dropping remaining connections"
            );
            server.abort();
        }
    }

    tracker.wait().await;
    tracing::info!("Shutdown complete");
    Ok(())
}
