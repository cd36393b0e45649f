//! HTTP surface and process wiring: builds the pipeline from config, mounts
//! the webhook and health routes, and owns graceful shutdown.

use crate::agent::Agent;
use crate::buffer::MessageBuffer;
use crate::config::AnaConfig;
use crate::escalation::BrokerNotifier;
use crate::intent::IntentCache;
use crate::llm_backends::{LlmClassifier, LlmResponder};
use crate::memory::SessionMemory;
use crate::persistence::SqliteExchangeStore;
use crate::webhook;
use ana_channels::{EvolutionAdapter, OutboundMessage, Transport};
use ana_llm::OpenAiClient;
use anyhow::Result;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

const MAX_IN_FLIGHT_REQUESTS: usize = 64;

struct AppState {
    buffer: Arc<MessageBuffer>,
    started_at: Instant,
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = AnaConfig::load(config_path).await?;
    if cfg.llm.api_key.trim().is_empty() {
        tracing::warn!("llm.api_key is empty; classification and responses will fail");
    }
    match EvolutionAdapter::new(
        &cfg.evolution.api_url,
        &cfg.evolution.api_key,
        &cfg.evolution.instance,
    ) {
        Ok(_) => tracing::info!(instance = %cfg.evolution.instance, "evolution transport ok"),
        Err(e) => tracing::warn!(error = %e, "evolution transport not configured"),
    }
    if cfg.escalation.human_address.trim().is_empty() {
        tracing::warn!("escalation.human_address is empty; handoffs will not reach a broker");
    }
    tracing::info!(
        bind_addr = %cfg.server.bind_addr,
        debounce_seconds = cfg.buffer.debounce_seconds,
        intent_cache_ttl_seconds = cfg.intent.cache_ttl_seconds,
        model = %cfg.llm.model,
        database_path = %cfg.storage.database_path,
        "config ok"
    );
    Ok(())
}

pub async fn send_one_shot(
    config_path: Option<PathBuf>,
    recipient: &str,
    message: &str,
) -> Result<()> {
    let cfg = AnaConfig::load(config_path).await?;
    let transport = EvolutionAdapter::new(
        &cfg.evolution.api_url,
        &cfg.evolution.api_key,
        &cfg.evolution.instance,
    )?;
    transport
        .send(recipient, OutboundMessage::text(message))
        .await?;
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = AnaConfig::load(config_path).await?;
    let started_at = Instant::now();
    let addr: SocketAddr = cfg.server.bind_addr.parse()?;
    tracing::info!(
        bind_addr = %addr,
        debounce_seconds = cfg.buffer.debounce_seconds,
        ttl_margin_seconds = cfg.buffer.ttl_margin_seconds,
        intent_cache_ttl_seconds = cfg.intent.cache_ttl_seconds,
        session_history_max = cfg.session.history_max,
        escalation_triggers = cfg.escalation.triggers.len(),
        model = %cfg.llm.model,
        database_path = %cfg.storage.database_path,
        "server configuration loaded"
    );
    let listener = preflight_bind_listener(addr).await?;

    let buffer = build_pipeline(&cfg)?;
    let state = Arc::new(AppState {
        buffer: buffer.clone(),
        started_at,
    });

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    let app = Router::new()
        .route("/webhook", post(handle_webhook))
        .route("/health", get(handle_health))
        .layer(Extension(state))
        .layer(GlobalConcurrencyLimitLayer::new(MAX_IN_FLIGHT_REQUESTS))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(30),
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    let shutdown = CancellationToken::new();
    tracing::info!(%addr, "ana-agent serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    tracing::info!("http server shutdown completed");

    shutdown.cancel();
    buffer.shutdown();
    Ok(())
}

/// Builds the full pipeline behind the webhook: transport, LLM collaborators,
/// stores, the agent, and the debounce buffer that feeds it.
fn build_pipeline(cfg: &AnaConfig) -> Result<Arc<MessageBuffer>> {
    let transport: Arc<dyn Transport> = Arc::new(EvolutionAdapter::new(
        &cfg.evolution.api_url,
        &cfg.evolution.api_key,
        &cfg.evolution.instance,
    )?);

    let llm = OpenAiClient::new(&cfg.llm.api_key, &cfg.llm.model)?;
    let classifier = Arc::new(LlmClassifier::new(llm.clone()));
    let responder = Arc::new(LlmResponder::new(llm));
    let notifier = Arc::new(BrokerNotifier::new(
        transport.clone(),
        cfg.escalation.human_address.clone(),
    ));

    let db_path = Path::new(&cfg.storage.database_path);
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = Arc::new(SqliteExchangeStore::open(db_path)?);

    let intents = Arc::new(IntentCache::new(cfg.intent_cache_ttl()));
    let memory = Arc::new(SessionMemory::new(
        &cfg.branches.as_map(),
        cfg.session_history_ttl(),
        cfg.session.history_max,
    ));

    let agent = Arc::new(Agent::new(
        classifier,
        responder,
        notifier,
        transport,
        store,
        intents,
        memory,
        cfg.escalation.triggers.clone(),
    ));

    Ok(Arc::new(MessageBuffer::new(
        cfg.debounce_window(),
        cfg.burst_ttl_margin(),
        agent,
    )))
}

/// Webhook ingress. Always answers 200: the provider treats anything else as
/// a delivery failure and re-posts, which would double-enqueue fragments.
async fn handle_webhook(
    Extension(state): Extension<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> StatusCode {
    match webhook::normalize(&body) {
        Some(inbound) => {
            let receipt = state.buffer.enqueue(inbound);
            tracing::debug!(
                burst_len = receipt.burst_len,
                message_id = %receipt.last_message_id,
                "webhook fragment buffered"
            );
        }
        None => {
            tracing::debug!(
                event = ?body.get("event").and_then(serde_json::Value::as_str),
                "webhook payload ignored"
            );
        }
    }
    StatusCode::OK
}

async fn handle_health(
    Extension(state): Extension<Arc<AppState>>,
) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tracing::info!(%addr, "preflight bind check starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; beginning graceful shutdown");
        }
    }
    shutdown.cancel();
}
