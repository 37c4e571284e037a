//! Core library for the chat relay.  This module wires the intake pipeline to
//! its collaborators and exposes the HTTP handlers.

pub mod audit;
pub mod config;
pub mod downstream;
pub mod error;
pub mod intake;

pub use config::AppConfig;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use axum::body::Bytes;
use axum::extract::rejection::{BytesRejection, FailedToBufferBody};
use axum::extract::{ConnectInfo, DefaultBodyLimit, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::audit::AuditLog;
use crate::downstream::{
    ConversationStore, ModelClient, Notifier, OpenAiModel, RestStore, TelegramNotifier,
};
use crate::error::ErrorBody;
use crate::intake::{Completion, InboundRequest, Reply};

pub use crate::intake::{Collaborators, IntakePipeline};

/// Header carrying the caller's session identifier.
pub const SESSION_HEADER: &str = "x-session-id";
const FORWARDED_FOR: &str = "x-forwarded-for";

/// Latency histogram bucket upper bounds in ms.  The model call dominates,
/// hence the long tail.
const LATENCY_BUCKETS_MS: &[u64] = &[10, 50, 100, 250, 500, 1000, 2500, 5000, 10000, 30000];

#[derive(Debug, Serialize)]
pub struct SendMessageResponse {
    pub ok: bool,
    pub response: String,
    pub session_id: String,
    pub conversation_id: String,
}

impl From<Reply> for SendMessageResponse {
    fn from(reply: Reply) -> Self {
        Self {
            ok: true,
            response: reply.response,
            session_id: reply.session_id,
            conversation_id: reply.conversation_id,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub ok: bool,
    pub status: &'static str,
    pub model_configured: bool,
}

/// State shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<IntakePipeline>,
    /// Maximum accepted raw request body size in bytes.
    pub max_request_bytes: usize,
    /// `None` allows any origin.
    pub allowed_origins: Option<Vec<String>>,
    pub hist_counts: Arc<Vec<AtomicU64>>,
    pub hist_sum_ms: Arc<AtomicU64>,
    pub hist_count: Arc<AtomicU64>,
    pub process_start_instant: Instant,
}

impl AppState {
    fn observe_latency(&self, elapsed: Duration) {
        let ms = elapsed.as_millis() as u64;
        if let Some(idx) = LATENCY_BUCKETS_MS.iter().position(|ub| ms <= *ub) {
            self.hist_counts[idx].fetch_add(1, Ordering::Relaxed);
        }
        self.hist_sum_ms.fetch_add(ms, Ordering::Relaxed);
        self.hist_count.fetch_add(1, Ordering::Relaxed);
    }
}

/// Assemble state from already-built collaborators.  Tests use this to
/// inject stubs.
pub fn build_state(config: &AppConfig, audit: AuditLog, collaborators: Collaborators) -> AppState {
    AppState {
        pipeline: Arc::new(IntakePipeline::new(config, audit, collaborators)),
        max_request_bytes: config.max_request_bytes,
        allowed_origins: config.allowed_origins.clone(),
        hist_counts: Arc::new(LATENCY_BUCKETS_MS.iter().map(|_| AtomicU64::new(0)).collect()),
        hist_sum_ms: Arc::new(AtomicU64::new(0)),
        hist_count: Arc::new(AtomicU64::new(0)),
        process_start_instant: Instant::now(),
    }
}

/// Build the real HTTP collaborators for whatever the configuration enables.
/// Missing model credentials are not fatal; requests then fail with a
/// configuration error while `/health` reports `modelConfigured: false`.
pub fn collaborators_from_config(config: &AppConfig) -> Result<Collaborators> {
    let model: Option<Arc<dyn ModelClient>> = if config.model.is_configured() {
        Some(Arc::new(OpenAiModel::new(&config.model)?))
    } else {
        tracing::warn!("Model client disabled: OPENAI_API_KEY or VECTOR_STORE_IDS not set");
        None
    };
    let store: Option<Arc<dyn ConversationStore>> = match config.store.as_ref() {
        Some(cfg) => Some(Arc::new(RestStore::new(cfg)?)),
        None => {
            tracing::info!("Conversation persistence disabled");
            None
        }
    };
    let notifier: Option<Arc<dyn Notifier>> = match config.notify.as_ref() {
        Some(cfg) => Some(Arc::new(TelegramNotifier::new(cfg)?)),
        None => {
            tracing::info!("Notifications disabled");
            None
        }
    };
    Ok(Collaborators {
        model,
        store,
        notifier,
    })
}

pub fn build_state_from_config(config: &AppConfig) -> Result<AppState> {
    let collaborators = collaborators_from_config(config)?;
    let audit = AuditLog::open(&config.logging);
    Ok(build_state(config, audit, collaborators))
}

/// Build state from environment variables; see `AppConfig::from_env`.
pub fn build_state_from_env() -> Result<AppState> {
    let config = AppConfig::from_env()?;
    build_state_from_config(&config)
}

/// Build the Axum router and attach handlers and middleware.
pub fn app(state: AppState) -> Router {
    let cors = cors_layer(state.allowed_origins.as_deref());

    Router::new()
        .route("/health", get(health_handler))
        .route("/sendMessage", post(send_message_handler))
        .route("/metrics", get(metrics_handler))
        .layer(DefaultBodyLimit::max(state.max_request_bytes))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::custom(panic_response))
        .with_state(state)
}

fn cors_layer(allowed_origins: Option<&[String]>) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, HeaderName::from_static(SESSION_HEADER)]);
    match allowed_origins {
        Some(origins) => {
            let parsed: Vec<HeaderValue> = origins
                .iter()
                .filter_map(|origin| match HeaderValue::from_str(origin) {
                    Ok(value) => Some(value),
                    Err(_) => {
                        tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                        None
                    }
                })
                .collect();
            base.allow_origin(AllowOrigin::list(parsed))
        }
        None => {
            tracing::warn!("CORS_ALLOWED_ORIGINS not set; accepting requests from any origin");
            base.allow_origin(AllowOrigin::any())
        }
    }
}

fn panic_response(panic: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    tracing::error!(panic = %detail, "handler panicked");
    (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorBody::internal())).into_response()
}

/// First `X-Forwarded-For` hop, then the socket peer.
fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get(FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

fn header_str(headers: &HeaderMap, name: impl header::AsHeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

async fn send_message_handler(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let started = Instant::now();
    let client_ip = client_ip(&headers, peer.map(|ConnectInfo(addr)| addr));
    let session_header = header_str(&headers, SESSION_HEADER);
    let limit = state.max_request_bytes;

    let declared = header_str(&headers, header::CONTENT_LENGTH).and_then(|v| v.parse::<u64>().ok());
    let body = match (declared, body) {
        (Some(observed), _) if observed > limit as u64 => {
            return state
                .pipeline
                .reject_oversized_body(&client_ip, session_header.as_deref(), Some(observed), limit)
                .into_response();
        }
        (_, Ok(body)) => body,
        (_, Err(BytesRejection::FailedToBufferBody(FailedToBufferBody::LengthLimitError(_)))) => {
            return state
                .pipeline
                .reject_oversized_body(&client_ip, session_header.as_deref(), declared, limit)
                .into_response();
        }
        (_, Err(other)) => {
            return state
                .pipeline
                .reject_unreadable_body(&client_ip, session_header.as_deref(), &other)
                .into_response();
        }
    };

    let inbound = InboundRequest {
        client_ip,
        session_header,
        content_type: header_str(&headers, header::CONTENT_TYPE),
        body,
    };
    let response = match state.pipeline.handle(inbound).await {
        // Dropping the handle detaches the side effects from the response.
        Ok(Completion { reply, .. }) => {
            (StatusCode::OK, Json(SendMessageResponse::from(reply))).into_response()
        }
        Err(err) => err.into_response(),
    };
    state.observe_latency(started.elapsed());
    response
}

/// Readiness / liveness probe.
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        status: "healthy",
        model_configured: state.pipeline.model_configured(),
    })
}

/// Prometheus-style metrics exposition.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    use std::fmt::Write as _;

    let pipeline = &state.pipeline;
    let m = pipeline.metrics();
    let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
    let mut buf = String::new();

    let families: [(&str, &str, &str, String); 9] = [
        ("chatrelay_requests_total", "counter", "Total /sendMessage requests received", load(&m.requests_total).to_string()),
        ("chatrelay_rejected_total", "counter", "Requests rejected by validation or size limit", load(&m.rejected_total).to_string()),
        ("chatrelay_completed_total", "counter", "Requests answered by the model", load(&m.completed_total).to_string()),
        ("chatrelay_downstream_failures_total", "counter", "Model call failures, timeouts and configuration errors", load(&m.downstream_failures_total).to_string()),
        ("chatrelay_side_effect_errors_total", "counter", "Persistence or notification failures", load(&m.side_effect_errors_total).to_string()),
        ("chatrelay_security_events_total", "counter", "Security events recorded", pipeline.audit().events_total().to_string()),
        ("chatrelay_audit_write_errors_total", "counter", "Security log write failures", pipeline.audit().write_errors_total().to_string()),
        ("chatrelay_rate_tracked_clients", "gauge", "Clients currently held by the rate tracker", pipeline.rates().tracked_clients().to_string()),
        ("chatrelay_process_uptime_seconds", "gauge", "Seconds since the process started", format!("{:.3}", state.process_start_instant.elapsed().as_secs_f64())),
    ];
    for (name, kind, help, value) in families.iter() {
        writeln!(&mut buf, "# HELP {} {}", name, help).ok();
        writeln!(&mut buf, "# TYPE {} {}", name, kind).ok();
        writeln!(&mut buf, "{} {}", name, value).ok();
    }

    writeln!(
        &mut buf,
        "# HELP chatrelay_request_latency_ms /sendMessage latency histogram milliseconds"
    )
    .ok();
    writeln!(&mut buf, "# TYPE chatrelay_request_latency_ms histogram").ok();
    let mut cumulative: u64 = 0;
    for (i, ub) in LATENCY_BUCKETS_MS.iter().enumerate() {
        cumulative += load(&state.hist_counts[i]);
        writeln!(
            &mut buf,
            "chatrelay_request_latency_ms_bucket{{le=\"{}\"}} {}",
            ub, cumulative
        )
        .ok();
    }
    let count = load(&state.hist_count);
    writeln!(&mut buf, "chatrelay_request_latency_ms_bucket{{le=\"+Inf\"}} {}", count).ok();
    writeln!(&mut buf, "chatrelay_request_latency_ms_sum {}", load(&state.hist_sum_ms)).ok();
    writeln!(&mut buf, "chatrelay_request_latency_ms_count {}", count).ok();

    writeln!(
        &mut buf,
        "# HELP chatrelay_build_info Build information\n# TYPE chatrelay_build_info gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "chatrelay_build_info{{version=\"{}\"}} 1",
        env!("CARGO_PKG_VERSION")
    )
    .ok();

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        buf,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ip_prefers_first_forwarded_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(FORWARDED_FOR, HeaderValue::from_static(" 203.0.113.7 , 10.0.0.1"));
        let peer: SocketAddr = ([127, 0, 0, 1], 4000).into();
        assert_eq!(client_ip(&headers, Some(peer)), "203.0.113.7");
    }

    #[test]
    fn client_ip_falls_back_to_peer_then_unknown() {
        let mut headers = HeaderMap::new();
        let peer: SocketAddr = ([192, 168, 1, 9], 4000).into();
        assert_eq!(client_ip(&headers, Some(peer)), "192.168.1.9");
        headers.insert(FORWARDED_FOR, HeaderValue::from_static("   "));
        assert_eq!(client_ip(&headers, None), "unknown");
    }

    #[test]
    fn latency_lands_in_first_fitting_bucket() {
        let state = build_state(
            &AppConfig::default(),
            AuditLog::new(None, chrono::FixedOffset::east_opt(0).unwrap()),
            Collaborators::default(),
        );
        state.observe_latency(Duration::from_millis(7));
        state.observe_latency(Duration::from_millis(300));
        state.observe_latency(Duration::from_secs(60));
        assert_eq!(state.hist_counts[0].load(Ordering::Relaxed), 1);
        assert_eq!(state.hist_counts[4].load(Ordering::Relaxed), 1);
        assert_eq!(state.hist_count.load(Ordering::Relaxed), 3);
    }
}
