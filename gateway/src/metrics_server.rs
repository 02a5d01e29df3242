//! HTTP status surface: Prometheus metrics, health checks and pipeline introspection
//!
//! Runs on its own port, separate from the subscriber endpoint.
//!
//! # Endpoints
//!
//! - `GET /metrics` - Prometheus text format (optionally token-protected)
//! - `GET /health` - structured health summary
//! - `GET /livez` - liveness check
//! - `GET /readyz` - readiness check, 503 until the pipeline is running
//! - `GET /api/status` - connections, per-species alert state, counters
//! - `GET /api/streams` - last 100 readings
//! - `POST /api/advise` - remediation actions for a list of alerts
//!
//! `/api/*` sits behind the shared-secret gate and, when configured, a
//! per-client rate limit answering 429 with `Retry-After: 1`. Every response
//! carries an `X-Request-ID` (the client's, or a fresh one) and the standard
//! security headers.
//!
//! # Example
//!
//! ```ignore
//! let state = StatusState::new(instance_id, hub, metrics, recent, board, permit);
//! let handle = StatusServer::new(state, api_gate).start(addr, shutdown);
//! ```

use crate::auth::{AuthGate, require_auth};
use crate::error::Result;
use crate::hub::{BroadcastHub, ConnectionStatus};
use crate::metrics::{MetricsRecorder, MetricsSnapshot};
use crate::pipeline::{SpeciesStatus, StatusBoard};
use crate::rate_limit::KeyedRateLimiter;
use crate::recent::RecentReadings;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router, middleware};
use outfall_core::{Permit, Reading, Severity};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

/// Readings returned by `/api/streams`
pub const STREAM_TAIL: usize = 100;

const CONTENT_SECURITY_POLICY: &str =
    "default-src 'self'; img-src 'self' data:; script-src 'self'; style-src 'self' 'unsafe-inline'";
const STRICT_TRANSPORT_SECURITY: &str = "max-age=31536000; includeSubDomains";

/// Shared readiness flag flipped by the runtime
#[derive(Debug, Clone, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    pub fn set_ready(&self, ready: bool) {
        self.0.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything the status handlers read
#[derive(Clone)]
pub struct StatusState {
    instance_id: Arc<str>,
    hub: Arc<BroadcastHub>,
    metrics: Arc<MetricsRecorder>,
    recent: Arc<RecentReadings>,
    board: Arc<StatusBoard>,
    permit: Arc<Permit>,
    readiness: Readiness,
    started: Instant,
}

impl StatusState {
    pub fn new(
        instance_id: &str,
        hub: Arc<BroadcastHub>,
        metrics: Arc<MetricsRecorder>,
        recent: Arc<RecentReadings>,
        board: Arc<StatusBoard>,
        permit: Arc<Permit>,
    ) -> Self {
        Self {
            instance_id: Arc::from(instance_id),
            hub,
            metrics,
            recent,
            board,
            permit,
            readiness: Readiness::default(),
            started: Instant::now(),
        }
    }

    pub fn readiness(&self) -> Readiness {
        self.readiness.clone()
    }
}

/// Status HTTP server
pub struct StatusServer {
    state: StatusState,
    api_gate: AuthGate,
    metrics_gate: Option<AuthGate>,
    api_limit: Option<Arc<KeyedRateLimiter>>,
}

impl StatusServer {
    pub fn new(state: StatusState, api_gate: AuthGate) -> Self {
        Self {
            state,
            api_gate,
            metrics_gate: None,
            api_limit: None,
        }
    }

    /// Limit each client to `per_sec` requests per second per `/api/*` path
    ///
    /// 0 leaves the API unlimited.
    pub fn api_rate_limit(mut self, per_sec: u32) -> Self {
        self.api_limit = (per_sec > 0).then(|| Arc::new(KeyedRateLimiter::per_second(per_sec)));
        self
    }

    /// Require a token on `/metrics`
    pub fn protect_metrics(mut self, gate: AuthGate) -> Self {
        self.metrics_gate = Some(gate);
        self
    }

    pub fn router(self) -> Router {
        let mut api = Router::new()
            .route("/api/status", get(status_handler))
            .route("/api/streams", get(streams_handler))
            .route("/api/advise", post(advise_handler));
        if let Some(limiter) = self.api_limit {
            let limit = ApiLimit {
                limiter,
                metrics: Arc::clone(&self.state.metrics),
            };
            api = api.route_layer(middleware::from_fn_with_state(limit, limit_api));
        }
        // Added last so authentication runs before the rate limit
        let api = api.route_layer(middleware::from_fn_with_state(self.api_gate, require_auth));

        let mut metrics = Router::new().route("/metrics", get(metrics_handler));
        if let Some(gate) = self.metrics_gate {
            metrics = metrics.route_layer(middleware::from_fn_with_state(gate, require_auth));
        }

        Router::new()
            .route("/health", get(health_handler))
            .route("/livez", get(livez_handler))
            .route("/readyz", get(readyz_handler))
            .merge(api)
            .merge(metrics)
            .with_state(self.state)
            .layer(security_header(header::X_CONTENT_TYPE_OPTIONS, "nosniff"))
            .layer(security_header(header::X_FRAME_OPTIONS, "DENY"))
            .layer(security_header(header::REFERRER_POLICY, "no-referrer"))
            .layer(security_header(
                header::STRICT_TRANSPORT_SECURITY,
                STRICT_TRANSPORT_SECURITY,
            ))
            .layer(security_header(
                header::CONTENT_SECURITY_POLICY,
                CONTENT_SECURITY_POLICY,
            ))
            .layer(TraceLayer::new_for_http())
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
    }

    /// Serve on a bound listener until `shutdown` resolves
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        info!(addr = %addr, "Status server listening");
        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }

    /// Bind and serve in a background task
    ///
    /// Returns a JoinHandle that can be used to abort the server.
    pub fn start<F>(self, addr: SocketAddr, shutdown: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(async move {
            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(e) => {
                    error!(error = %e, addr = %addr, "Failed to bind status server");
                    return;
                }
            };
            if let Err(e) = self.serve(listener, shutdown).await {
                error!(error = %e, "Status server error");
            }
        })
    }
}

/// Response header set unless the handler already chose one
fn security_header(
    name: header::HeaderName,
    value: &'static str,
) -> SetResponseHeaderLayer<HeaderValue> {
    SetResponseHeaderLayer::if_not_present(name, HeaderValue::from_static(value))
}

#[derive(Clone)]
struct ApiLimit {
    limiter: Arc<KeyedRateLimiter>,
    metrics: Arc<MetricsRecorder>,
}

/// Per client and path; clients without a peer address share one bucket
async fn limit_api(State(limit): State<ApiLimit>, request: Request, next: Next) -> Response {
    let client = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let key = format!("{client} {}", request.uri().path());
    if !limit.limiter.check(&key) {
        limit.metrics.http_rate_limited.inc();
        debug!(client = %client, path = request.uri().path(), "API rate limit exceeded");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, "1")],
            Json(serde_json::json!({"detail": "too many requests"})),
        )
            .into_response();
    }
    next.run(request).await
}

/// Handler for /metrics endpoint
async fn metrics_handler(State(state): State<StatusState>) -> Response {
    state
        .metrics
        .recent_buffer_len
        .set(state.recent.len() as i64);
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Serialize)]
struct BufferHealth {
    size: usize,
    capacity: usize,
    fill_ratio: f64,
}

impl BufferHealth {
    fn of(recent: &RecentReadings) -> Self {
        let size = recent.len();
        let capacity = recent.capacity();
        Self {
            size,
            capacity,
            fill_ratio: size as f64 / capacity as f64,
        }
    }
}

/// Structured health summary
#[derive(Serialize)]
struct HealthSummary {
    status: &'static str,
    instance_id: String,
    ready: bool,
    connections: usize,
    species_tracked: usize,
    species_critical: Vec<String>,
    buffer: BufferHealth,
}

/// Handler for /health endpoint
///
/// The service stays healthy while critical alerts are active; they are
/// reported, not treated as a failure.
async fn health_handler(State(state): State<StatusState>) -> impl IntoResponse {
    let species = state.board.snapshot();
    let species_critical = species
        .iter()
        .filter(|s| s.severity == Severity::Critical)
        .map(|s| s.species.clone())
        .collect();

    Json(HealthSummary {
        status: "healthy",
        instance_id: state.instance_id.to_string(),
        ready: state.readiness.is_ready(),
        connections: state.hub.connection_count(),
        species_tracked: species.len(),
        species_critical,
        buffer: BufferHealth::of(&state.recent),
    })
}

async fn livez_handler(State(state): State<StatusState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "live",
        "uptime_seconds": state.started.elapsed().as_secs_f64(),
    }))
}

async fn readyz_handler(State(state): State<StatusState>) -> Response {
    if state.readiness.is_ready() {
        Json(serde_json::json!({
            "status": "ready",
            "buffer_size": state.recent.len(),
        }))
        .into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"status": "starting"})),
        )
            .into_response()
    }
}

#[derive(Serialize)]
struct StatusReport {
    status: &'static str,
    instance_id: String,
    uptime_seconds: f64,
    buffer: BufferHealth,
    active_connections: usize,
    connections: Vec<ConnectionStatus>,
    species: Vec<SpeciesStatus>,
    counters: MetricsSnapshot,
}

async fn status_handler(State(state): State<StatusState>) -> impl IntoResponse {
    Json(StatusReport {
        status: "operational",
        instance_id: state.instance_id.to_string(),
        uptime_seconds: state.started.elapsed().as_secs_f64(),
        buffer: BufferHealth::of(&state.recent),
        active_connections: state.hub.connection_count(),
        connections: state.hub.snapshot(),
        species: state.board.snapshot(),
        counters: state.metrics.snapshot(),
    })
}

#[derive(Serialize)]
struct StreamTail {
    count: usize,
    data: Vec<Reading>,
}

async fn streams_handler(State(state): State<StatusState>) -> impl IntoResponse {
    Json(StreamTail {
        count: state.recent.len(),
        data: state.recent.latest(STREAM_TAIL),
    })
}

#[derive(Deserialize)]
struct AdviseRequest {
    #[serde(default)]
    alerts: Vec<AdviseAlert>,
}

#[derive(Deserialize)]
struct AdviseAlert {
    #[serde(default)]
    species: String,
    #[serde(default, alias = "level")]
    severity: Option<Severity>,
}

#[derive(Serialize)]
struct Recommendation {
    species: String,
    action: String,
}

#[derive(Serialize)]
struct AdviseResponse {
    alert_count: usize,
    actions: Vec<String>,
    recommendations: Vec<Recommendation>,
}

/// Remediation text for one species, from the permit when it has one
fn remediation(permit: &Permit, species: &str) -> String {
    match permit.get(species).and_then(|rule| rule.action.clone()) {
        Some(action) => action,
        None if species.is_empty() => "Increase treatment intensity".to_string(),
        None => format!("Review {species} treatment process and verify setpoints"),
    }
}

async fn advise_handler(
    State(state): State<StatusState>,
    Json(request): Json<AdviseRequest>,
) -> impl IntoResponse {
    let mut actions = Vec::with_capacity(request.alerts.len());
    let mut recommendations = Vec::with_capacity(request.alerts.len());
    for alert in &request.alerts {
        let level = alert.severity.unwrap_or(Severity::Watch);
        let action = format!(
            "[{}] {}: {}",
            level.as_str().to_ascii_uppercase(),
            alert.species,
            remediation(&state.permit, &alert.species)
        );
        recommendations.push(Recommendation {
            species: alert.species.clone(),
            action: action.clone(),
        });
        actions.push(action);
    }

    Json(AdviseResponse {
        alert_count: request.alerts.len(),
        actions,
        recommendations,
    })
}
