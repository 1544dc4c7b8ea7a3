// HTTP surface for the admission daemon
//
// Everything except /health and /metrics sits behind the admission layer,
// including the /rate-limits query routes.

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::Config;
use crate::metrics;
use crate::rate_limit::{
    spawn_sweeper, AdmissionManager, AdmissionState, Caller, ExpensiveCall, HeaderResolver,
    StatsReporter,
};

/// Role allowed to read the aggregate view
pub const ADMIN_ROLE: &str = "admin";

/// Assemble the full application router
///
/// `protected` holds the application's own handlers; they and the query
/// routes are wrapped by `admission`.
pub fn build_router(
    protected: Router,
    admission: AdmissionState,
    stats: StatsReporter,
    metrics_enabled: bool,
) -> Router {
    let guarded = admission.wrap(protected.merge(query_routes(stats)));

    let mut app = Router::new().route("/health", get(health_handler));
    if metrics_enabled {
        app = app.route("/metrics", get(metrics_handler));
    }

    app.merge(guarded)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}

/// `/rate-limits` routes: public, self-service and privileged views
pub fn query_routes(stats: StatsReporter) -> Router {
    Router::new()
        .route("/rate-limits", get(public_limits_handler))
        .route("/rate-limits/me", get(self_service_handler))
        .route("/rate-limits/admin", get(aggregate_handler))
        .with_state(stats)
}

/// Stand-in application used by `admissiond serve`
pub fn demo_routes() -> Router {
    Router::new()
        .route("/reports", post(report_handler))
        .fallback(echo_handler)
}

/// Run the daemon until Ctrl-C
pub async fn serve(config: Config) -> Result<()> {
    metrics::init().context("Failed to initialize metrics")?;

    let addr = config.bind_addr()?;
    let manager = AdmissionManager::new(config.admission.clone());
    let stats = StatsReporter::new(manager.clone(), config.admission.stats_snapshot_ttl());
    let admission = AdmissionState::new(manager.clone())
        .with_resolver(Arc::new(HeaderResolver {
            default_role: config.server.default_role.clone(),
        }))
        .trust_forwarded_for(config.server.trust_forwarded_for);

    let sweeper = spawn_sweeper(manager, config.admission.sweep_interval());
    let app = build_router(demo_routes(), admission, stats, config.metrics.enabled);

    info!("Starting admission server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    let result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Admission server error");

    sweeper.abort();
    result
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

fn api_error(status: StatusCode, kind: &str, detail: &str) -> Response {
    (status, Json(json!({ "detail": detail, "type": kind }))).into_response()
}

async fn public_limits_handler(State(stats): State<StatsReporter>) -> Response {
    Json(stats.public_limits().await).into_response()
}

async fn self_service_handler(
    State(stats): State<StatsReporter>,
    caller: Option<Extension<Caller>>,
) -> Response {
    let Some(Extension(caller)) = caller else {
        return api_error(StatusCode::UNAUTHORIZED, "unauthenticated", "Caller identity required");
    };

    match stats.self_service(&caller).await {
        Ok(usage) => Json(usage).into_response(),
        Err(e) => {
            error!(identity = %caller.identity, error = %e, "Failed to read quota usage");
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "usage_unavailable",
                &format!("Error reading usage: {}", e),
            )
        }
    }
}

async fn aggregate_handler(
    State(stats): State<StatsReporter>,
    caller: Option<Extension<Caller>>,
) -> Response {
    let Some(Extension(caller)) = caller else {
        return api_error(StatusCode::UNAUTHORIZED, "unauthenticated", "Caller identity required");
    };
    if caller.role != ADMIN_ROLE {
        return api_error(StatusCode::FORBIDDEN, "forbidden", "Admin role required");
    }

    match stats.aggregate().await {
        Ok(view) => Json(view.as_ref().clone()).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to build aggregate view");
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "stats_unavailable",
                &format!("Error building stats: {}", e),
            )
        }
    }
}

/// Metrics endpoint handler
async fn metrics_handler() -> Response {
    match metrics::gather_metrics() {
        Ok(metrics_text) => (StatusCode::OK, metrics_text).into_response(),
        Err(e) => {
            error!("Failed to gather metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error gathering metrics: {}", e),
            ).into_response()
        }
    }
}

/// Health check endpoint
async fn health_handler() -> impl IntoResponse {
    StatusCode::OK
}

async fn echo_handler(method: Method, uri: Uri) -> impl IntoResponse {
    Json(json!({ "method": method.as_str(), "path": uri.path() }))
}

// Report generation is only known to be expensive once it has run
async fn report_handler() -> impl IntoResponse {
    (Extension(ExpensiveCall), Json(json!({ "status": "generated" })))
}
