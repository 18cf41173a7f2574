use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use comp_recommender::comps::{CompEngine, ContextSummary, RankedResult, SubjectRequest};
use comp_recommender::config::EngineConfig;
use comp_recommender::CompError;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

#[derive(Clone)]
struct AppState {
    engine: Arc<CompEngine>,
}

#[derive(Serialize, Deserialize)]
struct ApiResponse {
    message: String,
    status: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    status: u16,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_target(false)
        .init();

    info!("🏠 Starting comp recommendation server...");

    // Load environment variables
    dotenvy::dotenv().ok();
    let config = EngineConfig::from_env()?;
    let addr: SocketAddr = config
        .bind_addr
        .parse()
        .with_context(|| format!("BIND_ADDR must be host:port, got '{}'", config.bind_addr))?;

    info!("📦 Loading dataset and scoring artifacts...");
    let engine = CompEngine::initialize(config).await;
    if engine.is_ready() {
        info!("✅ Engine ready");
    } else {
        warn!("Engine is not ready; /api/ready will report 503 until a reload succeeds");
    }

    let state = AppState {
        engine: Arc::new(engine),
    };

    let app = Router::new()
        .route("/", get(health_check))
        .route("/api/health", get(health_check))
        .route("/api/ready", get(readiness))
        .route("/api/recommendations", post(recommend))
        .route("/api/admin/reload", post(reload))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state);

    info!("🚀 Server running on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}

async fn health_check() -> Json<ApiResponse> {
    Json(ApiResponse {
        message: "Comp recommendation API is running!".to_string(),
        status: "ok".to_string(),
    })
}

async fn readiness(State(state): State<AppState>) -> (StatusCode, Json<ContextSummary>) {
    let summary = state.engine.snapshot().summary();
    let status = if summary.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(summary))
}

async fn recommend(
    State(state): State<AppState>,
    Json(request): Json<SubjectRequest>,
) -> Result<Json<RankedResult>, ApiError> {
    state
        .engine
        .recommend(request)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn reload(State(state): State<AppState>) -> Result<Json<ContextSummary>, ApiError> {
    state.engine.reload().await.map(Json).map_err(api_error)
}

fn status_for(err: &CompError) -> StatusCode {
    match err {
        CompError::Configuration(_) => StatusCode::BAD_REQUEST,
        CompError::DatasetUnavailable(_) | CompError::ModelUnavailable(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        CompError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn api_error(err: CompError) -> ApiError {
    let status = status_for(&err);
    if status.is_server_error() {
        error!("Request failed: {}", err);
    }
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
            status: status.as_u16(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            status_for(&CompError::Configuration("bad radius".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&CompError::DatasetUnavailable("missing".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(status_for(&CompError::Timeout(2000)), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            status_for(&CompError::Internal("panicked".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
