use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use research_flow::agents::SystemHealth;
use research_flow::models::{ResearchReport, ResearchRequest};
use research_flow::resilience::CircuitBreakerState;
use research_flow::{ResearchConfig, ResearchError, ResearchPipeline};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, instrument, warn};
use tracing_subscriber::EnvFilter;

#[derive(Clone)]
struct AppState {
    pipeline: Arc<ResearchPipeline>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    system: SystemHealth,
    circuit_breakers: BTreeMap<String, CircuitBreakerState>,
}

struct ApiError(ResearchError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ResearchError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            e if e.is_coverage_failure() => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({
            "message": self.0.to_string(),
            "error": self.0,
        });
        (status, Json(body)).into_response()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("research_flow=debug,graph_flow=info")),
        )
        .init();

    let config = ResearchConfig::from_env();
    let pipeline = Arc::new(ResearchPipeline::from_config(&config));
    pipeline.communication().start_heartbeat();

    let state = AppState {
        pipeline: pipeline.clone(),
    };
    let app = Router::new()
        .route("/health", get(health))
        .route("/research", post(research))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state);

    let bind_address = &config.server.bind_address;
    let listener = tokio::net::TcpListener::bind(bind_address.as_str()).await?;
    info!("research-flow server running on http://{}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    pipeline.communication().shutdown();
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let system = state.pipeline.communication().system_health();
    Json(HealthResponse {
        status: system.overall_status.as_str(),
        system,
        circuit_breakers: state.pipeline.breakers().status(),
    })
}

#[instrument(skip(state, req), fields(topic = %req.topic))]
async fn research(
    State(state): State<AppState>,
    Json(req): Json<ResearchRequest>,
) -> Result<Json<ResearchReport>, ApiError> {
    let report = state
        .pipeline
        .run(&req.topic, req.understanding, req.user_context)
        .await
        .map_err(ApiError)?;

    info!(
        "Research on '{}' finished in {}ms with {} results",
        report.topic,
        report.total_time_ms,
        report.results.len()
    );
    Ok(Json(report))
}
