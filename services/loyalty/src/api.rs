use crate::config::ApiConfig;
use crate::error::{ErrorResponse, IngestError};
use crate::ingest::{IngestInput, IngestOutcome, TestIngestor};
use crate::repository::{Ledger, ResultPage, ResultQuery};
use crate::roles::Role;
use crate::stats::{DashboardStats, StatsService};
use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, instrument};
use uuid::Uuid;

/// Header carrying the caller role resolved by the upstream auth layer.
pub const ROLE_HEADER: &str = "x-caller-role";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub ingestor: Arc<TestIngestor>,
    pub stats: Arc<StatsService>,
    pub ledger: Arc<dyn Ledger>,
}

/// Ingestion request body. Document bytes travel base64-encoded.
#[derive(Debug, Serialize, Deserialize)]
pub struct IngestRequest {
    pub member_id: Uuid,
    pub test_type_id: Uuid,
    pub cost: f64,
    #[serde(default)]
    pub notes: Option<String>,
    /// When the test occurred; defaults to the ingestion time
    #[serde(default)]
    pub occurred_at: Option<DateTime<Utc>>,
    #[serde(with = "base64_serde")]
    pub document: Vec<u8>,
    pub media_type: String,
}

/// Base64 serialization helper
mod base64_serde {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

/// Query parameters for the result listing
#[derive(Debug, Deserialize)]
pub struct ListResultsQuery {
    /// Filter by member
    pub user_id: Option<Uuid>,
    /// Restrict to a single calendar day (YYYY-MM-DD)
    pub date: Option<NaiveDate>,
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_per_page")]
    pub per_page: i64,
}

fn default_page() -> i64 {
    1
}

fn default_per_page() -> i64 {
    10
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/v1/results", post(ingest_result).get(list_results))
        .route("/api/v1/dashboard/stats", get(dashboard_stats))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "loyalty-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.ledger.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Record a test result for a member
#[instrument(skip(state, headers, request))]
async fn ingest_result(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<IngestRequest>,
) -> Result<Json<IngestOutcome>, IngestError> {
    let role = caller_role(&headers);

    let input = IngestInput {
        member_id: request.member_id,
        test_type_id: request.test_type_id,
        cost: request.cost,
        notes: request.notes,
        occurred_at: request.occurred_at.unwrap_or_else(Utc::now),
        document: request.document,
        media_type: request.media_type,
    };

    let outcome = state.ingestor.ingest(role, input).await?;
    Ok(Json(outcome))
}

/// List test results with filtering and pagination
#[instrument(skip(state))]
async fn list_results(
    State(state): State<AppState>,
    Query(params): Query<ListResultsQuery>,
) -> Result<Json<ResultPage>, (StatusCode, Json<ErrorResponse>)> {
    let query = ResultQuery {
        user_id: params.user_id,
        date: params.date,
        page: params.page,
        per_page: params.per_page,
    };

    let page = state.ledger.list_results(&query).await.map_err(|e| {
        error!(error = %e, "Failed to query test results");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: "Failed to query test results".to_string(),
                code: "QUERY_ERROR".to_string(),
            }),
        )
    })?;

    Ok(Json(page))
}

/// Dashboard metrics snapshot. Never fails: degraded sections come back
/// zeroed instead.
#[instrument(skip(state))]
async fn dashboard_stats(State(state): State<AppState>) -> Json<DashboardStats> {
    Json(state.stats.compute().await)
}

/// Resolve the caller role from request headers. A missing or unreadable
/// header is the least-privileged role, not an error.
fn caller_role(headers: &HeaderMap) -> Role {
    headers
        .get(ROLE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(Role::parse)
        .unwrap_or(Role::User)
}

/// Start the admin API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    tracing::info!(address = %addr, "Starting admin API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_ingest_request() {
        let json = r#"{
            "member_id": "550e8400-e29b-41d4-a716-446655440000",
            "test_type_id": "650e8400-e29b-41d4-a716-446655440000",
            "cost": 120.5,
            "notes": "fasting sample",
            "occurred_at": "2024-03-09T10:30:00Z",
            "document": "JVBERi0xLjQ=",
            "media_type": "application/pdf"
        }"#;

        let request: IngestRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.cost, 120.5);
        assert_eq!(request.document, b"%PDF-1.4");
        assert_eq!(request.media_type, "application/pdf");
    }

    #[test]
    fn test_ingest_request_optional_fields_default() {
        let json = r#"{
            "member_id": "550e8400-e29b-41d4-a716-446655440000",
            "test_type_id": "650e8400-e29b-41d4-a716-446655440000",
            "cost": 0,
            "document": "JVBERi0xLjQ=",
            "media_type": "application/pdf"
        }"#;

        let request: IngestRequest = serde_json::from_str(json).unwrap();
        assert!(request.notes.is_none());
        assert!(request.occurred_at.is_none());
    }

    #[test]
    fn test_caller_role_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(caller_role(&headers), Role::User);

        headers.insert(ROLE_HEADER, "admin".parse().unwrap());
        assert_eq!(caller_role(&headers), Role::Admin);

        headers.insert(ROLE_HEADER, "nonsense".parse().unwrap());
        assert_eq!(caller_role(&headers), Role::User);
    }
}
