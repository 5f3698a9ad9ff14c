//! HTTP routes.
//!
//! | Method | Path                                | Handler              |
//! |--------|-------------------------------------|----------------------|
//! | POST   | /models                             | create a model       |
//! | GET    | /models                             | list with filters    |
//! | GET    | /models/:id                         | fetch one            |
//! | PUT    | /models/:id                         | partial update       |
//! | DELETE | /models/:id                         | delete               |
//! | POST   | /models/test-connection/:id         | ping through adapter |
//! | GET    | /models/:id/performance?window=7d   | windowed snapshot    |
//! | POST   | /recommend                          | rank for a request   |
//! | POST   | /route                              | select, call, record |
//! | GET    | /health                             | breaker states       |
//! | GET    | /templates                          | catalog              |
//! | POST   | /templates/:name/instantiate        | create from preset   |

use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use routing::{
    CandidateFilter, ConnectionTest, Execution, HealthReport, ModelConfig, ModelFilter, ModelPatch,
    NewModel, PerformanceSnapshot, ProviderRequest, RecommendationRequest, RecommendationResult,
    RoutingError, SharedRoutingService, SortKey, Template, TemplateOverrides, Window,
};

#[derive(Clone)]
pub struct AppState {
    pub service: SharedRoutingService,
    /// Default provider-call timeout for `/route` and connection tests.
    pub call_timeout: Duration,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/models", post(create_model).get(list_models))
        .route(
            "/models/:id",
            get(get_model).put(update_model).delete(delete_model),
        )
        .route("/models/test-connection/:id", post(test_connection))
        .route("/models/:id/performance", get(performance))
        .route("/recommend", post(recommend))
        .route("/route", post(route_request))
        .route("/health", get(health))
        .route("/templates", get(list_templates))
        .route("/templates/:name/instantiate", post(instantiate_template))
        .with_state(state)
}

// ── Errors ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
#[error(transparent)]
pub struct ApiError(#[from] RoutingError);

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_elsewhere: Option<bool>,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            RoutingError::Validation(_) => StatusCode::BAD_REQUEST,
            RoutingError::Conflict(_) | RoutingError::ProtectedResource(_) => StatusCode::CONFLICT,
            RoutingError::NotFound(_) => StatusCode::NOT_FOUND,
            RoutingError::NoAvailableModel(_) => StatusCode::SERVICE_UNAVAILABLE,
            RoutingError::NoMatch(_) => StatusCode::UNPROCESSABLE_ENTITY,
            RoutingError::Provider { .. } => StatusCode::BAD_GATEWAY,
            RoutingError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            RoutingError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(code = self.0.code(), error = %self.0, "Request failed");
        }
        let body = ErrorBody {
            code: self.0.code().to_string(),
            message: self.0.to_string(),
            retry_elsewhere: self.0.is_provider_failure().then(|| self.0.is_retriable()),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ── Models ───────────────────────────────────────────────────────────

async fn create_model(
    State(state): State<AppState>,
    Json(new): Json<NewModel>,
) -> ApiResult<(StatusCode, Json<ModelConfig>)> {
    let model = state.service.create_model(new).await?;
    Ok((StatusCode::CREATED, Json(model)))
}

/// `capability` is comma-separated; every listed tag must be present.
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub enabled: Option<bool>,
    pub capability: Option<String>,
    pub provider: Option<String>,
    pub sort: Option<SortKey>,
}

impl From<ListQuery> for ModelFilter {
    fn from(q: ListQuery) -> Self {
        ModelFilter {
            enabled: q.enabled,
            capabilities: q
                .capability
                .map(|c| {
                    c.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            provider: q.provider,
            sort: q.sort,
        }
    }
}

async fn list_models(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Json<Vec<ModelConfig>> {
    Json(state.service.list_models(&query.into()))
}

async fn get_model(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ModelConfig>> {
    Ok(Json(state.service.get_model(&id)?))
}

async fn update_model(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<ModelPatch>,
) -> ApiResult<Json<ModelConfig>> {
    Ok(Json(state.service.update_model(&id, patch).await?))
}

async fn delete_model(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ModelConfig>> {
    Ok(Json(state.service.delete_model(&id).await?))
}

async fn test_connection(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ConnectionTest>> {
    Ok(Json(
        state
            .service
            .test_connection(&id, state.call_timeout)
            .await?,
    ))
}

#[derive(Debug, Default, Deserialize)]
pub struct PerformanceQuery {
    pub window: Option<String>,
}

async fn performance(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<PerformanceQuery>,
) -> ApiResult<Json<PerformanceSnapshot>> {
    let window = match query.window.as_deref() {
        Some(raw) => raw.parse::<Window>()?,
        None => Window::Day,
    };
    Ok(Json(state.service.performance(&id, window)?))
}

// ── Routing ──────────────────────────────────────────────────────────

async fn recommend(
    State(state): State<AppState>,
    Json(request): Json<RecommendationRequest>,
) -> ApiResult<Json<RecommendationResult>> {
    Ok(Json(state.service.recommend(&request)?))
}

#[derive(Debug, Deserialize)]
pub struct RouteRequest {
    #[serde(default)]
    pub filter: CandidateFilter,
    #[serde(flatten)]
    pub request: ProviderRequest,
    /// Overrides the server's call timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

async fn route_request(
    State(state): State<AppState>,
    Json(body): Json<RouteRequest>,
) -> ApiResult<Json<Execution>> {
    if body.request.messages.is_empty() {
        return Err(RoutingError::validation("'messages' must not be empty").into());
    }
    let timeout = body
        .timeout_ms
        .filter(|ms| *ms > 0)
        .map_or(state.call_timeout, Duration::from_millis);
    let execution = state
        .service
        .execute(&body.filter, body.request, timeout)
        .await?;
    Ok(Json(execution))
}

async fn health(State(state): State<AppState>) -> Json<HealthReport> {
    Json(state.service.health())
}

// ── Templates ────────────────────────────────────────────────────────

async fn list_templates(State(state): State<AppState>) -> Json<Vec<Template>> {
    Json(state.service.list_templates())
}

/// The overrides body is optional; an empty body means no overrides, a
/// malformed one is rejected.
async fn instantiate_template(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<ModelConfig>)> {
    let overrides = parse_overrides(&body)?;
    let model = state.service.instantiate_template(&name, overrides).await?;
    Ok((StatusCode::CREATED, Json(model)))
}

fn parse_overrides(body: &[u8]) -> Result<TemplateOverrides, RoutingError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(TemplateOverrides::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| RoutingError::validation(format!("invalid template overrides: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_overrides_body_is_default() {
        let overrides = parse_overrides(b"").unwrap();
        assert!(overrides.id.is_none());
        assert!(parse_overrides(b"  \n").unwrap().id.is_none());
    }

    #[test]
    fn test_malformed_overrides_rejected() {
        assert!(matches!(
            parse_overrides(br#"{"id": 5}"#),
            Err(RoutingError::Validation(_))
        ));
        assert!(matches!(
            parse_overrides(b"{not json"),
            Err(RoutingError::Validation(_))
        ));
        let parsed = parse_overrides(br#"{"id": "mini"}"#).unwrap();
        assert_eq!(parsed.id.as_deref(), Some("mini"));
    }
}
