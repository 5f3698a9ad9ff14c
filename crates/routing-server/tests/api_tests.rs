//! HTTP surface tests: the axum router driven in-process with `oneshot`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use routing::{
    AdapterSet, MemoryConfigStore, ModelConfig, ProviderAdapter, ProviderFailure,
    ProviderRequest, ProviderResponse, RoutingConfig, RoutingService, SharedRoutingService,
    TemplateCatalog,
};
use routing_server::api::{router, AppState};

/// Answers every call; models whose id starts with `broken` fail upstream.
struct EchoProvider;

#[async_trait]
impl ProviderAdapter for EchoProvider {
    fn provider(&self) -> &str {
        "echo"
    }

    async fn invoke(
        &self,
        model: &ModelConfig,
        request: &ProviderRequest,
    ) -> Result<ProviderResponse, ProviderFailure> {
        if model.id.starts_with("broken") {
            return Err(ProviderFailure::Unavailable("503 upstream".into()));
        }
        let last = request
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        Ok(ProviderResponse {
            content: format!("{}: {last}", model.id),
            tokens: 42,
            cost: Some(0.001),
        })
    }
}

async fn app() -> (Router, SharedRoutingService) {
    let service = RoutingService::start(
        RoutingConfig::default(),
        MemoryConfigStore::new().shared(),
        AdapterSet::new().with(Arc::new(EchoProvider)),
        TemplateCatalog::builtin(),
    )
    .await
    .unwrap()
    .shared();
    let app = router(AppState {
        service: Arc::clone(&service),
        call_timeout: Duration::from_secs(5),
    });
    (app, service)
}

fn model_body(id: &str, quality: f64) -> Value {
    json!({
        "id": id,
        "provider": "echo",
        "model_name": id,
        "display_name": id.to_uppercase(),
        "quality_score": quality,
        "speed_score": 0.6,
        "cost_efficiency": 0.7,
        "reliability_score": 0.9,
        "cost_per_1k_tokens": 0.002,
        "capabilities": ["chat", "code"]
    })
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_create_then_get_and_list() {
    let (app, _) = app().await;

    let (status, created) = send(&app, "POST", "/models", Some(model_body("alpha", 0.8))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["id"], "alpha");
    assert_eq!(created["version"], 1);
    assert_eq!(created["enabled"], true);

    let (status, fetched) = send(&app, "GET", "/models/alpha", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["display_name"], "ALPHA");

    send(&app, "POST", "/models", Some(model_body("beta", 0.5))).await;
    let (status, listed) = send(&app, "GET", "/models?capability=chat,code&sort=quality", None).await;
    assert_eq!(status, StatusCode::OK);
    let ids: Vec<&str> = listed
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["alpha", "beta"]);

    let (_, none) = send(&app, "GET", "/models?capability=vision", None).await;
    assert!(none.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_duplicate_create_is_conflict() {
    let (app, _) = app().await;
    send(&app, "POST", "/models", Some(model_body("alpha", 0.8))).await;

    let (status, body) = send(&app, "POST", "/models", Some(model_body("alpha", 0.1))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["message"].as_str().unwrap().contains("alpha"));
    assert!(body.get("retry_elsewhere").is_none());
}

#[tokio::test]
async fn test_invalid_score_is_bad_request() {
    let (app, _) = app().await;
    let (status, _) = send(&app, "POST", "/models", Some(model_body("alpha", 1.5))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unknown_model_is_not_found() {
    let (app, _) = app().await;
    let (status, _) = send(&app, "GET", "/models/ghost", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&app, "DELETE", "/models/ghost", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&app, "GET", "/models/ghost/performance", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_default_model_delete_is_protected() {
    let (app, _) = app().await;
    let mut body = model_body("primary", 0.9);
    body["role"] = json!("chat");
    body["is_default"] = json!(true);
    send(&app, "POST", "/models", Some(body)).await;

    let (status, _) = send(&app, "DELETE", "/models/primary", None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, updated) = send(
        &app,
        "PUT",
        "/models/primary",
        Some(json!({"is_default": false, "admin_override": true})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["version"], 2);

    let (status, _) = send(&app, "DELETE", "/models/primary", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_stale_update_is_conflict() {
    let (app, _) = app().await;
    send(&app, "POST", "/models", Some(model_body("alpha", 0.8))).await;
    send(&app, "PUT", "/models/alpha", Some(json!({"speed_score": 0.9}))).await;

    let (status, _) = send(
        &app,
        "PUT",
        "/models/alpha",
        Some(json!({"speed_score": 0.1, "expected_version": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_recommend_picks_higher_quality() {
    let (app, _) = app().await;
    send(&app, "POST", "/models", Some(model_body("alpha", 0.95))).await;
    send(&app, "POST", "/models", Some(model_body("beta", 0.3))).await;

    let (status, result) = send(
        &app,
        "POST",
        "/recommend",
        Some(json!({"quality_requirement": "high", "expected_tokens": 1000})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["model_id"], "alpha");
    assert_eq!(result["runner_ups"][0]["model_id"], "beta");
    assert!(result["confidence"].as_f64().unwrap() > 0.5);
}

#[tokio::test]
async fn test_recommend_without_candidates_is_unprocessable() {
    let (app, _) = app().await;
    let (status, body) = send(&app, "POST", "/recommend", Some(json!({}))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["code"].is_string());
}

#[tokio::test]
async fn test_route_executes_and_records_usage() {
    let (app, service) = app().await;
    send(&app, "POST", "/models", Some(model_body("alpha", 0.8))).await;

    let (status, execution) = send(
        &app,
        "POST",
        "/route",
        Some(json!({
            "messages": [{"role": "user", "content": "ping"}],
            "filter": {"capabilities": ["chat"]}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(execution["model_id"], "alpha");
    assert_eq!(execution["content"], "alpha: ping");
    assert_eq!(execution["tokens"], 42);

    // Usage is ingested asynchronously.
    for _ in 0..50 {
        if service.tracker().record_count("alpha") == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(service.tracker().record_count("alpha"), 1);
    service.tracker().invalidate("alpha");

    let (status, snapshot) = send(&app, "GET", "/models/alpha/performance?window=7d", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(snapshot["window"], "7d");
    assert_eq!(snapshot["total_requests"], 1);
    assert_eq!(snapshot["total_tokens"], 42);
}

#[tokio::test]
async fn test_route_provider_failure_is_bad_gateway() {
    let (app, _) = app().await;
    send(&app, "POST", "/models", Some(model_body("broken-1", 0.8))).await;

    let (status, body) = send(
        &app,
        "POST",
        "/route",
        Some(json!({"messages": [{"role": "user", "content": "ping"}]})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["retry_elsewhere"], true);
}

#[tokio::test]
async fn test_route_rejects_empty_messages() {
    let (app, _) = app().await;
    send(&app, "POST", "/models", Some(model_body("alpha", 0.8))).await;
    let (status, _) = send(&app, "POST", "/route", Some(json!({"messages": []}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_route_with_no_models_is_unavailable() {
    let (app, _) = app().await;
    let (status, _) = send(
        &app,
        "POST",
        "/route",
        Some(json!({"messages": [{"role": "user", "content": "ping"}]})),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_bad_window_is_bad_request() {
    let (app, _) = app().await;
    send(&app, "POST", "/models", Some(model_body("alpha", 0.8))).await;
    let (status, _) = send(&app, "GET", "/models/alpha/performance?window=2d", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_connection_test_reports_failure_without_error_status() {
    let (app, _) = app().await;
    send(&app, "POST", "/models", Some(model_body("alpha", 0.8))).await;
    send(&app, "POST", "/models", Some(model_body("broken-1", 0.8))).await;

    let (status, ok) = send(&app, "POST", "/models/test-connection/alpha", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ok["success"], true);

    let (status, failed) = send(&app, "POST", "/models/test-connection/broken-1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(failed["success"], false);
    assert!(failed["error"].is_string());
    assert_eq!(failed["circuit"], "closed");
}

#[tokio::test]
async fn test_health_reports_model_counts() {
    let (app, _) = app().await;
    send(&app, "POST", "/models", Some(model_body("alpha", 0.8))).await;

    let (status, health) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "ok");
    assert_eq!(health["models"], 1);
    assert_eq!(health["enabled_models"], 1);
    assert_eq!(health["open_circuits"], 0);
}

#[tokio::test]
async fn test_templates_list_and_instantiate() {
    let (app, _) = app().await;

    let (status, templates) = send(&app, "GET", "/templates", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(templates
        .as_array()
        .unwrap()
        .iter()
        .any(|t| t["name"] == "gpt-4o-mini"));

    let (status, model) = send(
        &app,
        "POST",
        "/templates/gpt-4o-mini/instantiate",
        Some(json!({"id": "mini", "display_name": "Mini"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(model["id"], "mini");
    assert_eq!(model["display_name"], "Mini");

    let (status, _) = send(&app, "POST", "/templates/gpt-4o-mini/instantiate", None).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send(
        &app,
        "POST",
        "/templates/gpt-4o-mini/instantiate",
        Some(json!({"id": 5})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_ERROR");

    let (status, _) = send(&app, "POST", "/templates/nope/instantiate", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
