use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;
use usecase_metrics_lib::build_router;
use usecase_metrics_lib::db::DatabaseOptions;
use usecase_metrics_lib::service::MetricsService;

fn app() -> (TempDir, Router) {
    let dir = tempfile::tempdir().expect("tempdir");
    let service = MetricsService::open(dir.path(), &DatabaseOptions::default()).expect("service");
    (dir, build_router(service))
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Option<String>, Value) {
    let response = app.clone().oneshot(request).await.expect("request must be served");
    let status = response.status();
    let cache_control = response
        .headers()
        .get(header::CACHE_CONTROL)
        .and_then(|value| value.to_str().ok())
        .map(ToString::to_string);
    let body = response
        .into_body()
        .collect()
        .await
        .expect("collect body")
        .to_bytes();
    if body.is_empty() {
        return (status, cache_control, Value::Null);
    }
    (status, cache_control, serde_json::from_slice(&body).expect("json body"))
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().method("GET").uri(uri).body(Body::empty()).expect("valid request")
}

fn patch(uri: &str, body: impl Into<Body>) -> Request<Body> {
    Request::builder()
        .method("PATCH")
        .uri(uri)
        .header("content-type", "application/json")
        .body(body.into())
        .expect("valid request")
}

fn new_metric_body() -> Value {
    json!({
        "newMetrics": [{
            "clientId": -1,
            "metricTypeId": "2",
            "unitOfMeasureId": 2,
            "primarySuccessMetricName": "Spend avoided",
            "baselineValue": 0,
            "baselineDate": "2025-01-01",
            "targetValue": 25000,
            "targetDate": "2099-06-30"
        }],
        "newReportedMetrics": [{ "metricId": -1, "reportedValue": "1200.50", "reportedDate": "2025-06-30" }],
        "editorEmail": "analyst@example.com"
    })
}

#[tokio::test]
async fn health_and_reference_data() {
    let (_dir, app) = app();

    let (status, cache_control, body) = send(&app, get("/api/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cache_control.as_deref(), Some("no-store"));
    assert_eq!(body, json!({ "status": "ok" }));

    let (status, _, body) = send(&app, get("/api/mappings/metric-categories")).await;
    assert_eq!(status, StatusCode::OK);
    let items = body["items"].as_array().expect("items");
    assert!(items.iter().any(|item| item["category"] == "Cost Savings" && item["id"] == 2));

    let (status, _, body) = send(&app, get("/api/mappings/unit-of-measure")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["items"]
        .as_array()
        .expect("items")
        .iter()
        .any(|item| item["name"] == "USD" && item["measureType"] == "currency"));
}

#[tokio::test]
async fn empty_use_case_reads_as_two_empty_lists() {
    let (_dir, app) = app();
    let (status, _, body) = send(&app, get("/api/usecases/12/metrics")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "metrics": [], "reportedMetrics": [] }));
}

#[tokio::test]
async fn patch_then_read_back() {
    let (_dir, app) = app();

    let (status, cache_control, body) = send(&app, patch("/api/usecases/12/metrics", new_metric_body().to_string())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cache_control.as_deref(), Some("no-store"));
    assert_eq!(body, json!({ "ok": true }));

    let (status, _, body) = send(&app, get("/api/usecases/12/metrics")).await;
    assert_eq!(status, StatusCode::OK);
    let metric = &body["metrics"][0];
    assert_eq!(metric["primarySuccessMetricName"], "Spend avoided");
    assert_eq!(metric["metricTypeId"], 2);
    assert_eq!(metric["baselineValue"], "0");
    assert_eq!(metric["targetValue"], "25000");
    assert_eq!(metric["editor"], "analyst@example.com");
    let report = &body["reportedMetrics"][0];
    assert_eq!(report["metricId"], metric["id"]);
    assert_eq!(report["reportedValue"], "1200.50");

    let metric_id = metric["id"].as_i64().expect("metric id");
    let (status, _, _) = send(
        &app,
        patch(
            "/api/usecases/12/metrics",
            json!({ "updateMetrics": [{ "id": metric_id, "targetValue": "30000" }] }).to_string(),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, _, body) = send(&app, get("/api/usecases/12/metrics")).await;
    assert_eq!(body["metrics"][0]["targetValue"], "30000");
    assert_eq!(body["metrics"][0]["baselineDate"], "2025-01-01");

    // Another use case can neither see nor touch these rows.
    let (_, _, other) = send(&app, get("/api/usecases/13/metrics")).await;
    assert_eq!(other, json!({ "metrics": [], "reportedMetrics": [] }));
    let (status, _, body) = send(
        &app,
        patch(
            "/api/usecases/13/metrics",
            json!({ "updateMetrics": [{ "id": metric_id, "targetValue": "1" }] }).to_string(),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["errors"][0].as_str().expect("error").contains("does not belong to this use case"));
}

#[tokio::test]
async fn validation_failure_lists_every_problem_and_writes_nothing() {
    let (_dir, app) = app();
    let body = json!({
        "newMetrics": [{
            "metricTypeId": 1,
            "unitOfMeasureId": 1,
            "primarySuccessMetricName": "Backwards",
            "baselineValue": "5",
            "baselineDate": "2025-03-01",
            "targetValue": "1",
            "targetDate": "2025-02-01"
        }],
        "newReportedMetrics": [{ "metricId": 4, "reportedValue": "", "reportedDate": "2024-02-30" }]
    });

    let (status, _, response) = send(&app, patch("/api/usecases/3/metrics", body.to_string())).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(response["message"], "Validation failed.");
    let errors: Vec<&str> = response["errors"]
        .as_array()
        .expect("errors")
        .iter()
        .filter_map(Value::as_str)
        .collect();
    assert!(errors.contains(&"newMetrics[0].targetDate: must be after baselineDate"));
    assert!(errors.contains(&"newReportedMetrics[0].reportedValue: is required"));
    assert!(errors.contains(&"newReportedMetrics[0].reportedDate: '2024-02-30' is not a valid YYYY-MM-DD date"));

    let (_, _, stored) = send(&app, get("/api/usecases/3/metrics")).await;
    assert_eq!(stored, json!({ "metrics": [], "reportedMetrics": [] }));
}

#[tokio::test]
async fn malformed_requests_are_client_errors() {
    let (_dir, app) = app();

    let (status, _, body) = send(&app, get("/api/usecases/abc/metrics")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({ "message": "Invalid id" }));

    let (status, _, body) = send(&app, patch("/api/usecases/abc/metrics", "{}")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Invalid id");

    let (status, _, body) = send(&app, patch("/api/usecases/3/metrics", json!({ "editorEmail": "x@example.com" }).to_string())).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({ "message": "No changes provided." }));

    let (status, _, body) = send(&app, patch("/api/usecases/3/metrics", json!({ "newMetrics": {} }).to_string())).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().expect("message").contains("newMetrics must be an array"));
    assert!(body.get("errors").is_none());

    let (status, _, _) = send(&app, patch("/api/usecases/3/metrics", "not json")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
