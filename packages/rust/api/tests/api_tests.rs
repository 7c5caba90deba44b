//! Integration tests for the kwengine HTTP API.

use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use serde_json::{Value, json};
use tower::util::ServiceExt; // for `oneshot` method
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use kwengine_api::{AppState, build_router};
use kwengine_limiter::RateLimiter;
use kwengine_shared::{EnrichmentDefaults, LimiterConfig};
use kwengine_stats::StatsClient;
use kwengine_storage::Storage;

/// Test helper: temp database plus a client pointed at `stats_url`.
async fn setup_state(stats_url: &str, token: Option<&str>) -> AppState {
    let db = std::env::temp_dir().join(format!("kw_api_{}.db", uuid::Uuid::now_v7()));
    let storage = Storage::open(&db).await.expect("open test db");
    let provider = StatsClient::new(stats_url, token.map(str::to_string), Duration::from_secs(5))
        .expect("build client");
    let limiter = RateLimiter::new(LimiterConfig::new(2, Duration::ZERO));
    AppState::new(storage, provider, limiter, EnrichmentDefaults::default())
}

fn app(state: &AppState) -> Router {
    build_router(state.clone())
}

fn request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder().method(method).uri(uri);
    match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn body_bytes(body: Body) -> Vec<u8> {
    axum::body::to_bytes(body, usize::MAX)
        .await
        .expect("Should read body")
        .to_vec()
}

async fn extract_json(body: Body) -> Value {
    serde_json::from_slice(&body_bytes(body).await).expect("Should parse JSON")
}

fn snapshot(name: &str, queries: &[(&str, u64)]) -> Value {
    json!({
        "subclusterName": name,
        "clusterName": "Сочи",
        "filteredQueries": queries
            .iter()
            .map(|(p, c)| json!({"phrase": p, "count": c}))
            .collect::<Vec<_>>(),
    })
}

// =============================================================================
// Health
// =============================================================================

#[tokio::test]
async fn health_reports_ok() {
    let state = setup_state("http://127.0.0.1:9", Some("t")).await;
    let response = app(&state)
        .oneshot(request("GET", "/health", None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = extract_json(response.into_body()).await;
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());
}

// =============================================================================
// Snapshots
// =============================================================================

#[tokio::test]
async fn snapshot_put_list_delete() {
    let state = setup_state("http://127.0.0.1:9", Some("t")).await;

    let response = app(&state)
        .oneshot(request(
            "PUT",
            "/snapshots/tours",
            Some(snapshot("Туры", &[("тур в сочи", 500)])),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let stored = extract_json(response.into_body()).await;
    assert_eq!(stored["subclusterId"], "tours");

    let response = app(&state)
        .oneshot(request("GET", "/snapshots", None))
        .await
        .unwrap();
    let list = extract_json(response.into_body()).await;
    assert_eq!(list.as_array().unwrap().len(), 1);
    assert_eq!(list[0]["filteredQueries"][0]["count"], 500);

    let response = app(&state)
        .oneshot(request("GET", "/snapshots/tours", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let one = extract_json(response.into_body()).await;
    assert_eq!(one["subclusterName"], "Туры");
    assert_eq!(one["filteredQueries"][0]["phrase"], "тур в сочи");

    let response = app(&state)
        .oneshot(request("DELETE", "/snapshots/tours", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app(&state)
        .oneshot(request("GET", "/snapshots/tours", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app(&state)
        .oneshot(request("DELETE", "/snapshots/tours", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = extract_json(response.into_body()).await;
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn malformed_snapshot_is_rejected() {
    let state = setup_state("http://127.0.0.1:9", Some("t")).await;

    let response = app(&state)
        .oneshot(request(
            "PUT",
            "/snapshots/tours",
            Some(json!({"subclusterName": "Туры", "filteredQueries": "oops"})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app(&state)
        .oneshot(request(
            "PUT",
            "/snapshots/tours",
            Some(json!({"subclusterId": "other", "subclusterName": "Туры", "filteredQueries": []})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

// =============================================================================
// Reconciliation
// =============================================================================

#[tokio::test]
async fn reconcile_fresh_then_cached() {
    let state = setup_state("http://127.0.0.1:9", Some("t")).await;

    // Nothing computed yet
    let response = app(&state)
        .oneshot(request("POST", "/reconcile", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let empty = extract_json(response.into_body()).await;
    assert_eq!(empty, json!({"lastUpdated": null, "pairs": []}));

    for (id, name, count) in [("a", "Туры", 500), ("b", "Отдых", 200)] {
        let response = app(&state)
            .oneshot(request(
                "PUT",
                &format!("/snapshots/{id}"),
                Some(snapshot(name, &[("тур в сочи", count), (id, 1)])),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app(&state)
        .oneshot(request("GET", "/reconcile", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let fresh = extract_json(response.into_body()).await;
    let pair = &fresh["pairs"][0];
    assert_eq!(pair["intersectionCount"], 1);
    assert_eq!(pair["removeFrom1"], 0);
    assert_eq!(pair["removeFrom2"], 1);
    assert_eq!(pair["intersection"][0]["staysIn"], 1);

    let first = app(&state)
        .oneshot(request("POST", "/reconcile", None))
        .await
        .unwrap();
    let first = body_bytes(first.into_body()).await;
    let second = app(&state)
        .oneshot(request("POST", "/reconcile", None))
        .await
        .unwrap();
    let second = body_bytes(second.into_body()).await;

    assert_eq!(first, second);
    let cached: Value = serde_json::from_slice(&first).unwrap();
    assert_eq!(cached, fresh);
}

// =============================================================================
// Enrichment
// =============================================================================

#[tokio::test]
async fn enrich_isolates_failed_phrase() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/topRequests"))
        .and(body_partial_json(json!({"phrase": "b"})))
        .respond_with(ResponseTemplate::new(503))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/topRequests"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "requestPhrase": "x",
            "totalCount": 12000,
            "topRequests": []
        })))
        .mount(&server)
        .await;

    let state = setup_state(&server.uri(), Some("token")).await;
    let response = app(&state)
        .oneshot(request(
            "POST",
            "/enrich",
            Some(json!({"phrases": ["a", "b", "c"]})),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = extract_json(response.into_body()).await;
    assert_eq!(body["total"], 3);
    assert_eq!(body["processed"], 2);
    assert_eq!(body["results"][0]["phrase"], "a");
    assert_eq!(body["results"][0]["hotnessTier"], "hot");
    assert_eq!(body["results"][1]["phrase"], "c");
    assert_eq!(body["errors"][0]["phrase"], "b");
    assert_eq!(body["errors"][0]["kind"], "upstream");
    assert_eq!(body["cancelled"], false);

    let jobs = state.storage.list_enrichment_jobs(10).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert!(jobs[0].finished_at.is_some());
}

#[tokio::test]
async fn enrich_without_token_is_unauthorized() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let state = setup_state(&server.uri(), None).await;
    let response = app(&state)
        .oneshot(request("POST", "/enrich", Some(json!({"phrases": ["a"]}))))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = extract_json(response.into_body()).await;
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn enrich_rejects_bad_range() {
    let state = setup_state("http://127.0.0.1:9", Some("t")).await;
    let response = app(&state)
        .oneshot(request(
            "POST",
            "/enrich",
            Some(json!({"phrases": ["a"], "dynamicsTo": "2024-01-01"})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn dropped_enrich_request_stops_admission_and_records_job() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/topRequests"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({
                    "requestPhrase": "x",
                    "totalCount": 500,
                    "topRequests": []
                }))
                .set_delay(Duration::from_millis(500)),
        )
        .mount(&server)
        .await;

    let state = setup_state(&server.uri(), Some("token")).await;
    let phrases: Vec<String> = (0..10).map(|i| format!("p{i}")).collect();

    // The client gives up while the first two calls are still in flight.
    let response = tokio::time::timeout(
        Duration::from_millis(200),
        app(&state).oneshot(request(
            "POST",
            "/enrich",
            Some(json!({"phrases": phrases})),
        )),
    )
    .await;
    assert!(response.is_err());

    let mut finished = None;
    for _ in 0..50 {
        let jobs = state.storage.list_enrichment_jobs(10).await.unwrap();
        if let Some(job) = jobs.into_iter().find(|j| j.finished_at.is_some()) {
            finished = Some(job);
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let job = finished.expect("job should be finished after the request was dropped");

    let stats = job.stats.unwrap();
    assert_eq!(stats["cancelled"], true);
    assert_eq!(stats["total"], 10);
    assert!(stats["processed"].as_u64().unwrap() < 10);

    let received = server.received_requests().await.unwrap();
    assert!(!received.is_empty());
    assert!(received.len() < phrases.len());
    assert_eq!(state.limiter.in_flight(), 0);
}
