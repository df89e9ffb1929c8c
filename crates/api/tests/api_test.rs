//! Integration tests against the in-process router, covering the concrete
//! scenarios from spec.md §8.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use storage_sqlite::SqliteBackend;
use tower::ServiceExt;

use api::ratelimit::RateLimitConfig;
use api::RouterBuilder;
use auth::AuthConfig;

fn test_auth() -> AuthConfig {
    AuthConfig::new(
        true,
        vec!["project-dev".into(), "project-a".into(), "project-b".into()],
        "project-default".into(),
    )
}

fn router() -> axum::Router {
    let backend: Arc<dyn storage::StorageBackend> = Arc::new(SqliteBackend::memory().unwrap());
    RouterBuilder::new(backend, test_auth())
        .rate_limit(RateLimitConfig { max_requests: 1_000, window: std::time::Duration::from_secs(60) })
        .build()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn request(method: &str, path: &str, api_key: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(path)
        .header("content-type", "application/json")
        .header("x-api-key", api_key)
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

fn get_request(path: &str, api_key: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(path)
        .header("x-api-key", api_key)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn happy_path_trace_and_span_lifecycle() {
    let app = router();

    let res = app
        .clone()
        .oneshot(request("POST", "/api/traces", "project-dev", json!({"name": "q1", "project_id": "dev"})))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = body_json(res).await;
    let trace_id = body["trace_id"].as_str().unwrap().to_string();

    let res = app
        .clone()
        .oneshot(request(
            "POST",
            &format!("/api/traces/{trace_id}/spans"),
            "project-dev",
            json!({"name": "call", "span_type": "llm", "model": "gpt-4"}),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = body_json(res).await;
    let span_id = body["span_id"].as_str().unwrap().to_string();

    let res = app
        .clone()
        .oneshot(request(
            "PATCH",
            &format!("/api/spans/{span_id}/complete"),
            "project-dev",
            json!({"tokens_input": 10, "tokens_output": 5}),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = app
        .clone()
        .oneshot(request(
            "PATCH",
            &format!("/api/traces/{trace_id}/complete"),
            "project-dev",
            json!({"output": "ok"}),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = app
        .clone()
        .oneshot(get_request(&format!("/api/traces/{trace_id}"), "project-dev"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = body_json(res).await;
    assert_eq!(body["span_count"], 1);
    assert_eq!(body["spans"][0]["tokens_input"], 10);
}

#[tokio::test]
async fn cross_project_access_is_404() {
    let app = router();

    let res = app
        .clone()
        .oneshot(request("POST", "/api/traces", "project-a", json!({"name": "q1", "project_id": "a"})))
        .await
        .unwrap();
    let body = body_json(res).await;
    let trace_id = body["trace_id"].as_str().unwrap().to_string();

    let res = app
        .clone()
        .oneshot(get_request(&format!("/api/traces/{trace_id}"), "project-b"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body = body_json(res).await;
    assert!(body["detail"].as_str().unwrap().contains("not found"));

    let res = app
        .clone()
        .oneshot(request(
            "POST",
            &format!("/api/traces/{trace_id}/spans"),
            "project-b",
            json!({"name": "call", "span_type": "llm"}),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn project_mismatch_on_create_is_403() {
    let app = router();
    let res = app
        .clone()
        .oneshot(request("POST", "/api/traces", "project-a", json!({"name": "q1", "project_id": "b"})))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn unknown_key_is_401() {
    let app = router();
    let res = app
        .clone()
        .oneshot(request("POST", "/api/traces", "project-nope", json!({"name": "q1", "project_id": "nope"})))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn pagination_across_three_pages() {
    let app = router();
    for i in 0..5 {
        let res = app
            .clone()
            .oneshot(request(
                "POST",
                "/api/traces",
                "project-dev",
                json!({"name": format!("trace-{i}"), "project_id": "dev"}),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    let res = app
        .clone()
        .oneshot(get_request("/api/traces?limit=2", "project-dev"))
        .await
        .unwrap();
    let page1 = body_json(res).await;
    assert_eq!(page1["count"], 2);
    assert_eq!(page1["has_more"], true);
    let cursor = page1["next_cursor"].as_str().unwrap().to_string();

    let res = app
        .clone()
        .oneshot(get_request(&format!("/api/traces?limit=2&cursor={cursor}"), "project-dev"))
        .await
        .unwrap();
    let page2 = body_json(res).await;
    assert_eq!(page2["count"], 2);
    assert_eq!(page2["has_more"], true);
    let cursor2 = page2["next_cursor"].as_str().unwrap().to_string();

    let res = app
        .clone()
        .oneshot(get_request(&format!("/api/traces?limit=2&cursor={cursor2}"), "project-dev"))
        .await
        .unwrap();
    let page3 = body_json(res).await;
    assert_eq!(page3["count"], 1);
    assert_eq!(page3["has_more"], false);
}

#[tokio::test]
async fn health_is_public_and_unauthenticated() {
    let backend: Arc<dyn storage::StorageBackend> = Arc::new(SqliteBackend::memory().unwrap());
    let app = RouterBuilder::new(backend, test_auth()).build();
    let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let res = app.oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = body_json(res).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["storage"], "sqlite");
}

#[tokio::test]
async fn nested_span_tree_threading() {
    let app = router();

    let res = app
        .clone()
        .oneshot(request("POST", "/api/traces", "project-dev", json!({"name": "q1", "project_id": "dev"})))
        .await
        .unwrap();
    let body = body_json(res).await;
    let trace_id = body["trace_id"].as_str().unwrap().to_string();

    let res = app
        .clone()
        .oneshot(request(
            "POST",
            &format!("/api/traces/{trace_id}/spans"),
            "project-dev",
            json!({"name": "parent", "span_type": "chain"}),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = body_json(res).await;
    let parent_id = body["span_id"].as_str().unwrap().to_string();

    let mut child_ids = Vec::new();
    for i in 0..3 {
        let res = app
            .clone()
            .oneshot(request(
                "POST",
                &format!("/api/traces/{trace_id}/spans"),
                "project-dev",
                json!({"name": format!("child-{i}"), "span_type": "llm", "parent_span_id": parent_id}),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = body_json(res).await;
        child_ids.push(body["span_id"].as_str().unwrap().to_string());
    }

    for span_id in std::iter::once(&parent_id).chain(child_ids.iter()) {
        let res = app
            .clone()
            .oneshot(request(
                "PATCH",
                &format!("/api/spans/{span_id}/complete"),
                "project-dev",
                json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    let res = app
        .clone()
        .oneshot(request(
            "PATCH",
            &format!("/api/traces/{trace_id}/complete"),
            "project-dev",
            json!({"output": "ok"}),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = app
        .clone()
        .oneshot(get_request(&format!("/api/traces/{trace_id}"), "project-dev"))
        .await
        .unwrap();
    let body = body_json(res).await;
    assert_eq!(body["span_count"], 4);

    let spans = body["spans"].as_array().unwrap();
    let children_of_parent = spans
        .iter()
        .filter(|s| s["parent_span_id"].as_str() == Some(parent_id.as_str()))
        .count();
    assert_eq!(children_of_parent, 3);
}

#[tokio::test]
async fn rate_limit_rejects_past_the_window() {
    let backend: Arc<dyn storage::StorageBackend> = Arc::new(SqliteBackend::memory().unwrap());
    let app = RouterBuilder::new(backend, test_auth())
        .rate_limit(RateLimitConfig { max_requests: 2, window: std::time::Duration::from_secs(60) })
        .build();

    for _ in 0..2 {
        let res = app.clone().oneshot(get_request("/api/stats", "project-dev")).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }
    let res = app.clone().oneshot(get_request("/api/stats", "project-dev")).await.unwrap();
    assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
}
