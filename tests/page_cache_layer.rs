//! The page cache as axum middleware in front of ordinary handlers.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::{
    Router,
    body::Body,
    http::{HeaderValue, Request, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use http_body_util::BodyExt;
use pagefront::cache::{CacheConfig, CacheEngine, CacheState, MemoryStore, page_cache_layer};
use tower::ServiceExt;

const HEADER: &str = "x-pagefront-cache";

fn app(config: CacheConfig, hits: Arc<AtomicUsize>) -> Router {
    let engine = Arc::new(CacheEngine::builder(config, Arc::new(MemoryStore::default())).build());
    let page_hits = hits.clone();
    let cookie_hits = hits.clone();

    Router::new()
        .route(
            "/page",
            get(move || {
                let hits = page_hits.clone();
                async move {
                    let n = hits.fetch_add(1, Ordering::SeqCst);
                    (
                        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
                        format!("<p>render {n}</p>"),
                    )
                }
            }),
        )
        .route(
            "/login",
            get(move || {
                let hits = cookie_hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    let mut response = "<p>welcome</p>".into_response();
                    let headers = response.headers_mut();
                    headers.append(header::SET_COOKIE, HeaderValue::from_static("a=1"));
                    headers.append(header::SET_COOKIE, HeaderValue::from_static("b=2"));
                    response
                }
            }),
        )
        .route("/logo.png", get(png))
        .route("/form", post(|| async { "posted" }))
        .layer(middleware::from_fn_with_state(
            CacheState::new(engine),
            page_cache_layer,
        ))
}

async fn png() -> Response {
    (
        [(header::CONTENT_TYPE, "image/png")],
        vec![0x89_u8, b'P', b'N', b'G', 0xff, 0x00],
    )
        .into_response()
}

fn request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::HOST, "example.com")
        .body(Body::empty())
        .expect("request builds")
}

fn outcome(response: &Response) -> Option<&str> {
    response
        .headers()
        .get(HEADER)
        .and_then(|value| value.to_str().ok())
}

async fn body_bytes(response: Response) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .expect("body collects")
        .to_bytes()
        .to_vec()
}

#[tokio::test]
async fn second_request_is_served_from_cache() {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = app(CacheConfig::default(), hits.clone());

    let first = app.clone().oneshot(request("GET", "/page")).await.expect("first");
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(outcome(&first), Some("MISS"));
    let first_body = body_bytes(first).await;

    let second = app.oneshot(request("GET", "/page")).await.expect("second");
    assert_eq!(outcome(&second), Some("HIT"));
    assert_eq!(
        second
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
        Some("text/html; charset=utf-8")
    );
    assert!(second.headers().contains_key(header::LAST_MODIFIED));
    assert_eq!(body_bytes(second).await, first_body);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn session_cookie_bypasses_the_cache() {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = app(CacheConfig::default(), hits.clone());

    for _ in 0..2 {
        let mut req = request("GET", "/page");
        req.headers_mut().insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; wordpress_logged_in_abc=1"),
        );
        let response = app.clone().oneshot(req).await.expect("response");
        assert_eq!(outcome(&response), Some("BYPASS"));
    }
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn set_cookie_headers_reach_the_client_but_not_the_store() {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = app(CacheConfig::default(), hits.clone());

    let first = app.clone().oneshot(request("GET", "/login")).await.expect("first");
    assert_eq!(outcome(&first), Some("MISS"));
    assert_eq!(first.headers().get_all(header::SET_COOKIE).iter().count(), 2);

    let second = app.oneshot(request("GET", "/login")).await.expect("second");
    assert_eq!(outcome(&second), Some("HIT"));
    assert!(!second.headers().contains_key(header::SET_COOKIE));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn set_cookie_rule_keeps_responses_dynamic() {
    let hits = Arc::new(AtomicUsize::new(0));
    let config = CacheConfig {
        skip_set_cookie_responses: true,
        ..CacheConfig::default()
    };
    let app = app(config, hits.clone());

    for _ in 0..2 {
        let response = app.clone().oneshot(request("GET", "/login")).await.expect("response");
        assert_eq!(outcome(&response), Some("DYNAMIC"));
    }
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn binary_bodies_are_relayed_untouched() {
    let app = app(CacheConfig::default(), Arc::new(AtomicUsize::new(0)));

    let response = app.oneshot(request("GET", "/logo.png")).await.expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(outcome(&response), None);
    assert_eq!(
        body_bytes(response).await,
        vec![0x89_u8, b'P', b'N', b'G', 0xff, 0x00]
    );
}

#[tokio::test]
async fn unsafe_methods_skip_the_cache() {
    let app = app(CacheConfig::default(), Arc::new(AtomicUsize::new(0)));

    let response = app.oneshot(request("POST", "/form")).await.expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(outcome(&response), None);
    assert_eq!(body_bytes(response).await, b"posted".to_vec());
}

#[tokio::test]
async fn unknown_routes_keep_their_status() {
    let app = app(CacheConfig::default(), Arc::new(AtomicUsize::new(0)));

    let first = app.clone().oneshot(request("GET", "/missing")).await.expect("first");
    assert_eq!(first.status(), StatusCode::NOT_FOUND);
    let second = app.oneshot(request("GET", "/missing")).await.expect("second");
    assert_eq!(second.status(), StatusCode::NOT_FOUND);
}
