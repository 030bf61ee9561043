//! The public router proxying a real upstream over TCP.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
    routing::get,
};
use http_body_util::BodyExt;
use pagefront::cache::{CacheConfig, CacheEngine, CacheState, MemoryStore};
use pagefront::config::OriginSettings;
use pagefront::infra::http::{PublicState, build_public_router};
use pagefront::infra::origin::HttpOrigin;
use tower::ServiceExt;
use url::Url;

async fn spawn_upstream(calls: Arc<AtomicUsize>) -> Url {
    let app = Router::new().route(
        "/article",
        get(move || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                (
                    [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
                    "<article>upstream</article>",
                )
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind upstream");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Url::parse(&format!("http://{addr}")).expect("upstream url")
}

fn public_router(upstream: Url) -> Router {
    let settings = OriginSettings {
        upstream,
        timeout: Duration::from_secs(5),
        preserve_host: false,
    };
    let origin = Arc::new(HttpOrigin::new(&settings, 1024 * 1024).expect("client builds"));
    let engine = Arc::new(
        CacheEngine::builder(CacheConfig::default(), Arc::new(MemoryStore::default())).build(),
    );
    build_public_router(PublicState { origin }, CacheState::new(engine))
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(header::HOST, "site.example")
        .body(Body::empty())
        .expect("request builds")
}

#[tokio::test]
async fn upstream_pages_are_cached_by_the_proxy() {
    let calls = Arc::new(AtomicUsize::new(0));
    let router = public_router(spawn_upstream(Arc::clone(&calls)).await);

    let first = router.clone().oneshot(get_request("/article")).await.expect("first");
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(
        first.headers().get("x-pagefront-cache").and_then(|v| v.to_str().ok()),
        Some("MISS")
    );

    let second = router.oneshot(get_request("/article")).await.expect("second");
    assert_eq!(
        second.headers().get("x-pagefront-cache").and_then(|v| v.to_str().ok()),
        Some("HIT")
    );
    let body = second.into_body().collect().await.expect("body").to_bytes();
    assert_eq!(&body[..], b"<article>upstream</article>");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn health_check_bypasses_proxy() {
    let router = public_router(Url::parse("http://127.0.0.1:9").expect("url"));

    let response = router
        .oneshot(get_request("/_pagefront/health"))
        .await
        .expect("health");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn unreachable_upstream_yields_bad_gateway_without_caching() {
    let router = public_router(Url::parse("http://127.0.0.1:9").expect("url"));

    let response = router.oneshot(get_request("/down")).await.expect("response");

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(
        response.headers().get(header::CACHE_CONTROL).and_then(|v| v.to_str().ok()),
        Some("no-store")
    );
}
