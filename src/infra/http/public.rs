use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};

use crate::{
    cache::{CacheState, page_cache_layer},
    infra::origin::HttpOrigin,
};

use super::middleware::{log_responses, set_request_context};

#[derive(Clone)]
pub struct PublicState {
    pub origin: Arc<HttpOrigin>,
}

/// Public listener: every path is proxied upstream through the page cache.
pub fn build_public_router(state: PublicState, cache: CacheState) -> Router {
    // Everything but the health check goes through the page cache.
    let proxied = Router::new()
        .fallback(proxy)
        .layer(middleware::from_fn_with_state(cache, page_cache_layer));

    Router::new()
        .route("/_pagefront/health", get(public_health))
        .merge(proxied)
        .with_state(state)
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_context))
}

async fn proxy(State(state): State<PublicState>, request: Request<Body>) -> Response {
    state.origin.forward(request).await
}

async fn public_health() -> Response {
    StatusCode::NO_CONTENT.into_response()
}
