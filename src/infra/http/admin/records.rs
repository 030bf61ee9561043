use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use crate::infra::http::admin_error_to_http;

use super::AdminState;

const SOURCE: &str = "infra::http::admin::records";

#[derive(Debug, Deserialize)]
pub(super) struct PurgeRequest {
    url: String,
    #[serde(default)]
    variant: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(super) struct CacheableRequest {
    url: String,
    cacheable: bool,
}

pub(super) async fn purge(
    State(state): State<AdminState>,
    Json(request): Json<PurgeRequest>,
) -> Response {
    match state
        .engine
        .invalidate_url(&request.url, request.variant.as_deref())
        .await
    {
        Ok(report) => Json(report).into_response(),
        Err(err) => admin_error_to_http(SOURCE, err).into_response(),
    }
}

pub(super) async fn set_cacheable(
    State(state): State<AdminState>,
    Json(request): Json<CacheableRequest>,
) -> Response {
    match state
        .engine
        .set_cacheable(&request.url, request.cacheable)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => admin_error_to_http(SOURCE, err).into_response(),
    }
}
