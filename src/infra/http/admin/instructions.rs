use std::collections::BTreeMap;

use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use crate::cache::InstructionRef;
use crate::infra::http::{HttpError, admin_error_to_http};

use super::AdminState;

const SOURCE: &str = "infra::http::admin::instructions";

#[derive(Debug, Deserialize)]
pub(super) struct QueueRequest {
    url: String,
    #[serde(default)]
    variant: Option<String>,
    name: String,
    #[serde(default)]
    args: BTreeMap<String, String>,
}

pub(super) async fn queue_instruction(
    State(state): State<AdminState>,
    Json(request): Json<QueueRequest>,
) -> Response {
    let instruction = InstructionRef {
        name: request.name,
        args: request.args,
    };
    match state
        .engine
        .queue_instruction(&request.url, request.variant.as_deref(), instruction)
        .await
    {
        Ok(true) => StatusCode::ACCEPTED.into_response(),
        Ok(false) => HttpError::new(
            SOURCE,
            StatusCode::NOT_FOUND,
            "No cached page",
            format!("no live entry for `{}`", request.url),
        )
        .into_response(),
        Err(err) => admin_error_to_http(SOURCE, err).into_response(),
    }
}
