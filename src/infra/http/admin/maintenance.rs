use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cache::MaintenancePage;
use crate::infra::http::HttpError;

use super::AdminState;

const SOURCE: &str = "infra::http::admin::maintenance";

#[derive(Debug, Deserialize)]
pub(super) struct MaintenanceRequest {
    body: String,
    #[serde(default)]
    status: Option<u16>,
    #[serde(default)]
    retry_after_seconds: Option<u64>,
}

#[derive(Debug, Serialize)]
struct MaintenanceView {
    active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<String>,
}

pub(super) async fn show_maintenance(State(state): State<AdminState>) -> Response {
    let view = match state.engine.maintenance().current() {
        Some(page) => MaintenanceView {
            active: true,
            status: Some(page.status),
            retry_after_seconds: page.retry_after_seconds,
            body: Some(page.body),
        },
        None => MaintenanceView {
            active: false,
            status: None,
            retry_after_seconds: None,
            body: None,
        },
    };
    Json(view).into_response()
}

pub(super) async fn enable_maintenance(
    State(state): State<AdminState>,
    Json(request): Json<MaintenanceRequest>,
) -> Response {
    let mut page = MaintenancePage::new(request.body);
    if let Some(status) = request.status {
        if !(100..=599).contains(&status) {
            return HttpError::new(
                SOURCE,
                StatusCode::BAD_REQUEST,
                "Invalid status",
                format!("status `{status}` is not an HTTP status code"),
            )
            .into_response();
        }
        page.status = status;
    }
    if let Some(seconds) = request.retry_after_seconds {
        page = page.with_retry_after(seconds);
    }

    info!(target = "pagefront::admin", status = page.status, "maintenance enabled");
    state.engine.maintenance().enable(page);
    StatusCode::NO_CONTENT.into_response()
}

pub(super) async fn disable_maintenance(State(state): State<AdminState>) -> Response {
    info!(target = "pagefront::admin", "maintenance disabled");
    state.engine.maintenance().disable();
    StatusCode::NO_CONTENT.into_response()
}
