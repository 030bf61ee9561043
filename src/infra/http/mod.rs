mod admin;
mod error;
mod middleware;
mod public;

pub use admin::{AdminState, build_admin_router};
pub use error::{ErrorReport, HttpError};
pub use public::{PublicState, build_public_router};

use axum::http::StatusCode;

use crate::cache::AdminError;

/// Map an engine admin failure to a consistent HTTP error response.
pub fn admin_error_to_http(source: &'static str, err: AdminError) -> HttpError {
    match &err {
        AdminError::InvalidUrl(_) => {
            HttpError::from_error(source, StatusCode::BAD_REQUEST, "Invalid url", &err)
        }
        AdminError::UnknownInstruction(_) => {
            HttpError::from_error(source, StatusCode::BAD_REQUEST, "Unknown instruction", &err)
        }
        AdminError::Store(_) => HttpError::from_error(
            source,
            StatusCode::SERVICE_UNAVAILABLE,
            "Cache store unavailable",
            &err,
        ),
    }
}
