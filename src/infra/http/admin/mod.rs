mod health;
mod instructions;
mod maintenance;
mod records;

use std::sync::Arc;

use axum::{
    Router, middleware,
    routing::{get, post, put},
};

use crate::cache::CacheEngine;

use super::middleware::{log_responses, set_request_context};

#[derive(Clone)]
pub struct AdminState {
    pub engine: Arc<CacheEngine>,
}

/// Admin listener: maintenance switch, purges, record flags and queued instructions.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health::admin_health))
        .route(
            "/maintenance",
            get(maintenance::show_maintenance)
                .put(maintenance::enable_maintenance)
                .delete(maintenance::disable_maintenance),
        )
        .route("/purge", post(records::purge))
        .route("/records/cacheable", put(records::set_cacheable))
        .route("/instructions", post(instructions::queue_instruction))
        .with_state(state)
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_context))
}
