use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;

use super::handlers;
use super::state::AppState;

pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(handlers::api::service_info))
        .nest(
            "/api",
            Router::new()
                // Uploaded databases
                .route(
                    "/databases",
                    get(handlers::api::list_databases).post(handlers::api::upload_database),
                )
                .route("/databases/{name}", delete(handlers::api::delete_database))
                .route("/databases/{name}/schema", get(handlers::api::get_schema))
                // Questions
                .route("/databases/{name}/query", post(handlers::api::query_database))
                // System status
                .route("/status", get(handlers::api::system_status)),
        )
}
