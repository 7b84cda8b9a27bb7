use std::sync::Arc;

use axum::{Router, middleware, routing::get};

use crate::app_state::AppState;

use super::handlers;

pub fn build_router(state: Arc<AppState>) -> Router {
    let protected_routes = Router::new()
        .route("/stream", get(handlers::stream))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            super::middleware::require_auth,
        ));

    Router::new()
        .route("/health", get(handlers::health))
        .merge(protected_routes)
        .with_state(state)
}
