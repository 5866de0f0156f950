pub mod middleware;
pub mod routes;

use std::sync::Arc;

use axum::Router;

use crate::bridge::store::BridgeTokenStore;

#[derive(Clone)]
pub struct AppState {
    pub token_store: Arc<BridgeTokenStore>,
    pub environment: String,
}

pub fn create_app(state: AppState) -> Router {
    routes::build_router(state)
}
