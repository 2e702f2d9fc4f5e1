//! Axum Router Configuration
//!
//! This module defines the complete HTTP routing for the relay: the small
//! auth/webhook API and the two WebSocket upgrade endpoints.

use crate::{
    handlers,
    state::AppState,
    ws::{browser_ws_handler, telephony_ws_handler},
};

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/nonce", get(handlers::issue_nonce))
        .route("/api/token", get(handlers::issue_token))
        .route("/twilio", post(handlers::telephony_webhook))
        .route("/ws", get(browser_ws_handler))
        .route("/ws/twilio", get(telephony_ws_handler))
        .with_state(app_state)
}
