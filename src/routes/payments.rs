use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::handlers::{payment_handlers, webhook_handlers};
use crate::middleware::auth::auth_middleware;
use crate::state::AppState;

pub fn routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/", get(payment_handlers::my_payments))
        .route("/initiate_mpesa", post(payment_handlers::initiate_mpesa_payment))
        .route("/initiate_bank", post(payment_handlers::initiate_bank_transfer))
        .route("/manual_verify", post(payment_handlers::manual_verify))
        .route("/:id/retry", post(payment_handlers::retry_payment))
        .route("/:id/cancel", post(payment_handlers::cancel_payment))
        .route("/:id/status", get(payment_handlers::payment_status))
        .route_layer(middleware::from_fn_with_state(state, auth_middleware))
}

/// Gateway-facing hooks carry no auth header; Safaricom signs nothing on
/// STK callbacks, so these only log and reconcile.
pub fn webhook_routes() -> Router<AppState> {
    Router::new()
        .route("/mpesa/callback", post(webhook_handlers::mpesa_callback))
        .route("/mpesa/c2b/validation", post(webhook_handlers::c2b_validation))
        .route("/mpesa/c2b/confirmation", post(webhook_handlers::c2b_confirmation))
}
