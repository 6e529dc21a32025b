use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::handlers::booking_handlers;
use crate::middleware::auth::auth_middleware;
use crate::state::AppState;

pub fn routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/", post(booking_handlers::create_booking))
        .route("/", get(booking_handlers::list_bookings))
        .route("/available", get(booking_handlers::available_bookings))
        .route("/stats", get(booking_handlers::booking_stats))
        .route("/:id", get(booking_handlers::get_booking))
        .route("/:id/accept", post(booking_handlers::accept_booking))
        .route("/:id/start", post(booking_handlers::start_booking))
        .route("/:id/arrive", post(booking_handlers::arrive_booking))
        .route("/:id/complete", post(booking_handlers::complete_booking))
        .route("/:id/assign_driver", post(booking_handlers::assign_driver))
        .route("/:id/rate", post(booking_handlers::rate_booking))
        .route_layer(middleware::from_fn_with_state(state, auth_middleware))
}

/// Quote preview has no auth: customers price a job before signing up.
pub fn public_routes() -> Router<AppState> {
    Router::new().route("/pricing", post(booking_handlers::pricing_preview))
}
