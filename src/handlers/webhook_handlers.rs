// handlers/webhook_handlers.rs
//
// Unauthenticated endpoints the gateway calls. Safaricom expects a fast
// fixed acknowledgment; the actual reconciliation work runs in a spawned
// task after the raw payload has been written to the audit trail.
use axum::{extract::State, response::Json};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::models::transaction_log::actions;
use crate::services::reconciliation::{self, log_transaction, StkCallbackEnvelope};
use crate::state::AppState;

fn gateway_ack() -> Json<Value> {
    Json(json!({ "ResultCode": 0, "ResultDesc": "Success" }))
}

pub async fn mpesa_callback(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Json<Value> {
    info!("M-Pesa callback received");

    // Raw payload first, before any matching is attempted, so even an
    // unparseable delivery leaves a trace.
    if let Err(e) = log_transaction(
        &state.pool,
        None,
        actions::MPESA_CALLBACK_RECEIVED,
        payload.clone(),
        "received",
        "",
    )
    .await
    {
        error!("Failed to log raw callback: {}", e);
    }

    let envelope: StkCallbackEnvelope = match serde_json::from_value(payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("Malformed M-Pesa callback: {}", e);
            return Json(json!({ "ResultCode": 1, "ResultDesc": "Invalid payload" }));
        }
    };

    // Ack immediately; the gateway retries delivery on its own if it ever
    // misses this response, so reconciliation must not hold it up.
    let callback = envelope.body.stk_callback;
    tokio::spawn(async move {
        match reconciliation::process_callback(&state, callback).await {
            Ok(outcome) => info!("Callback reconciled: {:?}", outcome),
            Err(e) => error!("Callback reconciliation failed: {}", e),
        }
    });

    gateway_ack()
}

/// C2B validation hook: always accepts, verification happens at confirmation.
pub async fn c2b_validation(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Json<Value> {
    if let Err(e) = log_transaction(
        &state.pool,
        None,
        actions::C2B_VALIDATION,
        payload,
        "validating",
        "",
    )
    .await
    {
        error!("Failed to log C2B validation: {}", e);
    }

    Json(json!({ "ResultCode": 0, "ResultDesc": "Accepted" }))
}

pub async fn c2b_confirmation(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Json<Value> {
    if let Err(e) = log_transaction(
        &state.pool,
        None,
        actions::C2B_CONFIRMATION,
        payload,
        "received",
        "",
    )
    .await
    {
        error!("Failed to log C2B confirmation: {}", e);
    }

    gateway_ack()
}
