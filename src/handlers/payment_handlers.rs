// handlers/payment_handlers.rs
use axum::{
    extract::{Path, Query, State},
    response::Json,
    Extension,
};
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;
use validator::Validate;

use crate::errors::{AppError, Result};
use crate::models::booking::Booking;
use crate::models::payment::{
    BankTransferRequest, ManualVerifyRequest, MpesaPaymentRequest, Payment, PaymentListQuery,
    PaymentMethod, PaymentStatus, RetryPaymentRequest,
};
use crate::models::transaction_log::actions;
use crate::models::user::AuthUser;
use crate::services::mpesa_service::format_phone_number;
use crate::services::notifications::DomainEvent;
use crate::services::reconciliation::{log_transaction, reconcile_via_query, settle_payment};
use crate::state::AppState;

fn booking_reference(booking_id: Uuid) -> String {
    format!("BK{}", &booking_id.simple().to_string()[..8].to_uppercase())
}

async fn fetch_payment(state: &AppState, id: Uuid) -> Result<Payment> {
    sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE id = $1")
        .bind(id)
        .fetch_optional(&state.pool)
        .await?
        .ok_or(AppError::NotFound("Payment"))
}

async fn fetch_owning_booking(state: &AppState, payment: &Payment) -> Result<Booking> {
    sqlx::query_as::<_, Booking>("SELECT * FROM bookings WHERE id = $1")
        .bind(payment.booking_id)
        .fetch_optional(&state.pool)
        .await?
        .ok_or(AppError::NotFound("Booking"))
}

fn check_payment_access(actor: &AuthUser, booking: &Booking) -> Result<()> {
    if actor.role.is_admin()
        || booking.customer_id == actor.id
        || booking.driver_id == Some(actor.id)
    {
        Ok(())
    } else {
        Err(AppError::permission("Not your payment."))
    }
}

/// STK push initiation. The booking row is locked for the whole
/// initiate-or-update sequence so two concurrent requests cannot both
/// create a payment for it.
pub async fn initiate_mpesa_payment(
    State(state): State<AppState>,
    Extension(actor): Extension<AuthUser>,
    Json(request): Json<MpesaPaymentRequest>,
) -> Result<Json<Value>> {
    request.validate()?;
    let formatted_phone = format_phone_number(&request.phone_number)?;

    let mut tx = state.pool.begin().await?;

    let booking = sqlx::query_as::<_, Booking>(
        "SELECT * FROM bookings WHERE id = $1 AND customer_id = $2 FOR UPDATE",
    )
    .bind(request.booking_id)
    .bind(actor.id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(AppError::NotFound("Booking"))?;

    if booking.status == crate::models::booking::BookingStatus::Cancelled {
        return Err(AppError::conflict("Cannot pay for a cancelled booking."));
    }

    let existing = sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE booking_id = $1")
        .bind(booking.id)
        .fetch_optional(&mut *tx)
        .await?;

    if existing
        .as_ref()
        .is_some_and(|p| p.status == PaymentStatus::Paid)
    {
        return Err(AppError::conflict("Booking already has a paid payment."));
    }

    let amount = booking.estimated_price;
    let reference = booking_reference(booking.id);

    let response = match state
        .mpesa
        .stk_push(
            &formatted_phone,
            amount,
            &reference,
            "Exhauster Service Booking",
        )
        .await
    {
        Ok(response) => response,
        Err(e) => {
            // Rolled back: the gateway rejection leaves no state behind
            // except its audit row.
            drop(tx);
            log_transaction(
                &state.pool,
                existing.as_ref().map(|p| p.id),
                actions::STK_PUSH_FAILED,
                json!({ "booking_id": booking.id, "phone": formatted_phone }),
                "error",
                &e.to_string(),
            )
            .await?;
            return Err(e);
        }
    };

    if !response.is_accepted() {
        drop(tx);
        log_transaction(
            &state.pool,
            existing.as_ref().map(|p| p.id),
            actions::STK_PUSH_FAILED,
            json!({ "booking_id": booking.id, "response": response }),
            "rejected",
            &response.response_description,
        )
        .await?;
        return Err(AppError::gateway(response.response_description));
    }

    let payment = sqlx::query_as::<_, Payment>(
        "INSERT INTO payments
             (booking_id, amount, status, payment_method,
              checkout_request_id, merchant_request_id)
         VALUES ($1, $2, 'pending', 'mpesa', $3, $4)
         ON CONFLICT (booking_id) DO UPDATE
         SET amount = EXCLUDED.amount,
             status = 'pending',
             payment_method = 'mpesa',
             checkout_request_id = EXCLUDED.checkout_request_id,
             merchant_request_id = EXCLUDED.merchant_request_id,
             updated_at = now()
         RETURNING *",
    )
    .bind(booking.id)
    .bind(amount)
    .bind(&response.checkout_request_id)
    .bind(&response.merchant_request_id)
    .fetch_one(&mut *tx)
    .await?;

    let booking_status = sqlx::query_scalar::<_, crate::models::booking::BookingStatus>(
        "UPDATE bookings
         SET status = CASE WHEN status = 'pending'
                           THEN 'payment_pending'::booking_status
                           ELSE status END,
             updated_at = now()
         WHERE id = $1
         RETURNING status",
    )
    .bind(booking.id)
    .fetch_one(&mut *tx)
    .await?;

    log_transaction(
        &mut *tx,
        Some(payment.id),
        actions::STK_PUSH_INITIATED,
        json!({ "response": response, "phone": formatted_phone, "amount": amount }),
        "success",
        "",
    )
    .await?;

    tx.commit().await?;

    info!(payment_id = %payment.id, "STK push initiated");
    Ok(Json(json!({
        "success": true,
        "message": "Payment initiated successfully. Please check your phone to complete the payment.",
        "payment_id": payment.id,
        "checkout_request_id": response.checkout_request_id,
        "merchant_request_id": response.merchant_request_id,
        "customer_message": response.customer_message,
        "booking_status": booking_status,
    })))
}

/// Bank transfers are recorded pending with the customer's reference and
/// settle only through manual_verify.
pub async fn initiate_bank_transfer(
    State(state): State<AppState>,
    Extension(actor): Extension<AuthUser>,
    Json(request): Json<BankTransferRequest>,
) -> Result<Json<Value>> {
    request.validate()?;

    let mut tx = state.pool.begin().await?;

    let booking = sqlx::query_as::<_, Booking>(
        "SELECT * FROM bookings WHERE id = $1 AND customer_id = $2 FOR UPDATE",
    )
    .bind(request.booking_id)
    .bind(actor.id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(AppError::NotFound("Booking"))?;

    if booking.status == crate::models::booking::BookingStatus::Cancelled {
        return Err(AppError::conflict("Cannot pay for a cancelled booking."));
    }

    let existing = sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE booking_id = $1")
        .bind(booking.id)
        .fetch_optional(&mut *tx)
        .await?;
    if existing
        .as_ref()
        .is_some_and(|p| p.status == PaymentStatus::Paid)
    {
        return Err(AppError::conflict("Booking already has a paid payment."));
    }

    let payment = sqlx::query_as::<_, Payment>(
        "INSERT INTO payments (booking_id, amount, status, payment_method, bank_reference)
         VALUES ($1, $2, 'pending', 'bank', $3)
         ON CONFLICT (booking_id) DO UPDATE
         SET amount = EXCLUDED.amount,
             status = 'pending',
             payment_method = 'bank',
             bank_reference = EXCLUDED.bank_reference,
             checkout_request_id = NULL,
             merchant_request_id = NULL,
             updated_at = now()
         RETURNING *",
    )
    .bind(booking.id)
    .bind(booking.estimated_price)
    .bind(&request.bank_reference)
    .fetch_one(&mut *tx)
    .await?;

    log_transaction(
        &mut *tx,
        Some(payment.id),
        actions::BANK_TRANSFER_SUBMITTED,
        json!({ "bank_reference": request.bank_reference, "amount": payment.amount }),
        "success",
        "",
    )
    .await?;

    tx.commit().await?;

    state.emit(DomainEvent::BankTransferSubmitted {
        booking_id: booking.id,
        amount: payment.amount,
        bank_reference: request.bank_reference.clone(),
    });

    Ok(Json(json!({
        "success": true,
        "message": "Bank transfer recorded. An admin will verify it shortly.",
        "payment_id": payment.id,
    })))
}

/// Re-push a failed or user-cancelled M-Pesa payment. Correlation IDs are
/// overwritten so the next callback matches the new attempt.
pub async fn retry_payment(
    State(state): State<AppState>,
    Extension(actor): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(request): Json<RetryPaymentRequest>,
) -> Result<Json<Value>> {
    request.validate()?;

    let payment = fetch_payment(&state, id).await?;
    let booking = fetch_owning_booking(&state, &payment).await?;

    if booking.customer_id != actor.id && !actor.role.is_admin() {
        return Err(AppError::permission("You can only retry your own payments."));
    }
    if !payment.status.can_retry() {
        return Err(AppError::conflict(format!(
            "Cannot retry a {:?} payment.",
            payment.status
        )));
    }
    if payment.payment_method != PaymentMethod::Mpesa {
        return Err(AppError::validation("Only M-PESA payments can be retried."));
    }

    let formatted_phone = format_phone_number(&request.phone_number)?;
    let reference = booking_reference(booking.id);

    let response = match state
        .mpesa
        .stk_push(&formatted_phone, payment.amount, &reference, "Retry Payment")
        .await
    {
        Ok(response) => response,
        Err(e) => {
            log_transaction(
                &state.pool,
                Some(payment.id),
                actions::STK_PUSH_FAILED,
                json!({ "retry": true, "phone": formatted_phone }),
                "error",
                &e.to_string(),
            )
            .await?;
            return Err(e);
        }
    };

    if !response.is_accepted() {
        log_transaction(
            &state.pool,
            Some(payment.id),
            actions::STK_PUSH_FAILED,
            json!({ "retry": true, "response": response }),
            "rejected",
            &response.response_description,
        )
        .await?;
        return Err(AppError::gateway(response.response_description));
    }

    let mut tx = state.pool.begin().await?;
    sqlx::query(
        "UPDATE payments
         SET checkout_request_id = $2,
             merchant_request_id = $3,
             status = 'pending',
             updated_at = now()
         WHERE id = $1",
    )
    .bind(payment.id)
    .bind(&response.checkout_request_id)
    .bind(&response.merchant_request_id)
    .execute(&mut *tx)
    .await?;
    log_transaction(
        &mut *tx,
        Some(payment.id),
        actions::PAYMENT_RETRY,
        json!({ "response": response }),
        "success",
        "",
    )
    .await?;
    tx.commit().await?;

    Ok(Json(json!({
        "success": true,
        "message": "Payment retry initiated successfully.",
        "checkout_request_id": response.checkout_request_id,
        "customer_message": response.customer_message,
    })))
}

pub async fn cancel_payment(
    State(state): State<AppState>,
    Extension(actor): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>> {
    let payment = fetch_payment(&state, id).await?;
    let booking = fetch_owning_booking(&state, &payment).await?;

    if booking.customer_id != actor.id && !actor.role.is_admin() {
        return Err(AppError::permission("You can only cancel your own payments."));
    }
    if payment.status != PaymentStatus::Pending {
        return Err(AppError::conflict(format!(
            "Cannot cancel a {:?} payment.",
            payment.status
        )));
    }

    let mut tx = state.pool.begin().await?;
    sqlx::query(
        "UPDATE payments
         SET status = 'cancelled',
             cancelled_at = now(),
             cancelled_by = $2,
             updated_at = now()
         WHERE id = $1",
    )
    .bind(payment.id)
    .bind(actor.id)
    .execute(&mut *tx)
    .await?;
    log_transaction(
        &mut *tx,
        Some(payment.id),
        actions::PAYMENT_CANCELLED,
        json!({ "cancelled_by": actor.id }),
        "success",
        "",
    )
    .await?;
    tx.commit().await?;

    Ok(Json(json!({
        "success": true,
        "message": "Payment cancelled successfully."
    })))
}

/// Current payment state, with a best-effort pull from the gateway when the
/// payment is still pending. A gateway failure here never changes state.
pub async fn payment_status(
    State(state): State<AppState>,
    Extension(actor): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>> {
    let payment = fetch_payment(&state, id).await?;
    let booking = fetch_owning_booking(&state, &payment).await?;
    check_payment_access(&actor, &booking)?;

    if payment.status == PaymentStatus::Pending {
        if let Some(checkout_request_id) = payment.checkout_request_id.clone() {
            match state.mpesa.query_status(&checkout_request_id).await {
                Ok(response) => {
                    reconcile_via_query(&state, &payment, &response).await?;
                    let refreshed = fetch_payment(&state, id).await?;
                    return Ok(Json(json!({
                        "payment": refreshed,
                        "mpesa_status": response,
                    })));
                }
                Err(e) => {
                    // Timeout or provider error: stay pending, the callback
                    // or a later query resolves it.
                    warn!(payment_id = %payment.id, "Status query failed: {}", e);
                }
            }
        }
    }

    Ok(Json(json!({ "payment": payment })))
}

/// Admin override for cash-in-hand or stuck gateway confirmations.
pub async fn manual_verify(
    State(state): State<AppState>,
    Extension(actor): Extension<AuthUser>,
    Json(request): Json<ManualVerifyRequest>,
) -> Result<Json<Value>> {
    if !actor.role.is_admin() {
        return Err(AppError::permission("Only admins can verify payments."));
    }

    let payment = fetch_payment(&state, request.payment_id).await?;
    if payment.status == PaymentStatus::Paid {
        return Err(AppError::conflict("Payment is already marked as paid."));
    }

    let mut tx = state.pool.begin().await?;

    sqlx::query(
        "UPDATE payments
         SET verified_by = $2, verified_at = now(), updated_at = now()
         WHERE id = $1",
    )
    .bind(payment.id)
    .bind(actor.id)
    .execute(&mut *tx)
    .await?;

    let (payment, booking) = settle_payment(
        &mut tx,
        payment.id,
        request.mpesa_receipt.as_deref(),
        "Manually verified",
    )
    .await?;

    log_transaction(
        &mut *tx,
        Some(payment.id),
        actions::MANUAL_VERIFICATION,
        json!({ "verified_by": actor.id, "receipt": request.mpesa_receipt }),
        "success",
        "",
    )
    .await?;

    tx.commit().await?;

    info!(payment_id = %payment.id, admin = %actor.id, "Payment manually verified");
    state.emit(DomainEvent::PaymentSettled {
        booking_id: booking.id,
        customer_phone: booking.customer_phone.clone(),
        amount: payment.amount,
        receipt: payment.mpesa_receipt.clone(),
    });

    Ok(Json(json!({
        "success": true,
        "message": "Payment manually verified.",
        "payment": payment,
    })))
}

/// Role-filtered payment history with an optional status filter.
pub async fn my_payments(
    State(state): State<AppState>,
    Extension(actor): Extension<AuthUser>,
    Query(query): Query<PaymentListQuery>,
) -> Result<Json<Vec<Payment>>> {
    let payments = if actor.role.is_admin() {
        sqlx::query_as::<_, Payment>(
            "SELECT * FROM payments
             WHERE ($1::payment_status IS NULL OR status = $1)
             ORDER BY created_at DESC",
        )
        .bind(query.status)
        .fetch_all(&state.pool)
        .await?
    } else if actor.role.is_driver() {
        sqlx::query_as::<_, Payment>(
            "SELECT p.* FROM payments p
             JOIN bookings b ON b.id = p.booking_id
             WHERE b.driver_id = $1
               AND ($2::payment_status IS NULL OR p.status = $2)
             ORDER BY p.created_at DESC",
        )
        .bind(actor.id)
        .bind(query.status)
        .fetch_all(&state.pool)
        .await?
    } else {
        sqlx::query_as::<_, Payment>(
            "SELECT p.* FROM payments p
             JOIN bookings b ON b.id = p.booking_id
             WHERE b.customer_id = $1
               AND ($2::payment_status IS NULL OR p.status = $2)
             ORDER BY p.created_at DESC",
        )
        .bind(actor.id)
        .bind(query.status)
        .fetch_all(&state.pool)
        .await?
    };

    Ok(Json(payments))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn booking_reference_is_short_and_stable() {
        let id = Uuid::parse_str("a1b2c3d4-0000-0000-0000-000000000000").unwrap();
        let reference = booking_reference(id);
        assert_eq!(reference, "BKA1B2C3D4");
        assert_eq!(reference, booking_reference(id));
    }
}
