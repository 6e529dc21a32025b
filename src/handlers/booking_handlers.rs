// handlers/booking_handlers.rs
use axum::{
    extract::{Path, State},
    response::Json,
    Extension,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, to_value, Value};
use tracing::info;
use uuid::Uuid;
use validator::Validate;

use crate::errors::{AppError, Result};
use crate::models::booking::{
    AssignDriverRequest, Booking, CompleteCheck, CreateBookingRequest, RateBookingRequest,
    ServiceType, TankSize,
};
use crate::models::transaction_log::actions;
use crate::models::user::AuthUser;
use crate::services::notifications::DomainEvent;
use crate::services::pricing;
use crate::services::reconciliation::log_transaction;
use crate::state::AppState;

async fn fetch_booking(state: &AppState, id: Uuid) -> Result<Booking> {
    sqlx::query_as::<_, Booking>("SELECT * FROM bookings WHERE id = $1")
        .bind(id)
        .fetch_optional(&state.pool)
        .await?
        .ok_or(AppError::NotFound("Booking"))
}

pub async fn create_booking(
    State(state): State<AppState>,
    Extension(actor): Extension<AuthUser>,
    Json(request): Json<CreateBookingRequest>,
) -> Result<Json<Booking>> {
    request.validate()?;

    let estimated_price = request
        .estimated_price
        .unwrap_or_else(|| pricing::quote(request.service_type, request.tank_size).total);

    let booking = sqlx::query_as::<_, Booking>(
        "INSERT INTO bookings
             (customer_id, customer_phone, location_name, address, latitude, longitude,
              service_type, tank_size, special_instructions, scheduled_date, estimated_price)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
         RETURNING *",
    )
    .bind(actor.id)
    .bind(&request.customer_phone)
    .bind(&request.location_name)
    .bind(&request.address)
    .bind(request.latitude)
    .bind(request.longitude)
    .bind(request.service_type)
    .bind(request.tank_size)
    .bind(&request.special_instructions)
    .bind(request.scheduled_date)
    .bind(estimated_price)
    .fetch_one(&state.pool)
    .await?;

    info!(booking_id = %booking.id, "Booking created");
    state.emit(DomainEvent::BookingCreated {
        booking_id: booking.id,
        customer_phone: booking.customer_phone.clone(),
        location_name: booking.location_name.clone(),
        scheduled_date: booking.scheduled_date.format("%Y-%m-%d %H:%M").to_string(),
    });

    Ok(Json(booking))
}

/// Customers see their own bookings, drivers the ones assigned to them,
/// admins everything.
pub async fn list_bookings(
    State(state): State<AppState>,
    Extension(actor): Extension<AuthUser>,
) -> Result<Json<Vec<Booking>>> {
    let bookings = if actor.role.is_admin() {
        sqlx::query_as::<_, Booking>("SELECT * FROM bookings ORDER BY created_at DESC")
            .fetch_all(&state.pool)
            .await?
    } else if actor.role.is_driver() {
        sqlx::query_as::<_, Booking>(
            "SELECT * FROM bookings WHERE driver_id = $1 ORDER BY created_at DESC",
        )
        .bind(actor.id)
        .fetch_all(&state.pool)
        .await?
    } else {
        sqlx::query_as::<_, Booking>(
            "SELECT * FROM bookings WHERE customer_id = $1 ORDER BY created_at DESC",
        )
        .bind(actor.id)
        .fetch_all(&state.pool)
        .await?
    };

    Ok(Json(bookings))
}

pub async fn get_booking(
    State(state): State<AppState>,
    Extension(actor): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<Booking>> {
    let booking = fetch_booking(&state, id).await?;
    if !actor.role.is_admin()
        && booking.customer_id != actor.id
        && booking.driver_id != Some(actor.id)
    {
        return Err(AppError::permission("Not your booking."));
    }
    Ok(Json(booking))
}

/// Pending bookings with no driver yet, the driver job board.
pub async fn available_bookings(
    State(state): State<AppState>,
    Extension(actor): Extension<AuthUser>,
) -> Result<Json<Vec<Booking>>> {
    if !actor.role.is_driver() {
        return Err(AppError::permission(
            "Only drivers can view available bookings.",
        ));
    }

    let bookings = sqlx::query_as::<_, Booking>(
        "SELECT * FROM bookings
         WHERE status = 'pending' AND driver_id IS NULL
         ORDER BY created_at",
    )
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(bookings))
}

pub async fn booking_stats(
    State(state): State<AppState>,
    Extension(actor): Extension<AuthUser>,
) -> Result<Json<Value>> {
    if actor.role.is_driver() {
        let (total, completed): (i64, i64) = sqlx::query_as(
            "SELECT count(*),
                    count(*) FILTER (WHERE status = 'completed')
             FROM bookings WHERE driver_id = $1",
        )
        .bind(actor.id)
        .fetch_one(&state.pool)
        .await?;

        let earnings: Option<Decimal> = sqlx::query_scalar(
            "SELECT sum(final_price) FROM bookings
             WHERE driver_id = $1 AND status IN ('completed', 'archived')",
        )
        .bind(actor.id)
        .fetch_one(&state.pool)
        .await?;

        let avg_rating: Option<f64> = sqlx::query_scalar(
            "SELECT avg(score)::float8 FROM ratings WHERE driver_id = $1",
        )
        .bind(actor.id)
        .fetch_one(&state.pool)
        .await?;

        return Ok(Json(json!({
            "summary": {
                "jobs_done": completed,
                "total_jobs": total,
                "earnings": earnings.unwrap_or_default(),
                "rating": avg_rating.unwrap_or(5.0),
            }
        })));
    }

    if actor.role.is_admin() {
        let (active, pending_payments): (i64, i64) = sqlx::query_as(
            "SELECT (SELECT count(*) FROM bookings
                     WHERE status IN ('pending', 'accepted', 'started', 'arrived')),
                    (SELECT count(*) FROM payments WHERE status = 'pending')",
        )
        .fetch_one(&state.pool)
        .await?;

        let revenue: Option<Decimal> = sqlx::query_scalar(
            "SELECT sum(final_price) FROM bookings WHERE status IN ('completed', 'archived')",
        )
        .fetch_one(&state.pool)
        .await?;

        let avg_rating: Option<f64> =
            sqlx::query_scalar("SELECT avg(score)::float8 FROM ratings")
                .fetch_one(&state.pool)
                .await?;

        return Ok(Json(json!({
            "revenue": { "total": revenue.unwrap_or_default() },
            "quick_stats": {
                "active_bookings": active,
                "pending_payments": pending_payments,
                "avg_rating": avg_rating.unwrap_or(5.0),
            }
        })));
    }

    let (total, completed, pending, cancelled): (i64, i64, i64, i64) = sqlx::query_as(
        "SELECT count(*),
                count(*) FILTER (WHERE status = 'completed'),
                count(*) FILTER (WHERE status IN ('pending', 'payment_pending')),
                count(*) FILTER (WHERE status = 'cancelled')
         FROM bookings WHERE customer_id = $1",
    )
    .bind(actor.id)
    .fetch_one(&state.pool)
    .await?;

    // Spend counts settled payments only, not estimates.
    let spent: Option<Decimal> = sqlx::query_scalar(
        "SELECT sum(p.amount) FROM payments p
         JOIN bookings b ON b.id = p.booking_id
         WHERE b.customer_id = $1 AND p.status = 'paid'",
    )
    .bind(actor.id)
    .fetch_one(&state.pool)
    .await?;

    Ok(Json(json!({
        "total": total,
        "completed": completed,
        "pending": pending,
        "cancelled": cancelled,
        "spent": spent.unwrap_or_default(),
    })))
}

pub async fn accept_booking(
    State(state): State<AppState>,
    Extension(actor): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>> {
    let booking = fetch_booking(&state, id).await?;
    booking.check_accept(&actor)?;

    // Guarded update: a concurrent accept that won the race leaves zero rows.
    let accepted = sqlx::query_as::<_, Booking>(
        "UPDATE bookings
         SET driver_id = $2, status = 'accepted', updated_at = now()
         WHERE id = $1
           AND status = 'pending'
           AND (driver_id IS NULL OR driver_id = $2)
         RETURNING *",
    )
    .bind(id)
    .bind(actor.id)
    .fetch_optional(&state.pool)
    .await?
    .ok_or_else(|| AppError::conflict("Booking already assigned to another driver."))?;

    info!(booking_id = %accepted.id, driver_id = %actor.id, "Booking accepted");
    state.emit(DomainEvent::BookingAccepted {
        booking_id: accepted.id,
        customer_phone: accepted.customer_phone.clone(),
    });

    Ok(Json(json!({ "success": true, "detail": "Booking accepted." })))
}

pub async fn start_booking(
    State(state): State<AppState>,
    Extension(actor): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>> {
    let booking = fetch_booking(&state, id).await?;
    booking.check_start(&actor)?;

    sqlx::query(
        "UPDATE bookings SET status = 'started', updated_at = now()
         WHERE id = $1 AND status = 'accepted'",
    )
    .bind(id)
    .execute(&state.pool)
    .await?;

    Ok(Json(json!({
        "success": true,
        "detail": "Job started. You are now on the way."
    })))
}

pub async fn arrive_booking(
    State(state): State<AppState>,
    Extension(actor): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>> {
    let booking = fetch_booking(&state, id).await?;
    booking.check_arrive(&actor)?;

    sqlx::query(
        "UPDATE bookings SET status = 'arrived', updated_at = now()
         WHERE id = $1 AND status = 'started'",
    )
    .bind(id)
    .execute(&state.pool)
    .await?;

    Ok(Json(json!({ "success": true, "detail": "Arrived at destination." })))
}

/// Completion settles the booking and its payment together: final_price is
/// frozen at the estimate and the payment is upserted to paid (method cash
/// when no payment was ever initiated). Both writes share one transaction.
pub async fn complete_booking(
    State(state): State<AppState>,
    Extension(actor): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>> {
    let booking = fetch_booking(&state, id).await?;
    match booking.check_complete(&actor)? {
        CompleteCheck::AlreadyCompleted => {
            return Ok(Json(json!({
                "success": true,
                "detail": "Booking is already completed."
            })));
        }
        CompleteCheck::Proceed => {}
    }

    let final_price = booking.estimated_price;

    let mut tx = state.pool.begin().await?;

    let completed = sqlx::query_as::<_, Booking>(
        "UPDATE bookings
         SET status = 'completed',
             completed_at = COALESCE(completed_at, now()),
             final_price = $2,
             updated_at = now()
         WHERE id = $1
         RETURNING *",
    )
    .bind(id)
    .bind(final_price)
    .fetch_one(&mut *tx)
    .await?;

    let payment_id: Uuid = sqlx::query_scalar(
        "INSERT INTO payments (booking_id, amount, status, payment_method, paid_at)
         VALUES ($1, $2, 'paid', 'cash', now())
         ON CONFLICT (booking_id) DO UPDATE
         SET amount = EXCLUDED.amount,
             status = 'paid',
             paid_at = COALESCE(payments.paid_at, now()),
             updated_at = now()
         RETURNING id",
    )
    .bind(id)
    .bind(final_price)
    .fetch_one(&mut *tx)
    .await?;

    log_transaction(
        &mut *tx,
        Some(payment_id),
        actions::BOOKING_COMPLETED,
        json!({ "booking_id": id, "final_price": final_price, "completed_by": actor.id }),
        "success",
        "",
    )
    .await?;

    tx.commit().await?;

    info!(booking_id = %id, "Booking completed and payment settled");
    state.emit(DomainEvent::BookingCompleted {
        booking_id: completed.id,
        customer_phone: completed.customer_phone.clone(),
        final_price,
    });

    Ok(Json(json!({
        "success": true,
        "detail": "Booking completed successfully. Invoice generated."
    })))
}

/// Admin override: assigns regardless of current driver; a pending booking
/// advances to accepted so the driver-null invariant holds.
pub async fn assign_driver(
    State(state): State<AppState>,
    Extension(actor): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(request): Json<AssignDriverRequest>,
) -> Result<Json<Value>> {
    if !actor.role.is_admin() {
        return Err(AppError::permission("Only admins can assign drivers."));
    }

    let booking = fetch_booking(&state, id).await?;
    if booking.status.is_terminal() {
        return Err(AppError::conflict(
            "Cannot assign a driver to a closed booking.",
        ));
    }

    sqlx::query(
        "UPDATE bookings
         SET driver_id = $2,
             status = CASE WHEN status = 'pending'
                           THEN 'accepted'::booking_status
                           ELSE status END,
             updated_at = now()
         WHERE id = $1",
    )
    .bind(id)
    .bind(request.driver_id)
    .execute(&state.pool)
    .await?;

    Ok(Json(json!({
        "success": true,
        "detail": "Driver successfully assigned to booking."
    })))
}

pub async fn rate_booking(
    State(state): State<AppState>,
    Extension(actor): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(request): Json<RateBookingRequest>,
) -> Result<Json<Value>> {
    request.validate()?;

    let booking = fetch_booking(&state, id).await?;
    booking.check_rate(&actor)?;
    let driver_id = booking
        .driver_id
        .ok_or_else(|| AppError::validation("Cannot rate a booking that had no driver assigned."))?;

    let already_rated: Option<i32> =
        sqlx::query_scalar("SELECT 1 FROM ratings WHERE booking_id = $1")
            .bind(id)
            .fetch_optional(&state.pool)
            .await?;
    if already_rated.is_some() {
        return Err(AppError::conflict("This booking has already been rated."));
    }

    sqlx::query(
        "INSERT INTO ratings (booking_id, customer_id, driver_id, score, comment)
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(id)
    .bind(actor.id)
    .bind(driver_id)
    .bind(request.score)
    .bind(&request.comment)
    .execute(&state.pool)
    .await?;

    Ok(Json(json!({ "success": true, "detail": "Thank you for your feedback!" })))
}

#[derive(Debug, Deserialize)]
pub struct PricingRequest {
    pub service_type: ServiceType,
    pub tank_size: TankSize,
}

/// Unauthenticated quote preview, usable before a booking exists.
pub async fn pricing_preview(Json(request): Json<PricingRequest>) -> Result<Json<Value>> {
    let quote = pricing::quote(request.service_type, request.tank_size);
    Ok(Json(to_value(quote)?))
}
