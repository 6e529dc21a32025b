// services/sweeps.rs
//
// Housekeeping passes driven by a scheduler tick in main. Each pass is a
// standalone function so an operator endpoint or a one-off job can invoke
// it directly.
use std::time::Duration;
use tracing::{error, info};

use crate::errors::Result;
use crate::models::booking::Booking;
use crate::services::notifications::DomainEvent;
use crate::state::AppState;

const STALE_PENDING_HOURS: i32 = 24;
const ARCHIVE_AFTER_DAYS: i32 = 90;

/// Cancel bookings that sat pending for over 24 hours with no driver, and
/// tell the customer. Returns the number of bookings cancelled.
pub async fn auto_cancel_stale_pending(state: &AppState) -> Result<u64> {
    let cancelled = sqlx::query_as::<_, Booking>(
        "UPDATE bookings
         SET status = 'cancelled', updated_at = now()
         WHERE status = 'pending'
           AND driver_id IS NULL
           AND created_at < now() - make_interval(hours => $1)
         RETURNING *",
    )
    .bind(STALE_PENDING_HOURS)
    .fetch_all(&state.pool)
    .await?;

    for booking in &cancelled {
        state.emit(DomainEvent::BookingCancelled {
            booking_id: booking.id,
            customer_phone: booking.customer_phone.clone(),
        });
    }

    if !cancelled.is_empty() {
        info!("Auto-cancelled {} stale pending bookings", cancelled.len());
    }
    Ok(cancelled.len() as u64)
}

/// Soft-retention: completed bookings older than 90 days move to archived.
/// Nothing is deleted.
pub async fn archive_old_completed(state: &AppState) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE bookings
         SET status = 'archived', updated_at = now()
         WHERE status = 'completed'
           AND completed_at < now() - make_interval(days => $1)",
    )
    .bind(ARCHIVE_AFTER_DAYS)
    .execute(&state.pool)
    .await?;

    if result.rows_affected() > 0 {
        info!("Archived {} old completed bookings", result.rows_affected());
    }
    Ok(result.rows_affected())
}

/// Periodic driver for both sweeps. Failures are logged and the loop keeps
/// going; a broken sweep must not take the process down.
pub async fn run_scheduler(state: AppState, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if let Err(e) = auto_cancel_stale_pending(&state).await {
            error!("Stale-pending sweep failed: {}", e);
        }
        if let Err(e) = archive_old_completed(&state).await {
            error!("Archive sweep failed: {}", e);
        }
    }
}
