use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

use crate::errors::{AppError, Result};
use crate::models::user::AuthUser;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "booking_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    PaymentPending,
    Accepted,
    Started,
    Arrived,
    Completed,
    Cancelled,
    Archived,
}

impl BookingStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BookingStatus::Completed | BookingStatus::Cancelled | BookingStatus::Archived
        )
    }

    /// States from which a driver completion is allowed.
    pub fn is_ongoing(self) -> bool {
        matches!(
            self,
            BookingStatus::Accepted | BookingStatus::Started | BookingStatus::Arrived
        )
    }

    /// States where no payment has settled yet and a successful payment
    /// should advance the booking to accepted.
    pub fn awaiting_payment(self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::PaymentPending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "service_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    Septic,
    PitLatrine,
    GreaseTrap,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "tank_size")]
pub enum TankSize {
    #[sqlx(rename = "1000")]
    #[serde(rename = "1000")]
    L1000,
    #[sqlx(rename = "2000")]
    #[serde(rename = "2000")]
    L2000,
    #[sqlx(rename = "3000")]
    #[serde(rename = "3000")]
    L3000,
    #[sqlx(rename = "5000")]
    #[serde(rename = "5000")]
    L5000,
    #[sqlx(rename = "10000")]
    #[serde(rename = "10000")]
    L10000,
}

impl TankSize {
    pub fn liters(self) -> u32 {
        match self {
            TankSize::L1000 => 1000,
            TankSize::L2000 => 2000,
            TankSize::L3000 => 3000,
            TankSize::L5000 => 5000,
            TankSize::L10000 => 10000,
        }
    }
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Booking {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub customer_phone: String,
    pub driver_id: Option<Uuid>,
    pub location_name: String,
    pub address: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub service_type: ServiceType,
    pub tank_size: TankSize,
    pub special_instructions: String,
    pub scheduled_date: DateTime<Utc>,
    pub estimated_price: Decimal,
    pub final_price: Option<Decimal>,
    pub status: BookingStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Booking {
    /// accept: driver or admin, booking still pending, and not already
    /// claimed by a different driver.
    pub fn check_accept(&self, actor: &AuthUser) -> Result<()> {
        if !(actor.role.is_driver() || actor.role.is_admin()) {
            return Err(AppError::permission(
                "Only drivers or admins can accept bookings.",
            ));
        }
        if self.status != BookingStatus::Pending {
            return Err(AppError::conflict("Booking cannot be accepted."));
        }
        if let Some(driver_id) = self.driver_id {
            if driver_id != actor.id {
                return Err(AppError::conflict(
                    "Booking already assigned to another driver.",
                ));
            }
        }
        Ok(())
    }

    pub fn check_start(&self, actor: &AuthUser) -> Result<()> {
        if self.driver_id != Some(actor.id) {
            return Err(AppError::permission("Not your job."));
        }
        if self.status != BookingStatus::Accepted {
            return Err(AppError::conflict("Job must be accepted before starting."));
        }
        Ok(())
    }

    pub fn check_arrive(&self, actor: &AuthUser) -> Result<()> {
        if self.driver_id != Some(actor.id) {
            return Err(AppError::permission("Not your job."));
        }
        if self.status != BookingStatus::Started {
            return Err(AppError::conflict("Job must be started before arrival."));
        }
        Ok(())
    }

    /// complete: assigned driver or admin, from any ongoing state. A booking
    /// that is already completed is reported separately so the handler can
    /// answer with an idempotent success.
    pub fn check_complete(&self, actor: &AuthUser) -> Result<CompleteCheck> {
        if self.status == BookingStatus::Completed {
            return Ok(CompleteCheck::AlreadyCompleted);
        }
        if !self.status.is_ongoing() {
            return Err(AppError::conflict(
                "Only ongoing bookings can be completed.",
            ));
        }
        if self.driver_id != Some(actor.id) && !actor.role.is_admin() {
            return Err(AppError::permission(
                "Only assigned driver or admin can complete booking.",
            ));
        }
        Ok(CompleteCheck::Proceed)
    }

    pub fn check_rate(&self, actor: &AuthUser) -> Result<()> {
        if self.customer_id != actor.id {
            return Err(AppError::permission(
                "Only the customer who made the booking can rate it.",
            ));
        }
        if self.status != BookingStatus::Completed {
            return Err(AppError::conflict("You can only rate completed bookings."));
        }
        if self.driver_id.is_none() {
            return Err(AppError::validation(
                "Cannot rate a booking that had no driver assigned.",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteCheck {
    Proceed,
    AlreadyCompleted,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Rating {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub customer_id: Uuid,
    pub driver_id: Uuid,
    pub score: i32,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ===== Request DTOs =====

#[derive(Debug, Deserialize, Validate)]
pub struct CreateBookingRequest {
    #[validate(length(min = 1, max = 255))]
    pub location_name: String,
    pub address: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub service_type: ServiceType,
    pub tank_size: TankSize,
    #[serde(default)]
    pub special_instructions: String,
    pub scheduled_date: DateTime<Utc>,
    pub estimated_price: Option<Decimal>,
    #[validate(length(min = 9, max = 15))]
    pub customer_phone: String,
}

#[derive(Debug, Deserialize)]
pub struct AssignDriverRequest {
    pub driver_id: Uuid,
}

#[derive(Debug, Deserialize, Validate)]
pub struct RateBookingRequest {
    #[validate(range(min = 1, max = 5))]
    pub score: i32,
    pub comment: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::user::Role;

    fn booking(status: BookingStatus, driver_id: Option<Uuid>) -> Booking {
        Booking {
            id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            customer_phone: "0712345678".to_string(),
            driver_id,
            location_name: "Kasarani".to_string(),
            address: None,
            latitude: -1.22,
            longitude: 36.9,
            service_type: ServiceType::Septic,
            tank_size: TankSize::L1000,
            special_instructions: String::new(),
            scheduled_date: Utc::now(),
            estimated_price: Decimal::from(5000),
            final_price: None,
            status,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            completed_at: None,
        }
    }

    fn user(role: Role) -> AuthUser {
        AuthUser {
            id: Uuid::new_v4(),
            role,
            phone: None,
        }
    }

    #[test]
    fn driver_can_accept_pending_unassigned() {
        let b = booking(BookingStatus::Pending, None);
        assert!(b.check_accept(&user(Role::Driver)).is_ok());
    }

    #[test]
    fn customer_cannot_accept() {
        let b = booking(BookingStatus::Pending, None);
        assert!(matches!(
            b.check_accept(&user(Role::Customer)),
            Err(AppError::Permission(_))
        ));
    }

    #[test]
    fn second_driver_gets_conflict() {
        let first = user(Role::Driver);
        let b = booking(BookingStatus::Pending, Some(first.id));
        let second = user(Role::Driver);
        assert!(matches!(
            b.check_accept(&second),
            Err(AppError::Conflict(_))
        ));
        // the original claimant may still re-accept
        assert!(b.check_accept(&first).is_ok());
    }

    #[test]
    fn accept_requires_pending_state() {
        let b = booking(BookingStatus::Accepted, None);
        assert!(matches!(
            b.check_accept(&user(Role::Driver)),
            Err(AppError::Conflict(_))
        ));
    }

    #[test]
    fn start_and_arrive_enforce_sequence_and_assignment() {
        let driver = user(Role::Driver);
        let mut b = booking(BookingStatus::Accepted, Some(driver.id));
        assert!(b.check_start(&driver).is_ok());
        assert!(matches!(b.check_arrive(&driver), Err(AppError::Conflict(_))));

        b.status = BookingStatus::Started;
        assert!(b.check_arrive(&driver).is_ok());

        let stranger = user(Role::Driver);
        assert!(matches!(
            b.check_start(&stranger),
            Err(AppError::Permission(_))
        ));
    }

    #[test]
    fn complete_is_idempotent_and_admin_can_force() {
        let driver = user(Role::Driver);
        let mut b = booking(BookingStatus::Arrived, Some(driver.id));
        assert_eq!(b.check_complete(&driver).unwrap(), CompleteCheck::Proceed);
        assert_eq!(
            b.check_complete(&user(Role::Admin)).unwrap(),
            CompleteCheck::Proceed
        );

        b.status = BookingStatus::Completed;
        assert_eq!(
            b.check_complete(&driver).unwrap(),
            CompleteCheck::AlreadyCompleted
        );

        b.status = BookingStatus::Pending;
        assert!(matches!(
            b.check_complete(&driver),
            Err(AppError::Conflict(_))
        ));
    }

    #[test]
    fn rating_requires_completion_and_driver() {
        let driver = user(Role::Driver);
        let mut b = booking(BookingStatus::Completed, Some(driver.id));
        let customer = AuthUser {
            id: b.customer_id,
            role: Role::Customer,
            phone: None,
        };
        assert!(b.check_rate(&customer).is_ok());

        b.driver_id = None;
        assert!(matches!(
            b.check_rate(&customer),
            Err(AppError::Validation(_))
        ));

        b.driver_id = Some(driver.id);
        b.status = BookingStatus::Started;
        assert!(matches!(b.check_rate(&customer), Err(AppError::Conflict(_))));

        assert!(matches!(
            b.check_rate(&user(Role::Customer)),
            Err(AppError::Permission(_))
        ));
    }

    #[test]
    fn driver_null_only_while_awaiting_payment() {
        assert!(BookingStatus::Pending.awaiting_payment());
        assert!(BookingStatus::PaymentPending.awaiting_payment());
        assert!(!BookingStatus::Accepted.awaiting_payment());
    }
}
