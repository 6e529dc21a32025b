use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "payment_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Processing,
    Paid,
    Failed,
    Cancelled,
    Refunded,
}

impl PaymentStatus {
    pub fn can_retry(self) -> bool {
        matches!(self, PaymentStatus::Failed | PaymentStatus::Cancelled)
    }

    /// A settled payment never regresses: late or duplicate failure
    /// deliveries from the gateway are ignored once it is paid.
    pub fn accepts_gateway_failure(self) -> bool {
        self != PaymentStatus::Paid
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "payment_method", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Mpesa,
    Cash,
    Card,
    Bank,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Payment {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub amount: Decimal,
    pub status: PaymentStatus,
    pub payment_method: PaymentMethod,
    pub mpesa_receipt: Option<String>,
    pub bank_reference: Option<String>,
    pub checkout_request_id: Option<String>,
    pub merchant_request_id: Option<String>,
    pub notes: String,
    pub paid_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancelled_by: Option<Uuid>,
    pub verified_by: Option<Uuid>,
    pub verified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ===== Request DTOs =====

#[derive(Debug, Deserialize, Validate)]
pub struct MpesaPaymentRequest {
    pub booking_id: Uuid,
    #[validate(length(min = 9, max = 15))]
    pub phone_number: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct RetryPaymentRequest {
    #[validate(length(min = 9, max = 15))]
    pub phone_number: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct BankTransferRequest {
    pub booking_id: Uuid,
    #[validate(length(min = 1, max = 50))]
    pub bank_reference: String,
}

#[derive(Debug, Deserialize)]
pub struct ManualVerifyRequest {
    pub payment_id: Uuid,
    pub mpesa_receipt: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PaymentListQuery {
    pub status: Option<PaymentStatus>,
}
