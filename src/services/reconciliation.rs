// services/reconciliation.rs
//
// Bridges the gateway's asynchronous outcomes back onto Payment and Booking.
// Both the callback path and the query fallback funnel through the same
// settle routine so the cascade (payment paid, booking accepted, confirmation
// event) cannot diverge between them.
use serde::Deserialize;
use serde_json::json;
use sqlx::{PgExecutor, Postgres, Transaction};
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::Result;
use crate::models::booking::Booking;
use crate::models::payment::{Payment, PaymentStatus};
use crate::models::transaction_log::actions;
use crate::services::mpesa_service::StkQueryResponse;
use crate::services::notifications::DomainEvent;
use crate::state::AppState;

/// Result codes the gateway uses when the payer abandoned the push.
const USER_CANCELLED_CODES: &[&str] = &["1031", "1032"];

// ===== Callback wire format =====

#[derive(Debug, Clone, Deserialize)]
pub struct StkCallbackEnvelope {
    #[serde(rename = "Body")]
    pub body: StkCallbackBody,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StkCallbackBody {
    #[serde(rename = "stkCallback")]
    pub stk_callback: StkCallback,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StkCallback {
    #[serde(rename = "MerchantRequestID")]
    pub merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,
    #[serde(rename = "ResultCode")]
    pub result_code: i64,
    #[serde(rename = "ResultDesc")]
    pub result_desc: String,
    #[serde(rename = "CallbackMetadata", default)]
    pub callback_metadata: Option<CallbackMetadata>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackMetadata {
    #[serde(rename = "Item")]
    pub items: Vec<CallbackItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackItem {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Value", default)]
    pub value: serde_json::Value,
}

impl StkCallback {
    pub fn is_success(&self) -> bool {
        self.result_code == 0
    }

    fn metadata_value(&self, name: &str) -> Option<&serde_json::Value> {
        self.callback_metadata
            .as_ref()?
            .items
            .iter()
            .find(|item| item.name == name)
            .map(|item| &item.value)
    }

    pub fn receipt_number(&self) -> Option<String> {
        self.metadata_value("MpesaReceiptNumber")
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }

    pub fn paid_amount(&self) -> Option<f64> {
        self.metadata_value("Amount").and_then(|v| v.as_f64())
    }

    pub fn payer_phone(&self) -> Option<String> {
        self.metadata_value("PhoneNumber").map(|v| match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

// ===== Audit trail =====

/// Append one audit row. Callers inside a transaction pass the transaction
/// so the log commits or rolls back with the state change it records.
pub async fn log_transaction<'e, E>(
    executor: E,
    payment_id: Option<Uuid>,
    action: &str,
    data: serde_json::Value,
    status: &str,
    error_message: &str,
) -> Result<()>
where
    E: PgExecutor<'e>,
{
    sqlx::query(
        "INSERT INTO transaction_logs (payment_id, action, data, status, error_message)
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(payment_id)
    .bind(action)
    .bind(data)
    .bind(status)
    .bind(error_message)
    .execute(executor)
    .await?;
    Ok(())
}

// ===== Matching =====

/// Correlate a callback to its payment: checkout_request_id first,
/// merchant_request_id as fallback.
pub async fn find_payment_by_correlation<'e, E>(
    executor: E,
    checkout_request_id: &str,
    merchant_request_id: &str,
) -> Result<Option<Payment>>
where
    E: PgExecutor<'e> + Copy,
{
    let by_checkout = sqlx::query_as::<_, Payment>(
        "SELECT * FROM payments WHERE checkout_request_id = $1 LIMIT 1",
    )
    .bind(checkout_request_id)
    .fetch_optional(executor)
    .await?;

    if by_checkout.is_some() {
        return Ok(by_checkout);
    }

    let by_merchant = sqlx::query_as::<_, Payment>(
        "SELECT * FROM payments WHERE merchant_request_id = $1 LIMIT 1",
    )
    .bind(merchant_request_id)
    .fetch_optional(executor)
    .await?;

    Ok(by_merchant)
}

// ===== Settlement cascade =====

/// Mark a payment paid and advance its booking if it was still waiting on
/// payment. paid_at is written with COALESCE so it is set exactly once.
/// Runs inside the caller's transaction.
pub async fn settle_payment(
    tx: &mut Transaction<'_, Postgres>,
    payment_id: Uuid,
    receipt: Option<&str>,
    notes: &str,
) -> Result<(Payment, Booking)> {
    let payment = sqlx::query_as::<_, Payment>(
        "UPDATE payments
         SET status = 'paid',
             mpesa_receipt = COALESCE($2, mpesa_receipt),
             notes = $3,
             paid_at = COALESCE(paid_at, now()),
             updated_at = now()
         WHERE id = $1
         RETURNING *",
    )
    .bind(payment_id)
    .bind(receipt)
    .bind(notes)
    .fetch_one(&mut **tx)
    .await?;

    let booking = sqlx::query_as::<_, Booking>(
        "UPDATE bookings
         SET status = CASE WHEN status IN ('pending', 'payment_pending')
                           THEN 'accepted'::booking_status
                           ELSE status END,
             updated_at = now()
         WHERE id = $1
         RETURNING *",
    )
    .bind(payment.booking_id)
    .fetch_one(&mut **tx)
    .await?;

    Ok((payment, booking))
}

// ===== Callback path =====

#[derive(Debug)]
pub enum ReconcileOutcome {
    Settled(Uuid),
    Failed(Uuid),
    Stale(Uuid),
    Unmatched,
}

/// Apply one gateway callback. Unmatched correlation IDs are logged and
/// reported as a no-op; the webhook handler acks the gateway either way,
/// since the gateway retries delivery on its own.
pub async fn process_callback(
    state: &AppState,
    callback: StkCallback,
) -> Result<ReconcileOutcome> {
    let payment = find_payment_by_correlation(
        &state.pool,
        &callback.checkout_request_id,
        &callback.merchant_request_id,
    )
    .await?;

    let Some(payment) = payment else {
        warn!(
            checkout_request_id = %callback.checkout_request_id,
            "No payment matches M-Pesa callback"
        );
        log_transaction(
            &state.pool,
            None,
            actions::MPESA_CALLBACK_UNMATCHED,
            json!({
                "checkout_request_id": callback.checkout_request_id,
                "merchant_request_id": callback.merchant_request_id,
                "result_code": callback.result_code,
            }),
            "no_match",
            "No payment found for correlation IDs",
        )
        .await?;
        return Ok(ReconcileOutcome::Unmatched);
    };

    if callback.is_success() {
        let receipt = callback.receipt_number();

        let mut tx = state.pool.begin().await?;
        let (payment, booking) = settle_payment(
            &mut tx,
            payment.id,
            receipt.as_deref(),
            &callback.result_desc,
        )
        .await?;
        log_transaction(
            &mut *tx,
            Some(payment.id),
            actions::MPESA_CALLBACK_PROCESSED,
            json!({
                "result_code": callback.result_code,
                "result_desc": callback.result_desc,
                "receipt": receipt,
                "amount": callback.paid_amount(),
                "phone": callback.payer_phone(),
            }),
            "success",
            "",
        )
        .await?;
        tx.commit().await?;

        info!(payment_id = %payment.id, "Payment settled via callback");
        state.emit(DomainEvent::PaymentSettled {
            booking_id: booking.id,
            customer_phone: booking.customer_phone.clone(),
            amount: payment.amount,
            receipt: payment.mpesa_receipt.clone(),
        });

        Ok(ReconcileOutcome::Settled(payment.id))
    } else {
        // Callbacks can arrive after manual verification or the query
        // fallback already settled the payment; those must not regress it.
        if !payment.status.accepts_gateway_failure() {
            warn!(
                payment_id = %payment.id,
                code = callback.result_code,
                "Ignoring failure callback for settled payment"
            );
            log_transaction(
                &state.pool,
                Some(payment.id),
                actions::MPESA_CALLBACK_PROCESSED,
                json!({
                    "result_code": callback.result_code,
                    "result_desc": callback.result_desc,
                }),
                "stale",
                "Failure callback arrived after settlement",
            )
            .await?;
            return Ok(ReconcileOutcome::Stale(payment.id));
        }

        let mut tx = state.pool.begin().await?;
        // Status guard repeated in SQL so a settle racing this branch
        // still cannot be overwritten.
        sqlx::query(
            "UPDATE payments
             SET status = 'failed', notes = $2, updated_at = now()
             WHERE id = $1 AND status <> 'paid'",
        )
        .bind(payment.id)
        .bind(&callback.result_desc)
        .execute(&mut *tx)
        .await?;
        log_transaction(
            &mut *tx,
            Some(payment.id),
            actions::MPESA_CALLBACK_PROCESSED,
            json!({
                "result_code": callback.result_code,
                "result_desc": callback.result_desc,
            }),
            "failed",
            &callback.result_desc,
        )
        .await?;
        tx.commit().await?;

        info!(payment_id = %payment.id, code = callback.result_code, "Payment failed via callback");
        Ok(ReconcileOutcome::Failed(payment.id))
    }
}

// ===== Query (pull) fallback =====

/// Classification of a gateway query response for a still-pending payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryVerdict {
    Settle,
    UserCancelled,
    StillInFlight,
}

pub fn classify_query(response: &StkQueryResponse) -> QueryVerdict {
    match response.result_code.as_deref() {
        Some("0") => QueryVerdict::Settle,
        Some(code) if USER_CANCELLED_CODES.contains(&code) => QueryVerdict::UserCancelled,
        // No result yet, or an ambiguous code: leave the payment pending for
        // the callback to resolve.
        _ => QueryVerdict::StillInFlight,
    }
}

/// Actively query the gateway for a pending payment and apply the verdict.
/// Only meaningful for payments that hold a correlation ID.
pub async fn reconcile_via_query(
    state: &AppState,
    payment: &Payment,
    response: &StkQueryResponse,
) -> Result<PaymentStatus> {
    match classify_query(response) {
        QueryVerdict::Settle => {
            let mut tx = state.pool.begin().await?;
            let (payment, booking) = settle_payment(
                &mut tx,
                payment.id,
                None,
                response.result_desc.as_deref().unwrap_or(""),
            )
            .await?;
            log_transaction(
                &mut *tx,
                Some(payment.id),
                actions::STK_QUERY_RECONCILED,
                json!({
                    "result_code": response.result_code,
                    "result_desc": response.result_desc,
                }),
                "success",
                "",
            )
            .await?;
            tx.commit().await?;

            info!(payment_id = %payment.id, "Payment settled via status query");
            state.emit(DomainEvent::PaymentSettled {
                booking_id: booking.id,
                customer_phone: booking.customer_phone.clone(),
                amount: payment.amount,
                receipt: payment.mpesa_receipt.clone(),
            });
            Ok(PaymentStatus::Paid)
        }
        QueryVerdict::UserCancelled => {
            let mut tx = state.pool.begin().await?;
            sqlx::query(
                "UPDATE payments
                 SET status = 'cancelled', cancelled_at = now(), notes = $2, updated_at = now()
                 WHERE id = $1",
            )
            .bind(payment.id)
            .bind(response.result_desc.as_deref().unwrap_or("Cancelled by user"))
            .execute(&mut *tx)
            .await?;
            log_transaction(
                &mut *tx,
                Some(payment.id),
                actions::STK_QUERY_RECONCILED,
                json!({
                    "result_code": response.result_code,
                    "result_desc": response.result_desc,
                }),
                "cancelled",
                "",
            )
            .await?;
            tx.commit().await?;
            Ok(PaymentStatus::Cancelled)
        }
        QueryVerdict::StillInFlight => Ok(payment.status),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn callback_json(result_code: i64, with_metadata: bool) -> serde_json::Value {
        let mut stk = json!({
            "MerchantRequestID": "req_123",
            "CheckoutRequestID": "chk_abc",
            "ResultCode": result_code,
            "ResultDesc": "The service request is processed successfully.",
        });
        if with_metadata {
            stk["CallbackMetadata"] = json!({
                "Item": [
                    {"Name": "Amount", "Value": 5000.0},
                    {"Name": "MpesaReceiptNumber", "Value": "QWE123"},
                    {"Name": "PhoneNumber", "Value": 254712345678u64},
                ]
            });
        }
        json!({"Body": {"stkCallback": stk}})
    }

    #[test]
    fn success_callback_parses_metadata() {
        let envelope: StkCallbackEnvelope =
            serde_json::from_value(callback_json(0, true)).unwrap();
        let cb = envelope.body.stk_callback;
        assert!(cb.is_success());
        assert_eq!(cb.checkout_request_id, "chk_abc");
        assert_eq!(cb.receipt_number().as_deref(), Some("QWE123"));
        assert_eq!(cb.paid_amount(), Some(5000.0));
        assert_eq!(cb.payer_phone().as_deref(), Some("254712345678"));
    }

    #[test]
    fn failure_callback_has_no_metadata() {
        let envelope: StkCallbackEnvelope =
            serde_json::from_value(callback_json(1032, false)).unwrap();
        let cb = envelope.body.stk_callback;
        assert!(!cb.is_success());
        assert!(cb.receipt_number().is_none());
        assert!(cb.paid_amount().is_none());
    }

    fn query_response(result_code: Option<&str>) -> StkQueryResponse {
        StkQueryResponse {
            response_code: "0".to_string(),
            response_description: "ok".to_string(),
            merchant_request_id: None,
            checkout_request_id: None,
            result_code: result_code.map(str::to_string),
            result_desc: None,
        }
    }

    #[test]
    fn query_classification() {
        assert_eq!(classify_query(&query_response(Some("0"))), QueryVerdict::Settle);
        assert_eq!(
            classify_query(&query_response(Some("1032"))),
            QueryVerdict::UserCancelled
        );
        assert_eq!(
            classify_query(&query_response(Some("1031"))),
            QueryVerdict::UserCancelled
        );
        // In-flight and unknown codes leave the payment untouched.
        assert_eq!(
            classify_query(&query_response(Some("1037"))),
            QueryVerdict::StillInFlight
        );
        assert_eq!(classify_query(&query_response(None)), QueryVerdict::StillInFlight);
    }

    #[test]
    fn settled_payment_ignores_failure_callbacks() {
        assert!(!PaymentStatus::Paid.accepts_gateway_failure());

        // Anything short of settlement may still fail.
        assert!(PaymentStatus::Pending.accepts_gateway_failure());
        assert!(PaymentStatus::Processing.accepts_gateway_failure());
        assert!(PaymentStatus::Failed.accepts_gateway_failure());
        assert!(PaymentStatus::Cancelled.accepts_gateway_failure());
    }
}
