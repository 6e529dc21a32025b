// Action tags for the transaction_logs audit table. Rows are only ever
// inserted; the audit contract is that no payment state change happens
// without one.
pub mod actions {
    pub const STK_PUSH_INITIATED: &str = "stk_push_initiated";
    pub const BOOKING_COMPLETED: &str = "booking_completed_settlement";
    pub const STK_PUSH_FAILED: &str = "stk_push_failed";
    pub const PAYMENT_RETRY: &str = "payment_retry";
    pub const PAYMENT_CANCELLED: &str = "payment_cancelled";
    pub const BANK_TRANSFER_SUBMITTED: &str = "bank_transfer_submitted";
    pub const MANUAL_VERIFICATION: &str = "manual_verification";
    pub const MPESA_CALLBACK_RECEIVED: &str = "mpesa_callback_received";
    pub const MPESA_CALLBACK_PROCESSED: &str = "mpesa_callback_processed";
    pub const MPESA_CALLBACK_UNMATCHED: &str = "mpesa_callback_unmatched";
    pub const STK_QUERY_RECONCILED: &str = "stk_query_reconciled";
    pub const C2B_VALIDATION: &str = "c2b_validation";
    pub const C2B_CONFIRMATION: &str = "c2b_confirmation";
}
