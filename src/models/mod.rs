pub mod booking;
pub mod payment;
pub mod transaction_log;
pub mod user;
