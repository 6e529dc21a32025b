pub mod booking_handlers;
pub mod payment_handlers;
pub mod webhook_handlers;
