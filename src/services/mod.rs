pub mod mpesa_service;
pub mod notifications;
pub mod pricing;
pub mod reconciliation;
pub mod sweeps;
