use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

use crate::config::AppConfig;
use crate::services::mpesa_service::MpesaGateway;
use crate::services::notifications::DomainEvent;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<AppConfig>,
    pub mpesa: Arc<MpesaGateway>,
    pub events: UnboundedSender<DomainEvent>,
}

impl AppState {
    pub fn new(
        pool: PgPool,
        config: Arc<AppConfig>,
        mpesa: Arc<MpesaGateway>,
        events: UnboundedSender<DomainEvent>,
    ) -> Self {
        AppState {
            pool,
            config,
            mpesa,
            events,
        }
    }

    /// Emitting an event must never fail the request it came from. A closed
    /// channel only means the dispatcher is gone, which we log and move on.
    pub fn emit(&self, event: DomainEvent) {
        if let Err(e) = self.events.send(event) {
            tracing::warn!("Event dispatcher unavailable, dropping event: {}", e);
        }
    }
}
