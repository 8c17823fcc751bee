pub mod orders;
pub mod payment_webhooks;
pub mod payments;

use std::sync::Arc;

use sea_orm::DatabaseConnection;

use crate::{
    clients::{billing_provider::BillingProvider, payment_gateway::PaymentGateway},
    config::AppConfig,
    events::EventSender,
    services::{billing::BillingService, orders::OrderService, payments::PaymentService},
};

/// Business services used by the HTTP handlers, constructed once at startup
/// with explicitly injected dependencies.
#[derive(Clone)]
pub struct AppServices {
    pub orders: Arc<OrderService>,
    pub payments: Arc<PaymentService>,
    pub billing: Arc<BillingService>,
}

impl AppServices {
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: AppConfig,
        event_sender: EventSender,
        gateway: Arc<dyn PaymentGateway>,
        billing_provider: Arc<dyn BillingProvider>,
    ) -> Self {
        Self {
            orders: Arc::new(OrderService::new(
                db.clone(),
                config,
                event_sender.clone(),
            )),
            payments: Arc::new(PaymentService::new(db.clone(), gateway, event_sender)),
            billing: Arc::new(BillingService::new(db, billing_provider)),
        }
    }
}
