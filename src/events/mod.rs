use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::entities::PaymentStatus;
use crate::services::billing::BillingService;

/// Events emitted by the fulfillment core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    OrderCreated(Uuid),
    OrderCancelled(Uuid),
    PaymentStatusChanged {
        order_id: Uuid,
        from: PaymentStatus,
        to: PaymentStatus,
    },
    PaymentCompleted(Uuid),
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously.
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }
}

/// Creates the event channel pair used to wire services to the worker.
pub fn channel(capacity: usize) -> (EventSender, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventSender::new(tx), rx)
}

/// Drains the event channel. Billing document issuance rides this worker,
/// decoupled from the transaction that confirms payment: an issuance failure
/// is logged and the partition stays pending for a later retry, never
/// affecting the recorded payment state.
pub async fn process_events(mut rx: mpsc::Receiver<Event>, billing: Arc<BillingService>) {
    while let Some(event) = rx.recv().await {
        match event {
            Event::PaymentCompleted(order_id) => {
                if let Err(e) = billing.issue_documents(order_id).await {
                    warn!(
                        order_id = %order_id,
                        error = %e,
                        "Billing issuance failed; partitions left pending"
                    );
                }
            }
            other => debug!(event = ?other, "event recorded"),
        }
    }
    debug!("Event channel closed; worker exiting");
}
