// hospital-messaging-core/src/handler.rs
use async_trait::async_trait;

use crate::{Delivery, MessagingError};

/// Broker-side settlement of one delivery.
#[async_trait]
pub trait Settle: Send + Sync {
    async fn ack(&self) -> Result<(), MessagingError>;
    async fn nack(&self, requeue: bool) -> Result<(), MessagingError>;
}

/// Settles exactly one delivery; consumed by `ack`/`nack`.
///
/// Dropping the handle without settling leaves the message outstanding: with
/// prefetch 1 its consumer receives nothing more until the session ends.
pub struct AckHandle {
    inner: Box<dyn Settle>,
}

impl AckHandle {
    pub fn new(inner: impl Settle + 'static) -> Self {
        Self {
            inner: Box::new(inner),
        }
    }

    pub async fn ack(self) -> Result<(), MessagingError> {
        self.inner.ack().await
    }

    pub async fn nack(self, requeue: bool) -> Result<(), MessagingError> {
        self.inner.nack(requeue).await
    }
}

impl std::fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckHandle").finish_non_exhaustive()
    }
}

/// Callback registered per binding. It owns the settlement of the message.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, delivery: Delivery, ack: AckHandle) -> Result<(), MessagingError>;
}
