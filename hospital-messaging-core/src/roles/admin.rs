// hospital-messaging-core/src/roles/admin.rs
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::info;

use crate::bus::{self, Binding, Connector, ConsumerTask, Producer};
use crate::roles::{forward, EVENT_BUFFER};
use crate::routing::{INFO_KEY, SNIFF_ALL};
use crate::{AckHandle, Delivery, DeliveryHandler, MessageProperties, MessagingError, Observed};

struct SniffHandler {
    tx: mpsc::Sender<Observed>,
}

#[async_trait]
impl DeliveryHandler for SniffHandler {
    async fn handle(&self, delivery: Delivery, ack: AckHandle) -> Result<(), MessagingError> {
        let observed = Observed::from_delivery(&delivery);
        info!(routing_key = %observed.routing_key, "LOG: {observed}");
        forward(&self.tx, observed, "observed");
        ack.ack().await
    }
}

/// Sees every message on the exchange and broadcasts info to all workers.
///
/// The sniffing queue is private to this administrator, so it receives its
/// own copy of each message without taking anything away from other queues.
pub struct Administrator {
    producer: Arc<dyn Producer>,
    sniff_queue: String,
    observed_rx: Option<mpsc::Receiver<Observed>>,
    _sniffer: ConsumerTask,
}

impl Administrator {
    pub async fn connect(connector: &dyn Connector) -> Result<Self, MessagingError> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let mut consumer = connector.consumer().await?;
        let sniff_queue = consumer
            .bind(Binding::topic(SNIFF_ALL), Arc::new(SniffHandler { tx }))
            .await?;
        let sniffer = bus::spawn("admin.sniff", consumer);
        let producer = connector.producer().await?;

        info!(queue = %sniff_queue, "administrator connected");
        Ok(Self {
            producer,
            sniff_queue,
            observed_rx: Some(rx),
            _sniffer: sniffer,
        })
    }

    pub async fn broadcast(&self, message: &str) -> Result<(), MessagingError> {
        info!("sending info: {message}");
        self.producer
            .send(INFO_KEY, message, MessageProperties::default())
            .await
    }

    pub fn sniff_queue(&self) -> &str {
        &self.sniff_queue
    }

    /// Every message observed on the exchange. Can be taken once; until then
    /// only the first [`EVENT_BUFFER`] are kept.
    pub fn take_observed(&mut self) -> Option<mpsc::Receiver<Observed>> {
        self.observed_rx.take()
    }
}
