// hospital-messaging-core/src/roles/worker.rs
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::info;

use crate::bus::{self, Binding, Connector, ConsumerTask, Producer};
use crate::roles::{forward, EVENT_BUFFER};
use crate::routing::{INFO_KEY, LOG_KEY};
use crate::{AckHandle, Delivery, DeliveryHandler, MessageProperties, MessagingError};

/// Publishes notifications on the administrators' log key.
#[derive(Clone)]
pub struct LogNotifier {
    producer: Arc<dyn Producer>,
}

impl LogNotifier {
    pub async fn notify(&self, message: &str) -> Result<(), MessagingError> {
        self.producer
            .send(LOG_KEY, message, MessageProperties::default())
            .await
    }
}

struct InfoHandler {
    tx: mpsc::Sender<String>,
}

#[async_trait]
impl DeliveryHandler for InfoHandler {
    async fn handle(&self, delivery: Delivery, ack: AckHandle) -> Result<(), MessagingError> {
        info!(routing_key = %delivery.routing_key, "INFO: {}", delivery.body);
        forward(&self.tx, delivery.body, "info");
        ack.ack().await
    }
}

/// Capability shared by every worker: receives administrator broadcasts and
/// can send log notifications back.
pub struct HospitalWorker {
    name: String,
    producer: Arc<dyn Producer>,
    info_queue: String,
    info_rx: Option<mpsc::Receiver<String>>,
    _info_task: ConsumerTask,
}

impl HospitalWorker {
    pub async fn connect(
        connector: &dyn Connector,
        name: impl Into<String>,
    ) -> Result<Self, MessagingError> {
        let name = name.into();
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);

        let mut consumer = connector.consumer().await?;
        let info_queue = consumer
            .bind(Binding::topic(INFO_KEY), Arc::new(InfoHandler { tx }))
            .await?;
        let info_task = bus::spawn(format!("{name}.info"), consumer);
        let producer = connector.producer().await?;

        info!(worker = %name, queue = %info_queue, "worker connected");
        Ok(Self {
            name,
            producer,
            info_queue,
            info_rx: Some(rx),
            _info_task: info_task,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn info_queue(&self) -> &str {
        &self.info_queue
    }

    /// Fire-and-forget message to the administrators.
    pub async fn notify(&self, message: &str) -> Result<(), MessagingError> {
        self.notifier().notify(message).await
    }

    pub fn notifier(&self) -> LogNotifier {
        LogNotifier {
            producer: Arc::clone(&self.producer),
        }
    }

    /// Broadcast bodies received on the info key. Can be taken once; until
    /// then at most [`EVENT_BUFFER`] are kept.
    pub fn take_info_events(&mut self) -> Option<mpsc::Receiver<String>> {
        self.info_rx.take()
    }

    pub(crate) fn producer(&self) -> &Arc<dyn Producer> {
        &self.producer
    }
}
