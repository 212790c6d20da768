// hospital-messaging-core/src/roles/specialist.rs
use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::bus::{self, Binding, Connector, ConsumerTask, Producer};
use crate::roles::worker::{HospitalWorker, LogNotifier};
use crate::routing::{request_key, Specialization};
use crate::roles::{forward, EVENT_BUFFER};
use crate::{
    AckHandle, CorrelationId, Delivery, DeliveryHandler, MessageProperties, MessagingError,
};

/// Which queue a specialization is consumed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueSharing {
    /// One queue per specialization, named after it; specialists bound to the
    /// same name compete for its requests.
    #[default]
    Shared,
    /// A private queue per specialist; every instance gets its own copy.
    PerInstance,
}

#[derive(Debug, Clone)]
pub struct SpecialistOptions {
    pub specializations: Vec<Specialization>,
    pub queue_sharing: QueueSharing,
    /// Simulated examination time, drawn uniformly per request.
    pub processing_delay: RangeInclusive<Duration>,
}

impl SpecialistOptions {
    pub fn new(specializations: Vec<Specialization>) -> Self {
        Self {
            specializations,
            queue_sharing: QueueSharing::default(),
            processing_delay: Duration::from_secs(1)..=Duration::from_secs(5),
        }
    }

    pub fn with_queue_sharing(mut self, sharing: QueueSharing) -> Self {
        self.queue_sharing = sharing;
        self
    }

    pub fn with_processing_delay(mut self, delay: RangeInclusive<Duration>) -> Self {
        self.processing_delay = delay;
        self
    }

    pub fn validate(&self) -> Result<(), MessagingError> {
        if self.specializations.is_empty() {
            return Err(MessagingError::Config(
                "a specialist needs at least one specialization".into(),
            ));
        }
        let mut seen = HashSet::new();
        for kind in &self.specializations {
            if !seen.insert(kind) {
                return Err(MessagingError::Config(format!(
                    "specialization {kind} listed twice"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpecialistEvent {
    Processed {
        id: CorrelationId,
        request: String,
        reply_to: String,
    },
    /// Request without the metadata needed to answer it; acked and dropped.
    Dropped { request: String, reason: &'static str },
}

fn draw_delay(range: &RangeInclusive<Duration>) -> Duration {
    let lo = range.start().as_millis() as u64;
    let hi = range.end().as_millis() as u64;
    if hi <= lo {
        return Duration::from_millis(lo);
    }
    Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
}

struct RequestHandler {
    producer: Arc<dyn Producer>,
    notifier: LogNotifier,
    delay: RangeInclusive<Duration>,
    tx: mpsc::Sender<SpecialistEvent>,
}

impl RequestHandler {
    async fn drop_malformed(
        &self,
        delivery: Delivery,
        ack: AckHandle,
        reason: &'static str,
    ) -> Result<(), MessagingError> {
        warn!(routing_key = %delivery.routing_key, reason, "dropping request: {}", delivery.body);
        let event = SpecialistEvent::Dropped {
            request: delivery.body,
            reason,
        };
        forward(&self.tx, event, "specialist");
        ack.ack().await
    }
}

#[async_trait]
impl DeliveryHandler for RequestHandler {
    async fn handle(&self, delivery: Delivery, ack: AckHandle) -> Result<(), MessagingError> {
        let Some(reply_to) = delivery.reply_to().map(str::to_string) else {
            return self.drop_malformed(delivery, ack, "missing reply_to").await;
        };
        let Some(id) = delivery.correlation_id().cloned() else {
            return self.drop_malformed(delivery, ack, "missing correlation_id").await;
        };

        let delay = draw_delay(&self.delay);
        info!(correlation_id = %id.short(), ?delay, "processing request: {}", delivery.body);
        tokio::time::sleep(delay).await;

        let reply = format!("{} done", delivery.body);
        let properties = MessageProperties::default().with_correlation_id(id.clone());
        if let Err(e) = self.producer.send(&reply_to, &reply, properties).await {
            error!(correlation_id = %id.short(), "reply not published, requeueing request: {e}");
            ack.nack(true).await?;
            return Err(e);
        }
        if let Err(e) = self.notifier.notify(&reply).await {
            warn!(correlation_id = %id.short(), "log notification failed: {e}");
        }

        let event = SpecialistEvent::Processed {
            id,
            request: delivery.body,
            reply_to,
        };
        forward(&self.tx, event, "specialist");
        ack.ack().await
    }
}

/// Processor side: answers requests for its specializations.
pub struct Specialist {
    worker: HospitalWorker,
    specializations: Vec<Specialization>,
    queues: Vec<String>,
    events: Option<mpsc::Receiver<SpecialistEvent>>,
    _requests: ConsumerTask,
}

impl Specialist {
    pub async fn connect(
        connector: &dyn Connector,
        options: SpecialistOptions,
    ) -> Result<Self, MessagingError> {
        options.validate()?;
        let worker = HospitalWorker::connect(connector, "specialist").await?;
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let handler = Arc::new(RequestHandler {
            producer: Arc::clone(worker.producer()),
            notifier: worker.notifier(),
            delay: options.processing_delay.clone(),
            tx,
        });

        let mut consumer = connector.consumer().await?;
        let mut queues = Vec::with_capacity(options.specializations.len());
        for kind in &options.specializations {
            let pattern = request_key(kind);
            let binding = match options.queue_sharing {
                QueueSharing::Shared => Binding::shared(pattern, kind.as_str()),
                QueueSharing::PerInstance => Binding::topic(pattern),
            };
            let queue = consumer.bind(binding, handler.clone()).await?;
            info!(specialization = %kind, queue = %queue, "listening for requests");
            queues.push(queue);
        }
        let requests = bus::spawn("specialist.requests", consumer);

        Ok(Self {
            worker,
            specializations: options.specializations,
            queues,
            events: Some(rx),
            _requests: requests,
        })
    }

    pub fn specializations(&self) -> &[Specialization] {
        &self.specializations
    }

    /// Request queues, in the order of the specializations.
    pub fn queues(&self) -> &[String] {
        &self.queues
    }

    pub async fn notify(&self, message: &str) -> Result<(), MessagingError> {
        self.worker.notify(message).await
    }

    pub fn worker(&self) -> &HospitalWorker {
        &self.worker
    }

    pub fn worker_mut(&mut self) -> &mut HospitalWorker {
        &mut self.worker
    }

    pub fn take_events(&mut self) -> Option<mpsc::Receiver<SpecialistEvent>> {
        self.events.take()
    }
}
