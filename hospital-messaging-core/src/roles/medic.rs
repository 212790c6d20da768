// hospital-messaging-core/src/roles/medic.rs
//! Requester side: publishes examination requests and matches results to
//! them through correlation ids.
//!
//! ```text
//! request()  ── insert id ──► pending set ◄── retire id ── reply consumer
//!     │                                                        ▲
//!     └── specialist.<kind> ──► Specialist ── reply_to queue ──┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{self, Binding, Connector, ConsumerTask};
use crate::pending::{PendingRequests, ReplyOutcome};
use crate::roles::worker::HospitalWorker;
use crate::routing::{request_key, Specialization};
use crate::roles::{forward, EVENT_BUFFER};
use crate::{
    AckHandle, CorrelationId, Delivery, DeliveryHandler, MessageProperties, MessagingError,
};

#[derive(Debug, Clone)]
pub struct MedicOptions {
    /// Outstanding requests older than this are dropped as orphans.
    /// `None` keeps them forever.
    pub pending_ttl: Option<Duration>,
    pub sweep_interval: Duration,
}

impl Default for MedicOptions {
    fn default() -> Self {
        Self {
            pending_ttl: None,
            sweep_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MedicEvent {
    /// Results for a request this medic was waiting on.
    Result {
        id: CorrelationId,
        subject: String,
        kind: Specialization,
        body: String,
    },
    /// Reply whose id is not pending here (duplicate, stale or foreign).
    Ignored { id: CorrelationId, body: String },
    /// Request given up by the expiry sweep.
    Expired {
        id: CorrelationId,
        subject: String,
        kind: Specialization,
    },
}

struct ReplyHandler {
    pending: Arc<PendingRequests>,
    tx: mpsc::Sender<MedicEvent>,
}

#[async_trait]
impl DeliveryHandler for ReplyHandler {
    async fn handle(&self, delivery: Delivery, ack: AckHandle) -> Result<(), MessagingError> {
        let event = match delivery.correlation_id() {
            None => {
                warn!(
                    queue = %delivery.queue,
                    "reply without correlation id dropped: {}", delivery.body
                );
                None
            }
            Some(id) => match self.pending.retire(id) {
                ReplyOutcome::Retired(entry) => {
                    info!(correlation_id = %id.short(), "received results: {}", delivery.body);
                    Some(MedicEvent::Result {
                        id: id.clone(),
                        subject: entry.subject,
                        kind: entry.kind,
                        body: delivery.body.clone(),
                    })
                }
                ReplyOutcome::Unknown => {
                    debug!(correlation_id = %id.short(), "ignoring reply for unknown request");
                    Some(MedicEvent::Ignored {
                        id: id.clone(),
                        body: delivery.body.clone(),
                    })
                }
            },
        };
        if let Some(event) = event {
            forward(&self.tx, event, "medic");
        }
        ack.ack().await
    }
}

/// Splits a front-end line `<subject> <kind>` and checks the kind against
/// `accepted`.
pub fn parse_request_line(
    line: &str,
    accepted: &[Specialization],
) -> Result<(String, Specialization), MessagingError> {
    let usage = || {
        let kinds: Vec<&str> = accepted.iter().map(Specialization::as_str).collect();
        MessagingError::Malformed(format!(
            "expected input: <subject> <{}>",
            kinds.join(" | ")
        ))
    };
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let [subject, kind] = tokens.as_slice() else {
        return Err(usage());
    };
    let kind = accepted
        .iter()
        .find(|k| k.as_str() == *kind)
        .cloned()
        .ok_or_else(usage)?;
    Ok((subject.to_string(), kind))
}

pub struct Medic {
    worker: HospitalWorker,
    reply_queue: String,
    pending: Arc<PendingRequests>,
    events: Option<mpsc::Receiver<MedicEvent>>,
    _replies: ConsumerTask,
    sweeper: Option<JoinHandle<()>>,
}

impl Medic {
    pub async fn connect(
        connector: &dyn Connector,
        options: MedicOptions,
    ) -> Result<Self, MessagingError> {
        let worker = HospitalWorker::connect(connector, "medic").await?;
        let pending = Arc::new(PendingRequests::new());
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);

        let mut consumer = connector.consumer().await?;
        let reply_queue = consumer
            .bind(
                Binding::reply_queue(),
                Arc::new(ReplyHandler {
                    pending: Arc::clone(&pending),
                    tx: tx.clone(),
                }),
            )
            .await?;
        let replies = bus::spawn("medic.replies", consumer);

        let sweeper = options
            .pending_ttl
            .map(|ttl| spawn_sweeper(Arc::clone(&pending), ttl, options.sweep_interval, tx));

        info!(queue = %reply_queue, "medic connected");
        Ok(Self {
            worker,
            reply_queue,
            pending,
            events: Some(rx),
            _replies: replies,
            sweeper,
        })
    }

    /// Publishes a request for `subject` to the processors of `kind`.
    ///
    /// The id is recorded before the request becomes visible on the
    /// exchange, so a reply can never overtake its own bookkeeping.
    pub async fn request(
        &self,
        subject: &str,
        kind: &Specialization,
    ) -> Result<CorrelationId, MessagingError> {
        if subject.trim().is_empty() {
            return Err(MessagingError::Malformed("request subject is empty".into()));
        }
        let id = CorrelationId::generate();
        let routing_key = request_key(kind);
        let body = format!("{subject} {kind}");
        let properties = MessageProperties::default()
            .with_reply_to(self.reply_queue.clone())
            .with_correlation_id(id.clone());

        self.pending.insert(id.clone(), subject, kind);
        if let Err(e) = self
            .worker
            .producer()
            .send(&routing_key, &body, properties)
            .await
        {
            self.pending.retire(&id);
            return Err(e);
        }

        info!(correlation_id = %id.short(), routing_key = %routing_key, "sending request: {body}");
        Ok(id)
    }

    pub async fn notify(&self, message: &str) -> Result<(), MessagingError> {
        self.worker.notify(message).await
    }

    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, id: &CorrelationId) -> bool {
        self.pending.contains(id)
    }

    pub fn worker(&self) -> &HospitalWorker {
        &self.worker
    }

    pub fn worker_mut(&mut self) -> &mut HospitalWorker {
        &mut self.worker
    }

    /// Reply and expiry events. Can be taken once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<MedicEvent>> {
        self.events.take()
    }
}

impl Drop for Medic {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

fn spawn_sweeper(
    pending: Arc<PendingRequests>,
    ttl: Duration,
    every: Duration,
    tx: mpsc::Sender<MedicEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            for (id, entry) in pending.sweep_expired(ttl) {
                warn!(
                    correlation_id = %id.short(),
                    subject = %entry.subject,
                    "request expired without results"
                );
                let event = MedicEvent::Expired {
                    id,
                    subject: entry.subject,
                    kind: entry.kind,
                };
                forward(&tx, event, "medic");
            }
        }
    })
}
