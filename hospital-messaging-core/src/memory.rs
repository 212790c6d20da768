// hospital-messaging-core/src/memory.rs
//! In-process topic exchange implementing the bus contracts.
//!
//! Routing follows the broker: a message is copied once into every queue with
//! at least one matching binding, anonymous queues belong to the session that
//! declared them and vanish with it, named queues are shared and their
//! consumers compete. A consumer holds at most one unsettled delivery per
//! queue; an unsettled queue stalls without holding up the session's others.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::{Binding, Connector, Consumer, Producer, QueueName};
use crate::routing::{matches, validate_pattern};
use crate::{AckHandle, Delivery, DeliveryHandler, MessageProperties, MessagingError, Settle};

#[derive(Debug, Clone)]
struct Envelope {
    routing_key: String,
    body: String,
    properties: MessageProperties,
    redelivered: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Envelope>,
    exclusive_owner: Option<u64>,
}

#[derive(Debug, Default)]
struct ExchangeState {
    queues: HashMap<String, QueueState>,
    /// (pattern, queue)
    bindings: Vec<(String, String)>,
    closed: bool,
}

#[derive(Debug)]
struct Shared {
    name: String,
    state: Mutex<ExchangeState>,
    notify: Notify,
    next_session: AtomicU64,
}

impl Shared {
    fn closed(&self) -> MessagingError {
        MessagingError::Connection(format!("exchange {} is closed", self.name))
    }

    fn ensure_open(&self) -> Result<(), MessagingError> {
        if self.state.lock().closed {
            return Err(self.closed());
        }
        Ok(())
    }

    fn publish(&self, envelope: Envelope) -> Result<usize, MessagingError> {
        let routed = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(self.closed());
            }
            let mut targets: Vec<String> = state
                .bindings
                .iter()
                .filter(|(pattern, _)| matches(pattern, &envelope.routing_key))
                .map(|(_, queue)| queue.clone())
                .collect();
            targets.sort();
            targets.dedup();
            for queue in &targets {
                if let Some(q) = state.queues.get_mut(queue) {
                    q.ready.push_back(envelope.clone());
                }
            }
            targets.len()
        };
        if routed == 0 {
            debug!(
                exchange = %self.name,
                routing_key = %envelope.routing_key,
                "message unroutable, dropped"
            );
        }
        self.notify.notify_waiters();
        Ok(routed)
    }

    fn requeue(&self, queue: &str, mut envelope: Envelope) {
        envelope.redelivered = true;
        if let Some(q) = self.state.lock().queues.get_mut(queue) {
            q.ready.push_front(envelope);
        }
        self.notify.notify_waiters();
    }
}

/// Cloneable handle on one in-process exchange.
#[derive(Debug, Clone)]
pub struct MemoryExchange {
    shared: Arc<Shared>,
}

impl Default for MemoryExchange {
    fn default() -> Self {
        Self::new("hospital")
    }
}

impl MemoryExchange {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                state: Mutex::new(ExchangeState::default()),
                notify: Notify::new(),
                next_session: AtomicU64::new(1),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Simulates losing the broker: every session fails from now on.
    pub fn close(&self) {
        self.shared.state.lock().closed = true;
        self.shared.notify.notify_waiters();
    }

    /// Messages waiting in `queue`, not counting one held by a consumer.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.shared.state.lock().queues.get(queue).map(|q| q.ready.len())
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.shared.state.lock().queues.contains_key(queue)
    }

    /// Patterns currently bound to `queue`.
    pub fn bindings_of(&self, queue: &str) -> Vec<String> {
        self.shared
            .state
            .lock()
            .bindings
            .iter()
            .filter(|(_, q)| q == queue)
            .map(|(p, _)| p.clone())
            .collect()
    }
}

#[async_trait]
impl Connector for MemoryExchange {
    async fn producer(&self) -> Result<Arc<dyn Producer>, MessagingError> {
        self.shared.ensure_open()?;
        Ok(Arc::new(MemoryProducer {
            shared: Arc::clone(&self.shared),
        }))
    }

    async fn consumer(&self) -> Result<Box<dyn Consumer>, MessagingError> {
        self.shared.ensure_open()?;
        Ok(Box::new(MemoryConsumer {
            id: self.shared.next_session.fetch_add(1, Ordering::Relaxed),
            shared: Arc::clone(&self.shared),
            handlers: Vec::new(),
            owned: Vec::new(),
            cursor: 0,
            outstanding: HashMap::new(),
        }))
    }
}

pub struct MemoryProducer {
    shared: Arc<Shared>,
}

#[async_trait]
impl Producer for MemoryProducer {
    async fn send(
        &self,
        routing_key: &str,
        body: &str,
        properties: MessageProperties,
    ) -> Result<(), MessagingError> {
        self.shared.publish(Envelope {
            routing_key: routing_key.to_string(),
            body: body.to_string(),
            properties,
            redelivered: false,
        })?;
        Ok(())
    }
}

#[derive(Debug)]
enum Settlement {
    Ack,
    Nack { requeue: bool },
}

struct MemoryAcker {
    shared: Arc<Shared>,
    tx: Mutex<Option<oneshot::Sender<Settlement>>>,
}

impl MemoryAcker {
    fn settle(&self, settlement: Settlement) -> Result<(), MessagingError> {
        let tx = self
            .tx
            .lock()
            .take()
            .ok_or_else(|| MessagingError::Handler("delivery already settled".into()))?;
        let sent = tx
            .send(settlement)
            .map_err(|_| MessagingError::Connection("consumer session closed".into()));
        self.shared.notify.notify_waiters();
        sent
    }
}

#[async_trait]
impl Settle for MemoryAcker {
    async fn ack(&self) -> Result<(), MessagingError> {
        self.settle(Settlement::Ack)
    }

    async fn nack(&self, requeue: bool) -> Result<(), MessagingError> {
        self.settle(Settlement::Nack { requeue })
    }
}

/// A delivery handed to a callback and not settled yet. Its queue gets
/// nothing else from this session until it is.
struct Outstanding {
    envelope: Envelope,
    /// `None` once the handle was dropped unsettled.
    settlement: Option<oneshot::Receiver<Settlement>>,
}

pub struct MemoryConsumer {
    id: u64,
    shared: Arc<Shared>,
    handlers: Vec<(String, Arc<dyn DeliveryHandler>)>,
    /// Anonymous queues declared by this session.
    owned: Vec<String>,
    cursor: usize,
    outstanding: HashMap<String, Outstanding>,
}

impl MemoryConsumer {
    /// Applies every settlement that arrived since the last look.
    fn collect_settlements(&mut self) {
        let mut requeue = Vec::new();
        self.outstanding.retain(|queue, out| {
            let Some(rx) = out.settlement.as_mut() else {
                return true;
            };
            match rx.try_recv() {
                Ok(Settlement::Ack) | Ok(Settlement::Nack { requeue: false }) => false,
                Ok(Settlement::Nack { requeue: true }) => {
                    requeue.push((queue.clone(), out.envelope.clone()));
                    false
                }
                Err(TryRecvError::Empty) => true,
                Err(TryRecvError::Closed) => {
                    warn!(
                        queue = %queue,
                        "delivery left unacknowledged; queue stalled until the session ends"
                    );
                    out.settlement = None;
                    true
                }
            }
        });
        for (queue, envelope) in requeue {
            self.shared.requeue(&queue, envelope);
        }
    }

    async fn next_delivery(
        &mut self,
    ) -> Result<(String, Envelope, Arc<dyn DeliveryHandler>), MessagingError> {
        let shared = Arc::clone(&self.shared);
        loop {
            let notified = shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            self.collect_settlements();
            {
                let mut state = shared.state.lock();
                if state.closed {
                    return Err(shared.closed());
                }
                let n = self.handlers.len();
                for step in 0..n {
                    let idx = (self.cursor + step) % n;
                    let (queue, handler) = &self.handlers[idx];
                    if self.outstanding.contains_key(queue) {
                        continue;
                    }
                    if let Some(envelope) = state
                        .queues
                        .get_mut(queue)
                        .and_then(|q| q.ready.pop_front())
                    {
                        self.cursor = idx + 1;
                        return Ok((queue.clone(), envelope, Arc::clone(handler)));
                    }
                }
            }
            notified.await;
        }
    }
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn bind(
        &mut self,
        binding: Binding,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<String, MessagingError> {
        if let Some(pattern) = &binding.pattern {
            validate_pattern(pattern)?;
        }
        let queue = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(self.shared.closed());
            }
            let queue = match binding.queue {
                QueueName::Anonymous => {
                    let name = format!("amq.gen-{}", Uuid::new_v4().simple());
                    state.queues.insert(
                        name.clone(),
                        QueueState {
                            exclusive_owner: Some(self.id),
                            ..QueueState::default()
                        },
                    );
                    self.owned.push(name.clone());
                    name
                }
                QueueName::Named(name) => {
                    let q = state.queues.entry(name.clone()).or_default();
                    if q.exclusive_owner.is_some_and(|owner| owner != self.id) {
                        return Err(MessagingError::Subscribe(format!(
                            "queue {name} is exclusive to another session"
                        )));
                    }
                    name
                }
            };
            let pattern = binding.pattern.unwrap_or_else(|| queue.clone());
            if !state
                .bindings
                .iter()
                .any(|(p, q)| *p == pattern && *q == queue)
            {
                state.bindings.push((pattern, queue.clone()));
            }
            queue
        };

        match self.handlers.iter_mut().find(|(q, _)| *q == queue) {
            Some(entry) => entry.1 = handler,
            None => self.handlers.push((queue.clone(), handler)),
        }
        Ok(queue)
    }

    async fn run(&mut self) -> Result<(), MessagingError> {
        if self.handlers.is_empty() {
            return Err(MessagingError::Subscribe("consumer has no bindings".into()));
        }
        loop {
            let (queue, envelope, handler) = self.next_delivery().await?;
            let (tx, rx) = oneshot::channel();
            let delivery = Delivery {
                routing_key: envelope.routing_key.clone(),
                queue: queue.clone(),
                body: envelope.body.clone(),
                properties: envelope.properties.clone(),
                redelivered: envelope.redelivered,
            };
            self.outstanding.insert(
                queue.clone(),
                Outstanding {
                    envelope,
                    settlement: Some(rx),
                },
            );

            let ack = AckHandle::new(MemoryAcker {
                shared: Arc::clone(&self.shared),
                tx: Mutex::new(Some(tx)),
            });
            if let Err(e) = handler.handle(delivery, ack).await {
                warn!(queue = %queue, kind = e.as_label(), "handler failed: {e}");
            }
        }
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        for (queue, out) in self.outstanding.drain() {
            let settled = out.settlement.map(|mut rx| rx.try_recv());
            if matches!(
                settled,
                Some(Ok(Settlement::Ack)) | Some(Ok(Settlement::Nack { requeue: false }))
            ) || self.owned.contains(&queue)
            {
                continue;
            }
            if let Some(q) = state.queues.get_mut(&queue) {
                let mut envelope = out.envelope;
                envelope.redelivered = true;
                q.ready.push_front(envelope);
            }
        }
        for queue in self.owned.drain(..) {
            state.queues.remove(&queue);
            state.bindings.retain(|(_, q)| *q != queue);
        }
        drop(state);
        self.shared.notify.notify_waiters();
    }
}
