// hospital-messaging-core/src/bus.rs
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::{DeliveryHandler, MessageProperties, MessagingError};

/// Publishing half of a broker session.
#[async_trait]
pub trait Producer: Send + Sync {
    /// Publishes one message on the shared exchange. Fire and forget: there
    /// are no publisher confirms.
    async fn send(
        &self,
        routing_key: &str,
        body: &str,
        properties: MessageProperties,
    ) -> Result<(), MessagingError>;
}

/// Receiving half of a broker session.
///
/// Callbacks of one consumer never run concurrently, and each callback
/// settles its own delivery through the [`AckHandle`](crate::AckHandle).
/// Prefetch is 1 per queue: a queue with an unsettled delivery gets nothing
/// more until it is settled or the session ends, while the consumer's other
/// queues keep flowing.
#[async_trait]
pub trait Consumer: Send {
    /// Declares the queue, binds it and registers `handler` for it.
    /// Returns the resolved queue name.
    async fn bind(
        &mut self,
        binding: Binding,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<String, MessagingError>;

    /// Receive loop. Returns only when the session ends.
    async fn run(&mut self) -> Result<(), MessagingError>;
}

/// Opens sessions on one exchange. Each call is a fresh session and declares
/// the exchange idempotently.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn producer(&self) -> Result<Arc<dyn Producer>, MessagingError>;
    async fn consumer(&self) -> Result<Box<dyn Consumer>, MessagingError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueName {
    /// Broker-named, exclusive to the binding session, deleted with it.
    Anonymous,
    /// Shared by every session binding the same name; consumers compete.
    Named(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    /// `None` binds the queue under its own resolved name (reply queues).
    pub pattern: Option<String>,
    pub queue: QueueName,
}

impl Binding {
    /// Private anonymous queue bound to `pattern`.
    pub fn topic(pattern: impl Into<String>) -> Self {
        Self {
            pattern: Some(pattern.into()),
            queue: QueueName::Anonymous,
        }
    }

    /// Shared queue `queue` bound to `pattern`.
    pub fn shared(pattern: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            pattern: Some(pattern.into()),
            queue: QueueName::Named(queue.into()),
        }
    }

    /// Anonymous queue addressable by publishing to its own name.
    pub fn reply_queue() -> Self {
        Self {
            pattern: None,
            queue: QueueName::Anonymous,
        }
    }
}

/// Receive loop running on its own task. Aborted when dropped.
#[derive(Debug)]
pub struct ConsumerTask {
    name: String,
    handle: JoinHandle<Result<(), MessagingError>>,
}

impl ConsumerTask {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn abort(&self) {
        self.handle.abort();
    }

    /// Waits for the loop to end. An aborted loop counts as a clean stop.
    pub async fn join(mut self) -> Result<(), MessagingError> {
        match (&mut self.handle).await {
            Ok(res) => res,
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(MessagingError::Handler(format!("consumer task panicked: {e}"))),
        }
    }
}

impl Drop for ConsumerTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Starts `consumer` detached from the caller. The blocking form is simply
/// `consumer.run().await`.
pub fn spawn(name: impl Into<String>, mut consumer: Box<dyn Consumer>) -> ConsumerTask {
    let name = name.into();
    let task_name = name.clone();
    let handle = tokio::spawn(async move {
        info!(consumer = %task_name, "receive loop started");
        let res = consumer.run().await;
        match &res {
            Ok(()) => info!(consumer = %task_name, "receive loop stopped"),
            Err(e) => error!(
                consumer = %task_name,
                kind = e.as_label(),
                "receive loop failed: {e}"
            ),
        }
        res
    });
    ConsumerTask { name, handle }
}
