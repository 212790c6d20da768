use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use lapin::{
    acker::Acker,
    options::*,
    types::{FieldTable, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tracing::{error, info};

use crate::options::RabbitMqOptions;
use hospital_messaging_core::{
    AckHandle, Binding, Connector, Consumer, CorrelationId, Delivery, DeliveryHandler,
    MessageProperties, MessagingError, Producer, QueueName, Settle,
};

/// Unacked deliveries per consumer tag. Each queue sees one delivery at a
/// time; other queues of the same session are unaffected (`global: false`).
pub const PREFETCH: u16 = 1;

/// One AMQP connection and its channel. Dropping it closes the session.
struct Session {
    _conn: Connection,
    ch: Channel,
}

/// Opens sessions on the configured topic exchange.
#[derive(Clone, Debug)]
pub struct RabbitConnector {
    opts: RabbitMqOptions,
}

impl RabbitConnector {
    pub fn new(opts: RabbitMqOptions) -> Self {
        Self { opts }
    }

    pub fn options(&self) -> &RabbitMqOptions {
        &self.opts
    }

    async fn open_session(&self) -> Result<Session, MessagingError> {
        let conn = Connection::connect(&self.opts.uri, ConnectionProperties::default())
            .await
            .map_err(|e| MessagingError::Connection(e.to_string()))?;

        let ch = conn
            .create_channel()
            .await
            .map_err(|e| MessagingError::Connection(e.to_string()))?;

        // idempotent: every role declares the exchange it joins
        ch.exchange_declare(
            &self.opts.exchange,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: self.opts.durable,
                auto_delete: self.opts.auto_delete,
                internal: false,
                nowait: false,
                passive: false,
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| MessagingError::Connection(e.to_string()))?;

        info!("RabbitMQ connected. exchange={}", self.opts.exchange);
        Ok(Session { _conn: conn, ch })
    }
}

#[async_trait]
impl Connector for RabbitConnector {
    async fn producer(&self) -> Result<Arc<dyn Producer>, MessagingError> {
        let session = self.open_session().await?;
        if self.opts.confirms {
            session
                .ch
                .confirm_select(ConfirmSelectOptions { nowait: false })
                .await
                .map_err(|e| MessagingError::Connection(e.to_string()))?;
        }
        Ok(Arc::new(RabbitProducer {
            opts: self.opts.clone(),
            session,
        }))
    }

    async fn consumer(&self) -> Result<Box<dyn Consumer>, MessagingError> {
        let session = self.open_session().await?;
        session
            .ch
            .basic_qos(PREFETCH, BasicQosOptions { global: false })
            .await
            .map_err(|e| MessagingError::Connection(e.to_string()))?;
        Ok(Box::new(RabbitConsumer {
            opts: self.opts.clone(),
            session,
            handlers: Vec::new(),
        }))
    }
}

pub(crate) fn to_amqp_properties(properties: &MessageProperties) -> BasicProperties {
    let mut amqp = BasicProperties::default().with_content_type("text/plain".into());
    if let Some(reply_to) = &properties.reply_to {
        amqp = amqp.with_reply_to(ShortString::from(reply_to.clone()));
    }
    if let Some(id) = &properties.correlation_id {
        amqp = amqp.with_correlation_id(ShortString::from(id.as_str().to_string()));
    }
    amqp
}

pub(crate) fn from_amqp_properties(amqp: &BasicProperties) -> MessageProperties {
    MessageProperties {
        reply_to: amqp.reply_to().as_ref().map(|s| s.as_str().to_string()),
        correlation_id: amqp
            .correlation_id()
            .as_ref()
            .map(|s| CorrelationId::from(s.as_str())),
    }
}

pub struct RabbitProducer {
    opts: RabbitMqOptions,
    session: Session,
}

#[async_trait]
impl Producer for RabbitProducer {
    async fn send(
        &self,
        routing_key: &str,
        body: &str,
        properties: MessageProperties,
    ) -> Result<(), MessagingError> {
        let confirm = self
            .session
            .ch
            .basic_publish(
                &self.opts.exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: false,
                    immediate: false,
                },
                body.as_bytes(),
                to_amqp_properties(&properties),
            )
            .await
            .map_err(|e| MessagingError::Publish(e.to_string()))?;

        if self.opts.confirms {
            let confirmation = confirm
                .await
                .map_err(|e| MessagingError::Publish(e.to_string()))?;
            if confirmation.is_nack() {
                return Err(MessagingError::Publish(
                    "publisher confirm NACK".to_string(),
                ));
            }
        }
        Ok(())
    }
}

struct RabbitAcker {
    acker: Acker,
}

#[async_trait]
impl Settle for RabbitAcker {
    async fn ack(&self) -> Result<(), MessagingError> {
        self.acker
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|e| MessagingError::Connection(e.to_string()))
    }

    async fn nack(&self, requeue: bool) -> Result<(), MessagingError> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|e| MessagingError::Connection(e.to_string()))
    }
}

pub struct RabbitConsumer {
    opts: RabbitMqOptions,
    session: Session,
    handlers: Vec<(String, Arc<dyn DeliveryHandler>)>,
}

#[async_trait]
impl Consumer for RabbitConsumer {
    async fn bind(
        &mut self,
        binding: Binding,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<String, MessagingError> {
        let (name, options) = match &binding.queue {
            QueueName::Anonymous => (
                "",
                QueueDeclareOptions {
                    durable: false,
                    auto_delete: true,
                    exclusive: true,
                    nowait: false,
                    passive: false,
                },
            ),
            QueueName::Named(name) => (
                name.as_str(),
                QueueDeclareOptions {
                    durable: self.opts.durable,
                    auto_delete: self.opts.auto_delete,
                    exclusive: false,
                    nowait: false,
                    passive: false,
                },
            ),
        };

        let queue = self
            .session
            .ch
            .queue_declare(name, options, FieldTable::default())
            .await
            .map_err(|e| MessagingError::Subscribe(e.to_string()))?;
        let queue = queue.name().as_str().to_string();

        let pattern = binding.pattern.as_deref().unwrap_or(&queue);
        self.session
            .ch
            .queue_bind(
                &queue,
                &self.opts.exchange,
                pattern,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::Subscribe(e.to_string()))?;

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

        let mut streams = Vec::with_capacity(self.handlers.len());
        for (idx, (queue, _)) in self.handlers.iter().enumerate() {
            let consumer = self
                .session
                .ch
                .basic_consume(
                    queue,
                    &format!("consumer-{}-{idx}", self.opts.service),
                    BasicConsumeOptions {
                        no_ack: false,
                        exclusive: false,
                        nowait: false,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| MessagingError::Subscribe(e.to_string()))?;
            info!("Consuming queue={} exchange={}", queue, self.opts.exchange);
            streams.push(consumer.map(move |d| (idx, d)).boxed());
        }

        // one delivery at a time across every binding of this consumer
        let mut deliveries = stream::select_all(streams);
        while let Some((idx, delivery)) = deliveries.next().await {
            let d = match delivery {
                Ok(d) => d,
                Err(e) => {
                    error!("delivery error: {e}");
                    return Err(MessagingError::Connection(e.to_string()));
                }
            };
            let (queue, handler) = &self.handlers[idx];
            let message = Delivery::from_raw(
                d.routing_key.as_str(),
                queue.as_str(),
                &d.data,
                from_amqp_properties(&d.properties),
                d.redelivered,
            );
            let ack = AckHandle::new(RabbitAcker { acker: d.acker });
            if let Err(err) = handler.handle(message, ack).await {
                error!("handler error: {}, queue={}", err, queue);
            }
        }

        Err(MessagingError::Connection("delivery stream closed".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn properties_survive_the_amqp_mapping() {
        let props = MessageProperties::default()
            .with_reply_to("amq.gen-abc")
            .with_correlation_id(CorrelationId::from("1234"));
        let amqp = to_amqp_properties(&props);
        assert_eq!(amqp.reply_to().as_ref().map(|s| s.as_str()), Some("amq.gen-abc"));
        assert_eq!(from_amqp_properties(&amqp), props);
    }

    #[test]
    fn consumers_hold_one_unacked_delivery_per_queue() {
        assert_eq!(PREFETCH, 1);
        let opts = RabbitMqOptions::from_lookup(|key| {
            (key == "HOSPITAL_PREFETCH").then(|| "10".to_string())
        });
        assert!(opts.is_err());
    }

    #[test]
    fn absent_metadata_stays_absent() {
        let amqp = to_amqp_properties(&MessageProperties::default());
        assert!(amqp.reply_to().is_none());
        assert!(amqp.correlation_id().is_none());
        assert_eq!(from_amqp_properties(&amqp), MessageProperties::default());
    }
}
